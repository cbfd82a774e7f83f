//! Mapping between document ids and the URLs the crawler fetches.

use std::sync::Arc;

use url::Url;

use super::DocId;
use crate::config::ConfigStore;
use crate::{Error, Result};

/// Converts document ids to URLs and back.
pub trait DocIdCodec: Send + Sync {
    fn encode(&self, id: &DocId) -> Result<Url>;
    fn decode(&self, url: &Url) -> Result<DocId>;
}

/// Default codec serving ids under the document path of this service.
///
/// The base URI is `{reverseProxyProtocol}://{hostname}:{reverseProxyPort}{docIdPath}`
/// and is derived from the current configuration on every call. Each `/`
/// separated segment of the id is percent-encoded. Segments made only of dots
/// get two extra dots so that `.` and `..` survive URL normalization.
///
/// With `docId.isUrl` enabled, ids are already URLs and pass through verbatim.
pub struct PercentDocIdCodec {
    config: Arc<ConfigStore>,
}

impl PercentDocIdCodec {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }

    /// Base URI all encoded ids start with.
    pub fn base_uri(&self) -> Result<Url> {
        let config = self.config.snapshot();
        let base = format!(
            "{}://{}:{}{}",
            config.reverse_proxy_protocol()?,
            config.server_hostname()?,
            config.reverse_proxy_port()?,
            config.doc_id_path()?
        );
        Url::parse(&base).map_err(|e| Error::config(format!("Invalid base URI '{base}': {e}")))
    }

    fn ids_are_urls(&self) -> Result<bool> {
        self.config.snapshot().doc_id_is_url()
    }
}

impl DocIdCodec for PercentDocIdCodec {
    fn encode(&self, id: &DocId) -> Result<Url> {
        if self.ids_are_urls()? {
            return Url::parse(id.as_str())
                .map_err(|e| Error::InvalidDocId(format!("{id}: {e}")));
        }

        let encoded: Vec<String> = id.as_str().split('/').map(encode_segment).collect();
        let base = self.base_uri()?;
        Url::parse(&format!("{}{}", base, encoded.join("/")))
            .map_err(|e| Error::InvalidDocId(format!("{id}: {e}")))
    }

    fn decode(&self, url: &Url) -> Result<DocId> {
        if self.ids_are_urls()? {
            return Ok(DocId::new(url.as_str()));
        }

        let prefix = self.config.snapshot().doc_id_path()?;
        let path = url
            .path()
            .strip_prefix(prefix.as_str())
            .ok_or_else(|| Error::InvalidDocId(format!("{url} is not under {prefix}")))?;

        let segments = path
            .split('/')
            .map(decode_segment)
            .collect::<Result<Vec<_>>>()?;
        Ok(DocId::new(segments.join("/")))
    }
}

fn is_dot_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b == b'.')
}

fn encode_segment(segment: &str) -> String {
    if is_dot_segment(segment) {
        format!("{segment}..")
    } else {
        urlencoding::encode(segment).into_owned()
    }
}

fn decode_segment(segment: &str) -> Result<String> {
    if is_dot_segment(segment) {
        return segment
            .strip_suffix("..")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidDocId(format!("unexpected dot segment '{segment}'")));
    }
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .map_err(|e| Error::InvalidDocId(format!("{segment}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys::{DOC_ID_IS_URL, GSA_HOSTNAME, SERVER_HOSTNAME, SERVER_PORT};

    fn codec(extra: &str) -> PercentDocIdCodec {
        let store = Arc::new(ConfigStore::new());
        store
            .load_str(&format!(
                "{GSA_HOSTNAME}=gsa\n{SERVER_HOSTNAME}=bridge.example.com\n{SERVER_PORT}=5678\n{extra}"
            ))
            .unwrap();
        PercentDocIdCodec::new(store)
    }

    #[test]
    fn test_base_uri() {
        assert_eq!(
            codec("").base_uri().unwrap().as_str(),
            "http://bridge.example.com:5678/doc/"
        );
    }

    #[test]
    fn test_encode_escapes_segments() {
        let url = codec("").encode(&DocId::new("reports/q1 2024?.pdf")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://bridge.example.com:5678/doc/reports/q1%202024%3F.pdf"
        );
    }

    #[test]
    fn test_dot_segments_survive() {
        let codec = codec("");
        let id = DocId::new("a/../b/./c");
        let url = codec.encode(&id).unwrap();
        assert!(url.path().contains("/..../"));
        assert_eq!(codec.decode(&url).unwrap(), id);
    }

    #[test]
    fn test_decode_rejects_foreign_path() {
        let url = Url::parse("http://bridge.example.com:5678/other/x").unwrap();
        assert!(matches!(
            codec("").decode(&url),
            Err(Error::InvalidDocId(_))
        ));
    }

    #[test]
    fn test_ids_as_urls_pass_through() {
        let codec = codec(&format!("{DOC_ID_IS_URL}=true\n"));
        let id = DocId::new("https://intranet.example.com/page?id=7");
        let url = codec.encode(&id).unwrap();
        assert_eq!(url.as_str(), id.as_str());
        assert_eq!(codec.decode(&url).unwrap(), id);

        assert!(codec.encode(&DocId::new("not a url")).is_err());
    }
}

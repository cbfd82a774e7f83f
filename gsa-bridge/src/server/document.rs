//! Document retrieval endpoint used by the crawler.

use std::sync::Arc;

use axum::{
    Extension, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use url::Url;

use super::admission::{AbortSignal, AdmissionPool, admission_middleware};
use super::error::ApiError;
use crate::config::ConfigStore;
use crate::connector::{Connector, DocContent, DocRequest};
use crate::push::{DocId, DocIdCodec, Journal, RequestOutcome};
use crate::transform::TransformPipeline;
use crate::{Error, Result};

/// Header carrying document metadata to the crawler.
pub const METADATA_HEADER: &str = "x-gsa-external-metadata";

/// Shared state of the document handler.
#[derive(Clone)]
pub struct DocumentState {
    pub config: Arc<ConfigStore>,
    pub connector: Arc<dyn Connector>,
    pub codec: Arc<dyn DocIdCodec>,
    pub journal: Arc<Journal>,
    pub transform: Option<Arc<TransformPipeline>>,
}

/// Router serving `GET {doc_id_path}{*id}` behind the admission pool.
pub fn document_router(
    state: DocumentState,
    pool: Arc<AdmissionPool>,
    doc_id_path: &str,
    use_compression: bool,
) -> Router {
    let router = Router::new()
        .route(&format!("{doc_id_path}{{*id}}"), get(serve_document))
        .with_state(state)
        .layer(middleware::from_fn_with_state(pool, admission_middleware));

    let router = if use_compression {
        router.layer(CompressionLayer::new())
    } else {
        router
    };
    router.layer(TraceLayer::new_for_http())
}

async fn serve_document(
    State(state): State<DocumentState>,
    signal: Option<Extension<AbortSignal>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let (outcome, response) = match handle(&state, signal.map(|s| s.0), &headers, &uri).await {
        Ok((outcome, response)) => (outcome, response),
        Err((outcome, error)) => (outcome, error.into_response()),
    };
    state.journal.record_request(outcome);
    response
}

type Failure = (RequestOutcome, ApiError);

async fn handle(
    state: &DocumentState,
    signal: Option<AbortSignal>,
    headers: &HeaderMap,
    uri: &Uri,
) -> std::result::Result<(RequestOutcome, Response), Failure> {
    if signal.as_ref().is_some_and(AbortSignal::is_raised) {
        return Err((
            RequestOutcome::Rejected,
            ApiError::service_unavailable("Too many concurrent requests"),
        ));
    }

    let doc_id = decode_request(state, uri).map_err(|e| {
        debug!(uri = %uri, error = %e, "Request does not name a document");
        (RequestOutcome::NotFound, ApiError::not_found("Unknown document"))
    })?;

    let mut request = DocRequest::new(doc_id.clone());
    request.if_modified_since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date);

    let timeout = state
        .config
        .snapshot()
        .doc_content_timeout()
        .map_err(|e| (RequestOutcome::Failed, ApiError::from(e)))?;

    let content = match tokio::time::timeout(timeout, state.connector.get_doc_content(&request)).await
    {
        Err(_) => {
            warn!(doc_id = %doc_id, timeout_secs = timeout.as_secs(), "Document retrieval timed out");
            return Err((
                RequestOutcome::TimedOut,
                ApiError::gateway_timeout("Timed out retrieving document"),
            ));
        }
        Ok(Err(e)) => {
            warn!(doc_id = %doc_id, error = %e, "Document retrieval failed");
            return Err((RequestOutcome::Failed, ApiError::from(e)));
        }
        Ok(Ok(None)) => {
            return Err((
                RequestOutcome::NotFound,
                ApiError::not_found(format!("Unknown document: {doc_id}")),
            ));
        }
        Ok(Ok(Some(content))) => content,
    };

    if let (Some(since), Some(modified)) = (request.if_modified_since, content.last_modified)
        && modified.timestamp() <= since.timestamp()
    {
        return Ok((
            RequestOutcome::Served,
            StatusCode::NOT_MODIFIED.into_response(),
        ));
    }

    let mut content = content;
    if let Some(pipeline) = &state.transform {
        pipeline
            .apply(&mut content)
            .map_err(|e| (RequestOutcome::Failed, ApiError::from(e)))?;
    }

    let response = document_response(content)
        .map_err(|e| (RequestOutcome::Failed, ApiError::from(e)))?;
    Ok((RequestOutcome::Served, response))
}

fn decode_request(state: &DocumentState, uri: &Uri) -> Result<DocId> {
    let config = state.config.snapshot();
    let url = format!(
        "{}://{}:{}{}",
        config.reverse_proxy_protocol()?,
        config.server_hostname()?,
        config.reverse_proxy_port()?,
        uri.path()
    );
    let url = Url::parse(&url).map_err(|e| Error::InvalidDocId(e.to_string()))?;
    state.codec.decode(&url)
}

fn document_response(content: DocContent) -> Result<Response> {
    let mut builder = Response::builder().status(StatusCode::OK).header(
        header::CONTENT_TYPE,
        content
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream"),
    );

    if let Some(modified) = content.last_modified {
        builder = builder.header(header::LAST_MODIFIED, format_http_date(&modified));
    }

    if !content.metadata.is_empty() {
        let value = HeaderValue::from_str(&format_metadata(&content))
            .map_err(|e| Error::Other(format!("Invalid metadata header: {e}")))?;
        builder = builder.header(METADATA_HEADER, value);
    }

    builder
        .body(Body::from(content.content))
        .map_err(|e| Error::Other(format!("Failed to build response: {e}")))
}

/// `key=value` pairs, each side percent-encoded, joined by commas.
fn format_metadata(content: &DocContent) -> String {
    content
        .metadata
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

fn format_http_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys::{ADAPTOR_DOC_CONTENT_TIMEOUT_SECS, GSA_HOSTNAME, SERVER_HOSTNAME};
    use crate::connector::ConnectorContext;
    use crate::push::{DocIdPusher, PercentDocIdCodec};
    use crate::transform::TransformRegistry;
    use async_trait::async_trait;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Library;

    #[async_trait]
    impl Connector for Library {
        async fn init(&self, _context: Arc<dyn ConnectorContext>) -> Result<()> {
            Ok(())
        }

        async fn destroy(&self) {}

        async fn get_doc_ids(&self, _pusher: &dyn DocIdPusher) -> Result<()> {
            Ok(())
        }

        async fn get_doc_content(&self, request: &DocRequest) -> Result<Option<DocContent>> {
            match request.doc_id.as_str() {
                "books/moby dick.txt" => Ok(Some(
                    DocContent::new("Call me Ishmael.")
                        .with_content_type("text/plain")
                        .with_metadata("author", "Herman Melville")
                        .with_metadata("year", "1851"),
                )),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(None)
                }
                "broken" => Err(Error::connector("disk on fire")),
                _ => Ok(None),
            }
        }
    }

    fn state(extra: &str) -> DocumentState {
        let config = Arc::new(ConfigStore::new());
        config
            .load_str(&format!(
                "{GSA_HOSTNAME}=gsa\n{SERVER_HOSTNAME}=bridge\n{extra}"
            ))
            .unwrap();
        let transform = TransformPipeline::from_config(
            &config.snapshot(),
            &TransformRegistry::with_builtins(),
        )
        .unwrap()
        .map(Arc::new);
        DocumentState {
            codec: Arc::new(PercentDocIdCodec::new(config.clone())),
            config,
            connector: Arc::new(Library),
            journal: Arc::new(Journal::new()),
            transform,
        }
    }

    fn router(state: DocumentState) -> Router {
        document_router(state, Arc::new(AdmissionPool::new(4, 4)), "/doc/", false)
    }

    async fn get(router: Router, path: &str) -> Response {
        router
            .oneshot(
                axum::http::Request::builder()
                    .uri(path)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_serves_document_with_metadata() {
        let state = state("");
        let journal = state.journal.clone();
        let response = get(router(state), "/doc/books/moby%20dick.txt").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(
            response.headers()[METADATA_HEADER],
            "author=Herman%20Melville,year=1851"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"Call me Ishmael.");
        assert_eq!(journal.snapshot().requests_served, 1);
    }

    #[tokio::test]
    async fn test_unknown_document_is_404() {
        let state = state("");
        let journal = state.journal.clone();
        let response = get(router(state), "/doc/missing").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(journal.snapshot().requests_not_found, 1);
    }

    #[tokio::test]
    async fn test_connector_error_is_500() {
        let response = get(router(state("")), "/doc/broken").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_document_is_504() {
        let state = state(&format!("{ADAPTOR_DOC_CONTENT_TIMEOUT_SECS}=1\n"));
        let journal = state.journal.clone();
        let response = get(router(state), "/doc/slow").await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(journal.snapshot().requests_timed_out, 1);
    }

    #[tokio::test]
    async fn test_raised_signal_is_503() {
        let state = state("");
        let journal = state.journal.clone();
        let signal = AbortSignal::new();
        signal.raise();

        let response = handle(
            &state,
            Some(signal),
            &HeaderMap::new(),
            &Uri::from_static("/doc/books/moby%20dick.txt"),
        )
        .await
        .unwrap_err();
        assert_eq!(response.0, RequestOutcome::Rejected);
        assert_eq!(response.1.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(journal.snapshot().requests_served, 0);
    }

    #[tokio::test]
    async fn test_transform_applies() {
        let state = state(
            "transform.pipeline=mask\n\
             transform.pipeline.mask.stage=regex-replace\n\
             transform.pipeline.mask.pattern=Ishmael\n\
             transform.pipeline.mask.replacement=Anon\n",
        );
        let response = get(router(state), "/doc/books/moby%20dick.txt").await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"Call me Anon.");
    }

    #[test]
    fn test_http_dates() {
        let date = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(format_http_date(&date), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}

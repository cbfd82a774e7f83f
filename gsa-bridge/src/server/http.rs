//! Listener lifecycle shared by the document and dashboard servers.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{Error, Result};

/// Bind a listener on all interfaces. Port 0 picks a free port.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).await.map_err(|source| Error::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// A running axum server.
pub struct HttpServer {
    name: &'static str,
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl HttpServer {
    /// Serve `router` on an already bound listener.
    pub fn serve(name: &'static str, listener: TcpListener, router: Router) -> Result<Self> {
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(server = name, error = %e, "Server error");
            }
        });

        info!(server = name, "Listening on http://{}", addr);
        Ok(Self {
            name,
            addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and give in-flight requests up to
    /// `max_delay` to finish before they are dropped.
    pub async fn stop(self, max_delay: Duration) {
        self.shutdown.cancel();
        let mut task = self.task;
        match tokio::time::timeout(max_delay, &mut task).await {
            Ok(_) => info!(server = self.name, "Server stopped"),
            Err(_) => {
                warn!(
                    server = self.name,
                    max_delay_secs = max_delay.as_secs_f64(),
                    "In-flight requests did not finish in time, dropping them"
                );
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn fetch(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", addr.port()))
            .await
            .unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serve_and_stop() {
        let listener = bind(0).await.unwrap();
        let router = Router::new().route("/ping", get(|| async { "pong" }));
        let server = HttpServer::serve("test", listener, router).unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let response = fetch(addr, "/ping").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("pong"));

        server.stop(Duration::from_secs(1)).await;
        assert!(
            tokio::net::TcpStream::connect(("127.0.0.1", addr.port()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = bind(0).await.unwrap();
        let port = first.local_addr().unwrap().port();
        assert!(matches!(bind(port).await, Err(Error::Bind { .. })));
    }
}

//! HTTP server for the admission service.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::router;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::ratelimit::AdmissionEngine;

/// HTTP server exposing an [`AdmissionEngine`].
pub struct HttpServer {
    config: ServerConfig,
    engine: AdmissionEngine,
}

impl HttpServer {
    pub fn new(config: ServerConfig, engine: AdmissionEngine) -> Self {
        Self { config, engine }
    }

    /// Address the server binds to.
    pub fn addr(&self) -> SocketAddr {
        self.config.listen_addr
    }

    /// Start the server.
    ///
    /// This method will block until the server fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests are done.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!(addr = %addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(
            addr = %addr,
            trust_forwarded_headers = self.config.trust_forwarded_headers,
            backend = %self.engine.registry().backend_kind(),
            "Starting admission service"
        );

        let app = router(self.engine, &self.config).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ratelimit::{Policy, PolicyRegistry};
    use crate::store::CounterStore;

    #[tokio::test]
    async fn test_shuts_down_on_signal() {
        let registry = PolicyRegistry::new(Arc::new(CounterStore::local()));
        registry.register(Policy::public("rate_limit")).unwrap();
        let engine = AdmissionEngine::new(Arc::new(registry));

        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        let server = HttpServer::new(config, engine);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            server.serve_with_shutdown(async {}),
        )
        .await;

        assert!(matches!(result, Ok(Ok(()))));
    }
}

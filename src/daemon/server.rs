use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::{
    handler::{HookHandler, HookServices},
    metrics::MetricsSink,
};
use crate::errors::Result;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Builds the handler for a freshly accepted connection.
pub trait HandlerFactory: Send + Sync + 'static {
    fn create(&self, stream: TcpStream) -> HookHandler<TcpStream>;
}

impl<F> HandlerFactory for F
where
    F: Fn(TcpStream) -> HookHandler<TcpStream> + Send + Sync + 'static,
{
    fn create(&self, stream: TcpStream) -> HookHandler<TcpStream> {
        self(stream)
    }
}

/// Hands every connection the same shared services.
pub struct DefaultHandlerFactory {
    services: Arc<HookServices>,
}

impl DefaultHandlerFactory {
    pub fn new(services: Arc<HookServices>) -> Self {
        Self { services }
    }
}

impl HandlerFactory for DefaultHandlerFactory {
    fn create(&self, stream: TcpStream) -> HookHandler<TcpStream> {
        HookHandler::new(stream, Arc::clone(&self.services))
    }
}

struct Running {
    port: u16,
    shutdown: oneshot::Sender<()>,
    accept_loop: JoinHandle<()>,
}

/// Loopback TCP server for hook subprocesses. Each connection runs on its own
/// task and carries exactly one request.
pub struct HookServer {
    factory: Arc<dyn HandlerFactory>,
    metrics: Arc<dyn MetricsSink>,
    running: Option<Running>,
}

impl HookServer {
    pub fn new(factory: Arc<dyn HandlerFactory>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            factory,
            metrics,
            running: None,
        }
    }

    /// Binds an ephemeral loopback port and starts accepting. Returns the port
    /// to hand to hook subprocesses.
    pub async fn start(&mut self) -> Result<u16> {
        if let Some(running) = &self.running {
            return Ok(running.port);
        }

        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
        let port = listener.local_addr()?.port();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.factory),
            Arc::clone(&self.metrics),
            shutdown_rx,
        ));

        info!(port, "hook server listening");
        self.running = Some(Running {
            port,
            shutdown,
            accept_loop,
        });
        Ok(port)
    }

    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|running| running.port)
    }

    /// Stops accepting and waits until the listening port is released.
    /// Connections already accepted finish on their own.
    pub async fn close(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(());
        if let Err(err) = running.accept_loop.await {
            warn!(error = %err, "hook accept loop ended abnormally");
        }
        info!(port = running.port, "hook server closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    factory: Arc<dyn HandlerFactory>,
    metrics: Arc<dyn MetricsSink>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("hook accept loop received shutdown");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "failed to accept hook connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let handler = factory.create(stream);
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    let started = Instant::now();
                    metrics.connection_opened();
                    let outcome = match handler.run().await {
                        Ok(outcome) => outcome.as_str(),
                        Err(err) => {
                            error!(error = %err, %peer, "failed to handle hook client");
                            err.stage.as_str()
                        }
                    };
                    metrics.connection_closed(outcome, started.elapsed());
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::{
        daemon::{
            environment::HookEnvironment,
            metrics::{NoopMetrics, PrometheusMetrics},
        },
        hooks::{HookContext, HookError, HookRegistry},
        models::{HookRequest, HookResponse, HookType},
        protocol::{self, JsonFrameCodec},
        security::{HexSecretCodec, SecretCodec, SharedSecretAuthenticator},
    };

    fn services(environment: &Arc<HookEnvironment>) -> Arc<HookServices> {
        let mut registry = HookRegistry::new();
        registry
            .register(
                "accepting",
                HookType::PreMutation,
                |ctx: &HookContext| -> std::result::Result<(), HookError> {
                    std::thread::sleep(Duration::from_millis(50));
                    ctx.messages().send_message(format!("accepted {}", ctx.repository_id()));
                    Ok(())
                },
            )
            .register(
                "rejecting",
                HookType::PreMutation,
                |ctx: &HookContext| -> std::result::Result<(), HookError> {
                    ctx.messages().send_message(format!("checked {}", ctx.repository_id()));
                    Err(HookError::domain("7", "protected branch"))
                },
            );
        Arc::new(HookServices::new(
            Arc::clone(environment),
            Arc::new(registry),
            Arc::new(SharedSecretAuthenticator::new(SecretString::from(
                "secret".to_string(),
            ))),
        ))
    }

    fn request(environment: &HookEnvironment, repository_id: &str) -> HookRequest {
        HookRequest {
            encoded_secret: HexSecretCodec.encode(&SecretString::from("secret".to_string())),
            hook_type: HookType::PreMutation,
            transaction_id: format!("tx-{repository_id}"),
            repository_id: repository_id.to_string(),
            challenge: environment.challenge().to_string(),
            actor: "abc".to_string(),
        }
    }

    async fn call(port: u16, request: HookRequest) -> HookResponse {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let mut framed = Framed::new(stream, JsonFrameCodec::<HookResponse>::default());
        protocol::send(&mut framed, &request).await.unwrap();
        protocol::receive(&mut framed).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_connections_get_their_own_response() {
        let environment = Arc::new(HookEnvironment::new());
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let mut server = HookServer::new(
            Arc::new(DefaultHandlerFactory::new(services(&environment))),
            metrics.clone(),
        );
        let port = server.start().await.unwrap();
        assert_ne!(port, 0);

        let (accepted, rejected) = tokio::join!(
            call(port, request(&environment, "accepting")),
            call(port, request(&environment, "rejecting")),
        );

        assert!(!accepted.abort);
        assert_eq!(accepted.messages.len(), 1);
        assert_eq!(accepted.messages[0].text, "accepted accepting");

        assert!(rejected.abort);
        assert_eq!(rejected.messages.len(), 2);
        assert_eq!(rejected.messages[0].text, "checked rejecting");
        assert!(rejected.messages[1].text.contains("protected branch"));

        server.close().await;
        assert!(!environment.is_pending());

        // Metrics are recorded after the response is written.
        for _ in 0..50 {
            if metrics.connections("success") + metrics.connections("domain") == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.connections("success"), 1);
        assert_eq!(metrics.connections("domain"), 1);
    }

    #[tokio::test]
    async fn unreadable_request_is_counted_as_framing() {
        let environment = Arc::new(HookEnvironment::new());
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let mut server = HookServer::new(
            Arc::new(DefaultHandlerFactory::new(services(&environment))),
            metrics.clone(),
        );
        let port = server.start().await.unwrap();

        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        drop(stream);

        for _ in 0..50 {
            if metrics.connections("framing") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.connections("framing"), 1);
        assert_eq!(metrics.connections("respond"), 0);
        assert_eq!(metrics.active(), 0);
        server.close().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_and_close_releases_the_port() {
        let environment = Arc::new(HookEnvironment::new());
        let mut server = HookServer::new(
            Arc::new(DefaultHandlerFactory::new(services(&environment))),
            Arc::new(NoopMetrics),
        );
        let port = server.start().await.unwrap();
        assert_eq!(server.start().await.unwrap(), port);
        assert_eq!(server.port(), Some(port));

        server.close().await;
        server.close().await;
        assert_eq!(server.port(), None);
        assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());
    }

    #[tokio::test]
    async fn closure_factories_are_accepted() {
        let environment = Arc::new(HookEnvironment::new());
        let shared = services(&environment);
        let factory = move |stream: TcpStream| HookHandler::new(stream, Arc::clone(&shared));
        let mut server = HookServer::new(
            Arc::new(factory),
            Arc::new(NoopMetrics),
        );
        let port = server.start().await.unwrap();

        let mut stale = request(&environment, "accepting");
        stale.challenge = HookEnvironment::new().challenge().to_string();
        let response = call(port, stale).await;
        assert!(response.abort);
        assert!(response.messages[0].text.contains("challenge"));

        server.close().await;
    }
}

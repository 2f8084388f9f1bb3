use std::{net::Ipv4Addr, time::Duration};

use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::{
    errors::{AppError, Result},
    models::{HookRequest, HookResponse},
    protocol::{self, JsonFrameCodec},
};

/// Sends one request to the hook server on `port` and waits for its answer.
/// `timeout` bounds the whole exchange, listener dispatch included.
pub async fn call(
    port: u16,
    request: &HookRequest,
    max_frame_size: usize,
    timeout: Option<Duration>,
) -> Result<HookResponse> {
    let exchange = async {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|_| AppError::ServerUnavailable)?;
        let mut framed = Framed::new(stream, JsonFrameCodec::<HookResponse>::new(max_frame_size));
        protocol::send(&mut framed, request).await?;
        let response = protocol::receive(&mut framed).await?;
        debug!(
            abort = response.abort,
            messages = response.messages.len(),
            "hook response received"
        );
        Ok::<_, AppError>(response)
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| AppError::FrameTimeout)?,
        None => exchange.await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use secrecy::SecretString;

    use super::*;
    use crate::{
        daemon::{
            environment::HookEnvironment,
            handler::{HandlerSettings, HookServices},
            metrics::NoopMetrics,
            server::{DefaultHandlerFactory, HookServer},
        },
        hooks::{HookContext, HookError, HookRegistry},
        models::HookType,
        protocol::{FrameError, MAX_FRAME_SIZE},
        security::{HexSecretCodec, SecretCodec, SharedSecretAuthenticator},
    };

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

    async fn start(registry: HookRegistry, settings: HandlerSettings) -> (HookServer, u16, HookRequest) {
        let environment = Arc::new(HookEnvironment::new());
        let services = HookServices::new(
            Arc::clone(&environment),
            Arc::new(registry),
            Arc::new(SharedSecretAuthenticator::new(SecretString::from(
                "secret".to_string(),
            ))),
        )
        .with_settings(settings);
        let mut server = HookServer::new(
            Arc::new(DefaultHandlerFactory::new(Arc::new(services))),
            Arc::new(NoopMetrics),
        );
        let port = server.start().await.unwrap();

        let request = HookRequest {
            encoded_secret: HexSecretCodec.encode(&SecretString::from("secret".to_string())),
            hook_type: HookType::PostMutation,
            transaction_id: "ti21".to_string(),
            repository_id: "42".to_string(),
            challenge: environment.challenge().to_string(),
            actor: "abc".to_string(),
        };
        (server, port, request)
    }

    #[tokio::test]
    async fn round_trip_against_server() {
        let mut registry = HookRegistry::new();
        registry.add_repository("42");
        let (mut server, port, request) = start(registry, HandlerSettings::default()).await;

        let response = call(port, &request, MAX_FRAME_SIZE, TIMEOUT).await.unwrap();
        assert!(!response.abort);
        assert!(response.messages.is_empty());

        server.close().await;
        let err = call(port, &request, MAX_FRAME_SIZE, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServerUnavailable));
    }

    #[tokio::test]
    async fn raised_frame_limit_must_be_shared_with_the_client() {
        let mut registry = HookRegistry::new();
        registry.register(
            "42",
            HookType::PostMutation,
            |ctx: &HookContext| -> std::result::Result<(), HookError> {
                for index in 0..150 {
                    ctx.messages().send_message(format!("note {index}: {}", "x".repeat(40)));
                }
                Ok(())
            },
        );
        let settings = HandlerSettings {
            max_frame_size: 16 * 1024,
            ..HandlerSettings::default()
        };
        let (mut server, port, request) = start(registry, settings).await;

        let response = call(port, &request, 16 * 1024, TIMEOUT).await.unwrap();
        assert!(!response.abort);
        assert_eq!(response.messages.len(), 150);

        let err = call(port, &request, MAX_FRAME_SIZE, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Frame(FrameError::TooLarge { .. })));

        server.close().await;
    }
}

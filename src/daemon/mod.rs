pub mod environment;
pub mod handler;
pub mod metrics;
pub mod server;

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{info, warn};

use crate::{
    config::Config,
    errors::{AppError, Result},
    hooks::{HookRegistry, registry::TracingListener},
    models::HookType,
    security::{HexSecretCodec, SecretCodec, SharedSecretAuthenticator},
};
use environment::HookEnvironment;
use handler::{HandlerSettings, HookServices};
use metrics::PrometheusMetrics;
use server::{DefaultHandlerFactory, HookServer};

/// Connection details a hook subprocess needs, in `KEY=value` form.
pub fn hook_exports(
    port: u16,
    challenge: &str,
    encoded_secret: &str,
    max_frame_size: usize,
) -> Vec<(&'static str, String)> {
    vec![
        ("HOOKGATE_PORT", port.to_string()),
        ("HOOKGATE_CHALLENGE", challenge.to_string()),
        ("HOOKGATE_SECRET", encoded_secret.to_string()),
        ("HOOKGATE_MAX_FRAME_SIZE", max_frame_size.to_string()),
    ]
}

/// Runs the hook server in the foreground until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    let secret = SecretString::from(config.secret()?.to_string());
    let codec = Arc::new(HexSecretCodec);
    let encoded_secret = codec.encode(&secret);

    let mut registry = HookRegistry::new();
    for repository_id in &config.repositories {
        registry
            .register(repository_id.as_str(), HookType::PreMutation, TracingListener)
            .register(repository_id.as_str(), HookType::PostMutation, TracingListener);
    }
    if config.repositories.is_empty() {
        warn!("no repositories configured; every hook will be answered with not found");
    }

    let environment = Arc::new(HookEnvironment::new());
    let services = HookServices::new(
        Arc::clone(&environment),
        Arc::new(registry),
        Arc::new(SharedSecretAuthenticator::new(secret)),
    )
    .with_codec(codec)
    .with_settings(HandlerSettings::from_config(&config));

    let metrics = Arc::new(PrometheusMetrics::new()?);
    let mut server = HookServer::new(
        Arc::new(DefaultHandlerFactory::new(Arc::new(services))),
        metrics.clone(),
    );
    let port = server.start().await?;

    for (key, value) in hook_exports(
        port,
        environment.challenge(),
        &encoded_secret,
        config.max_frame_size,
    ) {
        println!("export {key}={value}");
    }
    info!(port, repositories = config.repositories.len(), "hook server ready");

    tokio::signal::ctrl_c().await?;
    info!("hook server received shutdown signal");
    server.close().await;

    if let Some(path) = &config.metrics_file {
        tokio::fs::write(path, metrics.encode_text())
            .await
            .map_err(|_| AppError::WriteFile(path.clone()))?;
        info!(path = %path, "metrics written");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::hook_exports;

    #[test]
    fn exports_name_every_connection_detail() {
        let exports = hook_exports(4711, "c0ffee", "736563726574", 16384);
        let keys: Vec<&str> = exports.iter().map(|(key, _)| *key).collect();
        assert_eq!(
            keys,
            [
                "HOOKGATE_PORT",
                "HOOKGATE_CHALLENGE",
                "HOOKGATE_SECRET",
                "HOOKGATE_MAX_FRAME_SIZE"
            ]
        );
        assert_eq!(exports[0].1, "4711");
        assert_eq!(exports[3].1, "16384");
    }
}

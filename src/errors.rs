use miette::Diagnostic;
use thiserror::Error;

use crate::{models::hook::UnknownHookType, protocol::FrameError};

#[derive(Debug, Error, Diagnostic)]
pub enum AppError {
    #[error("could not resolve user home/config directory")]
    #[diagnostic(
        code(hookgate::config::paths),
        help("Set HOME, then retry `hookgate serve`.")
    )]
    HomeDirUnavailable,

    #[error("failed to load config")]
    #[diagnostic(
        code(hookgate::config::load),
        help("Fix the config file syntax or the HOOKGATE_* environment variables.")
    )]
    ConfigLoad,

    #[error("no shared secret configured")]
    #[diagnostic(
        code(hookgate::config::not_configured),
        help("Set `shared_secret` in the config file or export HOOKGATE_SHARED_SECRET.")
    )]
    NotConfigured,

    #[error("missing hook environment variable {0}")]
    #[diagnostic(
        code(hookgate::hook::env),
        help("The hook must be spawned with the exports printed by `hookgate serve`.")
    )]
    HookEnvMissing(&'static str),

    #[error("invalid hook environment variable {name}: {reason}")]
    #[diagnostic(code(hookgate::hook::env_invalid))]
    HookEnvInvalid { name: &'static str, reason: String },

    #[error(transparent)]
    #[diagnostic(
        code(hookgate::hook::hook_type),
        help("Use `pre` or `post`, or the engine's hook name such as `pre-receive`.")
    )]
    HookType(#[from] UnknownHookType),

    #[error("hook server unavailable")]
    #[diagnostic(
        code(hookgate::hook::server_unavailable),
        help("Check that `hookgate serve` is running and HOOKGATE_PORT matches its port.")
    )]
    ServerUnavailable,

    #[error("timed out waiting for a hook frame")]
    #[diagnostic(code(hookgate::protocol::timeout))]
    FrameTimeout,

    #[error("hook frame error: {0}")]
    #[diagnostic(code(hookgate::protocol::frame))]
    Frame(#[from] FrameError),

    #[error("failed to register metrics: {0}")]
    #[diagnostic(code(hookgate::metrics::register))]
    Metrics(#[from] prometheus::Error),

    #[error("failed to write file: {0}")]
    #[diagnostic(code(hookgate::fs::write))]
    WriteFile(String),

    #[error("failed to serialize config")]
    #[diagnostic(code(hookgate::config::serialize))]
    ConfigSerialize,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

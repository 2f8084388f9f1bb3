use std::{env, time::Duration};

use tracing::info;
use ulid::Ulid;

use super::HookArgs;
use crate::{
    client,
    errors::{AppError, Result},
    models::{HookRequest, HookResponse, HookType},
    protocol::MAX_FRAME_SIZE,
};

const PORT: &str = "HOOKGATE_PORT";
const CHALLENGE: &str = "HOOKGATE_CHALLENGE";
const SECRET: &str = "HOOKGATE_SECRET";
const REPOSITORY_ID: &str = "HOOKGATE_REPOSITORY_ID";
const TRANSACTION_ID: &str = "HOOKGATE_TRANSACTION_ID";
const ACTOR: &str = "HOOKGATE_ACTOR";
const MAX_FRAME: &str = "HOOKGATE_MAX_FRAME_SIZE";

const EXIT_ABORT: i32 = 1;
const EXIT_UNAVAILABLE: i32 = 2;

pub async fn execute(args: HookArgs) -> Result<()> {
    let hook_type: HookType = args.hook_type.parse()?;
    let (endpoint, request) = request_from(hook_type, |name| env::var(name).ok())?;
    let timeout = (args.timeout_seconds > 0).then(|| Duration::from_secs(args.timeout_seconds));

    // Fail closed.
    let exchange = client::call(endpoint.port, &request, endpoint.max_frame_size, timeout);
    let response = match exchange.await {
        Ok(response) => response,
        Err(err) => {
            eprintln!("hookgate: {err}; rejected for safety");
            std::process::exit(EXIT_UNAVAILABLE);
        }
    };

    for message in &response.messages {
        eprintln!("{message}");
    }
    info!(
        hook_type = %request.hook_type,
        transaction_id = %request.transaction_id,
        abort = response.abort,
        "hook answered"
    );

    let code = exit_code(&response);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Endpoint {
    port: u16,
    max_frame_size: usize,
}

fn request_from(
    hook_type: HookType,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(Endpoint, HookRequest)> {
    let require = |name: &'static str| {
        lookup(name)
            .filter(|value| !value.trim().is_empty())
            .ok_or(AppError::HookEnvMissing(name))
    };

    let port = require(PORT)?
        .trim()
        .parse::<u16>()
        .map_err(|err| AppError::HookEnvInvalid {
            name: PORT,
            reason: err.to_string(),
        })?;
    let max_frame_size = match lookup(MAX_FRAME).filter(|value| !value.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|err| AppError::HookEnvInvalid {
                name: MAX_FRAME,
                reason: err.to_string(),
            })?,
        None => MAX_FRAME_SIZE,
    };

    let request = HookRequest {
        encoded_secret: require(SECRET)?,
        hook_type,
        transaction_id: lookup(TRANSACTION_ID)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| Ulid::new().to_string()),
        repository_id: require(REPOSITORY_ID)?,
        challenge: require(CHALLENGE)?,
        actor: require(ACTOR)?,
    };
    Ok((
        Endpoint {
            port,
            max_frame_size,
        },
        request,
    ))
}

fn exit_code(response: &HookResponse) -> i32 {
    if response.abort { EXIT_ABORT } else { 0 }
}

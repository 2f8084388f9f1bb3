use std::{any::Any, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use super::environment::HookEnvironment;
use crate::{
    config::Config,
    errors::{AppError, Result},
    hooks::{HookContext, HookError, HookEventFacade, MessageSink, transaction::TransactionScope},
    models::{HookMessage, HookRequest, HookResponse, HookType},
    protocol::{self, JsonFrameCodec, MAX_FRAME_SIZE},
    security::{
        AuthError, AuthenticationToken, Authenticator, HexSecretCodec, Principal, SecretCodec,
    },
};

pub const CHALLENGE_MISMATCH: &str = "hook challenge mismatch";
pub const AUTHENTICATION_FAILED: &str = "hook authentication failed";
pub const UNKNOWN_ERROR: &str = "unknown error";

/// A dispatch that exceeds `dispatch_timeout` keeps running on the blocking
/// pool, but its pending state is released when the handler gives up on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerSettings {
    pub read_timeout: Option<Duration>,
    pub dispatch_timeout: Option<Duration>,
    pub max_frame_size: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::from_secs(30)),
            dispatch_timeout: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl HandlerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            dispatch_timeout: config.dispatch_timeout(),
            max_frame_size: config.max_frame_size,
        }
    }
}

pub struct HookServices {
    environment: Arc<HookEnvironment>,
    facade: Arc<dyn HookEventFacade>,
    authenticator: Arc<dyn Authenticator>,
    codec: Arc<dyn SecretCodec>,
    settings: HandlerSettings,
}

impl HookServices {
    pub fn new(
        environment: Arc<HookEnvironment>,
        facade: Arc<dyn HookEventFacade>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            environment,
            facade,
            authenticator,
            codec: Arc::new(HexSecretCodec),
            settings: HandlerSettings::default(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn SecretCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_settings(mut self, settings: HandlerSettings) -> Self {
        self.settings = settings;
        self
    }

    fn authenticate(&self, request: &HookRequest) -> std::result::Result<Principal, AuthError> {
        let token = AuthenticationToken {
            actor: request.actor.clone(),
            secret: self.codec.decode(&request.encoded_secret)?,
        };
        self.authenticator.login(&token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Challenge,
    Authentication,
    NotFound,
    Domain,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Proceeded,
    AbortRequested,
    Failed(FailureKind),
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proceeded => "success",
            Self::AbortRequested => "abort_requested",
            Self::Failed(FailureKind::Challenge) => "challenge",
            Self::Failed(FailureKind::Authentication) => "authentication",
            Self::Failed(FailureKind::NotFound) => "not_found",
            Self::Failed(FailureKind::Domain) => "domain",
            Self::Failed(FailureKind::Unknown) => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Read,
    Respond,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "framing",
            Self::Respond => "respond",
        }
    }
}

#[derive(Debug, Error)]
#[error("hook connection failed at {}: {source}", .stage.as_str())]
pub struct ConnectionError {
    pub stage: Stage,
    pub source: AppError,
}

#[derive(Debug, Error)]
enum Failure {
    #[error("challenge mismatch")]
    ChallengeMismatch,

    #[error("authentication failed: {0}")]
    Authentication(AuthError),

    #[error(transparent)]
    Hook(HookError),

    #[error("dispatch did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("dispatch panicked: {0}")]
    Panicked(String),
}

struct FailureRule {
    kind: FailureKind,
    applies: fn(&Failure) -> bool,
    message: fn(&Failure) -> String,
}

// First match wins; the last rule matches everything.
const FAILURE_RULES: &[FailureRule] = &[
    FailureRule {
        kind: FailureKind::Challenge,
        applies: is_challenge_mismatch,
        message: challenge_message,
    },
    FailureRule {
        kind: FailureKind::Authentication,
        applies: is_authentication,
        message: authentication_message,
    },
    FailureRule {
        kind: FailureKind::NotFound,
        applies: is_not_found,
        message: failure_text,
    },
    FailureRule {
        kind: FailureKind::Domain,
        applies: is_domain,
        message: failure_text,
    },
    FailureRule {
        kind: FailureKind::Unknown,
        applies: always,
        message: unknown_message,
    },
];

fn is_challenge_mismatch(failure: &Failure) -> bool {
    matches!(failure, Failure::ChallengeMismatch)
}

fn is_authentication(failure: &Failure) -> bool {
    matches!(failure, Failure::Authentication(_))
}

fn is_not_found(failure: &Failure) -> bool {
    matches!(failure, Failure::Hook(HookError::NotFound { .. }))
}

fn is_domain(failure: &Failure) -> bool {
    matches!(failure, Failure::Hook(HookError::Domain { .. }))
}

fn always(_: &Failure) -> bool {
    true
}

fn challenge_message(_: &Failure) -> String {
    CHALLENGE_MISMATCH.to_string()
}

fn authentication_message(_: &Failure) -> String {
    AUTHENTICATION_FAILED.to_string()
}

fn failure_text(failure: &Failure) -> String {
    failure.to_string()
}

fn unknown_message(_: &Failure) -> String {
    UNKNOWN_ERROR.to_string()
}

fn distill(failure: &Failure) -> (FailureKind, String) {
    FAILURE_RULES
        .iter()
        .find(|rule| (rule.applies)(failure))
        .map(|rule| (rule.kind, (rule.message)(failure)))
        .unwrap_or_else(|| (FailureKind::Unknown, UNKNOWN_ERROR.to_string()))
}

pub struct HookHandler<S> {
    stream: S,
    services: Arc<HookServices>,
}

impl<S> HookHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, services: Arc<HookServices>) -> Self {
        Self { stream, services }
    }

    /// A request that cannot be read ends the connection without a response.
    pub async fn run(self) -> std::result::Result<Outcome, ConnectionError> {
        let Self { stream, services } = self;
        let max_frame_size = services.settings.max_frame_size;
        let mut framed = Framed::new(stream, JsonFrameCodec::<HookRequest>::new(max_frame_size));

        let request = read_request(&mut framed, services.settings.read_timeout)
            .await
            .map_err(|source| ConnectionError {
                stage: Stage::Read,
                source,
            })?;
        let span = info_span!(
            "hook",
            repository_id = %request.repository_id,
            transaction_id = %request.transaction_id,
            hook_type = %request.hook_type
        );
        let (outcome, response) = process(&services, request).instrument(span.clone()).await;
        let response = span.in_scope(|| fit_response(response, max_frame_size));

        respond(&mut framed, &response)
            .await
            .map_err(|source| ConnectionError {
                stage: Stage::Respond,
                source,
            })?;
        span.in_scope(|| debug!(outcome = outcome.as_str(), "hook connection closed"));
        Ok(outcome)
    }
}

async fn read_request<S>(
    framed: &mut Framed<S, JsonFrameCodec<HookRequest>>,
    timeout: Option<Duration>,
) -> Result<HookRequest>
where
    S: AsyncRead + Unpin,
{
    let request = match timeout {
        Some(limit) => tokio::time::timeout(limit, protocol::receive(framed))
            .await
            .map_err(|_| AppError::FrameTimeout)??,
        None => protocol::receive(framed).await?,
    };
    Ok(request)
}

async fn respond<S>(
    framed: &mut Framed<S, JsonFrameCodec<HookRequest>>,
    response: &HookResponse,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    protocol::send(framed, response).await?;
    framed.get_mut().shutdown().await?;
    Ok(())
}

async fn process(services: &Arc<HookServices>, request: HookRequest) -> (Outcome, HookResponse) {
    if !services.environment.accepts(&request.challenge) {
        return reject(Vec::new(), &Failure::ChallengeMismatch);
    }

    let principal = match services.authenticate(&request) {
        Ok(principal) => principal,
        Err(err) => return reject(Vec::new(), &Failure::Authentication(err)),
    };
    debug!(actor = %principal.name, "hook caller authenticated");

    let sink = MessageSink::new();
    let result = dispatch(services, request, principal, sink.clone()).await;
    let messages = sink.messages();
    match result {
        Ok(()) if sink.abort_requested() => {
            info!(messages = messages.len(), "listener requested abort");
            (
                Outcome::AbortRequested,
                HookResponse {
                    messages,
                    abort: true,
                },
            )
        }
        Ok(()) => {
            debug!(messages = messages.len(), "hook dispatched");
            (Outcome::Proceeded, HookResponse::proceed(messages))
        }
        Err(failure) => reject(messages, &failure),
    }
}

fn reject(messages: Vec<HookMessage>, failure: &Failure) -> (Outcome, HookResponse) {
    let (kind, text) = distill(failure);
    match kind {
        FailureKind::NotFound | FailureKind::Domain => {
            info!(kind = ?kind, error = %failure, "hook rejected");
        }
        FailureKind::Challenge | FailureKind::Authentication | FailureKind::Unknown => {
            warn!(kind = ?kind, error = %failure, "hook failed");
        }
    }
    (Outcome::Failed(kind), HookResponse::abort(messages, text))
}

async fn dispatch(
    services: &Arc<HookServices>,
    request: HookRequest,
    principal: Principal,
    sink: MessageSink,
) -> std::result::Result<(), Failure> {
    // Released when dispatch returns, even if the listener is still running.
    let _pending = (request.hook_type == HookType::PreMutation)
        .then(|| services.environment.begin_pending(&request.repository_id));

    let facade = Arc::clone(&services.facade);
    let span = Span::current();
    let task = tokio::task::spawn_blocking(move || -> std::result::Result<(), HookError> {
        let _entered = span.enter();
        let HookRequest {
            hook_type,
            transaction_id,
            repository_id,
            ..
        } = request;
        let _transaction = TransactionScope::bind(&transaction_id);

        let handler = facade.handle(&repository_id)?;
        let context = HookContext::new(repository_id, hook_type, transaction_id, principal, sink);
        handler.fire_hook_event(hook_type, &context)
    });

    let joined = match services.settings.dispatch_timeout {
        Some(limit) => tokio::time::timeout(limit, task)
            .await
            .map_err(|_| Failure::TimedOut(limit))?,
        None => task.await,
    };

    match joined {
        Ok(result) => result.map_err(Failure::Hook),
        Err(err) if err.is_panic() => Err(Failure::Panicked(panic_message(err.into_panic()))),
        Err(err) => Err(Failure::Panicked(err.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "non-string panic payload".to_string()
}

fn payload_len(response: &HookResponse) -> usize {
    serde_json::to_vec(response).map_or(usize::MAX, |payload| payload.len())
}

fn omitted_notice(count: usize, abort: bool) -> HookMessage {
    let text = format!("{count} earlier messages omitted");
    if abort {
        HookMessage::error(text)
    } else {
        HookMessage::note(text)
    }
}

/// Shrinks `response` until it fits in one frame. The earliest messages are
/// dropped first. An aborting response keeps its last message, shortened if
/// it does not fit on its own.
fn fit_response(response: HookResponse, max_frame_size: usize) -> HookResponse {
    if payload_len(&response) <= max_frame_size {
        return response;
    }

    let HookResponse { mut messages, abort } = response;
    let total = messages.len();
    let mut tail = if abort { messages.pop() } else { None };
    let assemble = |kept: &[HookMessage], tail: Option<&HookMessage>| {
        let omitted = total - kept.len() - usize::from(tail.is_some());
        let mut fitted = Vec::with_capacity(kept.len() + 2);
        if omitted > 0 {
            fitted.push(omitted_notice(omitted, abort));
        }
        fitted.extend_from_slice(kept);
        fitted.extend(tail.cloned());
        HookResponse {
            messages: fitted,
            abort,
        }
    };

    let mut budget = max_frame_size.saturating_sub(payload_len(&assemble(&[], tail.as_ref())));
    let mut start = messages.len();
    while start > 0 {
        let size = serde_json::to_vec(&messages[start - 1])
            .map_or(usize::MAX, |message| message.len().saturating_add(1));
        if size > budget {
            break;
        }
        budget -= size;
        start -= 1;
    }
    warn!(
        total,
        kept = messages.len() - start,
        max_frame_size,
        "hook response exceeds the frame limit; dropping earliest messages"
    );

    let fitted = assemble(&messages[start..], tail.as_ref());
    if payload_len(&fitted) <= max_frame_size {
        return fitted;
    }

    if let Some(message) = tail.as_mut() {
        loop {
            let candidate = assemble(&[], Some(message));
            let excess = payload_len(&candidate).saturating_sub(max_frame_size);
            if excess == 0 {
                return candidate;
            }
            if message.text.is_empty() {
                break;
            }
            let mut cut = message.text.len().saturating_sub(excess);
            while !message.text.is_char_boundary(cut) {
                cut -= 1;
            }
            message.text.truncate(cut);
        }
    }
    HookResponse {
        messages: Vec::new(),
        abort,
    }
}

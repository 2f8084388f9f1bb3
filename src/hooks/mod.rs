pub mod registry;
pub mod transaction;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::{
    models::{HookMessage, HookType},
    security::Principal,
};

pub use registry::{HookListener, HookRegistry};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("[{code}] {message}")]
    Domain { code: String, message: String },

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HookError {
    pub fn repository_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "repository",
            id: id.into(),
        }
    }

    pub fn domain(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Domain {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Other(message.into())
    }
}

pub trait HookEventFacade: Send + Sync {
    fn handle(&self, repository_id: &str) -> Result<Arc<dyn HookEventHandler>, HookError>;
}

pub trait HookEventHandler: Send + Sync {
    fn fire_hook_event(&self, hook_type: HookType, context: &HookContext) -> Result<(), HookError>;
}

#[derive(Debug, Default)]
struct SinkState {
    messages: Vec<HookMessage>,
    abort: bool,
}

/// Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MessageSink {
    state: Arc<Mutex<SinkState>>,
}

impl MessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_message(&self, text: impl Into<String>) {
        self.push(HookMessage::note(text));
    }

    pub fn send_error(&self, text: impl Into<String>) {
        self.push(HookMessage::error(text));
    }

    pub fn push(&self, message: HookMessage) {
        self.state().messages.push(message);
    }

    /// Ask for the mutation to be rejected without failing the dispatch.
    pub fn request_abort(&self) {
        self.state().abort = true;
    }

    pub fn abort_requested(&self) -> bool {
        self.state().abort
    }

    pub fn messages(&self) -> Vec<HookMessage> {
        self.state().messages.clone()
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct HookContext {
    repository_id: String,
    hook_type: HookType,
    transaction_id: String,
    principal: Principal,
    messages: MessageSink,
}

impl HookContext {
    pub fn new(
        repository_id: impl Into<String>,
        hook_type: HookType,
        transaction_id: impl Into<String>,
        principal: Principal,
        messages: MessageSink,
    ) -> Self {
        Self {
            repository_id: repository_id.into(),
            hook_type,
            transaction_id: transaction_id.into(),
            principal,
            messages,
        }
    }

    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }

    pub fn hook_type(&self) -> HookType {
        self.hook_type
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn messages(&self) -> &MessageSink {
        &self.messages
    }
}

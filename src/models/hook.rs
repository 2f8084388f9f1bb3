use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookType {
    PreMutation,
    PostMutation,
}

impl HookType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreMutation => "pre-mutation",
            Self::PostMutation => "post-mutation",
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownHookType(pub String);

impl fmt::Display for UnknownHookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown hook type `{}`", self.0)
    }
}

impl std::error::Error for UnknownHookType {}

impl FromStr for HookType {
    type Err = UnknownHookType;

    /// Accepts our own names plus the hook names git and mercurial use.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pre" | "pre-mutation" | "pre-receive" | "pretxnchangegroup" => Ok(Self::PreMutation),
            "post" | "post-mutation" | "post-receive" | "changegroup" => Ok(Self::PostMutation),
            _ => Err(UnknownHookType(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Note,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookMessage {
    pub text: String,
    pub severity: Severity,
}

impl HookMessage {
    pub fn note(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            severity: Severity::Note,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            severity: Severity::Error,
        }
    }
}

impl fmt::Display for HookMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Note => write!(f, "NOTE: {}", self.text),
            Severity::Error => write!(f, "ERROR: {}", self.text),
        }
    }
}

/// One hook invocation as sent by the hook subprocess.
///
/// `encoded_secret` is the shared secret in its at-rest encoding. The
/// loopback transport is the only protection it gets on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRequest {
    #[serde(rename = "secret")]
    pub encoded_secret: String,
    pub hook_type: HookType,
    pub transaction_id: String,
    pub repository_id: String,
    pub challenge: String,
    pub actor: String,
}

impl fmt::Debug for HookRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRequest")
            .field("encoded_secret", &"[REDACTED]")
            .field("hook_type", &self.hook_type)
            .field("transaction_id", &self.transaction_id)
            .field("repository_id", &self.repository_id)
            .field("challenge", &"[REDACTED]")
            .field("actor", &self.actor)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookResponse {
    pub messages: Vec<HookMessage>,
    pub abort: bool,
}

impl HookResponse {
    pub fn proceed(messages: Vec<HookMessage>) -> Self {
        Self {
            messages,
            abort: false,
        }
    }

    /// Aborting response whose last message is `error`.
    pub fn abort(mut messages: Vec<HookMessage>, error: impl Into<String>) -> Self {
        messages.push(HookMessage::error(error));
        Self {
            messages,
            abort: true,
        }
    }
}

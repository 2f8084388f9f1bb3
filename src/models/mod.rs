pub mod hook;

pub use hook::{HookMessage, HookRequest, HookResponse, HookType, Severity};

use std::{collections::HashMap, sync::Arc};

use tracing::info;

use super::{HookContext, HookError, HookEventFacade, HookEventHandler};
use crate::models::HookType;

pub trait HookListener: Send + Sync {
    fn on_hook(&self, context: &HookContext) -> Result<(), HookError>;
}

impl<F> HookListener for F
where
    F: Fn(&HookContext) -> Result<(), HookError> + Send + Sync,
{
    fn on_hook(&self, context: &HookContext) -> Result<(), HookError> {
        self(context)
    }
}

/// In-memory [`HookEventFacade`]: known repositories and the listeners
/// registered for each hook type. Listeners run in registration order and the
/// first failure stops the rest.
#[derive(Default)]
pub struct HookRegistry {
    repositories: HashMap<String, RepositoryHooks>,
}

#[derive(Default, Clone)]
struct RepositoryHooks {
    listeners: Vec<(HookType, Arc<dyn HookListener>)>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_repository(&mut self, repository_id: impl Into<String>) -> &mut Self {
        self.repositories.entry(repository_id.into()).or_default();
        self
    }

    pub fn register(
        &mut self,
        repository_id: impl Into<String>,
        hook_type: HookType,
        listener: impl HookListener + 'static,
    ) -> &mut Self {
        self.repositories
            .entry(repository_id.into())
            .or_default()
            .listeners
            .push((hook_type, Arc::new(listener)));
        self
    }
}

impl HookEventFacade for HookRegistry {
    fn handle(&self, repository_id: &str) -> Result<Arc<dyn HookEventHandler>, HookError> {
        let hooks = self
            .repositories
            .get(repository_id)
            .ok_or_else(|| HookError::repository_not_found(repository_id))?;
        Ok(Arc::new(hooks.clone()))
    }
}

impl HookEventHandler for RepositoryHooks {
    fn fire_hook_event(&self, hook_type: HookType, context: &HookContext) -> Result<(), HookError> {
        self.listeners
            .iter()
            .filter(|(registered, _)| *registered == hook_type)
            .try_for_each(|(_, listener)| listener.on_hook(context))
    }
}

/// Records every hook it sees in the log and never objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl HookListener for TracingListener {
    fn on_hook(&self, context: &HookContext) -> Result<(), HookError> {
        info!(
            repository_id = %context.repository_id(),
            hook_type = %context.hook_type(),
            transaction_id = %context.transaction_id(),
            actor = %context.principal().name,
            "hook received"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{hooks::MessageSink, security::Principal};

    fn context(hook_type: HookType, sink: &MessageSink) -> HookContext {
        HookContext::new(
            "42",
            hook_type,
            "ti21",
            Principal {
                name: "trillian".to_string(),
            },
            sink.clone(),
        )
    }

    #[test]
    fn unknown_repository_is_not_found() {
        let registry = HookRegistry::new();
        let err = registry.handle("42").err().unwrap();
        assert!(matches!(err, HookError::NotFound { entity: "repository", .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn fires_only_listeners_of_the_hook_type() {
        let pre_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pre_calls);
        let mut registry = HookRegistry::new();
        registry
            .register("42", HookType::PreMutation, move |_: &HookContext| -> Result<(), HookError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .register("42", HookType::PostMutation, |ctx: &HookContext| -> Result<(), HookError> {
                ctx.messages().send_message("post");
                Ok(())
            });

        let sink = MessageSink::new();
        let handler = registry.handle("42").unwrap();
        handler
            .fire_hook_event(HookType::PreMutation, &context(HookType::PreMutation, &sink))
            .unwrap();
        assert_eq!(pre_calls.load(Ordering::SeqCst), 1);
        assert!(sink.messages().is_empty());

        handler
            .fire_hook_event(HookType::PostMutation, &context(HookType::PostMutation, &sink))
            .unwrap();
        assert_eq!(sink.messages().len(), 1);
    }

    #[test]
    fn first_failure_stops_remaining_listeners() {
        let mut registry = HookRegistry::new();
        registry
            .register("42", HookType::PreMutation, |ctx: &HookContext| -> Result<(), HookError> {
                ctx.messages().send_message("checked");
                Err(HookError::domain("E1", "rejected"))
            })
            .register("42", HookType::PreMutation, |ctx: &HookContext| -> Result<(), HookError> {
                ctx.messages().send_message("never");
                Ok(())
            });

        let sink = MessageSink::new();
        let result = registry
            .handle("42")
            .unwrap()
            .fire_hook_event(HookType::PreMutation, &context(HookType::PreMutation, &sink));
        assert!(matches!(result, Err(HookError::Domain { .. })));
        assert_eq!(sink.messages().len(), 1);
    }

    #[test]
    fn added_repository_without_listeners_succeeds() {
        let mut registry = HookRegistry::new();
        registry.add_repository("42");
        let sink = MessageSink::new();
        registry
            .handle("42")
            .unwrap()
            .fire_hook_event(HookType::PostMutation, &context(HookType::PostMutation, &sink))
            .unwrap();
    }
}

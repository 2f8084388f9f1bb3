use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::security::{constant_time_eq, random_token};

/// State shared by every connection of one hook server.
///
/// The challenge is generated once and never rotates, so a hook subprocess
/// that outlives a server restart fails the challenge check. Pending state is
/// counted per repository: overlapping pre-mutation hooks keep
/// [`HookEnvironment::is_pending`] true until the last one has finished.
#[derive(Debug)]
pub struct HookEnvironment {
    challenge: String,
    in_flight: Mutex<HashMap<String, usize>>,
}

impl HookEnvironment {
    pub fn new() -> Self {
        Self::with_challenge(random_token())
    }

    pub fn with_challenge(challenge: impl Into<String>) -> Self {
        Self {
            challenge: challenge.into(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn accepts(&self, challenge: &str) -> bool {
        constant_time_eq(challenge.as_bytes(), self.challenge.as_bytes())
    }

    pub fn is_pending(&self) -> bool {
        !self.counts().is_empty()
    }

    pub fn is_pending_for(&self, repository_id: &str) -> bool {
        self.counts().contains_key(repository_id)
    }

    /// Marks a pre-mutation hook for `repository_id` as in flight until the
    /// returned guard is dropped.
    pub fn begin_pending(self: &Arc<Self>, repository_id: &str) -> PendingGuard {
        *self.counts().entry(repository_id.to_string()).or_insert(0) += 1;
        PendingGuard {
            environment: Arc::clone(self),
            repository_id: repository_id.to_string(),
        }
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HookEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use = "pending state is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PendingGuard {
    environment: Arc<HookEnvironment>,
    repository_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut counts = self.environment.counts();
        if let Some(count) = counts.get_mut(&self.repository_id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.repository_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_random_per_environment() {
        let first = HookEnvironment::new();
        let second = HookEnvironment::new();
        assert_eq!(first.challenge().len(), 64);
        assert_ne!(first.challenge(), second.challenge());
        assert!(first.accepts(first.challenge()));
        assert!(!first.accepts(second.challenge()));
        assert!(!first.accepts(""));
    }

    #[test]
    fn guard_toggles_pending() {
        let environment = Arc::new(HookEnvironment::new());
        assert!(!environment.is_pending());
        {
            let _guard = environment.begin_pending("42");
            assert!(environment.is_pending());
            assert!(environment.is_pending_for("42"));
            assert!(!environment.is_pending_for("43"));
        }
        assert!(!environment.is_pending());
    }

    #[test]
    fn overlapping_guards_stay_pending_until_last_release() {
        let environment = Arc::new(HookEnvironment::new());
        let first = environment.begin_pending("42");
        let second = environment.begin_pending("43");
        let third = environment.begin_pending("42");

        drop(first);
        assert!(environment.is_pending_for("42"));
        drop(second);
        assert!(!environment.is_pending_for("43"));
        assert!(environment.is_pending());
        drop(third);
        assert!(!environment.is_pending());
    }

    #[test]
    fn guard_released_on_panic() {
        let environment = Arc::new(HookEnvironment::new());
        let shared = Arc::clone(&environment);
        let result = std::thread::spawn(move || {
            let _guard = shared.begin_pending("42");
            panic!("listener blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!environment.is_pending());
    }
}

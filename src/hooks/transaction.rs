//! Transaction id of the hook dispatch running on the current thread.
//!
//! Dispatch runs on a blocking thread, so the id is thread scoped. Listeners
//! read it with [`current`]; it is only set while a [`TransactionScope`] is
//! alive.

use std::cell::RefCell;

thread_local! {
    static TRANSACTION_ID: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub fn current() -> Option<String> {
    TRANSACTION_ID.with(|id| id.borrow().clone())
}

#[must_use = "the transaction id is cleared as soon as the scope is dropped"]
#[derive(Debug)]
pub struct TransactionScope {
    previous: Option<String>,
}

impl TransactionScope {
    pub fn bind(transaction_id: &str) -> Self {
        let previous = TRANSACTION_ID.with(|id| id.replace(Some(transaction_id.to_string())));
        Self { previous }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        TRANSACTION_ID.with(|id| *id.borrow_mut() = previous);
    }
}

//! Request context handed to every persistence operation.
//!
//! A [`Context`] carries a label for log correlation, the lifecycle observer,
//! and, inside [`crate::CachedStore::run_in_transaction`], the list of actions
//! deferred until the transaction commits.

use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use keel_core::{KeelError, KeelResult, StorageError};

use crate::hooks::{LifecycleObserver, NoopObserver};

/// Work queued with [`Context::after_transaction`].
pub type DeferredAction = Box<dyn FnOnce() -> BoxFuture<'static, KeelResult<()>> + Send>;

/// Cheap-to-clone handle shared by all calls of one request.
#[derive(Clone)]
pub struct Context {
    label: Arc<str>,
    observer: Arc<dyn LifecycleObserver>,
    transaction: Option<Arc<TransactionState>>,
}

impl Context {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Arc::from(label.into()),
            observer: Arc::new(NoopObserver),
            transaction: None,
        }
    }

    /// Context for work not tied to a request.
    pub fn background() -> Self {
        Self::new("background")
    }

    /// Replace the lifecycle observer.
    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn observer(&self) -> &dyn LifecycleObserver {
        self.observer.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Queue `action` to run once the enclosing transaction has committed.
    ///
    /// Actions run in registration order. They are dropped if the
    /// transaction aborts. Fails outside a transaction.
    pub fn after_transaction<F>(&self, action: F) -> KeelResult<()>
    where
        F: std::future::Future<Output = KeelResult<()>> + Send + 'static,
    {
        let state = self.transaction.as_ref().ok_or_else(|| {
            KeelError::from(StorageError::TransactionFailed {
                reason: "after_transaction called outside a transaction".to_string(),
            })
        })?;
        state.push(Box::new(move || action.boxed()))
    }

    /// A child context bound to a fresh transaction.
    pub(crate) fn begin_transaction(&self) -> (Context, Arc<TransactionState>) {
        let state = Arc::new(TransactionState::default());
        let ctx = Context {
            label: self.label.clone(),
            observer: self.observer.clone(),
            transaction: Some(state.clone()),
        };
        (ctx, state)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("label", &self.label)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

/// Deferred work of one transaction.
#[derive(Default)]
pub(crate) struct TransactionState {
    deferred: Mutex<Vec<DeferredAction>>,
}

impl TransactionState {
    fn push(&self, action: DeferredAction) -> KeelResult<()> {
        self.deferred
            .lock()
            .map_err(|_| KeelError::Storage(StorageError::LockPoisoned))?
            .push(action);
        Ok(())
    }

    fn take(&self) -> Vec<DeferredAction> {
        match self.deferred.lock() {
            Ok(mut deferred) => std::mem::take(&mut *deferred),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Run every queued action in order. Failures are logged, not returned:
    /// the transaction has already committed.
    pub(crate) async fn run_deferred(&self, label: &str) {
        for action in self.take() {
            if let Err(err) = action().await {
                tracing::error!(ctx = label, error = %err, "deferred action failed after commit");
            }
        }
    }

    /// Drop every queued action, returning how many were dropped.
    pub(crate) fn discard(&self) -> usize {
        self.take().len()
    }
}

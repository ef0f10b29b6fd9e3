//! Nested cancellation scopes (run → criterion → backend).
//!
//! A scope observes its own signal and every ancestor's. Cancelling a child
//! never reaches the parent.

use std::sync::{Arc, Mutex};

use futures::future::select_all;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

#[derive(Debug)]
struct ScopeInner {
    signal: watch::Sender<bool>,
    reason: Mutex<Option<String>>,
    parent: Option<CancelScope>,
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<CancelScope>) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(ScopeInner {
                signal,
                reason: Mutex::new(None),
                parent,
            }),
        }
    }

    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    /// Cancel this scope and all descendants. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.inner.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.inner.signal.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.signal.borrow()
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(CancelScope::is_cancelled)
    }

    /// Reason of the nearest cancelled scope, walking up from this one.
    pub fn reason(&self) -> Option<String> {
        if *self.inner.signal.borrow() {
            let own = self.inner.reason.lock().ok().and_then(|r| r.clone());
            return Some(own.unwrap_or_else(|| "cancelled".to_string()));
        }
        self.inner.parent.as_ref().and_then(CancelScope::reason)
    }

    /// Resolves once this scope or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        let mut receivers = Vec::new();
        let mut cursor = Some(self);
        while let Some(scope) = cursor {
            receivers.push(scope.inner.signal.subscribe());
            cursor = scope.inner.parent.as_ref();
        }

        let waits = receivers.into_iter().map(|mut rx| {
            Box::pin(async move {
                // The sender lives as long as the scope, so an error here only
                // happens once the scope itself is gone.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });
        select_all(waits).await;
    }
}

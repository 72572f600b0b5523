//! Cancellable scope with ordered cleanup handlers.
//!
//! A [`Scope`] carries a cancellation signal derived from an optional parent
//! and a list of cleanup handlers that run, in registration order, exactly
//! once when the scope closes. Every long-running task in the fabric
//! (accept loops, read/write loops, copy loops, periodic sweeps) owns one.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::Notify;
use tracing::warn;

pub type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), CleanupError>> + Send>>;
pub type CleanupHandler = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Error raised by a single cleanup handler.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cleanup handler failed: {0}")]
pub struct CleanupError(pub String);

impl CleanupError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

struct Inner {
    cancel_notify: Notify,
    closed: AtomicBool,
    attached: AtomicBool,
    close_gate: tokio::sync::Mutex<()>,
    cleanups: Mutex<Vec<CleanupHandler>>,
    errors: OnceLock<Arc<Vec<CleanupError>>>,
    name: String,
}

/// A cancellable scope. Cheap to clone — clones share the same underlying
/// cancellation state and cleanup list.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Scope {
    /// Create a new, unattached root scope.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancel_notify: Notify::new(),
                closed: AtomicBool::new(false),
                attached: AtomicBool::new(false),
                close_gate: tokio::sync::Mutex::new(()),
                cleanups: Mutex::new(Vec::new()),
                errors: OnceLock::new(),
                name: name.into(),
            }),
        }
    }

    /// Create a child scope already attached to `self`, with `on_close` as
    /// its first cleanup handler.
    pub fn child<F, Fut>(&self, name: impl Into<String>, on_close: F) -> Scope
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CleanupError>> + Send + 'static,
    {
        let child = Scope::new(name);
        child.attach(self, on_close);
        child
    }

    /// Bind `parent`'s cancellation to this scope and append `on_close` to
    /// the cleanup list. Calling this more than once on the same scope is a
    /// no-op that logs a warning, per spec.
    pub fn attach<F, Fut>(&self, parent: &Scope, on_close: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CleanupError>> + Send + 'static,
    {
        if self.inner.attached.swap(true, Ordering::SeqCst) {
            warn!(scope = %self.inner.name, "attach() called more than once; ignoring");
            return;
        }
        self.add_cleanup(on_close);

        let child = self.clone();
        let parent = parent.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            child.close().await;
        });
    }

    /// Append another cleanup handler, run after any already registered.
    pub fn add_cleanup<F, Fut>(&self, on_close: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CleanupError>> + Send + 'static,
    {
        let boxed: CleanupHandler = Box::new(move || Box::pin(on_close()));
        self.inner.cleanups.lock().unwrap().push(boxed);
    }

    /// Idempotent close. Fires the cancellation signal, then runs every
    /// registered cleanup handler in order, aggregating (not short-circuiting
    /// on) errors. Calling `close()` again returns the same aggregated
    /// result without re-running anything.
    pub async fn close(&self) -> Arc<Vec<CleanupError>> {
        if let Some(errors) = self.inner.errors.get() {
            return errors.clone();
        }

        let _guard = self.inner.close_gate.lock().await;
        if let Some(errors) = self.inner.errors.get() {
            return errors.clone();
        }

        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.cancel_notify.notify_waiters();

        let handlers: Vec<CleanupHandler> =
            std::mem::take(&mut *self.inner.cleanups.lock().unwrap());

        let mut errors = Vec::new();
        for handler in handlers {
            if let Err(e) = handler().await {
                warn!(scope = %self.inner.name, error = %e, "cleanup handler failed");
                errors.push(e);
            }
        }

        let errors = Arc::new(errors);
        // Another task may have raced us into close_gate's critical section
        // via a differently-ordered get()/set() — OnceLock::set() losing the
        // race just means our result is discarded in favor of theirs, which
        // is identical (we ran under the same mutex).
        let _ = self.inner.errors.set(errors.clone());
        errors
    }

    /// True once `close()` has begun (cancellation fired); never reverts.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once this scope has begun closing.
    pub async fn cancelled(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let notified = self.inner.cancel_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

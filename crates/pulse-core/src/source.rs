//! Completion sources: per-operation result/status cells with pooled reuse
//! guarded by version tokens.
//!
//! A completion source represents one in-flight asynchronous operation. The
//! producer side completes it exactly once; the consumer side either queries
//! the result directly or registers a single continuation. Because sources
//! are recycled through an object pool, the same memory represents a
//! brand-new unrelated operation moments after the old one finished — every
//! consumer-facing call therefore presents a version token, and a stale
//! token is rejected loudly rather than silently observing the wrong
//! operation's result.

use std::error::Error;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error as ThisError;

use crate::pool::{Pool, PoolLink, PoolRegistry, Poolable, DEFAULT_POOL_CAPACITY};

/// Status of one in-flight operation. Terminal once it leaves `Pending`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// The operation has not completed.
    Pending,
    /// The operation completed and stored a result.
    Succeeded,
    /// The operation failed and stored its cause.
    Faulted,
    /// The operation was canceled before completing.
    Canceled,
}

impl Status {
    /// Whether the operation has left `Pending`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending)
    }
}

/// Version token guarding a pooled source against stale access.
///
/// Invalidated on every [`CompletionSource::reset`]; any call presenting a
/// token from before the reset fails with [`SourceError::StaleToken`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Token(u16);

impl Token {
    /// Raw version value, for diagnostics.
    pub fn value(self) -> u16 {
        self.0
    }
}

/// Failure cause captured by a completion source.
///
/// Cancellation is modeled as a distinguished failure rather than a separate
/// call path, keeping the completion state machine single-entry.
#[derive(Debug, Clone, ThisError)]
pub enum Fault {
    /// The operation was canceled.
    #[error("operation canceled")]
    Canceled,
    /// The operation failed with the given error.
    #[error(transparent)]
    Error(Arc<dyn Error + Send + Sync>),
}

impl Fault {
    /// Capture an error value as a fault.
    pub fn new<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Fault::Error(Arc::new(err))
    }

    /// Capture a plain message as a fault.
    pub fn msg(msg: impl Into<String>) -> Self {
        #[derive(Debug, ThisError)]
        #[error("{0}")]
        struct Message(String);

        Fault::Error(Arc::new(Message(msg.into())))
    }

    /// Whether this fault is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Fault::Canceled)
    }
}

/// Errors surfaced by completion-source operations.
///
/// The token and registration variants are usage errors: they indicate a bug
/// in the caller and fail synchronously at the call site. `Faulted` carries
/// the completed operation's own captured cause.
#[derive(Debug, Clone, ThisError)]
pub enum SourceError {
    /// The presented token does not match the source's current version; the
    /// source was recycled since the caller last observed it.
    #[error("stale token: presented version {presented}, current {current}")]
    StaleToken {
        /// Version the caller presented.
        presented: u16,
        /// Version the source currently carries.
        current: u16,
    },

    /// A continuation is already registered for the current token.
    #[error("continuation already registered")]
    ContinuationAlreadyRegistered,

    /// The result was queried before the operation completed.
    #[error("operation has not completed")]
    NotCompleted,

    /// The result was already consumed by an earlier query.
    #[error("result already consumed")]
    AlreadyConsumed,

    /// Reset was called while a registered continuation was never invoked.
    #[error("reset with a continuation still registered")]
    ContinuationPending,

    /// The operation terminated with the captured cause.
    #[error("operation failed: {0}")]
    Faulted(Fault),
}

type Continuation = Box<dyn FnOnce() + Send>;

struct Inner<T> {
    status: Status,
    version: u16,
    value: Option<T>,
    fault: Option<Fault>,
    continuation: Option<Continuation>,
}

impl<T> Inner<T> {
    fn check_token(&self, token: Token) -> Result<(), SourceError> {
        if token.0 != self.version {
            return Err(SourceError::StaleToken {
                presented: token.0,
                current: self.version,
            });
        }
        Ok(())
    }
}

/// The result/status cell for one in-flight operation producing a `T`.
///
/// Producer and consumer threads share a source by `Arc`; all state lives
/// behind an internal lock so every method takes `&self`. The stored
/// continuation is invoked inline by the completing call, after the lock is
/// released — completers must therefore be reentrancy-safe.
pub struct CompletionSource<T> {
    inner: Mutex<Inner<T>>,
    link: PoolLink<Self>,
}

impl<T: Send> CompletionSource<T> {
    /// Create a source in the `Pending` state.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: Status::Pending,
                version: 0,
                value: None,
                fault: None,
                continuation: None,
            }),
            link: PoolLink::new(),
        }
    }

    /// Token for the source's current version. Captured once when the
    /// operation starts and presented on every later access.
    pub fn token(&self) -> Token {
        Token(self.inner.lock().version)
    }

    /// Current status, validated against `token`.
    pub fn status(&self, token: Token) -> Result<Status, SourceError> {
        let inner = self.inner.lock();
        inner.check_token(token)?;
        Ok(inner.status)
    }

    /// Current status without token validation.
    ///
    /// For diagnostics only; must never drive control flow, since the source
    /// may have been recycled out from under the caller.
    pub fn status_unchecked(&self) -> Status {
        self.inner.lock().status
    }

    /// Transition `Pending` → `Succeeded`, storing `value`.
    ///
    /// Returns whether this call performed the transition. `false` means the
    /// completion race was lost (the source is already terminal) — not an
    /// error; the value is dropped. A continuation registered for the
    /// current token is invoked inline before this returns.
    pub fn try_set_result(&self, value: T) -> bool {
        let continuation = {
            let mut inner = self.inner.lock();
            if inner.status != Status::Pending {
                return false;
            }
            inner.status = Status::Succeeded;
            inner.value = Some(value);
            inner.continuation.take()
        };
        if let Some(continuation) = continuation {
            continuation();
        }
        true
    }

    /// Transition `Pending` → `Faulted`, or → `Canceled` when the fault is a
    /// cancellation. Same first-transition-wins semantics as
    /// [`try_set_result`](Self::try_set_result).
    pub fn try_set_exception(&self, fault: Fault) -> bool {
        let continuation = {
            let mut inner = self.inner.lock();
            if inner.status != Status::Pending {
                return false;
            }
            inner.status = if fault.is_cancellation() {
                Status::Canceled
            } else {
                Status::Faulted
            };
            inner.fault = Some(fault);
            inner.continuation.take()
        };
        if let Some(continuation) = continuation {
            continuation();
        }
        true
    }

    /// Register the continuation to run on completion.
    ///
    /// If the source is already terminal for `token`, the continuation runs
    /// immediately on the calling thread; otherwise it is stored and invoked
    /// inline by the completing `try_set_*` call. At most one continuation
    /// may be registered per (source, token) pair.
    pub fn on_completed(
        &self,
        continuation: impl FnOnce() + Send + 'static,
        token: Token,
    ) -> Result<(), SourceError> {
        let mut inner = self.inner.lock();
        inner.check_token(token)?;
        if inner.status.is_terminal() {
            drop(inner);
            continuation();
            return Ok(());
        }
        if inner.continuation.is_some() {
            return Err(SourceError::ContinuationAlreadyRegistered);
        }
        inner.continuation = Some(Box::new(continuation));
        Ok(())
    }

    /// Consume the stored result.
    ///
    /// Fails with the captured cause if the operation faulted or was
    /// canceled, with [`SourceError::NotCompleted`] while still pending
    /// (querying early is a caller contract violation), and with
    /// [`SourceError::AlreadyConsumed`] on a second successful query. After
    /// the result is consumed the source is eligible for reset and pool
    /// return.
    pub fn get_result(&self, token: Token) -> Result<T, SourceError> {
        let mut inner = self.inner.lock();
        inner.check_token(token)?;
        match inner.status {
            Status::Pending => Err(SourceError::NotCompleted),
            Status::Succeeded => inner.value.take().ok_or(SourceError::AlreadyConsumed),
            Status::Faulted | Status::Canceled => {
                let fault = inner.fault.clone().unwrap_or(Fault::Canceled);
                Err(SourceError::Faulted(fault))
            }
        }
    }

    /// Clear result, cause, and continuation; advance the version token
    /// (wrapping); return to `Pending`.
    ///
    /// Must only be called once the prior occupant's result has been
    /// consumed. Resetting while a registered continuation was never invoked
    /// is a usage error.
    pub fn reset(&self) -> Result<(), SourceError> {
        let mut inner = self.inner.lock();
        if inner.continuation.is_some() {
            return Err(SourceError::ContinuationPending);
        }
        inner.status = Status::Pending;
        inner.value = None;
        inner.fault = None;
        inner.version = inner.version.wrapping_add(1);
        Ok(())
    }
}

impl<T: Send> Default for CompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Poolable for CompletionSource<T> {
    fn pool_link(&self) -> &PoolLink<Self> {
        &self.link
    }
}

/// Completion source for operations that produce no value.
///
/// A separate capability set from the value-carrying [`CompletionSource`]:
/// completion is a bare signal, and consumption acknowledges it without
/// yielding anything.
pub struct SimpleSource {
    core: CompletionSource<()>,
    link: PoolLink<Self>,
}

impl SimpleSource {
    /// Create a source in the `Pending` state.
    pub fn new() -> Self {
        Self {
            core: CompletionSource::new(),
            link: PoolLink::new(),
        }
    }

    /// Token for the source's current version.
    pub fn token(&self) -> Token {
        self.core.token()
    }

    /// Current status, validated against `token`.
    pub fn status(&self, token: Token) -> Result<Status, SourceError> {
        self.core.status(token)
    }

    /// Current status without token validation. Diagnostics only.
    pub fn status_unchecked(&self) -> Status {
        self.core.status_unchecked()
    }

    /// Signal successful completion. First transition wins.
    pub fn try_signal(&self) -> bool {
        self.core.try_set_result(())
    }

    /// Signal failure (or cancellation, for a cancellation fault).
    pub fn try_set_exception(&self, fault: Fault) -> bool {
        self.core.try_set_exception(fault)
    }

    /// Register the continuation to run on completion.
    pub fn on_completed(
        &self,
        continuation: impl FnOnce() + Send + 'static,
        token: Token,
    ) -> Result<(), SourceError> {
        self.core.on_completed(continuation, token)
    }

    /// Acknowledge completion, surfacing the captured cause if the
    /// operation failed.
    pub fn consume(&self, token: Token) -> Result<(), SourceError> {
        self.core.get_result(token)
    }

    /// Reset for reuse; advances the version token.
    pub fn reset(&self) -> Result<(), SourceError> {
        self.core.reset()
    }
}

impl Default for SimpleSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Poolable for SimpleSource {
    fn pool_link(&self) -> &PoolLink<Self> {
        &self.link
    }
}

/// Pool of completion sources for one result type.
///
/// Packages the acquire → complete → consume → reset → release loop:
/// [`acquire`](Self::acquire) hands out a recycled (already reset) or fresh
/// source together with its current token; [`release`](Self::release) resets
/// and returns a consumed source.
pub struct SourcePool<T: Send + 'static> {
    pool: Pool<CompletionSource<T>>,
}

impl<T: Send + 'static> SourcePool<T> {
    /// Create a pool retaining up to [`DEFAULT_POOL_CAPACITY`] sources.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Create a pool retaining up to `capacity` sources.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pool: Pool::new(capacity),
        }
    }

    /// Create a pool reporting to the given registry.
    pub fn with_registry(capacity: usize, registry: &PoolRegistry) -> Self {
        Self {
            pool: Pool::with_registry(capacity, registry),
        }
    }

    /// Acquire a source in the `Pending` state along with its token.
    pub fn acquire(&self) -> (Arc<CompletionSource<T>>, Token) {
        let source = self
            .pool
            .try_acquire()
            .unwrap_or_else(|| Arc::new(CompletionSource::new()));
        let token = source.token();
        (source, token)
    }

    /// Reset a consumed source and return it to the pool.
    ///
    /// Returns `Ok(false)` if the pool is at capacity and the source was
    /// dropped instead. Fails if the source cannot be reset yet.
    pub fn release(&self, source: Arc<CompletionSource<T>>) -> Result<bool, SourceError> {
        source.reset()?;
        Ok(self.pool.try_release(source))
    }

    /// Number of sources currently pooled.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }
}

impl<T: Send + 'static> Default for SourcePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_source_success_round_trip() {
        let source: CompletionSource<u32> = CompletionSource::new();
        let token = source.token();

        assert_eq!(source.status(token).unwrap(), Status::Pending);
        assert!(source.try_set_result(7));
        assert_eq!(source.status(token).unwrap(), Status::Succeeded);
        assert_eq!(source.get_result(token).unwrap(), 7);
    }

    #[test]
    fn test_source_first_transition_wins() {
        let source: CompletionSource<u32> = CompletionSource::new();
        let token = source.token();

        assert!(source.try_set_result(1));
        assert!(!source.try_set_result(2));
        assert!(!source.try_set_exception(Fault::msg("late")));

        assert_eq!(source.get_result(token).unwrap(), 1);
    }

    #[test]
    fn test_source_fault_and_cancellation() {
        let faulted: CompletionSource<u32> = CompletionSource::new();
        assert!(faulted.try_set_exception(Fault::msg("boom")));
        assert_eq!(faulted.status_unchecked(), Status::Faulted);
        let err = faulted.get_result(faulted.token()).unwrap_err();
        assert!(matches!(err, SourceError::Faulted(_)));

        // A cancellation fault lands in Canceled, not Faulted.
        let canceled: CompletionSource<u32> = CompletionSource::new();
        assert!(canceled.try_set_exception(Fault::Canceled));
        assert_eq!(canceled.status_unchecked(), Status::Canceled);
    }

    #[test]
    fn test_source_result_before_completion_fails() {
        let source: CompletionSource<u32> = CompletionSource::new();
        let token = source.token();
        assert!(matches!(
            source.get_result(token),
            Err(SourceError::NotCompleted)
        ));
    }

    #[test]
    fn test_source_result_consumed_once() {
        let source: CompletionSource<u32> = CompletionSource::new();
        let token = source.token();
        source.try_set_result(5);

        assert_eq!(source.get_result(token).unwrap(), 5);
        assert!(matches!(
            source.get_result(token),
            Err(SourceError::AlreadyConsumed)
        ));
    }

    #[test]
    fn test_continuation_invoked_inline_by_completion() {
        let source: Arc<CompletionSource<u32>> = Arc::new(CompletionSource::new());
        let token = source.token();
        let fired = Arc::new(AtomicUsize::new(0));

        let observer = fired.clone();
        source
            .on_completed(move || {
                observer.fetch_add(1, Ordering::SeqCst);
            }, token)
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        assert!(source.try_set_result(9));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_continuation_after_completion_runs_immediately() {
        let source: CompletionSource<u32> = CompletionSource::new();
        let token = source.token();
        source.try_set_result(3);

        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        source
            .on_completed(move || {
                observer.fetch_add(1, Ordering::SeqCst);
            }, token)
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_continuation_registration_fails() {
        let source: CompletionSource<u32> = CompletionSource::new();
        let token = source.token();

        source.on_completed(|| {}, token).unwrap();
        assert!(matches!(
            source.on_completed(|| {}, token),
            Err(SourceError::ContinuationAlreadyRegistered)
        ));
    }

    #[test]
    fn test_stale_token_rejected_after_reset() {
        let source: CompletionSource<u32> = CompletionSource::new();
        let stale = source.token();

        source.try_set_result(1);
        source.get_result(stale).unwrap();
        source.reset().unwrap();

        // The same memory now represents a new operation; the old token
        // must be rejected everywhere.
        assert!(matches!(
            source.status(stale),
            Err(SourceError::StaleToken { .. })
        ));
        assert!(matches!(
            source.get_result(stale),
            Err(SourceError::StaleToken { .. })
        ));
        assert!(matches!(
            source.on_completed(|| {}, stale),
            Err(SourceError::StaleToken { .. })
        ));

        let fresh = source.token();
        assert_ne!(stale, fresh);
        assert_eq!(source.status(fresh).unwrap(), Status::Pending);
    }

    #[test]
    fn test_reset_with_registered_continuation_fails() {
        let source: CompletionSource<u32> = CompletionSource::new();
        let token = source.token();
        source.on_completed(|| {}, token).unwrap();

        assert!(matches!(
            source.reset(),
            Err(SourceError::ContinuationPending)
        ));

        // Once the continuation has fired, reset succeeds.
        source.try_set_result(1);
        source.get_result(token).unwrap();
        source.reset().unwrap();
    }

    #[test]
    fn test_simple_source_signal_and_consume() {
        let source = SimpleSource::new();
        let token = source.token();

        assert!(source.try_signal());
        assert!(!source.try_signal());
        source.consume(token).unwrap();

        source.reset().unwrap();
        assert!(matches!(
            source.consume(token),
            Err(SourceError::StaleToken { .. })
        ));
    }

    #[test]
    fn test_source_pool_recycles_reset_sources() {
        let registry = PoolRegistry::new();
        let pool: SourcePool<u32> = SourcePool::with_registry(4, &registry);

        let (source, token) = pool.acquire();
        source.try_set_result(11);
        assert_eq!(source.get_result(token).unwrap(), 11);
        assert!(pool.release(source).unwrap());
        assert_eq!(pool.pooled(), 1);

        // The recycled source comes back pending, with no stale result and
        // a fresh token.
        let (recycled, fresh) = pool.acquire();
        assert_eq!(pool.pooled(), 0);
        assert_eq!(recycled.status(fresh).unwrap(), Status::Pending);
        assert_ne!(fresh, token);
        assert!(matches!(
            recycled.get_result(token),
            Err(SourceError::StaleToken { .. })
        ));
    }

    #[test]
    fn test_source_pool_release_requires_consumable_state() {
        let pool: SourcePool<u32> = SourcePool::with_capacity(4);

        let (source, token) = pool.acquire();
        source.on_completed(|| {}, token).unwrap();

        // A source whose continuation never fired cannot be recycled.
        assert!(matches!(
            pool.release(source),
            Err(SourceError::ContinuationPending)
        ));
    }
}

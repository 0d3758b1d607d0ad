//! Cooperative cancellation
//!
//! A CancellationSource is held by whoever may decide to cancel some work, and
//! hands out CancellationTokens to the code which performs it. That code can
//! either poll the token, or register callbacks which fire when cancellation
//! is requested.
//!
//! Each registration fires at most once. It is disposed either after it
//! fired, or when the returned Registration is disposed or dropped, whichever
//! comes first. Operations which register on a token dispose of their
//! registration as soon as they complete, so that long-lived tokens do not
//! accumulate dead callbacks.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;


type Callback = Box<dyn FnOnce() + Send + 'static>;


/// State shared between a source, its tokens and their registrations
struct TokenState {
    /// Set once cancellation has been requested
    canceled: AtomicBool,

    /// Pending callbacks, in registration order
    callbacks: Mutex<Vec<(u64, Callback)>>,

    /// Identifier of the next registration
    next_id: AtomicU64,
}
//
impl TokenState {
    fn unregister(&self, id: u64) -> bool {
        let removed = {
            let mut callbacks = self.callbacks.lock();
            let position = callbacks.iter().position(|(other, _)| *other == id);
            position.map(|index| callbacks.remove(index))
        };
        removed.is_some()
    }
}


/// Producer side of cancellation
pub struct CancellationSource {
    state: Arc<TokenState>,
}
//
impl CancellationSource {
    /// Create a new source, in the non-canceled state
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                canceled: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Token observing this source
    pub fn token(&self) -> CancellationToken {
        CancellationToken { state: Some(self.state.clone()) }
    }

    /// Request cancellation, firing all registered callbacks on this thread
    ///
    /// Only the first call has any effect.
    ///
    pub fn cancel(&self) {
        if self.state.canceled.swap(true, Ordering::AcqRel) {
            return;
        }

        // Callbacks may register or dispose things, so run them unlocked
        let callbacks = std::mem::take(&mut *self.state.callbacks.lock());
        trace!(callbacks = callbacks.len(), "cancellation requested");
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Check if cancellation was requested
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Acquire)
    }
}
//
impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}
//
impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CancellationSource")
         .field("canceled", &self.is_canceled())
         .finish()
    }
}


/// Consumer side of cancellation
#[derive(Clone, Default)]
pub struct CancellationToken {
    /// None for tokens which can never be canceled
    state: Option<Arc<TokenState>>,
}
//
impl CancellationToken {
    /// Token which is never canceled
    pub fn none() -> Self {
        Self { state: None }
    }

    /// Check if cancellation was requested
    pub fn is_canceled(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.canceled.load(Ordering::Acquire))
    }

    /// Check if this token could ever be canceled
    pub fn can_be_canceled(&self) -> bool {
        self.state.is_some()
    }

    /// Register a callback to be run when cancellation is requested
    ///
    /// If cancellation was already requested, the callback runs immediately
    /// on the calling thread and the returned registration is inert.
    ///
    pub fn register<F>(&self, callback: F) -> Registration
        where F: FnOnce() + Send + 'static
    {
        let Some(state) = &self.state else {
            return Registration::inert();
        };

        let id = state.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = state.callbacks.lock();
            if !state.canceled.load(Ordering::Acquire) {
                callbacks.push((id, Box::new(callback)));
                return Registration { state: Some(state.clone()), id };
            }
        }
        callback();
        Registration::inert()
    }

    /// Number of registrations which have neither fired nor been disposed
    pub fn pending_registrations(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.callbacks.lock().len())
    }
}
//
impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CancellationToken")
         .field("can_be_canceled", &self.can_be_canceled())
         .field("canceled", &self.is_canceled())
         .finish()
    }
}


/// Handle to a callback registered on a CancellationToken
///
/// Dropping the registration disposes of it.
///
#[must_use = "dropping a registration immediately disposes of it"]
pub struct Registration {
    state: Option<Arc<TokenState>>,
    id: u64,
}
//
impl Registration {
    fn inert() -> Self {
        Self { state: None, id: 0 }
    }

    /// Unregister the callback if it has not fired yet
    ///
    /// Returns true if the callback was still pending. Disposing more than
    /// once is harmless.
    ///
    pub fn dispose(&mut self) -> bool {
        self.state
            .take()
            .is_some_and(|state| state.unregister(self.id))
    }
}
//
impl Drop for Registration {
    fn drop(&mut self) {
        self.dispose();
    }
}
//
impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registration")
         .field("id", &self.id)
         .field("disposed", &self.state.is_none())
         .finish()
    }
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Callbacks fire once, in registration order
    #[test]
    fn fire_in_order() {
        let source = CancellationSource::new();
        let token = source.token();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l1 = log.clone();
        let _r1 = token.register(move || l1.lock().push(1));
        let l2 = log.clone();
        let _r2 = token.register(move || l2.lock().push(2));
        assert_eq!(token.pending_registrations(), 2);

        source.cancel();
        source.cancel();
        assert!(token.is_canceled());
        assert_eq!(*log.lock(), [1, 2]);
        assert_eq!(token.pending_registrations(), 0);
    }

    /// Registering on a canceled token runs the callback right away
    #[test]
    fn register_after_cancel() {
        let source = CancellationSource::new();
        source.cancel();
        let fired = Arc::new(AtomicUsize::new(0));
        let c_fired = fired.clone();
        let mut registration = source.token().register(move || {
            c_fired.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(!registration.dispose());
    }

    /// Disposed callbacks never fire and do not leak
    #[test]
    fn dispose_before_cancel() {
        let source = CancellationSource::new();
        let token = source.token();
        let fired = Arc::new(AtomicUsize::new(0));
        let c_fired = fired.clone();
        let mut registration = token.register(move || {
            c_fired.fetch_add(1, Ordering::Relaxed);
        });
        assert!(registration.dispose());
        assert!(!registration.dispose());
        assert_eq!(token.pending_registrations(), 0);

        {
            let _dropped = token.register(|| panic!("disposed on drop"));
        }
        assert_eq!(token.pending_registrations(), 0);

        source.cancel();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    /// The "none" token never fires anything
    #[test]
    fn none_token() {
        let token = CancellationToken::none();
        assert!(!token.can_be_canceled());
        assert!(!token.is_canceled());
        let _registration = token.register(|| panic!("never canceled"));
        assert_eq!(token.pending_registrations(), 0);
    }
}

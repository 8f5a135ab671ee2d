//! In-flight call handles.
//!
//! A [`Call`] is handed to the caller when a request is sent. It settles
//! exactly once: the first response delivered wins and later deliveries for
//! the same call are dropped. Waiters block on a condvar; an optional
//! callback is taken out on completion so the deliverer can run it off the
//! settling thread.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::codec::{CallId, Response};
use crate::error::Error;
use crate::trace::debug;

/// Completion callback registered with [`Call::with_callback`].
pub type Callback = Box<dyn FnOnce(Response) + Send>;

struct CallInner {
    slot: Mutex<Option<Response>>,
    cond: Condvar,
    callback: Mutex<Option<Callback>>,
}

/// Handle to a request awaiting its response.
#[derive(Clone)]
pub struct Call {
    id: CallId,
    inner: Arc<CallInner>,
}

impl Call {
    #[must_use]
    pub fn new(id: CallId) -> Self {
        Call {
            id,
            inner: Arc::new(CallInner {
                slot: Mutex::new(None),
                cond: Condvar::new(),
                callback: Mutex::new(None),
            }),
        }
    }

    /// Creates a call that invokes `callback` when the response arrives.
    /// The callback runs at most once, on the delivering worker thread.
    #[must_use]
    pub fn with_callback(id: CallId, callback: impl FnOnce(Response) + Send + 'static) -> Self {
        let call = Call::new(id);
        *call.inner.callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(callback));
        call
    }

    #[must_use]
    pub fn id(&self) -> &CallId {
        &self.id
    }

    /// Settles the call with `response`. The first delivery wins; a second
    /// delivery for the same call is dropped.
    ///
    /// Returns the registered callback (if any) so the caller can schedule
    /// it, paired with a clone of the winning response.
    pub fn complete(&self, response: Response) -> Option<(Callback, Response)> {
        let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            debug!(id = %self.id, "dropping duplicate response");
            return None;
        }
        *slot = Some(response.clone());
        drop(slot);
        self.inner.cond.notify_all();
        self.inner
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|cb| (cb, response))
    }

    /// Blocks until the call settles or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WaitTimeout`] if no response arrived in time.
    pub fn wait(&self, timeout: Duration) -> Result<Response, Error> {
        let slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        let (slot, result) = self
            .inner
            .cond
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(|e| e.into_inner());
        if result.timed_out() && slot.is_none() {
            return Err(Error::WaitTimeout);
        }
        // settled; the slot is never cleared once written
        Ok(slot.clone().ok_or(Error::WaitTimeout)?)
    }

    /// Returns the response if the call already settled.
    #[must_use]
    pub fn try_response(&self) -> Option<Response> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("done", &self.is_done())
            .finish()
    }
}

/// One-shot latch for lifecycle events (session ready, close finished).
#[derive(Clone, Default)]
pub struct Completion {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Completion {
    #[must_use]
    pub fn new() -> Self {
        Completion::default()
    }

    pub fn complete(&self) {
        let (lock, cond) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cond.notify_all();
    }

    /// Waits for the latch, returning `false` on timeout.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cond) = &*self.inner;
        let done = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (done, _) = cond
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(|e| e.into_inner());
        *done
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use serde_json::json;

    use super::*;

    fn response(n: i64) -> Response {
        Response {
            id: json!(1),
            result: Some(json!(n)),
            error: None,
        }
    }

    #[test]
    fn first_response_wins() {
        let call = Call::new(CallId::from(&json!(1)));
        assert!(call.complete(response(1)).is_none());
        assert!(call.complete(response(2)).is_none());
        assert_eq!(call.try_response().unwrap().result, Some(json!(1)));
    }

    #[test]
    fn wait_unblocks_on_complete() {
        let call = Call::new(CallId::from(&json!("a")));
        let waiter = call.clone();
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        call.complete(response(7));
        let got = handle.join().unwrap().unwrap();
        assert_eq!(got.result, Some(json!(7)));
    }

    #[test]
    fn wait_times_out() {
        let call = Call::new(CallId::from(&json!(1)));
        let err = call.wait(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, Error::WaitTimeout));
    }

    #[test]
    fn callback_taken_once() {
        let call = Call::with_callback(CallId::from(&json!(1)), |_| {});
        let first = call.complete(response(1));
        assert!(first.is_some());
        let again = Call::new(CallId::from(&json!(2)));
        assert!(again.complete(response(2)).is_none());
    }

    #[test]
    fn completion_latch() {
        let c = Completion::new();
        assert!(!c.is_complete());
        assert!(!c.wait(Duration::from_millis(10)));
        c.complete();
        assert!(c.wait(Duration::from_millis(10)));
        assert!(c.is_complete());
    }
}

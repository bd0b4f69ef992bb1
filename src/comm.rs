//! Comm sub-protocol: a long-lived logical channel layered on top of a
//! kernel session's shell/iopub traffic, identified by a `comm_id`.
//!
//! A [`Comm`] is created either by the client (via
//! [`crate::session::KernelSession::connect_to_comm`], which sends
//! `comm_open`) or by the kernel (an inbound `comm_open`, dispatched to a
//! handler registered with `register_comm_target`). Either way it is then
//! driven purely by inbound `comm_msg`/`comm_close` traffic until it is
//! closed or disposed.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::error;

use crate::message::Message;
use crate::session::SessionShared;
use crate::Result;

/// Callback invoked with each inbound `comm_msg` for this comm.
pub type CommMsgCallback = Box<dyn FnMut(Message) + Send>;
/// Callback invoked once, when the comm closes (remotely or locally).
pub type CommCloseCallback = Box<dyn FnMut(Message) + Send>;

struct Inner {
    comm_id: String,
    target_name: String,
    session: Option<Weak<SessionShared>>,
    on_msg: Option<CommMsgCallback>,
    on_close: Option<CommCloseCallback>,
    disposed: bool,
}

/// A logical sub-channel identified by `comm_id`, multiplexed over a
/// session's shell and iopub traffic.
///
/// Cloning a `Comm` shares the same underlying state.
#[derive(Clone)]
pub struct Comm {
    inner: Arc<Mutex<Inner>>,
}

impl Comm {
    pub(crate) fn new(comm_id: String, target_name: String, session: Weak<SessionShared>) -> Self {
        Comm {
            inner: Arc::new(Mutex::new(Inner {
                comm_id,
                target_name,
                session: Some(session),
                on_msg: None,
                on_close: None,
                disposed: false,
            })),
        }
    }

    /// This comm's id, assigned at open time (by whichever side opened it).
    pub fn comm_id(&self) -> String {
        self.inner.lock().unwrap().comm_id.clone()
    }

    /// The name of the target this comm is attached to.
    pub fn target_name(&self) -> String {
        self.inner.lock().unwrap().target_name.clone()
    }

    /// Whether this comm has been disposed (closed locally or remotely, or
    /// orphaned by its session going away).
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().unwrap().disposed
    }

    /// Set (or clear) the inbound message callback.
    pub fn on_msg(&self, cb: impl FnMut(Message) + Send + 'static) {
        self.inner.lock().unwrap().on_msg = Some(Box::new(cb));
    }

    /// Set (or clear) the close callback. Fires at most once.
    pub fn on_close(&self, cb: impl FnMut(Message) + Send + 'static) {
        self.inner.lock().unwrap().on_close = Some(Box::new(cb));
    }

    /// Send a `comm_open` for this comm. No-op (returns `Ok(None)`) if the
    /// comm or the owning session is gone.
    ///
    /// Unlike a request sent through [`crate::session::KernelSession`]'s
    /// shell operations, `comm_open` has no shell-level reply: the returned
    /// future (when present) completes on the following idle status, not on
    /// a typed reply.
    pub fn open(
        &self,
        data: Value,
        metadata: BTreeMap<String, Value>,
    ) -> Result<Option<crate::future::KernelFuture>> {
        let (comm_id, target_name, session) = {
            let inner = self.inner.lock().unwrap();
            if inner.disposed {
                return Ok(None);
            }
            let Some(session) = inner.session.as_ref().and_then(Weak::upgrade) else {
                return Ok(None);
            };
            (inner.comm_id.clone(), inner.target_name.clone(), session)
        };
        if session.is_dead() {
            return Ok(None);
        }
        let content = serde_json::json!({
            "comm_id": comm_id,
            "target_name": target_name,
            "data": data,
        });
        let msg = session.build_shell_message(crate::message::KernelMessageType::CommOpen, content, metadata);
        let fut = session.send_shell_message(msg, false, true)?;
        Ok(Some(fut))
    }

    /// Send a `comm_msg` on this comm. No-op if the comm or the kernel is
    /// disposed/dead.
    pub fn send(
        &self,
        data: Value,
        metadata: BTreeMap<String, Value>,
    ) -> Result<Option<crate::future::KernelFuture>> {
        let (comm_id, session) = {
            let inner = self.inner.lock().unwrap();
            if inner.disposed {
                return Ok(None);
            }
            let Some(session) = inner.session.as_ref().and_then(Weak::upgrade) else {
                return Ok(None);
            };
            (inner.comm_id.clone(), session)
        };
        if session.is_dead() {
            return Ok(None);
        }
        let content = serde_json::json!({ "comm_id": comm_id, "data": data });
        let msg = session.build_shell_message(crate::message::KernelMessageType::CommMsg, content, metadata);
        let fut = session.send_shell_message(msg, false, true)?;
        Ok(Some(fut))
    }

    /// Send a `comm_close` on this comm, then synthesize a local iopub-shaped
    /// `comm_close` message and dispatch it immediately, so `on_close` fires
    /// and the comm disposes without waiting for the round trip to the
    /// server. Idempotent: a no-op if already disposed.
    pub fn close(&self, data: Value, metadata: BTreeMap<String, Value>) -> Result<()> {
        let (comm_id, session) = {
            let inner = self.inner.lock().unwrap();
            if inner.disposed {
                return Ok(());
            }
            let session = inner.session.as_ref().and_then(Weak::upgrade);
            (inner.comm_id.clone(), session)
        };

        // Even with no session left to tell (it's already gone), the comm
        // still disposes locally rather than lingering forever.
        let (username, client_id) = match &session {
            Some(session) if !session.is_dead() => {
                let content = serde_json::json!({ "comm_id": comm_id, "data": data.clone() });
                let msg = session.build_shell_message(
                    crate::message::KernelMessageType::CommClose,
                    content,
                    metadata,
                );
                // Best-effort: a closed comm moving on is more important than
                // a queueing failure here.
                let _ = session.enqueue(msg);
                (session.username(), session.client_id().to_string())
            }
            Some(session) => (session.username(), session.client_id().to_string()),
            None => (String::new(), String::new()),
        };

        let local = Message::new(
            crate::message::KernelMessageType::CommClose,
            crate::message::Channel::IoPub,
            username,
            client_id,
            serde_json::json!({ "comm_id": comm_id, "data": data }),
        );
        self.dispatch_close(local);
        Ok(())
    }

    /// Deliver an inbound `comm_msg` to this comm's callback. A panic inside
    /// the callback is caught and logged rather than propagated.
    pub(crate) fn dispatch_msg(&self, msg: Message) {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed {
            return;
        }
        if let Some(cb) = inner.on_msg.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| cb(msg))).is_err() {
                error!("comm on_msg callback panicked");
            }
        }
    }

    /// Deliver a `comm_close` (remote or locally synthesized), then dispose.
    pub(crate) fn dispatch_close(&self, msg: Message) {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed {
            return;
        }
        if let Some(cb) = inner.on_close.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| cb(msg))).is_err() {
                error!("comm on_close callback panicked");
            }
        }
        drop(inner);
        self.dispose();
    }

    /// Clear callbacks, drop the session back-reference, and unregister
    /// from the owning session's comm registry. Idempotent.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        inner.on_msg = None;
        inner.on_close = None;
        let comm_id = inner.comm_id.clone();
        if let Some(session) = inner.session.take().and_then(|w| w.upgrade()) {
            session.forget_comm(&comm_id);
        }
    }
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Comm")
            .field("comm_id", &inner.comm_id)
            .field("target_name", &inner.target_name)
            .field("disposed", &inner.disposed)
            .finish()
    }
}

/// Handler invoked when the kernel opens a comm on a registered target. If
/// it returns `Err`, the comm is closed locally and the error is logged
/// rather than propagated, so one misbehaving target cannot break dispatch
/// for the rest of the session.
pub type TargetHandler = Arc<
    dyn Fn(Comm, Message) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// A handle returned by `register_comm_target`, used to deregister the
/// target later.
pub struct TargetRegistration {
    pub(crate) session: Weak<SessionShared>,
    pub(crate) name: String,
}

impl TargetRegistration {
    /// Remove this target from the session's registry. A no-op if the
    /// session is already gone.
    pub fn deregister(self) {
        if let Some(session) = self.session.upgrade() {
            session.deregister_target(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn orphan_comm(comm_id: &str, target_name: &str) -> Comm {
        // A Weak with no live Arc behind it: exercises the same
        // session-is-gone path as a comm outliving its session.
        Comm::new(comm_id.to_string(), target_name.to_string(), Weak::new())
    }

    fn local_close_message(comm_id: &str) -> Message {
        Message::new(
            crate::message::KernelMessageType::CommClose,
            crate::message::Channel::IoPub,
            "tester".to_string(),
            "client-1".to_string(),
            serde_json::json!({ "comm_id": comm_id, "data": {} }),
        )
    }

    fn local_msg_message(comm_id: &str) -> Message {
        Message::new(
            crate::message::KernelMessageType::CommMsg,
            crate::message::Channel::IoPub,
            "tester".to_string(),
            "client-1".to_string(),
            serde_json::json!({ "comm_id": comm_id, "data": {} }),
        )
    }

    #[test]
    fn accessors_reflect_construction() {
        let comm = orphan_comm("abc", "my.target");
        assert_eq!(comm.comm_id(), "abc");
        assert_eq!(comm.target_name(), "my.target");
        assert!(!comm.is_disposed());
    }

    #[test]
    fn dispatch_msg_invokes_on_msg_callback() {
        let comm = orphan_comm("abc", "my.target");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        comm.on_msg(move |_msg| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        comm.dispatch_msg(local_msg_message("abc"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!comm.is_disposed());
    }

    #[test]
    fn dispatch_close_fires_callback_once_and_disposes() {
        let comm = orphan_comm("abc", "my.target");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        comm.on_close(move |_msg| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        comm.dispatch_close(local_close_message("abc"));
        assert!(comm.is_disposed());
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // A second close (e.g. a racing remote comm_close arriving after the
        // local synthesized one) must not fire the callback again.
        comm.dispatch_close(local_close_message("abc"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_msg_after_dispose_is_ignored() {
        let comm = orphan_comm("abc", "my.target");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        comm.on_msg(move |_msg| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        comm.dispose();
        comm.dispatch_msg(local_msg_message("abc"));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispose_is_idempotent() {
        let comm = orphan_comm("abc", "my.target");
        comm.dispose();
        comm.dispose();
        assert!(comm.is_disposed());
    }

    #[test]
    fn panicking_on_msg_callback_is_caught() {
        let comm = orphan_comm("abc", "my.target");
        comm.on_msg(|_msg| panic!("boom"));
        // Must not unwind out of dispatch_msg.
        comm.dispatch_msg(local_msg_message("abc"));
        assert!(!comm.is_disposed());
    }

    #[test]
    fn open_send_close_are_noops_without_a_live_session() {
        let comm = orphan_comm("abc", "my.target");
        assert!(comm.open(serde_json::json!({}), BTreeMap::new()).unwrap().is_none());
        assert!(comm.send(serde_json::json!({}), BTreeMap::new()).unwrap().is_none());
        // close() still synthesizes the local close and disposes even though
        // there is no session to send the real comm_close to.
        comm.close(serde_json::json!({}), BTreeMap::new()).unwrap();
        assert!(comm.is_disposed());
    }

    #[test]
    fn debug_impl_does_not_panic() {
        let comm = orphan_comm("abc", "my.target");
        let rendered = format!("{comm:?}");
        assert!(rendered.contains("abc"));
    }
}

//! Per-request state machine tracking a shell (or control) exchange through
//! its reply and the terminating idle status.
//!
//! A [`KernelFuture`] is created when a session sends a request and is
//! driven purely by [`KernelFuture::route`], called from the session's
//! dispatch loop for every inbound message whose `parent_header.msg_id`
//! matches. Three monotonic flags (`got_reply`, `got_idle`, `is_done`) track
//! completion; see [`KernelFuture::is_done`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::message::{Channel, Message, KernelMessageType};

/// Callback invoked with the shell (or control) reply to this request.
pub type ReplyCallback = Box<dyn FnMut(Message) + Send>;
/// Callback invoked with each iopub message addressed to this request, after
/// the hook stack has run and not suppressed it.
pub type IOPubCallback = Box<dyn FnMut(Message) + Send>;
/// Callback invoked with each stdin message (e.g. `input_request`) addressed
/// to this request.
pub type StdinCallback = Box<dyn FnMut(Message) + Send>;
/// Callback invoked exactly once, when the future transitions to done.
pub type DoneCallback = Box<dyn FnOnce() + Send>;
/// Predicate run against an iopub message before `on_iopub`. Returning
/// `false` suppresses this hook's lower neighbors and `on_iopub` itself for
/// that one message.
pub type IOPubHook = Box<dyn FnMut(&Message) -> bool + Send>;

/// Opaque handle identifying a registered iopub hook, for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HookId(u64);

struct Inner {
    parent: Message,
    expect_reply: bool,
    dispose_on_done: bool,
    got_reply: bool,
    got_idle: bool,
    is_done: bool,
    disposed: bool,
    on_reply: Option<ReplyCallback>,
    on_iopub: Option<IOPubCallback>,
    on_stdin: Option<StdinCallback>,
    on_done: Option<DoneCallback>,
    next_hook_id: u64,
    /// Most-recently-registered hook id first.
    hook_order: Vec<u64>,
    hooks: HashMap<u64, IOPubHook>,
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

/// State machine for one outstanding shell/control request.
///
/// Cloning a `KernelFuture` shares the same underlying state: the session
/// holds one clone to drive [`KernelFuture::route`], and the caller holds
/// another to register callbacks and hooks on.
#[derive(Clone)]
pub struct KernelFuture {
    inner: Arc<Mutex<Inner>>,
}

impl KernelFuture {
    /// Create a future tracking `parent`, the request message that was just
    /// sent. `unregister` is called exactly once, on dispose, and is
    /// expected to remove this future from the owning session's map.
    pub fn new(
        parent: Message,
        expect_reply: bool,
        dispose_on_done: bool,
        unregister: impl FnOnce() + Send + 'static,
    ) -> Self {
        KernelFuture {
            inner: Arc::new(Mutex::new(Inner {
                parent,
                expect_reply,
                dispose_on_done,
                got_reply: !expect_reply,
                got_idle: false,
                is_done: false,
                disposed: false,
                on_reply: None,
                on_iopub: None,
                on_stdin: None,
                on_done: None,
                next_hook_id: 0,
                hook_order: Vec::new(),
                hooks: HashMap::new(),
                unregister: Some(Box::new(unregister)),
            })),
        }
    }

    /// The request message this future is tracking.
    pub fn parent_message(&self) -> Message {
        self.inner.lock().unwrap().parent.clone()
    }

    /// Set (or clear) the reply callback.
    pub fn on_reply(&self, cb: impl FnMut(Message) + Send + 'static) {
        self.inner.lock().unwrap().on_reply = Some(Box::new(cb));
    }

    /// Set (or clear) the iopub callback.
    pub fn on_iopub(&self, cb: impl FnMut(Message) + Send + 'static) {
        self.inner.lock().unwrap().on_iopub = Some(Box::new(cb));
    }

    /// Set (or clear) the stdin callback.
    pub fn on_stdin(&self, cb: impl FnMut(Message) + Send + 'static) {
        self.inner.lock().unwrap().on_stdin = Some(Box::new(cb));
    }

    /// Set (or clear) the done callback. Fires at most once.
    pub fn on_done(&self, cb: impl FnOnce() + Send + 'static) {
        self.inner.lock().unwrap().on_done = Some(Box::new(cb));
    }

    /// Register an iopub hook. Most-recently-registered hooks run first. A
    /// hook added while a dispatch is in progress is deferred to the next
    /// message, since the currently-running dispatch already snapshotted the
    /// hook order.
    pub fn register_iopub_hook(&self, hook: impl FnMut(&Message) -> bool + Send + 'static) -> HookId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_hook_id;
        inner.next_hook_id += 1;
        inner.hook_order.insert(0, id);
        inner.hooks.insert(id, Box::new(hook));
        HookId(id)
    }

    /// Remove a previously registered hook. If a dispatch is mid-iteration
    /// over the hook stack, the removal takes effect immediately — the hook
    /// will not run for the message currently being dispatched.
    pub fn remove_iopub_hook(&self, id: HookId) {
        let mut inner = self.inner.lock().unwrap();
        inner.hooks.remove(&id.0);
        inner.hook_order.retain(|&x| x != id.0);
    }

    /// Whether this future has reached its terminal done state.
    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().is_done
    }

    /// Whether this future has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().unwrap().disposed
    }

    /// Route an inbound message whose `parent_header.msg_id` matches this
    /// future's request, dispatching it by channel per the state machine in
    /// the module docs.
    pub fn route(&self, msg: Message) {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed {
            return;
        }
        match msg.channel {
            Channel::Shell | Channel::Control => {
                if let Some(cb) = inner.on_reply.as_mut() {
                    cb(msg);
                }
                inner.got_reply = true;
                if inner.got_idle {
                    Self::transition_done(&mut inner);
                }
            }
            Channel::Stdin => {
                if let Some(cb) = inner.on_stdin.as_mut() {
                    cb(msg);
                }
            }
            Channel::IoPub => {
                let is_idle = is_status_idle(&msg);
                let suppressed = Self::run_hooks(&mut inner, &msg);
                if !suppressed {
                    if let Some(cb) = inner.on_iopub.as_mut() {
                        cb(msg);
                    }
                }
                if is_idle {
                    inner.got_idle = true;
                    if inner.got_reply {
                        Self::transition_done(&mut inner);
                    }
                }
            }
        }
    }

    /// Run the hook stack against `msg`, most-recently-registered first.
    /// Returns whether delivery to `on_iopub` should be suppressed.
    fn run_hooks(inner: &mut Inner, msg: &Message) -> bool {
        let snapshot = inner.hook_order.clone();
        for id in snapshot {
            let Some(hook) = inner.hooks.get_mut(&id) else {
                // Removed since the snapshot was taken; deactivated.
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| hook(msg))) {
                Ok(true) => continue,
                Ok(false) => return true,
                Err(_) => {
                    error!("iopub hook panicked, continuing with remaining hooks");
                    continue;
                }
            }
        }
        false
    }

    fn transition_done(inner: &mut Inner) {
        if inner.is_done {
            return;
        }
        inner.is_done = true;
        if let Some(cb) = inner.on_done.take() {
            cb();
        }
        if inner.dispose_on_done {
            Self::dispose_locked(inner);
        }
    }

    /// Clear all callbacks and the hook stack, and unregister from the
    /// owning session. Idempotent.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::dispose_locked(&mut inner);
    }

    fn dispose_locked(inner: &mut Inner) {
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        inner.on_reply = None;
        inner.on_iopub = None;
        inner.on_stdin = None;
        inner.on_done = None;
        inner.hooks.clear();
        inner.hook_order.clear();
        if let Some(cb) = inner.unregister.take() {
            cb();
        }
    }
}

fn is_status_idle(msg: &Message) -> bool {
    if msg.header.msg_type != KernelMessageType::Status {
        return false;
    }
    matches!(
        msg.content.get("execution_state").and_then(|v| v.as_str()),
        Some("idle")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::KernelMessageType;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn status_idle_msg(parent_id: &str) -> Message {
        Message::new(
            KernelMessageType::Status,
            Channel::IoPub,
            "u",
            "s",
            json!({"execution_state": "idle"}),
        )
        .with_parent(parent_header(parent_id))
    }

    fn status_busy_msg(parent_id: &str) -> Message {
        Message::new(
            KernelMessageType::Status,
            Channel::IoPub,
            "u",
            "s",
            json!({"execution_state": "busy"}),
        )
        .with_parent(parent_header(parent_id))
    }

    fn stream_msg(parent_id: &str) -> Message {
        Message::new(
            KernelMessageType::Stream,
            Channel::IoPub,
            "u",
            "s",
            json!({"name": "stdout", "text": "hi"}),
        )
        .with_parent(parent_header(parent_id))
    }

    fn shell_reply(parent_id: &str) -> Message {
        Message::new(
            KernelMessageType::ExecuteReply,
            Channel::Shell,
            "u",
            "s",
            json!({"status": "ok"}),
        )
        .with_parent(parent_header(parent_id))
    }

    fn parent_header(id: &str) -> crate::message::KernelHeader {
        crate::message::KernelHeader {
            msg_id: id.to_string(),
            session: "s".into(),
            username: "u".into(),
            date: time::OffsetDateTime::now_utc(),
            msg_type: KernelMessageType::ExecuteRequest,
            version: "5.0".into(),
        }
    }

    fn make_future(expect_reply: bool, dispose_on_done: bool) -> (KernelFuture, Arc<AtomicBool>) {
        let unregistered = Arc::new(AtomicBool::new(false));
        let flag = unregistered.clone();
        let parent = Message::new(
            KernelMessageType::ExecuteRequest,
            Channel::Shell,
            "u",
            "s",
            json!({}),
        );
        let fut = KernelFuture::new(parent, expect_reply, dispose_on_done, move || {
            flag.store(true, Ordering::SeqCst);
        });
        (fut, unregistered)
    }

    #[test]
    fn done_requires_both_reply_and_idle_when_expecting_reply() {
        let (fut, _) = make_future(true, false);
        let id = fut.parent_message().header.msg_id.clone();

        fut.route(status_busy_msg(&id));
        assert!(!fut.is_done());

        fut.route(status_idle_msg(&id));
        assert!(!fut.is_done(), "idle alone shouldn't finish when expecting a reply");

        fut.route(shell_reply(&id));
        assert!(fut.is_done());
    }

    #[test]
    fn done_on_idle_alone_when_not_expecting_reply() {
        let (fut, _) = make_future(false, false);
        let id = fut.parent_message().header.msg_id.clone();

        assert!(!fut.is_done());
        fut.route(status_idle_msg(&id));
        assert!(fut.is_done());
    }

    #[test]
    fn on_done_fires_exactly_once() {
        let (fut, _) = make_future(false, false);
        let id = fut.parent_message().header.msg_id.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        fut.on_done(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        fut.route(status_idle_msg(&id));
        // A second idle after done must not re-fire on_done (is_done is
        // monotonic and the state machine stays in its terminal state).
        fut.route(status_idle_msg(&id));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispose_on_done_unregisters_from_session() {
        let (fut, unregistered) = make_future(false, true);
        let id = fut.parent_message().header.msg_id.clone();
        fut.route(status_idle_msg(&id));
        assert!(fut.is_done());
        assert!(unregistered.load(Ordering::SeqCst));
        assert!(fut.is_disposed());
    }

    #[test]
    fn dispose_is_idempotent() {
        let (fut, unregistered) = make_future(false, false);
        fut.dispose();
        fut.dispose();
        assert!(unregistered.load(Ordering::SeqCst));
    }

    #[test]
    fn most_recently_registered_hook_runs_first_and_can_suppress() {
        let (fut, _) = make_future(true, false);
        let id = fut.parent_message().header.msg_id.clone();

        let h1_ran = Arc::new(AtomicBool::new(false));
        let h1_ran_c = h1_ran.clone();
        fut.register_iopub_hook(move |_msg| {
            h1_ran_c.store(true, Ordering::SeqCst);
            true
        });

        // H2 suppresses stream messages but lets status through.
        fut.register_iopub_hook(|msg| msg.header.msg_type != KernelMessageType::Stream);

        let iopub_calls = Arc::new(AtomicUsize::new(0));
        let iopub_calls_c = iopub_calls.clone();
        fut.on_iopub(move |_msg| {
            iopub_calls_c.fetch_add(1, Ordering::SeqCst);
        });

        fut.route(stream_msg(&id));
        assert!(
            !h1_ran.load(Ordering::SeqCst),
            "H2 (most recently registered) should run first and short-circuit H1"
        );
        assert_eq!(iopub_calls.load(Ordering::SeqCst), 0);

        fut.route(status_busy_msg(&id));
        assert!(h1_ran.load(Ordering::SeqCst), "status messages should still reach H1");
        assert_eq!(iopub_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_hook_is_deactivated_immediately() {
        let (fut, _) = make_future(true, false);
        let id = fut.parent_message().header.msg_id.clone();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_c = ran.clone();
        let hook_id = fut.register_iopub_hook(move |_| {
            ran_c.store(true, Ordering::SeqCst);
            true
        });
        fut.remove_iopub_hook(hook_id);

        fut.route(stream_msg(&id));
        assert!(!ran.load(Ordering::SeqCst));
    }
}

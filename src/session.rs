//! Kernel Session: the multiplexed websocket connection to one running
//! kernel, plus the request/reply and comm bookkeeping layered on top of it.
//!
//! A session owns exactly one websocket at a time. Inbound frames are
//! decoded and dispatched by a single background task (the closest
//! single-threaded-cooperative analogue available in Rust without building
//! a bespoke executor), so message ordering and the outbound-queue/ready
//! interplay documented below never race against each other. Public
//! mutating operations instead go through a short, synchronous
//! [`std::sync::Mutex`] critical section — never held across an `.await` —
//! to update shared queue/registry state before or after talking to that
//! task.
//!
//! Outbound sends are buffered in a FIFO queue whenever the session isn't
//! `ready` (see [`SessionStatus`]); once it is, the queue drains in order,
//! leaving a message at the head if its transmit fails so it's retried
//! rather than reordered behind later sends.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::comm::{Comm, TargetHandler, TargetRegistration};
use crate::future::{HookId, KernelFuture};
use crate::message::{Channel, KernelHeader, KernelMessageType, Message};
use crate::rest::RestClient;
use crate::types::{KernelInfoReply, KernelSpec};
use crate::{wire, Error, Result};

/// Default number of consecutive reconnect attempts before a session gives
/// up and transitions to [`SessionStatus::Dead`].
pub const DEFAULT_RECONNECT_LIMIT: u32 = 7;

const WS_SUBPROTOCOL: &str = "v1.kernel.websocket.jupyter.org";

/// The kernel session's status, derived from the kernel's own `status`
/// broadcasts plus a few session-local states the kernel never reports
/// (`unknown`, `restarting`, `reconnecting`, `dead`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// No status has been observed yet.
    Unknown,
    /// The kernel process is starting up.
    Starting,
    /// The kernel is idle, ready to accept requests.
    Idle,
    /// The kernel is busy executing a request.
    Busy,
    /// The kernel is being restarted.
    Restarting,
    /// The websocket dropped and a reconnect is in progress.
    Reconnecting,
    /// The session has given up; no further messages will be sent or
    /// received. Terminal.
    Dead,
}

impl SessionStatus {
    /// Whether the outbound queue should be allowed to drain while in this
    /// status.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Idle | SessionStatus::Busy
        )
    }

    fn parse_kernel_reported(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(SessionStatus::Starting),
            "idle" => Some(SessionStatus::Idle),
            "busy" => Some(SessionStatus::Busy),
            _ => None,
        }
    }
}

/// Events published by a session: status transitions, iopub traffic, and
/// messages that arrived addressed to nobody in particular.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The session's status changed.
    StatusChanged(SessionStatus),
    /// An iopub message was received (after status/comm handling ran).
    IOPubMessage(Message),
    /// A non-iopub message addressed to this client arrived but matched no
    /// registered future.
    UnhandledMessage(Message),
}

enum PendingCommMsg {
    Msg(Message),
    Close(Message),
}

/// Events produced by [`KernelSession::execute_and_stream`] for a single
/// cell run, folding the iopub traffic an execution normally scatters
/// across `on_iopub` callbacks into one ordered stream.
#[derive(Debug, Clone)]
pub enum RunCellEvent {
    /// Standard output from the kernel.
    Stdout(String),
    /// Standard error from the kernel.
    Stderr(String),
    /// Result of cell execution (i.e. if the last line is an expression).
    ExecuteResult(serde_json::Value),
    /// Display data in a MIME type (e.g. a matplotlib chart).
    DisplayData(serde_json::Value),
    /// Update previously-displayed data identified by a display id.
    UpdateDisplayData(serde_json::Value),
    /// Clear the output produced so far by this cell.
    ClearOutput(serde_json::Value),
    /// The cell raised an exception.
    Error(serde_json::Value),
}

struct SessionState {
    status: SessionStatus,
    ready: bool,
    pending_queue: VecDeque<Message>,
    outbound: Option<tokio::sync::mpsc::UnboundedSender<Message>>,
    reconnect_attempt: u32,
    generation: u64,
    cancel: Option<CancellationToken>,
    kernel_info: Option<KernelInfoReply>,
    spec: Option<KernelSpec>,
}

/// Shared state backing a [`KernelSession`], reachable from [`Comm`]s and
/// from the background dispatch task via `Weak`/`Arc` references.
pub struct SessionShared {
    client_id: String,
    username: String,
    kernel_id: String,
    kernel_name: String,
    reconnect_limit: u32,
    rest: RestClient,
    state: Mutex<SessionState>,
    futures: DashMap<String, KernelFuture>,
    comms: DashMap<String, Comm>,
    comm_open_inflight: DashMap<String, Arc<tokio::sync::Mutex<Vec<PendingCommMsg>>>>,
    targets: DashMap<String, TargetHandler>,
    message_hooks: DashMap<String, Vec<HookId>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionShared {
    /// The client id (shared `session` field value stamped into every
    /// outbound message header).
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The username stamped into outbound message headers.
    pub fn username(&self) -> String {
        self.username.clone()
    }

    /// The kernel id this session is attached to.
    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    /// The kernelspec name this session's kernel was started from.
    pub(crate) fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    /// Consecutive reconnect attempts before this session gives up.
    pub(crate) fn reconnect_limit(&self) -> u32 {
        self.reconnect_limit
    }

    /// The REST transport this session's kernel lives behind.
    pub(crate) fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.state.lock().unwrap().status
    }

    /// Whether the session has reached its terminal dead status.
    pub fn is_dead(&self) -> bool {
        self.status() == SessionStatus::Dead
    }

    fn set_status(self: &Arc<Self>, new: SessionStatus) {
        let (changed, became_ready) = {
            let mut state = self.state.lock().unwrap();
            if state.status == new {
                return;
            }
            let was_ready = state.ready;
            state.status = new;
            state.ready = new.is_ready();
            (true, !was_ready && state.ready)
        };
        if changed {
            let _ = self.events.send(SessionEvent::StatusChanged(new));
        }
        if became_ready {
            self.drain_pending();
        }
        if new == SessionStatus::Dead {
            self.dispose();
        }
    }

    fn drain_pending(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        loop {
            let Some(msg) = state.pending_queue.front().cloned() else {
                break;
            };
            let Some(tx) = state.outbound.clone() else {
                break;
            };
            if tx.send(msg).is_ok() {
                state.pending_queue.pop_front();
            } else {
                // Leave the message at the head; a future reconnect (which
                // installs a fresh `outbound` and re-evaluates readiness)
                // will retry it in order.
                break;
            }
        }
    }

    /// Enqueue a message for transmission with no future tracking attached.
    /// Buffers behind anything already pending if the session isn't ready.
    pub(crate) fn enqueue(self: &Arc<Self>, msg: Message) -> Result<()> {
        if self.is_dead() {
            return Err(Error::KernelDead);
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.ready {
                if let Some(tx) = state.outbound.clone() {
                    if state.pending_queue.is_empty() && tx.send(msg.clone()).is_ok() {
                        return Ok(());
                    }
                }
            }
            state.pending_queue.push_back(msg);
        }
        self.drain_pending();
        Ok(())
    }

    /// Build a shell-channel message with this session's username/client id
    /// stamped in, ready to hand to [`SessionShared::send_shell_message`] or
    /// [`SessionShared::enqueue`].
    pub(crate) fn build_shell_message(
        &self,
        msg_type: KernelMessageType,
        content: Value,
        metadata: BTreeMap<String, Value>,
    ) -> Message {
        Message::new(
            msg_type,
            Channel::Shell,
            self.username.clone(),
            self.client_id.clone(),
            content,
        )
        .with_metadata(metadata)
    }

    /// Register a future for `msg`'s `msg_id`, enqueue it, and return the
    /// future tracking its reply/idle lifecycle.
    pub(crate) fn send_shell_message(
        self: &Arc<Self>,
        msg: Message,
        expect_reply: bool,
        dispose_on_done: bool,
    ) -> Result<KernelFuture> {
        if self.is_dead() {
            return Err(Error::KernelDead);
        }
        let msg_id = msg.header.msg_id.clone();
        let weak = Arc::downgrade(self);
        let unregister_id = msg_id.clone();
        let fut = KernelFuture::new(msg.clone(), expect_reply, dispose_on_done, move || {
            if let Some(shared) = weak.upgrade() {
                shared.futures.remove(&unregister_id);
                shared.message_hooks.remove(&unregister_id);
            }
        });
        self.futures.insert(msg_id, fut.clone());
        self.enqueue(msg)?;
        Ok(fut)
    }

    pub(crate) fn forget_comm(&self, comm_id: &str) {
        self.comms.remove(comm_id);
    }

    pub(crate) fn deregister_target(&self, name: &str) {
        self.targets.remove(name);
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// A connected kernel session: the multiplexed shell/iopub/stdin/control
/// websocket for one running kernel.
///
/// Cloning a `KernelSession` shares the same underlying connection and
/// state.
#[derive(Clone)]
pub struct KernelSession {
    shared: Arc<SessionShared>,
}

impl KernelSession {
    /// Open a session against an already-running kernel: connects the
    /// websocket, sends the initial `kernel_info_request`, and resolves
    /// once the reply and following idle status have both arrived.
    pub async fn connect(
        rest: RestClient,
        kernel_id: impl Into<String>,
        kernel_name: impl Into<String>,
        username: impl Into<String>,
        client_id: Option<String>,
        reconnect_limit: Option<u32>,
    ) -> Result<Self> {
        let client_id = client_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (events_tx, _) = broadcast::channel(256);
        let shared = Arc::new(SessionShared {
            client_id: client_id.clone(),
            username: username.into(),
            kernel_id: kernel_id.into(),
            kernel_name: kernel_name.into(),
            reconnect_limit: reconnect_limit.unwrap_or(DEFAULT_RECONNECT_LIMIT),
            rest,
            state: Mutex::new(SessionState {
                status: SessionStatus::Unknown,
                ready: false,
                pending_queue: VecDeque::new(),
                outbound: None,
                reconnect_attempt: 0,
                generation: 0,
                cancel: None,
                kernel_info: None,
                spec: None,
            }),
            futures: DashMap::new(),
            comms: DashMap::new(),
            comm_open_inflight: DashMap::new(),
            targets: DashMap::new(),
            message_hooks: DashMap::new(),
            events: events_tx,
        });

        crate::registry::insert(client_id, Arc::downgrade(&shared));

        let session = KernelSession { shared };
        session.open_websocket_and_await_info().await?;
        Ok(session)
    }

    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        KernelSession { shared }
    }

    /// The kernel id this session is attached to.
    pub fn kernel_id(&self) -> &str {
        self.shared.kernel_id()
    }

    /// The client id stamped into every message this session sends.
    pub fn client_id(&self) -> &str {
        self.shared.client_id()
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Subscribe to this session's status/iopub/unhandled-message events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.subscribe()
    }

    /// The cached kernel-info reply, populated once on connect.
    pub fn kernel_info(&self) -> Option<KernelInfoReply> {
        self.shared.state.lock().unwrap().kernel_info.clone()
    }

    /// Fetch (and cache) this kernel's kernelspec.
    pub async fn kernel_spec(&self) -> Result<KernelSpec> {
        if let Some(spec) = self.shared.state.lock().unwrap().spec.clone() {
            return Ok(spec);
        }
        let spec = self
            .shared
            .rest
            .get_kernelspec(&self.shared.kernel_name)
            .await?
            .ok_or_else(|| Error::NoSuchKernel(self.shared.kernel_name.clone()))?;
        self.shared.state.lock().unwrap().spec = Some(spec.clone());
        Ok(spec)
    }

    async fn open_websocket_and_await_info(&self) -> Result<()> {
        let shared = self.shared.clone();
        let generation = {
            let mut state = shared.state.lock().unwrap();
            state.generation += 1;
            state.generation
        };

        let ws_url = shared
            .rest
            .websocket_url(&shared.kernel_id, &shared.client_id)?;
        let mut req = ws_url
            .as_str()
            .into_client_request()
            .map_err(Error::WebSocket)?;
        req.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(WS_SUBPROTOCOL),
        );
        if !shared.rest.token().is_empty() {
            req.headers_mut().insert(
                AUTHORIZATION,
                format!("token {}", shared.rest.token())
                    .parse::<HeaderValue>()
                    .map_err(|_| Error::InvalidResponse("invalid token header".to_string()))?,
            );
        }

        let (ws, _resp) = tokio_tungstenite::connect_async(req).await?;
        let (mut ws_sink, mut ws_stream) = ws.split();

        let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let cancel = CancellationToken::new();

        {
            let mut state = shared.state.lock().unwrap();
            if state.generation != generation {
                // Superseded by a newer connect/reconnect before we finished.
                return Ok(());
            }
            state.cancel = Some(cancel.clone());
            state.outbound = Some(out_tx);
        }

        let send_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = send_cancel.cancelled() => break,
                    msg = out_rx.recv() => {
                        let Some(msg) = msg else { break };
                        match wire::to_ws_payload(&msg) {
                            Ok(payload) => {
                                if ws_sink.send(WsMessage::Binary(payload)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => error!("failed to encode outbound message: {err}"),
                        }
                    }
                }
            }
        });

        let recv_shared = shared.clone();
        let recv_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = recv_cancel.cancelled() => None,
                    next = ws_stream.next() => next,
                };
                let Some(frame) = next else { break };
                let payload = match frame {
                    Ok(WsMessage::Binary(payload)) => payload,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("websocket read error: {err}");
                        break;
                    }
                };
                match wire::from_ws_payload(&payload) {
                    Ok(msg) => dispatch(&recv_shared, msg).await,
                    Err(err) => warn!("dropping malformed frame: {err}"),
                }
            }
            on_socket_closed(recv_shared, generation);
        });

        shared.set_status(SessionStatus::Starting);

        // Flush anything already buffered, then send kernel_info_request
        // while briefly "ready", per the connect sequence. Readiness then
        // reverts to whatever the kernel's own status broadcasts drive it
        // to; in practice a busy/idle pair immediately follows.
        {
            let mut state = shared.state.lock().unwrap();
            state.ready = true;
        }
        shared.drain_pending();

        let info_msg = shared.build_shell_message(
            KernelMessageType::KernelInfoRequest,
            serde_json::json!({}),
            BTreeMap::new(),
        );
        let fut = shared.send_shell_message(info_msg, true, true)?;

        {
            let mut state = shared.state.lock().unwrap();
            state.ready = false;
        }

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        fut.on_reply(move |msg| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(msg);
            }
        });

        let reply = rx
            .await
            .map_err(|_| Error::InvalidResponse("kernel_info_reply never arrived".to_string()))?;
        let info: KernelInfoReply = reply
            .into_typed()
            .map_err(|_| Error::InvalidResponse("malformed kernel_info_reply".to_string()))?
            .content;
        shared.state.lock().unwrap().kernel_info = Some(info);
        {
            let mut state = shared.state.lock().unwrap();
            state.reconnect_attempt = 0;
        }
        Ok(())
    }

    /// Send a message on the shell channel and track it with a
    /// [`KernelFuture`].
    pub fn send_shell(&self, msg: Message, expect_reply: bool) -> Result<KernelFuture> {
        self.shared.send_shell_message(msg, expect_reply, false)
    }

    /// Send a message on the control channel (interrupt/shutdown-style
    /// requests, kept off the shell queue so they aren't stuck behind a
    /// long-running execute).
    pub fn send_control(&self, mut msg: Message, expect_reply: bool) -> Result<KernelFuture> {
        msg.channel = Channel::Control;
        self.shared.send_shell_message(msg, expect_reply, false)
    }

    /// Send an `input_reply` on the stdin channel, answering a pending
    /// `input_request`.
    pub fn send_input_reply(&self, value: String) -> Result<()> {
        let msg = Message::new(
            KernelMessageType::InputReply,
            Channel::Stdin,
            self.shared.username(),
            self.shared.client_id().to_string(),
            serde_json::json!({ "value": value }),
        );
        self.shared.enqueue(msg)
    }

    /// Execute a cell of code, returning the future tracking its reply and
    /// iopub traffic (stream output, display data, execute results, errors).
    ///
    /// `content` is merged over the documented defaults (`silent: false`,
    /// `store_history: true`, `user_expressions: {}`, `allow_stdin: true`,
    /// `stop_on_error: false`) — caller-supplied fields win. At minimum it
    /// should set `"code"`.
    pub fn execute(&self, content: Value, dispose_on_done: bool) -> Result<KernelFuture> {
        let merged = merge_over_defaults(
            serde_json::json!({
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": true,
                "stop_on_error": false,
            }),
            content,
        );
        let msg = self
            .shared
            .build_shell_message(KernelMessageType::ExecuteRequest, merged, BTreeMap::new());
        self.shared.send_shell_message(msg, true, dispose_on_done)
    }

    /// Send a `complete_request` (code completion at a cursor position) and
    /// await its reply content.
    pub async fn complete(&self, content: Value) -> Result<Value> {
        self.shell_request(KernelMessageType::CompleteRequest, content).await
    }

    /// Send an `inspect_request` (introspection/"doc string" lookup) and
    /// await its reply content.
    pub async fn inspect(&self, content: Value) -> Result<Value> {
        self.shell_request(KernelMessageType::InspectRequest, content).await
    }

    /// Send a `history_request` and await its reply content.
    pub async fn history(&self, content: Value) -> Result<Value> {
        self.shell_request(KernelMessageType::HistoryRequest, content).await
    }

    /// Send an `is_complete_request` (can this code be executed as-is, or
    /// does it need another line?) and await its reply content.
    pub async fn is_complete(&self, content: Value) -> Result<Value> {
        self.shell_request(KernelMessageType::IsCompleteRequest, content).await
    }

    /// Send a `comm_info_request` (enumerate open comms, optionally
    /// filtered by target name) and await its reply content.
    pub async fn comm_info(&self, content: Value) -> Result<Value> {
        self.shell_request(KernelMessageType::CommInfoRequest, content).await
    }

    /// Send a shell-channel request and resolve with its reply's raw
    /// content, per the `kernelInfo / complete / inspect / history /
    /// isComplete / commInfo` contract row: same failure modes as
    /// `sendShellMessage` (fails if the session is dead), plus a dead
    /// session's dispose running before the reply ever arrives.
    async fn shell_request(&self, msg_type: KernelMessageType, content: Value) -> Result<Value> {
        let msg = self.shared.build_shell_message(msg_type, content, BTreeMap::new());
        let fut = self.shared.send_shell_message(msg, true, true)?;

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        fut.on_reply(move |msg| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(msg.content);
            }
        });
        rx.await.map_err(|_| Error::KernelDead)
    }

    /// Run a cell and stream its iopub output as [`RunCellEvent`]s, rather
    /// than requiring the caller to register their own `on_iopub` hook.
    /// Convenience sugar built on top of [`KernelSession::execute`] and
    /// [`KernelFuture::on_iopub`]/`on_done` — not a replacement for them.
    ///
    /// The channel closes (further `recv` calls return `Err`) once the cell
    /// finishes, or — if the future is disposed early without reaching idle,
    /// e.g. because the kernel died mid-execution — as soon as that
    /// disposal drops this stream's callbacks.
    pub fn execute_and_stream(
        &self,
        code: impl Into<String>,
        silent: bool,
    ) -> Result<async_channel::Receiver<RunCellEvent>> {
        let fut = self.execute(
            serde_json::json!({ "code": code.into(), "silent": silent }),
            true,
        )?;
        let (tx, rx) = async_channel::unbounded();

        let tx_msg = tx.clone();
        fut.on_iopub(move |msg| {
            if msg.channel != Channel::IoPub {
                return;
            }
            let event = match msg.header.msg_type {
                KernelMessageType::Stream => {
                    let name = msg.content.get("name").and_then(|v| v.as_str()).unwrap_or("");
                    let text = msg
                        .content
                        .get("text")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if name == "stdout" {
                        Some(RunCellEvent::Stdout(text))
                    } else {
                        Some(RunCellEvent::Stderr(text))
                    }
                }
                // ExecuteInput just echoes the submitted code.
                KernelMessageType::ExecuteInput => None,
                KernelMessageType::ExecuteResult => Some(RunCellEvent::ExecuteResult(msg.content.clone())),
                KernelMessageType::DisplayData => Some(RunCellEvent::DisplayData(msg.content.clone())),
                KernelMessageType::UpdateDisplayData => {
                    Some(RunCellEvent::UpdateDisplayData(msg.content.clone()))
                }
                KernelMessageType::ClearOutput => Some(RunCellEvent::ClearOutput(msg.content.clone())),
                KernelMessageType::Error => Some(RunCellEvent::Error(msg.content.clone())),
                _ => None,
            };
            if let Some(event) = event {
                let _ = tx_msg.try_send(event);
            }
        });

        fut.on_done(move || {
            tx.close();
        });

        Ok(rx)
    }

    /// Ask the kernel to interrupt the cell it's currently running. Fails
    /// with [`Error::KernelDead`] once the session has reached the terminal
    /// `dead` status.
    pub async fn interrupt(&self) -> Result<()> {
        if self.shared.is_dead() {
            return Err(Error::KernelDead);
        }
        self.shared.rest.interrupt_kernel(&self.shared.kernel_id).await
    }

    /// Restart the kernel process in place. Transitions through
    /// `Restarting`, clears in-flight futures and comms (they can never
    /// complete against the new process), and reconnects. Fails with
    /// [`Error::KernelDead`] once the session has reached the terminal
    /// `dead` status — `dead` never transitions back out.
    pub async fn restart(&self) -> Result<()> {
        if self.shared.is_dead() {
            return Err(Error::KernelDead);
        }
        self.shared.set_status(SessionStatus::Restarting);
        self.clear_in_flight_state();
        self.shared.rest.restart_kernel(&self.shared.kernel_id).await?;
        self.reconnect().await
    }

    /// Shut the kernel down and dispose this session. The session is dead
    /// afterward; no further messages may be sent. Fails with
    /// [`Error::KernelDead`] if the session already reached `dead`.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shared.is_dead() {
            return Err(Error::KernelDead);
        }
        self.shared.rest.shutdown_kernel(&self.shared.kernel_id).await?;
        self.shared.set_status(SessionStatus::Dead);
        Ok(())
    }

    fn clear_in_flight_state(&self) {
        for entry in self.shared.futures.iter() {
            entry.value().dispose();
        }
        self.shared.futures.clear();
        for entry in self.shared.comms.iter() {
            entry.value().dispose();
        }
        self.shared.comms.clear();
        self.shared.comm_open_inflight.clear();
    }

    /// Manually close the current websocket and reconnect, resolving once a
    /// fresh `kernel_info_reply` arrives. Unlike the automatic reconnect
    /// path, this doesn't wait for a backoff delay.
    pub async fn reconnect(&self) -> Result<()> {
        self.shared.set_status(SessionStatus::Reconnecting);
        close_current_socket(&self.shared);
        self.open_websocket_and_await_info().await?;
        self.shared.set_status(SessionStatus::Idle);
        Ok(())
    }

    /// Register a handler for comms the kernel opens against `target_name`.
    /// Returns a handle that can later deregister it.
    pub fn register_comm_target(&self, target_name: impl Into<String>, handler: TargetHandler) -> TargetRegistration {
        let name = target_name.into();
        self.shared.targets.insert(name.clone(), handler);
        TargetRegistration {
            session: Arc::downgrade(&self.shared),
            name,
        }
    }

    /// Register an iopub hook on the future tracking `parent_msg_id`.
    /// Silently ignored (returns `None`) if no such future is outstanding.
    pub fn register_message_hook(
        &self,
        parent_msg_id: &str,
        hook: impl FnMut(&Message) -> bool + Send + 'static,
    ) -> Option<MessageHookHandle> {
        let fut = self.shared.futures.get(parent_msg_id)?;
        let hook_id = fut.register_iopub_hook(hook);
        self.shared
            .message_hooks
            .entry(parent_msg_id.to_string())
            .or_default()
            .push(hook_id);
        Some(MessageHookHandle {
            shared: Arc::downgrade(&self.shared),
            msg_id: parent_msg_id.to_string(),
            hook_id,
        })
    }

    /// Open a new comm against `target_name`, returning it immediately
    /// (the `comm_open` send happens separately via [`Comm::open`]).
    pub fn connect_to_comm(&self, target_name: impl Into<String>, comm_id: Option<String>) -> Comm {
        let comm_id = comm_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let comm = Comm::new(comm_id.clone(), target_name.into(), Arc::downgrade(&self.shared));
        self.shared.comms.insert(comm_id, comm.clone());
        comm
    }

    /// Dispose this session: cancel the websocket tasks, dispose all
    /// in-flight futures and comms, and remove it from the process-wide
    /// registry. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

impl SessionShared {
    fn dispose(self: &Arc<Self>) {
        close_current_socket(self);
        for entry in self.futures.iter() {
            entry.value().dispose();
        }
        self.futures.clear();
        for entry in self.comms.iter() {
            entry.value().dispose();
        }
        self.comms.clear();
        self.targets.clear();
        crate::registry::remove(&self.client_id);
    }
}

/// Merge `overrides` over `defaults`: fields present in `overrides` win,
/// everything else falls back to `defaults`. Both must be JSON objects, or
/// `overrides` is returned unchanged (nothing sensible to merge against a
/// non-object).
fn merge_over_defaults(defaults: Value, overrides: Value) -> Value {
    match (defaults, overrides) {
        (Value::Object(mut base), Value::Object(over)) => {
            base.extend(over);
            Value::Object(base)
        }
        (_, overrides) => overrides,
    }
}

fn close_current_socket(shared: &Arc<SessionShared>) {
    let mut state = shared.state.lock().unwrap();
    if let Some(cancel) = state.cancel.take() {
        cancel.cancel();
    }
    state.outbound = None;
    state.ready = false;
}

fn on_socket_closed(shared: Arc<SessionShared>, generation: u64) {
    let already_stale = {
        let state = shared.state.lock().unwrap();
        state.generation != generation || state.status == SessionStatus::Dead
    };
    if already_stale {
        return;
    }
    let attempt = {
        let mut state = shared.state.lock().unwrap();
        state.outbound = None;
        state.ready = false;
        state.reconnect_attempt
    };
    if attempt >= shared.reconnect_limit {
        error!("reconnect limit exhausted, kernel session is dead");
        shared.set_status(SessionStatus::Dead);
        return;
    }
    {
        let mut state = shared.state.lock().unwrap();
        state.reconnect_attempt = attempt + 1;
    }
    shared.set_status(SessionStatus::Reconnecting);
    let delay = Duration::from_secs(2u64.saturating_pow(attempt));
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if shared.is_dead() {
            return;
        }
        let session = KernelSession { shared: shared.clone() };
        if let Err(err) = session.open_websocket_and_await_info().await {
            warn!("automatic reconnect attempt {attempt} failed: {err}");
            on_socket_closed(shared, generation);
        } else {
            debug!("automatic reconnect succeeded after {attempt} attempt(s)");
        }
    });
}

async fn dispatch(shared: &Arc<SessionShared>, msg: Message) {
    let mut future_routed = false;
    if let Some(parent) = msg.parent_header.as_ref() {
        if let Some(fut) = shared.futures.get(&parent.msg_id) {
            fut.route(msg.clone());
            future_routed = true;
        }
    }

    if !future_routed
        && msg.channel != Channel::IoPub
        && msg
            .parent_header
            .as_ref()
            .map(|p| p.session == shared.client_id)
            .unwrap_or(false)
    {
        let _ = shared.events.send(SessionEvent::UnhandledMessage(msg.clone()));
    }

    if msg.channel == Channel::IoPub {
        match msg.header.msg_type {
            KernelMessageType::Status => {
                if let Some(state) = msg.content.get("execution_state").and_then(|v| v.as_str()) {
                    match SessionStatus::parse_kernel_reported(state) {
                        Some(status) => shared.set_status(status),
                        None => warn!("unrecognized kernel status {state:?}"),
                    }
                }
            }
            KernelMessageType::CommOpen => handle_comm_open(shared, msg.clone()).await,
            KernelMessageType::CommMsg => handle_comm_msg(shared, msg.clone()).await,
            KernelMessageType::CommClose => handle_comm_close(shared, msg.clone()).await,
            _ => {}
        }
        let _ = shared.events.send(SessionEvent::IOPubMessage(msg));
    }
}

async fn handle_comm_open(shared: &Arc<SessionShared>, msg: Message) {
    let Some(comm_id) = msg.content.get("comm_id").and_then(|v| v.as_str()).map(str::to_string) else {
        warn!("comm_open missing comm_id");
        return;
    };
    let Some(target_name) = msg
        .content
        .get("target_name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
    else {
        warn!("comm_open missing target_name");
        return;
    };
    let Some(handler) = shared.targets.get(&target_name).map(|h| h.clone()) else {
        warn!("no comm target registered for {target_name:?}, dropping comm_open");
        return;
    };

    let comm = Comm::new(comm_id.clone(), target_name, Arc::downgrade(shared));
    let inflight = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    shared.comm_open_inflight.insert(comm_id.clone(), inflight.clone());

    let shared = shared.clone();
    tokio::spawn(async move {
        match (*handler)(comm.clone(), msg).await {
            Ok(()) => {
                shared.comms.insert(comm_id.clone(), comm.clone());
            }
            Err(err) => {
                error!("comm_open handler for comm {comm_id} failed: {err}");
                comm.dispose();
            }
        }
        if let Some((_, inflight)) = shared.comm_open_inflight.remove(&comm_id) {
            for pending in inflight.lock().await.drain(..) {
                match pending {
                    PendingCommMsg::Msg(m) => comm.dispatch_msg(m),
                    PendingCommMsg::Close(m) => comm.dispatch_close(m),
                }
            }
        }
    });
}

async fn handle_comm_msg(shared: &Arc<SessionShared>, msg: Message) {
    let Some(comm_id) = msg.content.get("comm_id").and_then(|v| v.as_str()) else {
        return;
    };
    if let Some(inflight) = shared.comm_open_inflight.get(comm_id) {
        inflight.lock().await.push(PendingCommMsg::Msg(msg));
        return;
    }
    match shared.comms.get(comm_id) {
        Some(comm) => comm.dispatch_msg(msg),
        None => debug!("comm_msg for unknown comm_id {comm_id:?}"),
    }
}

async fn handle_comm_close(shared: &Arc<SessionShared>, msg: Message) {
    let Some(comm_id) = msg.content.get("comm_id").and_then(|v| v.as_str()) else {
        return;
    };
    if let Some(inflight) = shared.comm_open_inflight.get(comm_id) {
        inflight.lock().await.push(PendingCommMsg::Close(msg));
        return;
    }
    if let Some((_, comm)) = shared.comms.remove(comm_id) {
        comm.dispatch_close(msg);
    }
}

/// A handle returned by [`KernelSession::register_message_hook`], used to
/// remove the hook later.
pub struct MessageHookHandle {
    shared: Weak<SessionShared>,
    msg_id: String,
    hook_id: HookId,
}

impl MessageHookHandle {
    /// Remove this hook from its future, if the future or session are still
    /// alive.
    pub fn remove(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Some(fut) = shared.futures.get(&self.msg_id) {
            fut.remove_iopub_hook(self.hook_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_readiness_matches_spec() {
        assert!(SessionStatus::Starting.is_ready());
        assert!(SessionStatus::Idle.is_ready());
        assert!(SessionStatus::Busy.is_ready());
        assert!(!SessionStatus::Restarting.is_ready());
        assert!(!SessionStatus::Reconnecting.is_ready());
        assert!(!SessionStatus::Dead.is_ready());
        assert!(!SessionStatus::Unknown.is_ready());
    }

    #[test]
    fn parses_only_kernel_reported_statuses() {
        assert_eq!(
            SessionStatus::parse_kernel_reported("idle"),
            Some(SessionStatus::Idle)
        );
        assert_eq!(
            SessionStatus::parse_kernel_reported("busy"),
            Some(SessionStatus::Busy)
        );
        assert_eq!(SessionStatus::parse_kernel_reported("dead"), None);
        assert_eq!(SessionStatus::parse_kernel_reported("bogus"), None);
    }
}

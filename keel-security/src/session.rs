//! Notification session broker
//!
//! One task per monitored container. The task multiplexes the kernel
//! notification descriptor and the agent connection, forwards every
//! notification, and applies each verdict exactly once.

use futures::{SinkExt, StreamExt};
use keel_core::{ContainerId, Error, ProcessId, RuntimeEvent};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::notify::{Notification, NotifyChannel, Response};
use crate::protocol::{AgentMessage, RuntimeCodec, RuntimeMessage, Verdict, VerdictAction};

/// Lifecycle of a notification session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No filter installed yet
    Uninstalled,
    /// Filter installed, descriptor obtained
    ListenerInstalled,
    /// Notifications are being relayed
    Brokering,
    /// Pending notifications answered and descriptor released
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninstalled => "uninstalled",
            Self::ListenerInstalled => "listener-installed",
            Self::Brokering => "brokering",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The descriptor hung up: no task uses the filter any more
    ContainerExited,
    /// The agent closed its connection
    AgentDisconnected,
    /// Stopped by the bridge
    Stopped,
    /// The agent sent a malformed frame
    Protocol(String),
    /// Reading the descriptor failed
    Kernel(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContainerExited => f.write_str("container exited"),
            Self::AgentDisconnected => f.write_str("agent disconnected"),
            Self::Stopped => f.write_str("stopped"),
            Self::Protocol(message) => write!(f, "protocol error: {message}"),
            Self::Kernel(message) => write!(f, "descriptor error: {message}"),
        }
    }
}

/// Counters of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Container ID
    pub container_id: ContainerId,
    /// Why the session ended
    pub reason: CloseReason,
    /// Notifications forwarded to the agent
    pub forwarded: u64,
    /// Notifications answered with an agent verdict
    pub answered: u64,
    /// Notifications answered with the default deny at teardown
    pub denied: u64,
    /// Verdicts dropped because the kernel no longer knew the id
    pub stale: u64,
}

/// Broker for one container
pub struct NotificationSession<C, R, W> {
    container_id: ContainerId,
    pid: ProcessId,
    channel: C,
    reader: FramedRead<R, RuntimeCodec>,
    writer: FramedWrite<W, RuntimeCodec>,
    pending: HashMap<u64, Notification>,
    max_in_flight: usize,
    deny_errno: i32,
    state: watch::Sender<SessionState>,
    event_tx: Option<mpsc::Sender<RuntimeEvent>>,
    forwarded: u64,
    answered: u64,
    denied: u64,
    stale: u64,
}

impl<C, R, W> NotificationSession<C, R, W>
where
    C: NotifyChannel,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Create a session over an installed listener and an agent connection
    /// that already received the handoff
    pub fn new(
        container_id: ContainerId,
        pid: ProcessId,
        channel: C,
        agent_read: R,
        agent_write: W,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::ListenerInstalled);
        Self {
            container_id,
            pid,
            channel,
            reader: FramedRead::new(agent_read, RuntimeCodec::new()),
            writer: FramedWrite::new(agent_write, RuntimeCodec::new()),
            pending: HashMap::new(),
            max_in_flight: 256,
            deny_errno: libc::EPERM,
            state,
            event_tx: None,
            forwarded: 0,
            answered: 0,
            denied: 0,
            stale: 0,
        }
    }

    /// Bound on notifications awaiting a verdict
    #[must_use]
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// errno used for notifications answered at teardown or with an
    /// unusable verdict
    #[must_use]
    pub const fn with_deny_errno(mut self, errno: i32) -> Self {
        self.deny_errno = errno;
        self
    }

    /// Add event channel for emitting events
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::Sender<RuntimeEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Observe the session state
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Broker until the container exits, the agent disconnects or `stop`
    /// fires. Every pending notification is answered before the descriptor
    /// is dropped.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> SessionSummary {
        self.state.send_replace(SessionState::Brokering);
        self.emit(RuntimeEvent::SessionStarted {
            id: self.container_id.clone(),
            pid: self.pid,
            timestamp: SystemTime::now(),
        })
        .await;

        let reason = loop {
            if *stop.borrow_and_update() {
                break CloseReason::Stopped;
            }
            let accepting = self.pending.len() < self.max_in_flight;

            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break CloseReason::Stopped;
                    }
                }

                // Verdicts drain before new notifications are read
                message = self.reader.next() => match message {
                    Some(Ok(AgentMessage::Verdict(verdict))) => self.apply_verdict(verdict).await,
                    None => break CloseReason::AgentDisconnected,
                    Some(Err(Error::Protocol { message })) => break CloseReason::Protocol(message),
                    Some(Err(e)) => {
                        debug!(container_id = %self.container_id, error = %e, "Agent read failed");
                        break CloseReason::AgentDisconnected;
                    }
                },

                received = self.channel.recv(), if accepting => match received {
                    Ok(Some(notification)) => {
                        if let Err(e) = self.forward(notification).await {
                            debug!(
                                container_id = %self.container_id,
                                error = %e,
                                "Forwarding failed"
                            );
                            break CloseReason::AgentDisconnected;
                        }
                    }
                    Ok(None) => break CloseReason::ContainerExited,
                    Err(e) => {
                        warn!(
                            container_id = %self.container_id,
                            error = %e,
                            "Notification descriptor failed"
                        );
                        break CloseReason::Kernel(e.to_string());
                    }
                },
            }
        };

        self.teardown(reason).await
    }

    async fn forward(&mut self, notification: Notification) -> keel_core::Result<()> {
        debug!(
            container_id = %self.container_id,
            notification = notification.id,
            pid = notification.pid,
            syscall = notification.syscall,
            "Forwarding notification"
        );
        self.pending.insert(notification.id, notification);
        self.forwarded += 1;
        self.writer.send(RuntimeMessage::Notification(notification)).await
    }

    async fn apply_verdict(&mut self, verdict: Verdict) {
        let Some(notification) = self.pending.remove(&verdict.id) else {
            warn!(
                container_id = %self.container_id,
                notification = verdict.id,
                "Ignoring verdict for unknown or already answered notification"
            );
            return;
        };

        let response = match verdict.response() {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    container_id = %self.container_id,
                    notification = verdict.id,
                    error = %e,
                    "Denying notification with an unusable verdict"
                );
                self.deny(verdict.id).await;
                return;
            }
        };

        match self.channel.id_valid(verdict.id) {
            Ok(true) => {}
            Ok(false) => {
                self.record_stale(verdict.id).await;
                return;
            }
            Err(e) => {
                warn!(
                    container_id = %self.container_id,
                    notification = verdict.id,
                    error = %e,
                    "ID_VALID failed"
                );
                self.record_stale(verdict.id).await;
                return;
            }
        }

        if verdict.action == VerdictAction::Trap {
            #[allow(clippy::cast_possible_wrap)]
            let pid = Pid::from_raw(notification.pid as i32);
            if let Err(e) = kill(pid, Signal::SIGSYS) {
                warn!(
                    container_id = %self.container_id,
                    pid = notification.pid,
                    error = %e,
                    "Cannot deliver SIGSYS"
                );
            }
        }

        match self.channel.respond(response) {
            Ok(()) => {
                self.answered += 1;
                debug!(
                    container_id = %self.container_id,
                    notification = verdict.id,
                    action = ?verdict.action,
                    "Applied verdict"
                );
            }
            Err(Error::StaleNotification { id }) => self.record_stale(id).await,
            Err(e) => {
                warn!(
                    container_id = %self.container_id,
                    notification = verdict.id,
                    error = %e,
                    "Cannot apply verdict"
                );
            }
        }
    }

    async fn deny(&mut self, id: u64) {
        match self.channel.respond(Response::errno(id, self.deny_errno)) {
            Ok(()) => self.denied += 1,
            Err(Error::StaleNotification { id }) => self.record_stale(id).await,
            Err(e) => {
                warn!(
                    container_id = %self.container_id,
                    notification = id,
                    error = %e,
                    "Cannot deny notification"
                );
            }
        }
    }

    async fn record_stale(&mut self, id: u64) {
        self.stale += 1;
        self.emit(RuntimeEvent::StaleNotification {
            id: self.container_id.clone(),
            notification: id,
            timestamp: SystemTime::now(),
        })
        .await;
    }

    async fn teardown(mut self, reason: CloseReason) -> SessionSummary {
        let mut ids: Vec<u64> = self.pending.drain().map(|(id, _)| id).collect();
        ids.sort_unstable();

        for id in ids {
            match self.channel.respond(Response::errno(id, self.deny_errno)) {
                Ok(()) => self.denied += 1,
                Err(e) => debug!(
                    container_id = %self.container_id,
                    notification = id,
                    error = %e,
                    "Default deny not delivered"
                ),
            }
        }

        if reason != CloseReason::AgentDisconnected {
            let closed = RuntimeMessage::Closed {
                reason: reason.to_string(),
            };
            if let Err(e) = self.writer.send(closed).await {
                debug!(
                    container_id = %self.container_id,
                    error = %e,
                    "Agent missed the closed frame"
                );
            }
        }

        self.state.send_replace(SessionState::Closed);
        self.emit(RuntimeEvent::SessionClosed {
            id: self.container_id.clone(),
            reason: reason.to_string(),
            answered: self.answered,
            denied: self.denied,
            timestamp: SystemTime::now(),
        })
        .await;

        SessionSummary {
            container_id: self.container_id.clone(),
            reason,
            forwarded: self.forwarded,
            answered: self.answered,
            denied: self.denied,
            stale: self.stale,
        }
        // `self` drops here, releasing the descriptor after every answer
    }

    // Holds no borrow of `self` across the await
    fn emit(&self, event: RuntimeEvent) -> impl Future<Output = ()> + Send + 'static {
        event.emit_trace();
        let tx = self.event_tx.clone();
        async move {
            if let Some(tx) = tx {
                let _ = tx.send(event).await;
            }
        }
    }
}

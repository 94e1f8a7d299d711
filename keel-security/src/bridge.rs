//! Registry of notification sessions
//!
//! The [`Bridge`] owns one broker task per monitored container. A task
//! removes its own entry when it finishes; entries carry a generation so a
//! finished task never removes a newer session for the same container.

use keel_core::{ContainerId, Error, ProcessId, Result, RuntimeConfig, RuntimeEvent};
use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::agent::send_handoff;
use crate::notify::{KernelNotifyFd, NotifyChannel};
use crate::protocol::SessionMetadata;
use crate::session::{NotificationSession, SessionState, SessionSummary};

struct SessionEntry {
    generation: u64,
    stop: watch::Sender<bool>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<SessionSummary>,
}

type SessionMap = HashMap<ContainerId, SessionEntry>;

/// Upper bound on sending the `hello` frame
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

fn ensure_vacant(sessions: &SessionMap, id: &ContainerId) -> Result<()> {
    if let Some(existing) = sessions.get(id)
        && !existing.task.is_finished()
    {
        return Err(Error::InvalidConfig {
            message: format!("container {id} already has a notification session"),
        });
    }
    Ok(())
}

/// Session registry
pub struct Bridge {
    max_in_flight: usize,
    deny_errno: i32,
    agent_socket: Option<PathBuf>,
    sessions: Arc<Mutex<SessionMap>>,
    next_generation: AtomicU64,
    event_tx: Option<mpsc::Sender<RuntimeEvent>>,
}

impl Bridge {
    /// Create a bridge with the session settings of `config`
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight,
            deny_errno: config.default_deny_errno,
            agent_socket: config.agent_socket.clone(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            event_tx: None,
        }
    }

    /// Add event channel for emitting events
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::Sender<RuntimeEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start brokering between `channel` and an agent connection that
    /// already received the handoff. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `id` already has a live session
    pub fn attach<C, S>(
        &self,
        id: ContainerId,
        pid: ProcessId,
        channel: C,
        agent: S,
    ) -> Result<watch::Receiver<SessionState>>
    where
        C: NotifyChannel + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut sessions = self.lock();
        ensure_vacant(&sessions, &id)?;
        Ok(self.spawn_session(&mut sessions, id, pid, channel, agent))
    }

    fn spawn_session<C, S>(
        &self,
        sessions: &mut SessionMap,
        id: ContainerId,
        pid: ProcessId,
        channel: C,
        agent: S,
    ) -> watch::Receiver<SessionState>
    where
        C: NotifyChannel + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(agent);
        let mut session = NotificationSession::new(id.clone(), pid, channel, read, write)
            .with_max_in_flight(self.max_in_flight)
            .with_deny_errno(self.deny_errno);
        if let Some(tx) = &self.event_tx {
            session = session.with_events(tx.clone());
        }
        let state = session.subscribe();

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (stop, stop_rx) = watch::channel(false);
        let registry = Arc::clone(&self.sessions);
        let task_id = id.clone();

        let task = tokio::spawn(async move {
            let summary = session.run(stop_rx).await;
            let mut sessions = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if sessions.get(&task_id).is_some_and(|entry| entry.generation == generation) {
                sessions.remove(&task_id);
            }
            summary
        });

        info!(container_id = %id, pid = %pid, generation, "Attached notification session");
        sessions.insert(
            id,
            SessionEntry {
                generation,
                stop,
                state: state.clone(),
                task,
            },
        );
        state
    }

    /// Hand `listener` to the agent on `agent` and start brokering.
    ///
    /// The container's slot is checked before anything reaches the agent
    /// and stays held until the session is registered. The handoff is sent
    /// synchronously; the broker task then owns the descriptor. Must be
    /// called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns error if the container already has a session, the handoff
    /// fails, or the stream or descriptor cannot be registered
    pub fn start_session(
        &self,
        listener: OwnedFd,
        metadata: &SessionMetadata,
        agent: StdUnixStream,
    ) -> Result<watch::Receiver<SessionState>> {
        let mut sessions = self.lock();
        ensure_vacant(&sessions, &metadata.id)?;

        agent.set_nonblocking(false)?;
        agent.set_write_timeout(Some(HANDOFF_TIMEOUT))?;
        send_handoff(&agent, listener.as_fd(), metadata)?;
        agent.set_write_timeout(None)?;

        agent.set_nonblocking(true)?;
        let agent = UnixStream::from_std(agent)?;
        let channel = KernelNotifyFd::new(listener, self.deny_errno)?;

        let id = metadata.id.clone();
        Ok(self.spawn_session(&mut sessions, id, metadata.pid, channel, agent))
    }

    /// Connect to the configured agent socket and start a session
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if no agent socket is configured, or
    /// any error of [`Bridge::start_session`]
    pub fn connect_and_start(
        &self,
        listener: OwnedFd,
        metadata: &SessionMetadata,
    ) -> Result<watch::Receiver<SessionState>> {
        let path = self.agent_socket.as_ref().ok_or_else(|| Error::InvalidConfig {
            message: "no agent socket configured".to_string(),
        })?;
        let agent = StdUnixStream::connect(path)?;
        debug!(container_id = %metadata.id, socket = %path.display(), "Connected to agent");
        self.start_session(listener, metadata, agent)
    }

    /// Whether `id` has a session that has not closed yet
    #[must_use]
    pub fn is_alive(&self, id: &ContainerId) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|entry| *entry.state.borrow() != SessionState::Closed)
    }

    /// Current state of the session of `id`
    #[must_use]
    pub fn state(&self, id: &ContainerId) -> Option<SessionState> {
        self.lock().get(id).map(|entry| *entry.state.borrow())
    }

    /// Containers with a registered session, sorted
    #[must_use]
    pub fn sessions(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop the session of `id` and wait for its teardown. Returns `None`
    /// if no session is registered.
    ///
    /// # Errors
    /// Returns [`Error::TaskJoin`] if the broker task panicked
    pub async fn stop(&self, id: &ContainerId) -> Result<Option<SessionSummary>> {
        let Some(entry) = self.lock().remove(id) else {
            return Ok(None);
        };
        let _ = entry.stop.send(true);
        let summary = entry.task.await?;
        debug!(container_id = %id, reason = %summary.reason, "Stopped notification session");
        Ok(Some(summary))
    }

    /// Stop every session
    ///
    /// # Errors
    /// Returns [`Error::TaskJoin`] if a broker task panicked
    pub async fn shutdown(&self) -> Result<Vec<SessionSummary>> {
        let entries: Vec<SessionEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            let _ = entry.stop.send(true);
        }

        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            summaries.push(entry.task.await?);
        }
        summaries.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        info!(sessions = summaries.len(), "Notification bridge shut down");
        Ok(summaries)
    }
}

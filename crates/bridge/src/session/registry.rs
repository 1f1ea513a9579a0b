//! Session registry binding each connection to exactly one PTY process.
//!
//! The registry is the sole owner of every [`PtyProcess`]. Output is pumped
//! from the process to the [`SessionSink`] supplied by the owning connection,
//! so bytes can never reach a connection other than the one that created the
//! session.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use protocol::{CloseReason, TerminalSize, Utf8Decoder};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pty::{OutputStream, PtyError, PtyProcess, SessionStatus, SpawnOptions};

/// Unique identifier for a session.
pub type SessionId = String;

/// Unique identifier for a client connection.
pub type ConnectionId = String;

/// Errors returned by registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The connection has no live session.
    #[error("no session for connection {0}")]
    NotFound(ConnectionId),

    /// The configured session cap has been reached.
    #[error("session limit reached ({0} live sessions)")]
    LimitReached(usize),

    /// The underlying process failed.
    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// Notifications delivered to a session's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk of shell output.
    Output(String),
    /// The session is gone.
    Ended {
        /// The session that ended.
        session_id: SessionId,
        /// Why it ended.
        reason: CloseReason,
        /// Exit code of the shell, when known.
        exit_code: Option<i32>,
    },
}

/// Receiver of a session's output, implemented by the owning connection.
pub trait SessionSink: Send + Sync + 'static {
    /// Delivers an event. Returns `false` once the owner is gone.
    fn deliver(&self, event: SessionEvent) -> BoxFuture<'_, bool>;
}

/// Snapshot of a live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Connection that owns the session.
    pub connection_id: ConnectionId,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Current terminal geometry.
    pub size: TerminalSize,
    /// Whether the shell is still running.
    pub running: bool,
    /// Shell executable.
    pub shell: String,
    /// When the session was created.
    pub created_at: SystemTime,
    /// Time since the last input or output.
    pub idle: Duration,
}

/// Operations on the connection → session mapping.
///
/// Implementations must be safe under concurrent access from many
/// connections.
pub trait SessionRegistry: Send + Sync + 'static {
    /// Returns the connection's session, spawning one if there is none.
    fn get_or_create(
        &self,
        connection_id: &ConnectionId,
        size: TerminalSize,
        sink: Arc<dyn SessionSink>,
    ) -> impl Future<Output = Result<SessionInfo, RegistryError>> + Send;

    /// Writes input to the connection's session.
    fn write(
        &self,
        connection_id: &ConnectionId,
        data: &[u8],
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Resizes the connection's session.
    fn resize(
        &self,
        connection_id: &ConnectionId,
        size: TerminalSize,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Closes the connection's session and forgets it.
    ///
    /// Returns the exit status when a session existed.
    fn destroy(
        &self,
        connection_id: &ConnectionId,
    ) -> impl Future<Output = Option<SessionStatus>> + Send;

    /// Returns a snapshot of the connection's session.
    fn get(&self, connection_id: &ConnectionId) -> impl Future<Output = Option<SessionInfo>> + Send;

    /// Returns whether the connection has a session.
    fn contains(&self, connection_id: &ConnectionId) -> bool;

    /// Returns the number of live sessions.
    fn count(&self) -> usize;
}

/// A live shell bound to one connection.
struct Session {
    id: SessionId,
    connection_id: ConnectionId,
    pty: PtyProcess,
    shell: String,
    created_at: SystemTime,
    /// Unix milliseconds of the last input or output.
    last_activity: AtomicU64,
    /// Set when the registry ends the session for a reason the owner should hear about.
    end_reason: std::sync::Mutex<Option<CloseReason>>,
    /// Cancelled on teardown; stops the pump even if the terminal never reports EOF.
    ended: CancellationToken,
}

impl Session {
    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    fn set_end_reason(&self, reason: CloseReason) {
        *self.end_reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }

    fn end_reason(&self) -> Option<CloseReason> {
        *self.end_reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            pid: self.pty.pid(),
            size: self.pty.size().await,
            running: self.pty.is_running(),
            shell: self.shell.clone(),
            created_at: self.created_at,
            idle: self.idle(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Registry backed by real PTY processes.
pub struct PtySessionRegistry {
    /// Map of connection ID to its session.
    sessions: Arc<DashMap<ConnectionId, Arc<Session>>>,
    /// Live session count, including shells still being spawned.
    live: Arc<AtomicUsize>,
    /// Per-connection spawn locks, so a connection spawns at most one shell
    /// without holding a map shard across the fork.
    spawning: DashMap<ConnectionId, Arc<Mutex<()>>>,
    /// Template for new sessions; the geometry is supplied per call.
    template: SpawnOptions,
    /// Maximum number of concurrent sessions.
    max_sessions: usize,
}

impl PtySessionRegistry {
    /// Creates a registry spawning shells from `template`.
    pub fn new(template: SpawnOptions, max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            live: Arc::new(AtomicUsize::new(0)),
            spawning: DashMap::new(),
            template,
            max_sessions,
        }
    }

    /// Lists all live sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos
    }

    /// Ends every session idle for longer than `timeout`.
    ///
    /// Owners are told with a `terminal:closed` carrying
    /// [`CloseReason::IdleTimeout`]. Returns the number of sessions ended.
    pub async fn reap_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle() > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for connection_id in idle {
            if self
                .terminate(&connection_id, Some(CloseReason::IdleTimeout))
                .await
                .is_some()
            {
                tracing::info!(connection_id = %connection_id, "Reaped idle session");
                reaped += 1;
            }
        }
        reaped
    }

    /// Starts a background task that reaps idle sessions until `shutdown` fires.
    pub fn start_idle_reaper(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
        shutdown: CancellationToken,
    ) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.reap_idle(timeout).await;
                    }
                }
            }
            tracing::debug!("Idle reaper stopped");
        });
    }

    /// Ends every session, telling owners the server is shutting down.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<ConnectionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for connection_id in ids {
            if self
                .terminate(&connection_id, Some(CloseReason::Shutdown))
                .await
                .is_some()
            {
                closed += 1;
            }
        }
        tracing::info!(sessions = closed, "Closed all sessions");
        closed
    }

    /// Removes and closes a session. The owner hears about it only if `reason` is set.
    async fn terminate(
        &self,
        connection_id: &ConnectionId,
        reason: Option<CloseReason>,
    ) -> Option<SessionStatus> {
        let (_, session) = self.sessions.remove(connection_id)?;
        self.live.fetch_sub(1, Ordering::SeqCst);

        if let Some(reason) = reason {
            session.set_end_reason(reason);
        }
        session.ended.cancel();

        match session.pty.close().await {
            Ok(status) => {
                tracing::info!(
                    session_id = %session.id,
                    connection_id = %connection_id,
                    status = ?status,
                    "Session destroyed"
                );
                Some(status)
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    connection_id = %connection_id,
                    error = %e,
                    "Failed to close session process"
                );
                None
            }
        }
    }

    /// Spawns a shell for a connection that has none and starts its pump.
    ///
    /// Callers hold the connection's spawn slot.
    async fn spawn_session(
        &self,
        connection_id: &ConnectionId,
        size: TerminalSize,
        sink: Arc<dyn SessionSink>,
    ) -> Result<Arc<Session>, RegistryError> {
        if self.live.fetch_add(1, Ordering::SeqCst) >= self.max_sessions {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(RegistryError::LimitReached(self.max_sessions));
        }

        // Fork and exec block; keep them off the async workers.
        let options = self.template.clone().with_size(size);
        let spawned = tokio::task::spawn_blocking(move || PtyProcess::spawn(options))
            .await
            .map_err(|e| PtyError::Spawn(e.to_string()))
            .and_then(|spawned| spawned);
        let (pty, output) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.clone(),
            pty,
            shell: self.template.shell.clone(),
            created_at: SystemTime::now(),
            last_activity: AtomicU64::new(now_millis()),
            end_reason: std::sync::Mutex::new(None),
            ended: CancellationToken::new(),
        });
        self.sessions.insert(connection_id.clone(), Arc::clone(&session));

        tracing::info!(
            session_id = %session.id,
            connection_id = %connection_id,
            pid = ?session.pty.pid(),
            size = %size,
            "Created new session"
        );

        self.start_pump(Arc::clone(&session), output, sink);
        Ok(session)
    }

    fn lookup(&self, connection_id: &ConnectionId) -> Result<Arc<Session>, RegistryError> {
        self.sessions
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::NotFound(connection_id.clone()))
    }

    /// Forwards output to the owner until the process exits, then cleans up.
    fn start_pump(
        &self,
        session: Arc<Session>,
        mut output: OutputStream,
        sink: Arc<dyn SessionSink>,
    ) {
        let sessions = Arc::clone(&self.sessions);
        let live = Arc::clone(&self.live);

        tokio::spawn(async move {
            let mut decoder = Utf8Decoder::new();
            let mut owner_gone = false;

            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = session.ended.cancelled() => None,
                    chunk = output.recv() => chunk,
                };
                let Some(chunk) = chunk else { break };
                session.touch();
                let text = decoder.decode(&chunk);
                if text.is_empty() {
                    continue;
                }
                if !sink.deliver(SessionEvent::Output(text)).await {
                    owner_gone = true;
                    break;
                }
            }

            // Dropping the stream unblocks a reader still parked on a full channel.
            drop(output);

            if !owner_gone {
                let tail = decoder.finish();
                if !tail.is_empty() {
                    sink.deliver(SessionEvent::Output(tail)).await;
                }
            }

            // Only the entry for this very session; a newer one may already be bound.
            let exited_on_its_own = sessions
                .remove_if(&session.connection_id, |_, current| current.id == session.id)
                .is_some();
            if exited_on_its_own {
                live.fetch_sub(1, Ordering::SeqCst);
            }

            let exit_code = match session.pty.close().await {
                Ok(status) => Some(status.code()),
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "Failed to reap shell");
                    None
                }
            };

            let reason = if exited_on_its_own && !owner_gone {
                Some(CloseReason::ProcessExited)
            } else {
                session.end_reason()
            };

            tracing::info!(
                session_id = %session.id,
                connection_id = %session.connection_id,
                exit_code = ?exit_code,
                reason = ?reason,
                "Session output ended"
            );

            if let Some(reason) = reason {
                sink.deliver(SessionEvent::Ended {
                    session_id: session.id.clone(),
                    reason,
                    exit_code,
                })
                .await;
            }
        });
    }
}

impl SessionRegistry for PtySessionRegistry {
    async fn get_or_create(
        &self,
        connection_id: &ConnectionId,
        size: TerminalSize,
        sink: Arc<dyn SessionSink>,
    ) -> Result<SessionInfo, RegistryError> {
        if let Ok(session) = self.lookup(connection_id) {
            return Ok(session.info().await);
        }

        let slot = Arc::clone(&self.spawning.entry(connection_id.clone()).or_default());
        let _spawning = slot.lock().await;

        // Someone else may have spawned while we waited for the slot.
        let result = match self.lookup(connection_id) {
            Ok(session) => Ok(session),
            Err(_) => self.spawn_session(connection_id, size, sink).await,
        };
        // The last holder besides the map retires the slot.
        self.spawning
            .remove_if(connection_id, |_, current| Arc::strong_count(current) <= 2);

        Ok(result?.info().await)
    }

    async fn write(&self, connection_id: &ConnectionId, data: &[u8]) -> Result<(), RegistryError> {
        let session = self.lookup(connection_id)?;
        session.touch();
        session.pty.write(data).await?;
        Ok(())
    }

    async fn resize(
        &self,
        connection_id: &ConnectionId,
        size: TerminalSize,
    ) -> Result<(), RegistryError> {
        let session = self.lookup(connection_id)?;
        session.pty.resize(size).await?;
        Ok(())
    }

    async fn destroy(&self, connection_id: &ConnectionId) -> Option<SessionStatus> {
        self.terminate(connection_id, None).await
    }

    async fn get(&self, connection_id: &ConnectionId) -> Option<SessionInfo> {
        let session = self.lookup(connection_id).ok()?;
        Some(session.info().await)
    }

    fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.sessions.contains_key(connection_id)
    }

    fn count(&self) -> usize {
        self.sessions.len()
    }
}

//! Process-wide session table.
//!
//! The registry is the only shared mutable state between the gateway and
//! the per-session bridge tasks: components receive an explicit handle and
//! talk to a session through it, never by touching another session's
//! descriptor. Structural changes (insert/remove) and field updates are
//! serialized behind one lock; the table is empty at process start and
//! does not survive a restart (orphans from a previous instance are not
//! rediscovered).

use super::bridge::{self, Bridge};
use super::launcher;
use super::pty::PtyHandle;
use crate::config::ServerConfig;
use crate::slurm;
use hpcsh_core::{
    generate_session_id, AllocRequest, HpcshError, HpcshResult, ServerMessage, SessionInfo,
    SessionState,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Queued input per session. Interactive keystrokes are tiny; overflow is
/// dropped rather than stalling the sender.
const INPUT_QUEUE_DEPTH: usize = 64;

/// The remote channel currently bound to a session. The session does not
/// own the connection's lifetime; a stale sender simply stops accepting.
#[derive(Clone)]
pub struct AttachedChannel {
    pub conn_id: u64,
    pub tx: mpsc::Sender<ServerMessage>,
}

/// One tracked session: the PTY, the child, and the attachment point.
pub struct Session {
    pub id: String,
    pub request: AllocRequest,
    pub pty: PtyHandle,
    pub state: SessionState,
    pub exit_code: Option<u32>,
    pub attached: Option<AttachedChannel>,
    /// Queue into the bridge task, the sole writer to the descriptor.
    pub input_tx: mpsc::Sender<Vec<u8>>,
    /// Scheduler allocation id, once sniffed from the salloc banner.
    pub job_id: Option<u32>,
    pub created_at: Instant,
}

struct Inner {
    sessions: HashMap<String, Session>,
    /// Ids that have been reaped. Terminating one of these again is a
    /// no-op; an id that was never created is `SessionNotFound`.
    reaped: HashSet<String>,
}

/// Registry of all live sessions, shared across tasks.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
    config: ServerConfig,
}

impl SessionRegistry {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                reaped: HashSet::new(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Launch a new allocation-backed session and start its bridge.
    ///
    /// Returns once the child has been launched — not once the allocation
    /// is granted. Allocation and launch failures surface here,
    /// synchronously.
    pub async fn create(self: &Arc<Self>, request: AllocRequest) -> HpcshResult<String> {
        {
            let inner = self.inner.read().await;
            if inner.sessions.len() >= self.config.max_sessions {
                return Err(HpcshError::ResourceExhausted(format!(
                    "session limit ({}) reached",
                    self.config.max_sessions
                )));
            }
        }

        let id = generate_session_id();
        let mut pty = launcher::launch(&request, &self.config)?;

        let reader = pty
            .take_reader()
            .ok_or_else(|| HpcshError::Other("PTY reader already taken".into()))?;
        let writer = pty
            .take_writer()
            .ok_or_else(|| HpcshError::Other("PTY writer already taken".into()))?;
        let child = pty.child();

        let chunks = bridge::spawn_reader(&id, reader, self.config.terminal.read_chunk_bytes)?;
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);

        let mut session = Session {
            id: id.clone(),
            request,
            pty,
            state: SessionState::Pending,
            exit_code: None,
            attached: None,
            input_tx,
            job_id: None,
            created_at: Instant::now(),
        };
        // The shell is assumed ready once the process exists; readiness is
        // observed as terminal output, not as a state transition.
        session.state = SessionState::Running;

        {
            let mut inner = self.inner.write().await;
            inner.sessions.insert(id.clone(), session);
        }
        info!(session_id = %id, "session created");

        let bridge = Bridge {
            registry: self.clone(),
            session_id: id.clone(),
            chunks,
            input: input_rx,
            writer,
            child,
            poll_interval: Duration::from_millis(self.config.terminal.poll_interval_ms),
            sniff_allocation: !self.config.slurm.salloc.is_empty(),
        };
        tokio::spawn(bridge.run());

        Ok(id)
    }

    /// Bind a remote channel to a session, replacing any prior attachment.
    /// The replaced channel stops receiving output immediately; the relay
    /// keeps running and simply retargets.
    pub async fn attach(
        &self,
        id: &str,
        conn_id: u64,
        tx: mpsc::Sender<ServerMessage>,
    ) -> HpcshResult<()> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| HpcshError::SessionNotFound(id.to_string()))?;
        if let Some(old) = session.attached.replace(AttachedChannel { conn_id, tx }) {
            debug!(session_id = %id, old_conn = old.conn_id, "previous channel replaced");
        }
        info!(session_id = %id, conn_id, "channel attached");
        Ok(())
    }

    /// The sender for the currently attached channel, if any. The bridge
    /// looks this up per chunk so an attach retargets a live relay.
    pub async fn attached_sender(&self, id: &str) -> Option<mpsc::Sender<ServerMessage>> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(id)
            .and_then(|s| s.attached.as_ref().map(|a| a.tx.clone()))
    }

    /// Queue input bytes for the session's bridge. Best effort once the
    /// session is known: bytes for a dying session are dropped, not errors.
    pub async fn send_input(&self, id: &str, bytes: Vec<u8>) -> HpcshResult<()> {
        let inner = self.inner.read().await;
        let session = inner
            .sessions
            .get(id)
            .ok_or_else(|| HpcshError::SessionNotFound(id.to_string()))?;
        if let Err(e) = session.input_tx.try_send(bytes) {
            debug!(session_id = %id, "input dropped: {e}");
        }
        Ok(())
    }

    /// Update the PTY geometry. Geometry failures are logged, not fatal.
    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> HpcshResult<()> {
        let inner = self.inner.read().await;
        let session = inner
            .sessions
            .get(id)
            .ok_or_else(|| HpcshError::SessionNotFound(id.to_string()))?;
        if let Err(e) = session.pty.resize(rows, cols) {
            warn!(session_id = %id, error = %e, "resize failed, keeping old geometry");
        }
        Ok(())
    }

    /// Record the child's termination. Returns true only for the first
    /// caller, so exactly one lifecycle event is emitted per session.
    pub async fn mark_exited(&self, id: &str, exit_code: Option<u32>) -> bool {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(id) {
            Some(session) if session.state.is_live() => {
                session.state = SessionState::Exited;
                session.exit_code = exit_code;
                true
            }
            _ => false,
        }
    }

    /// Record the scheduler allocation id discovered in the output stream.
    pub async fn set_job_id(&self, id: &str, job_id: u32) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(id) {
            if session.job_id.is_none() {
                info!(session_id = %id, job_id, "allocation granted");
                session.job_id = Some(job_id);
            }
        }
    }

    /// Reap a session: cancel the allocation, terminate the child, release
    /// the descriptor, remove the table entry. Idempotent — reaping an
    /// already-reaped id is a no-op; an id never seen is an error.
    pub async fn terminate(&self, id: &str) -> HpcshResult<()> {
        let session = {
            let mut inner = self.inner.write().await;
            match inner.sessions.remove(id) {
                Some(session) => {
                    inner.reaped.insert(id.to_string());
                    session
                }
                None => {
                    if inner.reaped.contains(id) {
                        return Ok(());
                    }
                    return Err(HpcshError::SessionNotFound(id.to_string()));
                }
            }
        };
        self.reap(session).await;
        Ok(())
    }

    /// A connection went away. Clear the attachment if it is still this
    /// connection's, and reap the session only if its child already
    /// exited — a live session outlives its client so the user can
    /// reattach later.
    pub async fn channel_closed(&self, id: &str, conn_id: u64) {
        let removed = {
            let mut inner = self.inner.write().await;
            let reap_now = match inner.sessions.get_mut(id) {
                None => return,
                Some(session) => {
                    let is_ours =
                        matches!(&session.attached, Some(ch) if ch.conn_id == conn_id);
                    if !is_ours {
                        // A newer attachment took over; leave it alone.
                        return;
                    }
                    session.attached = None;
                    session.state == SessionState::Exited
                }
            };
            if reap_now {
                let session = inner.sessions.remove(id);
                if session.is_some() {
                    inner.reaped.insert(id.to_string());
                }
                session
            } else {
                info!(session_id = %id, "channel detached, session kept for reattach");
                None
            }
        };
        if let Some(session) = removed {
            info!(session_id = %id, "reaping exited session after channel closure");
            self.reap(session).await;
        }
    }

    /// Force-terminate and reap every session (process-wide shutdown).
    pub async fn shutdown_all(&self) {
        let drained: Vec<Session> = {
            let mut inner = self.inner.write().await;
            let ids: Vec<String> = inner.sessions.keys().cloned().collect();
            for id in ids {
                inner.reaped.insert(id);
            }
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        for session in drained {
            self.reap(session).await;
        }
        if count > 0 {
            info!(count, "all sessions force-reaped on shutdown");
        }
    }

    /// Diagnostic enumeration of live sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .map(|s| SessionInfo {
                id: s.id.clone(),
                pid: s.pty.pid(),
                state: s.state,
                attached: s.attached.is_some(),
                request: s.request.clone(),
                job_id: s.job_id,
                exit_code: s.exit_code,
                uptime_secs: s.created_at.elapsed().as_secs(),
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Release everything a session owns. The descriptor closes exactly
    /// once, when the `Session` value drops at the end of this call.
    async fn reap(&self, mut session: Session) {
        session.attached = None;
        if let Some(job_id) = session.job_id {
            slurm::cancel_allocation(&self.config.slurm.scancel, job_id).await;
        }
        session.state = SessionState::Reaped;

        let child = session.pty.child();
        let reaper = tokio::task::spawn_blocking(move || {
            let mut child = child.blocking_lock();
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            let _ = child.wait();
        });
        if reaper.await.is_err() {
            warn!(session_id = %session.id, "child reaper task failed");
        }
        info!(session_id = %session.id, "session reaped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bypass_registry(max_sessions: usize) -> Arc<SessionRegistry> {
        let mut cfg = ServerConfig::default();
        cfg.slurm.salloc = String::new();
        cfg.terminal.shell = "/bin/sh".to_string();
        cfg.max_sessions = max_sessions;
        Arc::new(SessionRegistry::new(cfg))
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected_and_leave_registry_unchanged() {
        let registry = bypass_registry(4);
        let (tx, _rx) = mpsc::channel(8);

        assert!(matches!(
            registry.attach("nonexistent", 1, tx).await,
            Err(HpcshError::SessionNotFound(_))
        ));
        assert!(matches!(
            registry.send_input("nonexistent", b"x".to_vec()).await,
            Err(HpcshError::SessionNotFound(_))
        ));
        assert!(matches!(
            registry.terminate("nonexistent").await,
            Err(HpcshError::SessionNotFound(_))
        ));
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn create_returns_distinct_ids_for_concurrent_calls() {
        let registry = bypass_registry(16);
        let (a, b, c) = tokio::join!(
            registry.create(AllocRequest::default()),
            registry.create(AllocRequest::default()),
            registry.create(AllocRequest::default()),
        );
        let ids: Vec<String> = [a, b, c]
            .into_iter()
            .filter_map(|r| match r {
                Ok(id) => Some(id),
                Err(e) => {
                    println!("PTY creation failed (may be expected in CI): {e}");
                    None
                }
            })
            .collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        for id in &ids {
            registry.terminate(id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn terminate_twice_is_a_no_op() {
        let registry = bypass_registry(4);
        let id = match registry.create(AllocRequest::default()).await {
            Ok(id) => id,
            Err(e) => {
                println!("PTY creation failed (may be expected in CI): {e}");
                return;
            }
        };
        registry.terminate(&id).await.unwrap();
        assert_eq!(registry.count().await, 0);
        // Second reap: no error, nothing left to free.
        registry.terminate(&id).await.unwrap();
    }

    #[tokio::test]
    async fn session_limit_is_enforced() {
        let registry = bypass_registry(1);
        let first = match registry.create(AllocRequest::default()).await {
            Ok(id) => id,
            Err(e) => {
                println!("PTY creation failed (may be expected in CI): {e}");
                return;
            }
        };
        match registry.create(AllocRequest::default()).await {
            Err(HpcshError::ResourceExhausted(_)) => {}
            other => panic!("expected ResourceExhausted, got {:?}", other.map(|_| ())),
        }
        registry.terminate(&first).await.unwrap();
    }

    #[tokio::test]
    async fn attach_replaces_previous_channel() {
        let registry = bypass_registry(4);
        let id = match registry.create(AllocRequest::default()).await {
            Ok(id) => id,
            Err(e) => {
                println!("PTY creation failed (may be expected in CI): {e}");
                return;
            }
        };

        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        registry.attach(&id, 1, tx1).await.unwrap();
        registry.attach(&id, 2, tx2).await.unwrap();

        let info = registry.list().await;
        assert_eq!(info.len(), 1);
        assert!(info[0].attached);

        // The first connection closing must not clear the newer attachment.
        registry.channel_closed(&id, 1).await;
        let info = registry.list().await;
        assert!(info[0].attached);

        registry.terminate(&id).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_reaps_everything() {
        let registry = bypass_registry(8);
        let mut created = 0;
        for _ in 0..3 {
            match registry.create(AllocRequest::default()).await {
                Ok(_) => created += 1,
                Err(e) => {
                    println!("PTY creation failed (may be expected in CI): {e}");
                    return;
                }
            }
        }
        assert_eq!(registry.count().await, created);
        registry.shutdown_all().await;
        assert_eq!(registry.count().await, 0);
    }
}

//! PTY allocation and child spawn using portable-pty.
//!
//! The pair is opened with its geometry already set, the child becomes a
//! session leader with the peer side as its controlling terminal, and the
//! parent's handle to the peer side is released only after the spawn has
//! confirmed the handoff.

use crate::slurm::LaunchSpec;
use hpcsh_core::{HpcshError, HpcshResult};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One allocated pseudo-terminal with its child process.
///
/// The reader and writer are taken exactly once, by the session's bridge —
/// the only task allowed to touch the controlling descriptor while the
/// session runs. The master stays here for resize; the child handle is the
/// single polymorphic process abstraction (`try_wait` / `kill`) shared with
/// the liveness probe and the reap path.
pub struct PtyHandle {
    master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send>>>,
    reader: std::sync::Mutex<Option<Box<dyn Read + Send>>>,
    writer: std::sync::Mutex<Option<Box<dyn Write + Send>>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Open a PTY pair at the given geometry and spawn the command on the
    /// peer side.
    pub fn spawn(spec: &LaunchSpec, rows: u16, cols: u16) -> HpcshResult<Self> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| HpcshError::ResourceExhausted(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.env("TERM", "xterm-256color");

        // spawn_command forks a session leader that installs the peer side
        // as its controlling terminal and execs; an exec failure surfaces
        // here rather than leaving a stray child behind.
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| HpcshError::LaunchFailed(format!("{}: {e}", spec.program)))?;

        // Handoff is confirmed; only now may our handle to the peer side go.
        drop(pair.slave);

        let pid = child.process_id();
        info!(program = %spec.program, pid, rows, cols, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| HpcshError::Other(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| HpcshError::Other(format!("failed to take PTY writer: {e}")))?;

        Ok(Self {
            master: std::sync::Mutex::new(pair.master),
            child: Arc::new(Mutex::new(child)),
            reader: std::sync::Mutex::new(Some(reader)),
            writer: std::sync::Mutex::new(Some(writer)),
            pid,
        })
    }

    /// Take the output side of the controlling descriptor. Yields `None`
    /// after the first call.
    pub fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.get_mut().ok().and_then(|r| r.take())
    }

    /// Take the input side of the controlling descriptor. Yields `None`
    /// after the first call.
    pub fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.writer.get_mut().ok().and_then(|w| w.take())
    }

    /// The child process handle, for liveness probes and termination.
    pub fn child(&self) -> Arc<Mutex<Box<dyn portable_pty::Child + Send>>> {
        self.child.clone()
    }

    /// Native process id of the child, if the platform exposes one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Update the terminal geometry. Failures are reported but a degraded
    /// geometry is not fatal to the session.
    pub fn resize(&self, rows: u16, cols: u16) -> HpcshResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| HpcshError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(size)
            .map_err(|e| HpcshError::Other(format!("PTY resize failed: {e}")))?;
        drop(master);
        debug!(rows, cols, "PTY resized");
        Ok(())
    }
}

//! Per-session I/O bridge.
//!
//! One relay task per session moves bytes terminal→channel and
//! channel→terminal for the session's entire `Running` lifetime. A
//! companion reader thread performs the blocking descriptor reads; the
//! relay itself only ever waits with a bound — on the chunk queue, the
//! input queue, or the liveness tick — so a silent child cannot wedge it.

use super::registry::SessionRegistry;
use crate::slurm;
use hpcsh_core::{HpcshError, HpcshResult, ServerMessage};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Buffered chunks between the reader thread and the relay. When it fills,
/// the reader stalls and the kernel's PTY buffer applies backpressure to
/// the child.
const CHUNK_QUEUE_DEPTH: usize = 64;

/// How many leading output chunks are searched for the salloc grant banner.
pub const MAX_SNIFF_CHUNKS: usize = 8;

/// Start the blocking reader for a session's controlling descriptor.
///
/// The thread owns the reader exclusively and exits on end-of-stream; the
/// returned queue closing is the relay's end-of-stream signal. An `EIO`
/// after the child exits is the normal Linux PTY end-of-stream and is
/// treated the same as a zero-length read.
pub fn spawn_reader(
    session_id: &str,
    mut reader: Box<dyn Read + Send>,
    chunk_size: usize,
) -> HpcshResult<mpsc::Receiver<Vec<u8>>> {
    let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
    let thread_name = format!("pty-reader-{}", &session_id[..session_id.len().min(8)]);
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let mut buf = vec![0u8; chunk_size];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        })
        .map_err(|e| HpcshError::Other(format!("failed to start reader thread: {e}")))?;
    Ok(rx)
}

/// Everything a relay task needs. Built by the registry at session
/// creation; `run` consumes it.
pub struct Bridge {
    pub registry: Arc<SessionRegistry>,
    pub session_id: String,
    pub chunks: mpsc::Receiver<Vec<u8>>,
    pub input: mpsc::Receiver<Vec<u8>>,
    pub writer: Box<dyn Write + Send>,
    pub child: Arc<Mutex<Box<dyn portable_pty::Child + Send>>>,
    pub poll_interval: Duration,
    /// Whether to watch the output stream for the allocation grant banner.
    pub sniff_allocation: bool,
}

impl Bridge {
    /// Relay until the child exits, then announce the exit exactly once.
    ///
    /// Errors inside the loop never escape: unrecoverable descriptor
    /// failures end this session's relay, transient ones skip an
    /// iteration, and no path can take down another session's task.
    pub async fn run(self) {
        let Bridge {
            registry,
            session_id,
            mut chunks,
            mut input,
            mut writer,
            child,
            poll_interval,
            sniff_allocation,
        } = self;

        let mut sniff_budget = if sniff_allocation { MAX_SNIFF_CHUNKS } else { 0 };
        let mut write_error_reported = false;
        let mut input_open = true;
        let mut tick = tokio::time::interval(poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let exit_code = loop {
            tokio::select! {
                maybe_chunk = chunks.recv() => match maybe_chunk {
                    Some(chunk) => {
                        forward_output(&registry, &session_id, &mut sniff_budget, chunk).await;
                    }
                    None => {
                        // End of stream: the peer side of the terminal is gone.
                        break probe(&child).await;
                    }
                },

                maybe_input = input.recv(), if input_open => match maybe_input {
                    Some(data) => {
                        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                            warn!(session_id = %session_id, error = %e, "terminal write failed");
                            if !write_error_reported {
                                write_error_reported = true;
                                notify(&registry, &session_id, ServerMessage::TerminalError {
                                    session_id: session_id.clone(),
                                    message: "terminal write failed".into(),
                                })
                                .await;
                            }
                        }
                    }
                    // Input side closed (session removed); keep relaying
                    // output until the descriptor reaches end-of-stream.
                    None => input_open = false,
                },

                _ = tick.tick() => {
                    if let Some(code) = probe(&child).await {
                        // Deliver output the reader already buffered before
                        // announcing the exit, so trailing bytes keep their
                        // place in the stream.
                        while let Ok(chunk) = chunks.try_recv() {
                            forward_output(&registry, &session_id, &mut sniff_budget, chunk).await;
                        }
                        break Some(code);
                    }
                }
            }
        };

        if registry.mark_exited(&session_id, exit_code).await {
            info!(session_id = %session_id, exit_code, "session exited");
            notify(&registry, &session_id, ServerMessage::Exited {
                session_id: session_id.clone(),
                exit_code,
            })
            .await;
        }
        // Dropping `input` here closes the queue; later input is accepted
        // best-effort by the registry and discarded.
    }
}

/// Non-blocking liveness probe of the child. `None` while it still runs;
/// probe errors are transient and skipped.
async fn probe(child: &Arc<Mutex<Box<dyn portable_pty::Child + Send>>>) -> Option<u32> {
    let mut child = child.lock().await;
    match child.try_wait() {
        Ok(Some(status)) => Some(status.exit_code()),
        Ok(None) => None,
        Err(e) => {
            debug!(error = %e, "liveness probe failed, retrying next tick");
            None
        }
    }
}

/// Decode a chunk permissively and hand it to whichever channel is
/// attached right now. Attach retargets a live relay simply by changing
/// what this lookup returns; backpressure drops the event rather than
/// stalling the session.
async fn forward_output(
    registry: &Arc<SessionRegistry>,
    session_id: &str,
    sniff_budget: &mut usize,
    chunk: Vec<u8>,
) {
    let data = String::from_utf8_lossy(&chunk).into_owned();

    if *sniff_budget > 0 {
        if let Some(job_id) = slurm::parse_grant_banner(&data) {
            registry.set_job_id(session_id, job_id).await;
            *sniff_budget = 0;
        } else {
            *sniff_budget -= 1;
        }
    }

    notify(registry, session_id, ServerMessage::Output {
        session_id: session_id.to_string(),
        data,
    })
    .await;
}

/// Best-effort event delivery to the attached channel, if any.
async fn notify(registry: &Arc<SessionRegistry>, session_id: &str, msg: ServerMessage) {
    let Some(tx) = registry.attached_sender(session_id).await else {
        return;
    };
    match tx.try_send(msg) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            debug!(session_id = %session_id, "event dropped: channel backpressure");
        }
        Err(TrySendError::Closed(_)) => {
            debug!(session_id = %session_id, "event dropped: channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reader_yields_chunks_then_closes() {
        let data = b"hello from the terminal".to_vec();
        let mut rx = spawn_reader("test-session", Box::new(Cursor::new(data.clone())), 4096)
            .unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend(chunk);
        }
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn reader_respects_chunk_size_and_order() {
        let data = b"abcdefghij".to_vec();
        let mut rx = spawn_reader("test-session", Box::new(Cursor::new(data)), 4).unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            assert!(chunk.len() <= 4);
            chunks.push(chunk);
        }
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, b"abcdefghij");
    }

    #[tokio::test]
    async fn reader_handles_short_ids() {
        let mut rx = spawn_reader("ab", Box::new(Cursor::new(b"x".to_vec())), 16).unwrap();
        assert_eq!(rx.recv().await, Some(b"x".to_vec()));
        assert_eq!(rx.recv().await, None);
    }
}

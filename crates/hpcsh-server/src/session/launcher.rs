//! Session launcher: allocator command line + PTY spawn.

use super::pty::PtyHandle;
use crate::config::ServerConfig;
use crate::slurm;
use hpcsh_core::{AllocRequest, HpcshResult};
use tracing::debug;

/// Build the allocator command for the request and start it on a fresh
/// PTY at the configured geometry.
///
/// Returns as soon as the child exists — allocation latency is absorbed by
/// the interactive stream (the client watches salloc's own output until the
/// shell prompt arrives), so there is nothing to wait for here.
pub fn launch(request: &AllocRequest, config: &ServerConfig) -> HpcshResult<PtyHandle> {
    let spec = slurm::alloc_command(request, config);
    debug!(program = %spec.program, args = ?spec.args, "launching session");
    PtyHandle::spawn(&spec, config.terminal.rows, config.terminal.cols)
}

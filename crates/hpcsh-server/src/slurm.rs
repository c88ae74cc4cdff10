//! Resource-manager collaborator contract.
//!
//! The bridge itself never parses scheduler state; it only needs two
//! things from SLURM: an allocator command line that runs the interactive
//! shell inside a fresh allocation, and a way to cancel an allocation by
//! id once one has been observed in the terminal stream.

use crate::config::ServerConfig;
use hpcsh_core::AllocRequest;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// A fully built command line, ready to hand to the PTY spawner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// Build the allocator command for a resource request.
///
/// Shape: `salloc [--nodes N] [--mem <M>G] [--time H:00:00] <shell>`.
/// Absent parameters are omitted, never defaulted. The shell rides as the
/// trailing argument so it starts inside the allocation immediately — no
/// second round of job-id discovery.
///
/// With an empty allocator configured, the shell is launched directly
/// (hosts without a scheduler).
pub fn alloc_command(request: &AllocRequest, config: &ServerConfig) -> LaunchSpec {
    let shell = config.terminal.shell.clone();
    if config.slurm.salloc.is_empty() {
        return LaunchSpec {
            program: shell,
            args: Vec::new(),
        };
    }

    let mut args = Vec::new();
    if let Some(nodes) = request.nodes {
        args.push("--nodes".to_string());
        args.push(nodes.to_string());
    }
    if let Some(mem) = request.memory_gb {
        args.push("--mem".to_string());
        args.push(format!("{mem}G"));
    }
    if let Some(hours) = request.time_hours {
        args.push("--time".to_string());
        args.push(format!("{hours}:00:00"));
    }
    args.push(shell);

    LaunchSpec {
        program: config.slurm.salloc.clone(),
        args,
    }
}

/// Extract the allocation id from salloc's grant banner, if present.
///
/// salloc announces `salloc: Granted job allocation <id>` on the terminal
/// before the shell prompt appears; the bridge sniffs the first output
/// chunks for it.
pub fn parse_grant_banner(chunk: &str) -> Option<u32> {
    static GRANT_RE: OnceLock<Regex> = OnceLock::new();
    let re = GRANT_RE
        .get_or_init(|| Regex::new(r"Granted job allocation (\d+)").expect("static regex"));
    re.captures(chunk)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Cancel an allocation by id, best effort.
///
/// Killing the salloc child usually releases the allocation too; scancel
/// covers schedulers that mishandle the signal.
pub async fn cancel_allocation(scancel: &str, job_id: u32) {
    if scancel.is_empty() {
        return;
    }
    match tokio::process::Command::new(scancel)
        .arg(job_id.to_string())
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            debug!(job_id, "allocation cancelled");
        }
        Ok(output) => {
            warn!(
                job_id,
                status = %output.status,
                "scancel reported failure"
            );
        }
        Err(e) => {
            warn!(job_id, error = %e, "failed to run scancel");
        }
    }
}

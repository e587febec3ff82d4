//! Transfer-executor contract and the rsync-backed production executor.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use datasync_config::SyncEntry;

use crate::retry::RefinedTransfer;

/// What the executor is asked to do with the destination.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferKind {
    /// Mirror the sources onto the destination.
    Sync,
    /// Propagate the removal of a source to its destination counterpart.
    Remove,
}

/// One transfer invocation: sources, destination, and filter arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferRequest {
    pub kind: TransferKind,
    pub sources: Vec<String>,
    pub destination: String,
    /// Pre-formed `--include=` / `--exclude=` arguments, in order.
    pub filters: Vec<String>,
    /// Delete destination entries that no longer exist at the source.
    pub purge: bool,
}

impl TransferRequest {
    /// Whole-entry synchronization.
    #[must_use]
    pub fn sync_entry(entry: &SyncEntry) -> Self {
        let mut source = entry.path.display().to_string();
        if entry.is_directory && !source.ends_with('/') {
            source.push('/');
        }

        Self {
            kind: TransferKind::Sync,
            sources: vec![source],
            destination: entry.destination().display().to_string(),
            filters: entry_filters(entry),
            purge: entry.is_directory,
        }
    }

    /// Removal of the destination counterpart of a deleted file entry.
    #[must_use]
    pub fn remove_destination(entry: &SyncEntry) -> Self {
        Self {
            kind: TransferKind::Remove,
            sources: vec![entry.path.display().to_string()],
            destination: entry.destination().display().to_string(),
            filters: Vec::new(),
            purge: false,
        }
    }

    /// Narrowed retry assembled by the failure classifier.
    #[must_use]
    pub fn refined(entry: &SyncEntry, refined: RefinedTransfer) -> Self {
        Self {
            kind: TransferKind::Sync,
            sources: refined.sources,
            destination: entry.destination().display().to_string(),
            filters: refined.filters,
            purge: false,
        }
    }
}

/// Filter arguments for a routine entry sync.
///
/// An include list narrows the transfer, so it terminates with `--exclude=*`;
/// excludes alone need no terminator.
fn entry_filters(entry: &SyncEntry) -> Vec<String> {
    let mut filters = Vec::new();

    if let Some(includes) = &entry.include_list {
        for include in includes {
            filters.push(format!("--include={}", include.display()));
        }
    }

    if let Some(excludes) = &entry.exclude_list {
        for exclude in excludes {
            filters.push(format!("--exclude={}", exclude.display()));
        }
    }

    if entry.include_list.is_some() {
        filters.push("--exclude=*".to_owned());
    }

    filters
}

/// Result of one executor invocation.
#[derive(Clone, Debug, Default)]
pub struct TransferOutcome {
    pub success: bool,
    /// Diagnostic text from the executor's error stream; the failure
    /// classifier scans it for vanished-source markers.
    pub stderr: String,
}

impl TransferOutcome {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            stderr: String::new(),
        }
    }

    #[must_use]
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stderr: stderr.into(),
        }
    }
}

/// The file-transfer invocation, reachable over an authenticated transport.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn execute(&self, request: &TransferRequest) -> TransferOutcome;
}

/// Production executor: shells out to `rsync`.
#[derive(Clone, Debug, Default)]
pub struct RsyncTransfer {
    /// `host:` prefix applied to destination paths when syncing to the peer;
    /// absent for same-filesystem mirrors.
    pub destination_prefix: Option<String>,
    /// Remote shell handed to rsync, e.g. `ssh -i <key>`.
    pub remote_shell: Option<String>,
}

impl RsyncTransfer {
    fn command(&self, request: &TransferRequest) -> Command {
        let mut command = Command::new("rsync");
        command.arg("--archive").arg("--compress");

        if let Some(shell) = &self.remote_shell {
            command.arg(format!("--rsh={shell}"));
        }

        match request.kind {
            TransferKind::Sync => {
                if request.purge {
                    command.arg("--delete");
                }
                command.args(&request.filters);
            }
            TransferKind::Remove => {
                // The source is gone; let rsync delete its destination arg.
                command.arg("--delete-missing-args");
            }
        }

        command
            .args(&request.sources)
            .arg(self.destination(&request.destination));

        command
    }

    fn destination(&self, destination: &str) -> String {
        match &self.destination_prefix {
            Some(prefix) => format!("{prefix}{destination}"),
            None => destination.to_owned(),
        }
    }
}

#[async_trait]
impl Transfer for RsyncTransfer {
    async fn execute(&self, request: &TransferRequest) -> TransferOutcome {
        let mut command = self.command(request);
        command.stdout(Stdio::null()).stderr(Stdio::piped());

        match command.output().await {
            Ok(output) => {
                if output.status.success() {
                    TransferOutcome::ok()
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    debug!(status = ?output.status, "rsync reported failure");
                    TransferOutcome::failed(stderr)
                }
            }
            Err(err) => {
                warn!(%err, "failed to spawn rsync");
                TransferOutcome::failed(err.to_string())
            }
        }
    }
}

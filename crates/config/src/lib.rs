//! Configuration model for replicated entities.
//!
//! JSON descriptors declare which paths are mirrored between the paired
//! controllers, in which direction, with what cadence, under what retry
//! policy, and under what system-state gating. The loader turns them into an
//! ordered sequence of [`SyncEntry`] values; malformed fields fall back to
//! documented defaults with a warning, and unusable entries are dropped.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::read_dir;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Result as EyreResult, WrapErr};
use serde::Deserialize;
use tracing::{debug, warn};

use datasync_primitives::{SyncDirection, SyncType};

pub mod duration;

pub use duration::{format_iso8601, parse_iso8601};

/// Fallback periodicity when a Periodic entry carries a malformed duration.
pub const DEFAULT_PERIODICITY: Duration = Duration::from_secs(60);

/// Fallback retry interval when `RetryInterval` carries a malformed duration.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(300);

/// Retry policy applied to failed transfers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Retry {
    pub attempts: u8,
    pub interval: Duration,
}

/// Suspend/resume value sets observed on one bus interface.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StateInfo {
    /// Expected owning service; resolved from the object directory when
    /// absent.
    pub service_name: Option<String>,
    /// property name -> values that suspend the entry's sync.
    pub suspend_states: BTreeMap<String, BTreeSet<String>>,
    /// property name -> values that resume the entry's sync.
    pub resume_states: BTreeMap<String, BTreeSet<String>>,
}

/// State-driven gating descriptor: one [`StateInfo`] per interface name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StateDriven {
    pub interfaces: BTreeMap<String, StateInfo>,
}

/// One declared source -> destination mapping.
#[derive(Clone, Debug)]
pub struct SyncEntry {
    /// Absolute source path.
    pub path: PathBuf,
    pub is_directory: bool,
    /// Peer destination; the source path mirrors to itself when absent.
    pub dest_path: Option<PathBuf>,
    pub direction: SyncDirection,
    pub sync_type: SyncType,
    /// Present iff `sync_type` is Periodic.
    pub periodicity: Option<Duration>,
    pub retry: Option<Retry>,
    pub include_list: Option<Vec<PathBuf>>,
    pub exclude_list: Option<Vec<PathBuf>>,
    pub state_driven: Option<StateDriven>,
}

impl SyncEntry {
    /// Destination path on the peer; mirrors the source when not configured.
    #[must_use]
    pub fn destination(&self) -> &Path {
        self.dest_path.as_deref().unwrap_or(&self.path)
    }

    fn from_raw(raw: RawEntry, is_directory: bool) -> Option<Self> {
        let path = PathBuf::from(raw.path);
        if path.as_os_str().is_empty() || !path.is_absolute() {
            warn!(path = %path.display(), "dropping entry with a non-absolute source path");
            return None;
        }

        let direction = raw.sync_direction.parse().unwrap_or_else(|err| {
            warn!(%err, path = %path.display(), "falling back to Active2Passive");
            SyncDirection::Active2Passive
        });

        let sync_type = raw.sync_type.parse().unwrap_or_else(|err| {
            warn!(%err, path = %path.display(), "falling back to Immediate");
            SyncType::Immediate
        });

        let periodicity = (sync_type == SyncType::Periodic).then(|| {
            raw.periodicity
                .as_deref()
                .and_then(parse_iso8601)
                .unwrap_or_else(|| {
                    warn!(
                        path = %path.display(),
                        default_secs = DEFAULT_PERIODICITY.as_secs(),
                        "periodicity missing or malformed, using the default"
                    );
                    DEFAULT_PERIODICITY
                })
        });

        let retry = match (raw.retry_attempts, raw.retry_interval) {
            (Some(attempts), Some(interval)) => Some(Retry {
                attempts,
                interval: parse_iso8601(&interval).unwrap_or_else(|| {
                    warn!(
                        path = %path.display(),
                        default_secs = DEFAULT_RETRY_INTERVAL.as_secs(),
                        "retry interval malformed, using the default"
                    );
                    DEFAULT_RETRY_INTERVAL
                }),
            }),
            (None, None) => None,
            _ => {
                warn!(
                    path = %path.display(),
                    "RetryAttempts and RetryInterval must be configured together; ignoring retry"
                );
                None
            }
        };

        let into_paths =
            |list: Option<Vec<String>>| list.map(|l| l.into_iter().map(PathBuf::from).collect());

        let state_driven = raw.state_driven_sync.and_then(|sync_array| {
            let mut interfaces = BTreeMap::new();
            for sync_obj in sync_array {
                for (interface, info) in sync_obj {
                    let _ignored = interfaces
                        .entry(interface)
                        .or_insert_with(|| info.into_state_info());
                }
            }
            (!interfaces.is_empty()).then_some(StateDriven { interfaces })
        });

        Some(Self {
            path,
            is_directory,
            dest_path: raw.destination_path.map(PathBuf::from),
            direction,
            sync_type,
            periodicity,
            retry,
            include_list: into_paths(raw.include_files_list),
            exclude_list: into_paths(raw.exclude_files_list),
            state_driven,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    #[serde(default, rename = "Files")]
    files: Vec<RawEntry>,
    #[serde(default, rename = "Directories")]
    directories: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEntry {
    path: String,
    #[serde(default)]
    destination_path: Option<String>,
    sync_direction: String,
    sync_type: String,
    #[serde(default)]
    periodicity: Option<String>,
    #[serde(default)]
    retry_attempts: Option<u8>,
    #[serde(default)]
    retry_interval: Option<String>,
    #[serde(default)]
    exclude_files_list: Option<Vec<String>>,
    #[serde(default)]
    include_files_list: Option<Vec<String>>,
    #[serde(default)]
    state_driven_sync: Option<Vec<BTreeMap<String, RawStateInfo>>>,
    /// Free-form, for the administrator's benefit only.
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawStateInfo {
    #[serde(default)]
    service_name: Option<String>,
    #[serde(default)]
    suspend_states: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    resume_states: BTreeMap<String, Vec<String>>,
}

impl RawStateInfo {
    fn into_state_info(self) -> StateInfo {
        let into_sets = |states: BTreeMap<String, Vec<String>>| {
            states
                .into_iter()
                .map(|(property, values)| (property, values.into_iter().collect()))
                .collect()
        };

        StateInfo {
            service_name: self.service_name,
            suspend_states: into_sets(self.suspend_states),
            resume_states: into_sets(self.resume_states),
        }
    }
}

/// Parse one JSON document into sync entries, `Files` before `Directories`.
pub fn parse_document(content: &str) -> EyreResult<Vec<SyncEntry>> {
    let document: RawDocument =
        serde_json::from_str(content).wrap_err("malformed sync configuration document")?;

    let files = document
        .files
        .into_iter()
        .filter_map(|raw| SyncEntry::from_raw(raw, false));
    let directories = document
        .directories
        .into_iter()
        .filter_map(|raw| SyncEntry::from_raw(raw, true));

    Ok(files.chain(directories).collect())
}

/// Load every `*.json` descriptor in `dir`, concatenating their `Files` and
/// `Directories` arrays in filename order.
///
/// Duplicate `(path, direction)` pairs across the set are coalesced: the
/// first occurrence wins and later ones are dropped with a warning. A file
/// that fails to parse is skipped; the remaining files still load.
pub fn load_from_dir(dir: &Path) -> EyreResult<Vec<SyncEntry>> {
    let mut config_files: Vec<PathBuf> = read_dir(dir)
        .wrap_err_with(|| format!("failed to read configuration directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    config_files.sort();

    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for config_file in config_files {
        let parsed = std::fs::read_to_string(&config_file)
            .wrap_err_with(|| format!("failed to read {}", config_file.display()))
            .and_then(|content| parse_document(&content));

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    config_file = %config_file.display(),
                    error = %err,
                    "skipping unparseable configuration file"
                );
                continue;
            }
        };

        debug!(config_file = %config_file.display(), count = parsed.len(), "loaded sync entries");

        for entry in parsed {
            if !seen.insert((entry.path.clone(), entry.direction)) {
                warn!(
                    path = %entry.path.display(),
                    direction = %entry.direction,
                    "coalescing duplicate entry; first occurrence wins"
                );
                continue;
            }
            entries.push(entry);
        }
    }

    Ok(entries)
}

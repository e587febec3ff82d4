use core::fmt::{self, Display, Formatter};

/// Progress of the most recent full-sync campaign.
///
/// `NotStarted` is the value published before the first campaign; a campaign
/// moves the status to `InProgress` and settles on exactly one of
/// `Completed` or `Failed` before the next trigger.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FullSyncStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl Display for FullSyncStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NotStarted",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        f.pad(name)
    }
}

/// Aggregate health of the synchronization engine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SyncEventsHealth {
    #[default]
    Ok,
    Critical,
}

impl Display for SyncEventsHealth {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "Ok",
            Self::Critical => "Critical",
        };
        f.pad(name)
    }
}

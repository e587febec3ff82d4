use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use thiserror::Error as ThisError;

use crate::role::BmcRole;

/// Which local role may initiate transfers for an entry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SyncDirection {
    Active2Passive,
    Passive2Active,
    Bidirectional,
}

impl SyncDirection {
    /// Whether a node holding `role` is allowed to initiate the transfer.
    #[must_use]
    pub fn runs_on(self, role: BmcRole) -> bool {
        match self {
            Self::Active2Passive => role == BmcRole::Active,
            Self::Passive2Active => role == BmcRole::Passive,
            Self::Bidirectional => role != BmcRole::Unknown,
        }
    }
}

#[derive(Clone, Debug, ThisError)]
#[error("unsupported sync direction [{0}]")]
pub struct UnknownSyncDirection(pub String);

impl FromStr for SyncDirection {
    type Err = UnknownSyncDirection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active2Passive" => Ok(Self::Active2Passive),
            "Passive2Active" => Ok(Self::Passive2Active),
            "Bidirectional" => Ok(Self::Bidirectional),
            other => Err(UnknownSyncDirection(other.to_owned())),
        }
    }
}

impl Display for SyncDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active2Passive => "Active2Passive",
            Self::Passive2Active => "Passive2Active",
            Self::Bidirectional => "Bidirectional",
        };
        f.pad(name)
    }
}

/// Cadence of an entry's synchronization: on filesystem event or on timer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SyncType {
    Immediate,
    Periodic,
}

#[derive(Clone, Debug, ThisError)]
#[error("unsupported sync type [{0}]")]
pub struct UnknownSyncType(pub String);

impl FromStr for SyncType {
    type Err = UnknownSyncType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Immediate" => Ok(Self::Immediate),
            "Periodic" => Ok(Self::Periodic),
            other => Err(UnknownSyncType(other.to_owned())),
        }
    }
}

impl Display for SyncType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Immediate => "Immediate",
            Self::Periodic => "Periodic",
        };
        f.pad(name)
    }
}

use core::fmt::{self, Display, Formatter};

/// The local controller's designation within the redundancy pair.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BmcRole {
    Active,
    Passive,
    /// Role not yet discovered from the redundancy provider.
    #[default]
    Unknown,
}

impl Display for BmcRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "Active",
            Self::Passive => "Passive",
            Self::Unknown => "Unknown",
        };
        f.pad(name)
    }
}

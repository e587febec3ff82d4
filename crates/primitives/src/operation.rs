use std::collections::BTreeMap;
use std::path::PathBuf;

/// Action the engine must take for a changed path.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum DataOp {
    Copy,
    Delete,
}

/// One filesystem change, resolved to an absolute path.
pub type DataOperation = (PathBuf, DataOp);

/// Coalesced operations from a single read of the event buffer.
///
/// The map form collapses duplicate `(path, op)` pairs; a later operation on
/// the same path supersedes the earlier one.
pub type DataOperations = BTreeMap<PathBuf, DataOp>;

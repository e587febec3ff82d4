//! Failure classification and include-list narrowing for vanished sources.
//!
//! A source that disappears between enumeration and transfer surfaces as a
//! `file has vanished: "<path>"` line on the executor's error stream. The
//! classifier collects those roots and rebuilds a transfer that retries only
//! the include-list entries still relevant under them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use datasync_config::SyncEntry;

const VANISHED_MARKER: &str = "file has vanished: \"";

/// Extract every vanished source path from the executor's error stream.
#[must_use]
pub fn vanished_src_paths(output: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut rest = output;

    while let Some(start) = rest.find(VANISHED_MARKER) {
        rest = &rest[start + VANISHED_MARKER.len()..];
        let Some(end) = rest.find('"') else {
            break;
        };
        paths.push(PathBuf::from(&rest[..end]));
        rest = &rest[end + 1..];
    }

    paths
}

/// Filter arguments and source paths for a narrowed retry.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RefinedTransfer {
    pub filters: Vec<String>,
    pub sources: Vec<String>,
}

/// Narrow the entry's include list to the subset under the vanished roots.
///
/// For every matching include, the chain of intermediate directories down to
/// the include becomes `--include=<dir>/` arguments, followed by
/// `--include=<leaf>/***` for directory leaves (trailing `/` in the pattern)
/// or `--include=<leaf>` for files, then a terminating `--exclude=*`. The
/// vanished roots themselves are re-listed as trailing-slash sources.
/// Everything is deduplicated, in path order.
#[must_use]
pub fn refine_for_vanished(entry: &SyncEntry, vanished_roots: &[PathBuf]) -> RefinedTransfer {
    let mut filters = Vec::new();
    let mut seen = HashSet::new();

    if let Some(includes) = &entry.include_list {
        for root in vanished_roots {
            for include in includes {
                let raw = include.as_os_str().to_string_lossy();
                let is_dir_leaf = raw.ends_with('/');
                let leaf = resolve_include(&entry.path, raw.trim_end_matches('/'));

                if !leaf.starts_with(root) {
                    continue;
                }

                for ancestor in intermediate_dirs(&leaf) {
                    push_unique(&mut filters, &mut seen, format!("--include={}/", ancestor.display()));
                }

                if is_dir_leaf {
                    push_unique(&mut filters, &mut seen, format!("--include={}/", leaf.display()));
                    push_unique(&mut filters, &mut seen, format!("--include={}/***", leaf.display()));
                } else {
                    push_unique(&mut filters, &mut seen, format!("--include={}", leaf.display()));
                }
            }
        }

        if !filters.is_empty() {
            filters.push("--exclude=*".to_owned());
        }
    }

    let mut sources = Vec::new();
    for root in vanished_roots {
        let mut source = root.display().to_string();
        if !source.ends_with('/') {
            source.push('/');
        }
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    RefinedTransfer { filters, sources }
}

fn resolve_include(entry_path: &Path, include: &str) -> PathBuf {
    let include = Path::new(include);
    if include.is_absolute() {
        include.to_owned()
    } else {
        entry_path.join(include)
    }
}

/// Directories from the filesystem root down to the leaf's parent,
/// excluding the root itself.
fn intermediate_dirs(leaf: &Path) -> Vec<&Path> {
    let Some(parent) = leaf.parent() else {
        return Vec::new();
    };

    parent
        .ancestors()
        .filter(|dir| !dir.as_os_str().is_empty() && *dir != Path::new("/"))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}

fn push_unique(filters: &mut Vec<String>, seen: &mut HashSet<String>, filter: String) {
    if seen.insert(filter.clone()) {
        filters.push(filter);
    }
}

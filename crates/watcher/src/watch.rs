use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures_util::{FutureExt, StreamExt};
use inotify::{Event, EventMask, EventStream, Inotify, WatchDescriptor, WatchMask, Watches};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use datasync_primitives::{DataOp, DataOperations};

use crate::WatchError;

/// Events of interest on an existing file.
fn file_mask() -> WatchMask {
    WatchMask::CLOSE_WRITE | WatchMask::DELETE_SELF
}

/// Events of interest on a directory inside a watched tree.
fn dir_mask() -> WatchMask {
    WatchMask::CLOSE_WRITE
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
}

/// Events armed on the closest existing parent while the configured path is
/// absent from the filesystem.
fn parent_mask() -> WatchMask {
    WatchMask::CREATE | WatchMask::CLOSE_WRITE | WatchMask::DELETE | WatchMask::DELETE_SELF
}

const EVENT_BUFFER_SIZE: usize = 4096;

/// Watches one configured path and yields batches of data operations.
pub struct DataWatcher {
    configured_path: PathBuf,
    is_directory: bool,
    include_list: Option<Vec<PathBuf>>,
    exclude_list: Option<Vec<PathBuf>>,
    stream: EventStream<[u8; EVENT_BUFFER_SIZE]>,
    watches: Watches,
    /// Authoritative mapping from watch handle to the absolute path it
    /// covers; event-relative names resolve through it.
    descriptors: HashMap<WatchDescriptor, PathBuf>,
    /// Set while the primary watch sits on an existing parent because the
    /// configured path is absent.
    watching_parent: bool,
}

impl DataWatcher {
    /// Arm watches for `path` and its subtree (directories), or for the
    /// closest existing parent when the path does not exist yet.
    ///
    /// Include/exclude patterns are path prefixes; relative patterns are
    /// resolved against the configured path.
    pub fn new(
        path: &Path,
        is_directory: bool,
        include_list: Option<Vec<PathBuf>>,
        exclude_list: Option<Vec<PathBuf>>,
    ) -> Result<Self, WatchError> {
        let inotify = Inotify::init().map_err(WatchError::Init)?;
        let stream = inotify
            .into_event_stream([0_u8; EVENT_BUFFER_SIZE])
            .map_err(WatchError::Init)?;
        let watches = stream.watches();

        let resolve = |list: Option<Vec<PathBuf>>| {
            list.map(|patterns| {
                patterns
                    .into_iter()
                    .map(|pattern| {
                        if pattern.is_absolute() {
                            pattern
                        } else {
                            path.join(pattern)
                        }
                    })
                    .collect()
            })
        };

        let mut watcher = Self {
            configured_path: path.to_owned(),
            is_directory,
            include_list: resolve(include_list),
            exclude_list: resolve(exclude_list),
            stream,
            watches,
            descriptors: HashMap::new(),
            watching_parent: false,
        };

        watcher.arm();

        Ok(watcher)
    }

    /// Number of active kernel watches; exposed for observability and tests.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Await the next batch of interesting changes.
    ///
    /// Blocks until at least one retained operation is available, then drains
    /// whatever else the kernel already buffered; duplicate `(path, op)`
    /// pairs within the batch are coalesced.
    pub async fn next_operations(&mut self) -> Result<DataOperations, WatchError> {
        loop {
            let mut operations = DataOperations::new();

            match self.stream.next().await {
                Some(Ok(event)) => self.process_event(&event, &mut operations),
                Some(Err(err)) => return Err(WatchError::Channel(err)),
                None => return Err(WatchError::Closed),
            }

            while let Some(buffered) = self.stream.next().now_or_never().flatten() {
                match buffered {
                    Ok(event) => self.process_event(&event, &mut operations),
                    Err(err) => return Err(WatchError::Channel(err)),
                }
            }

            if !operations.is_empty() {
                return Ok(operations);
            }
        }
    }

    fn arm(&mut self) {
        if self.configured_path.exists() {
            if self.is_directory {
                let root = self.configured_path.clone();
                self.add_watch_tree(&root);
            } else {
                let path = self.configured_path.clone();
                self.add_watch(&path, file_mask());
            }
        } else {
            let parent = existing_parent(&self.configured_path);
            warn!(
                path = %self.configured_path.display(),
                parent = %parent.display(),
                "configured path absent, watching the existing parent"
            );
            self.watching_parent = true;
            self.add_watch(&parent, parent_mask());
        }
    }

    /// Register a single watch. Failure to acquire a handle is non-fatal for
    /// the entry: a later full sync still covers the path.
    fn add_watch(&mut self, path: &Path, mask: WatchMask) {
        match self.watches.add(path, mask) {
            Ok(descriptor) => {
                trace!(path = %path.display(), "watch added");
                let _previous = self.descriptors.insert(descriptor, path.to_owned());
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to add watch, continuing without it");
            }
        }
    }

    fn add_watch_tree(&mut self, root: &Path) {
        self.add_watch(root, dir_mask());

        for dir_entry in WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_map(|dir_entry| dir_entry.ok())
        {
            if dir_entry.file_type().is_dir() {
                let path = dir_entry.path().to_owned();
                if self.retained(&path) {
                    self.add_watch(&path, dir_mask());
                }
            }
        }
    }

    /// Emit Copy operations for every file already present under `root`, so
    /// that moving a populated directory into the tree is not lost.
    fn emit_existing_files(&self, root: &Path, operations: &mut DataOperations) {
        for dir_entry in WalkDir::new(root)
            .into_iter()
            .filter_map(|dir_entry| dir_entry.ok())
        {
            if dir_entry.file_type().is_file() {
                let path = dir_entry.path().to_owned();
                if self.retained(&path) {
                    let _previous = operations.insert(path, DataOp::Copy);
                }
            }
        }
    }

    /// Whether events on `path` are relevant under the include/exclude lists.
    fn retained(&self, path: &Path) -> bool {
        // A parent watch also observes unrelated siblings; only the
        // configured path and its subtree matter.
        if !path.starts_with(&self.configured_path) {
            return false;
        }

        if let Some(excludes) = &self.exclude_list {
            if excludes.iter().any(|pattern| path.starts_with(pattern)) {
                return false;
            }
        }

        if let Some(includes) = &self.include_list {
            if path != self.configured_path
                && !includes.iter().any(|pattern| {
                    path.starts_with(pattern) || pattern.starts_with(path)
                })
            {
                return false;
            }
        }

        true
    }

    fn process_event(&mut self, event: &Event<std::ffi::OsString>, operations: &mut DataOperations) {
        if event.mask.contains(EventMask::IGNORED) {
            let _retired = self.descriptors.remove(&event.wd);
            return;
        }

        let Some(base) = self.descriptors.get(&event.wd).cloned() else {
            trace!("event for a retired watch descriptor");
            return;
        };

        let path = match &event.name {
            Some(name) => base.join(name),
            None => base,
        };
        let is_dir = event.mask.contains(EventMask::ISDIR);

        trace!(path = %path.display(), mask = ?event.mask, "inotify event");

        if event.mask.contains(EventMask::CLOSE_WRITE) {
            self.on_close_write(path, operations);
        } else if event.mask.contains(EventMask::CREATE) {
            self.on_create(path, is_dir, operations);
        } else if event.mask.contains(EventMask::MOVED_TO) {
            self.on_moved_to(path, is_dir, operations);
        } else if event.mask.contains(EventMask::MOVED_FROM) {
            self.on_moved_from(&path, operations);
        } else if event.mask.contains(EventMask::DELETE) {
            self.on_delete(path, operations);
        } else if event.mask.contains(EventMask::DELETE_SELF) {
            let descriptor = event.wd.clone();
            self.on_delete_self(&descriptor, path, operations);
        }
    }

    fn on_close_write(&mut self, path: PathBuf, operations: &mut DataOperations) {
        if self.watching_parent && path == self.configured_path {
            self.rearm_primary();
        }

        if self.retained(&path) {
            let _previous = operations.insert(path, DataOp::Copy);
        }
    }

    fn on_create(&mut self, path: PathBuf, is_dir: bool, operations: &mut DataOperations) {
        if path == self.configured_path {
            self.rearm_primary();
            if self.is_directory {
                self.emit_existing_files(&path, operations);
            }
            // For a file, CREATE alone is not enough; wait for CLOSE_WRITE.
            return;
        }

        if self.watching_parent && is_dir && self.configured_path.starts_with(&path) {
            self.advance_parent_watch(operations);
            return;
        }

        if is_dir && self.is_directory && self.retained(&path) {
            self.add_watch_tree(&path);
            self.emit_existing_files(&path, operations);
        }
    }

    fn on_moved_to(&mut self, path: PathBuf, is_dir: bool, operations: &mut DataOperations) {
        if path == self.configured_path {
            self.rearm_primary();
        }

        if is_dir && self.is_directory && self.retained(&path) {
            self.add_watch_tree(&path);
            self.emit_existing_files(&path, operations);
        }

        if self.retained(&path) {
            let _previous = operations.insert(path, DataOp::Copy);
        }
    }

    fn on_moved_from(&mut self, path: &Path, operations: &mut DataOperations) {
        if self.retained(path) {
            let _previous = operations.insert(path.to_owned(), DataOp::Delete);
        }
    }

    fn on_delete(&mut self, path: PathBuf, operations: &mut DataOperations) {
        if self.retained(&path) {
            let _previous = operations.insert(path, DataOp::Delete);
        }
    }

    fn on_delete_self(
        &mut self,
        descriptor: &WatchDescriptor,
        path: PathBuf,
        operations: &mut DataOperations,
    ) {
        // The kernel retires the watch with the inode; drop our side too.
        let _retired = self.descriptors.remove(descriptor);

        if self.retained(&path) {
            let _previous = operations.insert(path.clone(), DataOp::Delete);
        }

        if path == self.configured_path
            || (self.watching_parent && self.configured_path.starts_with(&path))
        {
            // The configured path, or the parent standing in for it, is
            // gone; fall back to whatever still exists above it.
            let parent = existing_parent(&self.configured_path);
            debug!(
                path = %path.display(),
                parent = %parent.display(),
                "watched path deleted, falling back to the existing parent"
            );
            self.watching_parent = true;
            self.add_watch(&parent, parent_mask());
        }
    }

    /// A missing ancestor of the configured path appeared. Deeper components
    /// may already exist by the time the event is read, so re-evaluate from
    /// the filesystem instead of trusting the event alone.
    fn advance_parent_watch(&mut self, operations: &mut DataOperations) {
        if self.configured_path.exists() {
            let configured = self.configured_path.clone();
            self.rearm_primary();
            if self.is_directory {
                self.emit_existing_files(&configured, operations);
            } else if self.retained(&configured) {
                // The file landed while its parent was unwatched; the
                // CLOSE_WRITE is gone, so emit the copy now.
                let _previous = operations.insert(configured, DataOp::Copy);
            }
        } else {
            let parent = existing_parent(&self.configured_path);
            self.add_watch(&parent, parent_mask());
        }
    }

    /// The configured path (re)appeared: arm it directly.
    fn rearm_primary(&mut self) {
        self.watching_parent = false;
        if self.is_directory {
            let root = self.configured_path.clone();
            self.add_watch_tree(&root);
        } else {
            let path = self.configured_path.clone();
            self.add_watch(&path, file_mask());
        }
    }
}

/// Closest ancestor of `path` that exists on the filesystem.
fn existing_parent(path: &Path) -> PathBuf {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir.as_os_str().is_empty() {
            break;
        }
        if dir.exists() {
            return dir.to_owned();
        }
        current = dir.parent();
    }
    PathBuf::from("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_parent_walks_up_to_the_first_present_dir() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c/file");
        assert_eq!(existing_parent(&deep), dir.path());
        assert_eq!(existing_parent(Path::new("/definitely/not/here")), Path::new("/"));
    }
}

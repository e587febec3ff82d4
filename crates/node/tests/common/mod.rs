//! Shared fixtures for the engine integration tests: an in-process transfer
//! executor working on the local filesystem, a scriptable executor, and an
//! in-memory platform bus.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::time::timeout;

use datasync_config::SyncEntry;
use datasync_node::bus::{
    OwnerChange, PlatformBus, PropertyMap, PropertyValue, StateProviderError, SubtreeEntry,
};
use datasync_node::transfer::{Transfer, TransferKind, TransferOutcome, TransferRequest};
use datasync_node::ControlHandle;
use datasync_primitives::{FullSyncStatus, SyncDirection, SyncType};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn file_entry(path: &Path, dest: &Path, direction: SyncDirection) -> SyncEntry {
    SyncEntry {
        path: path.to_owned(),
        is_directory: false,
        dest_path: Some(dest.to_owned()),
        direction,
        sync_type: SyncType::Immediate,
        periodicity: None,
        retry: None,
        include_list: None,
        exclude_list: None,
        state_driven: None,
    }
}

pub fn dir_entry(path: &Path, dest: &Path, direction: SyncDirection) -> SyncEntry {
    SyncEntry {
        is_directory: true,
        ..file_entry(path, dest, direction)
    }
}

/// Poll the control handle until the campaign settles.
pub async fn wait_for_terminal_status(control: &ControlHandle) -> FullSyncStatus {
    timeout(TEST_TIMEOUT, async {
        loop {
            let status = control.full_sync_status();
            if matches!(status, FullSyncStatus::Completed | FullSyncStatus::Failed) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("full sync did not settle in time")
}

/// Poll until `predicate` holds.
pub async fn wait_until<F: Fn() -> bool>(predicate: F) {
    timeout(TEST_TIMEOUT, async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition did not hold in time")
}

/// Transfer executor that mirrors sources with plain filesystem copies.
///
/// Failure messages imitate rsync's diagnostics so the classifier sees the
/// production shape.
#[derive(Clone, Debug, Default)]
pub struct FsCopyTransfer;

#[async_trait]
impl Transfer for FsCopyTransfer {
    async fn execute(&self, request: &TransferRequest) -> TransferOutcome {
        execute_locally(request)
    }
}

pub fn execute_locally(request: &TransferRequest) -> TransferOutcome {
    let destination = Path::new(&request.destination);

    match request.kind {
        TransferKind::Remove => {
            let result = if destination.is_dir() {
                std::fs::remove_dir_all(destination)
            } else if destination.exists() {
                std::fs::remove_file(destination)
            } else {
                Ok(())
            };

            match result {
                Ok(()) => TransferOutcome::ok(),
                Err(err) => TransferOutcome::failed(err.to_string()),
            }
        }
        TransferKind::Sync => {
            for source in &request.sources {
                let outcome = if let Some(tree) = source.strip_suffix('/') {
                    copy_tree(Path::new(tree), destination)
                } else {
                    copy_file(Path::new(source), destination)
                };

                if let Err(stderr) = outcome {
                    return TransferOutcome::failed(stderr);
                }
            }
            TransferOutcome::ok()
        }
    }
}

fn copy_file(source: &Path, destination: &Path) -> Result<(), String> {
    if !source.exists() {
        return Err(format!(
            "rsync: link_stat \"{}\" failed: No such file or directory (2)",
            source.display()
        ));
    }

    std::fs::copy(source, destination)
        .map(|_| ())
        .map_err(|err| format!("rsync: write failed on \"{}\": {err}", destination.display()))
}

fn copy_tree(source: &Path, destination: &Path) -> Result<(), String> {
    if !source.is_dir() {
        return Err(format!(
            "rsync: change_dir \"{}\" failed: No such file or directory (2)",
            source.display()
        ));
    }

    std::fs::create_dir_all(destination).map_err(|err| err.to_string())?;

    for child in std::fs::read_dir(source).map_err(|err| err.to_string())? {
        let child = child.map_err(|err| err.to_string())?;
        let target = destination.join(child.file_name());
        if child.path().is_dir() {
            copy_tree(&child.path(), &target)?;
        } else {
            let _bytes = std::fs::copy(child.path(), &target).map_err(|err| err.to_string())?;
        }
    }

    Ok(())
}

/// Wraps another executor, recording every request and optionally slowing
/// each invocation down.
pub struct RecordingTransfer<T> {
    inner: T,
    delay: Duration,
    requests: Mutex<Vec<TransferRequest>>,
    executed: AtomicUsize,
}

impl<T> RecordingTransfer<T> {
    pub fn new(inner: T, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            requests: Mutex::new(Vec::new()),
            executed: AtomicUsize::new(0),
        }
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl<T: Transfer> Transfer for RecordingTransfer<T> {
    async fn execute(&self, request: &TransferRequest) -> TransferOutcome {
        self.requests.lock().unwrap().push(request.clone());
        let _count = self.executed.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.inner.execute(request).await
    }
}

/// Pops pre-scripted outcomes; succeeds once the script runs out.
#[derive(Default)]
pub struct ScriptedTransfer {
    outcomes: Mutex<VecDeque<TransferOutcome>>,
    requests: Mutex<Vec<TransferRequest>>,
}

impl ScriptedTransfer {
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = TransferOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transfer for ScriptedTransfer {
    async fn execute(&self, request: &TransferRequest) -> TransferOutcome {
        self.requests.lock().unwrap().push(request.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(TransferOutcome::ok)
    }
}

/// In-memory platform bus hosting a single object.
pub struct MockBus {
    service: String,
    object_path: String,
    interface: String,
    properties: Mutex<PropertyMap>,
    owner_present: Mutex<bool>,
    property_events: broadcast::Sender<PropertyMap>,
    owner_events: broadcast::Sender<OwnerChange>,
}

impl MockBus {
    pub fn new(service: &str, object_path: &str, interface: &str) -> Arc<Self> {
        let (property_events, _property_rx) = broadcast::channel(64);
        let (owner_events, _owner_rx) = broadcast::channel(64);

        Arc::new(Self {
            service: service.to_owned(),
            object_path: object_path.to_owned(),
            interface: interface.to_owned(),
            properties: Mutex::new(PropertyMap::new()),
            owner_present: Mutex::new(true),
            property_events,
            owner_events,
        })
    }

    pub fn set_property(&self, name: &str, value: PropertyValue) {
        let snapshot = {
            let mut properties = self.properties.lock().unwrap();
            let _previous = properties.insert(name.to_owned(), value);
            properties.clone()
        };
        let _receivers = self.property_events.send(snapshot);
    }

    pub fn drop_owner(&self) {
        *self.owner_present.lock().unwrap() = false;
        let _receivers = self.owner_events.send(OwnerChange {
            service: self.service.clone(),
            new_owner: None,
        });
    }

    pub fn restore_owner(&self) {
        *self.owner_present.lock().unwrap() = true;
        let _receivers = self.owner_events.send(OwnerChange {
            service: self.service.clone(),
            new_owner: Some(":1.42".to_owned()),
        });
    }
}

fn broadcast_stream<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> BoxStream<'static, T> {
    futures_util::stream::unfold(rx, |mut rx| async {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl PlatformBus for MockBus {
    async fn interface_subtree(
        &self,
        interface: &str,
    ) -> Result<Vec<SubtreeEntry>, StateProviderError> {
        if interface != self.interface || !*self.owner_present.lock().unwrap() {
            return Ok(Vec::new());
        }

        Ok(vec![SubtreeEntry {
            object_path: self.object_path.clone(),
            service: self.service.clone(),
            interfaces: vec![self.interface.clone()],
        }])
    }

    async fn get_all_properties(
        &self,
        service: &str,
        object_path: &str,
        interface: &str,
    ) -> Result<PropertyMap, StateProviderError> {
        if service != self.service || object_path != self.object_path || interface != self.interface
        {
            return Err(StateProviderError::Properties(format!(
                "unknown object {service} {object_path} {interface}"
            )));
        }

        Ok(self.properties.lock().unwrap().clone())
    }

    async fn properties_changed(
        &self,
        _service: &str,
        _object_path: &str,
        _interface: &str,
    ) -> Result<BoxStream<'static, PropertyMap>, StateProviderError> {
        Ok(broadcast_stream(self.property_events.subscribe()))
    }

    async fn name_owner_changed(
        &self,
        _service: &str,
    ) -> Result<BoxStream<'static, OwnerChange>, StateProviderError> {
        Ok(broadcast_stream(self.owner_events.subscribe()))
    }
}

//! The sync engine: owner of every entry and dispatcher of every transfer.
//!
//! One `select!` loop consumes watcher batches, periodic due-times,
//! state-controller commands, full-sync triggers, transfer completions and
//! cancellation. All entry state (suspend flag, single-flight flag, dirty
//! bit) is mutated here and nowhere else.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::{Result as EyreResult, WrapErr};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use datasync_config::SyncEntry;
use datasync_primitives::{
    BmcRole, DataOp, DataOperations, EntryId, FullSyncStatus, SyncEventsHealth, SyncType,
};
use datasync_watcher::DataWatcher;

use crate::bus::PlatformBus;
use crate::control::ControlHandle;
use crate::external::ExternalData;
use crate::retry::{refine_for_vanished, vanished_src_paths};
use crate::state_driven::{watch_interface, InterfaceGroup, StateCommand};
use crate::transfer::{Transfer, TransferRequest};

/// Message funneled into the engine loop by watcher and timer tasks.
enum EngineEvent {
    /// A batch of coalesced operations from an entry's watcher.
    Changes {
        entry: EntryId,
        operations: DataOperations,
    },
    /// The entry's watcher lost its event channel and must be restarted.
    WatcherLost { entry: EntryId },
    /// A periodic entry's deadline elapsed.
    PeriodicDue { entry: EntryId },
}

/// Engine-owned runtime record for one configured entry.
struct EntryRuntime {
    cfg: Arc<SyncEntry>,
    suspended: bool,
    in_flight: bool,
    /// Watcher events arrived while a transfer was in flight; re-run once on
    /// completion.
    dirty: bool,
}

pub struct SyncEngine {
    entries: Vec<EntryRuntime>,
    transfer: Arc<dyn Transfer>,
    external: Arc<dyn ExternalData>,
    bus: Option<Arc<dyn PlatformBus>>,
    token: CancellationToken,

    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: mpsc::Receiver<EngineEvent>,
    state_tx: mpsc::Sender<StateCommand>,
    state_rx: mpsc::Receiver<StateCommand>,
    full_sync_rx: mpsc::Receiver<()>,
    status_tx: watch::Sender<FullSyncStatus>,
    health_tx: watch::Sender<SyncEventsHealth>,

    role: BmcRole,
    redundancy_enabled: bool,
}

impl SyncEngine {
    /// Build an engine over the loaded configuration.
    ///
    /// `bus` is optional: without one, state-driven descriptors are inert
    /// (and warned about); everything else works unchanged.
    pub fn new(
        entries: Vec<SyncEntry>,
        transfer: Arc<dyn Transfer>,
        external: Arc<dyn ExternalData>,
        bus: Option<Arc<dyn PlatformBus>>,
        token: CancellationToken,
    ) -> (Self, ControlHandle) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = mpsc::channel(64);
        let (full_sync_tx, full_sync_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(FullSyncStatus::NotStarted);
        let (health_tx, health_rx) = watch::channel(SyncEventsHealth::Ok);

        let engine = Self {
            entries: entries
                .into_iter()
                .map(|cfg| EntryRuntime {
                    cfg: Arc::new(cfg),
                    suspended: false,
                    in_flight: false,
                    dirty: false,
                })
                .collect(),
            transfer,
            external,
            bus,
            token,
            events_tx,
            events_rx,
            state_tx,
            state_rx,
            full_sync_rx,
            status_tx,
            health_tx,
            role: BmcRole::Unknown,
            redundancy_enabled: false,
        };

        let handle = ControlHandle {
            full_sync_tx,
            status_rx,
            health_rx,
        };

        (engine, handle)
    }

    /// Seed the published health before the engine runs; the control-surface
    /// owner uses this to carry state across restarts.
    pub fn set_sync_events_health(&self, health: SyncEventsHealth) {
        let _previous = self.health_tx.send_replace(health);
    }

    /// Discover the role, register every entry, run the startup full-sync
    /// campaign, then serve events until cancelled.
    pub async fn run(mut self) -> EyreResult<()> {
        let props = self
            .external
            .fetch_redundancy_props()
            .await
            .wrap_err("failed to discover the local role")?;
        self.role = props.role;
        self.redundancy_enabled = props.redundancy_enabled;

        info!(
            role = %self.role,
            redundancy = self.redundancy_enabled,
            entries = self.entries.len(),
            "sync engine starting"
        );

        self.register_entries();

        let mut transfers: JoinSet<(EntryId, bool)> = JoinSet::new();

        if self.redundancy_enabled {
            self.run_full_sync().await;
        } else {
            warn!("redundancy disabled, transfers are parked");
        }

        loop {
            tokio::select! {
                () = self.token.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                Some(()) = self.full_sync_rx.recv() => {
                    // Campaigns serialize against in-flight transfers.
                    self.drain_transfers(&mut transfers).await;
                    self.run_full_sync().await;
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event, &mut transfers);
                }
                Some(command) = self.state_rx.recv() => {
                    self.handle_state_command(command, &mut transfers);
                }
                Some(finished) = transfers.join_next(), if !transfers.is_empty() => {
                    match finished {
                        Ok((entry, success)) => {
                            self.on_transfer_complete(entry, success, &mut transfers);
                        }
                        Err(err) => error!(%err, "transfer task panicked"),
                    }
                }
            }
        }

        // In-flight transfers are allowed to complete; their results are
        // ignored past this point.
        transfers.detach_all();

        Ok(())
    }

    fn register_entries(&mut self) {
        let mut interface_groups: HashMap<String, InterfaceGroup> = HashMap::new();

        for index in 0..self.entries.len() {
            let entry = EntryId::new(index);
            let cfg = Arc::clone(&self.entries[index].cfg);

            match cfg.sync_type {
                SyncType::Immediate => self.spawn_watcher(entry),
                SyncType::Periodic => self.schedule_periodic(entry),
            }

            if let Some(state_driven) = &cfg.state_driven {
                for (interface, info) in &state_driven.interfaces {
                    interface_groups
                        .entry(interface.clone())
                        .or_insert_with(|| InterfaceGroup {
                            interface: interface.clone(),
                            members: Vec::new(),
                        })
                        .members
                        .push((entry, info.clone()));
                }
            }
        }

        if interface_groups.is_empty() {
            return;
        }

        match &self.bus {
            Some(bus) => {
                for (_, group) in interface_groups {
                    drop(tokio::spawn(watch_interface(
                        Arc::clone(bus),
                        group,
                        self.state_tx.clone(),
                        self.token.child_token(),
                    )));
                }
            }
            None => warn!("state-driven entries configured but no platform bus is wired"),
        }
    }

    /// Run one entry's watcher until cancellation; a channel failure is
    /// reported so the engine can respawn it.
    fn spawn_watcher(&self, entry: EntryId) {
        let cfg = Arc::clone(&self.entries[entry.index()].cfg);
        let events = self.events_tx.clone();
        let token = self.token.clone();

        drop(tokio::spawn(async move {
            let mut watcher = match DataWatcher::new(
                &cfg.path,
                cfg.is_directory,
                cfg.include_list.clone(),
                cfg.exclude_list.clone(),
            ) {
                Ok(watcher) => watcher,
                Err(err) => {
                    error!(path = %cfg.path.display(), %err, "failed to start watcher");
                    return;
                }
            };

            debug!(
                path = %cfg.path.display(),
                watches = watcher.watch_count(),
                "watcher armed"
            );

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    batch = watcher.next_operations() => match batch {
                        Ok(operations) => {
                            if events.send(EngineEvent::Changes { entry, operations }).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(%entry, %err, "watcher channel failed");
                            let _delivered =
                                events.send(EngineEvent::WatcherLost { entry }).await;
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Arm the entry's next periodic deadline. The deadline is measured from
    /// now, i.e. after the previous completion, not after its start.
    fn schedule_periodic(&self, entry: EntryId) {
        let Some(periodicity) = self.entries[entry.index()].cfg.periodicity else {
            return;
        };

        let events = self.events_tx.clone();
        let token = self.token.clone();
        let deadline = Instant::now() + periodicity;

        drop(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = sleep_until(deadline) => {
                    let _delivered = events.send(EngineEvent::PeriodicDue { entry }).await;
                }
            }
        }));
    }

    fn handle_event(&mut self, event: EngineEvent, transfers: &mut JoinSet<(EntryId, bool)>) {
        match event {
            EngineEvent::Changes { entry, operations } => {
                if self.entries[entry.index()].suspended {
                    debug!(%entry, "suspended, discarding watcher events");
                    return;
                }

                let request = {
                    let cfg = &self.entries[entry.index()].cfg;
                    request_for(cfg, &operations)
                };
                self.kick(entry, request, transfers);
            }
            EngineEvent::WatcherLost { entry } => {
                warn!(%entry, "restarting watcher");
                self.spawn_watcher(entry);
            }
            EngineEvent::PeriodicDue { entry } => {
                let runtime = &self.entries[entry.index()];

                if !self.redundancy_enabled || !runtime.cfg.direction.runs_on(self.role) {
                    // Keep the schedule alive even while gated off.
                    self.schedule_periodic(entry);
                    return;
                }

                if runtime.suspended {
                    // Resume will issue the sync and restart the schedule.
                    debug!(%entry, "suspended, skipping periodic sync");
                    return;
                }

                let request = TransferRequest::sync_entry(&runtime.cfg);
                self.kick(entry, request, transfers);
            }
        }
    }

    fn handle_state_command(
        &mut self,
        command: StateCommand,
        transfers: &mut JoinSet<(EntryId, bool)>,
    ) {
        match command {
            StateCommand::Suspend { entry, interface } => {
                let runtime = &mut self.entries[entry.index()];
                if !runtime.suspended {
                    runtime.suspended = true;
                    // Events are discarded while suspended, not queued.
                    runtime.dirty = false;
                    info!(%entry, %interface, "sync suspended");
                }
            }
            StateCommand::Resume { entry, interface } => {
                let was_suspended = {
                    let runtime = &mut self.entries[entry.index()];
                    // The single resume sync covers any pending dirty bit.
                    runtime.dirty = false;
                    std::mem::replace(&mut runtime.suspended, false)
                };

                if !was_suspended {
                    return;
                }

                info!(%entry, %interface, "sync resumed");

                let request = refresh_request(&self.entries[entry.index()].cfg);
                self.kick(entry, request, transfers);
            }
        }
    }

    /// Dispatch a transfer for the entry unless gating forbids it; an entry
    /// already in flight absorbs the request into its dirty bit.
    fn kick(
        &mut self,
        entry: EntryId,
        request: TransferRequest,
        transfers: &mut JoinSet<(EntryId, bool)>,
    ) {
        if !self.redundancy_enabled {
            return;
        }

        let runtime = &self.entries[entry.index()];

        if !runtime.cfg.direction.runs_on(self.role) {
            debug!(
                %entry,
                direction = %runtime.cfg.direction,
                role = %self.role,
                "direction does not match the local role, skipping"
            );
            return;
        }

        if runtime.suspended {
            debug!(%entry, "suspended, not dispatching");
            return;
        }

        if runtime.in_flight {
            self.entries[entry.index()].dirty = true;
            debug!(%entry, "transfer in flight, coalescing into the dirty bit");
            return;
        }

        self.dispatch(entry, request, transfers);
    }

    fn dispatch(
        &mut self,
        entry: EntryId,
        request: TransferRequest,
        transfers: &mut JoinSet<(EntryId, bool)>,
    ) {
        self.entries[entry.index()].in_flight = true;

        let cfg = Arc::clone(&self.entries[entry.index()].cfg);
        let transfer = Arc::clone(&self.transfer);

        let _abort_handle = transfers.spawn(async move {
            let success = execute_with_retry(transfer.as_ref(), &cfg, request).await;
            (entry, success)
        });
    }

    fn on_transfer_complete(
        &mut self,
        entry: EntryId,
        success: bool,
        transfers: &mut JoinSet<(EntryId, bool)>,
    ) {
        let (dirty, periodic) = {
            let runtime = &mut self.entries[entry.index()];
            runtime.in_flight = false;
            let dirty = std::mem::replace(&mut runtime.dirty, false);
            (dirty, runtime.cfg.sync_type == SyncType::Periodic)
        };

        if !success {
            warn!(%entry, "sync cycle failed");
            let _previous = self.health_tx.send_replace(SyncEventsHealth::Critical);
        }

        if dirty {
            debug!(%entry, "re-running once for coalesced events");
            let request = refresh_request(&self.entries[entry.index()].cfg);
            self.kick(entry, request, transfers);
        } else if periodic {
            self.schedule_periodic(entry);
        }
    }

    /// Await every outstanding transfer, applying their completions.
    async fn drain_transfers(&mut self, transfers: &mut JoinSet<(EntryId, bool)>) {
        while let Some(finished) = transfers.join_next().await {
            match finished {
                Ok((entry, success)) => self.on_transfer_complete(entry, success, transfers),
                Err(err) => error!(%err, "transfer task panicked"),
            }
        }
    }

    /// One full-sync campaign: iterate entries in registration order and
    /// transfer each whose direction matches the local role.
    async fn run_full_sync(&mut self) {
        info!("full sync campaign started");
        let _previous = self.status_tx.send_replace(FullSyncStatus::InProgress);

        let mut all_ok = true;

        for index in 0..self.entries.len() {
            if self.token.is_cancelled() {
                break;
            }

            let entry = EntryId::new(index);
            let (cfg, suspended) = {
                let runtime = &self.entries[index];
                (Arc::clone(&runtime.cfg), runtime.suspended)
            };

            if !cfg.direction.runs_on(self.role) {
                debug!(
                    %entry,
                    path = %cfg.path.display(),
                    "skipping entry, direction does not match the local role"
                );
                continue;
            }

            if suspended {
                debug!(%entry, path = %cfg.path.display(), "skipping suspended entry");
                continue;
            }

            self.entries[index].in_flight = true;
            let request = TransferRequest::sync_entry(&cfg);
            let success = execute_with_retry(self.transfer.as_ref(), &cfg, request).await;
            self.entries[index].in_flight = false;

            if !success {
                warn!(%entry, path = %cfg.path.display(), "full sync failed for entry");
                all_ok = false;
            }
        }

        if all_ok {
            let _previous = self.status_tx.send_replace(FullSyncStatus::Completed);
            let _health = self.health_tx.send_replace(SyncEventsHealth::Ok);
            info!("full sync campaign completed");
        } else {
            let _previous = self.status_tx.send_replace(FullSyncStatus::Failed);
            let _health = self.health_tx.send_replace(SyncEventsHealth::Critical);
            error!("full sync campaign failed");
        }
    }
}

/// Map a watcher batch onto a transfer request.
///
/// A deleted file entry propagates the removal; everything else re-syncs the
/// entry, which is idempotent and covers every coalesced operation at once.
fn request_for(cfg: &SyncEntry, operations: &DataOperations) -> TransferRequest {
    if !cfg.is_directory
        && operations.get(&cfg.path) == Some(&DataOp::Delete)
        && !cfg.path.exists()
    {
        return TransferRequest::remove_destination(cfg);
    }

    TransferRequest::sync_entry(cfg)
}

/// Request for a re-run whose triggering operations were coalesced away; the
/// filesystem is re-consulted instead.
fn refresh_request(cfg: &SyncEntry) -> TransferRequest {
    if !cfg.is_directory && !cfg.path.exists() {
        return TransferRequest::remove_destination(cfg);
    }

    TransferRequest::sync_entry(cfg)
}

/// Execute a transfer, reformulating vanished-source failures under the
/// entry's retry policy. Non-vanished failures fail the cycle immediately.
async fn execute_with_retry(
    transfer: &dyn Transfer,
    cfg: &SyncEntry,
    request: TransferRequest,
) -> bool {
    let outcome = transfer.execute(&request).await;
    if outcome.success {
        return true;
    }

    let Some(retry) = cfg.retry else {
        debug!(path = %cfg.path.display(), stderr = %outcome.stderr, "transfer failed");
        return false;
    };

    let mut stderr = outcome.stderr;

    for attempt in 1..=retry.attempts {
        let vanished = vanished_src_paths(&stderr);
        if vanished.is_empty() {
            debug!(
                path = %cfg.path.display(),
                "failure is not a vanished source, not retrying"
            );
            return false;
        }

        info!(
            path = %cfg.path.display(),
            attempt,
            ?vanished,
            "source vanished mid-transfer, retrying with a narrowed plan"
        );

        sleep(retry.interval).await;

        let refined = refine_for_vanished(cfg, &vanished);
        let request = TransferRequest::refined(cfg, refined);
        let outcome = transfer.execute(&request).await;
        if outcome.success {
            return true;
        }
        stderr = outcome.stderr;
    }

    warn!(path = %cfg.path.display(), attempts = retry.attempts, "retries exhausted");
    false
}

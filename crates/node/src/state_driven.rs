//! State-driven suspend/resume controller.
//!
//! Per interface named in the configuration, one controller task resolves the
//! owning service through the object directory, evaluates the initial
//! property state, and then follows the property-changed stream. A companion
//! task monitors service availability: an owner loss is treated as an implied
//! resume, and a reappearance re-resolves the object and re-evaluates.
//!
//! The controller never mutates entry state. Every suspend/resume decision is
//! posted to the engine loop as a [`StateCommand`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use datasync_config::StateInfo;
use datasync_primitives::EntryId;

use crate::bus::{PlatformBus, PropertyMap};

/// Suspend/resume command destined for the engine loop.
#[derive(Clone, Debug)]
pub enum StateCommand {
    Suspend { entry: EntryId, interface: String },
    Resume { entry: EntryId, interface: String },
}

/// Entries indexed under one interface, with their configured state sets.
#[derive(Clone, Debug)]
pub(crate) struct InterfaceGroup {
    pub interface: String,
    pub members: Vec<(EntryId, StateInfo)>,
}

/// The object directory may lag the name-owner signal; retry the lookup a
/// few times per appearance before waiting for the next signal.
const SUBTREE_RETRY_ATTEMPTS: usize = 5;
const SUBTREE_RETRY_DELAY: Duration = Duration::from_millis(30);

/// Polling cadence while the interface has no provider and no pinned service
/// to wait on.
const UNRESOLVED_POLL_DELAY: Duration = Duration::from_secs(1);

pub(crate) async fn watch_interface(
    bus: Arc<dyn PlatformBus>,
    group: InterfaceGroup,
    commands: mpsc::Sender<StateCommand>,
    token: CancellationToken,
) {
    let interface = group.interface.clone();
    let pinned_service = group
        .members
        .iter()
        .find_map(|(_, info)| info.service_name.clone());

    let Some((service, object_path)) =
        resolve_object(bus.as_ref(), &interface, pinned_service.as_deref(), &token).await
    else {
        return;
    };

    info!(%interface, %service, %object_path, "state-driven interface resolved");

    match bus
        .get_all_properties(&service, &object_path, &interface)
        .await
    {
        Ok(properties) => evaluate(&properties, &group, &commands).await,
        Err(err) => warn!(%interface, %err, "initial property fetch failed"),
    }

    drop(tokio::spawn(monitor_service_availability(
        Arc::clone(&bus),
        group.clone(),
        service.clone(),
        commands.clone(),
        token.clone(),
    )));

    let mut changes = match bus
        .properties_changed(&service, &object_path, &interface)
        .await
    {
        Ok(changes) => changes,
        Err(err) => {
            warn!(%interface, %err, "failed to subscribe to property changes");
            return;
        }
    };

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            changed = changes.next() => match changed {
                Some(properties) => evaluate(&properties, &group, &commands).await,
                None => {
                    debug!(%interface, "property stream ended");
                    break;
                }
            }
        }
    }
}

/// Compare current properties against each member's configured value sets
/// and post the resulting commands. Suspend matches are idempotent on the
/// engine side; resume matches only act when the flag was set.
async fn evaluate(
    properties: &PropertyMap,
    group: &InterfaceGroup,
    commands: &mpsc::Sender<StateCommand>,
) {
    for (entry, info) in &group.members {
        if states_match(properties, &info.suspend_states) {
            debug!(%entry, interface = %group.interface, "suspend state matched");
            let _delivered = commands
                .send(StateCommand::Suspend {
                    entry: *entry,
                    interface: group.interface.clone(),
                })
                .await;
        }

        if states_match(properties, &info.resume_states) {
            debug!(%entry, interface = %group.interface, "resume state matched");
            let _delivered = commands
                .send(StateCommand::Resume {
                    entry: *entry,
                    interface: group.interface.clone(),
                })
                .await;
        }
    }
}

fn states_match(
    properties: &PropertyMap,
    expected: &BTreeMap<String, BTreeSet<String>>,
) -> bool {
    expected.iter().any(|(property, allowed)| {
        let Some(value) = properties.get(property) else {
            debug!(%property, "property not found in current state");
            return false;
        };

        let value = value.canonical();
        !value.is_empty() && allowed.contains(&value)
    })
}

/// Resolve `(service, object_path)` hosting the interface.
///
/// When the interface is not in the directory yet, wait on the pinned
/// service's name-owner stream; with no pinned service, poll the directory.
async fn resolve_object(
    bus: &dyn PlatformBus,
    interface: &str,
    pinned_service: Option<&str>,
    token: &CancellationToken,
) -> Option<(String, String)> {
    loop {
        if token.is_cancelled() {
            return None;
        }

        match lookup(bus, interface, pinned_service).await {
            Some(resolved) => return Some(resolved),
            None => match pinned_service {
                Some(service) => {
                    let object_path =
                        wait_until_iface_available(bus, interface, service, token).await?;
                    return Some((service.to_owned(), object_path));
                }
                None => {
                    debug!(interface, "interface not in the object directory yet");
                    tokio::select! {
                        () = token.cancelled() => return None,
                        () = sleep(UNRESOLVED_POLL_DELAY) => {}
                    }
                }
            },
        }
    }
}

/// One directory query; pins the service when one is configured.
async fn lookup(
    bus: &dyn PlatformBus,
    interface: &str,
    pinned_service: Option<&str>,
) -> Option<(String, String)> {
    let subtree = match bus.interface_subtree(interface).await {
        Ok(subtree) => subtree,
        Err(err) => {
            warn!(interface, %err, "object directory query failed");
            return None;
        }
    };

    subtree
        .into_iter()
        .filter(|object| object.interfaces.iter().any(|i| i == interface))
        .find(|object| pinned_service.is_none_or(|service| object.service == service))
        .map(|object| (object.service, object.object_path))
}

/// Wait for `service` to (re)appear, then retry the directory lookup until
/// the interface shows up.
async fn wait_until_iface_available(
    bus: &dyn PlatformBus,
    interface: &str,
    service: &str,
    token: &CancellationToken,
) -> Option<String> {
    let mut owners = match bus.name_owner_changed(service).await {
        Ok(owners) => owners,
        Err(err) => {
            warn!(service, %err, "failed to subscribe to name-owner changes");
            return None;
        }
    };

    debug!(service, interface, "waiting for the service to appear");

    loop {
        tokio::select! {
            () = token.cancelled() => return None,
            change = owners.next() => {
                let change = change?;

                if change.service != service || change.new_owner.is_none() {
                    continue;
                }

                // The owner is registered, but the interface may trail the
                // signal; give the directory a few chances to catch up.
                for _attempt in 0..SUBTREE_RETRY_ATTEMPTS {
                    if let Some((_, object_path)) = lookup(bus, interface, Some(service)).await {
                        debug!(interface, %object_path, "interface available");
                        return Some(object_path);
                    }
                    sleep(SUBTREE_RETRY_DELAY).await;
                }

                debug!(
                    interface,
                    "interface not ready after retries, waiting for the next owner change"
                );
            }
        }
    }
}

/// Follow the service's owner: a loss implies resume for every member, a
/// reappearance re-resolves the object path and re-evaluates the state.
async fn monitor_service_availability(
    bus: Arc<dyn PlatformBus>,
    group: InterfaceGroup,
    service: String,
    commands: mpsc::Sender<StateCommand>,
    token: CancellationToken,
) {
    let mut owners = match bus.name_owner_changed(&service).await {
        Ok(owners) => owners,
        Err(err) => {
            warn!(%service, %err, "failed to monitor service availability");
            return;
        }
    };

    loop {
        let change = tokio::select! {
            () = token.cancelled() => return,
            change = owners.next() => match change {
                Some(change) => change,
                None => return,
            }
        };

        if change.service != service || change.new_owner.is_some() {
            continue;
        }

        info!(%service, "service disappeared, monitoring for recovery");

        // The provider is gone; resume is inferred.
        for (entry, _) in &group.members {
            let _delivered = commands
                .send(StateCommand::Resume {
                    entry: *entry,
                    interface: group.interface.clone(),
                })
                .await;
        }

        let Some(object_path) =
            wait_until_iface_available(bus.as_ref(), &group.interface, &service, &token).await
        else {
            return;
        };

        info!(%service, interface = %group.interface, "service restored, re-evaluating state");

        match bus
            .get_all_properties(&service, &object_path, &group.interface)
            .await
        {
            Ok(properties) => evaluate(&properties, &group, &commands).await,
            Err(err) => warn!(interface = %group.interface, %err, "re-evaluation fetch failed"),
        }
    }
}

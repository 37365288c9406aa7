//! Routing table for D-Bus message routing.
//!
//! The routing table determines whether a well-known name should be reached
//! on the container's own bus or on the host session bus. Container services
//! always take priority over host services with the same name.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace, warn};

/// Which bus a name lives on.
///
/// Also identifies the side a connection, message or pending call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameLocation {
    /// The container's private bus.
    Local,
    /// The host session bus.
    Host,
}

impl NameLocation {
    /// The opposite bus.
    pub fn other(self) -> Self {
        match self {
            NameLocation::Local => NameLocation::Host,
            NameLocation::Host => NameLocation::Local,
        }
    }
}

impl std::fmt::Display for NameLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NameLocation::Local => write!(f, "local"),
            NameLocation::Host => write!(f, "host"),
        }
    }
}

/// Check whether a bus name is a unique connection name (":1.42").
pub fn is_unique_name(name: &str) -> bool {
    name.starts_with(':')
}

/// What the caller must do after a name change was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameChangeOutcome {
    /// The table is up to date.
    Done,
    /// A local owner went away; ask the host bus whether it owns the name.
    RecheckHost(String),
}

/// Routing table that determines message destinations.
///
/// The routing priority is:
/// 1. Names in the table (local entries always shadow host ones)
/// 2. Host-activatable names
/// 3. Local-activatable names
/// 4. Default: route to host (allows unknown host services to be activated)
#[derive(Debug, Default)]
pub struct RoutingTable {
    /// Well-known name to the bus that currently wins it.
    routes: HashMap<String, NameLocation>,

    /// Names that can be activated (started on demand) on the host.
    host_activatable: HashSet<String>,

    /// Names that can be activated on the container bus.
    local_activatable: HashSet<String>,
}

impl RoutingTable {
    /// Create a new empty routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the table from the `ListNames`/`ListActivatableNames` results of
    /// both buses.
    ///
    /// Host names are recorded first and local names second, so a name owned
    /// on both buses routes locally.
    pub fn seed(
        &mut self,
        host_names: impl IntoIterator<Item = String>,
        local_names: impl IntoIterator<Item = String>,
        host_activatable: impl IntoIterator<Item = String>,
        local_activatable: impl IntoIterator<Item = String>,
    ) {
        self.clear();

        for name in host_names.into_iter().filter(|n| !is_unique_name(n)) {
            self.routes.insert(name, NameLocation::Host);
        }
        for name in local_names.into_iter().filter(|n| !is_unique_name(n)) {
            self.routes.insert(name, NameLocation::Local);
        }
        self.host_activatable = host_activatable.into_iter().collect();
        self.local_activatable = local_activatable.into_iter().collect();

        debug!(
            local = self.local_name_count(),
            host = self.host_name_count(),
            host_activatable = self.host_activatable.len(),
            local_activatable = self.local_activatable.len(),
            "Seeded routing table"
        );
    }

    /// Determine which bus a destination should be reached on.
    ///
    /// Returns `None` for empty destinations and unique names, which stay on
    /// the bus they were sent on.
    pub fn route_for(&self, destination: Option<&str>) -> Option<NameLocation> {
        let destination = match destination {
            Some(d) if !d.is_empty() => d,
            _ => return None,
        };

        if is_unique_name(destination) {
            trace!(destination = %destination, "Unique name, no cross-bus route");
            return None;
        }

        if let Some(location) = self.routes.get(destination) {
            trace!(destination = %destination, route = %location, "Routing to owner");
            return Some(*location);
        }

        if self.host_activatable.contains(destination) {
            trace!(destination = %destination, "Routing to host (activatable)");
            return Some(NameLocation::Host);
        }

        if self.local_activatable.contains(destination) {
            trace!(destination = %destination, "Routing to local (activatable)");
            return Some(NameLocation::Local);
        }

        trace!(destination = %destination, "Routing to host (default)");
        Some(NameLocation::Host)
    }

    /// The current table entry for a name, without any fallback policy.
    pub fn location_of(&self, name: &str) -> Option<NameLocation> {
        self.routes.get(name).copied()
    }

    /// Handle a NameOwnerChanged signal from the host bus.
    ///
    /// # Arguments
    /// * `name` - The name that changed.
    /// * `new_owner` - The new owner (empty if released).
    pub fn on_host_name_change(&mut self, name: &str, new_owner: &str) -> NameChangeOutcome {
        if is_unique_name(name) {
            return NameChangeOutcome::Done;
        }

        if new_owner.is_empty() {
            if self.routes.get(name) == Some(&NameLocation::Host) {
                self.routes.remove(name);
                debug!(name = %name, "Name released on host");
            }
        } else {
            self.record_host_owner(name);
        }
        NameChangeOutcome::Done
    }

    /// Handle a NameOwnerChanged signal from the container bus.
    ///
    /// A release asks the caller to look the name up on the host, since the
    /// host may still own it.
    pub fn on_local_name_change(&mut self, name: &str, new_owner: &str) -> NameChangeOutcome {
        if is_unique_name(name) {
            return NameChangeOutcome::Done;
        }

        if new_owner.is_empty() {
            if self.routes.remove(name).is_some() {
                debug!(name = %name, "Name released on container");
            }
            NameChangeOutcome::RecheckHost(name.to_string())
        } else {
            if self.routes.get(name) == Some(&NameLocation::Host) {
                warn!(
                    name = %name,
                    owner = %new_owner,
                    "Container is acquiring a name that also exists on host. \
                     Container will take priority."
                );
            }
            self.routes.insert(name.to_string(), NameLocation::Local);
            debug!(name = %name, owner = %new_owner, "Name acquired on container");
            NameChangeOutcome::Done
        }
    }

    /// Record that the host owns a name, unless the container claims it.
    ///
    /// Returns true if the table now routes the name to the host.
    pub fn record_host_owner(&mut self, name: &str) -> bool {
        if is_unique_name(name) {
            return false;
        }
        match self.routes.get(name) {
            Some(NameLocation::Local) => {
                debug!(name = %name, "Host acquired a name the container owns, keeping local route");
                false
            }
            Some(NameLocation::Host) => true,
            None => {
                self.routes.insert(name.to_string(), NameLocation::Host);
                debug!(name = %name, "Name acquired on host");
                true
            }
        }
    }

    /// Number of names routed to the container bus.
    pub fn local_name_count(&self) -> usize {
        self.routes.values().filter(|l| **l == NameLocation::Local).count()
    }

    /// Number of names routed to the host bus.
    pub fn host_name_count(&self) -> usize {
        self.routes.values().filter(|l| **l == NameLocation::Host).count()
    }

    /// Number of host-activatable names.
    pub fn host_activatable_count(&self) -> usize {
        self.host_activatable.len()
    }

    /// Number of container-activatable names.
    pub fn local_activatable_count(&self) -> usize {
        self.local_activatable.len()
    }

    /// Drop every route and activatable name.
    pub fn clear(&mut self) {
        self.routes.clear();
        self.host_activatable.clear();
        self.local_activatable.clear();
    }
}

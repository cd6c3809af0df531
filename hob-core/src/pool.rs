//! Connection-pool planning: which remote addresses the link graph needs connections to.
//! The host owns the sockets; this module only decides.

use std::collections::BTreeSet;
use std::fmt;

use crate::discovery::DiscoveryTable;
use crate::registry::Registry;

/// Result of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Addresses referenced by at least one link to a known remote object.
    pub wanted: BTreeSet<String>,
    /// Wanted addresses with no connection yet.
    pub to_open: Vec<String>,
    /// Open connections no link references any more. Reported, not closed.
    pub idle: Vec<String>,
}

/// Walk every link and plan one connection per distinct remote address.
pub fn reconcile(registry: &Registry, known: &DiscoveryTable, open: &BTreeSet<String>) -> Reconciliation {
    let wanted: BTreeSet<String> = registry
        .links()
        .filter(|(.., l)| !registry.is_active(&l.destination.object))
        .filter_map(|(.., l)| known.get(&l.destination.object))
        .map(|k| k.ip.clone())
        .collect();
    let to_open = wanted.difference(open).cloned().collect();
    let idle = open.difference(&wanted).cloned().collect();
    Reconciliation {
        wanted,
        to_open,
        idle,
    }
}

/// Ids of the known objects reachable at `ip`.
pub fn objects_at<'a>(known: &'a DiscoveryTable, ip: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    known.iter().filter(move |(_, k)| k.ip == ip).map(|(id, _)| id)
}

/// Connection counts, logged whenever they change.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SocketStatus {
    pub total: usize,
    pub connected: usize,
}

impl SocketStatus {
    pub fn not_connected(&self) -> usize {
        self.total - self.connected
    }
}

impl fmt::Display for SocketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connections; {} connected and {} not connected",
            self.total,
            self.connected,
            self.not_connected()
        )
    }
}

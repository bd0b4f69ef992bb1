//! Process-wide registry of live kernel sessions, keyed by client id.
//!
//! [`crate::manager::KernelManager`] consults this before falling back to a
//! REST lookup, so that `connect_to`/`find_by_id`-style calls return the
//! same live [`crate::session::KernelSession`] object a caller elsewhere in
//! the process already holds, rather than opening a second redundant
//! websocket to the same kernel.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::session::SessionShared;

static REGISTRY: Lazy<DashMap<String, Weak<SessionShared>>> = Lazy::new(DashMap::new);

pub(crate) fn insert(client_id: String, shared: Weak<SessionShared>) {
    REGISTRY.insert(client_id, shared);
}

pub(crate) fn remove(client_id: &str) {
    REGISTRY.remove(client_id);
}

/// Look up a live session by client id. Returns `None` if no session with
/// that id is registered, or if it has since been dropped.
pub(crate) fn find(client_id: &str) -> Option<Arc<SessionShared>> {
    let weak = REGISTRY.get(client_id)?.clone();
    let strong = weak.upgrade();
    if strong.is_none() {
        // Lazily sweep dead entries we happen to stumble on.
        REGISTRY.remove(client_id);
    }
    strong
}

/// Look up any live session already attached to the given kernel id,
/// regardless of its client id. Used by `connectTo` to avoid opening a
/// redundant websocket (and a redundant REST round trip) for a kernel this
/// process already has a session for. Returns the first live match; dead
/// entries encountered along the way are swept.
pub(crate) fn find_by_kernel_id(kernel_id: &str) -> Option<Arc<SessionShared>> {
    let mut dead = Vec::new();
    let mut found = None;
    for entry in REGISTRY.iter() {
        match entry.value().upgrade() {
            Some(shared) if shared.kernel_id() == kernel_id => {
                found = Some(shared);
                break;
            }
            Some(_) => {}
            None => dead.push(entry.key().clone()),
        }
    }
    for client_id in dead {
        REGISTRY.remove(&client_id);
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_returns_none_for_unknown_client_id() {
        assert!(find("no-such-client").is_none());
    }

    #[test]
    fn find_by_kernel_id_returns_none_when_nothing_registered() {
        assert!(find_by_kernel_id("no-such-kernel").is_none());
    }
}

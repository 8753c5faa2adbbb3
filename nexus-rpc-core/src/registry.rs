//! Process-wide lookup from RPC ID to an instance's SM event queue.
//! Registration happens during instance construction, deregistration during
//! destruction; the only long-lived lock in the system is this one, and it
//! is held only across the map mutation/lookup itself.

use std::sync::mpsc::Sender;

use nexus_rpc_sync::SpinLock;

use crate::event_loop::SmEvent;

static REGISTRY: SpinLock<Vec<(u8, Sender<SmEvent>)>> = SpinLock::new(Vec::new());

/// Registers `rpc_id`'s SM event sender. Panics as a fatal, internal
/// invariant violation if the ID is already registered; the
/// session-management thread would otherwise route connect responses to the
/// wrong instance.
pub fn register(rpc_id: u8, sender: Sender<SmEvent>) {
    let mut table = REGISTRY.lock();
    assert!(
        !table.iter().any(|(id, _)| *id == rpc_id),
        "nexus-rpc: duplicate RPC instance id {rpc_id}"
    );
    table.push((rpc_id, sender));
}

pub fn deregister(rpc_id: u8) {
    let mut table = REGISTRY.lock();
    table.retain(|(id, _)| *id != rpc_id);
}

/// Looks up `rpc_id`'s SM queue and hands it `event`. Used by the
/// session-management thread to route connect/disconnect/reset
/// notifications without ever touching datapath state directly.
pub fn route(rpc_id: u8, event: SmEvent) -> bool {
    let table = REGISTRY.lock();
    match table.iter().find(|(id, _)| *id == rpc_id) {
        Some((_, sender)) => sender.send(event).is_ok(),
        None => false,
    }
}

/// Test/demo helper: clears all registrations. Never called by production
/// code paths.
#[cfg(test)]
pub fn clear() {
    REGISTRY.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::SmEvent;
    use std::sync::mpsc;

    #[test]
    fn routes_to_registered_instance() {
        clear();
        let (tx, rx) = mpsc::channel();
        register(5, tx);
        assert!(route(5, SmEvent::DisconnectAck { session_num: 1 }));
        assert!(matches!(rx.recv().unwrap(), SmEvent::DisconnectAck { session_num: 1 }));
        deregister(5);
        assert!(!route(5, SmEvent::DisconnectAck { session_num: 1 }));
    }
}

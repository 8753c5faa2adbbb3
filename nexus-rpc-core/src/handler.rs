//! Handler registration. The table is written once at
//! startup and read lock-free thereafter: callers build it with
//! [`HandlerTable::register_handler`] before handing it to any RPC instance;
//! nothing here enforces that ordering beyond documentation, matching how
//! the rest of the datapath trusts its own invariants rather than guarding
//! against misuse from within the same process.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    Inline,
    Background,
}

/// What a handler function produces for one inbound request.
///
/// `Forward` supports nested RPC: a handler that needs to issue its own
/// downstream request before it can answer the original one returns
/// `Forward` instead of `Respond`, naming the session to send on and the
/// bytes to send. The engine enqueues that request on the caller's behalf
/// and completes the original inbound request with whatever the downstream
/// call returns. All transport-visible actions stay on the event-loop
/// thread, so only inline handlers — which run on that thread — may return
/// `Forward`; a background handler returning it is a configuration error,
/// logged and treated as an empty response.
pub enum HandlerOutcome {
    Respond(Vec<u8>),
    Forward {
        session_num: u16,
        req_type: u8,
        payload: Vec<u8>,
        /// Applied to the downstream response before it completes the
        /// original inbound request (scenario 3: a primary adds
        /// to a backup's echo before replying to its own caller). `None`
        /// forwards the downstream bytes unchanged.
        transform: Option<Box<dyn FnOnce(Vec<u8>) -> Vec<u8> + Send>>,
    },
}

type HandlerFn = Arc<dyn Fn(&[u8]) -> HandlerOutcome + Send + Sync>;

struct HandlerDescriptor {
    mode: HandlerMode,
    func: HandlerFn,
}

pub struct HandlerTable {
    entries: [Option<HandlerDescriptor>; 256],
}

impl HandlerTable {
    pub fn new() -> Self {
        Self { entries: std::array::from_fn(|_| None) }
    }

    /// Registers a handler for `type_id`. Call only before constructing any
    /// RPC instance.
    pub fn register_handler(
        &mut self,
        type_id: u8,
        mode: HandlerMode,
        func: impl Fn(&[u8]) -> HandlerOutcome + Send + Sync + 'static,
    ) {
        self.entries[type_id as usize] = Some(HandlerDescriptor { mode, func: Arc::new(func) });
    }

    pub fn mode_of(&self, type_id: u8) -> Option<HandlerMode> {
        self.entries[type_id as usize].as_ref().map(|d| d.mode)
    }

    pub fn is_registered(&self, type_id: u8) -> bool {
        self.entries[type_id as usize].is_some()
    }

    /// Hash of which request types are registered, sent in the SM connect
    /// handshake so mismatched builds reject each other before
    /// a session forms rather than failing an in-flight request later.
    pub fn type_table_hash(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for (type_id, entry) in self.entries.iter().enumerate() {
            if entry.is_some() {
                hash ^= type_id as u64;
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    /// Invokes the handler registered for `type_id`. Panics if none is
    /// registered: the event loop must check [`Self::is_registered`] (and
    /// surface `kInvalidRemoteRpcId`-class errors synchronously) before this
    /// is ever called.
    pub fn invoke(&self, type_id: u8, payload: &[u8]) -> HandlerOutcome {
        let desc = self.entries[type_id as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("nexus-rpc: no handler registered for request type {type_id}"));
        (desc.func)(payload)
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invokes_registered_inline_handler() {
        let mut table = HandlerTable::new();
        table.register_handler(1, HandlerMode::Inline, |bytes| HandlerOutcome::Respond(bytes.to_vec()));
        assert_eq!(table.mode_of(1), Some(HandlerMode::Inline));
        match table.invoke(1, b"abc") {
            HandlerOutcome::Respond(bytes) => assert_eq!(bytes, b"abc"),
            HandlerOutcome::Forward { .. } => panic!("expected Respond"),
        }
    }

    #[test]
    fn unregistered_type_reports_absent() {
        let table = HandlerTable::new();
        assert!(!table.is_registered(9));
        assert_eq!(table.mode_of(9), None);
    }
}

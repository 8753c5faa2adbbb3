//! Background worker pool for handlers declared `background`. One SPSC ring
//! carries requests from the event loop to a worker; a second, independent
//! SPSC ring carries the completed response back — one ring per (RPC
//! instance, worker) direction for inbound, one per (worker, RPC instance)
//! for outbound.
//!
//! Workers never touch transport state: they receive an owned copy of the
//! request payload and hand back an owned copy of the response payload. All
//! transport-visible actions (transmit, NIC-registered buffer alloc/free)
//! stay on the event-loop thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nexus_rpc_sync::SpscRing;

use crate::handler::{HandlerOutcome, HandlerTable};

pub struct WorkItem {
    pub session_num: u16,
    pub slot_idx: usize,
    pub request_num: u64,
    pub req_type: u8,
    pub payload: Vec<u8>,
}

pub struct WorkResult {
    pub session_num: u16,
    pub slot_idx: usize,
    pub request_num: u64,
    pub payload: Vec<u8>,
}

const RING_CAPACITY: usize = 256;

pub struct WorkerPool {
    inbound: Vec<Arc<SpscRing<WorkItem>>>,
    outbound: Vec<Arc<SpscRing<WorkResult>>>,
    next_worker: AtomicUsize,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(num_workers: usize, handlers: Arc<HandlerTable>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut inbound = Vec::with_capacity(num_workers);
        let mut outbound = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);

        for worker_idx in 0..num_workers {
            let in_ring = Arc::new(SpscRing::<WorkItem>::new(RING_CAPACITY));
            let out_ring = Arc::new(SpscRing::<WorkResult>::new(RING_CAPACITY));
            let in_ring_for_thread = in_ring.clone();
            let out_ring_for_thread = out_ring.clone();
            let handlers_for_thread = handlers.clone();
            let shutdown_for_thread = shutdown.clone();

            let handle = std::thread::Builder::new()
                .name(format!("nexus-rpc-worker-{worker_idx}"))
                .spawn(move || {
                    worker_loop(in_ring_for_thread, out_ring_for_thread, handlers_for_thread, shutdown_for_thread)
                })
                .expect("spawn background worker thread");

            inbound.push(in_ring);
            outbound.push(out_ring);
            handles.push(handle);
        }

        Self { inbound, outbound, next_worker: AtomicUsize::new(0), shutdown, handles }
    }

    pub fn num_workers(&self) -> usize {
        self.inbound.len()
    }

    /// Dispatches `item` to a worker chosen round-robin. Returns the item
    /// back if that worker's inbound ring is full (caller retries later,
    /// same backpressure contract as `kRingExhausted`).
    pub fn dispatch(&self, item: WorkItem) -> Result<(), WorkItem> {
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.inbound.len();
        self.inbound[idx].push(item)
    }

    /// Drains every worker's outbound ring. Called from event-loop step 5.
    pub fn drain_completions(&self) -> Vec<WorkResult> {
        let mut out = Vec::new();
        for ring in &self.outbound {
            while let Some(result) = ring.pop() {
                out.push(result);
            }
        }
        out
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    inbound: Arc<SpscRing<WorkItem>>,
    outbound: Arc<SpscRing<WorkResult>>,
    handlers: Arc<HandlerTable>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Acquire) {
        let Some(item) = inbound.pop() else {
            std::thread::sleep(Duration::from_micros(50));
            continue;
        };
        let payload = match handlers.invoke(item.req_type, &item.payload) {
            HandlerOutcome::Respond(bytes) => bytes,
            HandlerOutcome::Forward { .. } => {
                log::warn!(
                    "nexus-rpc: background handler for request type {} returned Forward, which only inline handlers may use; responding empty",
                    item.req_type
                );
                Vec::new()
            }
        };
        let result = WorkResult {
            session_num: item.session_num,
            slot_idx: item.slot_idx,
            request_num: item.request_num,
            payload,
        };
        let mut pending = result;
        while let Err(back) = outbound.push(pending) {
            pending = back;
            std::thread::sleep(Duration::from_micros(50));
        }
    }
}

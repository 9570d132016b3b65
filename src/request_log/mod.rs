//! Per-request record ring.
//!
//! Every front-end request reserves one slot by monotonic id
//! (`records[id % N]`); upstream attempts append sub-records to the slot,
//! and closing the call flips the slot's `wait_send` flag with release
//! ordering. A dedicated shipper task (see [`shipper`]) consumes slots in
//! id order with acquire ordering and batches them to the external
//! time-series sink. If the producer overtakes the shipper by more than half
//! the ring, stale slots are dropped with a warning rather than shipped.

pub mod shipper;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info};

/// Batch ceiling per shipped document.
pub const MAX_LOG_SEND_NUM: usize = 1_000;

/// Microseconds since the epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// One upstream attempt inside a request record.
#[derive(Debug, Clone, Default)]
pub struct UpstreamAttempt {
    pub start_time: u64,
    pub end_time: u64,
    pub host_port: String,
    pub failed_msg: String,
}

/// Full contents of one slot, cloned out by the shipper.
#[derive(Debug, Clone, Default)]
pub struct SlotRecord {
    pub id: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub services: HashMap<String, Vec<UpstreamAttempt>>,
}

#[derive(Default)]
struct Slot {
    wait_send: AtomicBool,
    data: Mutex<SlotRecord>,
}

/// Per-second aggregate for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ServiceStat {
    /// Average latency in microseconds over the second.
    pub avg_latency: f64,
    pub request_per_sec: u64,
    /// Unix timestamp (seconds) of the bucket.
    pub timestamp: u64,
}

/// `service name → recent per-second stats`.
pub type ServiceStatMap = HashMap<String, Vec<ServiceStat>>;

/// What the shipper found at one ring position.
pub(crate) enum DrainStep {
    /// The slot has not been closed yet.
    NotReady,
    /// The record was collected for shipping and the slot reset.
    Shipped(Box<SlotRecord>),
    /// The record was stale (producer too far ahead) and skipped.
    Dropped,
}

/// The ring itself.
pub struct RequestLog {
    slots: Box<[Slot]>,
    next_id: AtomicU64,
    recent_stats: RwLock<ServiceStatMap>,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<Slot> = (0..capacity.max(2)).map(|_| Slot::default()).collect();
        RequestLog {
            slots: slots.into_boxed_slice(),
            next_id: AtomicU64::new(0),
            recent_stats: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Highest id handed out so far.
    pub fn claimed(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    fn slot(&self, id: u64) -> &Slot {
        &self.slots[(id % self.slots.len() as u64) as usize]
    }

    /// Reserves and timestamps a slot, returning its id. Returns 0 (the
    /// no-op id) if the ring has wrapped onto a record still waiting to
    /// ship.
    pub fn start_call(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let slot = self.slot(id);
        let mut data = slot.data.lock().expect("log slot poisoned");
        if slot.wait_send.load(Ordering::Acquire) || data.id != 0 {
            error!(reused = data.id, "reused a log slot still waiting to be sent");
            return 0;
        }
        data.id = id;
        data.start_time = now_micros();
        id
    }

    /// Closes the record and hands it to the shipper.
    pub fn end_call(&self, id: u64) {
        if id == 0 {
            return;
        }
        let slot = self.slot(id);
        {
            let mut data = slot.data.lock().expect("log slot poisoned");
            data.end_time = now_micros();
        }
        slot.wait_send.store(true, Ordering::Release);
    }

    /// Opens a sub-record for one upstream attempt.
    pub fn send_service_request(&self, id: u64, name: &str, host: &str, port: &str) {
        if id == 0 {
            return;
        }
        let slot = self.slot(id);
        let mut data = slot.data.lock().expect("log slot poisoned");
        let attempts = data.services.entry(name.to_string()).or_default();
        attempts.push(UpstreamAttempt {
            start_time: now_micros(),
            host_port: format!("{host}:{port}"),
            ..Default::default()
        });
    }

    /// Closes the newest sub-record for `name`.
    pub fn got_service_reply(&self, id: u64, name: &str) {
        if id == 0 {
            return;
        }
        let slot = self.slot(id);
        let mut data = slot.data.lock().expect("log slot poisoned");
        if let Some(last) = data.services.get_mut(name).and_then(|v| v.last_mut()) {
            last.end_time = now_micros();
        }
    }

    /// Marks the newest sub-record for `name` failed.
    pub fn service_failed(&self, id: u64, name: &str, failed_msg: &str) {
        if id == 0 {
            return;
        }
        info!(id, service = name, error = failed_msg, "service call failed");
        let slot = self.slot(id);
        let mut data = slot.data.lock().expect("log slot poisoned");
        if let Some(last) = data.services.get_mut(name).and_then(|v| v.last_mut()) {
            last.failed_msg = failed_msg.to_string();
        }
    }

    /// Latest swapped-out per-service stats snapshot.
    pub fn recent_service_stats(&self) -> ServiceStatMap {
        self.recent_stats
            .read()
            .expect("stats lock poisoned")
            .clone()
    }

    pub(crate) fn swap_recent_stats(&self, fresh: ServiceStatMap) {
        let mut stats = self.recent_stats.write().expect("stats lock poisoned");
        *stats = fresh;
    }

    /// Collects the record at `next_send`, resetting the slot. Stale slots
    /// (producer more than half a ring ahead) are dropped.
    pub(crate) fn drain_one(&self, next_send: u64) -> DrainStep {
        let slot = self.slot(next_send);
        if !slot.wait_send.load(Ordering::Acquire) {
            return DrainStep::NotReady;
        }
        let mut data = slot.data.lock().expect("log slot poisoned");
        let lead = self.claimed().saturating_sub(next_send);
        let step = if lead < (self.capacity() as u64) / 2 {
            DrainStep::Shipped(Box::new(std::mem::take(&mut *data)))
        } else {
            *data = SlotRecord::default();
            DrainStep::Dropped
        };
        slot.wait_send.store(false, Ordering::Release);
        step
    }
}

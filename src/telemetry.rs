//! Channel telemetry: per-opcode counters and a bounded trace buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Classification of an opcode for process-level access logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    ChannelRead,
    ChannelWrite,
    ChannelOther,
}

/// Telemetry sampling group for an opcode. `DropAll` samples nothing; the
/// numbered groups select increasingly aggressive sampling rates in the
/// telemetry sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingGroup {
    DropAll,
    One,
    Two,
    Three,
    Four,
}

/// Whether a trace event marks the start or the end of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventKind {
    Start,
    Finish,
}

/// One request lifecycle event published to the trace bus.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    pub unique: u64,
    pub opcode: u32,
    pub nodeid: u64,
    pub pid: u32,
    /// Rendered arguments; only populated when detailed tracing is on.
    pub arguments: Option<String>,
    /// Errno of the reply (0 on success); finish events only.
    pub result: Option<i32>,
}

/// Fixed-capacity ring of recent trace events.
///
/// Readers take snapshots; writers never block on readers beyond the queue
/// lock. When full, the oldest event is dropped.
#[derive(Debug)]
pub struct ActivityBuffer {
    max_events: usize,
    events: Mutex<VecDeque<TraceEvent>>,
}

impl ActivityBuffer {
    pub fn new(max_events: usize) -> ActivityBuffer {
        ActivityBuffer {
            max_events,
            events: Mutex::new(VecDeque::with_capacity(max_events)),
        }
    }

    pub fn publish(&self, event: TraceEvent) {
        let mut events = self.events.lock();
        if events.len() == self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

/// Per-opcode dispatch counters. Indexed by raw opcode; opcodes outside the
/// table share one overflow counter.
#[derive(Debug)]
pub struct ChannelStats {
    counters: [AtomicU64; ChannelStats::TABLE_SIZE],
    other: AtomicU64,
}

impl ChannelStats {
    const TABLE_SIZE: usize = 64;

    pub fn new() -> ChannelStats {
        ChannelStats {
            counters: [const { AtomicU64::new(0) }; ChannelStats::TABLE_SIZE],
            other: AtomicU64::new(0),
        }
    }

    pub fn record(&self, opcode: u32) {
        match self.counters.get(opcode as usize) {
            Some(counter) => counter.fetch_add(1, Ordering::Relaxed),
            None => self.other.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn count(&self, opcode: u32) -> u64 {
        match self.counters.get(opcode as usize) {
            Some(counter) => counter.load(Ordering::Relaxed),
            None => self.other.load(Ordering::Relaxed),
        }
    }
}

impl Default for ChannelStats {
    fn default() -> Self {
        ChannelStats::new()
    }
}

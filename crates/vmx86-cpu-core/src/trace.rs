//! Append-only execution trace.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::{Mutex, PoisonError};
use vmx86_types::Gpr;

/// A register whose value changed across a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegDelta {
    pub reg: Gpr,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Block {
        tid: u32,
        entry: u64,
        insts: u32,
        next_rip: u64,
        deltas: Vec<RegDelta>,
    },
    Trap {
        tid: u32,
        rip: u64,
        signo: u32,
        addr: u64,
    },
    Syscall {
        tid: u32,
        nr: u64,
        ret: i64,
    },
    Exit {
        tid: u32,
        reason: String,
    },
}

impl TraceEvent {
    pub fn tid(&self) -> u32 {
        match self {
            TraceEvent::Block { tid, .. }
            | TraceEvent::Trap { tid, .. }
            | TraceEvent::Syscall { tid, .. }
            | TraceEvent::Exit { tid, .. } => *tid,
        }
    }
}

/// Consumer of trace events. Recording never feeds back into execution.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: &TraceEvent);
}

/// Writes one JSON object per line.
pub struct JsonLinesTraceSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesTraceSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> TraceSink for JsonLinesTraceSink<W> {
    fn record(&self, event: &TraceEvent) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let res = serde_json::to_writer(&mut *out, event)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(err) = res {
            tracing::warn!(%err, "dropping trace event");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TraceSink for MemoryTraceSink {
    fn record(&self, event: &TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Registers that differ between `before` and `after`.
pub fn register_deltas(before: &[u64; 16], after: &[u64; 16]) -> Vec<RegDelta> {
    Gpr::ALL
        .iter()
        .zip(before.iter().zip(after.iter()))
        .filter(|(_, (b, a))| b != a)
        .map(|(reg, (_, a))| RegDelta {
            reg: *reg,
            value: *a,
        })
        .collect()
}

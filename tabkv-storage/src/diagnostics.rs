//! Diagnostic side channel for cache decisions.

use serde::{Deserialize, Serialize};
use tabkv_core::Timestamp;

/// How a buffered write was reconciled against an external change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileResolution {
    /// The other tab deleted the key; the buffered value was dropped.
    Deleted,
    /// No merge function: the external value won.
    Discarded,
    /// The merged value was buffered and flushed.
    Merged,
}

/// Events reported to a [`DiagnosticSink`].
///
/// Serializes as an object tagged by `"event"`, e.g.
/// `{"event":"buffered","key":"cached-draft"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    Started,
    Stopped,
    /// A write was held in memory.
    Buffered { key: String },
    /// A write went straight to the backend.
    WroteThrough { key: String },
    Flushed { count: usize, at: Timestamp },
    Reconciled {
        key: String,
        resolution: ReconcileResolution,
    },
    /// A flush nobody could be told about failed (timer, inactivity or
    /// reconciliation).
    FlushFailed { reason: String },
}

impl CacheEvent {
    /// Short machine-readable name, matching the serialized `"event"` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Buffered { .. } => "buffered",
            Self::WroteThrough { .. } => "wrote_through",
            Self::Flushed { .. } => "flushed",
            Self::Reconciled { .. } => "reconciled",
            Self::FlushFailed { .. } => "flush_failed",
        }
    }
}

/// Receives cache events. Implemented for any `Fn(&CacheEvent)`.
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, event: &CacheEvent);
}

impl<F> DiagnosticSink for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn record(&self, event: &CacheEvent) {
        self(event)
    }
}

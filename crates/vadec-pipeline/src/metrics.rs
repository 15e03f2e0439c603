//! Decoder counters.
//!
//! Written by both threads with relaxed atomics; read by the client and at
//! teardown, where [`DecoderMetrics::validate`] checks the bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

use vadec_core::error::{DecoderError, Result};

/// Atomic per-accelerator counters.
#[derive(Debug, Default)]
pub struct DecoderMetrics {
    /// Bitstream buffers accepted by `decode()`.
    pub buffers_received: AtomicU64,
    /// `notify_end_of_bitstream_buffer` callbacks delivered.
    pub buffers_returned: AtomicU64,
    /// Frames the engine handed to the client thread and that were queued
    /// for output.
    pub frames_decoded: AtomicU64,
    /// `picture_ready` callbacks delivered.
    pub pictures_ready: AtomicU64,
    pub pictures_dismissed: AtomicU64,
    pub surface_set_changes: AtomicU64,
    pub flushes_completed: AtomicU64,
    pub resets_completed: AtomicU64,
    /// Failed hardware calls reported by the `VaapiContext`.
    pub va_errors: AtomicU64,
    /// Errors delivered through `notify_error`.
    pub client_errors: AtomicU64,
}

/// Point-in-time copy of [`DecoderMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub buffers_received: u64,
    pub buffers_returned: u64,
    pub frames_decoded: u64,
    pub pictures_ready: u64,
    pub pictures_dismissed: u64,
    pub surface_set_changes: u64,
    pub flushes_completed: u64,
    pub resets_completed: u64,
    pub va_errors: u64,
    pub client_errors: u64,
}

impl DecoderMetrics {
    /// Allocate a fresh [`DecoderMetrics`] with all counters zeroed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Acquire);
        MetricsSnapshot {
            buffers_received: load(&self.buffers_received),
            buffers_returned: load(&self.buffers_returned),
            frames_decoded: load(&self.frames_decoded),
            pictures_ready: load(&self.pictures_ready),
            pictures_dismissed: load(&self.pictures_dismissed),
            surface_set_changes: load(&self.surface_set_changes),
            flushes_completed: load(&self.flushes_completed),
            resets_completed: load(&self.resets_completed),
            va_errors: load(&self.va_errors),
            client_errors: load(&self.client_errors),
        }
    }

    /// Ordering invariants: nothing is returned that was not received, and
    /// nothing is shown that was not decoded.
    pub fn validate(&self) -> bool {
        let s = self.snapshot();
        s.buffers_returned <= s.buffers_received && s.pictures_ready <= s.frames_decoded
    }

    pub fn report(&self) {
        let s = self.snapshot();
        info!(
            buffers_received = s.buffers_received,
            buffers_returned = s.buffers_returned,
            frames_decoded = s.frames_decoded,
            pictures_ready = s.pictures_ready,
            surface_set_changes = s.surface_set_changes,
            flushes = s.flushes_completed,
            resets = s.resets_completed,
            va_errors = s.va_errors,
            client_errors = s.client_errors,
            "Decoder counters"
        );
    }
}

pub(crate) fn enforce_metrics_invariants(metrics: &DecoderMetrics, strict: bool) -> Result<()> {
    if !strict || metrics.validate() {
        return Ok(());
    }

    let s = metrics.snapshot();
    Err(DecoderError::InvariantViolation(format!(
        "Decoder bookkeeping violation: received={} returned={} decoded={} ready={}",
        s.buffers_received, s.buffers_returned, s.frames_decoded, s.pictures_ready
    )))
}

//! Codec engine contract consumed by the accelerator.
//!
//! The engine is the codec-level state machine (slice parsing, reference
//! management, picture ordering).  The accelerator treats it as a black box:
//! it feeds bytes with [`BitstreamDecoderEngine::set_stream`], lends surfaces
//! with [`BitstreamDecoderEngine::reuse_surface`], and reacts to the
//! [`DecodeResult`] of each [`BitstreamDecoderEngine::decode`] call.
//!
//! All engine methods run on the decode thread.  Completed frames leave the
//! engine through the [`OutputCallback`] it was constructed with.

use std::sync::Arc;

use crate::shm::MappedBitstream;
use crate::surface::Surface;
use crate::types::Size;

/// Shared view of one input buffer's bytes.
pub type StreamData = Arc<MappedBitstream>;

/// Called by the engine with `(bitstream_buffer_id, surface)` for every frame
/// that is ready to be displayed, in display order.
pub type OutputCallback = Box<dyn FnMut(i32, Arc<Surface>) + Send>;

/// Outcome of one [`BitstreamDecoderEngine::decode`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeResult {
    /// The current stream is fully consumed.
    NeedMoreInput,
    /// No free surface to decode into; call again after `reuse_surface`.
    NeedMoreSurfaces,
    /// The stream needs a different surface set (resolution or count change).
    NeedNewSurfaceSet { count: usize, size: Size },
    /// Unrecoverable bitstream or hardware error.
    Error(String),
}

pub trait BitstreamDecoderEngine: Send + 'static {
    /// Point the engine at the bytes of input buffer `input_id`.
    fn set_stream(&mut self, input_id: i32, data: StreamData);

    /// Lend a free surface to the engine.
    fn reuse_surface(&mut self, surface: Arc<Surface>);

    /// Decode as much of the current stream as possible.
    ///
    /// Before returning [`DecodeResult::NeedNewSurfaceSet`] the engine must
    /// output or drop every surface it holds, so the old set can be torn down.
    fn decode(&mut self) -> DecodeResult;

    /// Output every decoded frame still held for reordering.
    ///
    /// Returns `false` if the held frames could not be emitted.
    fn flush(&mut self) -> bool;

    /// Drop all decode state, held frames and lent surfaces.
    fn reset(&mut self);
}

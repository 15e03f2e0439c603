//! Callbacks into the display client.
//!
//! Both traits are driven exclusively from the accelerator's client thread,
//! never from the decode thread.

use crate::error::{ErrorCode, Result};
use crate::types::{Picture, Size, TextureTarget};

/// Receiver of decoded pictures and lifecycle notifications.
pub trait DecodeClient: Send + 'static {
    /// Allocate `count` picture buffers of `size` and hand them back through
    /// `assign_picture_buffers`.
    fn provide_picture_buffers(&mut self, count: usize, size: Size, target: TextureTarget);

    /// The picture buffer is no longer used by the decoder and may be freed.
    fn dismiss_picture_buffer(&mut self, picture_buffer_id: i32);

    fn picture_ready(&mut self, picture: Picture);

    /// The decoder is done with this bitstream buffer.
    fn notify_end_of_bitstream_buffer(&mut self, bitstream_buffer_id: i32);

    fn notify_flush_done(&mut self);

    fn notify_reset_done(&mut self);

    /// Decoding has stopped for good; no further callbacks follow.
    fn notify_error(&mut self, error: ErrorCode);
}

/// The client's rendering context, used to upload decoded pixels into its
/// textures.
pub trait RenderContext: Send + 'static {
    /// Make the GL (or equivalent) context current on the calling thread.
    fn make_context_current(&mut self) -> bool;

    /// Upload a 32-bit RGBX image with row stride `pitch` into `texture_id`.
    fn upload_rgbx(&mut self, texture_id: u32, size: Size, pitch: usize, pixels: &[u8])
    -> Result<()>;
}

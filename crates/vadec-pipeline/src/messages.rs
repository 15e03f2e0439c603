//! Messages carried between the public handle, the client thread and the
//! decode thread.

use std::fmt;
use std::sync::Arc;

use vadec_core::error::ErrorCode;
use vadec_core::shm::BitstreamBuffer;
use vadec_core::surface::Surface;
use vadec_core::types::{PictureBuffer, Size, SurfaceId};

/// Work for the client (control) thread.
///
/// The first six variants come from the public API; the rest are posted by
/// the decode thread, the engine's output callback, or surface release.
pub(crate) enum ControlMessage {
    Decode(BitstreamBuffer),
    AssignPictureBuffers(Vec<PictureBuffer>),
    ReusePictureBuffer(i32),
    Flush,
    Reset,
    Destroy,

    SurfaceReady { input_id: i32, surface: Arc<Surface> },
    RecycleSurface(SurfaceId),
    InitiateSurfaceSetChange { count: usize, size: Size },
    InputBufferRead(i32),
    FinishFlush,
    FinishReset,
    Error(ErrorCode, String),
}

impl fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(buffer) => write!(f, "Decode({})", buffer.id()),
            Self::AssignPictureBuffers(buffers) => {
                write!(f, "AssignPictureBuffers(len={})", buffers.len())
            }
            Self::ReusePictureBuffer(id) => write!(f, "ReusePictureBuffer({id})"),
            Self::Flush => f.write_str("Flush"),
            Self::Reset => f.write_str("Reset"),
            Self::Destroy => f.write_str("Destroy"),
            Self::SurfaceReady { input_id, surface } => {
                write!(f, "SurfaceReady(input={input_id}, surface={})", surface.id())
            }
            Self::RecycleSurface(id) => write!(f, "RecycleSurface({id})"),
            Self::InitiateSurfaceSetChange { count, size } => {
                write!(f, "InitiateSurfaceSetChange({count} x {size})")
            }
            Self::InputBufferRead(id) => write!(f, "InputBufferRead({id})"),
            Self::FinishFlush => f.write_str("FinishFlush"),
            Self::FinishReset => f.write_str("FinishReset"),
            Self::Error(code, msg) => write!(f, "Error({code}, {msg})"),
        }
    }
}

/// Work for the decode thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DecoderTask {
    Decode,
    Flush,
    Reset,
    Exit,
}

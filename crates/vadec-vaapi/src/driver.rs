//! Hardware boundary: the primitive VA-API operations.
//!
//! [`VaDriver`] is deliberately thin, one method per libva entry point the
//! decoder needs.  Policy (negotiation, all-or-nothing creation, buffer
//! cleanup, locking, error reporting) lives in
//! [`VaapiContext`](crate::context::VaapiContext).

use std::fmt;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use vadec_core::types::{Size, SurfaceId};

use crate::sys;

pub type ConfigId = u32;
pub type ContextId = u32;
pub type BufferId = u32;
pub type ImageId = u32;

/// Status returned by a failed driver call, with the driver's diagnostic text.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message} (VAStatus {code:#x})")]
pub struct VaStatus {
    pub code: i32,
    pub message: String,
}

impl VaStatus {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type VaResult<T> = std::result::Result<T, VaStatus>;

/// VA-API version reported by `vaInitialize`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// VA profiles this decoder can drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VaProfile {
    H264Baseline,
    H264ConstrainedBaseline,
    H264Main,
    H264High,
}

impl VaProfile {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::H264Baseline => sys::VAProfileH264Baseline,
            Self::H264ConstrainedBaseline => sys::VAProfileH264ConstrainedBaseline,
            Self::H264Main => sys::VAProfileH264Main,
            Self::H264High => sys::VAProfileH264High,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            sys::VAProfileH264Baseline => Some(Self::H264Baseline),
            sys::VAProfileH264ConstrainedBaseline => Some(Self::H264ConstrainedBaseline),
            sys::VAProfileH264Main => Some(Self::H264Main),
            sys::VAProfileH264High => Some(Self::H264High),
            _ => None,
        }
    }
}

/// Raw `VAEntrypointVLD` (slice-level decode).
pub const ENTRYPOINT_VLD: i32 = sys::VAEntrypointVLD;

/// Raw `VA_RT_FORMAT_YUV420`.
pub const RT_FORMAT_YUV420: u32 = sys::VA_RT_FORMAT_YUV420;

/// Parameter/data buffer kinds submitted per picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferType {
    PictureParameter,
    IqMatrix,
    SliceParameter,
    SliceData,
}

impl BufferType {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::PictureParameter => sys::VAPictureParameterBufferType,
            Self::IqMatrix => sys::VAIQMatrixBufferType,
            Self::SliceParameter => sys::VASliceParameterBufferType,
            Self::SliceData => sys::VASliceDataBufferType,
        }
    }
}

pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

pub const FOURCC_RGBX: u32 = fourcc(b'R', b'G', b'B', b'X');

/// Pixel layout of a readback image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageFormat {
    pub fourcc: u32,
    pub byte_order: u32,
    pub bits_per_pixel: u32,
    pub depth: u32,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
    pub alpha_mask: u32,
}

impl ImageFormat {
    /// 32-bit RGBX, little-endian, red in the lowest byte.
    pub const RGBX: Self = Self {
        fourcc: FOURCC_RGBX,
        byte_order: sys::VA_LSB_FIRST,
        bits_per_pixel: 32,
        depth: 24,
        red_mask: 0x0000_00ff,
        green_mask: 0x0000_ff00,
        blue_mask: 0x00ff_0000,
        alpha_mask: 0,
    };
}

/// A driver image: the readback target for one decoded surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VaImage {
    pub id: ImageId,
    pub buffer: BufferId,
    pub format: ImageFormat,
    pub size: Size,
    pub data_size: usize,
    pub pitches: [u32; 3],
    pub offsets: [u32; 3],
    pub num_planes: u32,
}

/// The primitive VA-API operations, one per libva entry point.
///
/// Implementations are not required to be reentrant; callers serialize all
/// calls on one driver instance.
pub trait VaDriver: Send {
    /// Open the session and report the implementation's API version.
    fn initialize(&mut self) -> VaResult<ApiVersion>;
    /// Close the session.  Called at most once, after all other resources
    /// are destroyed.
    fn terminate(&mut self);
    fn vendor_string(&self) -> String;

    /// Raw `VAProfile` values supported by the driver.
    fn query_profiles(&mut self) -> VaResult<Vec<i32>>;
    /// Raw `VAEntrypoint` values supported for `profile`.
    fn query_entrypoints(&mut self, profile: VaProfile) -> VaResult<Vec<i32>>;
    /// Bitmask of supported `VA_RT_FORMAT_*` values, or 0 if unsupported.
    fn query_rt_formats(&mut self, profile: VaProfile, entrypoint: i32) -> VaResult<u32>;

    fn create_config(
        &mut self,
        profile: VaProfile,
        entrypoint: i32,
        rt_format: u32,
    ) -> VaResult<ConfigId>;
    fn destroy_config(&mut self, config: ConfigId) -> VaResult<()>;

    fn create_surfaces(
        &mut self,
        rt_format: u32,
        size: Size,
        count: usize,
    ) -> VaResult<Vec<SurfaceId>>;
    fn destroy_surfaces(&mut self, surfaces: &[SurfaceId]) -> VaResult<()>;
    fn sync_surface(&mut self, surface: SurfaceId) -> VaResult<()>;

    fn create_context(
        &mut self,
        config: ConfigId,
        size: Size,
        render_targets: &[SurfaceId],
    ) -> VaResult<ContextId>;
    fn destroy_context(&mut self, context: ContextId) -> VaResult<()>;

    /// Create a buffer holding a copy of `data`.
    fn create_buffer(
        &mut self,
        context: ContextId,
        buffer_type: BufferType,
        data: &[u8],
    ) -> VaResult<BufferId>;
    fn destroy_buffer(&mut self, buffer: BufferId) -> VaResult<()>;
    /// Map a buffer into CPU memory.  The pointer stays valid until
    /// [`VaDriver::unmap_buffer`] and the buffer is not resized meanwhile.
    fn map_buffer(&mut self, buffer: BufferId) -> VaResult<NonNull<u8>>;
    fn unmap_buffer(&mut self, buffer: BufferId) -> VaResult<()>;

    fn begin_picture(&mut self, context: ContextId, target: SurfaceId) -> VaResult<()>;
    fn render_picture(&mut self, context: ContextId, buffers: &[BufferId]) -> VaResult<()>;
    fn end_picture(&mut self, context: ContextId) -> VaResult<()>;

    fn create_image(&mut self, format: &ImageFormat, size: Size) -> VaResult<VaImage>;
    fn destroy_image(&mut self, image: ImageId) -> VaResult<()>;
    /// Copy the full `size` region of `surface` into `image`.
    fn get_image(&mut self, surface: SurfaceId, size: Size, image: ImageId) -> VaResult<()>;
}

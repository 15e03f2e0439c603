#![allow(missing_docs)]
//! Stub for builds without libva.

use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use vadec_core::error::{DecoderError, Result};
use vadec_core::types::{Size, SurfaceId};

use crate::driver::{
    ApiVersion, BufferId, BufferType, ConfigId, ContextId, ImageFormat, ImageId, VaDriver,
    VaImage, VaProfile, VaResult, VaStatus,
};
use crate::sys;

const STUB_MESSAGE: &str = "vadec-vaapi built in stub mode: libva is unavailable on this build host";

fn unavailable<T>() -> VaResult<T> {
    Err(VaStatus::new(sys::VA_STATUS_ERROR_INVALID_DISPLAY, STUB_MESSAGE))
}

/// Stub libva driver used when `vadec_vaapi_stub` cfg is active.
pub struct LibvaDriver {
    render_node: PathBuf,
}

impl LibvaDriver {
    pub fn open(render_node: &Path) -> Result<Self> {
        let _ = render_node;
        Err(DecoderError::Platform(STUB_MESSAGE.into()))
    }

    pub fn render_node(&self) -> &Path {
        &self.render_node
    }
}

impl VaDriver for LibvaDriver {
    fn initialize(&mut self) -> VaResult<ApiVersion> {
        unavailable()
    }

    fn terminate(&mut self) {}

    fn vendor_string(&self) -> String {
        String::new()
    }

    fn query_profiles(&mut self) -> VaResult<Vec<i32>> {
        unavailable()
    }

    fn query_entrypoints(&mut self, _profile: VaProfile) -> VaResult<Vec<i32>> {
        unavailable()
    }

    fn query_rt_formats(&mut self, _profile: VaProfile, _entrypoint: i32) -> VaResult<u32> {
        unavailable()
    }

    fn create_config(&mut self, _: VaProfile, _: i32, _: u32) -> VaResult<ConfigId> {
        unavailable()
    }

    fn destroy_config(&mut self, _config: ConfigId) -> VaResult<()> {
        unavailable()
    }

    fn create_surfaces(&mut self, _: u32, _: Size, _: usize) -> VaResult<Vec<SurfaceId>> {
        unavailable()
    }

    fn destroy_surfaces(&mut self, _surfaces: &[SurfaceId]) -> VaResult<()> {
        unavailable()
    }

    fn sync_surface(&mut self, _surface: SurfaceId) -> VaResult<()> {
        unavailable()
    }

    fn create_context(&mut self, _: ConfigId, _: Size, _: &[SurfaceId]) -> VaResult<ContextId> {
        unavailable()
    }

    fn destroy_context(&mut self, _context: ContextId) -> VaResult<()> {
        unavailable()
    }

    fn create_buffer(&mut self, _: ContextId, _: BufferType, _: &[u8]) -> VaResult<BufferId> {
        unavailable()
    }

    fn destroy_buffer(&mut self, _buffer: BufferId) -> VaResult<()> {
        unavailable()
    }

    fn map_buffer(&mut self, _buffer: BufferId) -> VaResult<NonNull<u8>> {
        unavailable()
    }

    fn unmap_buffer(&mut self, _buffer: BufferId) -> VaResult<()> {
        unavailable()
    }

    fn begin_picture(&mut self, _: ContextId, _: SurfaceId) -> VaResult<()> {
        unavailable()
    }

    fn render_picture(&mut self, _: ContextId, _: &[BufferId]) -> VaResult<()> {
        unavailable()
    }

    fn end_picture(&mut self, _context: ContextId) -> VaResult<()> {
        unavailable()
    }

    fn create_image(&mut self, _: &ImageFormat, _: Size) -> VaResult<VaImage> {
        unavailable()
    }

    fn destroy_image(&mut self, _image: ImageId) -> VaResult<()> {
        unavailable()
    }

    fn get_image(&mut self, _: SurfaceId, _: Size, _: ImageId) -> VaResult<()> {
        unavailable()
    }
}

//! In-memory [`VaDriver`] for tests and simulation.
//!
//! Surfaces hold RGBX pixels.  `end_picture` paints the target surface with a
//! colour derived from the slice data submitted for that picture
//! ([`frame_color`]), so a readback proves which bitstream bytes landed in
//! which texture.  Every call can be made to fail once through
//! [`MemoryDriverProbe::fail_next`], keyed by the libva function name.

use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use vadec_core::types::{Size, SurfaceId};

use crate::driver::{
    ApiVersion, BufferId, BufferType, ConfigId, ContextId, ENTRYPOINT_VLD, ImageFormat, ImageId,
    RT_FORMAT_YUV420, VaDriver, VaImage, VaProfile, VaResult, VaStatus,
};
use crate::sys;

/// Colour (RGBX bytes) painted for a picture whose slice data is `slice_data`.
///
/// FNV-1a over the bytes; the low three bytes become R, G, B.
pub fn frame_color(slice_data: &[u8]) -> [u8; 4] {
    let hash = slice_data
        .iter()
        .fold(0x811c_9dc5u32, |acc, b| (acc ^ u32::from(*b)).wrapping_mul(0x0100_0193));
    let [r, g, b, _] = hash.to_le_bytes();
    [r, g, b, 0xff]
}

fn status_message(code: i32) -> &'static str {
    match code {
        sys::VA_STATUS_ERROR_OPERATION_FAILED => "operation failed",
        sys::VA_STATUS_ERROR_ALLOCATION_FAILED => "resource allocation failed",
        sys::VA_STATUS_ERROR_INVALID_DISPLAY => "invalid VADisplay",
        sys::VA_STATUS_ERROR_INVALID_CONFIG => "invalid VAConfigID",
        sys::VA_STATUS_ERROR_INVALID_CONTEXT => "invalid VAContextID",
        sys::VA_STATUS_ERROR_INVALID_SURFACE => "invalid VASurfaceID",
        sys::VA_STATUS_ERROR_INVALID_BUFFER => "invalid VABufferID",
        sys::VA_STATUS_ERROR_INVALID_IMAGE => "invalid VAImageID",
        sys::VA_STATUS_ERROR_UNSUPPORTED_PROFILE => "unsupported profile",
        sys::VA_STATUS_ERROR_UNSUPPORTED_ENTRYPOINT => "unsupported entrypoint",
        sys::VA_STATUS_ERROR_UNSUPPORTED_RT_FORMAT => "unsupported RT format",
        sys::VA_STATUS_ERROR_INVALID_PARAMETER => "invalid parameter",
        sys::VA_STATUS_ERROR_DECODING_ERROR => "internal decoding error",
        _ => "unknown libva error",
    }
}

fn status(code: i32) -> VaStatus {
    VaStatus::new(code, status_message(code))
}

/// Capabilities advertised by a [`MemoryDriver`].
#[derive(Clone, Debug)]
pub struct MemoryDriverConfig {
    pub api_version: ApiVersion,
    pub vendor: String,
    pub profiles: Vec<VaProfile>,
    pub entrypoints: Vec<i32>,
    pub rt_formats: u32,
}

impl Default for MemoryDriverConfig {
    fn default() -> Self {
        Self {
            api_version: ApiVersion::new(1, 20),
            vendor: "vadec in-memory driver".into(),
            profiles: vec![
                VaProfile::H264Baseline,
                VaProfile::H264ConstrainedBaseline,
                VaProfile::H264Main,
                VaProfile::H264High,
            ],
            entrypoints: vec![ENTRYPOINT_VLD],
            rt_formats: RT_FORMAT_YUV420,
        }
    }
}

struct MemorySurface {
    size: Size,
    pixels: Vec<u8>,
    decodes: u64,
}

struct MemoryContext {
    targets: Vec<SurfaceId>,
    current: Option<SurfaceId>,
    slice_data: Vec<u8>,
}

struct MemoryBuffer {
    kind: Option<BufferType>,
    data: Vec<u8>,
    mapped: bool,
}

struct MemoryImage {
    size: Size,
    buffer: BufferId,
}

#[derive(Default)]
struct MemoryState {
    next_id: u32,
    initialized: bool,
    terminated: bool,
    configs: HashSet<ConfigId>,
    surfaces: HashMap<SurfaceId, MemorySurface>,
    contexts: HashMap<ContextId, MemoryContext>,
    buffers: HashMap<BufferId, MemoryBuffer>,
    images: HashMap<ImageId, MemoryImage>,
    failures: HashMap<&'static str, u32>,
    pictures_decoded: u64,
}

impl MemoryState {
    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&mut self, call: &'static str) -> VaResult<()> {
        if !self.initialized && call != "vaInitialize" {
            return Err(status(sys::VA_STATUS_ERROR_INVALID_DISPLAY));
        }
        if let Some(remaining) = self.failures.get_mut(call) {
            *remaining -= 1;
            if *remaining == 0 {
                self.failures.remove(call);
            }
            trace!(call, "injected failure");
            return Err(status(sys::VA_STATUS_ERROR_OPERATION_FAILED));
        }
        Ok(())
    }
}

/// A complete VA driver living in process memory.
pub struct MemoryDriver {
    config: MemoryDriverConfig,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::with_config(MemoryDriverConfig::default())
    }

    pub fn with_config(config: MemoryDriverConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Observation and failure-injection handle that stays valid after the
    /// driver is moved into a [`VaapiContext`](crate::context::VaapiContext).
    pub fn probe(&self) -> MemoryDriverProbe {
        MemoryDriverProbe {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl VaDriver for MemoryDriver {
    fn initialize(&mut self) -> VaResult<ApiVersion> {
        let mut state = self.state.lock();
        state.check("vaInitialize")?;
        state.initialized = true;
        state.terminated = false;
        Ok(self.config.api_version)
    }

    fn terminate(&mut self) {
        let mut state = self.state.lock();
        state.initialized = false;
        state.terminated = true;
    }

    fn vendor_string(&self) -> String {
        self.config.vendor.clone()
    }

    fn query_profiles(&mut self) -> VaResult<Vec<i32>> {
        self.state.lock().check("vaQueryConfigProfiles")?;
        Ok(self.config.profiles.iter().map(|p| p.as_raw()).collect())
    }

    fn query_entrypoints(&mut self, profile: VaProfile) -> VaResult<Vec<i32>> {
        self.state.lock().check("vaQueryConfigEntrypoints")?;
        if !self.config.profiles.contains(&profile) {
            return Err(status(sys::VA_STATUS_ERROR_UNSUPPORTED_PROFILE));
        }
        Ok(self.config.entrypoints.clone())
    }

    fn query_rt_formats(&mut self, profile: VaProfile, entrypoint: i32) -> VaResult<u32> {
        self.state.lock().check("vaGetConfigAttributes")?;
        if !self.config.profiles.contains(&profile) || !self.config.entrypoints.contains(&entrypoint)
        {
            return Ok(0);
        }
        Ok(self.config.rt_formats)
    }

    fn create_config(
        &mut self,
        profile: VaProfile,
        entrypoint: i32,
        rt_format: u32,
    ) -> VaResult<ConfigId> {
        let mut state = self.state.lock();
        state.check("vaCreateConfig")?;
        if !self.config.profiles.contains(&profile) {
            return Err(status(sys::VA_STATUS_ERROR_UNSUPPORTED_PROFILE));
        }
        if !self.config.entrypoints.contains(&entrypoint) {
            return Err(status(sys::VA_STATUS_ERROR_UNSUPPORTED_ENTRYPOINT));
        }
        if self.config.rt_formats & rt_format == 0 {
            return Err(status(sys::VA_STATUS_ERROR_UNSUPPORTED_RT_FORMAT));
        }
        let id = state.allocate_id();
        state.configs.insert(id);
        Ok(id)
    }

    fn destroy_config(&mut self, config: ConfigId) -> VaResult<()> {
        let mut state = self.state.lock();
        state.check("vaDestroyConfig")?;
        if !state.configs.remove(&config) {
            return Err(status(sys::VA_STATUS_ERROR_INVALID_CONFIG));
        }
        Ok(())
    }

    fn create_surfaces(
        &mut self,
        rt_format: u32,
        size: Size,
        count: usize,
    ) -> VaResult<Vec<SurfaceId>> {
        let mut state = self.state.lock();
        state.check("vaCreateSurfaces")?;
        if self.config.rt_formats & rt_format == 0 {
            return Err(status(sys::VA_STATUS_ERROR_UNSUPPORTED_RT_FORMAT));
        }
        if size.is_empty() {
            return Err(status(sys::VA_STATUS_ERROR_INVALID_PARAMETER));
        }
        let ids = (0..count)
            .map(|_| {
                let id = state.allocate_id();
                state.surfaces.insert(
                    id,
                    MemorySurface {
                        size,
                        pixels: vec![0; size.rgbx_bytes()],
                        decodes: 0,
                    },
                );
                id
            })
            .collect();
        Ok(ids)
    }

    fn destroy_surfaces(&mut self, surfaces: &[SurfaceId]) -> VaResult<()> {
        let mut state = self.state.lock();
        state.check("vaDestroySurfaces")?;
        if surfaces.iter().any(|id| !state.surfaces.contains_key(id)) {
            return Err(status(sys::VA_STATUS_ERROR_INVALID_SURFACE));
        }
        for id in surfaces {
            state.surfaces.remove(id);
        }
        Ok(())
    }

    fn sync_surface(&mut self, surface: SurfaceId) -> VaResult<()> {
        let mut state = self.state.lock();
        state.check("vaSyncSurface")?;
        if !state.surfaces.contains_key(&surface) {
            return Err(status(sys::VA_STATUS_ERROR_INVALID_SURFACE));
        }
        Ok(())
    }

    fn create_context(
        &mut self,
        config: ConfigId,
        size: Size,
        render_targets: &[SurfaceId],
    ) -> VaResult<ContextId> {
        let mut state = self.state.lock();
        state.check("vaCreateContext")?;
        if !state.configs.contains(&config) {
            return Err(status(sys::VA_STATUS_ERROR_INVALID_CONFIG));
        }
        let mismatched = render_targets
            .iter()
            .any(|id| state.surfaces.get(id).is_none_or(|s| s.size != size));
        if mismatched {
            return Err(status(sys::VA_STATUS_ERROR_INVALID_SURFACE));
        }
        let id = state.allocate_id();
        state.contexts.insert(
            id,
            MemoryContext {
                targets: render_targets.to_vec(),
                current: None,
                slice_data: Vec::new(),
            },
        );
        Ok(id)
    }

    fn destroy_context(&mut self, context: ContextId) -> VaResult<()> {
        let mut state = self.state.lock();
        state.check("vaDestroyContext")?;
        state
            .contexts
            .remove(&context)
            .map(|_| ())
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_INVALID_CONTEXT))
    }

    fn create_buffer(
        &mut self,
        context: ContextId,
        buffer_type: BufferType,
        data: &[u8],
    ) -> VaResult<BufferId> {
        let mut state = self.state.lock();
        state.check("vaCreateBuffer")?;
        if !state.contexts.contains_key(&context) {
            return Err(status(sys::VA_STATUS_ERROR_INVALID_CONTEXT));
        }
        let id = state.allocate_id();
        state.buffers.insert(
            id,
            MemoryBuffer {
                kind: Some(buffer_type),
                data: data.to_vec(),
                mapped: false,
            },
        );
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> VaResult<()> {
        let mut state = self.state.lock();
        state.check("vaDestroyBuffer")?;
        match state.buffers.get(&buffer) {
            Some(b) if b.kind.is_some() => {
                state.buffers.remove(&buffer);
                Ok(())
            }
            _ => Err(status(sys::VA_STATUS_ERROR_INVALID_BUFFER)),
        }
    }

    fn map_buffer(&mut self, buffer: BufferId) -> VaResult<NonNull<u8>> {
        let mut state = self.state.lock();
        state.check("vaMapBuffer")?;
        let entry = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_INVALID_BUFFER))?;
        if entry.mapped {
            return Err(status(sys::VA_STATUS_ERROR_OPERATION_FAILED));
        }
        entry.mapped = true;
        NonNull::new(entry.data.as_mut_ptr())
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_ALLOCATION_FAILED))
    }

    fn unmap_buffer(&mut self, buffer: BufferId) -> VaResult<()> {
        let mut state = self.state.lock();
        state.check("vaUnmapBuffer")?;
        match state.buffers.get_mut(&buffer) {
            Some(entry) if entry.mapped => {
                entry.mapped = false;
                Ok(())
            }
            _ => Err(status(sys::VA_STATUS_ERROR_INVALID_BUFFER)),
        }
    }

    fn begin_picture(&mut self, context: ContextId, target: SurfaceId) -> VaResult<()> {
        let mut state = self.state.lock();
        state.check("vaBeginPicture")?;
        let ctx = state
            .contexts
            .get_mut(&context)
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_INVALID_CONTEXT))?;
        if !ctx.targets.contains(&target) {
            return Err(status(sys::VA_STATUS_ERROR_INVALID_SURFACE));
        }
        ctx.current = Some(target);
        ctx.slice_data.clear();
        Ok(())
    }

    fn render_picture(&mut self, context: ContextId, buffers: &[BufferId]) -> VaResult<()> {
        let mut state = self.state.lock();
        state.check("vaRenderPicture")?;
        let mut slice_data = Vec::new();
        for id in buffers {
            let buffer = state
                .buffers
                .get(id)
                .ok_or_else(|| status(sys::VA_STATUS_ERROR_INVALID_BUFFER))?;
            if buffer.kind == Some(BufferType::SliceData) {
                slice_data.extend_from_slice(&buffer.data);
            }
        }
        let ctx = state
            .contexts
            .get_mut(&context)
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_INVALID_CONTEXT))?;
        if ctx.current.is_none() {
            return Err(status(sys::VA_STATUS_ERROR_OPERATION_FAILED));
        }
        ctx.slice_data.extend_from_slice(&slice_data);
        Ok(())
    }

    fn end_picture(&mut self, context: ContextId) -> VaResult<()> {
        let mut state = self.state.lock();
        state.check("vaEndPicture")?;
        let ctx = state
            .contexts
            .get_mut(&context)
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_INVALID_CONTEXT))?;
        let target = ctx
            .current
            .take()
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_OPERATION_FAILED))?;
        let color = frame_color(&ctx.slice_data);
        ctx.slice_data.clear();

        let surface = state
            .surfaces
            .get_mut(&target)
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_INVALID_SURFACE))?;
        for pixel in surface.pixels.chunks_exact_mut(4) {
            pixel.copy_from_slice(&color);
        }
        surface.decodes += 1;
        state.pictures_decoded += 1;
        Ok(())
    }

    fn create_image(&mut self, format: &ImageFormat, size: Size) -> VaResult<VaImage> {
        let mut state = self.state.lock();
        state.check("vaCreateImage")?;
        if *format != ImageFormat::RGBX || size.is_empty() {
            return Err(status(sys::VA_STATUS_ERROR_INVALID_PARAMETER));
        }
        let id = state.allocate_id();
        let buffer = state.allocate_id();
        state.buffers.insert(
            buffer,
            MemoryBuffer {
                kind: None,
                data: vec![0; size.rgbx_bytes()],
                mapped: false,
            },
        );
        state.images.insert(id, MemoryImage { size, buffer });
        Ok(VaImage {
            id,
            buffer,
            format: *format,
            size,
            data_size: size.rgbx_bytes(),
            pitches: [size.width * 4, 0, 0],
            offsets: [0; 3],
            num_planes: 1,
        })
    }

    fn destroy_image(&mut self, image: ImageId) -> VaResult<()> {
        let mut state = self.state.lock();
        state.check("vaDestroyImage")?;
        let image = state
            .images
            .remove(&image)
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_INVALID_IMAGE))?;
        state.buffers.remove(&image.buffer);
        Ok(())
    }

    fn get_image(&mut self, surface: SurfaceId, size: Size, image: ImageId) -> VaResult<()> {
        let mut state = self.state.lock();
        state.check("vaGetImage")?;
        let state = &mut *state;
        let source = state
            .surfaces
            .get(&surface)
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_INVALID_SURFACE))?;
        let target = state
            .images
            .get(&image)
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_INVALID_IMAGE))?;
        if source.size != size || target.size != size {
            return Err(status(sys::VA_STATUS_ERROR_INVALID_PARAMETER));
        }
        let buffer = state
            .buffers
            .get_mut(&target.buffer)
            .ok_or_else(|| status(sys::VA_STATUS_ERROR_INVALID_BUFFER))?;
        buffer.data.copy_from_slice(&source.pixels);
        Ok(())
    }
}

/// Shared view into a [`MemoryDriver`]'s resources.
#[derive(Clone)]
pub struct MemoryDriverProbe {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriverProbe {
    /// Make the next call to `call` (a libva function name such as
    /// `"vaCreateSurfaces"`) fail with `VA_STATUS_ERROR_OPERATION_FAILED`.
    pub fn fail_next(&self, call: &'static str) {
        *self.state.lock().failures.entry(call).or_insert(0) += 1;
    }

    pub fn live_surfaces(&self) -> usize {
        self.state.lock().surfaces.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn live_configs(&self) -> usize {
        self.state.lock().configs.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Parameter and slice buffers (image backing stores excluded).
    pub fn live_buffers(&self) -> usize {
        self.state
            .lock()
            .buffers
            .values()
            .filter(|b| b.kind.is_some())
            .count()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn pictures_decoded(&self) -> u64 {
        self.state.lock().pictures_decoded
    }

    pub fn surface_decodes(&self, surface: SurfaceId) -> Option<u64> {
        self.state.lock().surfaces.get(&surface).map(|s| s.decodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized() -> (MemoryDriver, MemoryDriverProbe) {
        let mut driver = MemoryDriver::new();
        let probe = driver.probe();
        driver.initialize().unwrap();
        (driver, probe)
    }

    #[test]
    fn calls_before_initialize_fail_with_invalid_display() {
        let mut driver = MemoryDriver::new();
        let err = driver.query_profiles().expect_err("uninitialized");
        assert_eq!(err.code, sys::VA_STATUS_ERROR_INVALID_DISPLAY);
        assert_eq!(err.message, "invalid VADisplay");
    }

    #[test]
    fn end_picture_paints_target_with_slice_color() {
        let (mut driver, probe) = initialized();
        let size = Size::new(4, 2);
        let config = driver
            .create_config(VaProfile::H264Main, ENTRYPOINT_VLD, RT_FORMAT_YUV420)
            .unwrap();
        let surfaces = driver.create_surfaces(RT_FORMAT_YUV420, size, 2).unwrap();
        let context = driver.create_context(config, size, &surfaces).unwrap();
        let slice = driver
            .create_buffer(context, BufferType::SliceData, b"frame-7")
            .unwrap();

        driver.begin_picture(context, surfaces[1]).unwrap();
        driver.render_picture(context, &[slice]).unwrap();
        driver.end_picture(context).unwrap();

        let image = driver.create_image(&ImageFormat::RGBX, size).unwrap();
        driver.get_image(surfaces[1], size, image.id).unwrap();
        let ptr = driver.map_buffer(image.buffer).unwrap();
        // SAFETY: mapping of `data_size` bytes stays valid until unmap below.
        let pixels = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), image.data_size) };
        let expected = frame_color(b"frame-7");
        assert!(pixels.chunks_exact(4).all(|p| p == expected));
        driver.unmap_buffer(image.buffer).unwrap();

        assert_eq!(probe.surface_decodes(surfaces[1]), Some(1));
        assert_eq!(probe.surface_decodes(surfaces[0]), Some(0));
        assert_eq!(probe.pictures_decoded(), 1);
    }

    #[test]
    fn injected_failure_fires_once() {
        let (mut driver, probe) = initialized();
        probe.fail_next("vaCreateSurfaces");
        let err = driver
            .create_surfaces(RT_FORMAT_YUV420, Size::new(16, 16), 1)
            .expect_err("injected");
        assert_eq!(err.code, sys::VA_STATUS_ERROR_OPERATION_FAILED);
        assert_eq!(
            driver
                .create_surfaces(RT_FORMAT_YUV420, Size::new(16, 16), 1)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn context_rejects_surfaces_of_other_size() {
        let (mut driver, _probe) = initialized();
        let config = driver
            .create_config(VaProfile::H264High, ENTRYPOINT_VLD, RT_FORMAT_YUV420)
            .unwrap();
        let surfaces = driver
            .create_surfaces(RT_FORMAT_YUV420, Size::new(32, 32), 1)
            .unwrap();
        let err = driver
            .create_context(config, Size::new(64, 64), &surfaces)
            .expect_err("size mismatch");
        assert_eq!(err.code, sys::VA_STATUS_ERROR_INVALID_SURFACE);
    }

    #[test]
    fn frame_color_differs_per_payload() {
        assert_ne!(frame_color(b"a"), frame_color(b"b"));
        assert_eq!(frame_color(b"a")[3], 0xff);
    }
}

//! VA-API hardware session: negotiation, surfaces, submission and readback.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────── VaapiContext ────────────────┐
//!  decode    │  Mutex<Inner>                                 │
//!  thread ──►│   submit_buffer ──► pending_buffers           │
//!            │   decode_and_destroy_pending_buffers          │──► VaDriver
//!  client    │     begin / render / end, then destroy all    │   (libva or
//!  thread ──►│   put_surface_into_image (sync + get_image)   │    in-memory)
//!            │   map_image ──► MappedImage (holds the lock)  │
//!            └───────────────────────────────────────────────┘
//! ```
//!
//! Every public operation takes the single context-wide lock; the driver is
//! never entered concurrently.  Failed driver calls are logged with the
//! driver's diagnostic text, counted, and passed to the optional
//! [`ErrorReporter`].
//!
//! # Teardown
//!
//! Dropping the context destroys pending buffers, the decode context, the
//! surface set and the config, then terminates the driver session.

use std::ops::Deref;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use vadec_core::error::{DecoderError, Result};
use vadec_core::types::{Size, SurfaceId, VideoCodecProfile};

use crate::driver::{
    ApiVersion, BufferId, BufferType, ConfigId, ContextId, ENTRYPOINT_VLD, ImageFormat,
    RT_FORMAT_YUV420, VaDriver, VaImage, VaProfile, VaResult,
};

/// Receives every hardware-layer failure, for telemetry.
pub type ErrorReporter = Arc<dyn Fn(&DecoderError) + Send + Sync>;

// ─── Options ────────────────────────────────────────────────────────────────

/// Knobs for opening and negotiating a hardware session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareOptions {
    /// DRM render node opened by `LibvaDriver`.
    pub render_node: PathBuf,
    /// Oldest VA-API version accepted from `vaInitialize`.
    pub min_api_version: ApiVersion,
    /// Allow H.264 Baseline to be served by the Constrained Baseline profile.
    pub allow_profile_fallback: bool,
}

impl Default for HardwareOptions {
    fn default() -> Self {
        Self {
            render_node: PathBuf::from("/dev/dri/renderD128"),
            min_api_version: ApiVersion::new(1, 0),
            allow_profile_fallback: true,
        }
    }
}

// ─── Profile negotiation ────────────────────────────────────────────────────

fn exact_profile(requested: VideoCodecProfile) -> VaProfile {
    match requested {
        VideoCodecProfile::H264Baseline => VaProfile::H264Baseline,
        VideoCodecProfile::H264ConstrainedBaseline => VaProfile::H264ConstrainedBaseline,
        VideoCodecProfile::H264Main => VaProfile::H264Main,
        VideoCodecProfile::H264High => VaProfile::H264High,
    }
}

/// Pick the VA profile serving `requested` from the driver's `supported` list.
///
/// An exact match wins.  Strict Baseline falls back to Constrained Baseline
/// when allowed; no other profile has a fallback.
pub fn negotiate_profile(
    requested: VideoCodecProfile,
    supported: &[i32],
    allow_fallback: bool,
) -> Result<VaProfile> {
    let is_supported = |profile: VaProfile| supported.contains(&profile.as_raw());

    let exact = exact_profile(requested);
    if is_supported(exact) {
        return Ok(exact);
    }
    if allow_fallback
        && exact == VaProfile::H264Baseline
        && is_supported(VaProfile::H264ConstrainedBaseline)
    {
        debug!("H264Baseline unsupported; falling back to H264ConstrainedBaseline");
        return Ok(VaProfile::H264ConstrainedBaseline);
    }
    Err(DecoderError::Negotiation(format!(
        "codec profile {requested} is not supported by the driver"
    )))
}

// ─── Telemetry ──────────────────────────────────────────────────────────────

struct Telemetry {
    reporter: Option<ErrorReporter>,
    errors: AtomicU64,
}

impl Telemetry {
    fn record(&self, err: &DecoderError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if let Some(reporter) = &self.reporter {
            reporter(err);
        }
    }

    fn check<T>(&self, call: &'static str, result: VaResult<T>) -> Result<T> {
        result.map_err(|status| {
            error!(call, status = status.code, message = %status.message, "VA-API call failed");
            let err = DecoderError::Va {
                call,
                status: status.code,
                message: status.message,
            };
            self.record(&err);
            err
        })
    }

    fn negotiation(&self, reason: String) -> DecoderError {
        error!(%reason, "VA-API negotiation failed");
        let err = DecoderError::Negotiation(reason);
        self.record(&err);
        err
    }
}

// ─── Locked state ───────────────────────────────────────────────────────────

struct Inner {
    driver: Box<dyn VaDriver>,
    telemetry: Arc<Telemetry>,
    config: Option<ConfigId>,
    context: Option<ContextId>,
    surfaces: Vec<SurfaceId>,
    surface_size: Size,
    pending_buffers: Vec<BufferId>,
}

impl Inner {
    fn call<T>(
        &mut self,
        name: &'static str,
        f: impl FnOnce(&mut dyn VaDriver) -> VaResult<T>,
    ) -> Result<T> {
        let result = f(self.driver.as_mut());
        self.telemetry.check(name, result)
    }

    fn execute_pending(&mut self, target: SurfaceId) -> Result<()> {
        let context = self.context.ok_or(DecoderError::HardwareNotInitialized)?;
        let buffers = self.pending_buffers.clone();
        self.call("vaBeginPicture", |d| d.begin_picture(context, target))?;
        self.call("vaRenderPicture", |d| d.render_picture(context, &buffers))?;
        self.call("vaEndPicture", |d| d.end_picture(context))
    }

    fn destroy_pending_buffers(&mut self) {
        for buffer in std::mem::take(&mut self.pending_buffers) {
            let _ = self.call("vaDestroyBuffer", |d| d.destroy_buffer(buffer));
        }
    }

    fn destroy_surfaces(&mut self) {
        self.destroy_pending_buffers();
        if let Some(context) = self.context.take() {
            let _ = self.call("vaDestroyContext", |d| d.destroy_context(context));
        }
        let surfaces = std::mem::take(&mut self.surfaces);
        if !surfaces.is_empty() {
            let _ = self.call("vaDestroySurfaces", |d| d.destroy_surfaces(&surfaces));
            debug!(count = surfaces.len(), "Destroyed VA surfaces");
        }
        self.surface_size = Size::default();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.destroy_surfaces();
        if let Some(config) = self.config.take() {
            let _ = self.call("vaDestroyConfig", |d| d.destroy_config(config));
        }
        self.driver.terminate();
        debug!("VA-API session terminated");
    }
}

// ─── VaapiContext ───────────────────────────────────────────────────────────

/// An initialized VA-API decode session for one codec profile.
pub struct VaapiContext {
    inner: Mutex<Inner>,
    telemetry: Arc<Telemetry>,
    profile: VaProfile,
    api_version: ApiVersion,
    vendor: String,
}

impl VaapiContext {
    /// Open the driver session and negotiate a decode config for `requested`.
    ///
    /// Order: `vaInitialize` (version ≥ `options.min_api_version`), profile
    /// query and selection, VLD entrypoint, YUV 4:2:0 RT format, config.
    /// Any failure terminates the session again and is returned.
    #[instrument(skip_all, fields(profile = %requested))]
    pub fn initialize(
        mut driver: Box<dyn VaDriver>,
        requested: VideoCodecProfile,
        options: &HardwareOptions,
        reporter: Option<ErrorReporter>,
    ) -> Result<Self> {
        let telemetry = Arc::new(Telemetry {
            reporter,
            errors: AtomicU64::new(0),
        });

        let api_version = telemetry.check("vaInitialize", driver.initialize())?;

        // Dropping `inner` from here on terminates the session.
        let mut inner = Inner {
            driver,
            telemetry: Arc::clone(&telemetry),
            config: None,
            context: None,
            surfaces: Vec::new(),
            surface_size: Size::default(),
            pending_buffers: Vec::new(),
        };

        if api_version < options.min_api_version {
            return Err(telemetry.negotiation(format!(
                "VA-API {api_version} is older than the required {}",
                options.min_api_version
            )));
        }

        let supported = inner.call("vaQueryConfigProfiles", |d| d.query_profiles())?;
        let profile = negotiate_profile(requested, &supported, options.allow_profile_fallback)
            .map_err(|e| match e {
                DecoderError::Negotiation(reason) => telemetry.negotiation(reason),
                other => other,
            })?;

        let entrypoints = inner.call("vaQueryConfigEntrypoints", |d| {
            d.query_entrypoints(profile)
        })?;
        if !entrypoints.contains(&ENTRYPOINT_VLD) {
            return Err(telemetry.negotiation(format!(
                "{profile:?} has no VLD (slice decode) entrypoint"
            )));
        }

        let rt_formats = inner.call("vaGetConfigAttributes", |d| {
            d.query_rt_formats(profile, ENTRYPOINT_VLD)
        })?;
        if rt_formats & RT_FORMAT_YUV420 == 0 {
            return Err(telemetry.negotiation(format!(
                "{profile:?} does not support the YUV 4:2:0 render target format"
            )));
        }

        let config = inner.call("vaCreateConfig", |d| {
            d.create_config(profile, ENTRYPOINT_VLD, RT_FORMAT_YUV420)
        })?;
        inner.config = Some(config);

        let vendor = inner.driver.vendor_string();
        info!(
            vendor = %vendor,
            api_version = %api_version,
            va_profile = ?profile,
            "VA-API session initialized"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            telemetry,
            profile,
            api_version,
            vendor,
        })
    }

    pub fn profile(&self) -> VaProfile {
        self.profile
    }

    pub fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Failed hardware calls (and negotiation failures) since initialization.
    pub fn error_count(&self) -> u64 {
        self.telemetry.errors.load(Ordering::Relaxed)
    }

    /// Number of surfaces in the current set.
    pub fn surface_count(&self) -> usize {
        self.inner.lock().surfaces.len()
    }

    // ── Surfaces ──────────────────────────────────────────────────────────

    /// Allocate `count` surfaces at `size` and a decode context bound to them.
    ///
    /// All-or-nothing: if the context cannot be created the new surfaces are
    /// destroyed again.  Fails with `IllegalState` while a set exists.
    pub fn create_surfaces(&self, size: Size, count: usize) -> Result<Vec<SurfaceId>> {
        if size.is_empty() || count == 0 {
            return Err(DecoderError::InvalidArgument(format!(
                "cannot create {count} surfaces of {size}"
            )));
        }

        let mut inner = self.inner.lock();
        if !inner.surfaces.is_empty() || inner.context.is_some() {
            return Err(DecoderError::IllegalState(format!(
                "{} surfaces still outstanding",
                inner.surfaces.len()
            )));
        }
        let config = inner.config.ok_or(DecoderError::HardwareNotInitialized)?;

        let surfaces = inner.call("vaCreateSurfaces", |d| {
            d.create_surfaces(RT_FORMAT_YUV420, size, count)
        })?;
        if surfaces.len() != count {
            let _ = inner.call("vaDestroySurfaces", |d| d.destroy_surfaces(&surfaces));
            return Err(DecoderError::Platform(format!(
                "driver created {} of {count} surfaces",
                surfaces.len()
            )));
        }

        match inner.call("vaCreateContext", |d| d.create_context(config, size, &surfaces)) {
            Ok(context) => {
                inner.context = Some(context);
                inner.surfaces = surfaces.clone();
                inner.surface_size = size;
                info!(count, size = %size, "Created VA surfaces and decode context");
                Ok(surfaces)
            }
            Err(e) => {
                let _ = inner.call("vaDestroySurfaces", |d| d.destroy_surfaces(&surfaces));
                Err(e)
            }
        }
    }

    /// Destroy the decode context and the surface set.  No-op without one.
    pub fn destroy_surfaces(&self) {
        self.inner.lock().destroy_surfaces();
    }

    // ── Submission ────────────────────────────────────────────────────────

    /// Queue a parameter or slice buffer for the next picture.
    pub fn submit_buffer(&self, buffer_type: BufferType, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let context = inner.context.ok_or(DecoderError::HardwareNotInitialized)?;
        let buffer = inner.call("vaCreateBuffer", |d| {
            d.create_buffer(context, buffer_type, data)
        })?;
        inner.pending_buffers.push(buffer);
        Ok(())
    }

    /// Decode all queued buffers into `target` in one begin/render/end
    /// sequence.  The queued buffers are destroyed whether or not it succeeds.
    pub fn decode_and_destroy_pending_buffers(&self, target: SurfaceId) -> Result<()> {
        let mut inner = self.inner.lock();
        let result = inner.execute_pending(target);
        inner.destroy_pending_buffers();
        result
    }

    /// Drop queued buffers without decoding them.
    pub fn destroy_pending_buffers(&self) {
        self.inner.lock().destroy_pending_buffers();
    }

    // ── Readback ──────────────────────────────────────────────────────────

    pub fn sync_surface(&self, surface: SurfaceId) -> Result<()> {
        self.inner
            .lock()
            .call("vaSyncSurface", |d| d.sync_surface(surface))
    }

    /// Create a 32-bit RGBX image of `size` for reading surfaces back.
    pub fn create_rgb_image(&self, size: Size) -> Result<VaImage> {
        self.inner
            .lock()
            .call("vaCreateImage", |d| d.create_image(&ImageFormat::RGBX, size))
    }

    pub fn destroy_image(&self, image: &VaImage) {
        let id = image.id;
        let _ = self.inner.lock().call("vaDestroyImage", |d| d.destroy_image(id));
    }

    /// Wait for decode of `surface` to finish, then copy it into `image`.
    pub fn put_surface_into_image(&self, surface: SurfaceId, image: &VaImage) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.call("vaSyncSurface", |d| d.sync_surface(surface))?;
        inner.call("vaGetImage", |d| d.get_image(surface, image.size, image.id))
    }

    /// Map `image` into CPU memory.  The context stays locked until the
    /// returned guard is unmapped or dropped.
    pub fn map_image(&self, image: &VaImage) -> Result<MappedImage<'_>> {
        let mut inner = self.inner.lock();
        let buffer = image.buffer;
        let ptr = inner.call("vaMapBuffer", |d| d.map_buffer(buffer))?;
        Ok(MappedImage {
            inner,
            image: *image,
            ptr,
            mapped: true,
        })
    }
}

impl std::fmt::Debug for VaapiContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaapiContext")
            .field("vendor", &self.vendor)
            .field("api_version", &self.api_version)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

// ─── MappedImage ────────────────────────────────────────────────────────────

/// CPU view of a mapped [`VaImage`].
pub struct MappedImage<'a> {
    inner: MutexGuard<'a, Inner>,
    image: VaImage,
    ptr: NonNull<u8>,
    mapped: bool,
}

impl MappedImage<'_> {
    /// Row stride of the first plane in bytes.
    pub fn pitch(&self) -> usize {
        self.image.pitches[0] as usize
    }

    pub fn size(&self) -> Size {
        self.image.size
    }

    /// Unmap explicitly, reporting failure.  Dropping unmaps too.
    pub fn unmap(mut self) -> Result<()> {
        self.mapped = false;
        let buffer = self.image.buffer;
        self.inner.call("vaUnmapBuffer", |d| d.unmap_buffer(buffer))
    }
}

impl Deref for MappedImage<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the driver mapped `data_size` bytes at `ptr`; the mapping
        // lives until `unmap_buffer`, which only this guard calls, and the
        // guard holds the context lock so no other call can touch the image.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.image.data_size) }
    }
}

impl Drop for MappedImage<'_> {
    fn drop(&mut self) {
        if self.mapped {
            let buffer = self.image.buffer;
            if self
                .inner
                .call("vaUnmapBuffer", |d| d.unmap_buffer(buffer))
                .is_err()
            {
                warn!(image = self.image.id, "Image unmap on drop failed");
            }
        }
    }
}

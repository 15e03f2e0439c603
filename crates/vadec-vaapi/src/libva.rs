//! [`VaDriver`] over libva + libva-drm.
//!
//! Opens a DRM render node and obtains a `VADisplay` from it.  Each trait
//! method is one libva call; failures carry the `vaErrorStr` text.

use std::ffi::{CStr, c_void};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::raw::{c_int, c_uint};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use tracing::{debug, warn};

use vadec_core::error::{DecoderError, Result};
use vadec_core::types::{Size, SurfaceId};

use crate::driver::{
    ApiVersion, BufferId, BufferType, ConfigId, ContextId, ImageFormat, ImageId, VaDriver,
    VaImage, VaProfile, VaResult, VaStatus,
};
use crate::sys;

fn error_str(status: sys::VAStatus) -> String {
    // SAFETY: vaErrorStr returns a pointer to a static string (or null).
    let ptr = unsafe { sys::vaErrorStr(status) };
    if ptr.is_null() {
        return "unknown libva error".into();
    }
    // SAFETY: non-null pointer to a NUL-terminated static string.
    unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}

fn check(status: sys::VAStatus) -> VaResult<()> {
    if status == sys::VA_STATUS_SUCCESS {
        Ok(())
    } else {
        Err(VaStatus::new(status, error_str(status)))
    }
}

/// A libva display opened on a DRM render node.
pub struct LibvaDriver {
    // Keeps the DRM fd open for the display's lifetime.
    _device: File,
    display: sys::VADisplay,
    render_node: PathBuf,
    // vaTerminate releases the display even when vaInitialize failed, so
    // this tracks release rather than initialization.
    terminated: bool,
}

// SAFETY: the VADisplay is only used through `&mut self`, and `VaapiContext`
// serializes every call behind its lock; libva displays have no thread
// affinity.
unsafe impl Send for LibvaDriver {}

impl LibvaDriver {
    pub fn open(render_node: &Path) -> Result<Self> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(render_node)
            .map_err(|e| {
                DecoderError::Platform(format!("cannot open {}: {e}", render_node.display()))
            })?;

        // SAFETY: the fd is valid for as long as `device` lives, which is the
        // lifetime of the returned display.
        let display = unsafe { sys::vaGetDisplayDRM(device.as_raw_fd()) };
        if display.is_null() {
            return Err(DecoderError::Platform(format!(
                "vaGetDisplayDRM returned no display for {}",
                render_node.display()
            )));
        }
        debug!(render_node = %render_node.display(), "Opened VA display");

        Ok(Self {
            _device: device,
            display,
            render_node: render_node.to_path_buf(),
            terminated: false,
        })
    }

    pub fn render_node(&self) -> &Path {
        &self.render_node
    }
}

impl Drop for LibvaDriver {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl VaDriver for LibvaDriver {
    fn initialize(&mut self) -> VaResult<ApiVersion> {
        let (mut major, mut minor): (c_int, c_int) = (0, 0);
        // SAFETY: display obtained from vaGetDisplayDRM; out-pointers are live.
        check(unsafe { sys::vaInitialize(self.display, &mut major, &mut minor) })?;
        Ok(ApiVersion::new(major.max(0) as u32, minor.max(0) as u32))
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        // SAFETY: display is non-null (checked in `open`), released exactly
        // once here, and not used afterwards.
        if let Err(status) = check(unsafe { sys::vaTerminate(self.display) }) {
            warn!(error = %status, "vaTerminate failed");
        }
    }

    fn vendor_string(&self) -> String {
        // SAFETY: initialized display; libva owns the returned string.
        let ptr = unsafe { sys::vaQueryVendorString(self.display) };
        if ptr.is_null() {
            return String::new();
        }
        // SAFETY: non-null NUL-terminated string owned by the display.
        unsafe { CStr::from_ptr(ptr) }
            .to_string_lossy()
            .into_owned()
    }

    fn query_profiles(&mut self) -> VaResult<Vec<i32>> {
        // SAFETY: initialized display.
        let max = unsafe { sys::vaMaxNumProfiles(self.display) }.max(0) as usize;
        let mut profiles = vec![0; max];
        let mut count: c_int = 0;
        // SAFETY: `profiles` has room for vaMaxNumProfiles entries.
        check(unsafe {
            sys::vaQueryConfigProfiles(self.display, profiles.as_mut_ptr(), &mut count)
        })?;
        profiles.truncate((count.max(0) as usize).min(max));
        Ok(profiles)
    }

    fn query_entrypoints(&mut self, profile: VaProfile) -> VaResult<Vec<i32>> {
        // SAFETY: initialized display.
        let max = unsafe { sys::vaMaxNumEntrypoints(self.display) }.max(0) as usize;
        let mut entrypoints = vec![0; max];
        let mut count: c_int = 0;
        // SAFETY: `entrypoints` has room for vaMaxNumEntrypoints entries.
        check(unsafe {
            sys::vaQueryConfigEntrypoints(
                self.display,
                profile.as_raw(),
                entrypoints.as_mut_ptr(),
                &mut count,
            )
        })?;
        entrypoints.truncate((count.max(0) as usize).min(max));
        Ok(entrypoints)
    }

    fn query_rt_formats(&mut self, profile: VaProfile, entrypoint: i32) -> VaResult<u32> {
        let mut attrib = sys::VAConfigAttrib {
            type_: sys::VAConfigAttribRTFormat,
            value: 0,
        };
        // SAFETY: one attribute in, one attribute out.
        check(unsafe {
            sys::vaGetConfigAttributes(self.display, profile.as_raw(), entrypoint, &mut attrib, 1)
        })?;
        if attrib.value == sys::VA_ATTRIB_NOT_SUPPORTED {
            return Ok(0);
        }
        Ok(attrib.value)
    }

    fn create_config(
        &mut self,
        profile: VaProfile,
        entrypoint: i32,
        rt_format: u32,
    ) -> VaResult<ConfigId> {
        let mut attrib = sys::VAConfigAttrib {
            type_: sys::VAConfigAttribRTFormat,
            value: rt_format,
        };
        let mut config = sys::VA_INVALID_ID;
        // SAFETY: attribute and out-pointer are live for the call.
        check(unsafe {
            sys::vaCreateConfig(
                self.display,
                profile.as_raw(),
                entrypoint,
                &mut attrib,
                1,
                &mut config,
            )
        })?;
        Ok(config)
    }

    fn destroy_config(&mut self, config: ConfigId) -> VaResult<()> {
        // SAFETY: config was created on this display.
        check(unsafe { sys::vaDestroyConfig(self.display, config) })
    }

    fn create_surfaces(
        &mut self,
        rt_format: u32,
        size: Size,
        count: usize,
    ) -> VaResult<Vec<SurfaceId>> {
        let mut surfaces = vec![sys::VA_INVALID_ID; count];
        // SAFETY: `surfaces` holds exactly `count` slots; no attributes.
        check(unsafe {
            sys::vaCreateSurfaces(
                self.display,
                rt_format,
                size.width,
                size.height,
                surfaces.as_mut_ptr(),
                count as c_uint,
                std::ptr::null_mut(),
                0,
            )
        })?;
        Ok(surfaces)
    }

    fn destroy_surfaces(&mut self, surfaces: &[SurfaceId]) -> VaResult<()> {
        let mut ids = surfaces.to_vec();
        // SAFETY: ids were created on this display; libva does not retain
        // the array.
        check(unsafe {
            sys::vaDestroySurfaces(self.display, ids.as_mut_ptr(), ids.len() as c_int)
        })
    }

    fn sync_surface(&mut self, surface: SurfaceId) -> VaResult<()> {
        // SAFETY: surface belongs to this display.
        check(unsafe { sys::vaSyncSurface(self.display, surface) })
    }

    fn create_context(
        &mut self,
        config: ConfigId,
        size: Size,
        render_targets: &[SurfaceId],
    ) -> VaResult<ContextId> {
        let mut targets = render_targets.to_vec();
        let mut context = sys::VA_INVALID_ID;
        // SAFETY: targets array and out-pointer are live for the call.
        check(unsafe {
            sys::vaCreateContext(
                self.display,
                config,
                size.width as c_int,
                size.height as c_int,
                sys::VA_PROGRESSIVE,
                targets.as_mut_ptr(),
                targets.len() as c_int,
                &mut context,
            )
        })?;
        Ok(context)
    }

    fn destroy_context(&mut self, context: ContextId) -> VaResult<()> {
        // SAFETY: context was created on this display.
        check(unsafe { sys::vaDestroyContext(self.display, context) })
    }

    fn create_buffer(
        &mut self,
        context: ContextId,
        buffer_type: BufferType,
        data: &[u8],
    ) -> VaResult<BufferId> {
        let mut buffer = sys::VA_INVALID_ID;
        // SAFETY: libva copies `data` into the new buffer and never writes
        // through the pointer.
        check(unsafe {
            sys::vaCreateBuffer(
                self.display,
                context,
                buffer_type.as_raw(),
                data.len() as c_uint,
                1,
                data.as_ptr() as *mut c_void,
                &mut buffer,
            )
        })?;
        Ok(buffer)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> VaResult<()> {
        // SAFETY: buffer was created on this display.
        check(unsafe { sys::vaDestroyBuffer(self.display, buffer) })
    }

    fn map_buffer(&mut self, buffer: BufferId) -> VaResult<NonNull<u8>> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: out-pointer is live; mapping valid until vaUnmapBuffer.
        check(unsafe { sys::vaMapBuffer(self.display, buffer, &mut ptr) })?;
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            VaStatus::new(
                sys::VA_STATUS_ERROR_OPERATION_FAILED,
                "vaMapBuffer returned a null mapping",
            )
        })
    }

    fn unmap_buffer(&mut self, buffer: BufferId) -> VaResult<()> {
        // SAFETY: buffer is currently mapped on this display.
        check(unsafe { sys::vaUnmapBuffer(self.display, buffer) })
    }

    fn begin_picture(&mut self, context: ContextId, target: SurfaceId) -> VaResult<()> {
        // SAFETY: context and target belong to this display.
        check(unsafe { sys::vaBeginPicture(self.display, context, target) })
    }

    fn render_picture(&mut self, context: ContextId, buffers: &[BufferId]) -> VaResult<()> {
        let mut ids = buffers.to_vec();
        // SAFETY: ids array is live for the call; libva does not retain it.
        check(unsafe {
            sys::vaRenderPicture(self.display, context, ids.as_mut_ptr(), ids.len() as c_int)
        })
    }

    fn end_picture(&mut self, context: ContextId) -> VaResult<()> {
        // SAFETY: a picture was begun on this context.
        check(unsafe { sys::vaEndPicture(self.display, context) })
    }

    fn create_image(&mut self, format: &ImageFormat, size: Size) -> VaResult<VaImage> {
        let mut va_format = sys::VAImageFormat {
            fourcc: format.fourcc,
            byte_order: format.byte_order,
            bits_per_pixel: format.bits_per_pixel,
            depth: format.depth,
            red_mask: format.red_mask,
            green_mask: format.green_mask,
            blue_mask: format.blue_mask,
            alpha_mask: format.alpha_mask,
            va_reserved: [0; sys::VA_PADDING_LOW],
        };
        let mut image = sys::VAImage::default();
        // SAFETY: format and image out-struct are live for the call.
        check(unsafe {
            sys::vaCreateImage(
                self.display,
                &mut va_format,
                size.width as c_int,
                size.height as c_int,
                &mut image,
            )
        })?;

        Ok(VaImage {
            id: image.image_id,
            buffer: image.buf,
            format: *format,
            size: Size::new(u32::from(image.width), u32::from(image.height)),
            data_size: image.data_size as usize,
            pitches: image.pitches,
            offsets: image.offsets,
            num_planes: image.num_planes,
        })
    }

    fn destroy_image(&mut self, image: ImageId) -> VaResult<()> {
        // SAFETY: image was created on this display.
        check(unsafe { sys::vaDestroyImage(self.display, image) })
    }

    fn get_image(&mut self, surface: SurfaceId, size: Size, image: ImageId) -> VaResult<()> {
        // SAFETY: surface and image belong to this display; region is the
        // full surface.
        check(unsafe {
            sys::vaGetImage(self.display, surface, 0, 0, size.width, size.height, image)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDER_NODE: &str = "/dev/dri/renderD128";

    #[test]
    fn display_is_released_once_without_initialize() {
        let path = Path::new(RENDER_NODE);
        if !path.exists() {
            eprintln!("skipping: no render node at {RENDER_NODE}");
            return;
        }
        let Ok(mut driver) = LibvaDriver::open(path) else {
            eprintln!("skipping: no VA display on {RENDER_NODE}");
            return;
        };
        assert!(!driver.terminated);

        driver.terminate();
        assert!(driver.terminated);
        // Second call and the drop that follows must not touch the display.
        driver.terminate();
        drop(driver);
    }
}

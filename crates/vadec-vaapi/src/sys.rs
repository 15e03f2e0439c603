//! Raw FFI bindings to libva (`va/va.h`) and libva-drm (`va/va_drm.h`).
//!
//! Covers the decode and image-readback subset used by
//! [`LibvaDriver`](super::libva::LibvaDriver).  Matches libva 2.x (VA-API 1.x).
//!
//! # Linking
//!
//! `build.rs` emits `-l va` and `-l va-drm` when the libraries are found;
//! otherwise the crate builds in stub mode and nothing here is called.
//!
//! # Safety
//!
//! All functions in this module are `unsafe extern "C"`.  Every call takes a
//! `VADisplay` that must come from a successful `vaGetDisplayDRM` +
//! `vaInitialize` pair and must not be used after `vaTerminate`.  libva does
//! not guarantee reentrancy per display; callers serialize access.

#![allow(non_camel_case_types, non_snake_case, dead_code)]

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_uint, c_ushort};

// ═══════════════════════════════════════════════════════════════════════════
//  COMMON TYPES
// ═══════════════════════════════════════════════════════════════════════════

pub type VADisplay = *mut c_void;
pub type VAStatus = c_int;
pub type VAGenericID = c_uint;
pub type VAConfigID = VAGenericID;
pub type VAContextID = VAGenericID;
pub type VASurfaceID = VAGenericID;
pub type VABufferID = VAGenericID;
pub type VAImageID = VAGenericID;

pub type VAProfile = c_int;
pub type VAEntrypoint = c_int;
pub type VAConfigAttribType = c_int;
pub type VABufferType = c_int;

pub const VA_INVALID_ID: VAGenericID = 0xffff_ffff;
pub const VA_PADDING_LOW: usize = 4;

// ─── Status codes ────────────────────────────────────────────────────────

pub const VA_STATUS_SUCCESS: VAStatus = 0x0000_0000;
pub const VA_STATUS_ERROR_OPERATION_FAILED: VAStatus = 0x0000_0001;
pub const VA_STATUS_ERROR_ALLOCATION_FAILED: VAStatus = 0x0000_0002;
pub const VA_STATUS_ERROR_INVALID_DISPLAY: VAStatus = 0x0000_0003;
pub const VA_STATUS_ERROR_INVALID_CONFIG: VAStatus = 0x0000_0004;
pub const VA_STATUS_ERROR_INVALID_CONTEXT: VAStatus = 0x0000_0005;
pub const VA_STATUS_ERROR_INVALID_SURFACE: VAStatus = 0x0000_0006;
pub const VA_STATUS_ERROR_INVALID_BUFFER: VAStatus = 0x0000_0007;
pub const VA_STATUS_ERROR_INVALID_IMAGE: VAStatus = 0x0000_0008;
pub const VA_STATUS_ERROR_UNSUPPORTED_PROFILE: VAStatus = 0x0000_000c;
pub const VA_STATUS_ERROR_UNSUPPORTED_ENTRYPOINT: VAStatus = 0x0000_000d;
pub const VA_STATUS_ERROR_UNSUPPORTED_RT_FORMAT: VAStatus = 0x0000_000e;
pub const VA_STATUS_ERROR_INVALID_PARAMETER: VAStatus = 0x0000_0012;
pub const VA_STATUS_ERROR_DECODING_ERROR: VAStatus = 0x0000_0017;

// ─── Profiles / entrypoints ──────────────────────────────────────────────

pub const VAProfileH264Baseline: VAProfile = 5;
pub const VAProfileH264Main: VAProfile = 6;
pub const VAProfileH264High: VAProfile = 7;
pub const VAProfileH264ConstrainedBaseline: VAProfile = 13;

pub const VAEntrypointVLD: VAEntrypoint = 1;

// ─── Config attributes ───────────────────────────────────────────────────

pub const VAConfigAttribRTFormat: VAConfigAttribType = 0;
pub const VA_ATTRIB_NOT_SUPPORTED: c_uint = 0x8000_0000;
pub const VA_RT_FORMAT_YUV420: c_uint = 0x0000_0001;

/// `VAConfigAttrib`
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VAConfigAttrib {
    pub type_: VAConfigAttribType,
    pub value: c_uint,
}

// ─── Context flags ───────────────────────────────────────────────────────

pub const VA_PROGRESSIVE: c_int = 0x1;

// ─── Buffer types ────────────────────────────────────────────────────────

pub const VAPictureParameterBufferType: VABufferType = 0;
pub const VAIQMatrixBufferType: VABufferType = 1;
pub const VASliceParameterBufferType: VABufferType = 4;
pub const VASliceDataBufferType: VABufferType = 5;

// ═══════════════════════════════════════════════════════════════════════════
//  IMAGES (va.h)
// ═══════════════════════════════════════════════════════════════════════════

pub const VA_LSB_FIRST: c_uint = 1;

/// `VAImageFormat`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VAImageFormat {
    pub fourcc: c_uint,
    pub byte_order: c_uint,
    pub bits_per_pixel: c_uint,
    pub depth: c_uint,
    pub red_mask: c_uint,
    pub green_mask: c_uint,
    pub blue_mask: c_uint,
    pub alpha_mask: c_uint,
    pub va_reserved: [c_uint; VA_PADDING_LOW],
}

/// `VAImage`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VAImage {
    pub image_id: VAImageID,
    pub format: VAImageFormat,
    pub buf: VABufferID,
    pub width: c_ushort,
    pub height: c_ushort,
    pub data_size: c_uint,
    pub num_planes: c_uint,
    pub pitches: [c_uint; 3],
    pub offsets: [c_uint; 3],
    pub num_palette_entries: c_int,
    pub entry_bytes: c_int,
    pub component_order: [c_char; 4],
    pub va_reserved: [c_uint; VA_PADDING_LOW],
}

// ═══════════════════════════════════════════════════════════════════════════
//  FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

unsafe extern "C" {
    // ── va_drm.h ─────────────────────────────────────────────────────────
    pub fn vaGetDisplayDRM(fd: c_int) -> VADisplay;

    // ── Session ──────────────────────────────────────────────────────────
    pub fn vaInitialize(dpy: VADisplay, major: *mut c_int, minor: *mut c_int) -> VAStatus;
    pub fn vaTerminate(dpy: VADisplay) -> VAStatus;
    pub fn vaErrorStr(status: VAStatus) -> *const c_char;
    pub fn vaQueryVendorString(dpy: VADisplay) -> *const c_char;

    // ── Capabilities ─────────────────────────────────────────────────────
    pub fn vaMaxNumProfiles(dpy: VADisplay) -> c_int;
    pub fn vaQueryConfigProfiles(
        dpy: VADisplay,
        profile_list: *mut VAProfile,
        num_profiles: *mut c_int,
    ) -> VAStatus;
    pub fn vaMaxNumEntrypoints(dpy: VADisplay) -> c_int;
    pub fn vaQueryConfigEntrypoints(
        dpy: VADisplay,
        profile: VAProfile,
        entrypoint_list: *mut VAEntrypoint,
        num_entrypoints: *mut c_int,
    ) -> VAStatus;
    pub fn vaGetConfigAttributes(
        dpy: VADisplay,
        profile: VAProfile,
        entrypoint: VAEntrypoint,
        attrib_list: *mut VAConfigAttrib,
        num_attribs: c_int,
    ) -> VAStatus;

    // ── Config / context ─────────────────────────────────────────────────
    pub fn vaCreateConfig(
        dpy: VADisplay,
        profile: VAProfile,
        entrypoint: VAEntrypoint,
        attrib_list: *mut VAConfigAttrib,
        num_attribs: c_int,
        config_id: *mut VAConfigID,
    ) -> VAStatus;
    pub fn vaDestroyConfig(dpy: VADisplay, config_id: VAConfigID) -> VAStatus;
    pub fn vaCreateContext(
        dpy: VADisplay,
        config_id: VAConfigID,
        picture_width: c_int,
        picture_height: c_int,
        flag: c_int,
        render_targets: *mut VASurfaceID,
        num_render_targets: c_int,
        context: *mut VAContextID,
    ) -> VAStatus;
    pub fn vaDestroyContext(dpy: VADisplay, context: VAContextID) -> VAStatus;

    // ── Surfaces ─────────────────────────────────────────────────────────
    pub fn vaCreateSurfaces(
        dpy: VADisplay,
        format: c_uint,
        width: c_uint,
        height: c_uint,
        surfaces: *mut VASurfaceID,
        num_surfaces: c_uint,
        attrib_list: *mut c_void,
        num_attribs: c_uint,
    ) -> VAStatus;
    pub fn vaDestroySurfaces(
        dpy: VADisplay,
        surfaces: *mut VASurfaceID,
        num_surfaces: c_int,
    ) -> VAStatus;
    pub fn vaSyncSurface(dpy: VADisplay, render_target: VASurfaceID) -> VAStatus;

    // ── Buffers / decode ─────────────────────────────────────────────────
    pub fn vaCreateBuffer(
        dpy: VADisplay,
        context: VAContextID,
        type_: VABufferType,
        size: c_uint,
        num_elements: c_uint,
        data: *mut c_void,
        buf_id: *mut VABufferID,
    ) -> VAStatus;
    pub fn vaDestroyBuffer(dpy: VADisplay, buffer_id: VABufferID) -> VAStatus;
    pub fn vaMapBuffer(dpy: VADisplay, buf_id: VABufferID, pbuf: *mut *mut c_void) -> VAStatus;
    pub fn vaUnmapBuffer(dpy: VADisplay, buf_id: VABufferID) -> VAStatus;
    pub fn vaBeginPicture(
        dpy: VADisplay,
        context: VAContextID,
        render_target: VASurfaceID,
    ) -> VAStatus;
    pub fn vaRenderPicture(
        dpy: VADisplay,
        context: VAContextID,
        buffers: *mut VABufferID,
        num_buffers: c_int,
    ) -> VAStatus;
    pub fn vaEndPicture(dpy: VADisplay, context: VAContextID) -> VAStatus;

    // ── Images ───────────────────────────────────────────────────────────
    pub fn vaCreateImage(
        dpy: VADisplay,
        format: *mut VAImageFormat,
        width: c_int,
        height: c_int,
        image: *mut VAImage,
    ) -> VAStatus;
    pub fn vaDestroyImage(dpy: VADisplay, image: VAImageID) -> VAStatus;
    pub fn vaGetImage(
        dpy: VADisplay,
        surface: VASurfaceID,
        x: c_int,
        y: c_int,
        width: c_uint,
        height: c_uint,
        image: VAImageID,
    ) -> VAStatus;
}

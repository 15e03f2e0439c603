//! Bitstream buffers backed by Linux shared memory.
//!
//! The client hands the accelerator an owned memfd plus the number of valid
//! bytes.  The client thread maps it read-only; the mapping lives as long as
//! the decode thread or the engine holds a reference to it.

use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::ptr::NonNull;

use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};

use crate::error::{DecoderError, Result};

/// Owned handle to a shared memory region holding compressed bytes.
#[derive(Debug)]
pub struct SharedMemoryHandle {
    fd: OwnedFd,
}

impl SharedMemoryHandle {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create an anonymous memfd holding a copy of `bytes`.
    pub fn with_contents(name: &str, bytes: &[u8]) -> Result<Self> {
        let cname = CString::new(name)
            .map_err(|e| DecoderError::InvalidArgument(format!("memfd name: {e}")))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|e| DecoderError::Platform(format!("memfd_create failed: {e}")))?;

        let mut file = File::from(fd);
        file.write_all(bytes)
            .map_err(|e| DecoderError::Platform(format!("memfd write failed: {e}")))?;
        Ok(Self {
            fd: OwnedFd::from(file),
        })
    }

    fn len(&self) -> std::io::Result<u64> {
        Ok(rustix::fs::fstat(&self.fd)?.st_size as u64)
    }
}

/// A compressed bitstream buffer submitted by the client.
#[derive(Debug)]
pub struct BitstreamBuffer {
    id: i32,
    handle: SharedMemoryHandle,
    size: usize,
}

impl BitstreamBuffer {
    pub fn new(id: i32, handle: SharedMemoryHandle, size: usize) -> Self {
        Self { id, handle, size }
    }

    /// Copy `bytes` into a fresh memfd and wrap it as buffer `id`.
    pub fn from_bytes(id: i32, bytes: &[u8]) -> Result<Self> {
        let handle = SharedMemoryHandle::with_contents("vadec-bitstream", bytes)?;
        Ok(Self::new(id, handle, bytes.len()))
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Map the first `size` bytes read-only.
    ///
    /// Fails with [`DecoderError::UnreadableInput`] when the region is
    /// shorter than the declared size or the kernel refuses the mapping.
    pub fn map(self) -> Result<MappedBitstream> {
        let unreadable = |reason: String| DecoderError::UnreadableInput {
            id: self.id,
            reason,
        };

        if self.size == 0 {
            return Err(unreadable("zero-sized buffer cannot be mapped".into()));
        }
        let region = self
            .handle
            .len()
            .map_err(|e| unreadable(format!("fstat failed: {e}")))?;
        if region < self.size as u64 {
            return Err(unreadable(format!(
                "declared size {} exceeds shared region of {region} bytes",
                self.size
            )));
        }

        // SAFETY: the fd is a live shared memory object of at least `size`
        // bytes (checked above); the mapping is read-only and private to this
        // struct, which unmaps it exactly once in `Drop`.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                self.size,
                ProtFlags::READ,
                MapFlags::SHARED,
                &self.handle.fd,
                0,
            )
        }
        .map_err(|e| unreadable(format!("mmap failed: {e}")))?;
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| unreadable("mmap returned null".into()))?;

        Ok(MappedBitstream {
            id: self.id,
            ptr,
            len: self.size,
        })
    }
}

/// Read-only view of a bitstream buffer's bytes.
pub struct MappedBitstream {
    id: i32,
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedBitstream {
    pub fn id(&self) -> i32 {
        self.id
    }
}

impl Deref for MappedBitstream {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` points at a live read-only mapping of `len` bytes
        // that outlives `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for MappedBitstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBitstream")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for MappedBitstream {
    fn drop(&mut self) {
        // SAFETY: the region was mapped by `BitstreamBuffer::map` with this
        // pointer and length and is unmapped nowhere else.
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::warn!(input_id = self.id, error = %e, "munmap of bitstream buffer failed");
        }
    }
}

// SAFETY: the mapping is immutable for its whole lifetime, so shared reads
// from any thread are sound.
unsafe impl Send for MappedBitstream {}
unsafe impl Sync for MappedBitstream {}

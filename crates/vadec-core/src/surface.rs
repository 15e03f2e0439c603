//! Reference-counted decode surface with a release trigger.
//!
//! A [`Surface`] wraps a driver surface id that the accelerator lends to the
//! codec engine for one decode + output cycle.  It is shared as
//! `Arc<Surface>` between the engine (reference frames) and the output
//! queue; when the last `Arc` drops, the release callback hands the id back
//! to the pool.  The callback runs exactly once.

use std::fmt;

use crate::types::{Size, SurfaceId};

/// Invoked with the surface id when the last reference is dropped.
pub type ReleaseCallback = Box<dyn FnOnce(SurfaceId) + Send + Sync>;

pub struct Surface {
    id: SurfaceId,
    size: Size,
    release: Option<ReleaseCallback>,
}

impl Surface {
    pub fn new(id: SurfaceId, size: Size, release: ReleaseCallback) -> Self {
        Self {
            id,
            size,
            release: Some(release),
        }
    }

    /// A surface that is not returned anywhere when dropped.
    pub fn detached(id: SurfaceId, size: Size) -> Self {
        Self {
            id,
            size,
            release: None,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn size(&self) -> Size {
        self.size
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.id);
        }
    }
}

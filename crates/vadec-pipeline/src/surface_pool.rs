//! Driver surfaces available for decode reuse.
//!
//! The pool knows the whole current set and which members are free.  Free
//! ids are lent to the engine wrapped in an `Arc<Surface>` whose release
//! callback posts [`ControlMessage::RecycleSurface`] to the client thread;
//! the client thread puts the id back and signals `surfaces_available`.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crossbeam::channel::Sender;
use tracing::{debug, warn};

use vadec_core::surface::Surface;
use vadec_core::types::{Size, SurfaceId};

use crate::messages::ControlMessage;

pub(crate) struct SurfacePool {
    size: Size,
    members: HashSet<SurfaceId>,
    available: VecDeque<SurfaceId>,
}

impl SurfacePool {
    pub fn new(size: Size) -> Self {
        Self {
            size,
            members: HashSet::new(),
            available: VecDeque::new(),
        }
    }

    /// Replace the set with freshly created `surfaces`, all free.
    pub fn install(&mut self, size: Size, surfaces: &[SurfaceId]) {
        self.size = size;
        self.members = surfaces.iter().copied().collect();
        self.available = surfaces.iter().copied().collect();
    }

    /// Forget the set (the surfaces are about to be destroyed).
    pub fn clear(&mut self) {
        self.members.clear();
        self.available.clear();
        self.size = Size::default();
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Total surfaces in the current set.
    pub fn set_len(&self) -> usize {
        self.members.len()
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    /// Return a released surface to the free list.
    ///
    /// Ids from an older set, or ids already free, are ignored and `false`
    /// is returned.
    pub fn recycle(&mut self, id: SurfaceId) -> bool {
        if !self.members.contains(&id) {
            debug!(surface_id = id, "Ignoring recycle of surface from a retired set");
            return false;
        }
        if self.available.contains(&id) {
            warn!(surface_id = id, "Surface recycled twice");
            return false;
        }
        self.available.push_back(id);
        true
    }

    /// Take every free id, oldest first.
    pub fn take_available(&mut self) -> Vec<SurfaceId> {
        self.available.drain(..).collect()
    }
}

/// Wraps free surface ids so that dropping the last reference recycles them.
#[derive(Clone)]
pub(crate) struct SurfaceRecycler {
    control: Sender<ControlMessage>,
}

impl SurfaceRecycler {
    pub fn new(control: Sender<ControlMessage>) -> Self {
        Self { control }
    }

    pub fn wrap(&self, id: SurfaceId, size: Size) -> Arc<Surface> {
        let control = self.control.clone();
        Arc::new(Surface::new(
            id,
            size,
            Box::new(move |released| {
                // After teardown the client thread is gone; nothing to return to.
                let _ = control.send(ControlMessage::RecycleSurface(released));
            }),
        ))
    }
}

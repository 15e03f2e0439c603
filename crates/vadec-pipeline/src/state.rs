//! Accelerator state shared by the client thread and the decode thread.
//!
//! ```text
//!  Uninitialized ──initialize──► Idle ──decode──► Decoding ◄──► Flushing
//!        ▲                        ▲                  │  ▲
//!        │                        └──── Resetting ◄──┘  │
//!        └──────── Destroying ◄──── (any) ──────────────┘
//! ```
//!
//! Only the client thread changes [`State`]; the decode thread reads it after
//! every wakeup.  One mutex guards the state, the input queue, the current
//! input, the pending-output queue and the surface pool.  Two condition
//! variables pair with it: `input_ready` and `surfaces_available`.  Every
//! state change that could end a wait notifies both.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use vadec_core::codec_traits::StreamData;
use vadec_core::surface::Surface;
use vadec_core::types::Size;

use crate::surface_pool::SurfacePool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Uninitialized,
    Idle,
    Decoding,
    Flushing,
    Resetting,
    Destroying,
}

impl State {
    /// States in which the decode thread may block waiting for input.
    pub(crate) fn may_wait_for_input(self) -> bool {
        matches!(self, Self::Idle | Self::Decoding)
    }

    /// States in which the decode thread may block waiting for surfaces.
    pub(crate) fn may_wait_for_surfaces(self) -> bool {
        matches!(self, Self::Idle | Self::Decoding | Self::Flushing)
    }

    /// Nothing may be queued or reported any more.
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Destroying)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A mapped bitstream buffer waiting for (or undergoing) decode.
pub(crate) struct InputBuffer {
    pub id: i32,
    pub data: StreamData,
}

/// A decoded frame waiting for a free output picture.
pub(crate) struct PendingOutput {
    pub input_id: i32,
    pub surface: Arc<Surface>,
}

pub(crate) struct Locked {
    pub state: State,
    pub input_buffers: VecDeque<InputBuffer>,
    /// Buffer currently fed to the engine; owned by the decode thread
    /// between `set_stream` and `NeedMoreInput`.
    pub curr_input: Option<InputBuffer>,
    pub pending_outputs: VecDeque<PendingOutput>,
    pub surfaces: SurfacePool,
    /// Set by the decode thread when the engine asked for a new surface set;
    /// cleared when the client assigns the new picture buffers.
    pub awaiting_new_surfaces: bool,
}

pub(crate) struct Shared {
    pub lock: Mutex<Locked>,
    pub input_ready: Condvar,
    pub surfaces_available: Condvar,
}

impl Shared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: Mutex::new(Locked {
                state: State::Uninitialized,
                input_buffers: VecDeque::new(),
                curr_input: None,
                pending_outputs: VecDeque::new(),
                surfaces: SurfacePool::new(Size::default()),
                awaiting_new_surfaces: false,
            }),
            input_ready: Condvar::new(),
            surfaces_available: Condvar::new(),
        })
    }

    /// Wake every waiter so it re-tests the state.
    pub fn wake_all(&self) {
        self.input_ready.notify_all();
        self.surfaces_available.notify_all();
    }
}

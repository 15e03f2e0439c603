//! The decode thread: drives the codec engine against the shared input queue
//! and surface pool.
//!
//! Tasks arrive over a channel from the client thread.  A task runs the
//! decode loop for as long as the state allows, releasing the shared lock
//! only around `BitstreamDecoderEngine::decode` and `flush`.  Everything the
//! client must hear about is posted back as a [`ControlMessage`]; nothing on
//! this thread calls the client directly.

use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use parking_lot::MutexGuard;
use tracing::{debug, error, info, trace, warn};

use vadec_core::codec_traits::{BitstreamDecoderEngine, DecodeResult};
use vadec_core::error::ErrorCode;

use crate::messages::{ControlMessage, DecoderTask};
use crate::state::{Locked, Shared, State};
use crate::surface_pool::SurfaceRecycler;

/// Why the decode loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoopExit {
    /// Flushing and every queued input has been consumed.
    InputDrained,
    /// The engine asked for a new surface set; resumed by the next task.
    SurfaceSetChange,
    /// The state no longer permits decoding, or an error was reported.
    Stopped,
}

pub(crate) struct DecodeWorker {
    shared: Arc<Shared>,
    engine: Box<dyn BitstreamDecoderEngine>,
    control: Sender<ControlMessage>,
    recycler: SurfaceRecycler,
}

impl DecodeWorker {
    pub fn new(
        shared: Arc<Shared>,
        engine: Box<dyn BitstreamDecoderEngine>,
        control: Sender<ControlMessage>,
    ) -> Self {
        let recycler = SurfaceRecycler::new(control.clone());
        Self {
            shared,
            engine,
            control,
            recycler,
        }
    }

    pub fn run(mut self, tasks: Receiver<DecoderTask>) {
        info!("Decode thread started");
        for task in tasks.iter() {
            trace!(?task, "Decode thread task");
            match task {
                DecoderTask::Decode => self.decode_task(),
                DecoderTask::Flush => self.flush_task(),
                DecoderTask::Reset => self.reset_task(),
                DecoderTask::Exit => break,
            }
        }
        // Lent surfaces go back before the client thread destroys the set.
        self.engine.reset();
        info!("Decode thread exiting");
    }

    fn post(&self, message: ControlMessage) {
        if self.control.send(message).is_err() {
            warn!("Client thread is gone; dropping message");
        }
    }

    fn decode_task(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.lock.lock();
        if guard.state != State::Decoding || guard.awaiting_new_surfaces {
            debug!(state = %guard.state, awaiting_new_surfaces = guard.awaiting_new_surfaces, "Skipping decode task");
            return;
        }
        let exit = self.decode_loop(&mut guard);
        debug!(?exit, state = %guard.state, "Decode loop stopped");
    }

    fn flush_task(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.lock.lock();
        if guard.state != State::Flushing || guard.awaiting_new_surfaces {
            debug!(state = %guard.state, "Skipping flush task");
            return;
        }
        if self.decode_loop(&mut guard) != LoopExit::InputDrained {
            return;
        }

        let flushed = MutexGuard::unlocked(&mut guard, || self.engine.flush());
        if !flushed {
            self.post(ControlMessage::Error(
                ErrorCode::PlatformFailure,
                "engine failed to output held frames".into(),
            ));
            return;
        }
        // The engine is ready for a new stream once flushed.
        self.engine.reset();
        drop(guard);
        debug!("Engine flushed");
        self.post(ControlMessage::FinishFlush);
    }

    fn reset_task(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.lock.lock();
        if guard.state != State::Resetting {
            debug!(state = %guard.state, "Skipping reset task");
            return;
        }
        self.engine.reset();
        if let Some(input) = guard.curr_input.take() {
            self.post(ControlMessage::InputBufferRead(input.id));
        }
        drop(guard);
        debug!("Engine reset");
        self.post(ControlMessage::FinishReset);
    }

    fn decode_loop(&mut self, guard: &mut MutexGuard<'_, Locked>) -> LoopExit {
        loop {
            if !self.get_input_buffer_locked(guard) {
                let drained = guard.state == State::Flushing
                    && guard.input_buffers.is_empty()
                    && guard.curr_input.is_none();
                return if drained {
                    LoopExit::InputDrained
                } else {
                    LoopExit::Stopped
                };
            }

            let result = MutexGuard::unlocked(guard, || self.engine.decode());
            trace!(?result, "Engine decode returned");

            match result {
                DecodeResult::NeedNewSurfaceSet { count, size } => {
                    info!(count, size = %size, "Engine needs a new surface set");
                    guard.awaiting_new_surfaces = true;
                    self.post(ControlMessage::InitiateSurfaceSetChange { count, size });
                    return LoopExit::SurfaceSetChange;
                }
                DecodeResult::NeedMoreInput => {
                    if let Some(input) = guard.curr_input.take() {
                        debug!(input_id = input.id, "Bitstream buffer consumed");
                        self.post(ControlMessage::InputBufferRead(input.id));
                    }
                }
                DecodeResult::NeedMoreSurfaces => {
                    if !self.wait_for_surfaces_locked(guard) {
                        return LoopExit::Stopped;
                    }
                    self.feed_surfaces_locked(guard);
                }
                DecodeResult::Error(message) => {
                    error!(%message, "Engine decode error");
                    self.post(ControlMessage::Error(ErrorCode::DecodeError, message));
                    return LoopExit::Stopped;
                }
            }

            if !matches!(guard.state, State::Decoding | State::Flushing) {
                return LoopExit::Stopped;
            }
        }
    }

    /// Make sure the engine has a current input buffer.
    ///
    /// Blocks for input while decoding.  Returns `false` when the state
    /// changed under us, or when flushing and the queue is empty.
    fn get_input_buffer_locked(&mut self, guard: &mut MutexGuard<'_, Locked>) -> bool {
        if guard.curr_input.is_some() {
            return true;
        }

        while guard.input_buffers.is_empty() {
            if !guard.state.may_wait_for_input() {
                return false;
            }
            self.shared.input_ready.wait(guard);
        }
        if !matches!(guard.state, State::Decoding | State::Flushing) {
            return false;
        }

        let Some(input) = guard.input_buffers.pop_front() else {
            return false;
        };
        debug!(input_id = input.id, size = input.data.len(), "Feeding bitstream buffer");
        self.engine.set_stream(input.id, Arc::clone(&input.data));
        guard.curr_input = Some(input);
        true
    }

    /// Block until the pool has a free surface.  Returns `false` if the
    /// state no longer permits waiting.
    fn wait_for_surfaces_locked(&self, guard: &mut MutexGuard<'_, Locked>) -> bool {
        while guard.surfaces.is_empty() {
            if !guard.state.may_wait_for_surfaces() || guard.awaiting_new_surfaces {
                return false;
            }
            self.shared.surfaces_available.wait(guard);
        }
        guard.state.may_wait_for_surfaces()
    }

    /// Lend every free surface to the engine.
    fn feed_surfaces_locked(&mut self, guard: &mut MutexGuard<'_, Locked>) {
        let size = guard.surfaces.size();
        for id in guard.surfaces.take_available() {
            trace!(surface_id = id, "Lending surface to engine");
            self.engine.reuse_surface(self.recycler.wrap(id, size));
        }
    }
}

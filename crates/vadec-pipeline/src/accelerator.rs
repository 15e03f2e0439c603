//! VA-API video decode accelerator.
//!
//! # Threads
//!
//! ```text
//!  caller ──ControlMessage──► client thread ──DecoderTask──► decode thread
//!                               │  ▲                            │
//!                               │  └──── ControlMessage ────────┘
//!                               ▼        (SurfaceReady, InputBufferRead,
//!                         DecodeClient    InitiateSurfaceSetChange, ...)
//! ```
//!
//! The public handle only posts messages.  The client thread owns every
//! state transition, the output picture cache and all client callbacks.  The
//! decode thread owns the engine.  Both meet at [`Shared`](crate::state::Shared).
//!
//! # Surface set changes
//!
//! When the engine needs a new set, the old surfaces and pictures are torn
//! down only once every surface is back in the pool and no output is pending.
//! The check is re-run after each output drain, surface recycle and reset
//! completion; nothing polls.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info, instrument, trace, warn};

use vadec_core::client::{DecodeClient, RenderContext};
use vadec_core::codec_traits::{BitstreamDecoderEngine, OutputCallback};
use vadec_core::error::{DecoderError, ErrorCode, Result};
use vadec_core::shm::BitstreamBuffer;
use vadec_core::surface::Surface;
use vadec_core::types::{Picture, PictureBuffer, Size, TextureTarget};
use vadec_vaapi::context::{ErrorReporter, VaapiContext};
use vadec_vaapi::driver::VaDriver;

use crate::config::AcceleratorConfig;
use crate::decode_thread::DecodeWorker;
use crate::messages::{ControlMessage, DecoderTask};
use crate::metrics::{DecoderMetrics, MetricsSnapshot, enforce_metrics_invariants};
use crate::picture::OutputPictureCache;
use crate::state::{InputBuffer, PendingOutput, Shared, State};

/// Builds the codec engine once the hardware session exists.
///
/// The engine must deliver finished frames through the given callback.
pub type EngineFactory = Box<
    dyn FnOnce(Arc<VaapiContext>, OutputCallback) -> Result<Box<dyn BitstreamDecoderEngine>>
        + Send,
>;

/// Everything the accelerator needs from its surroundings.
pub struct Collaborators {
    pub driver: Box<dyn VaDriver>,
    pub client: Box<dyn DecodeClient>,
    pub render: Box<dyn RenderContext>,
    pub engine_factory: EngineFactory,
}

/// Handle to a two-thread VA-API decoder.
///
/// Commands are asynchronous: they return once posted, and their outcome
/// reaches the [`DecodeClient`].  Dropping the handle destroys the decoder.
pub struct VaapiVideoDecodeAccelerator {
    config: AcceleratorConfig,
    metrics: Arc<DecoderMetrics>,
    shared: Arc<Shared>,
    pending: Option<Collaborators>,
    control_tx: Option<Sender<ControlMessage>>,
    control_thread: Option<JoinHandle<Result<()>>>,
}

impl VaapiVideoDecodeAccelerator {
    pub fn new(config: AcceleratorConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            metrics: DecoderMetrics::new(),
            shared: Shared::new(),
            pending: Some(collaborators),
            control_tx: None,
            control_thread: None,
        }
    }

    /// Open the hardware session, build the engine and start both threads.
    ///
    /// On failure the accelerator stays `Uninitialized` and cannot be
    /// initialized again.
    #[instrument(skip_all, fields(profile = %self.config.profile))]
    pub fn initialize(&mut self) -> Result<()> {
        self.config.validate()?;
        let collaborators = self.pending.take().ok_or_else(|| {
            DecoderError::IllegalState("initialize() may only be called once".into())
        })?;

        let metrics = Arc::clone(&self.metrics);
        let reporter: ErrorReporter =
            Arc::new(move |_err: &DecoderError| DecoderMetrics::bump(&metrics.va_errors));
        let hardware = Arc::new(VaapiContext::initialize(
            collaborators.driver,
            self.config.profile,
            &self.config.hardware,
            Some(reporter),
        )?);

        let (control_tx, control_rx) = unbounded();
        let (task_tx, task_rx) = unbounded();

        let output_tx = control_tx.clone();
        let on_output: OutputCallback = Box::new(move |input_id: i32, surface: Arc<Surface>| {
            let _ = output_tx.send(ControlMessage::SurfaceReady { input_id, surface });
        });
        let engine = (collaborators.engine_factory)(Arc::clone(&hardware), on_output)?;

        let worker = DecodeWorker::new(Arc::clone(&self.shared), engine, control_tx.clone());
        let decode_thread = thread::Builder::new()
            .name(self.config.decode_thread_name.clone())
            .spawn(move || worker.run(task_rx))
            .map_err(|source| DecoderError::ThreadSpawn {
                name: self.config.decode_thread_name.clone(),
                source,
            })?;

        self.shared.lock.lock().state = State::Idle;

        let control = ControlLoop {
            shared: Arc::clone(&self.shared),
            hardware,
            client: Some(collaborators.client),
            render: collaborators.render,
            pictures: OutputPictureCache::new(),
            requested_num_pics: 0,
            requested_size: Size::default(),
            awaiting_surface_recycle: false,
            finish_flush_pending: false,
            finish_reset_pending: false,
            tasks: task_tx.clone(),
            decode_thread: Some(decode_thread),
            metrics: Arc::clone(&self.metrics),
            strict_invariants: self.config.strict_invariants,
        };
        // A failed spawn drops the control loop, detaching the decode thread.
        let spawned = thread::Builder::new()
            .name(self.config.client_thread_name.clone())
            .spawn(move || control.run(control_rx));
        let control_thread = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                self.shared.lock.lock().state = State::Uninitialized;
                self.shared.wake_all();
                let _ = task_tx.send(DecoderTask::Exit);
                return Err(DecoderError::ThreadSpawn {
                    name: self.config.client_thread_name.clone(),
                    source,
                });
            }
        };

        self.control_tx = Some(control_tx);
        self.control_thread = Some(control_thread);
        info!("Decode accelerator initialized");
        Ok(())
    }

    fn post(&self, message: ControlMessage) -> Result<()> {
        let tx = self.control_tx.as_ref().ok_or(DecoderError::NotInitialized)?;
        tx.send(message).map_err(|_| DecoderError::ChannelClosed)
    }

    /// Queue a bitstream buffer.  The client hears back through
    /// `notify_end_of_bitstream_buffer` exactly once per accepted buffer.
    pub fn decode(&self, buffer: BitstreamBuffer) -> Result<()> {
        self.post(ControlMessage::Decode(buffer))
    }

    /// Answer a `provide_picture_buffers` request.
    pub fn assign_picture_buffers(&self, buffers: Vec<PictureBuffer>) -> Result<()> {
        self.post(ControlMessage::AssignPictureBuffers(buffers))
    }

    /// The client finished displaying `picture_buffer_id`.
    pub fn reuse_picture_buffer(&self, picture_buffer_id: i32) -> Result<()> {
        self.post(ControlMessage::ReusePictureBuffer(picture_buffer_id))
    }

    pub fn flush(&self) -> Result<()> {
        self.post(ControlMessage::Flush)
    }

    pub fn reset(&self) -> Result<()> {
        self.post(ControlMessage::Reset)
    }

    /// Stop both threads and release every hardware resource.
    ///
    /// Blocks until teardown is complete, except when called from a client
    /// callback, where teardown finishes after the callback returns.
    pub fn destroy(mut self) -> Result<()> {
        self.shutdown()
    }

    pub fn state(&self) -> State {
        self.shared.lock.lock().state
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(tx) = self.control_tx.take() else {
            return Ok(());
        };
        let _ = tx.send(ControlMessage::Destroy);
        drop(tx);

        let Some(handle) = self.control_thread.take() else {
            return Ok(());
        };
        if handle.thread().id() == thread::current().id() {
            debug!("destroy() called from a client callback; not joining");
            return Ok(());
        }
        handle
            .join()
            .map_err(|_| DecoderError::Platform("client thread panicked".into()))?
    }
}

impl Drop for VaapiVideoDecodeAccelerator {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "Decoder teardown failed");
        }
    }
}

// ─── Client thread ──────────────────────────────────────────────────────────

struct ControlLoop {
    shared: Arc<Shared>,
    hardware: Arc<VaapiContext>,
    /// `None` once an error was reported; nothing reaches the client after.
    client: Option<Box<dyn DecodeClient>>,
    render: Box<dyn RenderContext>,
    pictures: OutputPictureCache,
    /// Picture count and size of an outstanding `provide_picture_buffers`.
    requested_num_pics: usize,
    requested_size: Size,
    awaiting_surface_recycle: bool,
    finish_flush_pending: bool,
    finish_reset_pending: bool,
    tasks: Sender<DecoderTask>,
    decode_thread: Option<JoinHandle<()>>,
    metrics: Arc<DecoderMetrics>,
    strict_invariants: bool,
}

impl ControlLoop {
    fn run(mut self, messages: Receiver<ControlMessage>) -> Result<()> {
        info!("Client thread started");
        while let Ok(message) = messages.recv() {
            trace!(?message, "Client thread message");
            if self.handle(message).is_break() {
                break;
            }
        }
        self.destroy()
    }

    fn handle(&mut self, message: ControlMessage) -> ControlFlow<()> {
        match message {
            ControlMessage::Decode(buffer) => self.on_decode(buffer),
            ControlMessage::AssignPictureBuffers(buffers) => self.on_assign_picture_buffers(buffers),
            ControlMessage::ReusePictureBuffer(id) => self.on_reuse_picture_buffer(id),
            ControlMessage::Flush => self.on_flush(),
            ControlMessage::Reset => self.on_reset(),
            ControlMessage::Destroy => return ControlFlow::Break(()),
            ControlMessage::SurfaceReady { input_id, surface } => {
                self.on_surface_ready(input_id, surface)
            }
            ControlMessage::RecycleSurface(id) => self.on_recycle_surface(id),
            ControlMessage::InitiateSurfaceSetChange { count, size } => {
                self.on_initiate_surface_set_change(count, size)
            }
            ControlMessage::InputBufferRead(id) => self.notify_input_buffer_read(id),
            ControlMessage::FinishFlush => self.finish_flush(),
            ControlMessage::FinishReset => self.finish_reset(),
            ControlMessage::Error(code, message) => self.notify_error(code, &message),
        }
        ControlFlow::Continue(())
    }

    fn post_task(&mut self, task: DecoderTask) {
        if self.tasks.send(task).is_err() {
            self.notify_error(ErrorCode::PlatformFailure, "decode thread is gone");
        }
    }

    fn state(&self) -> State {
        self.shared.lock.lock().state
    }

    // ── Commands ──────────────────────────────────────────────────────────

    fn on_decode(&mut self, buffer: BitstreamBuffer) {
        let id = buffer.id();
        if id < 0 {
            return self.report(DecoderError::InvalidArgument(format!(
                "invalid bitstream buffer id {id}"
            )));
        }
        match self.state() {
            state if state.is_terminal() || self.client.is_none() => {
                warn!(input_id = id, %state, "Dropping bitstream buffer");
                return;
            }
            State::Flushing => {
                return self.notify_error(
                    ErrorCode::PlatformFailure,
                    &format!("bitstream buffer {id} submitted while flushing"),
                );
            }
            _ => {}
        }

        DecoderMetrics::bump(&self.metrics.buffers_received);
        if buffer.size() == 0 {
            debug!(input_id = id, "Empty bitstream buffer");
            return self.notify_input_buffer_read(id);
        }
        let data = match buffer.map() {
            Ok(mapped) => Arc::new(mapped),
            Err(e) => return self.report(e),
        };

        let mut guard = self.shared.lock.lock();
        debug!(input_id = id, size = data.len(), queued = guard.input_buffers.len(), "Queued bitstream buffer");
        guard.input_buffers.push_back(InputBuffer { id, data });
        self.shared.input_ready.notify_one();

        if guard.state == State::Idle {
            guard.state = State::Decoding;
            drop(guard);
            self.post_task(DecoderTask::Decode);
        }
    }

    fn on_assign_picture_buffers(&mut self, buffers: Vec<PictureBuffer>) {
        if self.client.is_none() || self.state().is_terminal() {
            warn!(count = buffers.len(), "Dropping picture buffer assignment");
            return;
        }
        let requested = self.requested_num_pics;
        if requested == 0 || !self.pictures.is_empty() {
            return self.report(DecoderError::InvalidArgument(
                "picture buffers assigned without a pending request".into(),
            ));
        }
        if buffers.len() != requested {
            return self.report(DecoderError::InvalidArgument(format!(
                "got {} picture buffers, requested {requested}",
                buffers.len()
            )));
        }

        let size = self.requested_size;
        let surfaces = match self.hardware.create_surfaces(size, requested) {
            Ok(surfaces) => surfaces,
            Err(e) => return self.notify_error(ErrorCode::PlatformFailure, &e.to_string()),
        };
        if let Err(e) = self.pictures.create_batch(&self.hardware, &buffers, size) {
            self.hardware.destroy_surfaces();
            return self.report(e);
        }
        self.requested_num_pics = 0;
        info!(count = requested, size = %size, "Picture buffers assigned");

        let mut guard = self.shared.lock.lock();
        guard.surfaces.install(size, &surfaces);
        guard.awaiting_new_surfaces = false;
        self.shared.surfaces_available.notify_all();
        let task = match guard.state {
            State::Idle | State::Decoding => {
                guard.state = State::Decoding;
                Some(DecoderTask::Decode)
            }
            State::Flushing => Some(DecoderTask::Flush),
            _ => None,
        };
        drop(guard);
        if let Some(task) = task {
            self.post_task(task);
        }
    }

    fn on_reuse_picture_buffer(&mut self, id: i32) {
        if self.client.is_none() || self.state().is_terminal() {
            return;
        }
        if !self.pictures.push_free(id) {
            debug!(picture_buffer_id = id, "Ignoring reuse of picture buffer outside the current set");
            return;
        }
        trace!(picture_buffer_id = id, free = self.pictures.free_len(), "Picture buffer free");
        self.try_output_surface();
    }

    fn on_flush(&mut self) {
        if self.client.is_none() {
            return;
        }
        let mut guard = self.shared.lock.lock();
        match guard.state {
            State::Idle | State::Decoding => {
                guard.state = State::Flushing;
                drop(guard);
                info!("Flushing");
                self.shared.wake_all();
                self.post_task(DecoderTask::Flush);
            }
            state => {
                drop(guard);
                self.notify_error(
                    ErrorCode::PlatformFailure,
                    &format!("flush requested in state {state}"),
                );
            }
        }
    }

    fn on_reset(&mut self) {
        if self.client.is_none() {
            return;
        }
        let mut guard = self.shared.lock.lock();
        if guard.state.is_terminal() {
            return;
        }
        info!(from = %guard.state, "Resetting");
        guard.state = State::Resetting;
        let returned: Vec<i32> = guard.input_buffers.drain(..).map(|input| input.id).collect();
        drop(guard);

        self.finish_flush_pending = false;
        self.shared.wake_all();
        for id in returned {
            self.notify_input_buffer_read(id);
        }
        self.post_task(DecoderTask::Reset);
    }

    // ── Decode thread events ──────────────────────────────────────────────

    fn on_surface_ready(&mut self, input_id: i32, surface: Arc<Surface>) {
        let mut guard = self.shared.lock.lock();
        if guard.state == State::Resetting || guard.state.is_terminal() {
            debug!(input_id, surface_id = surface.id(), state = %guard.state, "Dropping decoded frame");
            return;
        }
        DecoderMetrics::bump(&self.metrics.frames_decoded);
        trace!(input_id, surface_id = surface.id(), "Frame decoded");
        guard.pending_outputs.push_back(PendingOutput { input_id, surface });
        drop(guard);
        self.try_output_surface();
    }

    fn on_recycle_surface(&mut self, id: u32) {
        let mut guard = self.shared.lock.lock();
        if guard.state.is_terminal() {
            return;
        }
        if guard.surfaces.recycle(id) {
            trace!(surface_id = id, available = guard.surfaces.available_len(), "Surface recycled");
            self.shared.surfaces_available.notify_one();
        }
        drop(guard);
        self.try_finish_surface_set_change();
    }

    fn on_initiate_surface_set_change(&mut self, count: usize, size: Size) {
        if self.client.is_none() || self.state().is_terminal() {
            return;
        }
        if count == 0 || size.is_empty() {
            return self.notify_error(
                ErrorCode::DecodeError,
                &format!("engine requested an empty surface set ({count} x {size})"),
            );
        }
        info!(count, size = %size, "Surface set change initiated");
        self.requested_num_pics = count;
        self.requested_size = size;
        self.awaiting_surface_recycle = true;
        DecoderMetrics::bump(&self.metrics.surface_set_changes);
        self.try_finish_surface_set_change();
    }

    fn notify_input_buffer_read(&mut self, id: i32) {
        let Some(client) = self.client.as_deref_mut() else {
            return;
        };
        trace!(input_id = id, "Returning bitstream buffer");
        DecoderMetrics::bump(&self.metrics.buffers_returned);
        client.notify_end_of_bitstream_buffer(id);
    }

    /// Pair pending outputs with free pictures, oldest first on both sides.
    fn try_output_surface(&mut self) {
        while self.client.is_some() && self.pictures.has_free() {
            let output = {
                let mut guard = self.shared.lock.lock();
                if guard.state == State::Resetting || guard.state.is_terminal() {
                    return;
                }
                guard.pending_outputs.pop_front()
            };
            let Some(PendingOutput { input_id, surface }) = output else {
                break;
            };
            let Some(picture) = self.pictures.pop_free() else {
                break;
            };
            let picture_buffer_id = picture.picture_buffer_id;
            let uploaded = picture.upload(&self.hardware, self.render.as_mut(), &surface);
            drop(surface);
            if let Err(e) = uploaded {
                return self.notify_error(ErrorCode::PlatformFailure, &e.to_string());
            }

            DecoderMetrics::bump(&self.metrics.pictures_ready);
            debug!(picture_buffer_id, input_id, "Picture ready");
            if let Some(client) = self.client.as_deref_mut() {
                client.picture_ready(Picture {
                    picture_buffer_id,
                    bitstream_buffer_id: input_id,
                });
            }
        }

        if self.finish_flush_pending {
            self.finish_flush();
        }
        self.try_finish_surface_set_change();
    }

    /// Tear down the old surface set and request the new one, once nothing
    /// references the old surfaces.
    fn try_finish_surface_set_change(&mut self) {
        if !self.awaiting_surface_recycle || self.client.is_none() {
            return;
        }
        {
            let mut guard = self.shared.lock.lock();
            let pool = &guard.surfaces;
            if !guard.pending_outputs.is_empty() || pool.available_len() != pool.set_len() {
                trace!(
                    pending_outputs = guard.pending_outputs.len(),
                    available = pool.available_len(),
                    total = pool.set_len(),
                    "Surface set change waiting for surfaces"
                );
                return;
            }
            guard.surfaces.clear();
        }

        self.hardware.destroy_surfaces();
        for id in self.pictures.destroy_all(&self.hardware) {
            DecoderMetrics::bump(&self.metrics.pictures_dismissed);
            debug!(picture_buffer_id = id, "Dismissing picture buffer");
            if let Some(client) = self.client.as_deref_mut() {
                client.dismiss_picture_buffer(id);
            }
        }
        self.awaiting_surface_recycle = false;

        let (count, size) = (self.requested_num_pics, self.requested_size);
        info!(count, size = %size, "Requesting picture buffers");
        if let Some(client) = self.client.as_deref_mut() {
            client.provide_picture_buffers(count, size, TextureTarget::Texture2D);
        }

        if self.finish_reset_pending {
            self.finish_reset();
        }
    }

    fn finish_flush(&mut self) {
        let mut guard = self.shared.lock.lock();
        if guard.state != State::Flushing {
            debug!(state = %guard.state, "Flush no longer in progress");
            self.finish_flush_pending = false;
            return;
        }
        if !guard.pending_outputs.is_empty() {
            debug!(pending_outputs = guard.pending_outputs.len(), "Deferring flush completion");
            self.finish_flush_pending = true;
            return;
        }
        guard.state = State::Idle;
        drop(guard);

        self.finish_flush_pending = false;
        DecoderMetrics::bump(&self.metrics.flushes_completed);
        info!("Flush done");
        if let Some(client) = self.client.as_deref_mut() {
            client.notify_flush_done();
        }
    }

    fn finish_reset(&mut self) {
        let discarded: VecDeque<PendingOutput> = {
            let mut guard = self.shared.lock.lock();
            if guard.state != State::Resetting {
                debug!(state = %guard.state, "Reset no longer in progress");
                return;
            }
            std::mem::take(&mut guard.pending_outputs)
        };
        // Discarded frames recycle their surfaces.
        drop(discarded);

        if self.awaiting_surface_recycle {
            debug!("Reset waits for the surface set change");
            self.finish_reset_pending = true;
            return self.try_finish_surface_set_change();
        }
        self.finish_reset_pending = false;

        let mut guard = self.shared.lock.lock();
        let resume = !guard.input_buffers.is_empty();
        guard.state = if resume { State::Decoding } else { State::Idle };
        drop(guard);

        DecoderMetrics::bump(&self.metrics.resets_completed);
        info!(resume, "Reset done");
        if let Some(client) = self.client.as_deref_mut() {
            client.notify_reset_done();
        }
        if resume {
            self.post_task(DecoderTask::Decode);
        }
    }

    // ── Errors and teardown ───────────────────────────────────────────────

    fn report(&mut self, err: DecoderError) {
        self.notify_error(err.client_code(), &err.to_string());
    }

    /// Report a fatal error once and stop decoding for good.
    fn notify_error(&mut self, code: ErrorCode, message: &str) {
        error!(error = %code, %message, "Decoder error");
        let Some(mut client) = self.client.take() else {
            return;
        };
        DecoderMetrics::bump(&self.metrics.client_errors);
        self.cleanup();
        client.notify_error(code);
    }

    #[instrument(skip_all)]
    fn cleanup(&mut self) {
        {
            let mut guard = self.shared.lock.lock();
            if guard.state == State::Uninitialized && self.decode_thread.is_none() {
                return;
            }
            info!(from = %guard.state, "Tearing down decoder");
            guard.state = State::Destroying;
        }
        self.shared.wake_all();

        let _ = self.tasks.send(DecoderTask::Exit);
        if let Some(handle) = self.decode_thread.take()
            && handle.join().is_err()
        {
            error!("Decode thread panicked");
        }

        let (inputs, outputs) = {
            let mut guard = self.shared.lock.lock();
            guard.state = State::Uninitialized;
            guard.surfaces.clear();
            guard.awaiting_new_surfaces = false;
            (
                std::mem::take(&mut guard.input_buffers),
                std::mem::take(&mut guard.pending_outputs),
            )
        };
        drop(inputs);
        drop(outputs);

        self.pictures.destroy_all(&self.hardware);
        self.hardware.destroy_surfaces();
        self.requested_num_pics = 0;
        self.awaiting_surface_recycle = false;
        self.finish_flush_pending = false;
        self.finish_reset_pending = false;
    }

    fn destroy(&mut self) -> Result<()> {
        self.client = None;
        self.cleanup();
        self.metrics.report();
        info!("Decoder destroyed");
        enforce_metrics_invariants(&self.metrics, self.strict_invariants)
    }
}

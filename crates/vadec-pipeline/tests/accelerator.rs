#![cfg(target_os = "linux")]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use vadec_core::client::{DecodeClient, RenderContext};
use vadec_core::codec_traits::{BitstreamDecoderEngine, DecodeResult, OutputCallback, StreamData};
use vadec_core::error::{DecoderError, ErrorCode, Result};
use vadec_core::shm::{BitstreamBuffer, SharedMemoryHandle};
use vadec_core::surface::Surface;
use vadec_core::types::{Picture, PictureBuffer, Size, TextureTarget, VideoCodecProfile};
use vadec_pipeline::synthetic::{self, SyntheticEngine, SyntheticEngineConfig};
use vadec_pipeline::{
    AcceleratorConfig, Collaborators, EngineFactory, State, VaapiVideoDecodeAccelerator,
};
use vadec_vaapi::driver::VaProfile;
use vadec_vaapi::memory_driver::{MemoryDriver, MemoryDriverConfig, MemoryDriverProbe, frame_color};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

// ─── Recording client ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
enum ClientEvent {
    ProvidePictureBuffers { count: usize, size: Size },
    Dismiss(i32),
    PictureReady(Picture),
    EndOfBitstreamBuffer(i32),
    FlushDone,
    ResetDone,
    Error(ErrorCode),
}

struct RecordingClient(Sender<ClientEvent>);

impl RecordingClient {
    fn send(&self, event: ClientEvent) {
        let _ = self.0.send(event);
    }
}

impl DecodeClient for RecordingClient {
    fn provide_picture_buffers(&mut self, count: usize, size: Size, target: TextureTarget) {
        assert_eq!(target, TextureTarget::Texture2D);
        self.send(ClientEvent::ProvidePictureBuffers { count, size });
    }

    fn dismiss_picture_buffer(&mut self, picture_buffer_id: i32) {
        self.send(ClientEvent::Dismiss(picture_buffer_id));
    }

    fn picture_ready(&mut self, picture: Picture) {
        self.send(ClientEvent::PictureReady(picture));
    }

    fn notify_end_of_bitstream_buffer(&mut self, bitstream_buffer_id: i32) {
        self.send(ClientEvent::EndOfBitstreamBuffer(bitstream_buffer_id));
    }

    fn notify_flush_done(&mut self) {
        self.send(ClientEvent::FlushDone);
    }

    fn notify_reset_done(&mut self) {
        self.send(ClientEvent::ResetDone);
    }

    fn notify_error(&mut self, error: ErrorCode) {
        self.send(ClientEvent::Error(error));
    }
}

/// `(texture_id, size, first pixel)` per upload.
type Uploads = Arc<Mutex<Vec<(u32, Size, [u8; 4])>>>;

struct RecordingRender(Uploads);

impl RenderContext for RecordingRender {
    fn make_context_current(&mut self) -> bool {
        true
    }

    fn upload_rgbx(&mut self, texture_id: u32, size: Size, pitch: usize, pixels: &[u8]) -> Result<()> {
        assert_eq!(pitch, size.width as usize * 4);
        let mut first = [0u8; 4];
        first.copy_from_slice(&pixels[..4]);
        self.0.lock().push((texture_id, size, first));
        Ok(())
    }
}

// ─── Scripted engine ────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    /// Returned by the first `decode()` call.
    surface_set: Option<(usize, Size)>,
    /// Keep every decoded surface instead of outputting it.
    hold_surfaces: bool,
    fail_on: Option<i32>,
    /// Announces each input id as its decode starts.
    entered: Option<Sender<i32>>,
    /// Each new input blocks here until a token arrives or the sender drops.
    gate: Option<Receiver<()>>,
}

struct ScriptedEngine {
    script: Script,
    output: OutputCallback,
    stream: Option<i32>,
    gate_passed: bool,
    free: VecDeque<Arc<Surface>>,
    held: Vec<Arc<Surface>>,
}

impl BitstreamDecoderEngine for ScriptedEngine {
    fn set_stream(&mut self, input_id: i32, _data: StreamData) {
        self.stream = Some(input_id);
        self.gate_passed = false;
    }

    fn reuse_surface(&mut self, surface: Arc<Surface>) {
        self.free.push_back(surface);
    }

    fn decode(&mut self) -> DecodeResult {
        if let Some((count, size)) = self.script.surface_set.take() {
            return DecodeResult::NeedNewSurfaceSet { count, size };
        }
        let Some(input_id) = self.stream else {
            return DecodeResult::NeedMoreInput;
        };
        if !self.gate_passed {
            self.gate_passed = true;
            if let Some(entered) = &self.script.entered {
                let _ = entered.send(input_id);
            }
            if let Some(gate) = &self.script.gate {
                let _ = gate.recv();
            }
        }
        if self.script.fail_on == Some(input_id) {
            return DecodeResult::Error(format!("corrupt slice in buffer {input_id}"));
        }
        let Some(surface) = self.free.pop_front() else {
            return DecodeResult::NeedMoreSurfaces;
        };
        if self.script.hold_surfaces {
            self.held.push(surface);
        } else {
            (self.output)(input_id, surface);
        }
        self.stream = None;
        DecodeResult::NeedMoreInput
    }

    fn flush(&mut self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.stream = None;
        self.free.clear();
        self.held.clear();
    }
}

fn scripted(script: Script) -> EngineFactory {
    Box::new(move |_hw, output| {
        Ok(Box::new(ScriptedEngine {
            script,
            output,
            stream: None,
            gate_passed: false,
            free: VecDeque::new(),
            held: Vec::new(),
        }) as Box<dyn BitstreamDecoderEngine>)
    })
}

fn synthetic_engine(config: SyntheticEngineConfig) -> EngineFactory {
    Box::new(move |hw, output| {
        Ok(Box::new(SyntheticEngine::new(hw, output, config)) as Box<dyn BitstreamDecoderEngine>)
    })
}

// ─── Harness ────────────────────────────────────────────────────────────────

struct Harness {
    vda: Option<VaapiVideoDecodeAccelerator>,
    events: Receiver<ClientEvent>,
    probe: MemoryDriverProbe,
    uploads: Uploads,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn build(driver: MemoryDriver, engine_factory: EngineFactory) -> Harness {
    init_tracing();
    let probe = driver.probe();
    let (tx, events) = unbounded();
    let uploads = Uploads::default();
    let vda = VaapiVideoDecodeAccelerator::new(
        AcceleratorConfig {
            strict_invariants: true,
            ..AcceleratorConfig::default()
        },
        Collaborators {
            driver: Box::new(driver),
            client: Box::new(RecordingClient(tx)),
            render: Box::new(RecordingRender(Arc::clone(&uploads))),
            engine_factory,
        },
    );
    Harness {
        vda: Some(vda),
        events,
        probe,
        uploads,
    }
}

fn start(engine_factory: EngineFactory) -> Harness {
    let mut harness = build(MemoryDriver::new(), engine_factory);
    harness.vda_mut().initialize().expect("initialize");
    harness
}

fn buffer(id: i32, bytes: &[u8]) -> BitstreamBuffer {
    BitstreamBuffer::from_bytes(id, bytes).expect("memfd")
}

fn picture_buffers(ids: std::ops::Range<i32>) -> Vec<PictureBuffer> {
    ids.map(|id| PictureBuffer::new(id, 1000 + id as u32)).collect()
}

impl Harness {
    fn vda(&self) -> &VaapiVideoDecodeAccelerator {
        self.vda.as_ref().expect("accelerator alive")
    }

    fn vda_mut(&mut self) -> &mut VaapiVideoDecodeAccelerator {
        self.vda.as_mut().expect("accelerator alive")
    }

    fn decode(&self, id: i32, bytes: &[u8]) {
        self.vda().decode(buffer(id, bytes)).expect("decode posted");
    }

    fn next(&self) -> ClientEvent {
        self.events
            .recv_timeout(TIMEOUT)
            .expect("client event before timeout")
    }

    fn expect_quiet(&self) {
        if let Ok(event) = self.events.recv_timeout(QUIET) {
            panic!("unexpected client event {event:?}");
        }
    }

    /// Collect events up to and including the first one matching `done`.
    ///
    /// With `auto`, picture buffer requests are answered and every ready
    /// picture is reused immediately.
    fn pump_until(&self, auto: bool, done: impl Fn(&ClientEvent) -> bool) -> Vec<ClientEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next();
            if auto {
                match &event {
                    ClientEvent::ProvidePictureBuffers { count, .. } => self
                        .vda()
                        .assign_picture_buffers(picture_buffers(0..*count as i32))
                        .expect("assign posted"),
                    ClientEvent::PictureReady(picture) => self
                        .vda()
                        .reuse_picture_buffer(picture.picture_buffer_id)
                        .expect("reuse posted"),
                    _ => {}
                }
            }
            let stop = done(&event);
            seen.push(event);
            if stop {
                return seen;
            }
        }
    }

    fn destroy(&mut self) -> Result<()> {
        self.vda.take().expect("accelerator alive").destroy()
    }

    fn assert_released(&self) {
        assert_eq!(self.probe.live_surfaces(), 0);
        assert_eq!(self.probe.live_images(), 0);
        assert_eq!(self.probe.live_buffers(), 0);
        assert!(self.probe.is_terminated());
    }
}

fn ready_inputs(events: &[ClientEvent]) -> Vec<i32> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::PictureReady(p) => Some(p.bitstream_buffer_id),
            _ => None,
        })
        .collect()
}

fn stream(size: Size, pictures: u32, frames: &[&[u8]]) -> Vec<u8> {
    let mut bytes = synthetic::sequence_header(size, pictures);
    for payload in frames {
        bytes.extend(synthetic::frame(payload));
    }
    bytes
}

fn frames(payloads: &[&[u8]]) -> Vec<u8> {
    payloads.iter().flat_map(|p| synthetic::frame(p)).collect()
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[test]
fn first_picture_follows_surface_set_request() {
    let mut h = start(synthetic_engine(SyntheticEngineConfig {
        reference_frames: 1,
        display_delay: 0,
    }));
    let size = Size::new(640, 480);
    h.decode(1, &stream(size, 4, &[b"frame-1"]));

    assert_eq!(h.next(), ClientEvent::ProvidePictureBuffers { count: 4, size });
    assert_eq!(h.vda().state(), State::Decoding);
    h.vda().assign_picture_buffers(picture_buffers(0..4)).unwrap();

    assert_eq!(
        h.next(),
        ClientEvent::PictureReady(Picture {
            picture_buffer_id: 0,
            bitstream_buffer_id: 1,
        })
    );
    assert_eq!(h.next(), ClientEvent::EndOfBitstreamBuffer(1));
    assert_eq!(*h.uploads.lock(), vec![(1000, size, frame_color(b"frame-1"))]);
    assert_eq!(h.probe.live_surfaces(), 4);
    assert_eq!(h.probe.live_images(), 4);

    let metrics = h.vda().metrics();
    assert_eq!(metrics.buffers_received, 1);
    assert_eq!(metrics.buffers_returned, 1);
    assert_eq!(metrics.pictures_ready, 1);
    assert_eq!(metrics.surface_set_changes, 1);

    h.destroy().expect("clean teardown");
    h.assert_released();
}

#[test]
fn reset_returns_queued_buffers_before_reset_done() {
    let (entered_tx, entered) = unbounded();
    let (gate_tx, gate) = unbounded();
    let mut h = start(scripted(Script {
        surface_set: Some((2, Size::new(64, 64))),
        entered: Some(entered_tx),
        gate: Some(gate),
        ..Script::default()
    }));

    h.decode(1, b"first");
    assert!(matches!(h.next(), ClientEvent::ProvidePictureBuffers { count: 2, .. }));
    h.vda().assign_picture_buffers(picture_buffers(0..2)).unwrap();
    // The decode thread is now blocked inside the engine on buffer 1.
    assert_eq!(entered.recv_timeout(TIMEOUT), Ok(1));

    for id in 2..=4 {
        h.decode(id, b"queued");
    }
    h.vda().reset().unwrap();
    let mut before_done = Vec::new();
    for _ in 0..3 {
        before_done.push(h.next());
    }
    assert_eq!(
        before_done,
        vec![
            ClientEvent::EndOfBitstreamBuffer(2),
            ClientEvent::EndOfBitstreamBuffer(3),
            ClientEvent::EndOfBitstreamBuffer(4),
        ]
    );

    drop(gate_tx);
    let events = h.pump_until(false, |e| *e == ClientEvent::ResetDone);
    assert_eq!(
        events,
        vec![ClientEvent::EndOfBitstreamBuffer(1), ClientEvent::ResetDone]
    );
    assert_eq!(h.vda().state(), State::Idle);

    // Nothing stale is decoded after the reset.
    h.expect_quiet();
    assert!(entered.try_recv().is_err());

    h.destroy().unwrap();
    h.assert_released();
}

#[test]
fn flush_completion_waits_for_pending_outputs() {
    let mut h = start(scripted(Script {
        surface_set: Some((2, Size::new(32, 32))),
        ..Script::default()
    }));

    h.decode(1, b"a");
    assert!(matches!(h.next(), ClientEvent::ProvidePictureBuffers { count: 2, .. }));
    h.vda().assign_picture_buffers(picture_buffers(0..2)).unwrap();
    for id in 2..=4 {
        h.decode(id, b"frame");
    }
    let events = h.pump_until(false, |e| *e == ClientEvent::EndOfBitstreamBuffer(4));
    assert_eq!(ready_inputs(&events), vec![1, 2]);

    // Frames 3 and 4 wait for free pictures.
    h.vda().flush().unwrap();
    h.expect_quiet();
    assert_eq!(h.vda().state(), State::Flushing);

    h.vda().reuse_picture_buffer(0).unwrap();
    assert_eq!(
        h.next(),
        ClientEvent::PictureReady(Picture {
            picture_buffer_id: 0,
            bitstream_buffer_id: 3,
        })
    );
    h.expect_quiet();

    h.vda().reuse_picture_buffer(1).unwrap();
    assert_eq!(
        h.next(),
        ClientEvent::PictureReady(Picture {
            picture_buffer_id: 1,
            bitstream_buffer_id: 4,
        })
    );
    assert_eq!(h.next(), ClientEvent::FlushDone);
    assert_eq!(h.vda().state(), State::Idle);
    assert_eq!(h.vda().metrics().flushes_completed, 1);

    h.destroy().unwrap();
    h.assert_released();
}

#[test]
fn destroy_wakes_decode_thread_blocked_on_surfaces() {
    let mut h = start(scripted(Script {
        surface_set: Some((1, Size::new(16, 16))),
        hold_surfaces: true,
        ..Script::default()
    }));

    h.decode(1, b"holds the only surface");
    assert!(matches!(h.next(), ClientEvent::ProvidePictureBuffers { count: 1, .. }));
    h.vda().assign_picture_buffers(picture_buffers(0..1)).unwrap();
    assert_eq!(h.next(), ClientEvent::EndOfBitstreamBuffer(1));
    h.decode(2, b"waits for a surface");
    h.expect_quiet();

    let vda = h.vda.take().unwrap();
    let (done_tx, done) = unbounded();
    thread::spawn(move || {
        let _ = done_tx.send(vda.destroy());
    });
    let result = done.recv_timeout(TIMEOUT).expect("destroy did not deadlock");
    assert!(result.is_ok());
    h.assert_released();
}

#[test]
fn wrong_picture_count_is_invalid_argument() {
    let h = start(scripted(Script {
        surface_set: Some((4, Size::new(32, 32))),
        ..Script::default()
    }));

    h.decode(1, b"x");
    assert!(matches!(h.next(), ClientEvent::ProvidePictureBuffers { count: 4, .. }));
    h.vda().assign_picture_buffers(picture_buffers(0..3)).unwrap();
    assert_eq!(h.next(), ClientEvent::Error(ErrorCode::InvalidArgument));
    assert_eq!(h.probe.live_images(), 0);
    assert_eq!(h.probe.live_surfaces(), 0);
    assert_eq!(h.vda().state(), State::Uninitialized);

    // The client is detached after an error.
    h.decode(2, b"ignored");
    h.vda().flush().unwrap();
    h.expect_quiet();
}

#[test]
fn every_buffer_is_returned_exactly_once() {
    let h = start(synthetic_engine(SyntheticEngineConfig::default()));
    let size = Size::new(32, 32);

    h.decode(1, &stream(size, 3, &[b"f1"]));
    h.pump_until(true, |e| matches!(e, ClientEvent::ProvidePictureBuffers { .. }));
    for id in 2..=5 {
        h.decode(id, &frames(&[format!("f{id}").as_bytes()]));
    }
    h.vda().reset().unwrap();
    for id in 6..=10 {
        h.decode(id, &frames(&[format!("f{id}").as_bytes()]));
    }
    let mut events = h.pump_until(true, |e| *e == ClientEvent::ResetDone);

    h.decode(11, b"");
    h.vda().flush().unwrap();
    events.extend(h.pump_until(true, |e| *e == ClientEvent::FlushDone));

    let mut returned: HashMap<i32, usize> = HashMap::new();
    for event in &events {
        if let ClientEvent::EndOfBitstreamBuffer(id) = event {
            *returned.entry(*id).or_default() += 1;
        }
        assert!(!matches!(event, ClientEvent::Error(_)), "{event:?}");
    }
    for id in 1..=11 {
        assert_eq!(returned.get(&id), Some(&1), "buffer {id}");
    }
    assert_eq!(returned.len(), 11);

    let metrics = h.vda().metrics();
    assert_eq!(metrics.buffers_received, 11);
    assert_eq!(metrics.buffers_returned, 11);
    assert_eq!(metrics.resets_completed, 1);
}

#[test]
fn pictures_are_delivered_in_decode_order() {
    let h = start(synthetic_engine(SyntheticEngineConfig {
        reference_frames: 1,
        display_delay: 0,
    }));
    let size = Size::new(8, 8);
    let payloads: Vec<Vec<u8>> = (1..=6).map(|i| format!("payload-{i}").into_bytes()).collect();

    h.decode(1, &stream(size, 3, &[payloads[0].as_slice()]));
    for (i, payload) in payloads.iter().enumerate().skip(1) {
        h.decode(i as i32 + 1, &frames(&[payload.as_slice()]));
    }
    h.vda().flush().unwrap();
    let events = h.pump_until(true, |e| *e == ClientEvent::FlushDone);

    assert_eq!(ready_inputs(&events), vec![1, 2, 3, 4, 5, 6]);
    let colors: Vec<[u8; 4]> = h.uploads.lock().iter().map(|u| u.2).collect();
    let expected: Vec<[u8; 4]> = payloads.iter().map(|p| frame_color(p)).collect();
    assert_eq!(colors, expected);
}

#[test]
fn surface_set_change_dismisses_only_after_outputs_drain() {
    let h = start(synthetic_engine(SyntheticEngineConfig {
        reference_frames: 0,
        display_delay: 0,
    }));
    let small = Size::new(32, 32);
    let large = Size::new(48, 48);

    h.decode(1, &stream(small, 1, &[b"a"]));
    assert_eq!(
        h.next(),
        ClientEvent::ProvidePictureBuffers {
            count: 1,
            size: small
        }
    );
    h.vda().assign_picture_buffers(picture_buffers(0..1)).unwrap();
    let events = h.pump_until(false, |e| *e == ClientEvent::EndOfBitstreamBuffer(1));
    assert_eq!(ready_inputs(&events), vec![1]);

    let mut second = frames(&[b"b"]);
    second.extend(stream(large, 2, &[b"c"]));
    h.decode(2, &second);
    // Frame b waits for picture 0, so the old set must stay.
    h.expect_quiet();
    assert_eq!(h.probe.live_surfaces(), 1);

    h.vda().reuse_picture_buffer(0).unwrap();
    assert_eq!(
        h.next(),
        ClientEvent::PictureReady(Picture {
            picture_buffer_id: 0,
            bitstream_buffer_id: 2,
        })
    );
    assert_eq!(h.next(), ClientEvent::Dismiss(0));
    assert_eq!(
        h.next(),
        ClientEvent::ProvidePictureBuffers {
            count: 2,
            size: large
        }
    );
    assert_eq!(h.probe.live_surfaces(), 0);

    h.vda().assign_picture_buffers(picture_buffers(10..12)).unwrap();
    assert_eq!(
        h.next(),
        ClientEvent::PictureReady(Picture {
            picture_buffer_id: 10,
            bitstream_buffer_id: 2,
        })
    );
    assert_eq!(h.next(), ClientEvent::EndOfBitstreamBuffer(2));
    let last = *h.uploads.lock().last().unwrap();
    assert_eq!(last, (1010, large, frame_color(b"c")));
    assert_eq!(h.vda().metrics().pictures_dismissed, 1);
}

#[test]
fn stale_picture_reuse_is_ignored() {
    let h = start(scripted(Script {
        surface_set: Some((2, Size::new(16, 16))),
        ..Script::default()
    }));
    h.decode(1, b"x");
    h.pump_until(true, |e| *e == ClientEvent::EndOfBitstreamBuffer(1));
    h.vda().reuse_picture_buffer(0).unwrap();
    h.vda().reuse_picture_buffer(77).unwrap();
    h.expect_quiet();
    assert_eq!(h.vda().state(), State::Decoding);
}

#[test]
fn decode_while_flushing_is_platform_failure() {
    let (entered_tx, entered) = unbounded();
    let (gate_tx, gate) = unbounded::<()>();
    let h = start(scripted(Script {
        surface_set: Some((2, Size::new(16, 16))),
        entered: Some(entered_tx),
        gate: Some(gate),
        ..Script::default()
    }));

    h.decode(1, b"x");
    assert!(matches!(h.next(), ClientEvent::ProvidePictureBuffers { .. }));
    h.vda().assign_picture_buffers(picture_buffers(0..2)).unwrap();
    assert_eq!(entered.recv_timeout(TIMEOUT), Ok(1));

    h.vda().flush().unwrap();
    h.decode(2, b"too late");
    drop(gate_tx);
    // Buffer 1 may still complete before the rejected decode is handled.
    let events = h.pump_until(false, |e| matches!(e, ClientEvent::Error(_)));
    assert_eq!(
        events.last(),
        Some(&ClientEvent::Error(ErrorCode::PlatformFailure))
    );
    assert!(!events.contains(&ClientEvent::EndOfBitstreamBuffer(2)));
    assert_eq!(h.vda().state(), State::Uninitialized);
    h.expect_quiet();
}

#[test]
fn negative_buffer_id_is_invalid_argument() {
    let h = start(synthetic_engine(SyntheticEngineConfig::default()));
    h.decode(-1, b"x");
    assert_eq!(h.next(), ClientEvent::Error(ErrorCode::InvalidArgument));
}

#[test]
fn unreadable_buffer_is_reported() {
    let h = start(synthetic_engine(SyntheticEngineConfig::default()));
    let handle = SharedMemoryHandle::with_contents("short", b"abcd").unwrap();
    h.vda()
        .decode(BitstreamBuffer::new(5, handle, 4096))
        .unwrap();
    assert_eq!(h.next(), ClientEvent::Error(ErrorCode::UnreadableInput));
}

#[test]
fn engine_error_is_decode_error_and_stops_decoding() {
    let mut h = start(scripted(Script {
        surface_set: Some((2, Size::new(16, 16))),
        fail_on: Some(2),
        ..Script::default()
    }));
    h.decode(1, b"ok");
    h.decode(2, b"corrupt");
    h.decode(3, b"never");
    let events = h.pump_until(true, |e| matches!(e, ClientEvent::Error(_)));
    assert_eq!(events.last(), Some(&ClientEvent::Error(ErrorCode::DecodeError)));
    assert!(!events.contains(&ClientEvent::EndOfBitstreamBuffer(3)));
    assert_eq!(h.vda().state(), State::Uninitialized);
    h.expect_quiet();
    assert_eq!(h.vda().metrics().client_errors, 1);

    h.destroy().unwrap();
    h.assert_released();
}

#[test]
fn surface_allocation_failure_is_platform_failure() {
    let h = start(scripted(Script {
        surface_set: Some((2, Size::new(16, 16))),
        ..Script::default()
    }));
    h.decode(1, b"x");
    assert!(matches!(h.next(), ClientEvent::ProvidePictureBuffers { .. }));
    h.probe.fail_next("vaCreateSurfaces");
    h.vda().assign_picture_buffers(picture_buffers(0..2)).unwrap();
    assert_eq!(h.next(), ClientEvent::Error(ErrorCode::PlatformFailure));
    assert_eq!(h.vda().metrics().va_errors, 1);
}

#[test]
fn negotiation_failure_fails_initialize() {
    let driver = MemoryDriver::with_config(MemoryDriverConfig {
        profiles: vec![VaProfile::H264High],
        ..MemoryDriverConfig::default()
    });
    let mut h = build(driver, synthetic_engine(SyntheticEngineConfig::default()));
    let err = h.vda_mut().initialize().expect_err("main is unsupported");
    assert!(matches!(err, DecoderError::Negotiation(_)));
    assert_eq!(h.vda().state(), State::Uninitialized);
    assert!(h.probe.is_terminated());
    assert!(matches!(
        h.vda().decode(buffer(1, b"x")),
        Err(DecoderError::NotInitialized)
    ));
    assert!(matches!(
        h.vda_mut().initialize(),
        Err(DecoderError::IllegalState(_))
    ));
}

#[test]
fn baseline_falls_back_to_constrained_baseline() {
    let driver = MemoryDriver::with_config(MemoryDriverConfig {
        profiles: vec![VaProfile::H264ConstrainedBaseline],
        ..MemoryDriverConfig::default()
    });
    let probe = driver.probe();
    let (tx, _events) = unbounded();
    let mut vda = VaapiVideoDecodeAccelerator::new(
        AcceleratorConfig {
            profile: VideoCodecProfile::H264Baseline,
            ..AcceleratorConfig::default()
        },
        Collaborators {
            driver: Box::new(driver),
            client: Box::new(RecordingClient(tx)),
            render: Box::new(RecordingRender(Uploads::default())),
            engine_factory: synthetic_engine(SyntheticEngineConfig::default()),
        },
    );
    vda.initialize().unwrap();
    assert_eq!(vda.state(), State::Idle);
    vda.destroy().unwrap();
    assert!(probe.is_terminated());
}

#[test]
fn reset_during_surface_set_change_completes_after_recycle() {
    let h = start(synthetic_engine(SyntheticEngineConfig {
        reference_frames: 0,
        display_delay: 0,
    }));
    let small = Size::new(32, 32);
    let large = Size::new(48, 48);

    h.decode(1, &stream(small, 1, &[b"a"]));
    assert_eq!(
        h.next(),
        ClientEvent::ProvidePictureBuffers {
            count: 1,
            size: small
        }
    );
    h.vda().assign_picture_buffers(picture_buffers(0..1)).unwrap();
    h.pump_until(false, |e| *e == ClientEvent::EndOfBitstreamBuffer(1));

    // Frame b is pending on picture 0 while the new sequence waits for it.
    let mut second = frames(&[b"b"]);
    second.extend(stream(large, 2, &[b"c"]));
    h.decode(2, &second);
    h.expect_quiet();

    h.vda().reset().unwrap();
    assert_eq!(h.next(), ClientEvent::EndOfBitstreamBuffer(2));
    assert_eq!(h.next(), ClientEvent::Dismiss(0));
    assert_eq!(
        h.next(),
        ClientEvent::ProvidePictureBuffers {
            count: 2,
            size: large
        }
    );
    assert_eq!(h.next(), ClientEvent::ResetDone);
    assert_eq!(h.vda().state(), State::Idle);
    assert_eq!(h.probe.live_surfaces(), 0);

    // The new sequence survives the reset.
    h.vda().assign_picture_buffers(picture_buffers(10..12)).unwrap();
    h.decode(3, &frames(&[b"d"]));
    let events = h.pump_until(false, |e| *e == ClientEvent::EndOfBitstreamBuffer(3));
    assert_eq!(ready_inputs(&events), vec![3]);
    let last = *h.uploads.lock().last().unwrap();
    assert_eq!(last, (1010, large, frame_color(b"d")));
    assert_eq!(h.vda().metrics().resets_completed, 1);
}

#[test]
fn flush_spanning_surface_set_change_completes_after_assignment() {
    let h = start(synthetic_engine(SyntheticEngineConfig {
        reference_frames: 0,
        display_delay: 0,
    }));
    let small = Size::new(32, 32);
    let large = Size::new(48, 48);

    h.decode(1, &stream(small, 1, &[b"a"]));
    h.next();
    h.vda().assign_picture_buffers(picture_buffers(0..1)).unwrap();
    let mut events = h.pump_until(false, |e| *e == ClientEvent::EndOfBitstreamBuffer(1));

    let mut second = frames(&[b"b"]);
    second.extend(stream(large, 2, &[b"c"]));
    h.decode(2, &second);
    h.vda().flush().unwrap();
    // Nothing completes while the old set is still referenced.
    h.expect_quiet();
    assert_eq!(h.vda().state(), State::Flushing);

    h.vda().reuse_picture_buffer(0).unwrap();
    events.extend(h.pump_until(false, |e| matches!(e, ClientEvent::ProvidePictureBuffers { .. })));
    assert_eq!(
        events.last(),
        Some(&ClientEvent::ProvidePictureBuffers {
            count: 2,
            size: large
        })
    );
    h.expect_quiet();

    h.vda().assign_picture_buffers(picture_buffers(10..12)).unwrap();
    events.extend(h.pump_until(false, |e| *e == ClientEvent::FlushDone));
    assert_eq!(ready_inputs(&events), vec![1, 2, 2]);
    let returned = events
        .iter()
        .position(|e| *e == ClientEvent::EndOfBitstreamBuffer(2))
        .expect("buffer 2 returned");
    assert!(returned < events.len() - 1);
    assert!(events.contains(&ClientEvent::Dismiss(0)));
    assert_eq!(h.vda().state(), State::Idle);
    assert_eq!(h.vda().metrics().flushes_completed, 1);
}

/// Destroys the accelerator it is handed from inside a client callback.
struct DestroyingClient {
    slot: Arc<Mutex<Option<VaapiVideoDecodeAccelerator>>>,
    destroyed: Sender<Result<()>>,
}

impl DecodeClient for DestroyingClient {
    fn provide_picture_buffers(&mut self, count: usize, _size: Size, _target: TextureTarget) {
        if let Some(vda) = self.slot.lock().as_ref() {
            vda.assign_picture_buffers(picture_buffers(0..count as i32))
                .expect("assign posted");
        }
    }

    fn dismiss_picture_buffer(&mut self, _picture_buffer_id: i32) {}

    fn picture_ready(&mut self, _picture: Picture) {}

    fn notify_end_of_bitstream_buffer(&mut self, _bitstream_buffer_id: i32) {
        let vda = self.slot.lock().take();
        if let Some(vda) = vda {
            let _ = self.destroyed.send(vda.destroy());
        }
    }

    fn notify_flush_done(&mut self) {}

    fn notify_reset_done(&mut self) {}

    fn notify_error(&mut self, _error: ErrorCode) {}
}

#[test]
fn destroy_from_client_callback_does_not_self_join() {
    init_tracing();
    let driver = MemoryDriver::new();
    let probe = driver.probe();
    let slot = Arc::new(Mutex::new(None));
    let (destroyed_tx, destroyed) = unbounded();
    let mut vda = VaapiVideoDecodeAccelerator::new(
        AcceleratorConfig::default(),
        Collaborators {
            driver: Box::new(driver),
            client: Box::new(DestroyingClient {
                slot: Arc::clone(&slot),
                destroyed: destroyed_tx,
            }),
            render: Box::new(RecordingRender(Uploads::default())),
            engine_factory: scripted(Script {
                surface_set: Some((2, Size::new(16, 16))),
                ..Script::default()
            }),
        },
    );
    vda.initialize().unwrap();
    *slot.lock() = Some(vda);
    slot.lock()
        .as_ref()
        .expect("accelerator in slot")
        .decode(buffer(1, b"x"))
        .unwrap();

    let result = destroyed
        .recv_timeout(TIMEOUT)
        .expect("destroy returned inside the callback");
    result.unwrap();
    assert!(slot.lock().is_none());

    // Teardown finishes on the client thread once the callback returns.
    let deadline = std::time::Instant::now() + TIMEOUT;
    while !probe.is_terminated() {
        assert!(std::time::Instant::now() < deadline, "hardware never released");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(probe.live_surfaces(), 0);
}

//! vadec CLI entrypoint.
//!
//! ```bash
//! vadec probe --json
//! vadec probe --render-node /dev/dri/renderD129 --profile h264-high
//! vadec simulate --frames 120 --pictures 6 --resolution-change-at 60 --json
//! vadec simulate --config accelerator.json --reset-at 30
//! ```

use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use crossbeam::channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use tracing::{debug, info, warn};

use vadec_core::client::{DecodeClient, RenderContext};
use vadec_core::codec_traits::BitstreamDecoderEngine;
use vadec_core::error::{DecoderError, ErrorCode, Result};
use vadec_core::shm::BitstreamBuffer;
use vadec_core::types::{Picture, PictureBuffer, Size, TextureTarget, VideoCodecProfile};
use vadec_pipeline::synthetic::{self, SyntheticEngine, SyntheticEngineConfig};
use vadec_pipeline::{AcceleratorConfig, Collaborators, MetricsSnapshot, VaapiVideoDecodeAccelerator};
use vadec_vaapi::context::{HardwareOptions, VaapiContext};
use vadec_vaapi::libva::LibvaDriver;
use vadec_vaapi::memory_driver::MemoryDriver;

#[derive(Parser, Debug)]
#[command(
    name = "vadec",
    version,
    about = "VA-API video decode accelerator",
    arg_required_else_help = true,
    after_help = "Examples:\n  vadec probe --json\n  vadec simulate --frames 120 --pictures 6 --json\n  vadec simulate --resolution-change-at 40 --reset-at 80"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a VA-API session on a render node and report the negotiated profile.
    Probe(ProbeArgs),
    /// Decode a synthetic stream end to end against the in-memory driver.
    Simulate(SimulateArgs),
}

#[derive(Args, Debug, Clone)]
struct ProbeArgs {
    /// DRM render node to open.
    #[arg(long = "render-node", default_value = "/dev/dri/renderD128")]
    render_node: PathBuf,

    /// Codec profile to negotiate (h264-baseline, h264-main, h264-high, ...).
    #[arg(long = "profile", default_value = "h264-main")]
    profile: VideoCodecProfile,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    /// Number of frames in the synthetic stream, one per bitstream buffer.
    #[arg(long = "frames", default_value_t = 60)]
    frames: u32,

    /// Coded width of the first sequence.
    #[arg(long = "width", default_value_t = 320)]
    width: u32,

    /// Coded height of the first sequence.
    #[arg(long = "height", default_value_t = 240)]
    height: u32,

    /// Picture buffers requested per sequence.
    #[arg(long = "pictures", default_value_t = 4)]
    pictures: u32,

    /// Reference surfaces the synthetic engine keeps alive.
    #[arg(long = "reference-frames", default_value_t = 1)]
    reference_frames: usize,

    /// Frames the synthetic engine holds back before output.
    #[arg(long = "display-delay", default_value_t = 1)]
    display_delay: usize,

    /// Frame index at which a new sequence with doubled dimensions starts.
    #[arg(long = "resolution-change-at")]
    resolution_change_at: Option<u32>,

    /// Frame index after which the decoder is reset.
    #[arg(long = "reset-at")]
    reset_at: Option<u32>,

    /// Optional accelerator config JSON.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

const JSON_SCHEMA_VERSION: u32 = 1;

/// Longest silence tolerated from the decoder before a simulation fails.
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Probe(args) if args.json => Some("probe"),
        Commands::Simulate(args) if args.json => Some("simulate"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Probe(args) => run_probe(args),
        Commands::Simulate(args) => run_simulate(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

// ─── probe ──────────────────────────────────────────────────────────────────

fn run_probe(args: ProbeArgs) -> Result<()> {
    let options = HardwareOptions {
        render_node: args.render_node.clone(),
        ..HardwareOptions::default()
    };
    let driver = LibvaDriver::open(&options.render_node)?;
    let hw = VaapiContext::initialize(Box::new(driver), args.profile, &options, None)?;

    if args.json {
        let value = serde_json::json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "probe",
            "ok": true,
            "render_node": args.render_node.display().to_string(),
            "vendor": hw.vendor(),
            "api_version": hw.api_version().to_string(),
            "requested_profile": args.profile,
            "va_profile": hw.profile(),
        });
        println!("{value}");
    } else {
        println!("probe: ok");
        println!("render_node={}", args.render_node.display());
        println!("vendor={}", hw.vendor());
        println!("api_version={}", hw.api_version());
        println!("requested_profile={}", args.profile);
        println!("va_profile={:?}", hw.profile());
    }
    Ok(())
}

// ─── simulate ───────────────────────────────────────────────────────────────

/// Client callbacks, forwarded from the decoder's client thread.
#[derive(Debug)]
enum ClientEvent {
    ProvidePictureBuffers { count: usize, size: Size },
    Dismiss(i32),
    PictureReady(Picture),
    EndOfBitstreamBuffer(i32),
    FlushDone,
    ResetDone,
    Error(ErrorCode),
}

struct ChannelClient(Sender<ClientEvent>);

impl ChannelClient {
    fn forward(&self, event: ClientEvent) {
        if self.0.send(event).is_err() {
            warn!("Simulation driver is gone; dropping client event");
        }
    }
}

impl DecodeClient for ChannelClient {
    fn provide_picture_buffers(&mut self, count: usize, size: Size, _target: TextureTarget) {
        self.forward(ClientEvent::ProvidePictureBuffers { count, size });
    }

    fn dismiss_picture_buffer(&mut self, picture_buffer_id: i32) {
        self.forward(ClientEvent::Dismiss(picture_buffer_id));
    }

    fn picture_ready(&mut self, picture: Picture) {
        self.forward(ClientEvent::PictureReady(picture));
    }

    fn notify_end_of_bitstream_buffer(&mut self, bitstream_buffer_id: i32) {
        self.forward(ClientEvent::EndOfBitstreamBuffer(bitstream_buffer_id));
    }

    fn notify_flush_done(&mut self) {
        self.forward(ClientEvent::FlushDone);
    }

    fn notify_reset_done(&mut self) {
        self.forward(ClientEvent::ResetDone);
    }

    fn notify_error(&mut self, error: ErrorCode) {
        self.forward(ClientEvent::Error(error));
    }
}

/// Accepts uploads without a real GL context.
struct NullRender;

impl RenderContext for NullRender {
    fn make_context_current(&mut self) -> bool {
        true
    }

    fn upload_rgbx(&mut self, texture_id: u32, size: Size, _pitch: usize, _pixels: &[u8]) -> Result<()> {
        debug!(texture_id, size = %size, "Upload");
        Ok(())
    }
}

#[derive(Debug, Default, Serialize)]
struct Tally {
    buffers_returned: u64,
    pictures_ready: u64,
    pictures_dismissed: u64,
    surface_sets: u64,
    resets: u64,
}

/// Plays the display client: answers picture requests and returns every
/// picture as soon as it is shown.
struct Session {
    vda: VaapiVideoDecodeAccelerator,
    events: Receiver<ClientEvent>,
    next_picture_id: i32,
    returned: HashSet<i32>,
    tally: Tally,
}

impl Session {
    fn wait_for(&mut self, done: impl Fn(&ClientEvent) -> bool) -> Result<()> {
        loop {
            let event = self.events.recv_timeout(EVENT_TIMEOUT).map_err(|_| {
                DecoderError::Platform(format!(
                    "no decoder event within {}s",
                    EVENT_TIMEOUT.as_secs()
                ))
            })?;
            let finished = done(&event);
            self.handle(event)?;
            if finished {
                return Ok(());
            }
        }
    }

    fn handle(&mut self, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::ProvidePictureBuffers { count, size } => {
                // Ids are never reused across sets so stale reuses stay harmless.
                let first = self.next_picture_id;
                let buffers: Vec<PictureBuffer> = (0..count as i32)
                    .map(|i| PictureBuffer::new(first + i, (first + i) as u32 + 1))
                    .collect();
                self.next_picture_id += count as i32;
                self.tally.surface_sets += 1;
                info!(count, size = %size, first_id = first, "Assigning picture buffers");
                self.vda.assign_picture_buffers(buffers)?;
            }
            ClientEvent::Dismiss(id) => {
                debug!(picture_buffer_id = id, "Picture buffer dismissed");
                self.tally.pictures_dismissed += 1;
            }
            ClientEvent::PictureReady(picture) => {
                debug!(?picture, "Picture ready");
                self.tally.pictures_ready += 1;
                self.vda.reuse_picture_buffer(picture.picture_buffer_id)?;
            }
            ClientEvent::EndOfBitstreamBuffer(id) => {
                if !self.returned.insert(id) {
                    return Err(DecoderError::Platform(format!(
                        "bitstream buffer {id} returned twice"
                    )));
                }
                self.tally.buffers_returned += 1;
            }
            ClientEvent::ResetDone => self.tally.resets += 1,
            ClientEvent::FlushDone => {}
            ClientEvent::Error(code) => {
                return Err(DecoderError::Platform(format!("decoder reported {code}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SimulateSummary {
    schema_version: u32,
    command: &'static str,
    ok: bool,
    frames: u32,
    elapsed_ms: u64,
    #[serde(flatten)]
    tally: Tally,
    metrics: MetricsSnapshot,
}

/// One bitstream buffer per frame. Buffer 0, the resolution change and the
/// buffer after a reset carry a sequence header in front of their frame,
/// since a reset may discard every buffer that held the previous one.
fn synthetic_stream(args: &SimulateArgs) -> Vec<Vec<u8>> {
    let mut size = Size::new(args.width, args.height);
    (0..args.frames)
        .map(|i| {
            let resolution_change = i > 0 && args.resolution_change_at == Some(i);
            if resolution_change {
                size = Size::new(size.width * 2, size.height * 2);
            }
            let resumes_after_reset = args.reset_at.is_some_and(|k| k.checked_add(1) == Some(i));

            let mut bytes = Vec::new();
            if i == 0 || resolution_change || resumes_after_reset {
                bytes.extend(synthetic::sequence_header(size, args.pictures));
            }
            bytes.extend(synthetic::frame(format!("frame-{i}").as_bytes()));
            bytes
        })
        .collect()
}

fn run_simulate(args: SimulateArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => AcceleratorConfig::from_json_file(path)?,
        None => AcceleratorConfig::default(),
    };
    let engine_config = SyntheticEngineConfig {
        reference_frames: args.reference_frames,
        display_delay: args.display_delay,
    };
    if Size::new(args.width, args.height).is_empty() {
        return Err(DecoderError::Config("--width and --height must be non-zero".into()));
    }
    if (args.pictures as usize) < engine_config.min_pictures() {
        return Err(DecoderError::Config(format!(
            "--pictures {} is below the {} the engine needs",
            args.pictures,
            engine_config.min_pictures()
        )));
    }

    let (tx, events) = unbounded();
    let mut vda = VaapiVideoDecodeAccelerator::new(
        config,
        Collaborators {
            driver: Box::new(MemoryDriver::new()),
            client: Box::new(ChannelClient(tx)),
            render: Box::new(NullRender),
            engine_factory: Box::new(move |hw, output| {
                Ok(Box::new(SyntheticEngine::new(hw, output, engine_config))
                    as Box<dyn BitstreamDecoderEngine>)
            }),
        },
    );
    vda.initialize()?;

    let started = Instant::now();
    let mut session = Session {
        vda,
        events,
        next_picture_id: 0,
        returned: HashSet::new(),
        tally: Tally::default(),
    };
    for (i, bytes) in synthetic_stream(&args).into_iter().enumerate() {
        let id = i as i32;
        session.vda.decode(BitstreamBuffer::from_bytes(id, &bytes)?)?;
        if args.reset_at == Some(i as u32) {
            info!(after_buffer = id, "Resetting decoder");
            session.vda.reset()?;
            session.wait_for(|e| matches!(e, ClientEvent::ResetDone))?;
        }
    }
    session.vda.flush()?;
    session.wait_for(|e| matches!(e, ClientEvent::FlushDone))?;
    if let Some(missing) = (0..args.frames as i32).find(|id| !session.returned.contains(id)) {
        return Err(DecoderError::Platform(format!(
            "bitstream buffer {missing} never returned"
        )));
    }

    let metrics = session.vda.metrics();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    session.vda.destroy()?;

    let summary = SimulateSummary {
        schema_version: JSON_SCHEMA_VERSION,
        command: "simulate",
        ok: true,
        frames: args.frames,
        elapsed_ms,
        tally: session.tally,
        metrics,
    };
    if args.json {
        let json = serde_json::to_string(&summary)
            .map_err(|e| DecoderError::Platform(format!("cannot encode summary: {e}")))?;
        println!("{json}");
    } else {
        println!("simulate: ok");
        println!("frames={}", summary.frames);
        println!("buffers_returned={}", summary.tally.buffers_returned);
        println!("pictures_ready={}", summary.tally.pictures_ready);
        println!("pictures_dismissed={}", summary.tally.pictures_dismissed);
        println!("surface_sets={}", summary.tally.surface_sets);
        println!("resets={}", summary.tally.resets);
        println!("va_errors={}", summary.metrics.va_errors);
        println!("elapsed_ms={}", summary.elapsed_ms);
    }
    Ok(())
}

fn command_error_json(command: &str, err: &DecoderError) -> String {
    serde_json::json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "error": err.to_string(),
        "code": err.error_code(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(frames: u32) -> SimulateArgs {
        SimulateArgs {
            frames,
            width: 64,
            height: 48,
            pictures: 4,
            reference_frames: 1,
            display_delay: 1,
            resolution_change_at: None,
            reset_at: None,
            config: None,
            json: false,
        }
    }

    fn has_sequence_header(buffer: &[u8]) -> bool {
        buffer.starts_with(&synthetic::TAG_SEQUENCE_HEADER)
    }

    #[test]
    fn stream_repeats_sequence_header_after_reset() {
        let mut args = args(6);
        args.reset_at = Some(2);
        let stream = synthetic_stream(&args);

        let with_header: Vec<usize> = (0..stream.len())
            .filter(|&i| has_sequence_header(&stream[i]))
            .collect();
        assert_eq!(with_header, vec![0, 3]);
    }

    #[test]
    fn stream_carries_one_header_when_reset_meets_resolution_change() {
        let mut args = args(6);
        args.reset_at = Some(2);
        args.resolution_change_at = Some(3);
        let stream = synthetic_stream(&args);

        let mut expected = synthetic::sequence_header(Size::new(128, 96), 4);
        expected.extend(synthetic::frame(b"frame-3"));
        assert_eq!(stream[3], expected);
    }

    #[test]
    fn reset_on_last_buffer_adds_no_header() {
        let mut args = args(4);
        args.reset_at = Some(3);
        let stream = synthetic_stream(&args);
        assert_eq!(stream.iter().filter(|b| has_sequence_header(b)).count(), 1);
    }
}

//! A minimal codec engine over a tag-length-value bitstream.
//!
//! Stream layout, repeated:
//!
//! ```text
//! ┌──────────┬──────────────┬─────────────────┐
//! │ tag [4]  │ len u32 LE   │ payload [len]   │
//! └──────────┴──────────────┴─────────────────┘
//! ```
//!
//! `SEQH` carries `width`, `height` and the picture count as u32 LE.  `FRAM`
//! carries one frame's slice data.  Each frame is submitted to the hardware
//! as a picture-parameter buffer plus a slice-data buffer.  Decoded frames
//! are kept as references and held back for `display_delay` frames before
//! output, which is enough to exercise surface recycling, flush and reset
//! the way a real codec does.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use vadec_core::codec_traits::{BitstreamDecoderEngine, DecodeResult, OutputCallback, StreamData};
use vadec_core::error::Result;
use vadec_core::surface::Surface;
use vadec_core::types::{Size, SurfaceId};
use vadec_vaapi::context::VaapiContext;
use vadec_vaapi::driver::BufferType;

pub const TAG_SEQUENCE_HEADER: [u8; 4] = *b"SEQH";
pub const TAG_FRAME: [u8; 4] = *b"FRAM";

const UNIT_HEADER_LEN: usize = 8;
const SEQUENCE_HEADER_LEN: usize = 12;

/// Encode a sequence header unit.
pub fn sequence_header(size: Size, pictures: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SEQUENCE_HEADER_LEN);
    payload.extend_from_slice(&size.width.to_le_bytes());
    payload.extend_from_slice(&size.height.to_le_bytes());
    payload.extend_from_slice(&pictures.to_le_bytes());
    unit(TAG_SEQUENCE_HEADER, &payload)
}

/// Encode a frame unit.
pub fn frame(slice_data: &[u8]) -> Vec<u8> {
    unit(TAG_FRAME, slice_data)
}

fn unit(tag: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(UNIT_HEADER_LEN + payload.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Unit<'a> {
    SequenceHeader { size: Size, pictures: usize },
    Frame(&'a [u8]),
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

/// Parse the unit at the start of `data`, returning it and its encoded length.
fn parse_unit(data: &[u8]) -> std::result::Result<(Unit<'_>, usize), String> {
    if data.len() < UNIT_HEADER_LEN {
        return Err(format!("truncated unit header ({} bytes)", data.len()));
    }
    let len = read_u32(data, 4) as usize;
    let end = UNIT_HEADER_LEN
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| format!("unit length {len} overruns the buffer"))?;
    let payload = &data[UNIT_HEADER_LEN..end];

    let unit = match [data[0], data[1], data[2], data[3]] {
        TAG_SEQUENCE_HEADER => {
            if payload.len() != SEQUENCE_HEADER_LEN {
                return Err(format!("sequence header of {} bytes", payload.len()));
            }
            Unit::SequenceHeader {
                size: Size::new(read_u32(payload, 0), read_u32(payload, 4)),
                pictures: read_u32(payload, 8) as usize,
            }
        }
        TAG_FRAME => Unit::Frame(payload),
        tag => return Err(format!("unknown unit tag {:?}", String::from_utf8_lossy(&tag))),
    };
    Ok((unit, end))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticEngineConfig {
    /// Decoded surfaces kept alive as references for later frames.
    pub reference_frames: usize,
    /// Frames held back before output.
    pub display_delay: usize,
}

impl Default for SyntheticEngineConfig {
    fn default() -> Self {
        Self {
            reference_frames: 1,
            display_delay: 1,
        }
    }
}

impl SyntheticEngineConfig {
    /// Fewest surfaces a sequence needs to make progress.
    pub fn min_pictures(&self) -> usize {
        self.reference_frames + self.display_delay + 1
    }
}

pub struct SyntheticEngine {
    hw: Arc<VaapiContext>,
    output: OutputCallback,
    config: SyntheticEngineConfig,
    stream: Option<(i32, StreamData)>,
    offset: usize,
    sequence: Option<(Size, usize)>,
    free: VecDeque<Arc<Surface>>,
    references: VecDeque<Arc<Surface>>,
    reorder: VecDeque<(i32, Arc<Surface>)>,
    frames_decoded: u64,
}

impl SyntheticEngine {
    pub fn new(hw: Arc<VaapiContext>, output: OutputCallback, config: SyntheticEngineConfig) -> Self {
        Self {
            hw,
            output,
            config,
            stream: None,
            offset: 0,
            sequence: None,
            free: VecDeque::new(),
            references: VecDeque::new(),
            reorder: VecDeque::new(),
            frames_decoded: 0,
        }
    }

    fn output_all(&mut self) {
        while let Some((input_id, surface)) = self.reorder.pop_front() {
            (self.output)(input_id, surface);
        }
    }

    fn submit(&self, target: SurfaceId, size: Size, slice_data: &[u8]) -> Result<()> {
        let mut params = Vec::with_capacity(16);
        params.extend_from_slice(&self.frames_decoded.to_le_bytes());
        params.extend_from_slice(&size.width.to_le_bytes());
        params.extend_from_slice(&size.height.to_le_bytes());

        let submitted = self
            .hw
            .submit_buffer(BufferType::PictureParameter, &params)
            .and_then(|()| self.hw.submit_buffer(BufferType::SliceData, slice_data));
        if let Err(e) = submitted {
            self.hw.destroy_pending_buffers();
            return Err(e);
        }
        self.hw.decode_and_destroy_pending_buffers(target)
    }

    fn start_sequence(&mut self, size: Size, pictures: usize) -> DecodeResult {
        if pictures < self.config.min_pictures() {
            return DecodeResult::Error(format!(
                "sequence needs at least {} pictures, header declares {pictures}",
                self.config.min_pictures()
            ));
        }
        // The old set can only be torn down once we hold none of it.
        self.output_all();
        self.references.clear();
        self.free.clear();
        self.sequence = Some((size, pictures));
        debug!(size = %size, pictures, "New sequence");
        DecodeResult::NeedNewSurfaceSet {
            count: pictures,
            size,
        }
    }
}

impl BitstreamDecoderEngine for SyntheticEngine {
    fn set_stream(&mut self, input_id: i32, data: StreamData) {
        self.stream = Some((input_id, data));
        self.offset = 0;
    }

    fn reuse_surface(&mut self, surface: Arc<Surface>) {
        self.free.push_back(surface);
    }

    fn decode(&mut self) -> DecodeResult {
        loop {
            let (input_id, data) = match &self.stream {
                Some((id, data)) => (*id, Arc::clone(data)),
                None => return DecodeResult::NeedMoreInput,
            };
            if self.offset >= data.len() {
                self.stream = None;
                return DecodeResult::NeedMoreInput;
            }

            let (unit, len) = match parse_unit(&data[self.offset..]) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    return DecodeResult::Error(format!(
                        "bitstream buffer {input_id} at offset {}: {reason}",
                        self.offset
                    ));
                }
            };

            match unit {
                Unit::SequenceHeader { size, pictures } => {
                    self.offset += len;
                    if self.sequence == Some((size, pictures)) {
                        continue;
                    }
                    return self.start_sequence(size, pictures);
                }
                Unit::Frame(slice_data) => {
                    let Some((size, _)) = self.sequence else {
                        return DecodeResult::Error(format!(
                            "bitstream buffer {input_id}: frame before sequence header"
                        ));
                    };
                    let Some(target) = self.free.pop_front() else {
                        return DecodeResult::NeedMoreSurfaces;
                    };
                    if let Err(e) = self.submit(target.id(), size, slice_data) {
                        return DecodeResult::Error(e.to_string());
                    }
                    self.offset += len;
                    self.frames_decoded += 1;
                    trace!(input_id, surface_id = target.id(), frame = self.frames_decoded, "Frame decoded");

                    self.references.push_back(Arc::clone(&target));
                    while self.references.len() > self.config.reference_frames {
                        self.references.pop_front();
                    }
                    self.reorder.push_back((input_id, target));
                    while self.reorder.len() > self.config.display_delay {
                        if let Some((id, surface)) = self.reorder.pop_front() {
                            (self.output)(id, surface);
                        }
                    }
                }
            }
        }
    }

    fn flush(&mut self) -> bool {
        self.output_all();
        true
    }

    fn reset(&mut self) {
        self.stream = None;
        self.offset = 0;
        self.reorder.clear();
        self.references.clear();
        self.free.clear();
    }
}

//! Plain value types exchanged between the client, the accelerator and the
//! hardware layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, Result};

/// Driver-owned decode target handle (`VASurfaceID`).
pub type SurfaceId = u32;

/// Coded picture dimensions in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Bytes occupied by a tightly packed 32-bit RGB(X) image of this size.
    pub fn rgbx_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Codec profile requested by the client at initialization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VideoCodecProfile {
    H264Baseline,
    H264ConstrainedBaseline,
    #[default]
    H264Main,
    H264High,
}

impl fmt::Display for VideoCodecProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::H264Baseline => "h264-baseline",
            Self::H264ConstrainedBaseline => "h264-constrained-baseline",
            Self::H264Main => "h264-main",
            Self::H264High => "h264-high",
        };
        f.write_str(name)
    }
}

impl FromStr for VideoCodecProfile {
    type Err = DecoderError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "h264-baseline" | "baseline" => Ok(Self::H264Baseline),
            "h264-constrained-baseline" | "constrained-baseline" | "cbp" => {
                Ok(Self::H264ConstrainedBaseline)
            }
            "h264-main" | "main" | "h264" => Ok(Self::H264Main),
            "h264-high" | "high" => Ok(Self::H264High),
            other => Err(DecoderError::Config(format!(
                "unknown codec profile '{other}' (expected h264-baseline, \
                 h264-constrained-baseline, h264-main or h264-high)"
            ))),
        }
    }
}

/// Texture binding point the client should allocate picture buffers for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureTarget {
    Texture2D,
}

/// A client-supplied picture buffer: an id the client reuses plus the
/// texture the decoded pixels are uploaded into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PictureBuffer {
    pub id: i32,
    pub texture_id: u32,
}

impl PictureBuffer {
    pub const fn new(id: i32, texture_id: u32) -> Self {
        Self { id, texture_id }
    }
}

/// A decoded picture delivered to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Picture {
    pub picture_buffer_id: i32,
    pub bitstream_buffer_id: i32,
}

//! Typed error hierarchy shared by every vadec crate.
//!
//! Library code returns [`DecoderError`].  The accelerator funnels every
//! error that reaches the display client through one notification path,
//! translating it with [`DecoderError::client_code`].
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`DecoderError::error_code`]
//! for structured telemetry without string parsing.

use serde::{Deserialize, Serialize};

/// All errors originating from the decode accelerator.
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    // ── Hardware ──────────────────────────────────────────────────────
    #[error("VA-API negotiation failed: {0}")]
    Negotiation(String),

    #[error("{call} failed: {message} (VAStatus {status:#x})")]
    Va {
        call: &'static str,
        status: i32,
        message: String,
    },

    #[error("Hardware context has no decode context — create surfaces first")]
    HardwareNotInitialized,

    // ── Client protocol ───────────────────────────────────────────────
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Bitstream buffer {id} is unreadable: {reason}")]
    UnreadableInput { id: i32, reason: String },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    // ── Decode ────────────────────────────────────────────────────────
    #[error("Bitstream decode error: {0}")]
    Decode(String),

    #[error("Platform failure: {0}")]
    Platform(String),

    // ── Pipeline ─────────────────────────────────────────────────────
    #[error("Accelerator not initialized — call initialize() first")]
    NotInitialized,

    #[error("Accelerator command channel closed unexpectedly")]
    ChannelClosed,

    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    // ── Audit invariants ─────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl DecoderError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: hardware / driver
    /// - 2xx: client protocol
    /// - 3xx: decode
    /// - 4xx: pipeline
    /// - 6xx: audit/invariant
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Negotiation(_) => 100,
            Self::Va { .. } => 101,
            Self::HardwareNotInitialized => 102,
            Self::InvalidArgument(_) => 200,
            Self::UnreadableInput { .. } => 201,
            Self::IllegalState(_) => 202,
            Self::Decode(_) => 300,
            Self::Platform(_) => 301,
            Self::NotInitialized => 400,
            Self::ChannelClosed => 401,
            Self::ThreadSpawn { .. } => 402,
            Self::Config(_) => 403,
            Self::InvariantViolation(_) => 600,
        }
    }

    /// The code reported to the display client when this error ends decoding.
    pub fn client_code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::UnreadableInput { .. } => ErrorCode::UnreadableInput,
            Self::Decode(_) => ErrorCode::DecodeError,
            _ => ErrorCode::PlatformFailure,
        }
    }
}

/// Error kinds delivered through `DecodeClient::notify_error`.
///
/// Negotiation failures never reach the client; they surface as the
/// `Err` returned by `initialize`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The client broke the protocol (bad id, wrong picture count).
    InvalidArgument,
    /// A bitstream buffer's shared memory could not be mapped.
    UnreadableInput,
    /// A hardware call failed, or a command arrived in a state that forbids it.
    PlatformFailure,
    /// The codec engine rejected the bitstream.
    DecodeError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::UnreadableInput => "UNREADABLE_INPUT",
            Self::PlatformFailure => "PLATFORM_FAILURE",
            Self::DecodeError => "DECODE_ERROR",
        };
        f.write_str(name)
    }
}

/// Convenience alias used throughout the vadec crates.
pub type Result<T> = std::result::Result<T, DecoderError>;

//! Accelerator configuration, loadable from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use vadec_core::error::{DecoderError, Result};
use vadec_core::types::VideoCodecProfile;
use vadec_vaapi::context::HardwareOptions;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// Codec profile negotiated with the hardware at initialization.
    pub profile: VideoCodecProfile,
    pub hardware: HardwareOptions,
    pub decode_thread_name: String,
    pub client_thread_name: String,
    /// Fail `destroy()` when the buffer/picture counters are inconsistent.
    pub strict_invariants: bool,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            profile: VideoCodecProfile::default(),
            hardware: HardwareOptions::default(),
            decode_thread_name: "vadec-decoder".into(),
            client_thread_name: "vadec-client".into(),
            strict_invariants: false,
        }
    }
}

impl AcceleratorConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DecoderError::Config(format!("invalid accelerator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| DecoderError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.decode_thread_name.trim().is_empty() || self.client_thread_name.trim().is_empty() {
            return Err(DecoderError::Config("thread names must not be empty".into()));
        }
        if self.decode_thread_name == self.client_thread_name {
            return Err(DecoderError::Config(format!(
                "decode and client threads share the name '{}'",
                self.decode_thread_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_object_yields_defaults() {
        let config = AcceleratorConfig::from_json_str("{}").unwrap();
        assert_eq!(config, AcceleratorConfig::default());
        assert_eq!(config.profile, VideoCodecProfile::H264Main);
    }

    #[test]
    fn nested_hardware_options_parse() {
        let config = AcceleratorConfig::from_json_str(
            r#"{
                "profile": "h264-baseline",
                "hardware": {
                    "render_node": "/dev/dri/renderD129",
                    "min_api_version": {"major": 1, "minor": 4},
                    "allow_profile_fallback": false
                },
                "strict_invariants": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.profile, VideoCodecProfile::H264Baseline);
        assert_eq!(
            config.hardware.render_node,
            std::path::PathBuf::from("/dev/dri/renderD129")
        );
        assert_eq!(config.hardware.min_api_version.minor, 4);
        assert!(!config.hardware.allow_profile_fallback);
        assert!(config.strict_invariants);
        assert_eq!(config.decode_thread_name, "vadec-decoder");
    }

    #[test]
    fn unknown_profile_is_a_config_error() {
        let err = AcceleratorConfig::from_json_str(r#"{"profile": "vp9"}"#)
            .expect_err("vp9 is not an H.264 profile");
        assert!(matches!(err, DecoderError::Config(_)));
    }

    #[test]
    fn clashing_thread_names_are_rejected() {
        let err = AcceleratorConfig::from_json_str(
            r#"{"decode_thread_name": "vadec", "client_thread_name": "vadec"}"#,
        )
        .expect_err("same names");
        match err {
            DecoderError::Config(msg) => assert!(msg.contains("vadec")),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"profile": "h264-high"}}"#).unwrap();
        let config = AcceleratorConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.profile, VideoCodecProfile::H264High);

        let missing = AcceleratorConfig::from_json_file(Path::new("/nonexistent/vadec.json"));
        assert!(matches!(missing, Err(DecoderError::Config(_))));
    }
}

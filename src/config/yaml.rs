use serde::Deserialize;
use std::path::Path;

use super::ConfigError;
use crate::core::channel::ConnectRetryConfig;

/// Complete YAML configuration structure
///
/// All fields are optional so a file can override only what it needs.
/// Values present here take priority over environment variables.
///
/// # Example YAML structure
/// ```yaml
/// gemini:
///   api_key: "your-gemini-key"
///   model: "gemini-2.5-flash-native-audio-preview-09-2025"
///   voice: "Kore"
///   endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"
///   setup_timeout_ms: 10000
///   connect_retry:
///     enabled: true
///     max_attempts: 2
///
/// capture:
///   sample_rate: 16000
///   chunk_samples: 1024
///
/// playback:
///   sample_rate: 24000
///
/// evidence:
///   jpeg_quality: 80
///   cough_duration_ms: 5000
///
/// session:
///   greeting: "Begin the consultation."
///   system_instruction: "You are a calm health assistant..."
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub gemini: Option<GeminiYaml>,
    pub capture: Option<CaptureYaml>,
    pub playback: Option<PlaybackYaml>,
    pub evidence: Option<EvidenceYaml>,
    pub session: Option<SessionYaml>,
}

/// Gemini Live connection settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GeminiYaml {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub endpoint: Option<String>,
    pub setup_timeout_ms: Option<u64>,
    pub connect_retry: Option<ConnectRetryConfig>,
}

/// Microphone capture settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CaptureYaml {
    /// Only 16000 is accepted
    pub sample_rate: Option<u32>,
    pub chunk_samples: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PlaybackYaml {
    /// Only 24000 is accepted
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EvidenceYaml {
    pub jpeg_quality: Option<u8>,
    pub cough_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub greeting: Option<String>,
    pub system_instruction: Option<String>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_from_file_full() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("consult.yaml");
        fs::write(
            &config_path,
            r#"
gemini:
  api_key: "yaml-key"
  voice: "Kore"
  connect_retry:
    enabled: true
    max_attempts: 2
capture:
  chunk_samples: 512
evidence:
  cough_duration_ms: 3000
session:
  greeting: "Start please."
"#,
        )
        .unwrap();

        let config = YamlConfig::from_file(&config_path).unwrap();
        let gemini = config.gemini.unwrap();
        assert_eq!(gemini.api_key.as_deref(), Some("yaml-key"));
        assert_eq!(gemini.voice.as_deref(), Some("Kore"));
        let retry = gemini.connect_retry.unwrap();
        assert!(retry.enabled);
        assert_eq!(retry.max_attempts, 2);
        // Unset retry fields keep their defaults.
        assert_eq!(retry.initial_delay_ms, 500);
        assert_eq!(config.capture.unwrap().chunk_samples, Some(512));
        assert_eq!(config.evidence.unwrap().cough_duration_ms, Some(3000));
        assert_eq!(
            config.session.unwrap().greeting.as_deref(),
            Some("Start please.")
        );
        assert!(config.playback.is_none());
    }

    #[test]
    fn test_from_file_missing() {
        let result = YamlConfig::from_file(Path::new("/nonexistent/consult.yaml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");
        fs::write(&config_path, "invalid: yaml: content:").unwrap();

        let result = YamlConfig::from_file(&config_path);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }
}

//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants::{audio, credentials, observability, provider, reconnect, session, termination};
use crate::ConfigError;

/// Main client settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Voice-agent provider connection and models
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Capture and playback
    #[serde(default)]
    pub audio: AudioConfig,

    /// Session connection timers
    #[serde(default)]
    pub session: SessionConfig,

    /// Controller reconnect policy
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Termination guard
    #[serde(default)]
    pub termination: TerminationConfig,

    /// Credential endpoint
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_provider()?;
        self.validate_audio()?;
        self.validate_timers()?;
        Ok(())
    }

    fn validate_provider(&self) -> Result<(), ConfigError> {
        let p = &self.provider;

        if !(p.url.starts_with("ws://") || p.url.starts_with("wss://")) {
            return Err(invalid(
                "provider.url",
                format!("Must be a ws:// or wss:// URL, got '{}'", p.url),
            ));
        }

        if p.default_voice.trim().is_empty() {
            return Err(invalid("provider.default_voice", "Must not be empty"));
        }

        if p.fallback_voice.trim().is_empty() {
            return Err(invalid("provider.fallback_voice", "Must not be empty"));
        }

        if p.keepalive_interval_ms == 0 {
            return Err(invalid("provider.keepalive_interval_ms", "Must be greater than 0"));
        }

        if voice_client_core::SampleRate::from_u32(p.output_sample_rate).is_none() {
            return Err(invalid(
                "provider.output_sample_rate",
                format!("Unsupported sample rate {}", p.output_sample_rate),
            ));
        }

        Ok(())
    }

    fn validate_audio(&self) -> Result<(), ConfigError> {
        let a = &self.audio;

        if voice_client_core::SampleRate::from_u32(a.sample_rate).is_none() {
            return Err(invalid(
                "audio.sample_rate",
                format!("Unsupported sample rate {}", a.sample_rate),
            ));
        }

        if !(audio::MIN_FRAME_DURATION_MS..=audio::MAX_FRAME_DURATION_MS)
            .contains(&a.frame_duration_ms)
        {
            return Err(invalid(
                "audio.frame_duration_ms",
                format!(
                    "Must be between {} and {} ms, got {}",
                    audio::MIN_FRAME_DURATION_MS,
                    audio::MAX_FRAME_DURATION_MS,
                    a.frame_duration_ms
                ),
            ));
        }

        if a.capture_channel_capacity == 0 {
            return Err(invalid("audio.capture_channel_capacity", "Must be greater than 0"));
        }

        Ok(())
    }

    fn validate_timers(&self) -> Result<(), ConfigError> {
        if self.session.speech_watchdog_ms == 0 {
            return Err(invalid("session.speech_watchdog_ms", "Must be greater than 0"));
        }

        if self.session.handshake_timeout_ms == 0 {
            return Err(invalid("session.handshake_timeout_ms", "Must be greater than 0"));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(invalid("reconnect.max_attempts", "Must be at least 1"));
        }

        if self.reconnect.base_delay_ms == 0 {
            return Err(invalid("reconnect.base_delay_ms", "Must be greater than 0"));
        }

        let t = &self.termination;
        if t.poll_interval_ms == 0 {
            return Err(invalid("termination.poll_interval_ms", "Must be greater than 0"));
        }
        if t.confirm_window_ms == 0 {
            return Err(invalid("termination.confirm_window_ms", "Must be greater than 0"));
        }
        if t.grace_period_ms == 0 {
            return Err(invalid("termination.grace_period_ms", "Must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Voice-agent provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// WebSocket endpoint
    #[serde(default = "default_provider_url")]
    pub url: String,

    /// Speech recognition model
    #[serde(default = "default_listen_model")]
    pub listen_model: String,

    /// Reasoning provider and model
    #[serde(default = "default_think_provider")]
    pub think_provider: String,
    #[serde(default = "default_think_model")]
    pub think_model: String,

    /// Voice used when a persona does not select one
    #[serde(default = "default_voice")]
    pub default_voice: String,

    /// Known-safe voice substituted by the speech watchdog
    #[serde(default = "default_fallback_voice")]
    pub fallback_voice: String,

    /// Speak a greeting as soon as settings are applied
    #[serde(default = "default_true")]
    pub greeting_enabled: bool,

    /// Audio encoding for both directions
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Rate of synthesized audio (Hz)
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,

    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
}

fn default_provider_url() -> String {
    provider::URL.to_string()
}

fn default_listen_model() -> String {
    provider::LISTEN_MODEL.to_string()
}

fn default_think_provider() -> String {
    provider::THINK_PROVIDER.to_string()
}

fn default_think_model() -> String {
    provider::THINK_MODEL.to_string()
}

fn default_voice() -> String {
    provider::DEFAULT_VOICE.to_string()
}

fn default_fallback_voice() -> String {
    provider::FALLBACK_VOICE.to_string()
}

fn default_encoding() -> String {
    provider::ENCODING.to_string()
}

fn default_output_sample_rate() -> u32 {
    audio::OUTPUT_SAMPLE_RATE
}

fn default_keepalive_interval_ms() -> u64 {
    provider::KEEPALIVE_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: default_provider_url(),
            listen_model: default_listen_model(),
            think_provider: default_think_provider(),
            think_model: default_think_model(),
            default_voice: default_voice(),
            fallback_voice: default_fallback_voice(),
            greeting_enabled: true,
            encoding: default_encoding(),
            output_sample_rate: default_output_sample_rate(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
        }
    }
}

impl ProviderConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Capture and playback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Canonical capture sample rate (Hz)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_frame_duration_ms")]
    pub frame_duration_ms: u64,

    /// Microphone retries after the first attempt
    #[serde(default = "default_mic_retries")]
    pub mic_retries: u32,

    #[serde(default = "default_mic_backoff_ms")]
    pub mic_backoff_ms: u64,

    #[serde(default = "default_playback_epsilon_ms")]
    pub playback_epsilon_ms: u64,

    #[serde(default = "default_capture_channel_capacity")]
    pub capture_channel_capacity: usize,
}

fn default_sample_rate() -> u32 {
    audio::CAPTURE_SAMPLE_RATE
}

fn default_frame_duration_ms() -> u64 {
    audio::FRAME_DURATION_MS
}

fn default_mic_retries() -> u32 {
    audio::MIC_RETRIES
}

fn default_mic_backoff_ms() -> u64 {
    audio::MIC_BACKOFF_MS
}

fn default_playback_epsilon_ms() -> u64 {
    audio::PLAYBACK_EPSILON_MS
}

fn default_capture_channel_capacity() -> usize {
    audio::CAPTURE_CHANNEL_CAPACITY
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            frame_duration_ms: default_frame_duration_ms(),
            mic_retries: default_mic_retries(),
            mic_backoff_ms: default_mic_backoff_ms(),
            playback_epsilon_ms: default_playback_epsilon_ms(),
            capture_channel_capacity: default_capture_channel_capacity(),
        }
    }
}

impl AudioConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    pub fn mic_backoff(&self) -> Duration {
        Duration::from_millis(self.mic_backoff_ms)
    }

    pub fn playback_epsilon(&self) -> Duration {
        Duration::from_millis(self.playback_epsilon_ms)
    }
}

/// Session connection timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_speech_watchdog_ms")]
    pub speech_watchdog_ms: u64,

    #[serde(default = "default_reconfigure_min_interval_ms")]
    pub reconfigure_min_interval_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_speech_watchdog_ms() -> u64 {
    session::SPEECH_WATCHDOG_MS
}

fn default_reconfigure_min_interval_ms() -> u64 {
    session::RECONFIGURE_MIN_INTERVAL_MS
}

fn default_handshake_timeout_ms() -> u64 {
    session::HANDSHAKE_TIMEOUT_MS
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            speech_watchdog_ms: default_speech_watchdog_ms(),
            reconfigure_min_interval_ms: default_reconfigure_min_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl SessionConfig {
    pub fn speech_watchdog(&self) -> Duration {
        Duration::from_millis(self.speech_watchdog_ms)
    }

    pub fn reconfigure_min_interval(&self) -> Duration {
        Duration::from_millis(self.reconfigure_min_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before attempt `n` is `base_delay_ms * 2^n`
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    reconnect::MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    reconnect::BASE_DELAY_MS
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Termination guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Polls are ignored until the call is at least this old
    #[serde(default = "default_min_call_age_ms")]
    pub min_call_age_ms: u64,

    /// A second positive signal must arrive within this window
    #[serde(default = "default_confirm_window_ms")]
    pub confirm_window_ms: u64,

    /// Delay between confirmation and ending the call
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Instruction injected so the agent can wind down politely
    #[serde(default = "default_wind_down_message")]
    pub wind_down_message: String,
}

fn default_poll_interval_ms() -> u64 {
    termination::POLL_INTERVAL_MS
}

fn default_min_call_age_ms() -> u64 {
    termination::MIN_CALL_AGE_MS
}

fn default_confirm_window_ms() -> u64 {
    termination::CONFIRM_WINDOW_MS
}

fn default_grace_period_ms() -> u64 {
    termination::GRACE_PERIOD_MS
}

fn default_wind_down_message() -> String {
    termination::WIND_DOWN_MESSAGE.to_string()
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_poll_interval_ms(),
            min_call_age_ms: default_min_call_age_ms(),
            confirm_window_ms: default_confirm_window_ms(),
            grace_period_ms: default_grace_period_ms(),
            wind_down_message: default_wind_down_message(),
        }
    }
}

impl TerminationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn min_call_age(&self) -> Duration {
        Duration::from_millis(self.min_call_age_ms)
    }

    pub fn confirm_window(&self) -> Duration {
        Duration::from_millis(self.confirm_window_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Credential endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// HTTP endpoint returning `{ "token": ..., "expires_in": ... }`
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Static token, used when no endpoint is configured
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    credentials::REQUEST_TIMEOUT_MS
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl CredentialsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,

    /// Record call metrics through the `metrics` facade
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    observability::LOG_LEVEL.to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

/// Load settings from `config/` in the working directory
///
/// Sources, later ones overriding earlier ones: `config/default`,
/// `config/{env}`, then `VOICE_CLIENT__SECTION__FIELD` environment variables.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    load_settings_from(Path::new("config"), env)
}

/// Load settings from an explicit configuration directory
pub fn load_settings_from(dir: &Path, env: Option<&str>) -> Result<Settings, ConfigError> {
    if dir.exists() && !dir.is_dir() {
        return Err(ConfigError::FileNotFound(dir.display().to_string()));
    }

    let mut builder = Config::builder();

    // Load default config
    let default_path = dir.join("default");
    builder = builder.add_source(File::with_name(&default_path.to_string_lossy()).required(false));

    // Load environment-specific config
    if let Some(env_name) = env {
        let env_path = dir.join(env_name);
        builder = builder.add_source(File::with_name(&env_path.to_string_lossy()).required(false));
    }

    // Load from environment variables
    builder = builder.add_source(
        Environment::with_prefix("VOICE_CLIENT")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.audio.sample_rate, 16_000);
        assert_eq!(settings.provider.output_sample_rate, 24_000);
        assert_eq!(settings.reconnect.max_attempts, 3);
        assert_eq!(settings.termination.grace_period(), Duration::from_secs(8));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_frame_duration_bounds() {
        let mut settings = Settings::default();
        settings.audio.frame_duration_ms = 5;
        assert!(settings.validate().is_err());

        settings.audio.frame_duration_ms = 40;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_timers_rejected() {
        let mut settings = Settings::default();
        settings.termination.confirm_window_ms = 0;
        match settings.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "termination.confirm_window_ms")
            },
            other => panic!("expected InvalidValue, got {other:?}"),
        }

        let mut settings = Settings::default();
        settings.reconnect.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_provider_url_scheme() {
        let mut settings = Settings::default();
        settings.provider.url = "https://example.com".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_directory_with_env_overlay() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[provider]\ndefault_voice = \"aura-2-orion-en\"\n\n[termination]\ngrace_period_ms = 4000\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("staging.toml"),
            "[termination]\ngrace_period_ms = 2000\n",
        )
        .unwrap();

        let settings = load_settings_from(dir.path(), Some("staging")).unwrap();
        assert_eq!(settings.provider.default_voice, "aura-2-orion-en");
        assert_eq!(settings.termination.grace_period_ms, 2000);
        assert_eq!(settings.audio.frame_duration_ms, 20);
    }

    #[test]
    fn test_invalid_file_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("default.toml"), "[audio]\nsample_rate = 11025\n").unwrap();

        let err = load_settings_from(dir.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_missing_directory_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("absent"), None).unwrap();
        assert_eq!(settings.session.speech_watchdog_ms, 6_000);
    }
}

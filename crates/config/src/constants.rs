//! Centralized defaults for the voice call client
//!
//! Every `Settings` default comes from here so the loader, the validation
//! bounds, and the tests agree on one set of numbers.

/// Audio format and capture
pub mod audio {
    /// Canonical capture rate sent to the provider (Hz)
    pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

    /// Rate of synthesized audio coming back from the provider (Hz)
    pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

    /// Duration of each capture frame forwarded to the transport
    pub const FRAME_DURATION_MS: u64 = 20;

    /// Accepted frame durations
    pub const MIN_FRAME_DURATION_MS: u64 = 10;
    pub const MAX_FRAME_DURATION_MS: u64 = 100;

    /// Microphone acquisition retries after the first attempt
    pub const MIC_RETRIES: u32 = 2;

    /// Fixed delay between microphone attempts
    pub const MIC_BACKOFF_MS: u64 = 500;

    /// Lead time added to the device clock when the playback queue is idle
    pub const PLAYBACK_EPSILON_MS: u64 = 10;

    /// Capacity of the capture channel into the event loop (frames)
    pub const CAPTURE_CHANNEL_CAPACITY: usize = 64;
}

/// Voice-agent provider
pub mod provider {
    pub const URL: &str = "wss://agent.deepgram.com/v1/agent/converse";
    pub const LISTEN_MODEL: &str = "nova-3";
    pub const THINK_PROVIDER: &str = "open_ai";
    pub const THINK_MODEL: &str = "gpt-4o-mini";
    pub const DEFAULT_VOICE: &str = "aura-2-thalia-en";

    /// Voice substituted when the configured one never produces speech
    pub const FALLBACK_VOICE: &str = "aura-2-thalia-en";

    pub const ENCODING: &str = "linear16";
    pub const KEEPALIVE_INTERVAL_MS: u64 = 8_000;
}

/// Session connection timers
pub mod session {
    /// Time allowed for the first agent speech after settings are applied
    pub const SPEECH_WATCHDOG_MS: u64 = 6_000;

    /// Minimum spacing between reconfiguration messages
    pub const RECONFIGURE_MIN_INTERVAL_MS: u64 = 1_000;

    /// Time allowed between opening the transport and the settings ack
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
}

/// Controller reconnect policy
pub mod reconnect {
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BASE_DELAY_MS: u64 = 1_000;
}

/// Termination guard
pub mod termination {
    pub const POLL_INTERVAL_MS: u64 = 5_000;
    pub const MIN_CALL_AGE_MS: u64 = 30_000;
    pub const CONFIRM_WINDOW_MS: u64 = 20_000;
    pub const GRACE_PERIOD_MS: u64 = 8_000;
    pub const WIND_DOWN_MESSAGE: &str =
        "The caller needs to go. Thank them briefly and say goodbye.";
}

/// Credential endpoint
pub mod credentials {
    pub const REQUEST_TIMEOUT_MS: u64 = 5_000;
}

/// Observability defaults
pub mod observability {
    pub const LOG_LEVEL: &str = "info";
}

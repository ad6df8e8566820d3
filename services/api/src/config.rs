use parley_core::AlgoOptions;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Which media kinds a session carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Modality {
    Audio,
    Video,
    AudioVideo,
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "audio" => Ok(Modality::Audio),
            "video" => Ok(Modality::Video),
            "audio-video" => Ok(Modality::AudioVideo),
            other => Err(format!("'{other}' is not one of audio, video, audio-video")),
        }
    }
}

/// Direction of media flow, from the client's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Client sends media; the server only returns side outputs.
    Send,
    /// The server streams media to the client.
    Receive,
    SendReceive,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "send" => Ok(Mode::Send),
            "receive" => Ok(Mode::Receive),
            "send-receive" => Ok(Mode::SendReceive),
            other => Err(format!("'{other}' is not one of send, receive, send-receive")),
        }
    }
}

/// Session-level settings used by the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub modality: Modality,
    pub mode: Mode,
    /// `None` means unlimited.
    pub concurrency_limit: Option<usize>,
    /// Hard cap on a connected session's lifetime.
    pub time_limit: Option<Duration>,
    /// How long a session may take to reach `Connected`.
    pub connection_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modality: Modality::Audio,
            mode: Mode::SendReceive,
            concurrency_limit: None,
            time_limit: None,
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub session: SessionConfig,
    pub can_interrupt: bool,
    pub algo_options: AlgoOptions,
    /// Reference RMS level of the built-in energy speech model.
    pub vad_rms_threshold: f32,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_optional_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        _ => Ok(None),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let modality = parse_var("PARLEY_MODALITY", Modality::Audio)?;
        let mode = parse_var("PARLEY_MODE", Mode::SendReceive)?;
        let concurrency_limit = parse_optional_var::<usize>("CONCURRENCY_LIMIT")?;
        if concurrency_limit == Some(0) {
            return Err(ConfigError::InvalidValue(
                "CONCURRENCY_LIMIT".to_string(),
                "must be at least 1 (leave unset for unlimited)".to_string(),
            ));
        }
        let time_limit = parse_optional_var::<f64>("TIME_LIMIT_SECS")?
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|e| {
                    ConfigError::InvalidValue("TIME_LIMIT_SECS".to_string(), e.to_string())
                })
            })
            .transpose()?;
        let connection_timeout = Duration::from_secs(parse_var("CONNECTION_TIMEOUT_SECS", 30u64)?);
        let can_interrupt = parse_var("CAN_INTERRUPT", true)?;

        let defaults = AlgoOptions::default();
        let algo_options = AlgoOptions {
            audio_chunk_duration: parse_var("AUDIO_CHUNK_DURATION", defaults.audio_chunk_duration)?,
            started_talking_threshold: parse_var(
                "STARTED_TALKING_THRESHOLD",
                defaults.started_talking_threshold,
            )?,
            speech_threshold: parse_var("SPEECH_THRESHOLD", defaults.speech_threshold)?,
        };
        algo_options.validate().map_err(|e| {
            ConfigError::InvalidValue("SPEECH_THRESHOLD".to_string(), e.to_string())
        })?;
        let vad_rms_threshold = parse_var("VAD_RMS_THRESHOLD", 0.02f32)?;

        Ok(Self {
            bind_address,
            log_level,
            session: SessionConfig {
                modality,
                mode,
                concurrency_limit,
                time_limit,
                connection_timeout,
            },
            can_interrupt,
            algo_options,
            vad_rms_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: &[&str] = &[
        "BIND_ADDRESS",
        "RUST_LOG",
        "PARLEY_MODALITY",
        "PARLEY_MODE",
        "CONCURRENCY_LIMIT",
        "TIME_LIMIT_SECS",
        "CONNECTION_TIMEOUT_SECS",
        "CAN_INTERRUPT",
        "AUDIO_CHUNK_DURATION",
        "STARTED_TALKING_THRESHOLD",
        "SPEECH_THRESHOLD",
        "VAD_RMS_THRESHOLD",
    ];

    fn clear_env_vars() {
        unsafe {
            for var in VARS {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_config_error_display() {
        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    fn test_modality_and_mode_parsing() {
        assert_eq!("audio".parse::<Modality>(), Ok(Modality::Audio));
        assert_eq!("Audio-Video".parse::<Modality>(), Ok(Modality::AudioVideo));
        assert!("text".parse::<Modality>().is_err());
        assert_eq!("send-receive".parse::<Mode>(), Ok(Mode::SendReceive));
        assert_eq!("receive".parse::<Mode>(), Ok(Mode::Receive));
        assert!("both".parse::<Mode>().is_err());
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        clear_env_vars();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:3000");
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.session, SessionConfig::default());
        assert!(config.can_interrupt);
        assert_eq!(config.algo_options, AlgoOptions::default());
        assert_eq!(config.vad_rms_threshold, 0.02);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:8080");
            env::set_var("RUST_LOG", "debug");
            env::set_var("PARLEY_MODALITY", "audio-video");
            env::set_var("PARLEY_MODE", "send");
            env::set_var("CONCURRENCY_LIMIT", "4");
            env::set_var("TIME_LIMIT_SECS", "90.5");
            env::set_var("CONNECTION_TIMEOUT_SECS", "10");
            env::set_var("CAN_INTERRUPT", "false");
            env::set_var("AUDIO_CHUNK_DURATION", "0.5");
            env::set_var("STARTED_TALKING_THRESHOLD", "0.3");
            env::set_var("SPEECH_THRESHOLD", "0.2");
            env::set_var("VAD_RMS_THRESHOLD", "0.05");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:8080");
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.session.modality, Modality::AudioVideo);
        assert_eq!(config.session.mode, Mode::Send);
        assert_eq!(config.session.concurrency_limit, Some(4));
        assert_eq!(
            config.session.time_limit,
            Some(Duration::from_secs_f64(90.5))
        );
        assert_eq!(config.session.connection_timeout, Duration::from_secs(10));
        assert!(!config.can_interrupt);
        assert_eq!(config.algo_options.audio_chunk_duration, 0.5);
        assert_eq!(config.algo_options.started_talking_threshold, 0.3);
        assert_eq!(config.algo_options.speech_threshold, 0.2);
        assert_eq!(config.vad_rms_threshold, 0.05);
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_invalid_bind_address() {
        clear_env_vars();
        unsafe {
            env::set_var("BIND_ADDRESS", "not-a-valid-address");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "BIND_ADDRESS"),
            _ => panic!("Expected InvalidValue for BIND_ADDRESS"),
        }
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_rejects_zero_concurrency_limit() {
        clear_env_vars();
        unsafe {
            env::set_var("CONCURRENCY_LIMIT", "0");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "CONCURRENCY_LIMIT"),
            _ => panic!("Expected InvalidValue for CONCURRENCY_LIMIT"),
        }
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_rejects_inverted_thresholds() {
        clear_env_vars();
        unsafe {
            env::set_var("STARTED_TALKING_THRESHOLD", "0.1");
            env::set_var("SPEECH_THRESHOLD", "0.3");
        }

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(..)));
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_invalid_modality() {
        clear_env_vars();
        unsafe {
            env::set_var("PARLEY_MODALITY", "hologram");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, msg) => {
                assert_eq!(var, "PARLEY_MODALITY");
                assert!(msg.contains("hologram"));
            }
            _ => panic!("Expected InvalidValue for PARLEY_MODALITY"),
        }
        clear_env_vars();
    }
}

//! Server settings, read from the environment.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::modules::ingest::sniffer::{HeaderSniffer, EBML_SIGNATURE};
use crate::modules::ingest::transcoder::{EncodingProfile, TranscodeSettings, DESTINATION_PLACEHOLDER};
use crate::modules::ingest::SessionConfig;
use crate::modules::server::VIDEOS_PATH;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Idle check interval {interval:?} must be shorter than the idle timeout {timeout:?}")]
    WatchdogCadence { interval: Duration, timeout: Duration },

    #[error("TLS_CERT_PATH is set but TLS_KEY_PATH is not")]
    MissingTlsKey,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub port: u16,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    /// Request path upgraded to the publisher WebSocket
    pub ingest_path: String,
    pub static_dir: PathBuf,
    pub video_cache_path: PathBuf,
    pub session: SessionConfig,
}

impl RelaySettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from any variable source; unset variables take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let tls_cert_path = vars.string("TLS_CERT_PATH");
        let tls_key_path = vars.string("TLS_KEY_PATH");
        if tls_cert_path.is_some() && tls_key_path.is_none() {
            return Err(SettingsError::MissingTlsKey);
        }

        let idle_timeout = Duration::from_secs(vars.parse("IDLE_TIMEOUT_SECS", 10u64)?);
        let idle_check_interval =
            Duration::from_millis(vars.parse("IDLE_CHECK_INTERVAL_MS", 1000u64)?);
        if idle_check_interval.is_zero() || idle_check_interval >= idle_timeout {
            return Err(SettingsError::WatchdogCadence {
                interval: idle_check_interval,
                timeout: idle_timeout,
            });
        }

        let signature = match vars.string("CONTAINER_SIGNATURE") {
            Some(raw) => decode_signature(&raw)?,
            None => EBML_SIGNATURE.to_vec(),
        };

        let session = SessionConfig {
            destination_prefix: vars.string_or("DESTINATION_PREFIX", "/live2/"),
            sniffer: HeaderSniffer::new(signature),
            idle_timeout,
            idle_check_interval,
            handshake_timeout: Duration::from_secs(vars.parse("HANDSHAKE_TIMEOUT_SECS", 30u64)?),
            transcode: transcode_settings(&vars)?,
        };

        let ingest_path = vars.string_or("INGEST_PATH", "/ingest");
        if !ingest_path.starts_with('/') || ingest_path == VIDEOS_PATH {
            return Err(SettingsError::Invalid {
                var: "INGEST_PATH",
                value: ingest_path,
                reason: format!("must start with / and differ from {}", VIDEOS_PATH),
            });
        }

        Ok(RelaySettings {
            port: vars.parse("PORT", 8080u16)?,
            tls_cert_path,
            tls_key_path,
            ingest_path,
            static_dir: PathBuf::from(vars.string_or("STATIC_DIR", "static")),
            video_cache_path: PathBuf::from(vars.string_or("VIDEO_CACHE_PATH", "video_cache.json")),
            session,
        })
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some()
    }
}

fn transcode_settings(vars: &Vars<'_>) -> Result<TranscodeSettings, SettingsError> {
    let defaults = EncodingProfile::default();
    let profile = EncodingProfile {
        input_format: vars.string_or("TRANSCODER_INPUT_FORMAT", &defaults.input_format),
        frame_rate: vars.parse("FRAME_RATE", defaults.frame_rate)?,
        gop_size: vars.parse("GOP_SIZE", defaults.gop_size)?,
        video_bitrate: vars.string_or("VIDEO_BITRATE", &defaults.video_bitrate),
        video_maxrate: vars.string_or("VIDEO_MAXRATE", &defaults.video_maxrate),
        video_bufsize: vars.string_or("VIDEO_BUFSIZE", &defaults.video_bufsize),
        audio_bitrate: vars.string_or("AUDIO_BITRATE", &defaults.audio_bitrate),
        audio_sample_rate: vars.parse("AUDIO_SAMPLE_RATE", defaults.audio_sample_rate)?,
    };

    let args = match vars.string("TRANSCODER_ARGS") {
        Some(raw) => {
            if !raw.contains(DESTINATION_PLACEHOLDER) {
                return Err(SettingsError::Invalid {
                    var: "TRANSCODER_ARGS",
                    value: raw,
                    reason: format!("must contain {}", DESTINATION_PLACEHOLDER),
                });
            }
            raw.split_whitespace().map(str::to_string).collect()
        }
        None => profile.ffmpeg_args(),
    };

    Ok(TranscodeSettings {
        program: vars.string_or("TRANSCODER_PATH", "ffmpeg"),
        args,
        stop_grace: Duration::from_millis(vars.parse("STOP_GRACE_MS", 2000u64)?),
        write_timeout: Duration::from_millis(vars.parse("WRITE_TIMEOUT_MS", 5000u64)?),
    })
}

fn decode_signature(raw: &str) -> Result<Vec<u8>, SettingsError> {
    let invalid = |reason: String| SettingsError::Invalid {
        var: "CONTAINER_SIGNATURE",
        value: raw.to_string(),
        reason,
    };
    let bytes = hex::decode(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    if bytes.is_empty() {
        return Err(invalid("signature is empty".to_string()));
    }
    Ok(bytes)
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn string_or(&self, name: &str, default: &str) -> String {
        self.string(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, SettingsError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.string(name) {
            None => Ok(default),
            Some(raw) => raw.trim().parse::<T>().map_err(|e| SettingsError::Invalid {
                var: name,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

use std::env;

/// Top-level, environment-variable-driven configuration.
///
/// Every field has a default; nothing is required. `Config::from_env` loads
/// an optional `.env` file (via `dotenvy`) before reading `std::env`, so a
/// deployment can either export real environment variables or drop a
/// `.env` file next to the binary.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub http: HttpConfig,
    pub rtc: RtcConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    /// `host:port` the signaling HTTP server binds to.
    pub local_server_location: String,
    /// Serve demo static assets at `/` and `/static/*`.
    pub local_htmlserver_enabled: bool,
    /// TLS is enabled iff both cert and key are set.
    pub tls_cert_file_location: Option<String>,
    pub tls_key_file_location: Option<String>,
}

impl HttpConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_file_location.is_some() && self.tls_key_file_location.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RtcConfig {
    pub disconnect_timeout_seconds: u64,
    pub failed_timeout_seconds: u64,
    pub keepalive_interval_seconds: u64,
    pub video_tracks_receive_port: u16,
    pub audio_tracks_receive_port: u16,
    pub receive_rtp_buffsize: u16,
    pub video_codec: String,
    pub audio_codec: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub ephemeral_udp_port_range: PortRange,
    /// Public IPs announced as 1:1 NAT host candidates. Empty disables the feature.
    pub nat_1to1_ips: Vec<String>,
}

fn default_http_local_server_location() -> String {
    "0.0.0.0:7000".to_string()
}
fn default_rtc_disconnect_timeout_seconds() -> u64 {
    5
}
fn default_rtc_failed_timeout_seconds() -> u64 {
    25
}
fn default_rtc_keepalive_interval_seconds() -> u64 {
    2
}
fn default_video_port() -> u16 {
    4000
}
fn default_audio_port() -> u16 {
    4002
}
fn default_rtp_buffsize() -> u16 {
    1500
}
fn default_video_codec() -> String {
    "video/H264".to_string()
}
fn default_audio_codec() -> String {
    "audio/opus".to_string()
}
fn default_port_range() -> PortRange {
    PortRange {
        min: 10000,
        max: 20000,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig {
                local_server_location: default_http_local_server_location(),
                local_htmlserver_enabled: true,
                tls_cert_file_location: None,
                tls_key_file_location: None,
            },
            rtc: RtcConfig {
                disconnect_timeout_seconds: default_rtc_disconnect_timeout_seconds(),
                failed_timeout_seconds: default_rtc_failed_timeout_seconds(),
                keepalive_interval_seconds: default_rtc_keepalive_interval_seconds(),
                video_tracks_receive_port: default_video_port(),
                audio_tracks_receive_port: default_audio_port(),
                receive_rtp_buffsize: default_rtp_buffsize(),
                video_codec: default_video_codec(),
                audio_codec: default_audio_codec(),
            },
            server: ServerConfig {
                ephemeral_udp_port_range: default_port_range(),
                nat_1to1_ips: Vec::new(),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: expected a boolean (true/false), got '{value}'")]
    InvalidBool { key: &'static str, value: String },
    #[error("{key}: expected an unsigned integer, got '{value}'")]
    InvalidUint { key: &'static str, value: String },
    #[error("{key}: port range must be 'MIN-MAX', got '{value}'")]
    InvalidPortRange { key: &'static str, value: String },
}

fn env_string(key: &'static str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => match value.to_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(ConfigError::InvalidBool { key, value }),
        },
    }
}

fn env_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidUint { key, value }),
    }
}

fn env_u16(key: &'static str, default: u16) -> Result<u16, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidUint { key, value }),
    }
}

fn env_port_range(key: &'static str, default: PortRange) -> Result<PortRange, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => {
            let (min_str, max_str) = value
                .split_once('-')
                .ok_or_else(|| ConfigError::InvalidPortRange {
                    key,
                    value: value.clone(),
                })?;
            let min: u16 = min_str
                .parse()
                .map_err(|_| ConfigError::InvalidPortRange {
                    key,
                    value: value.clone(),
                })?;
            let max: u16 = max_str
                .parse()
                .map_err(|_| ConfigError::InvalidPortRange {
                    key,
                    value: value.clone(),
                })?;
            // Reversed ranges are normalized, not rejected.
            if min > max {
                Ok(PortRange { min: max, max: min })
            } else {
                Ok(PortRange { min, max })
            }
        }
    }
}

fn env_ip_list(key: &'static str) -> Vec<String> {
    match env::var(key) {
        Err(_) => Vec::new(),
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                trimmed.split(',').map(|s| s.trim().to_string()).collect()
            }
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

impl Config {
    /// Load configuration from the process environment, loading an optional
    /// `.env` file first. Missing `.env` is not an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_current_env()
    }

    /// Like `from_env` but never touches `.env` — used by tests that
    /// manipulate `std::env` directly.
    fn from_current_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let tls_cert = env::var("HTTP_TLS_CERT_FILE_LOCATION")
            .ok()
            .and_then(non_empty);
        let tls_key = env::var("HTTP_TLS_KEY_FILE_LOCATION")
            .ok()
            .and_then(non_empty);

        Ok(Config {
            http: HttpConfig {
                local_server_location: env_string(
                    "HTTP_LOCAL_SERVER_LOCATION",
                    defaults.http.local_server_location,
                ),
                local_htmlserver_enabled: env_bool(
                    "HTTP_LOCAL_HTMLSERVER_ENABLED",
                    defaults.http.local_htmlserver_enabled,
                )?,
                tls_cert_file_location: tls_cert,
                tls_key_file_location: tls_key,
            },
            rtc: RtcConfig {
                disconnect_timeout_seconds: env_u64(
                    "RTC_DISCONNECT_TIMEOUT_SECONDS",
                    defaults.rtc.disconnect_timeout_seconds,
                )?,
                failed_timeout_seconds: env_u64(
                    "RTC_FAILED_TIMEOUT_SECONDS",
                    defaults.rtc.failed_timeout_seconds,
                )?,
                keepalive_interval_seconds: env_u64(
                    "RTC_KEEPALIVE_INTERVAL_SECONDS",
                    defaults.rtc.keepalive_interval_seconds,
                )?,
                video_tracks_receive_port: env_u16(
                    "RTC_VIDEO_TRACKS_RECEIVE_PORT",
                    defaults.rtc.video_tracks_receive_port,
                )?,
                audio_tracks_receive_port: env_u16(
                    "RTC_AUDIO_TRACKS_RECEIVE_PORT",
                    defaults.rtc.audio_tracks_receive_port,
                )?,
                receive_rtp_buffsize: env_u16(
                    "RTC_RECEIVE_RTP_BUFFSIZE",
                    defaults.rtc.receive_rtp_buffsize,
                )?,
                video_codec: env_string("RTC_VIDEO_CODEC", defaults.rtc.video_codec),
                audio_codec: env_string("RTC_AUDIO_CODEC", defaults.rtc.audio_codec),
            },
            server: ServerConfig {
                ephemeral_udp_port_range: env_port_range(
                    "SERVER_EPHEMERAL_UDP_PORT_RANGE",
                    defaults.server.ephemeral_udp_port_range,
                )?,
                nat_1to1_ips: env_ip_list("SERVER_NAT_1TO1_IPS"),
            },
        })
    }

    /// Validate the configuration, returning a list of issues found.
    /// Issues are prefixed "ERROR:" (fatal) or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.rtc.receive_rtp_buffsize < 1500 {
            issues.push(format!(
                "WARNING: rtc.receive_rtp_buffsize is {} bytes, below the 1500-byte UDP MTU. \
                 Larger RTP packets will be truncated.",
                self.rtc.receive_rtp_buffsize
            ));
        }

        if self.rtc.video_tracks_receive_port == self.rtc.audio_tracks_receive_port {
            issues.push(format!(
                "ERROR: rtc.video_tracks_receive_port and rtc.audio_tracks_receive_port \
                 are both {}; they must be distinct UDP ports.",
                self.rtc.video_tracks_receive_port
            ));
        }

        if !self.rtc.video_codec.contains('/') {
            issues.push(format!(
                "ERROR: rtc.video_codec '{}' is not a MIME type (expected e.g. 'video/H264').",
                self.rtc.video_codec
            ));
        }
        if !self.rtc.audio_codec.contains('/') {
            issues.push(format!(
                "ERROR: rtc.audio_codec '{}' is not a MIME type (expected e.g. 'audio/opus').",
                self.rtc.audio_codec
            ));
        }

        if self.server.ephemeral_udp_port_range.min == self.server.ephemeral_udp_port_range.max {
            issues.push(
                "WARNING: server.ephemeral_udp_port_range spans a single port; \
                 concurrent peer connections will starve for media ports."
                    .to_string(),
            );
        }

        for ip in &self.server.nat_1to1_ips {
            if ip.parse::<std::net::IpAddr>().is_err() {
                issues.push(format!(
                    "ERROR: server.nat_1to1_ips entry '{ip}' is not a valid IP address."
                ));
            }
        }

        match (&self.http.tls_cert_file_location, &self.http.tls_key_file_location) {
            (Some(_), None) => issues.push(
                "WARNING: HTTP_TLS_CERT_FILE_LOCATION is set but HTTP_TLS_KEY_FILE_LOCATION is \
                 not. TLS stays disabled until both are set."
                    .to_string(),
            ),
            (None, Some(_)) => issues.push(
                "WARNING: HTTP_TLS_KEY_FILE_LOCATION is set but HTTP_TLS_CERT_FILE_LOCATION is \
                 not. TLS stays disabled until both are set."
                    .to_string(),
            ),
            _ => {}
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    /// `std::env` is process-global; serialize tests that mutate it.
    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    const ENV_KEYS: &[&str] = &[
        "HTTP_LOCAL_SERVER_LOCATION",
        "HTTP_LOCAL_HTMLSERVER_ENABLED",
        "HTTP_TLS_CERT_FILE_LOCATION",
        "HTTP_TLS_KEY_FILE_LOCATION",
        "RTC_DISCONNECT_TIMEOUT_SECONDS",
        "RTC_FAILED_TIMEOUT_SECONDS",
        "RTC_KEEPALIVE_INTERVAL_SECONDS",
        "RTC_VIDEO_TRACKS_RECEIVE_PORT",
        "RTC_AUDIO_TRACKS_RECEIVE_PORT",
        "RTC_RECEIVE_RTP_BUFFSIZE",
        "RTC_VIDEO_CODEC",
        "RTC_AUDIO_CODEC",
        "SERVER_EPHEMERAL_UDP_PORT_RANGE",
        "SERVER_NAT_1TO1_IPS",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_with_no_env_vars_set() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        let config = Config::from_current_env().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.http.local_server_location, "0.0.0.0:7000");
        assert!(config.http.local_htmlserver_enabled);
        assert!(!config.http.tls_enabled());
        assert_eq!(config.rtc.disconnect_timeout_seconds, 5);
        assert_eq!(config.rtc.failed_timeout_seconds, 25);
        assert_eq!(config.rtc.keepalive_interval_seconds, 2);
        assert_eq!(config.rtc.video_tracks_receive_port, 4000);
        assert_eq!(config.rtc.audio_tracks_receive_port, 4002);
        assert_eq!(config.rtc.receive_rtp_buffsize, 1500);
        assert_eq!(config.rtc.video_codec, "video/H264");
        assert_eq!(config.rtc.audio_codec, "audio/opus");
        assert_eq!(
            config.server.ephemeral_udp_port_range,
            PortRange {
                min: 10000,
                max: 20000
            }
        );
        assert!(config.server.nat_1to1_ips.is_empty());
    }

    #[test]
    fn tls_enabled_requires_both_paths() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        unsafe { env::set_var("HTTP_TLS_CERT_FILE_LOCATION", "/etc/rivulet/cert.pem") };
        let config = Config::from_current_env().unwrap();
        assert!(!config.http.tls_enabled());

        unsafe { env::set_var("HTTP_TLS_KEY_FILE_LOCATION", "/etc/rivulet/key.pem") };
        let config = Config::from_current_env().unwrap();
        assert!(config.http.tls_enabled());
        clear_env();
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        unsafe { env::set_var("HTTP_LOCAL_HTMLSERVER_ENABLED", "yes") };
        let err = Config::from_current_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));
        clear_env();
    }

    #[test]
    fn reversed_port_range_is_normalized() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        unsafe { env::set_var("SERVER_EPHEMERAL_UDP_PORT_RANGE", "20000-10000") };
        let config = Config::from_current_env().unwrap();
        assert_eq!(
            config.server.ephemeral_udp_port_range,
            PortRange {
                min: 10000,
                max: 20000
            }
        );
        clear_env();
    }

    #[test]
    fn malformed_port_range_is_rejected() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        unsafe { env::set_var("SERVER_EPHEMERAL_UDP_PORT_RANGE", "not-a-range") };
        let err = Config::from_current_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPortRange { .. }));
        clear_env();
    }

    #[test]
    fn empty_nat_ips_disables_feature() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        unsafe { env::set_var("SERVER_NAT_1TO1_IPS", "") };
        let config = Config::from_current_env().unwrap();
        assert!(config.server.nat_1to1_ips.is_empty());
        clear_env();
    }

    #[test]
    fn nat_ips_are_split_and_trimmed() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        unsafe { env::set_var("SERVER_NAT_1TO1_IPS", "203.0.113.5, 203.0.113.6") };
        let config = Config::from_current_env().unwrap();
        assert_eq!(config.server.nat_1to1_ips, vec!["203.0.113.5", "203.0.113.6"]);
        clear_env();
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_same_ingress_ports_is_error() {
        let mut config = Config::default();
        config.rtc.audio_tracks_receive_port = config.rtc.video_tracks_receive_port;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_codec_without_slash_is_error() {
        let mut config = Config::default();
        config.rtc.video_codec = "H264".to_string();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("video_codec")));
    }

    #[test]
    fn validate_bad_nat_ip_is_error() {
        let mut config = Config::default();
        config.server.nat_1to1_ips = vec!["not-an-ip".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("nat_1to1_ips")));
    }

    #[test]
    fn validate_small_rtp_buffer_is_warning_only() {
        let mut config = Config::default();
        config.rtc.receive_rtp_buffsize = 512;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().all(|i| i.starts_with("WARNING:")));
    }
}

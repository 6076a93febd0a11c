//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides,
//! matching the §6 env-var table: every field has a default, an optional
//! `CONFIG_FILE` layers under it, and environment variables win last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use dispatch_core::bootstrap::{EngineConfig, ObjectStoreConfig, SttConfig};
use dispatch_core::audio_store::{PrunerConfig, ReconcilerConfig, UploaderConfig};
use dispatch_core::handlers::RawArchivePolicy;
use dispatch_core::ingest::mqtt::MqttConfig;
use dispatch_core::ingest::watch::WatchConfig;
use dispatch_core::transcription::TranscriptionConfig;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Postgres DSN. Override: `DATABASE_URL`. Required; left empty here so
    /// `EngineConfig` validation (not this struct) is the single place that
    /// rejects a missing value.
    pub database_url: String,
    /// Override: `DATABASE_MAX_CONNECTIONS`
    pub database_max_connections: u32,
    /// Override: `MERGE_P25_SYSTEMS`
    pub merge_p25_systems: bool,

    /// Override: `AUDIO_DIR`
    pub audio_dir: PathBuf,
    /// External recorder's audio root, used only for path resolution hints.
    /// Override: `TR_AUDIO_DIR`
    pub tr_audio_dir: Option<PathBuf>,

    /// Override: `MQTT_BROKER_URL`
    pub mqtt_broker_url: Option<String>,
    /// Override: `MQTT_TOPICS`
    pub mqtt_topics: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,

    /// Override: `WATCH_DIR`
    pub watch_dir: Option<PathBuf>,
    pub watch_instance_id: String,
    pub watch_backfill_days: u32,

    /// Override: `UPLOAD_INSTANCE_ID`
    pub upload_instance_id: String,

    /// Optional auto-discovery root, currently informational only.
    pub tr_dir: Option<PathBuf>,

    /// Override: `HTTP_ADDR`
    pub http_addr: String,
    pub http_read_timeout_secs: u64,
    pub http_write_timeout_secs: u64,
    pub http_idle_timeout_secs: u64,

    pub auth_enabled: bool,
    pub auth_token: Option<String>,
    pub write_token: Option<String>,

    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,

    /// Comma-separated list of allowed CORS origins, or `*`.
    pub cors_origins: String,

    /// Override: `LOG_LEVEL`
    pub log_level: String,

    pub stt_provider: String,
    pub whisper_url: Option<String>,
    pub elevenlabs_url: Option<String>,
    pub transcribe_workers: usize,
    pub transcribe_queue_size: usize,
    pub transcribe_min_duration: f64,
    pub transcribe_max_duration: f64,

    pub raw_store: bool,
    pub raw_include_topics: Vec<String>,
    pub raw_exclude_topics: Vec<String>,

    pub preprocess_audio: bool,

    pub object_store_bucket: Option<String>,
    pub object_store_prefix: Option<String>,
    pub object_store_region: Option<String>,
    pub object_store_endpoint: Option<String>,

    pub upload_queue_size: usize,
    pub upload_workers: usize,

    pub reconciler_interval_secs: u64,
    pub reconciler_startup_delay_secs: u64,
    pub reconciler_window_hours: u64,

    pub prune_interval_secs: u64,
    pub prune_max_age_hours: u64,
    pub prune_max_bytes: u64,

    pub subscriber_queue_size: usize,
    pub subscriber_max_initial_calls: usize,

    pub shutdown_deadline_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            database_max_connections: 10,
            merge_p25_systems: true,

            audio_dir: PathBuf::from("./audio"),
            tr_audio_dir: None,

            mqtt_broker_url: None,
            mqtt_topics: "tr-mqtt/main/#".to_string(),
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id: "dispatch-server".to_string(),

            watch_dir: None,
            watch_instance_id: "file-watch".to_string(),
            watch_backfill_days: 7,

            upload_instance_id: "http-upload".to_string(),

            tr_dir: None,

            http_addr: ":8080".to_string(),
            http_read_timeout_secs: 5,
            http_write_timeout_secs: 30,
            http_idle_timeout_secs: 120,

            auth_enabled: true,
            auth_token: None,
            write_token: None,

            rate_limit_rps: 20,
            rate_limit_burst: 40,

            cors_origins: "*".to_string(),

            log_level: "info".to_string(),

            stt_provider: "whisper".to_string(),
            whisper_url: None,
            elevenlabs_url: None,
            transcribe_workers: 2,
            transcribe_queue_size: 500,
            transcribe_min_duration: 1.0,
            transcribe_max_duration: 300.0,

            raw_store: true,
            raw_include_topics: Vec::new(),
            raw_exclude_topics: Vec::new(),

            preprocess_audio: false,

            object_store_bucket: None,
            object_store_prefix: None,
            object_store_region: None,
            object_store_endpoint: None,

            upload_queue_size: 256,
            upload_workers: 4,

            reconciler_interval_secs: 300,
            reconciler_startup_delay_secs: 120,
            reconciler_window_hours: 24,

            prune_interval_secs: 3600,
            prune_max_age_hours: 0,
            prune_max_bytes: 0,

            subscriber_queue_size: 64,
            subscriber_max_initial_calls: 500,

            shutdown_deadline_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from an optional YAML file (`CONFIG_FILE`), then
    /// applies environment variable overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.database_url = val;
        }
        if let Ok(val) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                self.database_max_connections = n;
            }
        }
        if let Ok(val) = std::env::var("MERGE_P25_SYSTEMS") {
            if let Ok(b) = val.parse() {
                self.merge_p25_systems = b;
            }
        }

        if let Ok(val) = std::env::var("AUDIO_DIR") {
            self.audio_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TR_AUDIO_DIR") {
            self.tr_audio_dir = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("MQTT_BROKER_URL") {
            self.mqtt_broker_url = Some(val);
        }
        if let Ok(val) = std::env::var("MQTT_TOPICS") {
            self.mqtt_topics = val;
        }
        if let Ok(val) = std::env::var("MQTT_USERNAME") {
            self.mqtt_username = Some(val);
        }
        if let Ok(val) = std::env::var("MQTT_PASSWORD") {
            self.mqtt_password = Some(val);
        }
        if let Ok(val) = std::env::var("MQTT_CLIENT_ID") {
            self.mqtt_client_id = val;
        }

        if let Ok(val) = std::env::var("WATCH_DIR") {
            self.watch_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("WATCH_INSTANCE_ID") {
            self.watch_instance_id = val;
        }
        if let Ok(val) = std::env::var("WATCH_BACKFILL_DAYS") {
            if let Ok(n) = val.parse() {
                self.watch_backfill_days = n;
            }
        }

        if let Ok(val) = std::env::var("UPLOAD_INSTANCE_ID") {
            self.upload_instance_id = val;
        }

        if let Ok(val) = std::env::var("TR_DIR") {
            self.tr_dir = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("HTTP_ADDR") {
            self.http_addr = val;
        }
        if let Ok(val) = std::env::var("HTTP_READ_TIMEOUT") {
            if let Ok(n) = val.parse() {
                self.http_read_timeout_secs = n;
            }
        }
        if let Ok(val) = std::env::var("HTTP_WRITE_TIMEOUT") {
            if let Ok(n) = val.parse() {
                self.http_write_timeout_secs = n;
            }
        }
        if let Ok(val) = std::env::var("HTTP_IDLE_TIMEOUT") {
            if let Ok(n) = val.parse() {
                self.http_idle_timeout_secs = n;
            }
        }

        if let Ok(val) = std::env::var("AUTH_ENABLED") {
            if let Ok(b) = val.parse() {
                self.auth_enabled = b;
            }
        }
        if let Ok(val) = std::env::var("AUTH_TOKEN") {
            self.auth_token = Some(val);
        }
        if let Ok(val) = std::env::var("WRITE_TOKEN") {
            self.write_token = Some(val);
        }

        if let Ok(val) = std::env::var("RATE_LIMIT_RPS") {
            if let Ok(n) = val.parse() {
                self.rate_limit_rps = n;
            }
        }
        if let Ok(val) = std::env::var("RATE_LIMIT_BURST") {
            if let Ok(n) = val.parse() {
                self.rate_limit_burst = n;
            }
        }

        if let Ok(val) = std::env::var("CORS_ORIGINS") {
            self.cors_origins = val;
        }

        if let Ok(val) = std::env::var("LOG_LEVEL") {
            self.log_level = val;
        }

        if let Ok(val) = std::env::var("STT_PROVIDER") {
            self.stt_provider = val;
        }
        if let Ok(val) = std::env::var("WHISPER_URL") {
            self.whisper_url = Some(val);
        }
        if let Ok(val) = std::env::var("ELEVENLABS_URL") {
            self.elevenlabs_url = Some(val);
        }
        if let Ok(val) = std::env::var("TRANSCRIBE_WORKERS") {
            if let Ok(n) = val.parse() {
                self.transcribe_workers = n;
            }
        }
        if let Ok(val) = std::env::var("TRANSCRIBE_QUEUE_SIZE") {
            if let Ok(n) = val.parse() {
                self.transcribe_queue_size = n;
            }
        }
        if let Ok(val) = std::env::var("TRANSCRIBE_MIN_DURATION") {
            if let Ok(n) = val.parse() {
                self.transcribe_min_duration = n;
            }
        }
        if let Ok(val) = std::env::var("TRANSCRIBE_MAX_DURATION") {
            if let Ok(n) = val.parse() {
                self.transcribe_max_duration = n;
            }
        }

        if let Ok(val) = std::env::var("RAW_STORE") {
            if let Ok(b) = val.parse() {
                self.raw_store = b;
            }
        }
        if let Ok(val) = std::env::var("RAW_INCLUDE_TOPICS") {
            self.raw_include_topics = split_csv(&val);
        }
        if let Ok(val) = std::env::var("RAW_EXCLUDE_TOPICS") {
            self.raw_exclude_topics = split_csv(&val);
        }

        if let Ok(val) = std::env::var("PREPROCESS_AUDIO") {
            if let Ok(b) = val.parse() {
                self.preprocess_audio = b;
            }
        }

        if let Ok(val) = std::env::var("OBJECT_STORE_BUCKET") {
            self.object_store_bucket = Some(val);
        }
        if let Ok(val) = std::env::var("OBJECT_STORE_PREFIX") {
            self.object_store_prefix = Some(val);
        }
        if let Ok(val) = std::env::var("OBJECT_STORE_REGION") {
            self.object_store_region = Some(val);
        }
        if let Ok(val) = std::env::var("OBJECT_STORE_ENDPOINT") {
            self.object_store_endpoint = Some(val);
        }

        if let Ok(val) = std::env::var("UPLOAD_QUEUE_SIZE") {
            if let Ok(n) = val.parse() {
                self.upload_queue_size = n;
            }
        }
        if let Ok(val) = std::env::var("UPLOAD_WORKERS") {
            if let Ok(n) = val.parse() {
                self.upload_workers = n;
            }
        }

        if let Ok(val) = std::env::var("RECONCILER_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                self.reconciler_interval_secs = n;
            }
        }
        if let Ok(val) = std::env::var("RECONCILER_STARTUP_DELAY_SECS") {
            if let Ok(n) = val.parse() {
                self.reconciler_startup_delay_secs = n;
            }
        }
        if let Ok(val) = std::env::var("RECONCILER_WINDOW_HOURS") {
            if let Ok(n) = val.parse() {
                self.reconciler_window_hours = n;
            }
        }

        if let Ok(val) = std::env::var("PRUNE_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                self.prune_interval_secs = n;
            }
        }
        if let Ok(val) = std::env::var("PRUNE_MAX_AGE_HOURS") {
            if let Ok(n) = val.parse() {
                self.prune_max_age_hours = n;
            }
        }
        if let Ok(val) = std::env::var("PRUNE_MAX_BYTES") {
            if let Ok(n) = val.parse() {
                self.prune_max_bytes = n;
            }
        }

        if let Ok(val) = std::env::var("SUBSCRIBER_QUEUE_SIZE") {
            if let Ok(n) = val.parse() {
                self.subscriber_queue_size = n;
            }
        }
        if let Ok(val) = std::env::var("SUBSCRIBER_MAX_INITIAL_CALLS") {
            if let Ok(n) = val.parse() {
                self.subscriber_max_initial_calls = n;
            }
        }

        if let Ok(val) = std::env::var("SHUTDOWN_DEADLINE_SECS") {
            if let Ok(n) = val.parse() {
                self.shutdown_deadline_secs = n;
            }
        }
    }

    /// Converts to dispatch-core's `EngineConfig`.
    pub fn to_engine_config(&self) -> EngineConfig {
        let object_store = self.object_store_bucket.as_ref().map(|bucket| ObjectStoreConfig {
            bucket: bucket.clone(),
            prefix: self.object_store_prefix.clone(),
            region: self.object_store_region.clone(),
            endpoint: self.object_store_endpoint.clone(),
        });

        let mqtt = self.mqtt_broker_url.as_ref().map(|broker_url| {
            let (host, port) = split_host_port(broker_url, 1883);
            MqttConfig {
                host,
                port,
                client_id: self.mqtt_client_id.clone(),
                topic_filter: self.mqtt_topics.clone(),
                keep_alive: Duration::from_secs(30),
                fallback_instance_key: self.mqtt_client_id.clone(),
            }
        });

        let watch = self.watch_dir.as_ref().map(|root| WatchConfig {
            root: root.clone(),
            fallback_instance_key: self.watch_instance_id.clone(),
            default_short_name: self.watch_instance_id.clone(),
            backfill_days: self.watch_backfill_days,
        });

        let stt = match self.stt_provider.as_str() {
            "whisper" => self.whisper_url.clone().map(SttConfig::Endpoint),
            "elevenlabs" => self.elevenlabs_url.clone().map(SttConfig::Endpoint),
            _ => None,
        }
        .unwrap_or(SttConfig::Disabled);

        EngineConfig {
            database_url: self.database_url.clone(),
            database_max_connections: self.database_max_connections,
            merge_p25_systems: self.merge_p25_systems,

            audio_dir: self.audio_dir.clone(),
            object_store,
            uploader: UploaderConfig {
                queue_size: self.upload_queue_size,
                workers: self.upload_workers,
                ..Default::default()
            },
            reconciler: ReconcilerConfig {
                interval: Duration::from_secs(self.reconciler_interval_secs),
                startup_delay: Duration::from_secs(self.reconciler_startup_delay_secs),
                window: Duration::from_secs(self.reconciler_window_hours * 3600),
            },
            pruner: PrunerConfig {
                interval: Duration::from_secs(self.prune_interval_secs),
                max_age: Duration::from_secs(self.prune_max_age_hours * 3600),
                max_bytes: self.prune_max_bytes,
            },

            mqtt,
            watch,
            upload_instance_key: self.upload_instance_id.clone(),

            subscriber_queue_size: self.subscriber_queue_size,

            transcription: TranscriptionConfig {
                queue_size: self.transcribe_queue_size,
                workers: self.transcribe_workers,
                min_duration: self.transcribe_min_duration,
                max_duration: self.transcribe_max_duration,
                ..Default::default()
            },
            stt,

            raw_archive: RawArchivePolicy {
                allow: if self.raw_include_topics.is_empty() {
                    None
                } else {
                    Some(self.raw_include_topics.clone())
                },
                deny: self.raw_exclude_topics.clone(),
            },
        }
    }

    /// Resolves `HTTP_ADDR` (`:8080` or `host:port`) to a socket address.
    pub fn http_socket_addr(&self) -> Result<std::net::SocketAddr> {
        let addr = if let Some(port) = self.http_addr.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            self.http_addr.clone()
        };
        addr.parse()
            .with_context(|| format!("invalid HTTP_ADDR: {}", self.http_addr))
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
}

fn split_host_port(raw: &str, default_port: u16) -> (String, u16) {
    let raw = raw
        .trim_start_matches("mqtt://")
        .trim_start_matches("tcp://")
        .trim_start_matches("ssl://");
    match raw.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (raw.to_string(), default_port),
        },
        None => (raw.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_database_url() {
        assert!(ServerConfig::default().database_url.is_empty());
    }

    #[test]
    fn split_host_port_strips_scheme_and_parses_port() {
        assert_eq!(split_host_port("mqtt://broker.local:1884", 1883), ("broker.local".to_string(), 1884));
        assert_eq!(split_host_port("broker.local", 1883), ("broker.local".to_string(), 1883));
    }

    #[test]
    fn http_socket_addr_expands_bare_port() {
        let mut config = ServerConfig::default();
        config.http_addr = ":9090".to_string();
        assert_eq!(config.http_socket_addr().unwrap().port(), 9090);
    }
}

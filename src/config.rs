use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::ObjectClass;
use crate::ingest::IngestSettings;
use crate::pipeline::PipelineConfig;
use crate::registry::RegistrySettings;
use crate::relay::{RelaySettings, DEFAULT_ENCODER_PROGRAM};
use crate::session::SessionSettings;
use crate::track::TrackerConfig;

pub const CONFIG_ENV: &str = "STREAMD_CONFIG";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamdConfigFile {
    api: Option<ApiConfigFile>,
    ingest: Option<IngestConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    tracker: Option<TrackerConfigFile>,
    session: Option<SessionConfigFile>,
    relay: Option<RelayConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    ffmpeg: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    target_class: Option<ObjectClass>,
    min_confidence: Option<f32>,
    count_window: Option<usize>,
    box_thickness: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    min_iou: Option<f32>,
    min_hits: Option<u32>,
    max_age: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    viewer_capacity: Option<usize>,
    frame_timeout_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    max_consecutive_errors: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    host: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    buffer_capacity: Option<usize>,
    fifo_dir: Option<PathBuf>,
    encoder_program: Option<String>,
    encoder_args: Option<Vec<String>>,
    drain_grace_ms: Option<u64>,
    kill_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
}

/// Daemon configuration: optional JSON file, then environment overrides.
#[derive(Debug, Clone)]
pub struct StreamdConfig {
    pub api_addr: String,
    pub ingest: IngestSettings,
    pub pipeline: PipelineConfig,
    pub tracker: TrackerConfig,
    pub session: SessionSettings,
    pub relay: RelaySettings,
    /// Detector backend name; `None` selects the registry default.
    pub detector: Option<String>,
}

impl Default for StreamdConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            ingest: IngestSettings::default(),
            pipeline: PipelineConfig::default(),
            tracker: TrackerConfig::default(),
            session: SessionSettings::default(),
            relay: RelaySettings::default(),
            detector: None,
        }
    }
}

impl StreamdConfig {
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).ok().filter(|p| !p.trim().is_empty());
        Self::load_from(path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any), then apply env overrides and validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => StreamdConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamdConfigFile) -> Self {
        let defaults = Self::default();

        let api = file.api.unwrap_or_default();
        let ingest = file.ingest.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let tracker = file.tracker.unwrap_or_default();
        let session = file.session.unwrap_or_default();
        let relay = file.relay.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();

        Self {
            api_addr: api.addr.unwrap_or(defaults.api_addr),
            ingest: IngestSettings {
                width: ingest.width.unwrap_or(defaults.ingest.width),
                height: ingest.height.unwrap_or(defaults.ingest.height),
                ffmpeg: ingest.ffmpeg.unwrap_or(defaults.ingest.ffmpeg),
            },
            pipeline: PipelineConfig {
                target_class: pipeline
                    .target_class
                    .unwrap_or(defaults.pipeline.target_class),
                min_confidence: pipeline
                    .min_confidence
                    .unwrap_or(defaults.pipeline.min_confidence),
                count_window: pipeline
                    .count_window
                    .unwrap_or(defaults.pipeline.count_window),
                box_color: defaults.pipeline.box_color,
                box_thickness: pipeline
                    .box_thickness
                    .unwrap_or(defaults.pipeline.box_thickness),
            },
            tracker: TrackerConfig {
                min_iou: tracker.min_iou.unwrap_or(defaults.tracker.min_iou),
                min_hits: tracker.min_hits.unwrap_or(defaults.tracker.min_hits),
                max_age: tracker.max_age.unwrap_or(defaults.tracker.max_age),
            },
            session: SessionSettings {
                viewer_capacity: session
                    .viewer_capacity
                    .unwrap_or(defaults.session.viewer_capacity),
                frame_timeout: millis_or(session.frame_timeout_ms, defaults.session.frame_timeout),
                stop_timeout: millis_or(session.stop_timeout_ms, defaults.session.stop_timeout),
                max_consecutive_errors: session
                    .max_consecutive_errors
                    .unwrap_or(defaults.session.max_consecutive_errors),
            },
            relay: RelaySettings {
                host: relay.host.unwrap_or(defaults.relay.host),
                width: relay.width.unwrap_or(defaults.relay.width),
                height: relay.height.unwrap_or(defaults.relay.height),
                fps: relay.fps.unwrap_or(defaults.relay.fps),
                buffer_capacity: relay
                    .buffer_capacity
                    .unwrap_or(defaults.relay.buffer_capacity),
                fifo_dir: relay.fifo_dir.unwrap_or(defaults.relay.fifo_dir),
                encoder_program: relay
                    .encoder_program
                    .unwrap_or(defaults.relay.encoder_program),
                encoder_args: relay.encoder_args.unwrap_or(defaults.relay.encoder_args),
                drain_grace: millis_or(relay.drain_grace_ms, defaults.relay.drain_grace),
                kill_grace: millis_or(relay.kill_grace_ms, defaults.relay.kill_grace),
                writer_poll: defaults.relay.writer_poll,
                writer_join: defaults.relay.writer_join,
            },
            detector: detector.backend,
        }
    }

    fn apply_env(&mut self) {
        if let Some(addr) = env_value("STREAMD_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(host) = env_value("STREAMD_RELAY_HOST") {
            self.relay.host = host;
        }
        if let Some(ffmpeg) = env_value("STREAMD_FFMPEG") {
            // The encoder follows the decoder unless it was configured on its own.
            if self.relay.encoder_program == DEFAULT_ENCODER_PROGRAM {
                self.relay.encoder_program = ffmpeg.clone();
            }
            self.ingest.ffmpeg = ffmpeg;
        }
        if let Some(encoder) = env_value("STREAMD_ENCODER") {
            self.relay.encoder_program = encoder;
        }
        if let Some(backend) = env_value("STREAMD_DETECTOR") {
            self.detector = Some(backend);
        }
        if let Some(dir) = env_value("STREAMD_FIFO_DIR") {
            self.relay.fifo_dir = PathBuf::from(dir);
        }
    }

    fn validate(&self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid api address '{}': {}", self.api_addr, e))?;
        if self.ingest.width == 0 || self.ingest.height == 0 {
            return Err(anyhow!("ingest width and height must be greater than zero"));
        }
        if self.relay.width == 0 || self.relay.height == 0 || self.relay.fps == 0 {
            return Err(anyhow!("relay width, height and fps must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.pipeline.min_confidence) {
            return Err(anyhow!("pipeline min_confidence must be within [0, 1]"));
        }
        if self.pipeline.count_window == 0 {
            return Err(anyhow!("pipeline count_window must be greater than zero"));
        }
        if !(self.tracker.min_iou > 0.0 && self.tracker.min_iou <= 1.0) {
            return Err(anyhow!("tracker min_iou must be within (0, 1]"));
        }
        if self.session.viewer_capacity == 0 || self.relay.buffer_capacity == 0 {
            return Err(anyhow!("buffer capacities must be greater than zero"));
        }
        if !self.relay.encoder_args.iter().any(|a| a.contains("{input}")) {
            return Err(anyhow!("relay encoder_args must reference {{input}}"));
        }
        Ok(())
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            ingest: self.ingest.clone(),
            relay: self.relay.clone(),
            session: self.session.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<StreamdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

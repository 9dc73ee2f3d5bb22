//! Configuration management for the smartrec agent

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::BackendKind;
use crate::controller::ControllerSettings;
use crate::native::{nvds, Container};
use crate::session::SourceId;
use crate::trigger::DetectionFilter;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Recording window and output configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Trigger admission configuration
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Native library configuration
    #[serde(default)]
    pub native: NativeConfig,

    /// Sources to attach at startup
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,

    /// Synthetic frame feed for software-engine sources
    #[serde(default)]
    pub demo: DemoConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory segments are written to
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,

    /// File name prefix; the source id and `_` are appended
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// Seconds of history kept in the rolling cache
    #[serde(default = "default_cache_seconds")]
    pub cache_seconds: u32,

    /// Seconds before the trigger included in a cut
    #[serde(default = "default_window_seconds")]
    pub back_seconds: u32,

    /// Seconds after the trigger included in a cut
    #[serde(default = "default_window_seconds")]
    pub front_seconds: u32,

    #[serde(default = "default_window_seconds")]
    pub default_duration_seconds: u32,

    #[serde(default)]
    pub container: Container,

    /// How long teardown waits for in-flight recordings (ms)
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Minimum seconds between admitted triggers per source (0 disables)
    #[serde(default)]
    pub cooldown_seconds: f64,

    /// Detector class ids that trigger a cut
    #[serde(default = "default_class_ids")]
    pub class_ids: Vec<i32>,

    /// Detector labels that trigger a cut (case-insensitive)
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagedEngineKind {
    /// DeepStream NvDsSR library
    Nvds,
    /// In-process circular cache
    Software,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeConfig {
    /// Candidate paths for libnvdsgst_smartrecord.so, tried in order
    #[serde(default = "default_library_paths")]
    pub library_paths: Vec<PathBuf>,

    /// Engine behind managed sources
    #[serde(default = "default_managed_engine")]
    pub managed_engine: ManagedEngineKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,

    /// Friendly name handed to native code (default `sid<id>`)
    pub name: Option<String>,

    #[serde(default = "default_backend")]
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Frames between keyframes
    #[serde(default = "default_fps")]
    pub keyframe_interval: u32,

    #[serde(default = "default_frame_bytes")]
    pub frame_bytes: usize,
}

// Default value functions
fn default_output_directory() -> PathBuf {
    std::env::temp_dir().join("smartrec-recordings")
}

fn default_file_prefix() -> String {
    "cam".to_string()
}

fn default_cache_seconds() -> u32 {
    60
}

fn default_window_seconds() -> u32 {
    10
}

fn default_teardown_timeout_ms() -> u64 {
    2000
}

fn default_class_ids() -> Vec<i32> {
    vec![0]
}

fn default_labels() -> Vec<String> {
    vec!["person".to_string()]
}

fn default_min_confidence() -> f32 {
    0.35
}

fn default_library_paths() -> Vec<PathBuf> {
    nvds::DEFAULT_LIBRARY_PATHS.iter().map(PathBuf::from).collect()
}

fn default_managed_engine() -> ManagedEngineKind {
    ManagedEngineKind::Nvds
}

fn default_backend() -> BackendKind {
    BackendKind::Managed
}

fn default_sources() -> Vec<SourceConfig> {
    vec![SourceConfig {
        id: 0,
        name: None,
        backend: BackendKind::Managed,
    }]
}

fn default_fps() -> u32 {
    15
}

fn default_frame_bytes() -> usize {
    4096
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_directory: default_output_directory(),
            file_prefix: default_file_prefix(),
            cache_seconds: default_cache_seconds(),
            back_seconds: default_window_seconds(),
            front_seconds: default_window_seconds(),
            default_duration_seconds: default_window_seconds(),
            container: Container::default(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 0.0,
            class_ids: default_class_ids(),
            labels: default_labels(),
            min_confidence: default_min_confidence(),
        }
    }
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            library_paths: default_library_paths(),
            managed_engine: default_managed_engine(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            keyframe_interval: default_fps(),
            frame_bytes: default_frame_bytes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recording: RecordingConfig::default(),
            trigger: TriggerConfig::default(),
            native: NativeConfig::default(),
            sources: default_sources(),
            demo: DemoConfig::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_config_path()?)
    }

    /// Load from `path`, writing a default file there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?;

            config.config_path = Some(path.to_path_buf());
            Ok(config)
        } else {
            let config = Config {
                config_path: Some(path.to_path_buf()),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "smartrec", "agent")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn detection_filter(&self) -> DetectionFilter {
        DetectionFilter {
            class_ids: self.trigger.class_ids.iter().copied().collect(),
            labels: self
                .trigger
                .labels
                .iter()
                .map(|label| label.to_lowercase())
                .collect::<HashSet<_>>(),
            min_confidence: self.trigger.min_confidence,
        }
    }

    /// Library-level settings; the controller never reads files itself
    pub fn controller_settings(&self) -> ControllerSettings {
        let cooldown = if self.trigger.cooldown_seconds.is_finite() && self.trigger.cooldown_seconds > 0.0 {
            Duration::from_secs_f64(self.trigger.cooldown_seconds)
        } else {
            Duration::ZERO
        };

        ControllerSettings {
            cache_seconds: self.recording.cache_seconds,
            back_seconds: self.recording.back_seconds,
            front_seconds: self.recording.front_seconds,
            default_duration_seconds: self.recording.default_duration_seconds,
            file_prefix: self.recording.file_prefix.clone(),
            output_directory: self.recording.output_directory.clone(),
            container: self.recording.container,
            cooldown,
            teardown_timeout: Duration::from_millis(self.recording.teardown_timeout_ms),
            detection_filter: self.detection_filter(),
        }
    }
}

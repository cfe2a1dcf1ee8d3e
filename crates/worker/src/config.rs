//! Process-level configuration.
//!
//! Settings come from a `KEY = VALUE` text file (`config.txt` unless
//! `DREAMFACTORY_CONFIG` points elsewhere); `#` starts a comment. Problems
//! with individual keys are returned as warnings and the default is kept.
//!
//! | Key                         | Default                    |
//! |-----------------------------|----------------------------|
//! | `SD_LOCATION`               | `.`                        |
//! | `SD_START_PORT`             | `7861`                     |
//! | `GPU_DEVICES`               | `0`                        |
//! | `PROMPTS_LOCATION`          | `prompts`                  |
//! | `OUTPUT_LOCATION`           | `output`                   |
//! | `WILDCARD_LOCATION`         | `prompts/wildcards`        |
//! | `MODEL_TRIGGER_FILE`        | `cache/model-triggers.txt` |
//! | `LOG_LOCATION`              | `logs`                     |
//! | `LOG_BUFFER_SIZE`           | `300`                      |
//! | `RANDOM_QUEUE_SIZE`         | `50`                       |
//! | `STARTUP_TIMEOUT`           | `300` (seconds)            |
//! | `READINESS_POLL_INTERVAL`   | `5` (seconds)              |
//! | `DEFAULT_CKPT_FILE`         | none                       |
//! | `AUTO_INSERT_MODEL_TRIGGER` | `off`                      |
//! | `UPSCALE_MAX_PIXELS`        | `4194304`                  |
//!
//! `WIDTH`, `HEIGHT`, `STEPS`, `SCALE`, `SAMPLER`, `NEG_PROMPT` and
//! `SAMPLES` set the job defaults every template starts from.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use dreamfactory_core::capabilities::Capabilities;
use dreamfactory_core::directives::{self, JobTemplate};
use dreamfactory_core::job::JobSpec;
use dreamfactory_core::text;
use dreamfactory_core::triggers::TriggerPlacement;
use dreamfactory_core::upscale::DEFAULT_MAX_PIXELS;

/// Config file read when `DREAMFACTORY_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "config.txt";

/// Job parameters the config file may preset.
const JOB_DEFAULT_KEYS: &[&str] = &[
    "WIDTH",
    "HEIGHT",
    "STEPS",
    "SCALE",
    "SAMPLER",
    "NEG_PROMPT",
    "SAMPLES",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {} not found, using defaults", .0.display())]
    Missing(PathBuf),

    #[error("config line is not KEY = VALUE: {0}")]
    Malformed(String),

    #[error("unknown config key {0} (ignored)")]
    UnknownKey(String),

    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Render backend installation directory.
    pub sd_location: PathBuf,
    /// Device `n` in [`WorkerConfig::devices`] listens on `start_port + n`.
    pub start_port: u16,
    pub devices: Vec<String>,
    pub prompts_location: PathBuf,
    pub output_location: PathBuf,
    pub wildcard_location: PathBuf,
    pub model_trigger_file: PathBuf,
    pub log_location: PathBuf,
    pub log_buffer_size: usize,
    pub random_queue_size: usize,
    pub startup_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub default_ckpt_file: Option<String>,
    pub trigger_placement: TriggerPlacement,
    pub upscale_max_pixels: u64,
    /// Job defaults every template compile starts from.
    pub job_defaults: JobSpec,
    /// Template to load at startup (`DREAMFACTORY_PROMPT_FILE`).
    pub prompt_file: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sd_location: PathBuf::from("."),
            start_port: 7861,
            devices: vec!["0".to_string()],
            prompts_location: PathBuf::from("prompts"),
            output_location: PathBuf::from("output"),
            wildcard_location: PathBuf::from("prompts").join("wildcards"),
            model_trigger_file: PathBuf::from("cache").join("model-triggers.txt"),
            log_location: PathBuf::from("logs"),
            log_buffer_size: 300,
            random_queue_size: 50,
            startup_timeout: Duration::from_secs(300),
            readiness_poll_interval: Duration::from_secs(5),
            default_ckpt_file: None,
            trigger_placement: TriggerPlacement::Off,
            upscale_max_pixels: DEFAULT_MAX_PIXELS,
            job_defaults: JobSpec::default(),
            prompt_file: None,
        }
    }
}

impl WorkerConfig {
    /// Load from the file named by `DREAMFACTORY_CONFIG` (or
    /// [`DEFAULT_CONFIG_FILE`]) and apply `DREAMFACTORY_PROMPT_FILE`.
    ///
    /// A missing file yields the defaults plus a [`ConfigError::Missing`]
    /// warning.
    pub fn from_env() -> Result<(Self, Vec<ConfigError>), ConfigError> {
        let path = std::env::var("DREAMFACTORY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

        let (mut config, warnings) = match Self::load(&path) {
            Ok(loaded) => loaded,
            Err(ConfigError::Missing(path)) => {
                (Self::default(), vec![ConfigError::Missing(path)])
            }
            Err(e) => return Err(e),
        };

        if let Ok(prompt_file) = std::env::var("DREAMFACTORY_PROMPT_FILE") {
            if !prompt_file.trim().is_empty() {
                config.prompt_file = Some(PathBuf::from(prompt_file.trim()));
            }
        }
        Ok((config, warnings))
    }

    pub fn load(path: &Path) -> Result<(Self, Vec<ConfigError>), ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::Missing(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Ok(Self::parse(&contents))
    }

    /// Parse config file contents. Never fails; rejected lines come back
    /// as warnings.
    pub fn parse(contents: &str) -> (Self, Vec<ConfigError>) {
        let mut config = Self::default();
        let mut defaults = JobTemplate::new(JobSpec::default());
        let no_caps = Capabilities::default();
        let mut warnings = Vec::new();

        for line in text::content_lines(contents) {
            let Some((key, value)) = line.split_once('=') else {
                warnings.push(ConfigError::Malformed(line));
                continue;
            };
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();

            if JOB_DEFAULT_KEYS.contains(&key.as_str()) {
                if let Err(e) = directives::apply(&mut defaults, &key, value, &no_caps) {
                    warnings.push(invalid(&key, value, e.to_string()));
                }
                continue;
            }
            if let Err(e) = config.set(&key, value) {
                warnings.push(e);
            }
        }

        config.job_defaults = defaults.job;
        config.job_defaults.trigger_placement = config.trigger_placement.clone();
        (config, warnings)
    }

    /// Port for the device at `index` in [`WorkerConfig::devices`].
    pub fn port_for(&self, index: usize) -> u16 {
        self.start_port.saturating_add(index as u16)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "SD_LOCATION" => self.sd_location = PathBuf::from(value),
            "SD_START_PORT" => self.start_port = parse(key, value)?,
            "GPU_DEVICES" => {
                let devices: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect();
                if devices.is_empty() {
                    return Err(invalid(key, value, "no device ids".to_string()));
                }
                self.devices = devices;
            }
            "PROMPTS_LOCATION" => self.prompts_location = PathBuf::from(value),
            "OUTPUT_LOCATION" => self.output_location = PathBuf::from(value),
            "WILDCARD_LOCATION" => self.wildcard_location = PathBuf::from(value),
            "MODEL_TRIGGER_FILE" => self.model_trigger_file = PathBuf::from(value),
            "LOG_LOCATION" => self.log_location = PathBuf::from(value),
            "LOG_BUFFER_SIZE" => self.log_buffer_size = parse(key, value)?,
            "RANDOM_QUEUE_SIZE" => self.random_queue_size = parse(key, value)?,
            "STARTUP_TIMEOUT" => self.startup_timeout = Duration::from_secs(parse(key, value)?),
            "READINESS_POLL_INTERVAL" => {
                self.readiness_poll_interval = Duration::from_secs(parse(key, value)?)
            }
            "DEFAULT_CKPT_FILE" => {
                self.default_ckpt_file = (!value.is_empty()).then(|| value.to_string())
            }
            "AUTO_INSERT_MODEL_TRIGGER" => {
                self.trigger_placement = TriggerPlacement::from_str(value)
                    .map_err(|reason| invalid(key, value, reason))?
            }
            "UPSCALE_MAX_PIXELS" => self.upscale_max_pixels = parse(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| invalid(key, value, e.to_string()))
}

fn invalid(key: &str, value: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    }
}

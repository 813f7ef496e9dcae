//! Deployment configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (`AWS_REGION`, `MODEL_ID`, `MAX_STEPS`, ...)
//! 2. Config file (`--config` or `DOCFLOW_CONFIG`), same keys in snake_case
//! 3. Defaults
//!
//! Loaded once at start-up into an immutable [`Config`]. Missing or invalid
//! required values fail fast with a [`ConfigError`].

use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::safety::{RetryPolicy, SafetyLimits};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "DOCFLOW_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{set} is set but {missing} is not; set both or neither")]
    Incomplete {
        set: &'static str,
        missing: &'static str,
    },

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("cannot determine home directory; set DOCFLOW_HOME")]
    NoHome,
}

/// Which planner drives the execution loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerKind {
    Deterministic,
    Model,
}

/// Where the model-driven planner's prompt lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptLocation {
    pub bucket: String,
    pub key: String,
}

impl PromptLocation {
    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

/// Raw config file schema; each key is the snake_case form of an
/// environment variable
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(skip)]
    path: Option<PathBuf>,

    pub aws_region: Option<String>,
    pub aws_default_region: Option<String>,
    pub env_name: Option<String>,

    pub planner: Option<String>,
    pub model_id: Option<String>,
    pub planner_endpoint: Option<String>,
    pub prompt_bucket: Option<String>,
    pub prompt_key: Option<String>,

    pub extraction_agent_lambda: Option<String>,
    pub extraction_endpoint: Option<String>,
    pub image_output_path: Option<String>,
    pub posting_endpoint: Option<String>,
    pub notification_endpoint: Option<String>,

    pub max_steps: Option<u32>,
    pub tool_max_retries: Option<u32>,
    pub step_timeout_seconds: Option<u64>,
    pub run_timeout_seconds: Option<u64>,
    pub lease_wait_seconds: Option<u64>,

    pub docflow_home: Option<String>,
    pub docflow_lock_file: Option<String>,
    pub docflow_journal_dir: Option<String>,
    pub log_level: Option<String>,
}

impl ConfigFile {
    /// Parse YAML with snake_case keys
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_yaml::from_str::<Option<Self>>(yaml)?.unwrap_or_default())
    }

    /// Read and parse a config file
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut file = Self::parse(&content)?;
        file.path = Some(path.to_path_buf());
        Ok(file)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Resolved configuration
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub region: String,
    pub env_name: String,

    pub planner: PlannerKind,
    pub model_id: Option<String>,
    pub planner_endpoint: Option<String>,
    pub prompt: Option<PromptLocation>,

    /// Name of the extraction function
    pub extraction_function: String,
    pub extraction_endpoint: String,
    pub image_output_path: String,

    /// Unset means dry-run posting
    pub posting_endpoint: Option<String>,

    /// Unset means notifications are only logged
    pub notification_endpoint: Option<String>,

    pub limits: SafetyLimits,
    pub retry: RetryPolicy,
    pub lease_wait_seconds: u64,

    pub home: PathBuf,
    pub lock_file: PathBuf,
    pub journal_dir: PathBuf,

    pub log_level: String,

    /// Path to config file (if one was used)
    pub config_file: Option<PathBuf>,
}

impl Config {
    /// Load from the process environment and an optional config file.
    ///
    /// `file` wins over `DOCFLOW_CONFIG`.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();

        let path = file
            .map(Path::to_path_buf)
            .or_else(|| env(CONFIG_ENV).filter(|p| !p.trim().is_empty()).map(PathBuf::from));

        let file = match path {
            Some(path) => ConfigFile::read(&path)?,
            None => ConfigFile::default(),
        };

        Self::from_sources(env, &file)
    }

    /// Resolve configuration from an environment lookup and a parsed file
    pub fn from_sources<F>(env: F, file: &ConfigFile) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let src = Sources { env };

        let region = src
            .text("AWS_REGION", &file.aws_region)
            .or_else(|| src.text("AWS_DEFAULT_REGION", &file.aws_default_region))
            .ok_or(ConfigError::Missing("AWS_REGION"))?;

        let env_name = src
            .text("ENV_NAME", &file.env_name)
            .unwrap_or_else(|| "dev".to_string());

        let planner = match src
            .text("PLANNER", &file.planner)
            .map(|p| p.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("deterministic") => PlannerKind::Deterministic,
            Some("model") => PlannerKind::Model,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "PLANNER",
                    value: other.to_string(),
                    reason: "expected 'deterministic' or 'model'".to_string(),
                })
            }
        };

        let model_id = src.text("MODEL_ID", &file.model_id);
        let planner_endpoint = src.text("PLANNER_ENDPOINT", &file.planner_endpoint);
        if planner == PlannerKind::Model {
            if model_id.is_none() {
                return Err(ConfigError::Missing("MODEL_ID"));
            }
            if planner_endpoint.is_none() {
                return Err(ConfigError::Missing("PLANNER_ENDPOINT"));
            }
        }

        let prompt = match (
            src.text("PROMPT_BUCKET", &file.prompt_bucket),
            src.text("PROMPT_KEY", &file.prompt_key),
        ) {
            (Some(bucket), Some(key)) => Some(PromptLocation { bucket, key }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::Incomplete {
                    set: "PROMPT_BUCKET",
                    missing: "PROMPT_KEY",
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::Incomplete {
                    set: "PROMPT_KEY",
                    missing: "PROMPT_BUCKET",
                })
            }
        };

        let extraction_function = src
            .text("EXTRACTION_AGENT_LAMBDA", &file.extraction_agent_lambda)
            .unwrap_or_else(|| format!("InvoiceExtractionContainer-{}", env_name));

        let step_timeout = src.positive("STEP_TIMEOUT_SECONDS", file.step_timeout_seconds, 120)?;
        let run_timeout = src.positive("RUN_TIMEOUT_SECONDS", file.run_timeout_seconds, 600)?;
        let limits = SafetyLimits {
            max_steps: src.positive("MAX_STEPS", file.max_steps, 16)?,
            step_timeout_ms: millis("STEP_TIMEOUT_SECONDS", step_timeout)?,
            run_timeout_ms: millis("RUN_TIMEOUT_SECONDS", run_timeout)?,
        };

        let retry = RetryPolicy {
            max_retries: src.number("TOOL_MAX_RETRIES", file.tool_max_retries, 2)?,
            ..RetryPolicy::default()
        };

        let home = match src.text("DOCFLOW_HOME", &file.docflow_home) {
            Some(home) => PathBuf::from(home),
            None => dirs::home_dir().ok_or(ConfigError::NoHome)?.join(".docflow"),
        };
        let lock_file = src
            .text("DOCFLOW_LOCK_FILE", &file.docflow_lock_file)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("docflow.lock"));
        let journal_dir = src
            .text("DOCFLOW_JOURNAL_DIR", &file.docflow_journal_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("runs"));

        Ok(Self {
            region,
            env_name,
            planner,
            model_id,
            planner_endpoint,
            prompt,
            extraction_function,
            extraction_endpoint: src
                .text("EXTRACTION_ENDPOINT", &file.extraction_endpoint)
                .unwrap_or_else(|| "http://127.0.0.1:3001".to_string()),
            image_output_path: src
                .text("IMAGE_OUTPUT_PATH", &file.image_output_path)
                .unwrap_or_else(|| "imageOutput".to_string()),
            posting_endpoint: src.text("POSTING_ENDPOINT", &file.posting_endpoint),
            notification_endpoint: src.text("NOTIFICATION_ENDPOINT", &file.notification_endpoint),
            limits,
            retry,
            lease_wait_seconds: src.number("LEASE_WAIT_SECONDS", file.lease_wait_seconds, 0)?,
            home,
            lock_file,
            journal_dir,
            log_level: src
                .text("LOG_LEVEL", &file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            config_file: file.path.clone(),
        })
    }

    /// How long a trigger may wait for the concurrency lease
    pub fn lease_wait(&self) -> Duration {
        Duration::from_secs(self.lease_wait_seconds)
    }
}

/// Seconds to milliseconds, refusing values that overflow
fn millis(key: &'static str, seconds: u64) -> Result<u64, ConfigError> {
    seconds.checked_mul(1000).ok_or_else(|| ConfigError::Invalid {
        key,
        value: seconds.to_string(),
        reason: "too large".to_string(),
    })
}

/// Environment over file; blank values count as unset
struct Sources<F> {
    env: F,
}

impl<F> Sources<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn env(&self, key: &str) -> Option<String> {
        (self.env)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn text(&self, key: &str, file: &Option<String>) -> Option<String> {
        self.env(key).or_else(|| {
            file.as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
    }

    fn number<T>(&self, key: &'static str, file: Option<T>, default: T) -> Result<T, ConfigError>
    where
        T: FromStr<Err = ParseIntError>,
    {
        match self.env(key) {
            None => Ok(file.unwrap_or(default)),
            Some(value) => value.parse().map_err(|e: ParseIntError| ConfigError::Invalid {
                key,
                value,
                reason: e.to_string(),
            }),
        }
    }

    fn positive<T>(&self, key: &'static str, file: Option<T>, default: T) -> Result<T, ConfigError>
    where
        T: FromStr<Err = ParseIntError> + Default + PartialEq + ToString,
    {
        let n = self.number(key, file, default)?;
        if n == T::default() {
            return Err(ConfigError::Invalid {
                key,
                value: n.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(n)
    }
}

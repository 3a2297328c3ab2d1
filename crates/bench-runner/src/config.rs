use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::image::IdentifierMode;

pub const DEFAULT_SCHEDULE_ENDPOINT: &str = "/schedule";
pub const DEFAULT_STATUS_ENDPOINT: &str = "/status_update";
pub const DEFAULT_RESULT_ENDPOINT: &str = "/result";
pub const DEFAULT_EXECUTION_FREQUENCY_SECONDS: u64 = 30;
pub const DEFAULT_SETTLE_DELAY_SECONDS: u64 = 5;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_CONTAINER_LOGS_PATH: &str = "../logs";
pub const DEFAULT_SOLUTION_CONTAINER_PREFIX: &str = "solution-app-";
pub const DEFAULT_GRADER_CONTAINER_NAME: &str = "debs-2020-grader";
pub const DEFAULT_COMPOSE_TEMPLATE: &str = "docker-compose-template.yml";
pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";

/// Port the controller listens on when it is addressed by a docker host alias.
const DOCKER_HOST_CONTROLLER_PORT: u16 = 8080;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("CONTROLLER_URI must be set")]
    MissingControllerUri,
    #[error("{var} must be a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
    #[error("unknown DOCKER_IMAGE_IDENTIFIER '{0}' (expected 'team' or 'image')")]
    UnknownIdentifier(String),
}

/// Endpoints of the remote controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub base_uri: String,
    pub schedule_endpoint: String,
    pub status_endpoint: String,
    pub result_endpoint: String,
    pub timeout: Option<Duration>,
}

impl ControllerSettings {
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            base_uri: normalize_controller_uri(&base_uri.into()),
            schedule_endpoint: DEFAULT_SCHEDULE_ENDPOINT.to_string(),
            status_endpoint: DEFAULT_STATUS_ENDPOINT.to_string(),
            result_endpoint: DEFAULT_RESULT_ENDPOINT.to_string(),
            timeout: None,
        }
    }
}

/// Settings written into the composition descriptor for each run.
///
/// Every field is optional at load time; rendering fails for the image when a
/// field it needs is missing, which keeps the loop alive for diagnosis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BenchmarkSettings {
    pub template_path: PathBuf,
    pub compose_file: PathBuf,
    pub hard_timeout_seconds: Option<u64>,
    pub container_dataset_path: Option<String>,
    pub host_dataset_path: Option<String>,
    pub host_logs_path: Option<String>,
    pub container_results_base_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub controller: ControllerSettings,
    pub benchmark: BenchmarkSettings,
    pub identifier_mode: IdentifierMode,
    pub container_logs_root: PathBuf,
    pub solution_container_prefix: String,
    pub grader_container_name: String,
    pub execution_interval: Duration,
    pub settle_delay: Duration,
    pub max_retry_attempts: u32,
}

impl ManagerConfig {
    /// Configuration with defaults for everything but the controller address.
    pub fn new(controller_uri: impl Into<String>) -> Self {
        Self {
            controller: ControllerSettings::new(controller_uri),
            benchmark: BenchmarkSettings {
                template_path: PathBuf::from(DEFAULT_COMPOSE_TEMPLATE),
                compose_file: PathBuf::from(DEFAULT_COMPOSE_FILE),
                ..BenchmarkSettings::default()
            },
            identifier_mode: IdentifierMode::Team,
            container_logs_root: PathBuf::from(DEFAULT_CONTAINER_LOGS_PATH),
            solution_container_prefix: DEFAULT_SOLUTION_CONTAINER_PREFIX.to_string(),
            grader_container_name: DEFAULT_GRADER_CONTAINER_NAME.to_string(),
            execution_interval: Duration::from_secs(DEFAULT_EXECUTION_FREQUENCY_SECONDS),
            settle_delay: Duration::from_secs(DEFAULT_SETTLE_DELAY_SECONDS),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let uri = get("CONTROLLER_URI").ok_or(ConfigError::MissingControllerUri)?;
        let mut config = Self::new(uri);

        if let Some(v) = get("CONTROLLER_SCHEDULE_ENDPOINT") {
            config.controller.schedule_endpoint = v;
        }
        if let Some(v) = get("CONTROLLER_STATUS_ENDPOINT") {
            config.controller.status_endpoint = v;
        }
        if let Some(v) = get("CONTROLLER_RESULT_ENDPOINT") {
            config.controller.result_endpoint = v;
        }
        if let Some(v) = get("CONTROLLER_TIMEOUT_SECONDS") {
            config.controller.timeout = Some(Duration::from_secs(parse_u64(
                "CONTROLLER_TIMEOUT_SECONDS",
                &v,
            )?));
        }
        if let Some(v) = get("EXECUTION_FREQUENCY_SECONDS") {
            config.execution_interval =
                Duration::from_secs(parse_u64("EXECUTION_FREQUENCY_SECONDS", &v)?);
        }
        if let Some(v) = get("SETTLE_DELAY_SECONDS") {
            config.settle_delay = Duration::from_secs(parse_u64("SETTLE_DELAY_SECONDS", &v)?);
        }
        if let Some(v) = get("MAX_RETRY_ATTEMPTS") {
            let parsed = parse_u64("MAX_RETRY_ATTEMPTS", &v)?;
            config.max_retry_attempts =
                u32::try_from(parsed).map_err(|_| ConfigError::InvalidNumber {
                    var: "MAX_RETRY_ATTEMPTS",
                    value: v.clone(),
                })?;
        }
        if let Some(v) = get("DOCKER_IMAGE_IDENTIFIER") {
            config.identifier_mode = v.parse()?;
        }
        if let Some(v) = get("CONTAINER_LOGS_PATH") {
            config.container_logs_root = PathBuf::from(v);
        }
        if let Some(v) = get("SOLUTION_CONTAINER_NAME_PREFIX") {
            config.solution_container_prefix = v;
        }
        if let Some(v) = get("GRADER_CONTAINER_NAME") {
            config.grader_container_name = v;
        }
        if let Some(v) = get("BENCHMARK_DOCKER_COMPOSE_TEMPLATE") {
            config.benchmark.template_path = PathBuf::from(v);
        }
        if let Some(v) = get("BENCHMARK_DOCKER_COMPOSE_FILE") {
            config.benchmark.compose_file = PathBuf::from(v);
        }
        if let Some(v) = get("BENCHMARK_HARD_TIMEOUT_SECONDS") {
            config.benchmark.hard_timeout_seconds =
                Some(parse_u64("BENCHMARK_HARD_TIMEOUT_SECONDS", &v)?);
        }
        config.benchmark.container_dataset_path = get("BENCHMARK_CONTAINER_DATASET_PATH");
        config.benchmark.host_dataset_path = get("HOST_DATASET_PATH");
        config.benchmark.host_logs_path = get("HOST_BENCHMARK_LOGS_PATH");
        config.benchmark.container_results_base_path =
            get("BENCHMARK_CONTAINER_RESULTS_BASE_PATH");

        Ok(config)
    }
}

fn parse_u64(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        })
}

/// A bare docker host alias (for example `host.docker.internal`) is expanded to
/// a full http address on the controller's default port.
pub fn normalize_controller_uri(uri: &str) -> String {
    let trimmed = uri.trim().trim_end_matches('/');
    if trimmed.contains("docker") && !trimmed.contains("://") {
        format!("http://{}:{}", trimmed, DOCKER_HOST_CONTROLLER_PORT)
    } else {
        trimmed.to_string()
    }
}

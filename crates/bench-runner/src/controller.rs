//! HTTP protocol spoken with the remote controller.
//!
//! Every call is synchronous and blocks the orchestration loop. Status and
//! result posts never fail the caller: they return a [`Delivery`] describing
//! what happened and log anything other than acceptance.

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ControllerSettings;
use crate::image::ImageRef;
use crate::results::ResultReport;

/// Per-image progress reported to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Queued,
    PullingImage,
    RunningExperiment,
    PreparingResults,
    Retrying,
    Ready,
}

impl RunState {
    /// The string the controller expects on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "Queued",
            RunState::PullingImage => "Pulling image",
            RunState::RunningExperiment => "Running experiment",
            RunState::PreparingResults => "Preparing results",
            RunState::Retrying => "Retrying",
            RunState::Ready => "Ready",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleStatus {
    Updated,
    Other(String),
}

impl ScheduleStatus {
    fn from_value(value: &Value) -> Self {
        match value.as_str() {
            Some("updated") => ScheduleStatus::Updated,
            Some(other) => ScheduleStatus::Other(other.to_string()),
            None => ScheduleStatus::Other(value.to_string()),
        }
    }
}

/// Image reference to status, as published by the controller.
pub type Schedule = BTreeMap<String, ScheduleStatus>;

/// Outcome of a fire-and-forget post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The controller has no record matching the payload.
    NotFound,
    Rejected(u16),
    Unreachable(String),
}

impl Delivery {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Delivery::Accepted)
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to build controller HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("controller request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

pub trait Controller {
    /// Reads the current schedule. Access failures and unreadable bodies
    /// yield an empty schedule; transport failures are returned.
    fn fetch_schedule(&self) -> Result<Schedule, ControllerError>;

    fn report_status(&self, image: &ImageRef, state: RunState) -> Delivery;

    fn report_result(&self, report: &ResultReport) -> Delivery;
}

pub struct ControllerClient {
    settings: ControllerSettings,
    http: Client,
}

impl ControllerClient {
    pub fn new(settings: ControllerSettings) -> Result<Self, ControllerError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(ControllerError::Client)?;
        Ok(Self { settings, http })
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.settings.base_uri, endpoint)
    }

    fn post_json<T: Serialize + ?Sized>(&self, endpoint: &str, payload: &T) -> Delivery {
        let url = self.url(endpoint);
        match self.http.post(&url).json(payload).send() {
            Ok(response) => delivery_from_response(&url, &response),
            Err(e) => {
                error!(url = %url, error = %e, "error posting payload to controller");
                Delivery::Unreachable(e.to_string())
            }
        }
    }
}

fn delivery_from_response(url: &str, response: &Response) -> Delivery {
    match response.status() {
        StatusCode::CREATED => Delivery::Accepted,
        StatusCode::NOT_FOUND => {
            warn!(url = %url, "controller has no record for payload");
            Delivery::NotFound
        }
        other => {
            warn!(url = %url, status = other.as_u16(), "controller rejected payload");
            Delivery::Rejected(other.as_u16())
        }
    }
}

impl Controller for ControllerClient {
    fn fetch_schedule(&self) -> Result<Schedule, ControllerError> {
        let url = self.url(&self.settings.schedule_endpoint);
        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|source| ControllerError::Transport {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        info!(status = status.as_u16(), "scheduler answered");

        if status == StatusCode::FORBIDDEN {
            error!(url = %url, "manager can't access controller: forbidden");
            return Ok(Schedule::new());
        }

        let body = match response.text() {
            Ok(body) => body,
            Err(e) => {
                error!(url = %url, error = %e, "failed to read schedule body");
                return Ok(Schedule::new());
            }
        };
        Ok(parse_schedule(&body))
    }

    fn report_status(&self, image: &ImageRef, state: RunState) -> Delivery {
        debug!(image = %image, state = %state, "reporting status");
        let mut body = Map::new();
        body.insert(
            image.as_str().to_string(),
            Value::String(state.as_str().to_string()),
        );
        self.post_json(&self.settings.status_endpoint, &body)
    }

    fn report_result(&self, report: &ResultReport) -> Delivery {
        debug!(image = %report.image(), "reporting result");
        self.post_json(&self.settings.result_endpoint, report)
    }
}

/// Anything other than a JSON object is treated as an empty schedule.
pub fn parse_schedule(body: &str) -> Schedule {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map
            .iter()
            .map(|(image, status)| (image.clone(), ScheduleStatus::from_value(status)))
            .collect(),
        Ok(other) => {
            error!(body = %other, "schedule is not a JSON object");
            Schedule::new()
        }
        Err(e) => {
            error!(error = %e, "cannot decode schedule; check that the controller is reachable");
            Schedule::new()
        }
    }
}

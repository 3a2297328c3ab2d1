//! Test doubles that record calls and return scripted responses.

use anyhow::{anyhow, Result};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use crate::compose::CompositionRenderer;
use crate::controller::{Controller, ControllerError, Delivery, RunState, Schedule};
use crate::driver::{CompositionRun, RunEvent, RunExit};
use crate::image::ImageRef;
use crate::lifecycle::ContainerRuntime;
use crate::results::ResultReport;

/// One scripted composition: output lines, files the harness leaves behind,
/// and the exit code.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub lines: Vec<String>,
    pub artifacts: Vec<(PathBuf, String)>,
    pub exit: Option<i32>,
}

impl ScriptedRun {
    pub fn exiting(code: i32) -> Self {
        Self {
            exit: Some(code),
            ..Self::default()
        }
    }

    pub fn with_artifact(mut self, path: PathBuf, body: &str) -> Self {
        self.artifacts.push((path, body.to_string()));
        self
    }

    pub fn with_line(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }
}

#[derive(Default)]
pub struct MockRuntime {
    calls: RefCell<Vec<String>>,
    image_ids: RefCell<HashMap<String, String>>,
    failing_pulls: RefCell<HashSet<String>>,
    remove_fails: Cell<bool>,
    runs: RefCell<VecDeque<ScriptedRun>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn set_image_id(&self, image: &str, id: &str) {
        self.image_ids
            .borrow_mut()
            .insert(image.to_string(), id.to_string());
    }

    pub fn fail_pull(&self, image: &str) {
        self.failing_pulls.borrow_mut().insert(image.to_string());
    }

    pub fn fail_remove(&self) {
        self.remove_fails.set(true);
    }

    pub fn push_run(&self, run: ScriptedRun) {
        self.runs.borrow_mut().push_back(run);
    }

    fn record(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }
}

impl ContainerRuntime for MockRuntime {
    fn pull(&self, image: &str) -> Result<()> {
        self.record(format!("pull {}", image));
        if self.failing_pulls.borrow().contains(image) {
            return Err(anyhow!("pull access denied for {}", image));
        }
        Ok(())
    }

    fn inspect_image_id(&self, image: &str) -> Result<String> {
        self.record(format!("inspect {}", image));
        Ok(self
            .image_ids
            .borrow()
            .get(image)
            .cloned()
            .unwrap_or_else(|| format!("sha256:{}", image.replace('/', "-"))))
    }

    fn container_ip(&self, container: &str) -> Result<String> {
        self.record(format!("ip {}", container));
        Ok("172.18.0.2".to_string())
    }

    fn stop_container(&self, container: &str) -> Result<()> {
        self.record(format!("stop {}", container));
        Ok(())
    }

    fn remove_container(&self, container: &str) -> Result<()> {
        self.record(format!("rm {}", container));
        if self.remove_fails.get() {
            return Err(anyhow!("No such container: {}", container));
        }
        Ok(())
    }

    fn capture_logs(&self, container: &str, dest: &Path) -> Result<()> {
        self.record(format!("logs {}", container));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, format!("logs of {}\n", container))?;
        Ok(())
    }

    fn compose_up(&self, compose_file: &Path) -> Result<CompositionRun> {
        self.record(format!("compose-up {}", compose_file.display()));
        let run = self.runs.borrow_mut().pop_front().unwrap_or_default();
        for (path, body) in &run.artifacts {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, body)?;
        }
        let mut events: Vec<RunEvent> = run.lines.into_iter().map(RunEvent::Output).collect();
        events.push(RunEvent::Exited(RunExit {
            code: Some(run.exit.unwrap_or(0)),
        }));
        Ok(CompositionRun::from_events(events))
    }
}

#[derive(Default)]
pub struct MockController {
    schedule: RefCell<Schedule>,
    statuses: RefCell<Vec<(String, RunState)>>,
    results: RefCell<Vec<ResultReport>>,
    result_delivery: RefCell<Option<Delivery>>,
}

impl MockController {
    pub fn with_schedule(schedule: Schedule) -> Self {
        Self {
            schedule: RefCell::new(schedule),
            ..Self::default()
        }
    }

    pub fn statuses(&self) -> Vec<(String, RunState)> {
        self.statuses.borrow().clone()
    }

    pub fn states_for(&self, image: &str) -> Vec<RunState> {
        self.statuses
            .borrow()
            .iter()
            .filter(|(i, _)| i == image)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn results(&self) -> Vec<ResultReport> {
        self.results.borrow().clone()
    }

    pub fn clear(&self) {
        self.statuses.borrow_mut().clear();
        self.results.borrow_mut().clear();
    }

    pub fn answer_results_with(&self, delivery: Delivery) {
        *self.result_delivery.borrow_mut() = Some(delivery);
    }
}

impl Controller for MockController {
    fn fetch_schedule(&self) -> Result<Schedule, ControllerError> {
        Ok(self.schedule.borrow().clone())
    }

    fn report_status(&self, image: &ImageRef, state: RunState) -> Delivery {
        self.statuses
            .borrow_mut()
            .push((image.as_str().to_string(), state));
        Delivery::Accepted
    }

    fn report_result(&self, report: &ResultReport) -> Delivery {
        self.results.borrow_mut().push(report.clone());
        self.result_delivery
            .borrow()
            .clone()
            .unwrap_or(Delivery::Accepted)
    }
}

/// Renderer that writes nothing and can be told to fail.
#[derive(Default)]
pub struct StubRenderer {
    pub fail: bool,
}

impl CompositionRenderer for StubRenderer {
    fn render(&self, image: &ImageRef, _solution_container: &str) -> Result<PathBuf> {
        if self.fail {
            return Err(anyhow!("template unavailable for {}", image));
        }
        Ok(PathBuf::from("docker-compose.yml"))
    }
}

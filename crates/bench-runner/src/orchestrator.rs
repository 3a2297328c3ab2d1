//! The evaluation loop.
//!
//! Each round reads the schedule and walks the updated images one at a time:
//! `Queued → PullingImage → RunningExperiment → PreparingResults →
//! {Retrying | Ready}`. Only one composition ever runs at once.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, error, info, warn};

use crate::compose::CompositionRenderer;
use crate::config::ManagerConfig;
use crate::controller::{Controller, Delivery, RunState, ScheduleStatus};
use crate::driver::RunExit;
use crate::image::ImageRef;
use crate::ledger::{RetryLedger, Verdict};
use crate::lifecycle::{ContainerRuntime, ImageLifecycle};
use crate::results::{ResultExtractor, ResultReport};

pub const SOLUTION_LOG_SUFFIX: &str = "_solution_container.log";
pub const GRADER_LOG_SUFFIX: &str = "_grader_container.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    /// Infrastructure failed before the benchmark ran; nothing was counted.
    Skipped { reason: String },
    Retrying { failures: u32 },
    Reported {
        placeholder: bool,
        delivery: Delivery,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    pub outcomes: Vec<(ImageRef, ImageOutcome)>,
}

impl RoundReport {
    pub fn outcome(&self, image: &str) -> Option<&ImageOutcome> {
        self.outcomes
            .iter()
            .find(|(i, _)| i.as_str() == image)
            .map(|(_, o)| o)
    }
}

/// Ephemeral record of one image's run within a round.
#[derive(Debug)]
struct RunRecord {
    image: ImageRef,
    solution_container: String,
    tag: String,
    exit: RunExit,
    logs: Vec<PathBuf>,
}

/// Receives each composition output line while the run is still going.
pub type OutputSink = Box<dyn FnMut(&ImageRef, &str)>;

fn log_composition_line(image: &ImageRef, line: &str) {
    info!(target: "composition", image = %image, "{}", line);
}

pub struct Orchestrator<C, R, T> {
    config: ManagerConfig,
    controller: C,
    lifecycle: ImageLifecycle<R>,
    renderer: T,
    extractor: ResultExtractor,
    ledger: RetryLedger,
    output: OutputSink,
}

impl<C, R, T> Orchestrator<C, R, T>
where
    C: Controller,
    R: ContainerRuntime,
    T: CompositionRenderer,
{
    pub fn new(config: ManagerConfig, controller: C, runtime: R, renderer: T) -> Self {
        let extractor = ResultExtractor::new(
            config.container_logs_root.clone(),
            config.identifier_mode,
            config.execution_interval,
        );
        let ledger = RetryLedger::new(config.max_retry_attempts);
        Self {
            config,
            controller,
            lifecycle: ImageLifecycle::new(runtime),
            renderer,
            extractor,
            ledger,
            output: Box::new(log_composition_line),
        }
    }

    /// Replaces the default `composition` log target as the destination of
    /// composition output.
    pub fn with_output_sink<F>(mut self, sink: F) -> Self
    where
        F: FnMut(&ImageRef, &str) + 'static,
    {
        self.output = Box::new(sink);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn runtime(&self) -> &R {
        self.lifecycle.runtime()
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    pub fn run_forever(&mut self) -> ! {
        info!(
            interval_secs = self.config.execution_interval.as_secs(),
            "manager will wait between executions"
        );
        loop {
            self.run_round();
            thread::sleep(self.config.execution_interval);
        }
    }

    pub fn run_round(&mut self) -> RoundReport {
        info!("benchmark manager round started");
        let images = self.queue_updated_images();

        self.lifecycle
            .retire_harness(&self.config.grader_container_name);

        info!(images = ?images.iter().map(|i| i.as_str()).collect::<Vec<_>>(), "current scheduled images");
        if !self.config.settle_delay.is_zero() {
            thread::sleep(self.config.settle_delay);
        }

        let mut report = RoundReport::default();
        for image in images {
            let outcome = self.process_image(&image);
            report.outcomes.push((image, outcome));
        }
        info!(retry_attempts = ?self.ledger.snapshot(), "evaluation complete");
        report
    }

    /// Reads the schedule and announces every updated image as queued.
    pub fn queue_updated_images(&self) -> Vec<ImageRef> {
        let schedule = match self.controller.fetch_schedule() {
            Ok(schedule) => schedule,
            Err(e) => {
                error!(error = %e, "failed to fetch schedule; no images this round");
                return Vec::new();
            }
        };
        let mut queued = Vec::new();
        for (reference, status) in schedule {
            if status != ScheduleStatus::Updated {
                continue;
            }
            match ImageRef::parse(&reference) {
                Ok(image) => {
                    self.controller.report_status(&image, RunState::Queued);
                    queued.push(image);
                }
                Err(e) => {
                    error!(error = %e, "incorrectly specified image; expected team/repo");
                }
            }
        }
        queued
    }

    fn process_image(&mut self, image: &ImageRef) -> ImageOutcome {
        let solution_container = image.container_name(
            &self.config.solution_container_prefix,
            self.config.identifier_mode,
        );
        self.lifecycle.cleanup_stale_container(&solution_container);

        self.controller.report_status(image, RunState::PullingImage);
        let prepared = match self.lifecycle.prepare(image) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(image = %image, error = %format!("{:#}", e), "error accessing image");
                return ImageOutcome::Skipped {
                    reason: format!("{:#}", e),
                };
            }
        };

        let compose_file = match self.renderer.render(image, &solution_container) {
            Ok(path) => path,
            Err(e) => {
                error!(image = %image, error = %format!("{:#}", e), "cannot render composition");
                return ImageOutcome::Skipped {
                    reason: format!("{:#}", e),
                };
            }
        };

        self.controller
            .report_status(image, RunState::RunningExperiment);
        let exit = self.run_composition(image, &compose_file);

        self.controller
            .report_status(image, RunState::PreparingResults);
        let mut record = RunRecord {
            image: image.clone(),
            solution_container,
            tag: prepared.tag,
            exit,
            logs: Vec::new(),
        };
        self.save_container_logs(&mut record);
        info!(image = %image, "image completed");

        let result = match self
            .extractor
            .extract(&record.image, &record.tag, Utc::now())
        {
            Ok(result) => result,
            Err(e) => {
                error!(image = %image, error = %format!("{:#}", e), "failed to extract results");
                None
            }
        };
        if result.is_none() {
            error!(image = %image, "no results after benchmark run");
        }

        match self
            .ledger
            .record_outcome(image.as_str(), record.exit.success(), result.is_some())
        {
            Verdict::Succeeded => {}
            Verdict::Retry { failures } => {
                error!(
                    image = %image,
                    exit = %record.exit,
                    failures,
                    "composition failed without results; will retry on next round"
                );
                self.controller.report_status(image, RunState::Retrying);
                return ImageOutcome::Retrying { failures };
            }
            Verdict::Exhausted { failures } => {
                // Still reported as Ready with a placeholder result, although
                // nothing was measured. Kept for controller compatibility.
                error!(
                    image = %image,
                    exit = %record.exit,
                    failures,
                    "image has exceeded maximum retry attempts"
                );
            }
        }

        let report = match result {
            Some(result) => ResultReport::Measured(result),
            None => ResultReport::placeholder(image),
        };
        self.controller.report_status(image, RunState::Ready);
        let delivery = self.controller.report_result(&report);
        if !delivery.is_accepted() {
            warn!(image = %image, delivery = ?delivery, "result was not accepted and is dropped");
        }
        debug!(image = %image, logs = ?record.logs, "run record closed");
        info!(image = %image, "completed run for image");
        ImageOutcome::Reported {
            placeholder: report.is_placeholder(),
            delivery,
        }
    }

    fn run_composition(&mut self, image: &ImageRef, compose_file: &Path) -> RunExit {
        let run = match self.lifecycle.runtime().compose_up(compose_file) {
            Ok(run) => run,
            Err(e) => {
                error!(image = %image, error = %format!("{:#}", e), "failed to launch composition");
                return RunExit { code: None };
            }
        };
        let output = &mut self.output;
        let exit = run.stream(|line| output(image, line));
        if exit.success() {
            debug!(image = %image, "docker-compose exited");
        } else {
            info!(image = %image, exit = %exit, "benchmark composition done with non-zero exit");
        }
        exit
    }

    fn save_container_logs(&self, record: &mut RunRecord) {
        let dir = self.extractor.log_dir(&record.image);
        let key = record.image.identifier(self.config.identifier_mode);
        let targets = [
            (
                record.solution_container.clone(),
                dir.join(format!("{}{}", key, SOLUTION_LOG_SUFFIX)),
            ),
            (
                self.config.grader_container_name.clone(),
                dir.join(format!("{}{}", key, GRADER_LOG_SUFFIX)),
            ),
        ];
        for (container, dest) in targets {
            if self.lifecycle.save_logs(&container, &dest) {
                record.logs.push(dest);
            }
        }
        debug!(image = %record.image, saved = record.logs.len(), "container logs saved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Schedule;
    use crate::fsutil::scratch_dir;
    use crate::testing::{MockController, MockRuntime, ScriptedRun, StubRenderer};
    use chrono::Timelike;
    use serde_json::json;
    use std::cell::RefCell;
    use std::fs;
    use std::rc::Rc;
    use std::time::Duration;

    type TestOrchestrator = Orchestrator<MockController, MockRuntime, StubRenderer>;

    fn config(logs_root: &Path) -> ManagerConfig {
        let mut config = ManagerConfig::new("http://controller.invalid");
        config.container_logs_root = logs_root.to_path_buf();
        config.settle_delay = Duration::ZERO;
        config.execution_interval = Duration::from_secs(30);
        config
    }

    fn schedule(entries: &[(&str, &str)]) -> Schedule {
        entries
            .iter()
            .map(|(image, status)| {
                let status = if *status == "updated" {
                    ScheduleStatus::Updated
                } else {
                    ScheduleStatus::Other(status.to_string())
                };
                (image.to_string(), status)
            })
            .collect()
    }

    fn orchestrator(logs_root: &Path, entries: &[(&str, &str)]) -> TestOrchestrator {
        Orchestrator::new(
            config(logs_root),
            MockController::with_schedule(schedule(entries)),
            MockRuntime::new(),
            StubRenderer::default(),
        )
    }

    #[test]
    fn successful_round_reports_full_sequence_and_result() {
        let root = scratch_dir("orch_success");
        let mut orch = orchestrator(&root, &[("t1/img", "updated"), ("t2/img", "unchanged")]);
        orch.runtime().set_image_id("t1/img", "sha256:abc");
        orch.runtime().push_run(
            ScriptedRun::exiting(0)
                .with_line("grader: starting")
                .with_artifact(root.join("t1").join("results.json"), r#"{"computed_scenes": 5}"#),
        );

        let report = orch.run_round();

        assert_eq!(
            orch.controller().states_for("t1/img"),
            vec![
                RunState::Queued,
                RunState::PullingImage,
                RunState::RunningExperiment,
                RunState::PreparingResults,
                RunState::Ready,
            ]
        );
        assert!(orch.controller().states_for("t2/img").is_empty());

        let results = orch.controller().results();
        assert_eq!(results.len(), 1);
        let payload = serde_json::to_value(&results[0]).expect("serialize");
        assert_eq!(payload["computed_scenes"], json!(5));
        assert_eq!(payload["image"], json!("t1/img"));
        assert_eq!(payload["tag"], json!("sha256:abc"));
        assert_eq!(payload["retry_budget_seconds"], json!(30));
        match &results[0] {
            ResultReport::Measured(result) => {
                assert_eq!(result.last_run.second(), 0);
                assert_eq!(result.last_run.nanosecond(), 0);
            }
            other => panic!("expected measured result, got {:?}", other),
        }

        assert_eq!(
            report.outcome("t1/img"),
            Some(&ImageOutcome::Reported {
                placeholder: false,
                delivery: Delivery::Accepted,
            })
        );
        assert_eq!(
            orch.runtime().calls(),
            vec![
                "stop debs-2020-grader",
                "rm debs-2020-grader",
                "rm solution-app-t1",
                "pull t1/img",
                "inspect t1/img",
                "compose-up docker-compose.yml",
                "logs solution-app-t1",
                "logs debs-2020-grader",
            ]
        );
        assert!(root.join("t1").join("t1_solution_container.log").exists());
        assert!(root.join("t1").join("t1_grader_container.log").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn composition_output_reaches_sink_in_order() {
        let root = scratch_dir("orch_output");
        let seen: Rc<RefCell<Vec<(String, String)>>> = Rc::default();
        let sink = Rc::clone(&seen);
        let mut orch = orchestrator(&root, &[("t1/img", "updated")]).with_output_sink(
            move |image, line| {
                sink.borrow_mut()
                    .push((image.as_str().to_string(), line.to_string()));
            },
        );
        orch.runtime().push_run(
            ScriptedRun::exiting(0)
                .with_line("grader: starting")
                .with_line("grader: scene 1 sent")
                .with_line("solution: done")
                .with_artifact(root.join("t1").join("results.json"), r#"{"computed_scenes": 1}"#),
        );

        orch.run_round();

        assert_eq!(
            *seen.borrow(),
            vec![
                ("t1/img".to_string(), "grader: starting".to_string()),
                ("t1/img".to_string(), "grader: scene 1 sent".to_string()),
                ("t1/img".to_string(), "solution: done".to_string()),
            ]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn retries_stop_after_budget_and_placeholder_is_reported() {
        let root = scratch_dir("orch_retry");
        let mut orch = orchestrator(&root, &[("t1/img", "updated")]);
        let max = orch.config().max_retry_attempts;

        for attempt in 1..=max {
            orch.controller().clear();
            orch.runtime().push_run(ScriptedRun::exiting(1));
            let report = orch.run_round();
            assert_eq!(
                report.outcome("t1/img"),
                Some(&ImageOutcome::Retrying { failures: attempt })
            );
            assert_eq!(
                orch.controller().states_for("t1/img").last(),
                Some(&RunState::Retrying)
            );
            assert!(orch.controller().results().is_empty());
        }

        // Known inconsistency: the attempt past the budget is reported Ready
        // with a placeholder even though nothing was measured.
        orch.controller().clear();
        orch.runtime().push_run(ScriptedRun::exiting(1));
        let report = orch.run_round();
        let states = orch.controller().states_for("t1/img");
        assert!(!states.contains(&RunState::Retrying));
        assert_eq!(states.last(), Some(&RunState::Ready));
        assert_eq!(
            report.outcome("t1/img"),
            Some(&ImageOutcome::Reported {
                placeholder: true,
                delivery: Delivery::Accepted,
            })
        );
        let payload = serde_json::to_value(&orch.controller().results()[0]).expect("json");
        assert_eq!(payload, json!({"image": "t1/img"}));
        assert_eq!(orch.ledger().failures("t1/img"), max + 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn pull_failure_skips_image_without_counting() {
        let root = scratch_dir("orch_pull");
        let mut orch = orchestrator(&root, &[("a/one", "updated"), ("b/two", "updated")]);
        orch.runtime().fail_pull("a/one");
        orch.runtime().push_run(
            ScriptedRun::exiting(0).with_artifact(root.join("b").join("r.json"), r#"{"x": 1}"#),
        );

        let report = orch.run_round();

        assert!(matches!(
            report.outcome("a/one"),
            Some(ImageOutcome::Skipped { .. })
        ));
        assert_eq!(
            orch.controller().states_for("a/one"),
            vec![RunState::Queued, RunState::PullingImage]
        );
        assert_eq!(orch.ledger().failures("a/one"), 0);
        assert_eq!(
            orch.controller().states_for("b/two").last(),
            Some(&RunState::Ready)
        );
        assert_eq!(orch.controller().results().len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn render_failure_is_infrastructural() {
        let root = scratch_dir("orch_render");
        let mut orch = Orchestrator::new(
            config(&root),
            MockController::with_schedule(schedule(&[("t1/img", "updated")])),
            MockRuntime::new(),
            StubRenderer { fail: true },
        );
        let report = orch.run_round();
        assert!(matches!(
            report.outcome("t1/img"),
            Some(ImageOutcome::Skipped { .. })
        ));
        assert!(!orch
            .runtime()
            .calls()
            .iter()
            .any(|c| c.starts_with("compose-up")));
        assert_eq!(orch.ledger().failures("t1/img"), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn non_zero_exit_with_result_is_a_success() {
        let root = scratch_dir("orch_partial");
        let mut orch = orchestrator(&root, &[("t1/img", "updated")]);
        orch.runtime().push_run(
            ScriptedRun::exiting(137)
                .with_artifact(root.join("t1").join("results.json"), r#"{"computed_scenes": 2}"#),
        );
        orch.run_round();
        assert_eq!(orch.ledger().failures("t1/img"), 0);
        assert_eq!(
            orch.controller().states_for("t1/img").last(),
            Some(&RunState::Ready)
        );
        let payload = serde_json::to_value(&orch.controller().results()[0]).expect("json");
        assert_eq!(payload["computed_scenes"], json!(2));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rejected_result_is_dropped_not_retried() {
        let root = scratch_dir("orch_rejected");
        let mut orch = orchestrator(&root, &[("t1/img", "updated")]);
        orch.controller().answer_results_with(Delivery::NotFound);
        orch.runtime().push_run(
            ScriptedRun::exiting(0)
                .with_artifact(root.join("t1").join("results.json"), r#"{"computed_scenes": 1}"#),
        );
        let report = orch.run_round();
        assert_eq!(
            report.outcome("t1/img"),
            Some(&ImageOutcome::Reported {
                placeholder: false,
                delivery: Delivery::NotFound,
            })
        );

        orch.controller().clear();
        orch.runtime().push_run(ScriptedRun::exiting(0));
        orch.run_round();
        let payload = serde_json::to_value(&orch.controller().results()[0]).expect("json");
        assert_eq!(payload, json!({"image": "t1/img"}));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn malformed_schedule_entries_are_ignored() {
        let root = scratch_dir("orch_malformed");
        let mut orch = orchestrator(&root, &[("noslash", "updated")]);
        let report = orch.run_round();
        assert!(report.outcomes.is_empty());
        assert!(orch.controller().statuses().is_empty());
        assert_eq!(
            orch.runtime().calls(),
            vec!["stop debs-2020-grader", "rm debs-2020-grader"]
        );
        let _ = fs::remove_dir_all(root);
    }
}

//! Materializing the docker-compose descriptor for one image.

use anyhow::{anyhow, Context, Result};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::config::BenchmarkSettings;
use crate::fsutil::atomic_write_bytes;
use crate::image::{IdentifierMode, ImageRef};

pub const SOLUTION_SERVICE: &str = "solution";
pub const GRADER_SERVICE: &str = "grader";

pub trait CompositionRenderer {
    /// Writes a descriptor running `image` as `solution_container` and returns
    /// its path.
    fn render(&self, image: &ImageRef, solution_container: &str) -> Result<PathBuf>;
}

/// Renders from a YAML template with `solution` and `grader` services.
#[derive(Debug, Clone)]
pub struct ComposeTemplate {
    settings: BenchmarkSettings,
    grader_container: String,
    mode: IdentifierMode,
}

impl ComposeTemplate {
    pub fn new(
        settings: BenchmarkSettings,
        grader_container: impl Into<String>,
        mode: IdentifierMode,
    ) -> Self {
        Self {
            settings,
            grader_container: grader_container.into(),
            mode,
        }
    }

    pub fn render_document(
        &self,
        template: &str,
        image: &ImageRef,
        solution_container: &str,
    ) -> Result<String> {
        let hard_timeout = self
            .settings
            .hard_timeout_seconds
            .ok_or_else(|| missing("BENCHMARK_HARD_TIMEOUT_SECONDS"))?;
        let container_dataset = required(
            &self.settings.container_dataset_path,
            "BENCHMARK_CONTAINER_DATASET_PATH",
        )?;
        let host_dataset = required(&self.settings.host_dataset_path, "HOST_DATASET_PATH")?;
        let host_logs = required(&self.settings.host_logs_path, "HOST_BENCHMARK_LOGS_PATH")?;
        let results_base = required(
            &self.settings.container_results_base_path,
            "BENCHMARK_CONTAINER_RESULTS_BASE_PATH",
        )?;
        let results_path = format!(
            "{}/{}",
            results_base.trim_end_matches('/'),
            image.identifier(self.mode)
        );
        info!(image = %image, results_path = %results_path, "results will be stored in");

        let mut doc: Value =
            serde_yaml::from_str(template).context("compose template is not valid YAML")?;

        let solution = service_mut(&mut doc, SOLUTION_SERVICE)?;
        set(solution, "container_name", Value::String(solution_container.to_string()));
        set(solution, "image", Value::String(image.as_str().to_string()));

        let grader = service_mut(&mut doc, GRADER_SERVICE)?;
        set(grader, "container_name", Value::String(self.grader_container.clone()));

        let env = child_mapping(grader, "environment")?;
        set(env, "HARD_TIMEOUT_SECONDS", Value::Number(hard_timeout.into()));
        set(env, "DATASET_PATH", Value::String(container_dataset.to_string()));
        set(env, "RESULTS_PATH", Value::String(results_path));

        let volumes = child_sequence(grader, "volumes")?;
        set_index(
            volumes,
            0,
            Value::String(format!("{}:{}", host_dataset, container_dataset)),
        );
        set_index(
            volumes,
            1,
            Value::String(format!("{}:{}", host_logs, results_base)),
        );

        serde_yaml::to_string(&doc).context("failed to serialize compose descriptor")
    }
}

impl CompositionRenderer for ComposeTemplate {
    fn render(&self, image: &ImageRef, solution_container: &str) -> Result<PathBuf> {
        info!(
            image = %image,
            container = %solution_container,
            "creating docker-compose descriptor"
        );
        let template_path = &self.settings.template_path;
        let template = fs::read_to_string(template_path)
            .with_context(|| format!("failed to read {}", template_path.display()))?;
        let rendered = self.render_document(&template, image, solution_container)?;
        let out = self.settings.compose_file.clone();
        atomic_write_bytes(&out, rendered.as_bytes())?;
        info!(path = %out.display(), "compose descriptor saved");
        Ok(out)
    }
}

fn missing(var: &str) -> anyhow::Error {
    anyhow!("{} is not set; cannot render the composition", var)
}

fn required<'a>(value: &'a Option<String>, var: &str) -> Result<&'a str> {
    value.as_deref().ok_or_else(|| missing(var))
}

fn service_mut<'a>(doc: &'a mut Value, name: &str) -> Result<&'a mut Mapping> {
    doc.get_mut("services")
        .and_then(|s| s.get_mut(name))
        .and_then(|s| s.as_mapping_mut())
        .ok_or_else(|| anyhow!("compose template has no services.{} block", name))
}

fn child_mapping<'a>(parent: &'a mut Mapping, key: &str) -> Result<&'a mut Mapping> {
    let slot = parent
        .entry(Value::String(key.to_string()))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if slot.is_null() {
        *slot = Value::Mapping(Mapping::new());
    }
    slot.as_mapping_mut()
        .ok_or_else(|| anyhow!("compose template field '{}' must be a mapping", key))
}

fn child_sequence<'a>(parent: &'a mut Mapping, key: &str) -> Result<&'a mut Vec<Value>> {
    let slot = parent
        .entry(Value::String(key.to_string()))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if slot.is_null() {
        *slot = Value::Sequence(Vec::new());
    }
    slot.as_sequence_mut()
        .ok_or_else(|| anyhow!("compose template field '{}' must be a list", key))
}

fn set(map: &mut Mapping, key: &str, value: Value) {
    map.insert(Value::String(key.to_string()), value);
}

fn set_index(seq: &mut Vec<Value>, index: usize, value: Value) {
    if index < seq.len() {
        seq[index] = value;
    } else {
        seq.push(value);
    }
}

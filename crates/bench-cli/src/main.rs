use anyhow::Result;
use bench_runner::{
    ComposeTemplate, CompositionRenderer, ContainerRuntime, Controller, ControllerClient,
    DockerCli, ImageOutcome, ImageRef, ManagerConfig, Orchestrator, ResultExtractor, RoundReport,
    ScheduleStatus,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bench-manager",
    version = "0.3.0",
    about = "Continuous benchmark manager for published solution images"
)]
struct Cli {
    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate scheduled images forever, sleeping between rounds
    Run {
        /// Run a single round and exit
        #[arg(long)]
        once: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the controller's current schedule
    Schedule {
        #[arg(long)]
        json: bool,
    },
    /// Consume the pending result artifact of an image and print it enriched
    Extract {
        image: String,
        /// Build id to stamp on the result; defaults to the local image id
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Write the compose descriptor for an image without running it
    Render {
        image: String,
        #[arg(long)]
        json: bool,
    },
    /// Print the network address of a running container
    ContainerIp {
        container: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { once, json } => {
            let mut orchestrator = build_orchestrator(load_config()?)?;
            if !once {
                orchestrator.run_forever();
            }
            let report = orchestrator.run_round();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "round": round_to_json(&report)
                })));
            }
            print_round(&report);
        }
        Commands::Schedule { json } => {
            let controller = ControllerClient::new(load_config()?.controller)?;
            let schedule = controller.fetch_schedule()?;
            if json {
                let entries: serde_json::Map<String, Value> = schedule
                    .iter()
                    .map(|(image, status)| (image.clone(), json!(status_str(status))))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "schedule",
                    "schedule": entries
                })));
            }
            for (image, status) in &schedule {
                println!("{}: {}", image, status_str(status));
            }
        }
        Commands::Extract { image, tag, json } => {
            let config = load_config()?;
            let image = ImageRef::parse(&image)?;
            let tag = match tag {
                Some(tag) => tag,
                None => DockerCli::default().inspect_image_id(image.as_str())?,
            };
            let extractor = ResultExtractor::new(
                config.container_logs_root,
                config.identifier_mode,
                config.execution_interval,
            );
            let result = extractor.extract(&image, &tag, Utc::now())?;
            let result = match result {
                Some(result) => serde_json::to_value(&result)?,
                None => Value::Null,
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "extract",
                    "image": image.as_str(),
                    "result": result
                })));
            }
            if result.is_null() {
                println!("{}: no result", image);
            } else {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        }
        Commands::Render { image, json } => {
            let config = load_config()?;
            let image = ImageRef::parse(&image)?;
            let container =
                image.container_name(&config.solution_container_prefix, config.identifier_mode);
            let template = ComposeTemplate::new(
                config.benchmark,
                config.grader_container_name,
                config.identifier_mode,
            );
            let path = template.render(&image, &container)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "render",
                    "image": image.as_str(),
                    "solution_container": container,
                    "compose_file": path.display().to_string()
                })));
            }
            println!("compose_file: {}", path.display());
            println!("solution_container: {}", container);
        }
        Commands::ContainerIp { container, json } => {
            let ip = DockerCli::default().container_ip(&container)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "container-ip",
                    "container": container,
                    "ip": ip
                })));
            }
            println!("{}", ip);
        }
    }
    Ok(None)
}

fn load_config() -> Result<ManagerConfig> {
    let config = ManagerConfig::from_env()?;
    tracing::debug!(controller = %config.controller.base_uri, "configuration loaded");
    Ok(config)
}

fn build_orchestrator(
    config: ManagerConfig,
) -> Result<Orchestrator<ControllerClient, DockerCli, ComposeTemplate>> {
    let controller = ControllerClient::new(config.controller.clone())?;
    let renderer = ComposeTemplate::new(
        config.benchmark.clone(),
        config.grader_container_name.clone(),
        config.identifier_mode,
    );
    Ok(Orchestrator::new(
        config,
        controller,
        DockerCli::default(),
        renderer,
    ))
}

fn status_str(status: &ScheduleStatus) -> &str {
    match status {
        ScheduleStatus::Updated => "updated",
        ScheduleStatus::Other(other) => other.as_str(),
    }
}

fn outcome_to_json(outcome: &ImageOutcome) -> Value {
    match outcome {
        ImageOutcome::Skipped { reason } => json!({ "outcome": "skipped", "reason": reason }),
        ImageOutcome::Retrying { failures } => {
            json!({ "outcome": "retrying", "failures": failures })
        }
        ImageOutcome::Reported {
            placeholder,
            delivery,
        } => json!({
            "outcome": "reported",
            "placeholder": placeholder,
            "accepted": delivery.is_accepted(),
            "delivery": format!("{:?}", delivery)
        }),
    }
}

fn round_to_json(report: &RoundReport) -> Value {
    let images: Vec<Value> = report
        .outcomes
        .iter()
        .map(|(image, outcome)| {
            let mut entry = outcome_to_json(outcome);
            entry["image"] = json!(image.as_str());
            entry
        })
        .collect();
    json!({ "images": images })
}

fn print_round(report: &RoundReport) {
    if report.outcomes.is_empty() {
        println!("no images scheduled");
    }
    for (image, outcome) in &report.outcomes {
        match outcome {
            ImageOutcome::Skipped { reason } => println!("{}: skipped ({})", image, reason),
            ImageOutcome::Retrying { failures } => {
                println!("{}: retrying (failures: {})", image, failures)
            }
            ImageOutcome::Reported {
                placeholder,
                delivery,
            } => println!(
                "{}: ready (placeholder: {}, delivery: {:?})",
                image, placeholder, delivery
            ),
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Schedule { json }
        | Commands::Extract { json, .. }
        | Commands::Render { json, .. }
        | Commands::ContainerIp { json, .. } => *json,
    }
}

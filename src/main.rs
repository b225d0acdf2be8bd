mod cli;
mod config;
mod coordinator;
mod dsl;
mod error;
mod executor;
mod logging;
mod orchestrator;
mod planner;
mod runtime;
mod state_machine;
mod store;
mod ui;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cli::{Cli, Command, JobCommand, PolicyCommand};
use config::ReelgateConfig;
use coordinator::Coordinator;
use dsl::{AssetLibrary, Scene, SceneInventory};
use error::ReelgateError;
use executor::{ManifestEditor, MediaSources};
use planner::{ChatPlanner, PlanRequest, TranscriptSegment};
use runtime::{Detector, HostMetrics, RuntimeProfile};
use state_machine::{JobState, JobUpdate};
use ui::JobProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let mut config = ReelgateConfig::load(cli.config.as_deref())?;

    if let Command::Profile { tier: Some(tier), .. } = &cli.command {
        config.runtime.force_tier = Some(*tier);
    }

    let profile = load_profile(&config).await?;
    let coordinator = Coordinator::new(config, profile)?;

    match cli.command {
        Command::Status => {
            let status = coordinator.system_status();
            if cli.json {
                ui::print_json(&status);
            } else {
                ui::print_status(&status);
            }
        }
        Command::Job { command } => run_job_command(&coordinator, command, cli.json)?,
        Command::Validate {
            plan,
            scenes,
            assets,
        } => {
            let plan: Value = read_json(&plan)?;
            let inventory: SceneInventory = read_json(&scenes)?;
            let assets = read_assets(assets.as_deref())?;
            let errors = coordinator.validate_plan(&plan, &inventory, assets.as_ref());
            if cli.json {
                ui::print_json(&json!({"valid": errors.is_empty(), "errors": errors}));
            } else {
                ui::print_validation(&errors);
            }
            if !errors.is_empty() {
                return Err(ReelgateError::Validation(errors).into());
            }
        }
        Command::Plan {
            job_id,
            scenes,
            transcript,
            style,
            assets,
        } => {
            let drafter = ChatPlanner::new(&coordinator.config().planner)?;
            let transcript: Vec<TranscriptSegment> = match transcript {
                Some(path) => read_json(&path)?,
                None => Vec::new(),
            };
            let request = PlanRequest {
                inventory: read_json(&scenes)?,
                transcript,
                style_prompt: style,
                assets: read_assets(assets.as_deref())?,
            };
            let plan = coordinator.draft_plan(&drafter, &job_id, &request).await?;
            if cli.json {
                ui::print_json(&plan);
            } else {
                println!("plan written to {}", coordinator.plan_path(&job_id).display());
            }
        }
        Command::Execute {
            job_id,
            plan,
            scenes,
            assets,
            source,
            subtitles,
        } => {
            let plan_path = plan.unwrap_or_else(|| coordinator.plan_path(&job_id));
            let plan: Value = read_json(&plan_path)?;
            let inventory: SceneInventory = read_json(&scenes)?;
            let assets = read_assets(assets.as_deref())?;
            let media = MediaSources {
                timeline_name: job_id.clone(),
                source,
                subtitles,
                output: default_output(&coordinator, &job_id),
            };
            execute(&coordinator, &job_id, &plan, &inventory, assets.as_ref(), &media)?;
        }
        Command::Policy { command } => match command {
            PolicyCommand::Show => {
                let policy = coordinator.policy().get();
                if cli.json {
                    ui::print_json(&policy);
                } else {
                    ui::print_policy(&policy);
                }
            }
            PolicyCommand::Degrade { reason } => {
                let policy = coordinator.degrade(&reason);
                let path = &coordinator.config().runtime.profile_path;
                coordinator.policy().profile().save(path)?;
                if cli.json {
                    ui::print_json(&policy);
                } else {
                    ui::print_policy(&policy);
                }
            }
        },
        Command::Monitor { samples } => run_monitor(&coordinator, samples, cli.json).await?,
        Command::Demo => run_demo(&coordinator)?,
        Command::ReleaseLocks => {
            let paused = coordinator.release_all_locks()?;
            let status = coordinator.system_status();
            if cli.json {
                ui::print_json(&json!({"paused": paused, "status": status.orchestrator}));
            } else {
                for job_id in &paused {
                    println!("paused {job_id}");
                }
                ui::print_status(&status);
            }
        }
        Command::Profile { save, .. } => {
            // Fresh readings replace the cached profile; earlier degradations carry over.
            let runtime = &coordinator.config().runtime;
            let detected = Detector::new(runtime)?.detect(runtime).await;
            coordinator.policy().reload(detected);
            let profile = coordinator.policy().profile();
            if save {
                profile.save(&runtime.profile_path)?;
                info!(path = %runtime.profile_path.display(), "profile saved");
            }
            if cli.json {
                ui::print_json(&profile);
            } else {
                ui::print_policy(&coordinator.policy().get());
            }
        }
    }

    Ok(())
}

/// Reuses the saved profile when there is one; otherwise detects and saves.
async fn load_profile(config: &ReelgateConfig) -> Result<RuntimeProfile> {
    let path = &config.runtime.profile_path;
    if path.exists() {
        match RuntimeProfile::load(path) {
            Ok(profile) => return Ok(profile),
            Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable profile"),
        }
    }
    let profile = Detector::new(&config.runtime)?
        .detect(&config.runtime)
        .await;
    if let Err(e) = profile.save(path) {
        warn!(path = %path.display(), error = %e, "could not save runtime profile");
    }
    Ok(profile)
}

fn run_job_command(coordinator: &Coordinator, command: JobCommand, as_json: bool) -> Result<()> {
    let store = coordinator.store();
    match command {
        JobCommand::Create => {
            let job = store.create()?;
            if as_json {
                ui::print_json(&job);
            } else {
                println!("{}", job.job_id);
            }
        }
        JobCommand::Show { job_id } => {
            let job = store.get(&job_id)?;
            if as_json {
                ui::print_json(&job);
            } else {
                ui::print_job(&job);
            }
        }
        JobCommand::List { limit } => {
            let jobs = store.list(limit)?;
            if as_json {
                ui::print_json(&jobs);
            } else {
                ui::print_jobs(&jobs);
            }
        }
        JobCommand::Transition {
            job_id,
            state,
            force,
        } => {
            let (job, outcome) = store.transition(&job_id, state, force)?;
            if as_json {
                ui::print_json(&outcome);
            } else {
                println!("{}: {} → {}", job.job_id, outcome.from, outcome.to);
                for (resource, held) in &outcome.reconciled {
                    println!("  reconciled {resource} to {held}");
                }
            }
        }
        JobCommand::Check { job_id, state } => {
            let admission = coordinator.check_transition(&job_id, state)?;
            if as_json {
                ui::print_json(&admission);
            } else if admission.allowed {
                println!("{job_id} may enter {state}");
            } else {
                println!("{job_id} may not enter {state}: {}", admission.reason);
            }
        }
        JobCommand::Update {
            job_id,
            status,
            progress,
            error,
            result,
            state,
        } => {
            let result = result
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--result must be JSON")?;
            let update = JobUpdate {
                status,
                progress,
                error: error.map(|message| json!({"message": message})),
                result,
                state,
            };
            let job = store.update(&job_id, update)?;
            if as_json {
                ui::print_json(&job);
            } else {
                ui::print_job(&job);
            }
        }
        JobCommand::Delete { job_id } => {
            store.delete(&job_id)?;
            println!("deleted {job_id}");
        }
        JobCommand::Artifacts { job_id } => ui::print_json(&store.artifacts(&job_id)?),
        JobCommand::Trace { job_id } => match store.trace(&job_id)? {
            Some(summary) => ui::print_json(&summary),
            None => println!("no trace for {job_id}"),
        },
    }
    Ok(())
}

fn execute(
    coordinator: &Coordinator,
    job_id: &str,
    plan: &Value,
    inventory: &SceneInventory,
    assets: Option<&AssetLibrary>,
    media: &MediaSources,
) -> Result<()> {
    let progress = JobProgress::start(job_id);
    let validated = match coordinator.start_execution(job_id, plan, inventory, assets, media) {
        Ok(validated) => validated,
        Err(ReelgateError::Validation(errors)) => {
            progress.complete(&coordinator.job(job_id)?);
            ui::print_validation(&errors);
            return Err(ReelgateError::Validation(errors).into());
        }
        Err(e) => return Err(e.into()),
    };
    progress.update_state(job_id, JobState::Executing);

    let mut editor = ManifestEditor::default();
    let report = coordinator.execute_plan(job_id, &mut editor, &validated, media)?;
    progress.complete(&coordinator.job(job_id)?);
    if report.succeeded() {
        println!("  edit list written to {}", report.output.display());
    }
    Ok(())
}

async fn run_monitor(coordinator: &Coordinator, samples: Option<u32>, as_json: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    let monitor = coordinator.monitor().clone();
    let source = HostMetrics::new(coordinator.orchestrator().clone());
    let handle = tokio::spawn(monitor.run(source, shutdown.clone()));

    match samples {
        Some(n) => {
            let interval = coordinator.config().monitor.interval_secs.max(1);
            // The first tick fires immediately.
            let wait = interval * u64::from(n.saturating_sub(1)) + 1;
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }
        None => {
            println!("monitoring, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }
    shutdown.cancel();
    handle.await?;

    let status = coordinator.system_status();
    if as_json {
        ui::print_json(&status.monitor);
    } else {
        ui::print_status(&status);
    }
    Ok(())
}

/// Takes a job through every stage with a fixed two-scene plan and the
/// manifest editor.
fn run_demo(coordinator: &Coordinator) -> Result<()> {
    let store = coordinator.store();
    let job = store.create()?;
    let job_id = job.job_id.clone();
    let progress = JobProgress::start(&job_id);

    let inventory = SceneInventory::new(
        30.0,
        vec![
            Scene {
                scene_id: "S0001".into(),
                start_frame: 0,
                end_frame: 120,
                start_tc: None,
                end_tc: None,
            },
            Scene {
                scene_id: "S0002".into(),
                start_frame: 120,
                end_frame: 300,
                start_tc: None,
                end_tc: None,
            },
        ],
    )?
    .with_primary_clip("demo/source.mp4");

    for state in [
        JobState::Ingesting,
        JobState::Ingested,
        JobState::Analyzing,
        JobState::Analyzed,
        JobState::Planning,
    ] {
        store.transition(&job_id, state, false)?;
        progress.update_state(&job_id, state);
    }

    let plan = json!({
        "meta": {"schema": "editing_dsl.v1", "target": "douyin", "aspect": "9:16"},
        "editing_plan": {
            "timeline": [
                {"order": 1, "scene_id": "S0001", "trim_frames": [10, 100], "purpose": "hook"},
                {"order": 2, "scene_id": "S0002", "trim_frames": [130, 280], "purpose": "body"}
            ],
            "subtitles": {"mode": "none"}
        },
        "export": {"resolution": "1080x1920", "format": "mp4"}
    });
    std::fs::write(
        coordinator.plan_path(&job_id),
        serde_json::to_string_pretty(&plan)?,
    )?;
    store.transition(&job_id, JobState::Planned, false)?;
    progress.update_state(&job_id, JobState::Planned);
    progress.note("plan drafted");

    let media = MediaSources {
        timeline_name: format!("demo_{job_id}"),
        source: None,
        subtitles: None,
        output: default_output(coordinator, &job_id),
    };
    let validated = coordinator.start_execution(&job_id, &plan, &inventory, None, &media)?;
    progress.update_state(&job_id, JobState::Executing);

    let mut editor = ManifestEditor::default();
    let report = coordinator.execute_plan(&job_id, &mut editor, &validated, &media)?;
    progress.note(&format!("{} editor actions", report.trace.len()));

    let job = coordinator.job(&job_id)?;
    progress.complete(&job);
    ui::print_job(&job);
    Ok(())
}

fn default_output(coordinator: &Coordinator, job_id: &str) -> std::path::PathBuf {
    coordinator
        .store()
        .job_dir(job_id)
        .join("output")
        .join("timeline.edl.json")
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

fn read_assets(path: Option<&Path>) -> Result<Option<AssetLibrary>> {
    path.map(read_json).transpose()
}

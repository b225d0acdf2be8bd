//! Terminal output: a spinner that follows a job through its states and
//! colored summaries for status, jobs, policies and validation results.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::coordinator::SystemStatus;
use crate::runtime::ExecutionPolicy;
use crate::state_machine::{Job, JobState};

/// Spinner shown while a job moves through the pipeline.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    pub fn start(job_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{job_id}: CREATED"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn update_state(&self, job_id: &str, state: JobState) {
        self.pb.set_message(format!("{job_id}: {state}"));
    }

    /// Prints a line above the spinner without disturbing it.
    pub fn note(&self, message: &str) {
        self.pb
            .println(format!("  {} {message}", self.yellow.apply_to("•")));
    }

    pub fn complete(&self, job: &Job) {
        self.pb.finish_and_clear();
        match job.state {
            JobState::Completed => {
                println!("  {} {} completed", self.green.apply_to("✓"), job.job_id);
            }
            JobState::Failed => {
                let reason = job
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                println!("  {} {} failed: {reason}", self.red.apply_to("✗"), job.job_id);
            }
            other => {
                println!("  {} {} stopped in {other}", self.yellow.apply_to("…"), job.job_id);
            }
        }
    }
}

fn state_style(state: JobState) -> Style {
    match state {
        JobState::Completed => Style::new().green().bold(),
        JobState::Failed => Style::new().red().bold(),
        JobState::Created => Style::new().dim(),
        _ => Style::new().yellow(),
    }
}

fn flag(held: bool) -> String {
    if held {
        Style::new().green().apply_to("on").to_string()
    } else {
        Style::new().dim().apply_to("off").to_string()
    }
}

fn header(title: &str) {
    println!("{}", Style::new().cyan().bold().apply_to(format!("─── {title} ───")));
}

/// Pretty JSON for `--json` output.
pub fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

pub fn print_status(status: &SystemStatus) {
    header("Resource locks");
    for (resource, held) in &status.orchestrator.resource_locks {
        println!("  {:<16} {}", resource.to_string(), flag(*held));
    }

    header("Active jobs");
    if status.orchestrator.active_jobs.is_empty() {
        println!("  (none)");
    }
    for (job_id, state) in &status.orchestrator.active_jobs {
        let needs = state.requirements();
        println!(
            "  {job_id}  {}  cpu {:?} gpu {:?}{}",
            state_style(*state).apply_to(format!("{:<10}", state.as_str())),
            needs.cpu,
            needs.gpu,
            if needs.editor { " editor" } else { "" }
        );
    }

    header("Runtime");
    println!("  tier            {}", status.policy.tier);
    println!(
        "  host            {} threads, {:.1}/{:.1} GB free",
        status.host.cpu.threads, status.host.memory.available_gb, status.host.memory.total_gb
    );
    println!("  vision on cpu   {}", flag(status.vision_on_cpu));
    let degraded = if status.monitor.degraded {
        Style::new()
            .red()
            .apply_to(status.monitor.degraded_reason.as_deref().unwrap_or("yes"))
            .to_string()
    } else {
        "no".to_string()
    };
    println!("  degraded        {degraded}");
    println!(
        "  tasks           {} run / {} failed",
        status.monitor.task_stats.total, status.monitor.task_stats.failed
    );
}

pub fn print_job(job: &Job) {
    println!(
        "{}  {}  {}%",
        Style::new().bold().apply_to(&job.job_id),
        state_style(job.state).apply_to(job.state),
        job.progress
    );
    println!("  status   {}", job.status);
    println!("  created  {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  updated  {}", job.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(error) = &job.error {
        println!("  error    {}", Style::new().red().apply_to(error));
    }
    if let Some(result) = &job.result {
        println!("  result   {result}");
    }
    let path: Vec<&str> = job.state_history.iter().map(|e| e.state.as_str()).collect();
    println!("  history  {}", path.join(" → "));
}

pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("no jobs");
        return;
    }
    for job in jobs {
        println!(
            "{}  {}  {:>3}%  {}",
            job.job_id,
            state_style(job.state).apply_to(format!("{:<10}", job.state.as_str())),
            job.progress,
            job.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
}

pub fn print_policy(policy: &ExecutionPolicy) {
    let v = &policy.vision;
    let p = &policy.planning;
    header(&format!("Execution policy ({})", policy.tier));
    println!(
        "  vision    {:?} {} on {:?}, {} scenes max",
        v.provider, v.model, v.device, v.max_scenes
    );
    println!("  planning  {:?} {}", p.provider, p.model);
    println!(
        "  editing   {} x{}, {:?} previews",
        policy.editing.executor, policy.editing.parallelism, policy.editing.preview_quality
    );
    for line in &policy.explanation {
        println!("  {} {line}", Style::new().dim().apply_to("·"));
    }
}

/// Returns whether the plan passed.
pub fn print_validation(errors: &[String]) -> bool {
    if errors.is_empty() {
        println!("  {} plan is valid", Style::new().green().bold().apply_to("✓"));
        return true;
    }
    println!(
        "  {} plan rejected ({} errors)",
        Style::new().red().bold().apply_to("✗"),
        errors.len()
    );
    for error in errors {
        println!("    - {error}");
    }
    false
}

//! Command-line interface built on clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::runtime::ComputeTier;
use crate::state_machine::JobState;

/// Reelgate: job coordination for automated video edits.
#[derive(Debug, Parser)]
#[command(name = "reelgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (defaults to ./reelgate.toml when present).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Print machine-readable JSON instead of formatted text.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resource locks, active jobs, policy and monitor state.
    Status,

    /// Create, inspect and move jobs.
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },

    /// Check an edit plan against a scene inventory.
    Validate {
        /// Edit plan JSON.
        plan: PathBuf,

        /// Scene inventory JSON.
        #[arg(long)]
        scenes: PathBuf,

        /// JSON array of declared asset ids.
        #[arg(long)]
        assets: Option<PathBuf>,
    },

    /// Draft an edit plan for a job with the configured model.
    Plan {
        job_id: String,

        #[arg(long)]
        scenes: PathBuf,

        /// Transcript JSON (array of {start, end, text}).
        #[arg(long)]
        transcript: Option<PathBuf>,

        #[arg(long, default_value = "")]
        style: String,

        #[arg(long)]
        assets: Option<PathBuf>,
    },

    /// Validate a plan and run it through the manifest editor.
    Execute {
        job_id: String,

        /// Edit plan JSON; defaults to the job's drafted plan.
        #[arg(long)]
        plan: Option<PathBuf>,

        #[arg(long)]
        scenes: PathBuf,

        #[arg(long)]
        assets: Option<PathBuf>,

        /// Source clip; defaults to the inventory's primary clip.
        #[arg(long)]
        source: Option<PathBuf>,

        #[arg(long)]
        subtitles: Option<PathBuf>,
    },

    /// Show or degrade the execution policy.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },

    /// Detect host hardware and local model runtimes.
    Profile {
        /// Write the result to the configured profile path.
        #[arg(long, default_value_t = false)]
        save: bool,

        /// Override the detected tier.
        #[arg(long)]
        tier: Option<ComputeTier>,
    },

    /// Sample host health until interrupted or `--samples` are taken.
    Monitor {
        #[arg(long)]
        samples: Option<u32>,
    },

    /// Walk a sample job from creation to export.
    Demo,

    /// Reset every resource lock to its start-up value.
    ReleaseLocks,
}

#[derive(Debug, Subcommand)]
pub enum JobCommand {
    Create,

    Show {
        job_id: String,
    },

    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Move a job to another state.
    Transition {
        job_id: String,
        state: JobState,

        /// Skip the transition table and resource checks.
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Whether a transition would be admitted right now.
    Check {
        job_id: String,
        state: JobState,
    },

    Update {
        job_id: String,

        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        progress: Option<u8>,

        /// Error message; fails the job.
        #[arg(long)]
        error: Option<String>,

        /// Result as JSON.
        #[arg(long)]
        result: Option<String>,

        #[arg(long)]
        state: Option<JobState>,
    },

    Delete {
        job_id: String,
    },

    /// List files under the job's input, temp and output directories.
    Artifacts {
        job_id: String,
    },

    /// Summary of the last execution trace.
    Trace {
        job_id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    Show,

    Degrade {
        reason: String,
    },
}

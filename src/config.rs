//! Reelgate configuration loaded from `reelgate.toml`.
//!
//! Every field has a default, so a missing or partial file is fine.
//! `REELGATE_PLANNER_API_KEY` and `REELGATE_JOBS_DIR` take precedence over
//! the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::runtime::ComputeTier;

pub const CONFIG_FILE: &str = "reelgate.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ReelgateConfig {
    /// Root directory holding one sub-directory per job.
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub validator: ValidatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    #[serde(default = "default_lmstudio_url")]
    pub lmstudio_url: String,

    /// Seconds before a local runtime check is considered absent.
    #[serde(default = "default_detect_timeout_secs")]
    pub detect_timeout_secs: u64,

    /// Skip hardware classification and use this tier.
    #[serde(default)]
    pub force_tier: Option<ComputeTier>,

    /// Where the detected profile is cached between runs.
    #[serde(default = "default_profile_path")]
    pub profile_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_max_history")]
    pub max_history: usize,

    #[serde(default = "default_gpu_degrade_pct")]
    pub gpu_memory_degrade_pct: f64,

    #[serde(default = "default_min_available_gb")]
    pub min_available_memory_gb: f64,

    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_min_task_samples")]
    pub min_task_samples: u64,

    #[serde(default = "default_gpu_cpu_vision_pct")]
    pub cpu_vision_gpu_pct: f64,

    #[serde(default = "default_cpu_vision_memory_gb")]
    pub cpu_vision_memory_gb: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    /// OpenAI-compatible API root, without `/chat/completions`.
    #[serde(default = "default_planner_url")]
    pub base_url: String,

    #[serde(default = "default_planner_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_true")]
    pub allow_empty_timeline: bool,
}

fn default_jobs_dir() -> PathBuf {
    PathBuf::from("jobs")
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_lmstudio_url() -> String {
    "http://localhost:1234".to_string()
}

fn default_detect_timeout_secs() -> u64 {
    2
}

fn default_profile_path() -> PathBuf {
    PathBuf::from("runtime_profile.json")
}

fn default_interval_secs() -> u64 {
    5
}

fn default_max_history() -> usize {
    100
}

fn default_gpu_degrade_pct() -> f64 {
    85.0
}

fn default_min_available_gb() -> f64 {
    2.0
}

fn default_failure_rate() -> f64 {
    0.3
}

fn default_min_task_samples() -> u64 {
    5
}

fn default_gpu_cpu_vision_pct() -> f64 {
    70.0
}

fn default_cpu_vision_memory_gb() -> f64 {
    4.0
}

fn default_planner_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_planner_model() -> String {
    "gpt-4o".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_true() -> bool {
    true
}

impl Default for ReelgateConfig {
    fn default() -> Self {
        Self {
            jobs_dir: default_jobs_dir(),
            runtime: RuntimeConfig::default(),
            monitor: MonitorConfig::default(),
            planner: PlannerConfig::default(),
            validator: ValidatorConfig::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ollama_url: default_ollama_url(),
            lmstudio_url: default_lmstudio_url(),
            detect_timeout_secs: default_detect_timeout_secs(),
            force_tier: None,
            profile_path: default_profile_path(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_history: default_max_history(),
            gpu_memory_degrade_pct: default_gpu_degrade_pct(),
            min_available_memory_gb: default_min_available_gb(),
            failure_rate_threshold: default_failure_rate(),
            min_task_samples: default_min_task_samples(),
            cpu_vision_gpu_pct: default_gpu_cpu_vision_pct(),
            cpu_vision_memory_gb: default_cpu_vision_memory_gb(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            base_url: default_planner_url(),
            model: default_planner_model(),
            api_key: String::new(),
            temperature: default_temperature(),
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            allow_empty_timeline: true,
        }
    }
}

impl ReelgateConfig {
    /// Loads `path`, or `reelgate.toml` in the current directory.
    /// Falls back to defaults when the default file does not exist; an
    /// explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };

        if let Ok(key) = std::env::var("REELGATE_PLANNER_API_KEY")
            && !key.is_empty()
        {
            config.planner.api_key = key;
        }
        if let Ok(dir) = std::env::var("REELGATE_JOBS_DIR")
            && !dir.is_empty()
        {
            config.jobs_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }
}

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReelgateError, Result};

/// Compute class of the host, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeTier {
    GpuHigh,
    GpuMid,
    GpuLow,
    CpuOnly,
    CloudHybrid,
}

impl ComputeTier {
    pub const ALL: [ComputeTier; 5] = [
        ComputeTier::GpuHigh,
        ComputeTier::GpuMid,
        ComputeTier::GpuLow,
        ComputeTier::CpuOnly,
        ComputeTier::CloudHybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeTier::GpuHigh => "GPU_HIGH",
            ComputeTier::GpuMid => "GPU_MID",
            ComputeTier::GpuLow => "GPU_LOW",
            ComputeTier::CpuOnly => "CPU_ONLY",
            ComputeTier::CloudHybrid => "CLOUD_HYBRID",
        }
    }
}

impl fmt::Display for ComputeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComputeTier {
    type Err = ReelgateError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        ComputeTier::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| ReelgateError::InvalidInput(format!("unknown compute tier '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuScore {
    Low,
    Medium,
    High,
    Ultra,
}

impl CpuScore {
    pub fn from_threads(threads: usize) -> Self {
        match threads {
            t if t >= 16 => CpuScore::Ultra,
            t if t >= 12 => CpuScore::High,
            t if t >= 8 => CpuScore::Medium,
            _ => CpuScore::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub vram_total_gb: f64,
    pub vram_free_gb: f64,
    pub cuda_available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub threads: usize,
    pub score: CpuScore,
}

impl CpuInfo {
    pub fn from_threads(threads: usize) -> Self {
        Self {
            threads,
            score: CpuScore::from_threads(threads),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_gb: f64,
    pub available_gb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OllamaStatus {
    /// Served model names, without tags.
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LmStudioStatus {
    pub model: Option<String>,
}

/// Local inference servers found on the host. `None` means unreachable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalRuntimes {
    pub ollama: Option<OllamaStatus>,
    pub lmstudio: Option<LmStudioStatus>,
}

impl LocalRuntimes {
    pub fn ollama_available(&self) -> bool {
        self.ollama.is_some()
    }

    pub fn lmstudio_available(&self) -> bool {
        self.lmstudio.is_some()
    }

    pub fn has_ollama_model(&self, name: &str) -> bool {
        self.ollama
            .as_ref()
            .is_some_and(|o| o.models.iter().any(|m| m == name))
    }

    pub fn any_available(&self) -> bool {
        self.ollama_available() || self.lmstudio_available()
    }
}

/// Detected host capabilities. Immutable after detection except for the
/// one-way degraded flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeProfile {
    pub tier: ComputeTier,
    pub gpu: Option<GpuInfo>,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    #[serde(default)]
    pub runtimes: LocalRuntimes,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    /// Every degradation applied so far, oldest first. Replayed in order
    /// whenever the policy is resolved again.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degradations: Vec<String>,
    #[serde(default)]
    pub explanation: Vec<String>,
}

/// Total memory below which even CPU inference is not attempted locally.
const CLOUD_HYBRID_MEMORY_GB: f64 = 4.0;

impl RuntimeProfile {
    /// Maps hardware to a tier, with the reason for the decision.
    pub fn classify(gpu: Option<&GpuInfo>, memory: &MemoryInfo) -> (ComputeTier, String) {
        if memory.total_gb < CLOUD_HYBRID_MEMORY_GB {
            return (
                ComputeTier::CloudHybrid,
                format!(
                    "{:.1}GB system memory is below {CLOUD_HYBRID_MEMORY_GB}GB, inference goes to cloud",
                    memory.total_gb
                ),
            );
        }
        let Some(gpu) = gpu.filter(|g| g.cuda_available) else {
            return (
                ComputeTier::CpuOnly,
                "no CUDA-capable GPU detected".to_string(),
            );
        };
        let vram = gpu.vram_total_gb;
        let tier = match vram {
            v if v >= 16.0 => ComputeTier::GpuHigh,
            v if v >= 8.0 => ComputeTier::GpuMid,
            v if v >= 4.0 => ComputeTier::GpuLow,
            _ => ComputeTier::CpuOnly,
        };
        (tier, format!("{} with {vram:.1}GB VRAM", gpu.name))
    }

    pub fn from_hardware(
        gpu: Option<GpuInfo>,
        cpu: CpuInfo,
        memory: MemoryInfo,
        runtimes: LocalRuntimes,
        force_tier: Option<ComputeTier>,
    ) -> Self {
        let (classified, reason) = Self::classify(gpu.as_ref(), &memory);
        let mut explanation = vec![format!("classified as {classified}: {reason}")];
        let tier = match force_tier {
            Some(forced) if forced != classified => {
                explanation.push(format!("tier forced to {forced} by configuration"));
                forced
            }
            _ => classified,
        };
        explanation.push(format!(
            "cpu: {} threads ({:?}), memory: {:.1}GB total / {:.1}GB available",
            cpu.threads, cpu.score, memory.total_gb, memory.available_gb
        ));
        explanation.push(match &runtimes.ollama {
            Some(o) => format!("ollama serving {} model(s)", o.models.len()),
            None => "ollama not reachable".to_string(),
        });
        explanation.push(match runtimes.lmstudio.as_ref().map(|l| l.model.as_deref()) {
            Some(Some(model)) => format!("lm studio serving {model}"),
            Some(None) => "lm studio reachable, no model loaded".to_string(),
            None => "lm studio not reachable".to_string(),
        });

        Self {
            tier,
            gpu,
            cpu,
            memory,
            runtimes,
            detected_at: Utc::now(),
            degraded: false,
            degraded_reason: None,
            degradations: Vec::new(),
            explanation,
        }
    }

    /// One-way. The first reason sticks as `degraded_reason`; every reason
    /// is kept in `degradations`.
    pub fn mark_degraded(&mut self, reason: &str) {
        if !self.degraded {
            self.degraded = true;
            self.degraded_reason = Some(reason.to_string());
        }
        self.degradations.push(reason.to_string());
        self.explanation.push(format!("degraded: {reason}"));
    }

    /// Reasons to replay on a fresh resolution. Profiles saved before the
    /// trail existed only carry `degraded_reason`.
    pub fn degradation_trail(&self) -> Vec<&str> {
        if !self.degradations.is_empty() {
            return self.degradations.iter().map(String::as_str).collect();
        }
        match &self.degraded_reason {
            Some(reason) if self.degraded => vec![reason.as_str()],
            _ => Vec::new(),
        }
    }

    /// Carries the degradation trail of `previous` over to a freshly
    /// detected profile, so re-detection never lifts a degradation.
    pub fn inherit_degradations(&mut self, previous: &RuntimeProfile) {
        for reason in previous.degradation_trail() {
            self.mark_degraded(reason);
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

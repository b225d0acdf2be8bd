//! Tier → execution policy mapping, and the one-way degradation of it.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::profile::{ComputeTier, RuntimeProfile};

pub const CLOUD_VISION_MODEL: &str = "gpt-4o";
const CLOUD_PLANNING_MODEL: &str = "deepseek-chat";
const MIN_SCENES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Cloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalBackend {
    Ollama,
    LmStudio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Gpu,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewQuality {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionPolicy {
    pub provider: Provider,
    pub local_backend: Option<LocalBackend>,
    pub model: String,
    pub device: Device,
    pub max_scenes: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningPolicy {
    pub provider: Provider,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditingPolicy {
    pub executor: String,
    pub parallelism: u32,
    pub preview_quality: PreviewQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub vision: VisionPolicy,
    pub planning: PlanningPolicy,
    pub editing: EditingPolicy,
    pub tier: ComputeTier,
    pub explanation: Vec<String>,
}

impl VisionPolicy {
    fn local(backend: LocalBackend, model: String, device: Device, max_scenes: u32) -> Self {
        Self {
            provider: Provider::Local,
            local_backend: Some(backend),
            model,
            device,
            max_scenes,
            timeout_secs: 30,
        }
    }

    fn cloud(max_scenes: u32) -> Self {
        Self {
            provider: Provider::Cloud,
            local_backend: None,
            model: CLOUD_VISION_MODEL.to_string(),
            device: Device::Cpu,
            max_scenes,
            timeout_secs: 30,
        }
    }
}

impl PlanningPolicy {
    fn new(provider: Provider, model: &str) -> Self {
        Self {
            provider,
            model: model.to_string(),
            temperature: 0.7,
            max_tokens: 4000,
        }
    }
}

fn editing(preview_quality: PreviewQuality) -> EditingPolicy {
    EditingPolicy {
        executor: "davinci".to_string(),
        parallelism: 1,
        preview_quality,
    }
}

/// Local vision backend and model, preferring Ollama. `preferred` lists
/// Ollama models in order of preference; the first installed one wins.
fn ollama_first(profile: &RuntimeProfile, preferred: &[&str]) -> Option<(LocalBackend, String)> {
    let rt = &profile.runtimes;
    if let Some(ollama) = rt.ollama.as_ref().filter(|o| !o.models.is_empty()) {
        let model = preferred
            .iter()
            .find(|m| ollama.models.iter().any(|installed| installed == *m))
            .unwrap_or(&"moondream");
        return Some((LocalBackend::Ollama, model.to_string()));
    }
    lmstudio(profile)
}

fn lmstudio(profile: &RuntimeProfile) -> Option<(LocalBackend, String)> {
    profile.runtimes.lmstudio.as_ref().map(|l| {
        (
            LocalBackend::LmStudio,
            l.model.clone().unwrap_or_else(|| "auto".to_string()),
        )
    })
}

fn ollama_moondream(profile: &RuntimeProfile) -> Option<(LocalBackend, String)> {
    profile
        .runtimes
        .ollama_available()
        .then(|| (LocalBackend::Ollama, "moondream".to_string()))
}

/// Deterministic lookup keyed by tier.
pub fn resolve(profile: &RuntimeProfile) -> ExecutionPolicy {
    let tier = profile.tier;
    let (vision, planning, quality, note) = match tier {
        ComputeTier::GpuHigh => {
            let vision = ollama_first(profile, &["llava-phi3", "moondream"]);
            let planning = ["qwen2.5-14b", "deepseek-chat"]
                .into_iter()
                .find(|m| profile.runtimes.has_ollama_model(m))
                .map(|m| PlanningPolicy::new(Provider::Local, m))
                .unwrap_or_else(|| PlanningPolicy::new(Provider::Cloud, CLOUD_PLANNING_MODEL));
            (
                vision.map(|(b, m)| VisionPolicy::local(b, m, Device::Gpu, 20)),
                planning,
                PreviewQuality::High,
                "high-end GPU: local inference, best quality",
            )
        }
        ComputeTier::GpuMid => (
            ollama_first(profile, &["moondream", "llava-phi3"])
                .map(|(b, m)| VisionPolicy::local(b, m, Device::Auto, 10)),
            PlanningPolicy::new(Provider::Cloud, CLOUD_PLANNING_MODEL),
            PreviewQuality::Medium,
            "mid-range GPU: local vision, cloud planning",
        ),
        ComputeTier::GpuLow => (
            lmstudio(profile)
                .or_else(|| ollama_moondream(profile))
                .map(|(b, m)| VisionPolicy::local(b, m, Device::Cpu, 5)),
            PlanningPolicy::new(Provider::Cloud, CLOUD_PLANNING_MODEL),
            PreviewQuality::Medium,
            "low-end GPU: CPU vision, cloud planning",
        ),
        ComputeTier::CpuOnly => (
            lmstudio(profile)
                .or_else(|| ollama_moondream(profile))
                .map(|(b, m)| VisionPolicy::local(b, m, Device::Cpu, 10)),
            PlanningPolicy::new(Provider::Cloud, CLOUD_PLANNING_MODEL),
            PreviewQuality::Low,
            "CPU only: local vision if a runtime is installed, cloud planning",
        ),
        ComputeTier::CloudHybrid => (
            Some(VisionPolicy::cloud(10)),
            PlanningPolicy::new(Provider::Cloud, CLOUD_VISION_MODEL),
            PreviewQuality::Medium,
            "cloud hybrid: inference in the cloud, editing local",
        ),
    };

    let mut explanation = vec![format!("{tier}: {note}")];
    let vision = vision.unwrap_or_else(|| {
        explanation.push("no local inference runtime found, vision goes to cloud".to_string());
        VisionPolicy::cloud(10)
    });

    ExecutionPolicy {
        vision,
        planning,
        editing: editing(quality),
        tier,
        explanation,
    }
}

/// Moves the policy one step toward cheaper execution. Never a no-op: the
/// reason is always recorded, and nothing is ever moved back.
pub fn degrade(mut policy: ExecutionPolicy, reason: &str) -> ExecutionPolicy {
    let mut step = format!("degraded: {reason}");
    if policy.vision.provider == Provider::Local {
        policy.vision.provider = Provider::Cloud;
        policy.vision.local_backend = None;
        policy.vision.model = CLOUD_VISION_MODEL.to_string();
        policy.vision.device = Device::Cpu;
        step.push_str(", vision moved to cloud");
    }
    if policy.vision.max_scenes > MIN_SCENES {
        policy.vision.max_scenes = (policy.vision.max_scenes / 2).max(MIN_SCENES);
        step.push_str(&format!(
            ", scene cap lowered to {}",
            policy.vision.max_scenes
        ));
    }
    policy.explanation.push(step);
    policy
}

struct Cached {
    profile: RuntimeProfile,
    policy: Option<ExecutionPolicy>,
}

/// Process-wide policy, resolved lazily from the current profile.
pub struct PolicyCache {
    inner: Mutex<Cached>,
}

impl PolicyCache {
    pub fn new(profile: RuntimeProfile) -> Self {
        Self {
            inner: Mutex::new(Cached {
                profile,
                policy: None,
            }),
        }
    }

    pub fn get(&self) -> ExecutionPolicy {
        let mut cached = self.lock();
        if cached.policy.is_none() {
            let policy = resolve_profile(&cached.profile);
            info!(tier = %policy.tier, vision = ?policy.vision.provider, "execution policy resolved");
            cached.policy = Some(policy);
        }
        cached
            .policy
            .clone()
            .unwrap_or_else(|| resolve_profile(&cached.profile))
    }

    pub fn profile(&self) -> RuntimeProfile {
        self.lock().profile.clone()
    }

    /// Drops the cached policy; the next `get` re-resolves.
    pub fn invalidate(&self) {
        self.lock().policy = None;
    }

    /// Swaps in a freshly detected profile. Degradations already applied
    /// carry over.
    pub fn reload(&self, mut profile: RuntimeProfile) {
        {
            let mut cached = self.lock();
            profile.inherit_degradations(&cached.profile);
            cached.profile = profile;
        }
        self.invalidate();
    }

    /// Degrades the cached policy and marks the profile degraded.
    pub fn degrade(&self, reason: &str) -> ExecutionPolicy {
        let mut cached = self.lock();
        let current = match cached.policy.take() {
            Some(policy) => policy,
            None => resolve_profile(&cached.profile),
        };
        let degraded = degrade(current, reason);
        cached.profile.mark_degraded(reason);
        cached.policy = Some(degraded.clone());
        warn!(
            reason,
            vision = ?degraded.vision.provider,
            max_scenes = degraded.vision.max_scenes,
            "execution policy degraded"
        );
        degraded
    }

    fn lock(&self) -> MutexGuard<'_, Cached> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A degraded profile keeps every degradation step across re-resolution.
fn resolve_profile(profile: &RuntimeProfile) -> ExecutionPolicy {
    profile
        .degradation_trail()
        .into_iter()
        .fold(resolve(profile), degrade)
}

//! Host probing: GPU via `nvidia-smi`, memory and CPU from `/proc`, local
//! inference servers over HTTP.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use super::monitor::{MetricsSample, MetricsSource};
use super::profile::{
    CpuInfo, GpuInfo, LmStudioStatus, LocalRuntimes, MemoryInfo, OllamaStatus, RuntimeProfile,
};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::state_machine::Resource;

const FALLBACK_MEMORY_GB: f64 = 8.0;
const KIB_PER_GB: f64 = 1024.0 * 1024.0;

/// One `nvidia-smi` CSV row.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuReading {
    pub name: String,
    pub total_mib: f64,
    pub free_mib: f64,
    pub used_mib: f64,
}

impl GpuReading {
    pub fn used_pct(&self) -> f64 {
        if self.total_mib <= 0.0 {
            0.0
        } else {
            self.used_mib / self.total_mib * 100.0
        }
    }

    fn into_info(self) -> GpuInfo {
        GpuInfo {
            name: self.name,
            vram_total_gb: self.total_mib / 1024.0,
            vram_free_gb: self.free_mib / 1024.0,
            cuda_available: true,
        }
    }
}

/// Parses `name, memory.total, memory.free, memory.used` (MiB, no units).
/// Only the first GPU is considered.
pub fn parse_nvidia_smi(output: &str) -> Option<GpuReading> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [name, total, free, used] = fields[..] else {
        return None;
    };
    Some(GpuReading {
        name: name.to_string(),
        total_mib: total.parse().ok()?,
        free_mib: free.parse().ok()?,
        used_mib: used.parse().ok()?,
    })
}

pub fn read_gpu() -> Option<GpuReading> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.free,memory.used",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

/// Reads `MemTotal` and `MemAvailable` from `/proc/meminfo` content.
pub fn parse_meminfo(content: &str) -> Option<MemoryInfo> {
    let field = |key: &str| {
        content
            .lines()
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<f64>().ok())
    };
    Some(MemoryInfo {
        total_gb: field("MemTotal:")? / KIB_PER_GB,
        available_gb: field("MemAvailable:")? / KIB_PER_GB,
    })
}

/// Falls back to 8GB total, all available, when `/proc/meminfo` is missing.
pub fn read_memory() -> MemoryInfo {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|c| parse_meminfo(&c))
        .unwrap_or(MemoryInfo {
            total_gb: FALLBACK_MEMORY_GB,
            available_gb: FALLBACK_MEMORY_GB,
        })
}

pub fn read_cpu() -> CpuInfo {
    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4);
    CpuInfo::from_threads(threads)
}

/// Aggregate `cpu` line of `/proc/stat` as (busy, total) jiffies.
pub fn parse_proc_stat(content: &str) -> Option<(u64, u64)> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse().ok())
        .collect::<Option<_>>()?;
    let total: u64 = values.iter().sum();
    // idle + iowait
    let idle = values.get(3).copied().unwrap_or(0) + values.get(4).copied().unwrap_or(0);
    Some((total.saturating_sub(idle), total))
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiModels {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
}

pub struct Detector {
    client: Client,
    ollama_url: String,
    lmstudio_url: String,
}

impl Detector {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.detect_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            ollama_url: config.ollama_url.trim_end_matches('/').to_string(),
            lmstudio_url: config.lmstudio_url.trim_end_matches('/').to_string(),
        })
    }

    /// Probes everything and classifies the host.
    pub async fn detect(&self, config: &RuntimeConfig) -> RuntimeProfile {
        let gpu = read_gpu().map(GpuReading::into_info);
        let cpu = read_cpu();
        let memory = read_memory();
        let (ollama, lmstudio) = tokio::join!(self.detect_ollama(), self.detect_lmstudio());
        let profile = RuntimeProfile::from_hardware(
            gpu,
            cpu,
            memory,
            LocalRuntimes { ollama, lmstudio },
            config.force_tier,
        );
        info!(tier = %profile.tier, "runtime profile detected");
        profile
    }

    /// `GET /api/tags`. Model tags (`:latest`, `:7b`) are dropped.
    pub async fn detect_ollama(&self) -> Option<OllamaStatus> {
        let url = format!("{}/api/tags", self.ollama_url);
        let tags: OllamaTags = self.get_json(&url).await?;
        let mut models: Vec<String> = tags
            .models
            .into_iter()
            .map(|m| m.name.split(':').next().unwrap_or_default().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        models.dedup();
        Some(OllamaStatus { models })
    }

    /// `GET /v1/models`; the first listed model counts as loaded.
    pub async fn detect_lmstudio(&self) -> Option<LmStudioStatus> {
        let url = format!("{}/v1/models", self.lmstudio_url);
        let models: OpenAiModels = self.get_json(&url).await?;
        Some(LmStudioStatus {
            model: models.data.into_iter().next().map(|m| m.id),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Option<T> {
        let response = match self.client.get(url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(url, status = r.status().as_u16(), "runtime check returned error status");
                return None;
            }
            Err(e) => {
                debug!(url, error = %e, "runtime check failed");
                return None;
            }
        };
        response
            .json()
            .await
            .inspect_err(|e| debug!(url, error = %e, "runtime check returned unexpected body"))
            .ok()
    }
}

/// Live host metrics for the monitor loop. Editor activity comes from the
/// orchestrator's `RESOLVE_BUSY` flag.
pub struct HostMetrics {
    orchestrator: Arc<Orchestrator>,
    last_cpu: Option<(u64, u64)>,
}

impl HostMetrics {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            last_cpu: None,
        }
    }

    fn cpu_pct(&mut self) -> f64 {
        let Some(now) = std::fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|c| parse_proc_stat(&c))
        else {
            return 0.0;
        };
        let pct = match self.last_cpu {
            Some((busy, total)) if now.1 > total => {
                now.0.saturating_sub(busy) as f64 / (now.1 - total) as f64 * 100.0
            }
            _ => 0.0,
        };
        self.last_cpu = Some(now);
        pct
    }
}

impl MetricsSource for HostMetrics {
    fn sample(&mut self) -> MetricsSample {
        let memory = read_memory();
        let used_pct = if memory.total_gb > 0.0 {
            (1.0 - memory.available_gb / memory.total_gb) * 100.0
        } else {
            0.0
        };
        MetricsSample {
            timestamp: Utc::now(),
            gpu_memory_pct: read_gpu().map(|g| g.used_pct()),
            memory_available_gb: memory.available_gb,
            memory_used_pct: used_pct,
            cpu_pct: self.cpu_pct(),
            editor_busy: self
                .orchestrator
                .resources()
                .is_locked(Resource::ResolveBusy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(ollama: &str, lmstudio: &str) -> RuntimeConfig {
        RuntimeConfig {
            ollama_url: ollama.to_string(),
            lmstudio_url: lmstudio.to_string(),
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn nvidia_smi_row_parses() {
        let reading = parse_nvidia_smi("NVIDIA GeForce RTX 4070, 12282, 9000, 3282\n").unwrap();
        assert_eq!(reading.name, "NVIDIA GeForce RTX 4070");
        assert_eq!(reading.total_mib, 12282.0);
        assert!((reading.used_pct() - 26.72).abs() < 0.01);
        let info = reading.into_info();
        assert!(info.vram_total_gb > 11.9 && info.vram_total_gb < 12.0);
    }

    #[test]
    fn nvidia_smi_garbage_is_none() {
        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("No devices were found").is_none());
        assert!(parse_nvidia_smi("GPU, [N/A], 1, 2").is_none());
    }

    #[test]
    fn meminfo_parses() {
        let content = "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    8192000 kB\n";
        let mem = parse_meminfo(content).unwrap();
        assert!((mem.total_gb - 15.625).abs() < 1e-9);
        assert!((mem.available_gb - 7.8125).abs() < 1e-9);
        assert!(parse_meminfo("MemTotal: 1 kB\n").is_none());
    }

    #[test]
    fn proc_stat_parses() {
        let content = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
        assert_eq!(parse_proc_stat(content), Some((200, 1000)));
        assert_eq!(parse_proc_stat("intr 1 2 3"), None);
    }

    #[tokio::test]
    async fn detection_finds_local_runtimes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "moondream:latest"}, {"name": "qwen2.5:14b"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "llava-phi3"}, {"id": "other"}]
            })))
            .mount(&server)
            .await;

        let detector = Detector::new(&config(&server.uri(), &server.uri())).unwrap();
        let ollama = detector.detect_ollama().await.unwrap();
        assert_eq!(ollama.models, vec!["moondream", "qwen2.5"]);
        let lmstudio = detector.detect_lmstudio().await.unwrap();
        assert_eq!(lmstudio.model.as_deref(), Some("llava-phi3"));
    }

    #[tokio::test]
    async fn detection_treats_errors_as_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let detector = Detector::new(&config(&server.uri(), &server.uri())).unwrap();
        assert!(detector.detect_ollama().await.is_none());
        assert!(detector.detect_lmstudio().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_runtime_is_absent() {
        // Port 9 (discard) is closed on test hosts.
        let detector = Detector::new(&config("http://127.0.0.1:9", "http://127.0.0.1:9")).unwrap();
        assert!(detector.detect_ollama().await.is_none());
    }

    #[test]
    fn host_metrics_reflect_editor_flag() {
        let orchestrator = Arc::new(Orchestrator::new());
        let mut metrics = HostMetrics::new(orchestrator.clone());
        assert!(!metrics.sample().editor_busy);
        orchestrator.resources().acquire(Resource::ResolveBusy);
        assert!(metrics.sample().editor_busy);
    }
}

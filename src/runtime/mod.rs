//! Host capability detection, execution policy and runtime health.

pub mod detect;
pub mod monitor;
pub mod policy;
mod profile;

pub use detect::{Detector, HostMetrics};
pub use monitor::{MetricsSample, MetricsSource, MonitorStatus, RuntimeMonitor, TaskStats};
pub use policy::{ExecutionPolicy, PolicyCache, Provider};
pub use profile::{
    ComputeTier, CpuInfo, CpuScore, GpuInfo, LmStudioStatus, LocalRuntimes, MemoryInfo,
    OllamaStatus, RuntimeProfile,
};

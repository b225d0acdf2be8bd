use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// The fixed set of process-wide resources jobs compete for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resource {
    /// Editor render/export owns the GPU.
    GpuHeavy,
    /// Vision inference may run.
    VisionAllowed,
    /// The external editor is driven by a job.
    ResolveBusy,
    /// Planning (LLM) calls may run.
    AiAllowed,
}

impl Resource {
    pub const ALL: [Resource; 4] = [
        Resource::GpuHeavy,
        Resource::VisionAllowed,
        Resource::ResolveBusy,
        Resource::AiAllowed,
    ];

    /// Value each flag holds on a freshly started process.
    pub fn initial(&self) -> bool {
        matches!(self, Resource::VisionAllowed | Resource::AiAllowed)
    }

    fn index(&self) -> usize {
        match self {
            Resource::GpuHeavy => 0,
            Resource::VisionAllowed => 1,
            Resource::ResolveBusy => 2,
            Resource::AiAllowed => 3,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::GpuHeavy => "GPU_HEAVY",
            Resource::VisionAllowed => "VISION_ALLOWED",
            Resource::ResolveBusy => "RESOLVE_BUSY",
            Resource::AiAllowed => "AI_ALLOWED",
        };
        f.write_str(name)
    }
}

/// Plain snapshot of every flag. Also the unit the orchestrator mutates
/// while it already holds its own critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockMap([bool; 4]);

impl Default for LockMap {
    fn default() -> Self {
        let mut flags = [false; 4];
        for resource in Resource::ALL {
            flags[resource.index()] = resource.initial();
        }
        Self(flags)
    }
}

impl LockMap {
    /// Test-and-set. Returns false when the flag was already held.
    pub fn acquire(&mut self, resource: Resource) -> bool {
        let slot = &mut self.0[resource.index()];
        if *slot {
            return false;
        }
        *slot = true;
        true
    }

    pub fn release(&mut self, resource: Resource) {
        self.0[resource.index()] = false;
    }

    pub fn is_locked(&self, resource: Resource) -> bool {
        self.0[resource.index()]
    }

    pub fn set(&mut self, resource: Resource, value: bool) {
        self.0[resource.index()] = value;
    }

    pub fn to_map(&self) -> BTreeMap<Resource, bool> {
        Resource::ALL
            .into_iter()
            .map(|resource| (resource, self.is_locked(resource)))
            .collect()
    }
}

/// Advisory, non-blocking mutual exclusion over the named resources.
///
/// Callers are denied immediately and must retry; nothing ever waits on a
/// flag.
#[derive(Debug, Default)]
pub struct ResourceLock {
    flags: Mutex<LockMap>,
}

impl ResourceLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, resource: Resource) -> bool {
        self.guard().acquire(resource)
    }

    /// Idempotent.
    pub fn release(&self, resource: Resource) {
        self.guard().release(resource);
    }

    pub fn is_locked(&self, resource: Resource) -> bool {
        self.guard().is_locked(resource)
    }

    pub fn status(&self) -> BTreeMap<Resource, bool> {
        self.guard().to_map()
    }

    pub fn snapshot(&self) -> LockMap {
        *self.guard()
    }

    /// Operator recovery: put every flag back to its start-up value.
    pub fn release_all(&self) {
        *self.guard() = LockMap::default();
    }

    /// Direct access for callers that must combine several flag operations
    /// into one critical section.
    pub(crate) fn guard(&self) -> MutexGuard<'_, LockMap> {
        // A poisoned map is still a valid set of booleans.
        self.flags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

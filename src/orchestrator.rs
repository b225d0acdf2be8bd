//! Admission control for editing jobs.
//!
//! The [`Orchestrator`] keeps the job → state map and the process-wide
//! [`ResourceLock`] flags in step. Every state change goes through
//! [`Orchestrator::try_transition`], which checks legality and resource
//! preconditions and applies the lock side effects inside one critical
//! section, so no other job can slip in between the check and the entry.
//!
//! Admission is advisory: nothing here interrupts work that is already
//! running in the external editor or an inference backend. It only refuses
//! to let a new stage start while the resources it needs are taken.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ReelgateError, Result};
use crate::state_machine::{JobState, LockMap, Resource, ResourceLock};

/// Answer to "may this job enter that state right now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    pub reason: String,
}

impl Admission {
    fn from_check(check: Result<()>) -> Self {
        match check {
            Ok(()) => Self {
                allowed: true,
                reason: "OK".to_string(),
            },
            Err(err) => Self {
                allowed: false,
                reason: err.to_string(),
            },
        }
    }
}

/// What a successful transition did to the shared state.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub job_id: String,
    pub from: JobState,
    pub to: JobState,
    pub forced: bool,
    pub locks: BTreeMap<Resource, bool>,
    /// Flags corrected by the reconciliation pass that follows a forced
    /// transition.
    pub reconciled: Vec<(Resource, bool)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub resource_locks: BTreeMap<Resource, bool>,
    pub active_jobs: BTreeMap<String, JobState>,
}

/// Job state map plus resource flags.
///
/// Lock order is always `jobs` first, then the resource flags.
#[derive(Debug, Default)]
pub struct Orchestrator {
    resources: ResourceLock,
    jobs: Mutex<HashMap<String, JobState>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resources(&self) -> &ResourceLock {
        &self.resources
    }

    /// Registers a freshly created job in CREATED.
    pub fn register(&self, job_id: &str) {
        self.jobs().insert(job_id.to_string(), JobState::Created);
        info!(job_id, "job registered");
    }

    /// Re-attaches a persisted job after a restart without touching the
    /// flags. Call [`Orchestrator::reconcile`] once all jobs are restored.
    pub fn restore(&self, job_id: &str, state: JobState) {
        self.jobs().insert(job_id.to_string(), state);
    }

    /// Drops a job from the map, releasing whatever its current state held.
    pub fn forget(&self, job_id: &str) {
        let mut jobs = self.jobs();
        if let Some(state) = jobs.remove(job_id) {
            let mut flags = self.resources.guard();
            apply_exit(&mut flags, state);
            debug!(job_id, %state, "job forgotten");
        }
    }

    pub fn current_state(&self, job_id: &str) -> Option<JobState> {
        self.jobs().get(job_id).copied()
    }

    /// Checks legality and resource preconditions without changing anything.
    pub fn can_enter(&self, job_id: &str, target: JobState) -> Admission {
        let jobs = self.jobs();
        let flags = self.resources.guard();
        let check = match jobs.get(job_id) {
            Some(&current) => check_transition(&jobs, &flags, job_id, current, target),
            None => Err(ReelgateError::JobNotFound(job_id.to_string())),
        };
        Admission::from_check(check)
    }

    /// Records `job_id → state` and applies the entry side effects:
    /// ANALYZING acquires vision, PLANNING acquires AI, EXECUTING/EXPORTING
    /// revoke vision and AI then take the GPU and the editor.
    ///
    /// Refuses to start vision while the editor or GPU is held.
    pub fn enter(&self, job_id: &str, state: JobState) -> Result<()> {
        let mut jobs = self.jobs();
        let mut flags = self.resources.guard();
        if state == JobState::Analyzing
            && (flags.is_locked(Resource::ResolveBusy) || flags.is_locked(Resource::GpuHeavy))
        {
            return Err(ReelgateError::ResourceConflict {
                state,
                reason: "editor must be idle before vision starts".to_string(),
            });
        }
        apply_enter(&mut flags, state);
        jobs.insert(job_id.to_string(), state);
        info!(job_id, %state, locks = ?flags.to_map(), "entered state");
        Ok(())
    }

    /// Inverse of [`Orchestrator::enter`]. Leaving EXECUTING/EXPORTING
    /// re-enables vision for the next job.
    pub fn exit(&self, job_id: &str, state: JobState) {
        let _jobs = self.jobs();
        let mut flags = self.resources.guard();
        apply_exit(&mut flags, state);
        info!(job_id, %state, locks = ?flags.to_map(), "left state");
    }

    /// Check, exit and enter as one atomic step.
    ///
    /// `from` is the state the caller has persisted for the job; when given it
    /// wins over the in-memory map. With `force` the table and the
    /// preconditions are skipped and a reconciliation pass repairs the flags
    /// afterwards.
    pub fn try_transition(
        &self,
        job_id: &str,
        from: Option<JobState>,
        target: JobState,
        force: bool,
    ) -> Result<TransitionOutcome> {
        let mut jobs = self.jobs();
        let mut flags = self.resources.guard();

        let current = from
            .or_else(|| jobs.get(job_id).copied())
            .ok_or_else(|| ReelgateError::JobNotFound(job_id.to_string()))?;

        if !force {
            check_transition(&jobs, &flags, job_id, current, target)?;
        }

        apply_exit(&mut flags, current);
        apply_enter(&mut flags, target);
        jobs.insert(job_id.to_string(), target);

        let reconciled = if force {
            warn!(job_id, from = %current, to = %target, "forced transition");
            reconcile_flags(&jobs, &mut flags)
        } else {
            Vec::new()
        };

        info!(job_id, from = %current, to = %target, locks = ?flags.to_map(), "transition");

        Ok(TransitionOutcome {
            job_id: job_id.to_string(),
            from: current,
            to: target,
            forced: force,
            locks: flags.to_map(),
            reconciled,
        })
    }

    /// Rebuilds the flags from the states jobs are actually in.
    pub fn reconcile(&self) -> Vec<(Resource, bool)> {
        let jobs = self.jobs();
        let mut flags = self.resources.guard();
        reconcile_flags(&jobs, &mut flags)
    }

    /// Operator action for stuck jobs: every flag back to its start-up value.
    pub fn release_all(&self) {
        let _jobs = self.jobs();
        warn!("releasing all resource locks");
        *self.resources.guard() = LockMap::default();
    }

    pub fn status(&self) -> OrchestratorStatus {
        let jobs = self.jobs();
        let flags = self.resources.guard();
        OrchestratorStatus {
            resource_locks: flags.to_map(),
            active_jobs: jobs.iter().map(|(id, state)| (id.clone(), *state)).collect(),
        }
    }

    /// Vision should stay off the GPU while the editor renders.
    pub fn should_use_cpu_for_vision(&self) -> bool {
        let flags = self.resources.guard();
        flags.is_locked(Resource::GpuHeavy) || flags.is_locked(Resource::ResolveBusy)
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobState>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn check_transition(
    jobs: &HashMap<String, JobState>,
    flags: &LockMap,
    job_id: &str,
    current: JobState,
    target: JobState,
) -> Result<()> {
    if !current.can_transition_to(target) {
        return Err(ReelgateError::IllegalTransition {
            from: current,
            to: target,
        });
    }
    check_resources(jobs, flags, job_id, current, target)
}

fn check_resources(
    jobs: &HashMap<String, JobState>,
    flags: &LockMap,
    job_id: &str,
    current: JobState,
    target: JobState,
) -> Result<()> {
    let conflict = |reason: &str| {
        Err(ReelgateError::ResourceConflict {
            state: target,
            reason: reason.to_string(),
        })
    };

    match target {
        JobState::Analyzing => {
            if flags.is_locked(Resource::ResolveBusy) || flags.is_locked(Resource::GpuHeavy) {
                return conflict("editor is busy, wait for it to finish");
            }
            if !flags.is_locked(Resource::VisionAllowed) {
                return conflict("vision is not currently permitted");
            }
        }
        JobState::Planning => {
            if flags.is_locked(Resource::GpuHeavy) {
                return conflict("AI is suspended while the GPU renders");
            }
        }
        JobState::Executing | JobState::Exporting => {
            // A job moving between the exclusive states already owns them.
            if current.is_exclusive() {
                return Ok(());
            }
            if flags.is_locked(Resource::GpuHeavy) {
                return conflict("GPU is held by another job");
            }
            if flags.is_locked(Resource::ResolveBusy) {
                return conflict("editor is busy, wait for it to finish");
            }
            let vision_running = jobs
                .iter()
                .any(|(id, state)| id != job_id && *state == JobState::Analyzing);
            if vision_running {
                return conflict("vision tasks must stop first");
            }
        }
        _ => {}
    }
    Ok(())
}

fn apply_enter(flags: &mut LockMap, state: JobState) {
    match state {
        JobState::Analyzing => {
            flags.acquire(Resource::VisionAllowed);
        }
        JobState::Planning => {
            flags.acquire(Resource::AiAllowed);
        }
        JobState::Executing | JobState::Exporting => {
            flags.release(Resource::VisionAllowed);
            flags.release(Resource::AiAllowed);
            flags.acquire(Resource::GpuHeavy);
            flags.acquire(Resource::ResolveBusy);
        }
        _ => {}
    }
}

fn apply_exit(flags: &mut LockMap, state: JobState) {
    match state {
        JobState::Analyzing => flags.release(Resource::VisionAllowed),
        JobState::Planning => flags.release(Resource::AiAllowed),
        JobState::Executing | JobState::Exporting => {
            flags.release(Resource::GpuHeavy);
            flags.release(Resource::ResolveBusy);
            flags.acquire(Resource::VisionAllowed);
        }
        _ => {}
    }
}

/// Derives the flags implied by the job states and corrects any that
/// disagree. Returns the corrected flags with their new value.
fn reconcile_flags(jobs: &HashMap<String, JobState>, flags: &mut LockMap) -> Vec<(Resource, bool)> {
    let exclusive = jobs.values().any(JobState::is_exclusive);
    let analyzing = jobs.values().any(|s| *s == JobState::Analyzing);
    let planning = jobs.values().any(|s| *s == JobState::Planning);

    let mut desired = *flags;
    desired.set(Resource::GpuHeavy, exclusive);
    desired.set(Resource::ResolveBusy, exclusive);
    if exclusive {
        desired.set(Resource::VisionAllowed, false);
        desired.set(Resource::AiAllowed, false);
        if analyzing || planning {
            warn!("jobs in ANALYZING/PLANNING while the editor is held exclusively");
        }
    } else {
        if analyzing {
            desired.set(Resource::VisionAllowed, true);
        }
        if planning {
            desired.set(Resource::AiAllowed, true);
        }
    }

    let changed: Vec<(Resource, bool)> = Resource::ALL
        .into_iter()
        .filter(|r| flags.is_locked(*r) != desired.is_locked(*r))
        .map(|r| (r, desired.is_locked(r)))
        .collect();

    for (resource, value) in &changed {
        warn!(%resource, value, "reconciled resource flag");
    }
    *flags = desired;
    changed
}

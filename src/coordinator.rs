//! Single entry point wiring the job store, orchestrator, policy cache,
//! runtime monitor and validator together. Built once at start-up and
//! passed by reference.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::config::ReelgateConfig;
use crate::dsl::{AssetLibrary, DslValidator, SceneInventory, ValidatedPlan, ValidationOptions};
use crate::error::{ReelgateError, Result};
use crate::executor::{Action, EditorAdapter, ExecutionReport, MediaSources, PlanExecutor};
use crate::orchestrator::{Admission, Orchestrator, OrchestratorStatus};
use crate::planner::{PlanDrafter, PlanRequest};
use crate::runtime::detect::{read_cpu, read_memory};
use crate::runtime::{
    CpuInfo, ExecutionPolicy, MemoryInfo, MonitorStatus, PolicyCache, RuntimeMonitor,
    RuntimeProfile,
};
use crate::state_machine::{Job, JobState, JobUpdate};
use crate::store::{JobStore, TraceSummary};

const PLAN_FILE: &str = "plan.json";

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    #[serde(flatten)]
    pub orchestrator: OrchestratorStatus,
    pub policy: ExecutionPolicy,
    pub monitor: MonitorStatus,
    pub vision_on_cpu: bool,
    pub host: HostReadings,
}

/// Point-in-time CPU and memory readings taken for a status report.
#[derive(Debug, Clone, Serialize)]
pub struct HostReadings {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
}

pub struct Coordinator {
    config: ReelgateConfig,
    orchestrator: Arc<Orchestrator>,
    store: JobStore,
    policy: Arc<PolicyCache>,
    monitor: Arc<RuntimeMonitor>,
    validator: DslValidator,
}

impl Coordinator {
    /// Opens the job store, restores unfinished jobs and hooks policy
    /// degradation to the monitor.
    pub fn new(config: ReelgateConfig, profile: RuntimeProfile) -> Result<Self> {
        let orchestrator = Arc::new(Orchestrator::new());
        let store = JobStore::open(&config.jobs_dir, orchestrator.clone())?;
        store.restore_active()?;

        let policy = Arc::new(PolicyCache::new(profile));
        let monitor = Arc::new(RuntimeMonitor::new(&config.monitor));
        let cache = policy.clone();
        monitor.on_degrade(move |reason| {
            cache.degrade(reason);
        });

        let validator = DslValidator::new(ValidationOptions {
            allow_empty_timeline: config.validator.allow_empty_timeline,
        });

        Ok(Self {
            config,
            orchestrator,
            store,
            policy,
            monitor,
            validator,
        })
    }

    pub fn config(&self) -> &ReelgateConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn policy(&self) -> &PolicyCache {
        &self.policy
    }

    pub fn monitor(&self) -> &Arc<RuntimeMonitor> {
        &self.monitor
    }

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            orchestrator: self.orchestrator.status(),
            policy: self.policy.get(),
            monitor: self.monitor.status(),
            vision_on_cpu: self.should_use_cpu_for_vision(),
            host: HostReadings {
                cpu: read_cpu(),
                memory: read_memory(),
            },
        }
    }

    /// Either the orchestrator flags or the latest health sample say the
    /// GPU is spoken for.
    pub fn should_use_cpu_for_vision(&self) -> bool {
        self.orchestrator.should_use_cpu_for_vision() || self.monitor.should_use_cpu_for_vision()
    }

    /// Whether `job_id` could move to `target` right now, without moving it.
    pub fn check_transition(&self, job_id: &str, target: JobState) -> Result<Admission> {
        let job = self.store.get(job_id)?;
        if !job.state.can_transition_to(target) {
            return Ok(Admission {
                allowed: false,
                reason: ReelgateError::IllegalTransition {
                    from: job.state,
                    to: target,
                }
                .to_string(),
            });
        }
        Ok(self.orchestrator.can_enter(job_id, target))
    }

    pub fn validate_plan(
        &self,
        plan: &Value,
        inventory: &SceneInventory,
        assets: Option<&AssetLibrary>,
    ) -> Vec<String> {
        self.validator.validate(plan, inventory, assets)
    }

    /// Asks the model for a plan. The job goes PLANNING → PLANNED and the
    /// raw plan is stored under the job's `temp/`. A planner failure fails
    /// the job.
    pub async fn draft_plan(
        &self,
        drafter: &impl PlanDrafter,
        job_id: &str,
        request: &PlanRequest,
    ) -> Result<Value> {
        self.store.transition(job_id, JobState::Planning, false)?;
        match drafter.draft(request).await {
            Ok(plan) => {
                let path = self.plan_path(job_id);
                if let Err(e) = std::fs::write(&path, serde_json::to_string_pretty(&plan)?) {
                    error!(job_id, path = %path.display(), error = %e, "could not store plan");
                    self.fail(job_id, json!({"stage": "planning", "message": e.to_string()}));
                    return Err(e.into());
                }
                self.store.transition(job_id, JobState::Planned, false)?;
                info!(job_id, path = %path.display(), "plan drafted");
                Ok(plan)
            }
            Err(e) => {
                error!(job_id, error = %e, "planning failed");
                self.fail(job_id, json!({"stage": "planning", "message": e.to_string()}));
                Err(e.into())
            }
        }
    }

    /// Gates the plan and builds its editor actions, then moves the job to
    /// EXECUTING. A rejected plan or unusable media leaves the job where it
    /// was.
    pub fn start_execution(
        &self,
        job_id: &str,
        plan: &Value,
        inventory: &SceneInventory,
        assets: Option<&AssetLibrary>,
        media: &MediaSources,
    ) -> Result<ValidatedPlan> {
        let validated = self
            .validator
            .gate(plan, inventory, assets)
            .inspect_err(|e| {
                if let ReelgateError::Validation(errors) = e {
                    warn!(job_id, errors = errors.len(), "edit plan rejected");
                }
            })?;
        PlanExecutor::plan_actions(&validated, media)
            .inspect_err(|e| warn!(job_id, error = %e, "edit plan cannot be executed"))?;
        self.store.transition(job_id, JobState::Executing, false)?;
        Ok(validated)
    }

    /// Builds the timeline in EXECUTING, exports in EXPORTING, and finishes
    /// the job. The trace is saved whatever happens; a failed action fails
    /// the job, and so does any error once the job is EXECUTING.
    pub fn execute_plan(
        &self,
        job_id: &str,
        editor: &mut dyn EditorAdapter,
        plan: &ValidatedPlan,
        media: &MediaSources,
    ) -> Result<ExecutionReport> {
        let job = self.store.get(job_id)?;
        if job.state != JobState::Executing {
            return Err(ReelgateError::InvalidInput(format!(
                "job {job_id} is {}, expected EXECUTING",
                job.state
            )));
        }

        self.run_executing(job_id, editor, plan, media)
            .inspect_err(|e| {
                error!(job_id, error = %e, "execution aborted");
                self.monitor.record_task_result(false);
                self.fail(job_id, json!({"stage": "execution", "message": e.to_string()}));
            })
    }

    fn run_executing(
        &self,
        job_id: &str,
        editor: &mut dyn EditorAdapter,
        plan: &ValidatedPlan,
        media: &MediaSources,
    ) -> Result<ExecutionReport> {
        let actions = PlanExecutor::plan_actions(plan, media)?;
        let (build, export): (Vec<Action>, Vec<Action>) = actions
            .into_iter()
            .partition(|a| !matches!(a, Action::Export { .. }));

        let mut trace = PlanExecutor::run_actions(editor, &build);
        if trace.iter().all(|e| e.ok) {
            self.store.update(
                job_id,
                JobUpdate {
                    progress: Some(80),
                    ..Default::default()
                },
            )?;
            self.store.transition(job_id, JobState::Exporting, false)?;
            trace.extend(PlanExecutor::run_actions(editor, &export));
        }

        self.store.save_trace(job_id, &trace)?;
        let report = ExecutionReport {
            trace,
            output: media.output.clone(),
        };

        match report.failed_action() {
            None => {
                self.monitor.record_task_result(true);
                let summary = TraceSummary::from_entries(report.trace.clone());
                self.store.update(
                    job_id,
                    JobUpdate {
                        state: Some(JobState::Completed),
                        progress: Some(100),
                        result: Some(json!({
                            "output": report.output.display().to_string(),
                            "actions": summary.total_actions,
                            "total_time_ms": summary.total_time_ms,
                        })),
                        ..Default::default()
                    },
                )?;
                info!(job_id, output = %report.output.display(), "job completed");
            }
            Some(failed) => {
                self.monitor.record_task_result(false);
                self.store.update(
                    job_id,
                    JobUpdate {
                        error: Some(json!({
                            "stage": "execution",
                            "action": failed.action,
                            "detail": failed.detail,
                        })),
                        ..Default::default()
                    },
                )?;
                warn!(job_id, action = %failed.action, "job failed during execution");
            }
        }
        Ok(report)
    }

    /// Manual degradation, same path the monitor takes.
    pub fn degrade(&self, reason: &str) -> ExecutionPolicy {
        self.policy.degrade(reason)
    }

    /// Operator reset for stuck jobs. Jobs holding exclusive resources are
    /// forced to PAUSED on disk first, so a restart does not take the locks
    /// back. Returns the ids of the paused jobs.
    pub fn release_all_locks(&self) -> Result<Vec<String>> {
        let mut stuck: Vec<String> = self
            .orchestrator
            .status()
            .active_jobs
            .into_iter()
            .filter(|(_, state)| state.is_exclusive())
            .map(|(job_id, _)| job_id)
            .collect();
        stuck.sort();
        for job_id in &stuck {
            self.store.transition(job_id, JobState::Paused, true)?;
            warn!(job_id, "paused to release its resources");
        }
        self.orchestrator.release_all();
        Ok(stuck)
    }

    pub fn plan_path(&self, job_id: &str) -> PathBuf {
        self.store.job_dir(job_id).join("temp").join(PLAN_FILE)
    }

    pub fn job(&self, job_id: &str) -> Result<Job> {
        self.store.get(job_id)
    }

    fn fail(&self, job_id: &str, error: Value) {
        let update = JobUpdate {
            error: Some(error),
            ..Default::default()
        };
        if let Err(e) = self.store.update(job_id, update) {
            error!(job_id, error = %e, "could not record job failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::Scene;
    use crate::planner::PlannerError;
    use crate::runtime::{CpuInfo, LocalRuntimes, MemoryInfo, OllamaStatus, Provider};
    use crate::state_machine::Resource;
    use std::path::Path;
    use tempfile::TempDir;

    fn coordinator(dir: &TempDir) -> Coordinator {
        let config = ReelgateConfig {
            jobs_dir: dir.path().join("jobs"),
            ..ReelgateConfig::default()
        };
        let profile = RuntimeProfile::from_hardware(
            None,
            CpuInfo::from_threads(8),
            MemoryInfo {
                total_gb: 16.0,
                available_gb: 8.0,
            },
            LocalRuntimes {
                ollama: Some(OllamaStatus {
                    models: vec!["moondream".into()],
                }),
                lmstudio: None,
            },
            None,
        );
        Coordinator::new(config, profile).unwrap()
    }

    fn inventory() -> SceneInventory {
        SceneInventory::new(
            30.0,
            vec![Scene {
                scene_id: "S0001".into(),
                start_frame: 0,
                end_frame: 120,
                start_tc: None,
                end_tc: None,
            }],
        )
        .unwrap()
        .with_primary_clip("/footage/a.mov")
    }

    fn plan(trim: [i64; 2]) -> Value {
        json!({"editing_plan": {"timeline": [
            {"order": 1, "scene_id": "S0001", "trim_frames": trim, "purpose": "hook"}
        ]}})
    }

    fn media(dir: &TempDir) -> MediaSources {
        MediaSources {
            timeline_name: "cut".into(),
            source: None,
            subtitles: None,
            output: dir.path().join("final.mp4"),
        }
    }

    fn walk_to(c: &Coordinator, job_id: &str, states: &[JobState]) {
        for s in states {
            c.store().transition(job_id, *s, false).unwrap();
        }
    }

    const TO_ANALYZED: [JobState; 4] = [
        JobState::Ingesting,
        JobState::Ingested,
        JobState::Analyzing,
        JobState::Analyzed,
    ];

    struct FixedDrafter(std::result::Result<Value, u16>);

    impl PlanDrafter for FixedDrafter {
        async fn draft(&self, _request: &PlanRequest) -> std::result::Result<Value, PlannerError> {
            self.0.clone().map_err(|status| PlannerError::ApiError {
                status,
                message: "down".into(),
            })
        }
    }

    struct FailingExport;

    impl EditorAdapter for FailingExport {
        fn create_timeline(
            &mut self,
            _: &str,
            _: f64,
            _: crate::executor::Resolution,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        fn append_clip(&mut self, _: &Path, _: i64, _: i64, _: u32) -> anyhow::Result<()> {
            Ok(())
        }
        fn import_subtitles(&mut self, _: &Path) -> anyhow::Result<()> {
            Ok(())
        }
        fn export(&mut self, _: &Path, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    fn request() -> PlanRequest {
        PlanRequest {
            inventory: inventory(),
            transcript: Vec::new(),
            style_prompt: "fast".into(),
            assets: None,
        }
    }

    #[tokio::test]
    async fn end_to_end_job_completes() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let job = c.store().create().unwrap();
        walk_to(&c, &job.job_id, &TO_ANALYZED);

        let drafted = c
            .draft_plan(&FixedDrafter(Ok(plan([10, 90]))), &job.job_id, &request())
            .await
            .unwrap();
        assert!(c.plan_path(&job.job_id).exists());
        assert_eq!(c.job(&job.job_id).unwrap().state, JobState::Planned);

        let media = MediaSources {
            timeline_name: "cut".into(),
            source: None,
            subtitles: None,
            output: c.store().job_dir(&job.job_id).join("output/final.mp4"),
        };
        let validated = c
            .start_execution(&job.job_id, &drafted, &inventory(), None, &media)
            .unwrap();
        let status = c.system_status();
        assert!(status.orchestrator.resource_locks[&Resource::GpuHeavy]);
        assert!(status.vision_on_cpu);

        let mut editor = crate::executor::ManifestEditor::default();
        let report = c
            .execute_plan(&job.job_id, &mut editor, &validated, &media)
            .unwrap();
        assert!(report.succeeded());

        let done = c.job(&job.job_id).unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.state_history.iter().any(|e| e.state == JobState::Exporting));
        assert!(media.output.exists());

        let locks = c.system_status().orchestrator.resource_locks;
        assert!(!locks[&Resource::GpuHeavy]);
        assert!(!locks[&Resource::ResolveBusy]);
        assert!(locks[&Resource::VisionAllowed]);
        assert_eq!(c.store().trace(&job.job_id).unwrap().unwrap().failed, 0);
    }

    #[test]
    fn rejected_plan_leaves_job_planned() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let job = c.store().create().unwrap();
        walk_to(&c, &job.job_id, &TO_ANALYZED);
        walk_to(&c, &job.job_id, &[JobState::Planning, JobState::Planned]);

        let err = c
            .start_execution(&job.job_id, &plan([10, 200]), &inventory(), None, &media(&dir))
            .unwrap_err();
        assert!(matches!(err, ReelgateError::Validation(ref e) if e.len() == 1));
        assert_eq!(c.job(&job.job_id).unwrap().state, JobState::Planned);
        assert!(!c.orchestrator().resources().is_locked(Resource::GpuHeavy));
    }

    #[tokio::test]
    async fn planner_failure_fails_job() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let job = c.store().create().unwrap();
        walk_to(&c, &job.job_id, &TO_ANALYZED);

        let err = c
            .draft_plan(&FixedDrafter(Err(503)), &job.job_id, &request())
            .await
            .unwrap_err();
        assert!(matches!(err, ReelgateError::Planner(_)));
        let failed = c.job(&job.job_id).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error.unwrap()["stage"], "planning");
    }

    #[test]
    fn failed_export_fails_job_and_releases_locks() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let job = c.store().create().unwrap();
        walk_to(&c, &job.job_id, &TO_ANALYZED);
        walk_to(&c, &job.job_id, &[JobState::Planning, JobState::Planned]);
        let media = media(&dir);
        let validated = c
            .start_execution(&job.job_id, &plan([10, 90]), &inventory(), None, &media)
            .unwrap();

        let report = c
            .execute_plan(&job.job_id, &mut FailingExport, &validated, &media)
            .unwrap();
        assert_eq!(report.failed_action().unwrap().action, "Export");

        let failed = c.job(&job.job_id).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error.unwrap()["action"], "Export");
        assert!(!c.orchestrator().resources().is_locked(Resource::GpuHeavy));
        assert_eq!(c.monitor().status().task_stats.failed, 1);
    }

    #[test]
    fn execute_requires_executing_state() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let job = c.store().create().unwrap();
        let validated = DslValidator::default()
            .gate(&plan([10, 90]), &inventory(), None)
            .unwrap();
        let err = c
            .execute_plan(&job.job_id, &mut FailingExport, &validated, &media(&dir))
            .unwrap_err();
        assert!(matches!(err, ReelgateError::InvalidInput(_)));
    }

    #[test]
    fn check_transition_reports_without_moving() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let job = c.store().create().unwrap();

        let illegal = c.check_transition(&job.job_id, JobState::Exporting).unwrap();
        assert!(!illegal.allowed);
        assert!(illegal.reason.contains("Illegal transition"));

        let legal = c.check_transition(&job.job_id, JobState::Ingesting).unwrap();
        assert!(legal.allowed);
        assert_eq!(c.job(&job.job_id).unwrap().state, JobState::Created);

        assert!(matches!(
            c.check_transition("job_missing", JobState::Ingesting),
            Err(ReelgateError::JobNotFound(_))
        ));
    }

    #[test]
    fn monitor_degradation_degrades_policy() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        assert_eq!(c.policy().get().vision.provider, Provider::Local);
        for _ in 0..5 {
            c.monitor().record_task_result(false);
        }
        assert_eq!(c.policy().get().vision.provider, Provider::Cloud);
        assert!(c.policy().profile().degraded);
    }

    #[test]
    fn restart_restores_active_jobs() {
        let dir = TempDir::new().unwrap();
        let job_id = {
            let c = coordinator(&dir);
            let job = c.store().create().unwrap();
            walk_to(&c, &job.job_id, &[JobState::Ingesting]);
            job.job_id
        };
        let c = coordinator(&dir);
        assert_eq!(
            c.system_status().orchestrator.active_jobs.get(&job_id),
            Some(&JobState::Ingesting)
        );
    }
    fn planned_job(c: &Coordinator) -> String {
        let job = c.store().create().unwrap();
        walk_to(c, &job.job_id, &TO_ANALYZED);
        walk_to(c, &job.job_id, &[JobState::Planning, JobState::Planned]);
        job.job_id
    }

    #[test]
    fn bad_export_resolution_is_rejected_before_executing() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let job_id = planned_job(&c);
        let mut p = plan([10, 90]);
        p["export"] = json!({"resolution": "1080p", "format": "mp4"});

        let err = c
            .start_execution(&job_id, &p, &inventory(), None, &media(&dir))
            .unwrap_err();
        assert!(matches!(err, ReelgateError::Validation(_)));
        assert_eq!(c.job(&job_id).unwrap().state, JobState::Planned);
        assert!(!c.orchestrator().resources().is_locked(Resource::GpuHeavy));
    }

    #[test]
    fn missing_source_clip_is_rejected_before_executing() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let job_id = planned_job(&c);
        let no_clip = SceneInventory::new(30.0, inventory().scenes().to_vec()).unwrap();

        let err = c
            .start_execution(&job_id, &plan([10, 90]), &no_clip, None, &media(&dir))
            .unwrap_err();
        assert!(matches!(err, ReelgateError::InvalidInput(_)));
        assert_eq!(c.job(&job_id).unwrap().state, JobState::Planned);
        assert!(!c.orchestrator().resources().is_locked(Resource::GpuHeavy));
    }

    #[test]
    fn error_while_executing_fails_job_and_releases_locks() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let job_id = planned_job(&c);
        let no_clip = SceneInventory::new(30.0, inventory().scenes().to_vec()).unwrap();
        let with_source = MediaSources {
            source: Some("/footage/a.mov".into()),
            ..media(&dir)
        };
        let validated = c
            .start_execution(&job_id, &plan([10, 90]), &no_clip, None, &with_source)
            .unwrap();
        assert!(c.orchestrator().resources().is_locked(Resource::GpuHeavy));

        let err = c
            .execute_plan(&job_id, &mut FailingExport, &validated, &media(&dir))
            .unwrap_err();
        assert!(matches!(err, ReelgateError::InvalidInput(_)));

        let failed = c.job(&job_id).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error.unwrap()["stage"], "execution");
        assert!(!c.orchestrator().resources().is_locked(Resource::GpuHeavy));
        assert!(!c.orchestrator().resources().is_locked(Resource::ResolveBusy));
        assert_eq!(c.monitor().status().task_stats.failed, 1);
    }

    #[tokio::test]
    async fn unwritable_plan_fails_job() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let job = c.store().create().unwrap();
        walk_to(&c, &job.job_id, &TO_ANALYZED);
        std::fs::remove_dir_all(c.store().job_dir(&job.job_id).join("temp")).unwrap();

        let err = c
            .draft_plan(&FixedDrafter(Ok(plan([10, 90]))), &job.job_id, &request())
            .await
            .unwrap_err();
        assert!(matches!(err, ReelgateError::Io(_)));
        let failed = c.job(&job.job_id).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error.unwrap()["stage"], "planning");
    }

    #[test]
    fn released_locks_stay_released_after_restart() {
        let dir = TempDir::new().unwrap();
        let job_id = {
            let c = coordinator(&dir);
            let job_id = planned_job(&c);
            c.start_execution(&job_id, &plan([10, 90]), &inventory(), None, &media(&dir))
                .unwrap();
            job_id
        };

        let paused = coordinator(&dir).release_all_locks().unwrap();
        assert_eq!(paused, vec![job_id.clone()]);

        let c = coordinator(&dir);
        let job = c.job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Paused);
        assert!(job.state_history.last().unwrap().forced);
        assert_eq!(
            c.system_status().orchestrator.resource_locks,
            crate::state_machine::LockMap::default().to_map()
        );
    }
}

//! File-backed job persistence.
//!
//! Each job lives in `<jobs_dir>/<job_id>/` with a `metadata.json` record and
//! `input/`, `temp/`, `output/` working directories. Records are replaced
//! with write-to-temp + rename so a crash never leaves a half-written file,
//! and all mutations go through one store-wide mutex so two updates to the
//! same job cannot interleave their read-modify-write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{ReelgateError, Result};
use crate::executor::TraceEntry;
use crate::orchestrator::{Orchestrator, TransitionOutcome};
use crate::state_machine::{Job, JobState, JobUpdate};

const METADATA_FILE: &str = "metadata.json";
const TRACE_FILE: &str = "trace.json";
const WORK_DIRS: [&str; 3] = ["input", "temp", "output"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub name: String,
    /// Relative to the jobs directory.
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobArtifacts {
    pub input: Vec<ArtifactInfo>,
    pub temp: Vec<ArtifactInfo>,
    pub output: Vec<ArtifactInfo>,
}

/// Summary of the last execution trace of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub total_actions: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_time_ms: u64,
    pub actions: Vec<TraceEntry>,
}

impl TraceSummary {
    pub fn from_entries(actions: Vec<TraceEntry>) -> Self {
        let successful = actions.iter().filter(|a| a.ok).count();
        Self {
            total_actions: actions.len(),
            successful,
            failed: actions.len() - successful,
            total_time_ms: actions.iter().map(|a| a.took_ms).sum(),
            actions,
        }
    }
}

pub struct JobStore {
    jobs_dir: PathBuf,
    orchestrator: Arc<Orchestrator>,
    write_lock: Mutex<()>,
}

impl JobStore {
    /// Opens (and creates) the jobs directory, removing temp files left by
    /// interrupted writes.
    pub fn open(jobs_dir: impl Into<PathBuf>, orchestrator: Arc<Orchestrator>) -> Result<Self> {
        let jobs_dir = jobs_dir.into();
        fs::create_dir_all(&jobs_dir)?;
        let store = Self {
            jobs_dir,
            orchestrator,
            write_lock: Mutex::new(()),
        };
        store.recover_interrupted_writes();
        Ok(store)
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn create(&self) -> Result<Job> {
        let _guard = self.lock();
        let job = Job::new();
        let job_dir = self.job_dir(&job.job_id);
        for dir in WORK_DIRS {
            fs::create_dir_all(job_dir.join(dir))?;
        }
        self.save(&job)?;
        self.orchestrator.register(&job.job_id);
        info!(job_id = %job.job_id, "job created");
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Result<Job> {
        let path = self.existing_metadata(job_id)?;
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Newest first.
    pub fn list(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.jobs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let job_id = entry.file_name().to_string_lossy().into_owned();
            match self.get(&job_id) {
                Ok(job) => jobs.push(job),
                Err(ReelgateError::JobNotFound(_)) => {}
                Err(e) => warn!(job_id, error = %e, "skipping unreadable job record"),
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    /// Moves a job to `target`, consulting the state machine unless forced.
    /// A rejected transition leaves the record untouched.
    pub fn transition(
        &self,
        job_id: &str,
        target: JobState,
        force: bool,
    ) -> Result<(Job, TransitionOutcome)> {
        let _guard = self.lock();
        let mut job = self.get(job_id)?;
        let outcome = self.apply_transition(&mut job, target, force)?;
        self.save(&job)?;
        Ok((job, outcome))
    }

    /// Applies a partial update. An error payload without an explicit target
    /// state sends the job to FAILED.
    pub fn update(&self, job_id: &str, update: JobUpdate) -> Result<Job> {
        if let Some(progress) = update.progress
            && progress > 100
        {
            return Err(ReelgateError::InvalidInput(format!(
                "progress must be within 0..=100, got {progress}"
            )));
        }

        let _guard = self.lock();
        let mut job = self.get(job_id)?;

        if let Some(state) = update.state {
            self.apply_transition(&mut job, state, false)?;
        }
        if let Some(status) = update.status {
            job.status = status;
        }
        if let Some(progress) = update.progress {
            job.progress = progress;
        }
        if let Some(result) = update.result {
            job.result = Some(result);
        }
        if let Some(error) = update.error {
            job.error = Some(error);
            if update.state.is_none() && !job.state.is_terminal() {
                self.apply_transition(&mut job, JobState::Failed, true)?;
            }
        }

        job.touch();
        self.save(&job)?;
        Ok(job)
    }

    /// Removes the job directory and releases whatever the job held.
    pub fn delete(&self, job_id: &str) -> Result<()> {
        let _guard = self.lock();
        self.existing_metadata(job_id)?;
        self.orchestrator.forget(job_id);
        fs::remove_dir_all(self.job_dir(job_id))?;
        info!(job_id, "job deleted");
        Ok(())
    }

    pub fn artifacts(&self, job_id: &str) -> Result<JobArtifacts> {
        self.existing_metadata(job_id)?;
        let job_dir = self.job_dir(job_id);
        Ok(JobArtifacts {
            input: self.scan_dir(&job_dir.join("input"))?,
            temp: self.scan_dir(&job_dir.join("temp"))?,
            output: self.scan_dir(&job_dir.join("output"))?,
        })
    }

    pub fn save_trace(&self, job_id: &str, trace: &[TraceEntry]) -> Result<PathBuf> {
        self.existing_metadata(job_id)?;
        let output = self.job_dir(job_id).join("output");
        fs::create_dir_all(&output)?;
        let path = output.join(TRACE_FILE);
        write_atomic(&path, &serde_json::to_string_pretty(trace)?)?;
        Ok(path)
    }

    pub fn trace(&self, job_id: &str) -> Result<Option<TraceSummary>> {
        check_job_id(job_id)?;
        let path = self.job_dir(job_id).join("output").join(TRACE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let entries: Vec<TraceEntry> = serde_json::from_str(&fs::read_to_string(&path)?)?;
        Ok(Some(TraceSummary::from_entries(entries)))
    }

    /// Re-registers every unfinished job with the orchestrator and repairs
    /// the lock flags to match. Used once at start-up.
    pub fn restore_active(&self) -> Result<usize> {
        let jobs = self.list(usize::MAX)?;
        let mut restored = 0;
        for job in jobs.iter().filter(|j| !j.state.is_terminal()) {
            self.orchestrator.restore(&job.job_id, job.state);
            restored += 1;
        }
        let changed = self.orchestrator.reconcile();
        info!(restored, corrected = changed.len(), "restored active jobs");
        Ok(restored)
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(job_id)
    }

    fn apply_transition(
        &self,
        job: &mut Job,
        target: JobState,
        force: bool,
    ) -> Result<TransitionOutcome> {
        let outcome =
            self.orchestrator
                .try_transition(&job.job_id, Some(job.state), target, force)?;
        job.record_transition(target, force);
        Ok(outcome)
    }

    fn save(&self, job: &Job) -> Result<()> {
        let content = serde_json::to_string_pretty(job)?;
        write_atomic(&self.metadata_path(&job.job_id), &content).inspect_err(|e| {
            error!(job_id = %job.job_id, error = %e, "failed to persist job record");
        })
    }

    fn metadata_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(METADATA_FILE)
    }

    /// Path of the job's record, once the id is well-formed and the record
    /// exists.
    fn existing_metadata(&self, job_id: &str) -> Result<PathBuf> {
        check_job_id(job_id)?;
        let path = self.metadata_path(job_id);
        if !path.is_file() {
            return Err(ReelgateError::JobNotFound(job_id.to_string()));
        }
        Ok(path)
    }

    fn scan_dir(&self, dir: &Path) -> Result<Vec<ArtifactInfo>> {
        let mut artifacts = Vec::new();
        if !dir.exists() {
            return Ok(artifacts);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path
                .strip_prefix(&self.jobs_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            artifacts.push(ArtifactInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: relative,
                size: meta.len(),
                modified: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
            });
        }
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }

    fn recover_interrupted_writes(&self) {
        let Ok(entries) = fs::read_dir(&self.jobs_dir) else {
            return;
        };
        for job_dir in entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()) {
            let tmp = job_dir.join(format!("{METADATA_FILE}.tmp"));
            if tmp.exists() {
                debug!(path = %tmp.display(), "removing interrupted write");
                let _ = fs::remove_file(&tmp);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Job ids name a single directory under the jobs dir: ASCII letters,
/// digits, `_` and `-` only.
fn check_job_id(job_id: &str) -> Result<()> {
    let well_formed = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if well_formed {
        Ok(())
    } else {
        Err(ReelgateError::InvalidInput(format!("invalid job id '{job_id}'")))
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(content.as_bytes())?;
    if let Err(e) = file.sync_all() {
        warn!(error = %e, "failed to sync temp file to disk");
    }
    drop(file);

    fs::rename(&tmp_path, path)?;
    debug!(path = %path.display(), "atomic write completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Resource;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, JobStore) {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs"), Arc::new(Orchestrator::new())).unwrap();
        (dir, store)
    }

    fn walk(store: &JobStore, job_id: &str, path: &[JobState]) {
        for state in path {
            store
                .transition(job_id, *state, false)
                .unwrap_or_else(|e| panic!("{state}: {e}"));
        }
    }

    #[test]
    fn create_lays_out_job_directory() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        let job_dir = store.job_dir(&job.job_id);
        assert!(job_dir.join(METADATA_FILE).exists());
        for sub in WORK_DIRS {
            assert!(job_dir.join(sub).is_dir());
        }
        let loaded = store.get(&job.job_id).unwrap();
        assert_eq!(loaded.state, JobState::Created);
    }

    #[test]
    fn missing_job_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("job_nope"),
            Err(ReelgateError::JobNotFound(_))
        ));
        assert!(matches!(
            store.transition("job_nope", JobState::Ingesting, false),
            Err(ReelgateError::JobNotFound(_))
        ));
    }

    #[test]
    fn transitions_append_history() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        walk(
            &store,
            &job.job_id,
            &[JobState::Ingesting, JobState::Ingested, JobState::Analyzing],
        );
        let loaded = store.get(&job.job_id).unwrap();
        let states: Vec<_> = loaded.state_history.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                JobState::Created,
                JobState::Ingesting,
                JobState::Ingested,
                JobState::Analyzing
            ]
        );
        assert_eq!(loaded.status, "analyzing");
    }

    #[test]
    fn rejected_transition_leaves_record_unchanged() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        walk(&store, &job.job_id, &[JobState::Ingesting]);
        let before = fs::read_to_string(store.metadata_path(&job.job_id)).unwrap();

        let err = store
            .transition(&job.job_id, JobState::Executing, false)
            .unwrap_err();
        assert!(matches!(err, ReelgateError::IllegalTransition { .. }));

        let after = fs::read_to_string(store.metadata_path(&job.job_id)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn forced_transition_succeeds_and_is_marked() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        let (job, outcome) = store
            .transition(&job.job_id, JobState::Planned, true)
            .unwrap();
        assert!(outcome.forced);
        assert_eq!(job.state, JobState::Planned);
        assert!(job.state_history.last().unwrap().forced);
    }

    #[test]
    fn full_pipeline_sets_exclusive_locks() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        walk(
            &store,
            &job.job_id,
            &[
                JobState::Ingesting,
                JobState::Ingested,
                JobState::Analyzing,
                JobState::Analyzed,
                JobState::Planning,
                JobState::Planned,
            ],
        );
        let (_, outcome) = store
            .transition(&job.job_id, JobState::Executing, false)
            .unwrap();
        assert!(outcome.locks[&Resource::GpuHeavy]);
        assert!(!outcome.locks[&Resource::VisionAllowed]);
        assert!(!outcome.locks[&Resource::AiAllowed]);
    }

    #[test]
    fn update_with_error_fails_the_job() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        walk(&store, &job.job_id, &[JobState::Ingesting]);
        let job = store
            .update(
                &job.job_id,
                JobUpdate {
                    error: Some(json!({"message": "decoder crashed"})),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.unwrap()["message"], "decoder crashed");
    }

    #[test]
    fn update_error_on_terminal_job_keeps_state() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        walk(&store, &job.job_id, &[JobState::Failed]);
        let job = store
            .update(
                &job.job_id,
                JobUpdate {
                    error: Some(json!("late error")),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.state_history.len(), 2);
    }

    #[test]
    fn update_progress_and_result() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        let job = store
            .update(
                &job.job_id,
                JobUpdate {
                    progress: Some(40),
                    result: Some(json!({"scenes": 12})),
                    state: Some(JobState::Ingesting),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(job.progress, 40);
        assert_eq!(job.state, JobState::Ingesting);
        assert_eq!(job.result.unwrap()["scenes"], 12);
    }

    #[test]
    fn update_rejects_out_of_range_progress() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        let err = store
            .update(
                &job.job_id,
                JobUpdate {
                    progress: Some(101),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ReelgateError::InvalidInput(_)));
    }

    #[test]
    fn update_with_illegal_state_is_rejected() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        let err = store
            .update(
                &job.job_id,
                JobUpdate {
                    state: Some(JobState::Exporting),
                    progress: Some(90),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(store.get(&job.job_id).unwrap().progress, 0);
    }

    #[test]
    fn list_and_delete() {
        let (_dir, store) = store();
        let first = store.create().unwrap();
        let second = store.create().unwrap();
        let listed = store.list(10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(store.list(1).unwrap().len(), 1);

        store.delete(&first.job_id).unwrap();
        let remaining: Vec<_> = store.list(10).unwrap().into_iter().map(|j| j.job_id).collect();
        assert_eq!(remaining, vec![second.job_id]);
        assert!(matches!(
            store.delete(&first.job_id),
            Err(ReelgateError::JobNotFound(_))
        ));
    }

    #[test]
    fn malformed_ids_never_reach_the_filesystem() {
        let (dir, store) = store();
        let job = store.create().unwrap();
        fs::write(dir.path().join("outside.txt"), b"keep").unwrap();

        for bad in ["", ".", "..", "../jobs", "a/b", "..\\x", "job 1"] {
            assert!(
                matches!(store.delete(bad), Err(ReelgateError::InvalidInput(_))),
                "delete({bad:?})"
            );
            assert!(matches!(store.get(bad), Err(ReelgateError::InvalidInput(_))));
            assert!(matches!(store.artifacts(bad), Err(ReelgateError::InvalidInput(_))));
            assert!(matches!(
                store.save_trace(bad, &[]),
                Err(ReelgateError::InvalidInput(_))
            ));
        }

        assert!(store.jobs_dir().is_dir());
        assert!(dir.path().join("outside.txt").exists());
        assert_eq!(store.get(&job.job_id).unwrap().state, JobState::Created);
    }

    #[test]
    fn unknown_job_is_not_found_for_every_lookup() {
        let (_dir, store) = store();
        assert!(matches!(store.delete("job_gone"), Err(ReelgateError::JobNotFound(_))));
        assert!(matches!(store.artifacts("job_gone"), Err(ReelgateError::JobNotFound(_))));
        assert!(matches!(
            store.save_trace("job_gone", &[]),
            Err(ReelgateError::JobNotFound(_))
        ));
    }

    #[test]
    fn artifacts_are_listed_per_category() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        let input = store.job_dir(&job.job_id).join("input").join("clip.mp4");
        fs::write(&input, b"0123456789").unwrap();

        let artifacts = store.artifacts(&job.job_id).unwrap();
        assert_eq!(artifacts.input.len(), 1);
        assert_eq!(artifacts.input[0].name, "clip.mp4");
        assert_eq!(artifacts.input[0].size, 10);
        assert!(artifacts.input[0].path.ends_with("clip.mp4"));
        assert!(artifacts.output.is_empty());
    }

    #[test]
    fn trace_roundtrip_summary() {
        let (_dir, store) = store();
        let job = store.create().unwrap();
        assert!(store.trace(&job.job_id).unwrap().is_none());

        let entries = vec![
            TraceEntry {
                action: "CreateTimeline".into(),
                params: json!({"name": "cut"}),
                ok: true,
                detail: json!({"result": "success"}),
                took_ms: 12,
            },
            TraceEntry {
                action: "Export".into(),
                params: json!({}),
                ok: false,
                detail: json!({"error": "disk full"}),
                took_ms: 30,
            },
        ];
        store.save_trace(&job.job_id, &entries).unwrap();
        let summary = store.trace(&job.job_id).unwrap().unwrap();
        assert_eq!(summary.total_actions, 2);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_time_ms, 42);
    }

    #[test]
    fn reopening_removes_interrupted_writes_and_restores_jobs() {
        let dir = TempDir::new().unwrap();
        let jobs_dir = dir.path().join("jobs");
        let job_id = {
            let store = JobStore::open(&jobs_dir, Arc::new(Orchestrator::new())).unwrap();
            let job = store.create().unwrap();
            store.transition(&job.job_id, JobState::Planned, true).unwrap();
            store.transition(&job.job_id, JobState::Executing, false).unwrap();
            job.job_id
        };
        let tmp = jobs_dir.join(&job_id).join("metadata.json.tmp");
        fs::write(&tmp, "{").unwrap();

        let orchestrator = Arc::new(Orchestrator::new());
        let store = JobStore::open(&jobs_dir, orchestrator.clone()).unwrap();
        assert!(!tmp.exists());
        assert_eq!(store.restore_active().unwrap(), 1);
        assert_eq!(orchestrator.current_state(&job_id), Some(JobState::Executing));
        assert!(orchestrator.resources().is_locked(Resource::GpuHeavy));
    }
}

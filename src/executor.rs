use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::dsl::{SubtitleMode, ValidatedPlan};
pub use crate::dsl::Resolution;
use crate::error::{ReelgateError, Result};

/// Synchronous black-box editor the executor drives.
pub trait EditorAdapter {
    fn create_timeline(&mut self, name: &str, fps: f64, resolution: Resolution)
    -> anyhow::Result<()>;
    fn append_clip(&mut self, source: &Path, start: i64, end: i64, track: u32)
    -> anyhow::Result<()>;
    fn import_subtitles(&mut self, path: &Path) -> anyhow::Result<()>;
    fn export(&mut self, path: &Path, preset: &str) -> anyhow::Result<()>;
}

/// One step of the editor script.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CreateTimeline {
        name: String,
        fps: f64,
        resolution: Resolution,
    },
    AppendClip {
        scene_id: String,
        source: PathBuf,
        start: i64,
        end: i64,
        track: u32,
    },
    ImportSubtitles {
        path: PathBuf,
    },
    Export {
        path: PathBuf,
        preset: String,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::CreateTimeline { .. } => "CreateTimeline",
            Action::AppendClip { .. } => "AppendClip",
            Action::ImportSubtitles { .. } => "ImportSubtitles",
            Action::Export { .. } => "Export",
        }
    }

    fn params(&self) -> Value {
        match self {
            Action::CreateTimeline {
                name,
                fps,
                resolution,
            } => json!({"name": name, "fps": fps, "resolution": resolution.to_string()}),
            Action::AppendClip {
                scene_id,
                source,
                start,
                end,
                track,
            } => json!({
                "scene_id": scene_id,
                "source": source.display().to_string(),
                "start": start,
                "end": end,
                "track": track,
            }),
            Action::ImportSubtitles { path } => json!({"path": path.display().to_string()}),
            Action::Export { path, preset } => {
                json!({"path": path.display().to_string(), "preset": preset})
            }
        }
    }

    fn apply(&self, editor: &mut dyn EditorAdapter) -> anyhow::Result<()> {
        match self {
            Action::CreateTimeline {
                name,
                fps,
                resolution,
            } => editor.create_timeline(name, *fps, *resolution),
            Action::AppendClip {
                source,
                start,
                end,
                track,
                ..
            } => editor.append_clip(source, *start, *end, *track),
            Action::ImportSubtitles { path } => editor.import_subtitles(path),
            Action::Export { path, preset } => editor.export(path, preset),
        }
    }
}

/// Record of a single executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub action: String,
    pub params: Value,
    pub ok: bool,
    pub detail: Value,
    pub took_ms: u64,
}

/// Files the executor reads and writes for one job.
#[derive(Debug, Clone)]
pub struct MediaSources {
    pub timeline_name: String,
    /// Primary clip; falls back to the inventory's `primary_clip_path`.
    pub source: Option<PathBuf>,
    pub subtitles: Option<PathBuf>,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub trace: Vec<TraceEntry>,
    pub output: PathBuf,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.trace.iter().all(|e| e.ok)
    }

    pub fn failed_action(&self) -> Option<&TraceEntry> {
        self.trace.iter().find(|e| !e.ok)
    }
}

pub struct PlanExecutor;

impl PlanExecutor {
    /// Turns a validated plan into the ordered editor script.
    pub fn plan_actions(validated: &ValidatedPlan, media: &MediaSources) -> Result<Vec<Action>> {
        let plan = validated.plan();
        let inventory = validated.inventory();
        let source = media
            .source
            .clone()
            .or_else(|| inventory.primary_clip().map(PathBuf::from))
            .ok_or_else(|| {
                ReelgateError::InvalidInput("no source clip for the timeline".to_string())
            })?;

        let mut actions = vec![Action::CreateTimeline {
            name: media.timeline_name.clone(),
            fps: inventory.fps(),
            resolution: Resolution::parse(&plan.export.resolution)?,
        }];

        let mut items: Vec<_> = plan.editing_plan.timeline.iter().collect();
        items.sort_by_key(|item| item.order);
        actions.extend(items.into_iter().map(|item| Action::AppendClip {
            scene_id: item.scene_id.clone(),
            source: source.clone(),
            start: item.trim_frames[0],
            end: item.trim_frames[1],
            track: 1,
        }));

        if plan.editing_plan.subtitles.mode != SubtitleMode::None
            && let Some(path) = &media.subtitles
        {
            actions.push(Action::ImportSubtitles { path: path.clone() });
        }

        actions.push(Action::Export {
            path: media.output.clone(),
            preset: plan.export.format.clone(),
        });
        Ok(actions)
    }

    /// Runs the plan against `editor`, stopping at the first failed action.
    pub fn run(
        editor: &mut dyn EditorAdapter,
        plan: &ValidatedPlan,
        media: &MediaSources,
    ) -> Result<ExecutionReport> {
        let actions = Self::plan_actions(plan, media)?;
        let trace = Self::run_actions(editor, &actions);
        Ok(ExecutionReport {
            trace,
            output: media.output.clone(),
        })
    }

    /// Applies `actions` in order and returns one trace entry per attempted
    /// action. Nothing after the first failure is attempted.
    pub fn run_actions(editor: &mut dyn EditorAdapter, actions: &[Action]) -> Vec<TraceEntry> {
        let mut trace = Vec::with_capacity(actions.len());

        for action in actions {
            let started = Instant::now();
            let outcome = action.apply(editor);
            let took_ms = started.elapsed().as_millis() as u64;
            let ok = outcome.is_ok();
            let detail = match &outcome {
                Ok(()) => json!({"result": "success"}),
                Err(e) => json!({"error": format!("{e:#}")}),
            };
            trace.push(TraceEntry {
                action: action.name().to_string(),
                params: action.params(),
                ok,
                detail,
                took_ms,
            });
            if let Err(e) = outcome {
                warn!(action = action.name(), error = %e, "editor action failed, stopping");
                break;
            }
        }

        info!(
            actions = trace.len(),
            ok = trace.iter().filter(|e| e.ok).count(),
            "editor actions applied"
        );
        trace
    }
}

/// Editor stand-in that writes the assembled timeline as a JSON edit
/// decision list to the export path instead of rendering.
#[derive(Debug, Default)]
pub struct ManifestEditor {
    timeline: Option<Value>,
    clips: Vec<Value>,
    subtitles: Option<PathBuf>,
}

impl EditorAdapter for ManifestEditor {
    fn create_timeline(
        &mut self,
        name: &str,
        fps: f64,
        resolution: Resolution,
    ) -> anyhow::Result<()> {
        self.timeline = Some(json!({
            "name": name,
            "fps": fps,
            "resolution": resolution.to_string(),
        }));
        self.clips.clear();
        Ok(())
    }

    fn append_clip(&mut self, source: &Path, start: i64, end: i64, track: u32) -> anyhow::Result<()> {
        anyhow::ensure!(self.timeline.is_some(), "no timeline created");
        self.clips.push(json!({
            "source": source.display().to_string(),
            "start": start,
            "end": end,
            "track": track,
        }));
        Ok(())
    }

    fn import_subtitles(&mut self, path: &Path) -> anyhow::Result<()> {
        anyhow::ensure!(path.exists(), "subtitle file {} not found", path.display());
        self.subtitles = Some(path.to_path_buf());
        Ok(())
    }

    fn export(&mut self, path: &Path, preset: &str) -> anyhow::Result<()> {
        let timeline = self
            .timeline
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no timeline created"))?;
        let manifest = json!({
            "timeline": timeline,
            "clips": self.clips,
            "subtitles": self.subtitles.as_ref().map(|p| p.display().to_string()),
            "preset": preset,
        });
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&manifest)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{DslValidator, Scene, SceneInventory};

    #[derive(Default)]
    struct RecordingEditor {
        calls: Vec<String>,
        fail_on: Option<&'static str>,
    }

    impl RecordingEditor {
        fn record(&mut self, call: &'static str, line: String) -> anyhow::Result<()> {
            self.calls.push(line);
            if self.fail_on == Some(call) {
                anyhow::bail!("{call} refused");
            }
            Ok(())
        }
    }

    impl EditorAdapter for RecordingEditor {
        fn create_timeline(
            &mut self,
            name: &str,
            fps: f64,
            resolution: Resolution,
        ) -> anyhow::Result<()> {
            self.record("create", format!("create {name} {fps} {resolution}"))
        }

        fn append_clip(
            &mut self,
            source: &Path,
            start: i64,
            end: i64,
            track: u32,
        ) -> anyhow::Result<()> {
            self.record(
                "append",
                format!("append {} {start}-{end} t{track}", source.display()),
            )
        }

        fn import_subtitles(&mut self, path: &Path) -> anyhow::Result<()> {
            self.record("subs", format!("subs {}", path.display()))
        }

        fn export(&mut self, path: &Path, preset: &str) -> anyhow::Result<()> {
            self.record("export", format!("export {} {preset}", path.display()))
        }
    }

    fn inventory() -> SceneInventory {
        let scene = |id: &str, s, e| Scene {
            scene_id: id.into(),
            start_frame: s,
            end_frame: e,
            start_tc: None,
            end_tc: None,
        };
        SceneInventory::new(30.0, vec![scene("S0001", 0, 120), scene("S0002", 121, 400)])
            .unwrap()
            .with_primary_clip("/footage/a.mov")
    }

    fn plan_json() -> Value {
        json!({
            "editing_plan": {"timeline": [
                {"order": 2, "scene_id": "S0002", "trim_frames": [130, 200], "purpose": "body"},
                {"order": 1, "scene_id": "S0001", "trim_frames": [10, 90], "purpose": "hook"}
            ]},
            "export": {"resolution": "1080x1920", "format": "mp4"}
        })
    }

    fn validated() -> ValidatedPlan {
        DslValidator::default().gate(&plan_json(), &inventory(), None).unwrap()
    }

    fn media() -> MediaSources {
        MediaSources {
            timeline_name: "cut".into(),
            source: None,
            subtitles: Some(PathBuf::from("/job/subs.srt")),
            output: PathBuf::from("/job/output/final.mp4"),
        }
    }

    #[test]
    fn actions_follow_timeline_order() {
        let actions = PlanExecutor::plan_actions(&validated(), &media()).unwrap();
        let names: Vec<_> = actions.iter().map(Action::name).collect();
        assert_eq!(
            names,
            ["CreateTimeline", "AppendClip", "AppendClip", "ImportSubtitles", "Export"]
        );
        match &actions[1] {
            Action::AppendClip { scene_id, start, .. } => {
                assert_eq!(scene_id, "S0001");
                assert_eq!(*start, 10);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn run_records_every_action() {
        let mut editor = RecordingEditor::default();
        let report = PlanExecutor::run(&mut editor, &validated(), &media()).unwrap();
        assert!(report.succeeded());
        assert_eq!(report.trace.len(), 5);
        assert_eq!(editor.calls[0], "create cut 30 1080x1920");
        assert_eq!(editor.calls[1], "append /footage/a.mov 10-90 t1");
        assert_eq!(editor.calls[4], "export /job/output/final.mp4 mp4");
    }

    #[test]
    fn run_stops_at_first_failure() {
        let mut editor = RecordingEditor {
            fail_on: Some("subs"),
            ..Default::default()
        };
        let report = PlanExecutor::run(&mut editor, &validated(), &media()).unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.trace.len(), 4);
        let failed = report.failed_action().unwrap();
        assert_eq!(failed.action, "ImportSubtitles");
        assert_eq!(failed.detail["error"], "subs refused");
        assert!(!editor.calls.iter().any(|c| c.starts_with("export")));
    }

    #[test]
    fn manifest_editor_writes_decision_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let media = MediaSources {
            subtitles: None,
            output: dir.path().join("out/final.mp4"),
            ..media()
        };
        let mut editor = ManifestEditor::default();
        let report = PlanExecutor::run(&mut editor, &validated(), &media).unwrap();
        assert!(report.succeeded());

        let manifest: Value =
            serde_json::from_str(&std::fs::read_to_string(&media.output).unwrap()).unwrap();
        assert_eq!(manifest["clips"].as_array().unwrap().len(), 2);
        assert_eq!(manifest["clips"][0]["start"], 10);
        assert_eq!(manifest["preset"], "mp4");
    }

    #[test]
    fn manifest_editor_rejects_missing_subtitles() {
        let mut editor = ManifestEditor::default();
        let report = PlanExecutor::run(&mut editor, &validated(), &media()).unwrap();
        assert_eq!(report.failed_action().unwrap().action, "ImportSubtitles");
    }

    #[test]
    fn missing_source_clip_is_invalid_input() {
        let inv = SceneInventory::new(30.0, inventory().scenes().to_vec()).unwrap();
        let plan = DslValidator::default()
            .gate(&plan_json(), &inv, None)
            .unwrap();
        let err = PlanExecutor::plan_actions(&plan, &media()).unwrap_err();
        assert!(matches!(err, ReelgateError::InvalidInput(_)));
    }

    #[test]
    fn timeline_fps_comes_from_the_checked_inventory() {
        let inv = SceneInventory::new(25.0, inventory().scenes().to_vec())
            .unwrap()
            .with_primary_clip("/footage/b.mov");
        let plan = DslValidator::default()
            .gate(&plan_json(), &inv, None)
            .unwrap();
        let actions = PlanExecutor::plan_actions(&plan, &media()).unwrap();
        assert!(matches!(actions[0], Action::CreateTimeline { fps, .. } if fps == 25.0));
        assert!(matches!(&actions[1], Action::AppendClip { source, .. } if source.ends_with("b.mov")));
    }
}

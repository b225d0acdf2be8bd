use serde_json::{Map, Value};
use tracing::debug;

use super::timecode::{frames_to_timecode, looks_like_timecode};
use super::types::{AssetLibrary, EditPlan, Resolution, SceneInventory};
use crate::error::{ReelgateError, Result};

#[derive(Debug, Clone, Copy)]
pub struct ValidationOptions {
    /// Accept plans whose timeline has no entries.
    pub allow_empty_timeline: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            allow_empty_timeline: true,
        }
    }
}

/// An edit plan that passed both validation phases, bundled with the
/// inventory it was checked against. Only the validator can produce one, so
/// holding it is proof the plan may reach an editor.
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    plan: EditPlan,
    inventory: SceneInventory,
}

impl ValidatedPlan {
    pub fn plan(&self) -> &EditPlan {
        &self.plan
    }

    pub fn inventory(&self) -> &SceneInventory {
        &self.inventory
    }

    pub fn into_inner(self) -> EditPlan {
        self.plan
    }
}

/// Timeline entry that survived the schema phase.
struct Entry {
    label: String,
    scene_id: String,
    start: i64,
    end: i64,
    assets: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DslValidator {
    options: ValidationOptions,
}

impl DslValidator {
    pub fn new(options: ValidationOptions) -> Self {
        Self { options }
    }

    /// Runs the schema phase then the integrity phase and returns every
    /// problem found. An empty list means the plan is valid.
    pub fn validate(
        &self,
        plan: &Value,
        inventory: &SceneInventory,
        assets: Option<&AssetLibrary>,
    ) -> Vec<String> {
        let mut errors = Vec::new();

        let fps = inventory.fps();
        if !(fps.is_finite() && fps > 0.0) {
            errors.push(format!(
                "scene inventory must declare a positive frame rate (got {fps})"
            ));
        }

        let Some(timeline) = plan
            .get("editing_plan")
            .and_then(|p| p.get("timeline"))
            .and_then(Value::as_array)
        else {
            errors.push("plan: editing_plan.timeline must be an array".to_string());
            return errors;
        };

        if timeline.is_empty() && !self.options.allow_empty_timeline {
            errors.push("plan: timeline has no entries".to_string());
        }

        let schema_start = errors.len();
        let entries: Vec<Entry> = timeline
            .iter()
            .enumerate()
            .filter_map(|(i, raw)| check_entry_schema(i, raw, &mut errors))
            .collect();
        check_export(plan, &mut errors);

        // Sections outside the timeline only need to deserialize.
        if errors.len() == schema_start
            && let Err(e) = serde_json::from_value::<EditPlan>(plan.clone())
        {
            errors.push(format!("plan: {e}"));
        }

        for entry in &entries {
            check_entry_integrity(entry, inventory, assets, &mut errors);
        }

        debug!(
            entries = timeline.len(),
            errors = errors.len(),
            "edit plan validated"
        );
        errors
    }

    /// Admits a plan only when it validates cleanly.
    pub fn gate(
        &self,
        plan: &Value,
        inventory: &SceneInventory,
        assets: Option<&AssetLibrary>,
    ) -> Result<ValidatedPlan> {
        let errors = self.validate(plan, inventory, assets);
        if !errors.is_empty() {
            return Err(ReelgateError::Validation(errors));
        }
        serde_json::from_value(plan.clone())
            .map(|plan| ValidatedPlan {
                plan,
                inventory: inventory.clone(),
            })
            .map_err(|e| ReelgateError::Validation(vec![format!("plan: {e}")]))
    }
}

fn check_entry_schema(index: usize, raw: &Value, errors: &mut Vec<String>) -> Option<Entry> {
    let Some(obj) = raw.as_object() else {
        errors.push(format!("timeline[{index}]: entry must be an object"));
        return None;
    };
    let label = match obj.get("order").and_then(Value::as_i64) {
        Some(order) => format!("timeline item {order}"),
        None => format!("timeline[{index}]"),
    };
    let before = errors.len();

    if obj.get("order").and_then(Value::as_i64).is_none() {
        errors.push(format!("{label}: order must be an integer"));
    }

    let scene_id = obj.get("scene_id").and_then(Value::as_str).unwrap_or_default();
    if scene_id.is_empty() {
        errors.push(format!("{label}: scene_id must be a non-empty string"));
    }

    let trim = check_trim_frames(&label, obj.get("trim_frames"), errors);

    for field in ["purpose", "overlay_text"] {
        if let Some(v) = obj.get(field)
            && !(v.is_string() || v.is_null())
        {
            errors.push(format!("{label}: {field} must be a string"));
        }
    }

    let assets = check_assets(&label, obj, errors);

    if errors.len() != before {
        return None;
    }
    let (start, end) = trim?;
    Some(Entry {
        label,
        scene_id: scene_id.to_string(),
        start,
        end,
        assets,
    })
}

/// The editor needs a concrete frame size before it can create a timeline.
fn check_export(plan: &Value, errors: &mut Vec<String>) {
    let Some(resolution) = plan.get("export").and_then(|e| e.get("resolution")) else {
        return;
    };
    match resolution.as_str() {
        Some(s) if Resolution::parse(s).is_ok() => {}
        Some(s) => errors.push(format!(
            "export: resolution must be WIDTHxHEIGHT, e.g. 1080x1920 (got \"{s}\")"
        )),
        None => errors.push(format!("export: resolution must be a string (got {resolution})")),
    }
}

fn check_trim_frames(
    label: &str,
    value: Option<&Value>,
    errors: &mut Vec<String>,
) -> Option<(i64, i64)> {
    let Some(value) = value else {
        errors.push(format!("{label}: trim_frames is required"));
        return None;
    };
    let Some(pair) = value.as_array().filter(|a| a.len() == 2) else {
        errors.push(format!(
            "{label}: trim_frames must be a two-element [in_frame, out_frame] array"
        ));
        return None;
    };
    let mut frames = [0i64; 2];
    let mut ok = true;
    for (slot, v) in frames.iter_mut().zip(pair) {
        match v {
            Value::Number(n) if n.is_i64() => *slot = n.as_i64().unwrap_or_default(),
            Value::String(s) if looks_like_timecode(s) => {
                errors.push(format!(
                    "{label}: trim_frames must be integer frame numbers, not timecodes (got \"{s}\")"
                ));
                ok = false;
            }
            other => {
                errors.push(format!(
                    "{label}: trim_frames must be integer frame numbers (got {other})"
                ));
                ok = false;
            }
        }
    }
    ok.then_some((frames[0], frames[1]))
}

fn check_assets(label: &str, obj: &Map<String, Value>, errors: &mut Vec<String>) -> Vec<String> {
    let Some(value) = obj.get("assets").or_else(|| obj.get("broll")) else {
        return Vec::new();
    };
    let ids: Option<Vec<String>> = value.as_array().and_then(|items| {
        items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    });
    match ids {
        Some(ids) => ids,
        None => {
            errors.push(format!("{label}: assets must be an array of asset ids"));
            Vec::new()
        }
    }
}

fn check_entry_integrity(
    entry: &Entry,
    inventory: &SceneInventory,
    assets: Option<&AssetLibrary>,
    errors: &mut Vec<String>,
) {
    let label = &entry.label;
    let fps = inventory.fps();

    if entry.start >= entry.end {
        errors.push(format!(
            "{label}: trim start {} must be before trim end {}",
            entry.start, entry.end
        ));
    }

    match inventory.get(&entry.scene_id) {
        None => errors.push(format!(
            "{label}: scene '{}' not found in scene inventory",
            entry.scene_id
        )),
        Some(scene) => {
            if entry.start < scene.start_frame {
                errors.push(format!(
                    "{label}: trim start {} ({}) is out of range, scene '{}' starts at {} ({})",
                    entry.start,
                    frames_to_timecode(entry.start, fps),
                    scene.scene_id,
                    scene.start_frame,
                    frames_to_timecode(scene.start_frame, fps),
                ));
            }
            if entry.end > scene.end_frame {
                errors.push(format!(
                    "{label}: trim end {} ({}) is out of range, scene '{}' ends at {} ({})",
                    entry.end,
                    frames_to_timecode(entry.end, fps),
                    scene.scene_id,
                    scene.end_frame,
                    frames_to_timecode(scene.end_frame, fps),
                ));
            }
        }
    }

    if entry.assets.is_empty() {
        return;
    }
    match assets {
        None => errors.push(format!(
            "{label}: undeclared asset references {:?}, no asset library was supplied",
            entry.assets
        )),
        Some(library) => {
            for id in entry.assets.iter().filter(|id| !library.contains(id)) {
                errors.push(format!(
                    "{label}: undeclared asset '{id}' is not in the asset library"
                ));
            }
        }
    }
}

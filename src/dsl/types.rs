use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ReelgateError;

/// One ground-truth segment of the source footage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub scene_id: String,
    pub start_frame: i64,
    pub end_frame: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_tc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_tc: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("duplicate scene id '{0}'")]
    DuplicateScene(String),
    #[error("scene '{scene_id}' ends at frame {end} before it starts at {start}")]
    InvertedRange {
        scene_id: String,
        start: i64,
        end: i64,
    },
}

fn default_fps() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InventoryMeta {
    #[serde(default = "default_fps")]
    fps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

impl Default for InventoryMeta {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            source: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InventoryMedia {
    primary_clip_path: String,
}

/// Wire shape of `scenes.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawInventory {
    #[serde(default)]
    meta: InventoryMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media: Option<InventoryMedia>,
    scenes: Vec<Scene>,
}

/// Ordered, immutable list of scenes an edit plan may reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawInventory", into = "RawInventory")]
pub struct SceneInventory {
    fps: f64,
    source: Option<String>,
    primary_clip: Option<String>,
    scenes: Vec<Scene>,
    index: HashMap<String, usize>,
}

impl SceneInventory {
    pub fn new(fps: f64, scenes: Vec<Scene>) -> Result<Self, InventoryError> {
        let mut index = HashMap::with_capacity(scenes.len());
        for (i, scene) in scenes.iter().enumerate() {
            if scene.end_frame < scene.start_frame {
                return Err(InventoryError::InvertedRange {
                    scene_id: scene.scene_id.clone(),
                    start: scene.start_frame,
                    end: scene.end_frame,
                });
            }
            if index.insert(scene.scene_id.clone(), i).is_some() {
                return Err(InventoryError::DuplicateScene(scene.scene_id.clone()));
            }
        }
        Ok(Self {
            fps,
            source: None,
            primary_clip: None,
            scenes,
            index,
        })
    }

    pub fn with_primary_clip(mut self, path: impl Into<String>) -> Self {
        self.primary_clip = Some(path.into());
        self
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn primary_clip(&self) -> Option<&str> {
        self.primary_clip.as_deref()
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn get(&self, scene_id: &str) -> Option<&Scene> {
        self.index.get(scene_id).map(|&i| &self.scenes[i])
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}

impl TryFrom<RawInventory> for SceneInventory {
    type Error = InventoryError;

    fn try_from(raw: RawInventory) -> Result<Self, Self::Error> {
        let mut inventory = SceneInventory::new(raw.meta.fps, raw.scenes)?;
        inventory.source = raw.meta.source;
        inventory.primary_clip = raw.media.map(|m| m.primary_clip_path);
        Ok(inventory)
    }
}

impl From<SceneInventory> for RawInventory {
    fn from(inventory: SceneInventory) -> Self {
        RawInventory {
            meta: InventoryMeta {
                fps: inventory.fps,
                source: inventory.source,
            },
            media: inventory
                .primary_clip
                .map(|primary_clip_path| InventoryMedia { primary_clip_path }),
            scenes: inventory.scenes,
        }
    }
}

/// Declared library of extra assets (B-roll, stickers, music beds) a plan
/// may reference by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetLibrary(BTreeSet<String>);

impl AssetLibrary {
    pub fn contains(&self, asset_id: &str) -> bool {
        self.0.contains(asset_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for AssetLibrary {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

// --- Edit plan (editing_dsl.v1) ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMeta {
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_aspect")]
    pub aspect: String,
}

fn default_schema() -> String {
    "editing_dsl.v1".to_string()
}

fn default_target() -> String {
    "douyin".to_string()
}

fn default_aspect() -> String {
    "9:16".to_string()
}

impl Default for PlanMeta {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            target: default_target(),
            aspect: default_aspect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineItem {
    pub order: i64,
    pub scene_id: String,
    /// `[in_frame, out_frame]`
    pub trim_frames: [i64; 2],
    #[serde(default)]
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_text: Option<String>,
    #[serde(default, alias = "broll", skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleMode {
    #[default]
    FromTranscript,
    None,
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subtitles {
    #[serde(default)]
    pub mode: SubtitleMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Music {
    /// Track path or music-library id. Empty means no music.
    #[serde(default, alias = "bgm_id")]
    pub track_path: String,
    #[serde(default = "default_volume_db")]
    pub volume_db: f64,
}

fn default_volume_db() -> f64 {
    -18.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditingPlan {
    pub timeline: Vec<TimelineItem>,
    #[serde(default)]
    pub subtitles: Subtitles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music: Option<Music>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSettings {
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_resolution() -> String {
    "1080x1920".to_string()
}

fn default_format() -> String {
    "mp4".to_string()
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            format: default_format(),
        }
    }
}

/// Output frame size, written `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn parse(value: &str) -> crate::error::Result<Self> {
        let (w, h) = value
            .split_once(['x', 'X'])
            .ok_or_else(|| ReelgateError::InvalidInput(format!("bad resolution '{value}'")))?;
        let parse = |s: &str| {
            s.trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ReelgateError::InvalidInput(format!("bad resolution '{value}'")))
        };
        Ok(Self {
            width: parse(w)?,
            height: parse(h)?,
        })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// AI-authored edit script. Untrusted until it passes the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditPlan {
    #[serde(default)]
    pub meta: PlanMeta,
    pub editing_plan: EditingPlan,
    #[serde(default)]
    pub export: ExportSettings,
    /// Free-form notes from the planner about what it could not do.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assumptions: Vec<String>,
}

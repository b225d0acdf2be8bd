//! Edit plan language: types, frame/timecode helpers and the two-phase
//! validator that gates AI-authored plans before they reach an editor.

pub mod timecode;
mod types;
mod validator;

pub use types::{
    AssetLibrary, EditPlan, EditingPlan, ExportSettings, InventoryError, Music, PlanMeta, Resolution,
    Scene, SceneInventory, SubtitleMode, Subtitles, TimelineItem,
};
pub use validator::{DslValidator, ValidatedPlan, ValidationOptions};

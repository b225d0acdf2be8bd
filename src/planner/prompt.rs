use serde_json::json;

use super::types::PlanRequest;
use crate::dsl::AssetLibrary;

const SYSTEM_PROMPT: &str = r#"You are a short-form video editor. From the scene inventory and the transcript, write an edit plan as a single JSON object in the editing_dsl.v1 format:

{
  "meta": {"schema": "editing_dsl.v1", "target": "douyin", "aspect": "9:16"},
  "editing_plan": {
    "timeline": [
      {"order": 1, "scene_id": "S0001", "trim_frames": [10, 90], "purpose": "hook", "overlay_text": "short caption", "assets": []}
    ],
    "subtitles": {"mode": "from_transcript"},
    "music": {"track_path": "", "volume_db": -18}
  },
  "export": {"resolution": "1080x1920", "format": "mp4"},
  "assumptions": []
}

Hard rules:
- scene_id must be one of the listed scenes.
- trim_frames are integer frame numbers inside the scene's [start_frame, end_frame]; never timecodes.
- trim_frames[0] < trim_frames[1].
- Open with the strongest moment as the hook, cut filler, change shot every 3 to 5 seconds.
- Output the JSON object only."#;

pub fn system_prompt(assets: Option<&AssetLibrary>) -> String {
    match assets {
        Some(library) if !library.is_empty() => format!(
            "{SYSTEM_PROMPT}\n\nAsset library (the only ids allowed in \"assets\"):\n{}",
            serde_json::to_string_pretty(library).unwrap_or_default()
        ),
        _ => format!(
            "{SYSTEM_PROMPT}\n- No asset library was provided: every \"assets\" list must be empty. \
             Note wanted B-roll in \"assumptions\" instead."
        ),
    }
}

pub fn user_content(request: &PlanRequest) -> String {
    let payload = json!({
        "style": request.style_prompt,
        "scenes": request.inventory,
        "transcript": request.transcript,
    });
    serde_json::to_string_pretty(&payload).unwrap_or_default()
}

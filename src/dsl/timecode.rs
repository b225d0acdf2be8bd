//! Frame ⇄ `HH:MM:SS:FF` conversion.
//!
//! Frames are the only unit edit plans may use; timecodes exist for
//! display and for reading scene inventories produced by editors.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimecodeError {
    #[error("invalid timecode format: {0}")]
    Format(String),
    #[error("frame rate must be positive")]
    FrameRate,
}

pub fn frames_to_timecode(frame: i64, fps: f64) -> String {
    if !(fps.is_finite() && fps > 0.0) {
        return "--:--:--:--".to_string();
    }
    let frame = frame.max(0);
    let total_seconds = frame as f64 / fps;
    let hours = (total_seconds / 3600.0) as i64;
    let minutes = ((total_seconds % 3600.0) / 60.0) as i64;
    let seconds = (total_seconds % 60.0) as i64;
    let frames = (frame as f64 % fps) as i64;
    format!("{hours:02}:{minutes:02}:{seconds:02}:{frames:02}")
}

pub fn timecode_to_frames(timecode: &str, fps: f64) -> Result<i64, TimecodeError> {
    if !(fps.is_finite() && fps > 0.0) {
        return Err(TimecodeError::FrameRate);
    }
    let parts: Vec<i64> = timecode
        .split(':')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .map_err(|_| TimecodeError::Format(timecode.to_string()))?;
    let [hours, minutes, seconds, frames] = parts[..] else {
        return Err(TimecodeError::Format(timecode.to_string()));
    };
    if parts.iter().any(|p| *p < 0) {
        return Err(TimecodeError::Format(timecode.to_string()));
    }
    let total = (hours * 3600 + minutes * 60 + seconds) as f64 * fps + frames as f64;
    Ok(total as i64)
}

/// True for strings shaped like `HH:MM:SS:FF`.
pub fn looks_like_timecode(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 4 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_render_as_timecode() {
        assert_eq!(frames_to_timecode(0, 30.0), "00:00:00:00");
        assert_eq!(frames_to_timecode(120, 30.0), "00:00:04:00");
        assert_eq!(frames_to_timecode(200, 30.0), "00:00:06:20");
        assert_eq!(frames_to_timecode(25 * 3661 + 7, 25.0), "01:01:01:07");
    }

    #[test]
    fn timecode_parses_to_frames() {
        assert_eq!(timecode_to_frames("00:01:00:05", 25.0), Ok(1505));
        assert_eq!(timecode_to_frames("01:01:01:07", 25.0), Ok(25 * 3661 + 7));
    }

    #[test]
    fn malformed_timecodes_are_rejected() {
        assert!(matches!(
            timecode_to_frames("00:01:00", 25.0),
            Err(TimecodeError::Format(_))
        ));
        assert!(matches!(
            timecode_to_frames("aa:01:00:00", 25.0),
            Err(TimecodeError::Format(_))
        ));
        assert_eq!(
            timecode_to_frames("00:00:01:00", 0.0),
            Err(TimecodeError::FrameRate)
        );
    }

    #[test]
    fn timecode_shape_detection() {
        assert!(looks_like_timecode("00:00:01:12"));
        assert!(!looks_like_timecode("12"));
        assert!(!looks_like_timecode("00:00:01"));
    }
}

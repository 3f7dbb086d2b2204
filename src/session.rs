//! Session directory layout and per-session counters.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEPTH_FILE: &str = "depth.bin";
pub const VIDEO_FILE: &str = "rgb.mp4";

const MAX_COLLISIONS: u32 = 1000;

/// Replace anything outside `[A-Za-z0-9_-]` so the name is safe as a path
/// component.
pub fn sanitize_scene_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "scene".to_string()
    } else {
        sanitized
    }
}

/// `<scene>_<YYYYmmdd_HHMMSS>`
pub fn session_dir_name(scene_name: &str, start: &DateTime<Local>) -> String {
    format!(
        "{}_{}",
        sanitize_scene_name(scene_name),
        start.format("%Y%m%d_%H%M%S")
    )
}

/// Create a fresh directory for a session under `root`.
///
/// Two starts within the same second get `-1`, `-2`, ... suffixes; an
/// existing directory is never reused.
pub fn create_session_dir(
    root: &Path,
    scene_name: &str,
    start: &DateTime<Local>,
) -> io::Result<PathBuf> {
    fs::create_dir_all(root)?;
    let base = session_dir_name(scene_name, start);
    for attempt in 0..MAX_COLLISIONS {
        let name = if attempt == 0 {
            base.clone()
        } else {
            format!("{}-{}", base, attempt)
        };
        let candidate = root.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free session directory for {}", base),
    ))
}

/// Counters for one recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Frames written to every sink.
    pub frames_recorded: u64,
    pub depth_records: u64,
    pub depth_bytes: u64,
    pub video_frames: u64,
    /// Frames without primary or smoothed depth.
    pub non_qualifying: u64,
    pub dropped_not_ready: u64,
    pub dropped_depth: u64,
    /// Color planes that did not match the session resolution.
    pub dropped_color_size: u64,
}

impl SessionStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_not_ready + self.dropped_depth + self.dropped_color_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 12, 0, 9).unwrap()
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_scene_name("kitchen-test"), "kitchen-test");
        assert_eq!(sanitize_scene_name(" living room/2 "), "living_room_2");
        assert_eq!(sanitize_scene_name("../etc"), "___etc");
        assert_eq!(sanitize_scene_name("   "), "scene");
    }

    #[test]
    fn test_dir_name_format() {
        assert_eq!(
            session_dir_name("kitchen", &at_noon()),
            "kitchen_20240305_120009"
        );
    }

    #[test]
    fn test_collision_gets_suffix() {
        let root = tempfile::tempdir().unwrap();
        let first = create_session_dir(root.path(), "kitchen", &at_noon()).unwrap();
        let second = create_session_dir(root.path(), "kitchen", &at_noon()).unwrap();
        let third = create_session_dir(root.path(), "kitchen", &at_noon()).unwrap();

        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_120009-1"));
        assert!(third.to_string_lossy().ends_with("_120009-2"));
        assert!(first.is_dir() && second.is_dir() && third.is_dir());
    }

    #[test]
    fn test_creates_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        let dir = create_session_dir(&nested, "x", &at_noon()).unwrap();
        assert!(dir.starts_with(&nested));
    }
}

//! Picking a capture device out of an enumerated list.
//!
//! Phones expose several video inputs (ultra-wide, tele, front) with labels
//! that only loosely follow a convention, so selection is a ranking over the
//! label text rather than an exact match.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Rear camera.
    #[default]
    Environment,
    /// Selfie camera.
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    pub id: String,
    pub label: String,
    /// Facing reported by the platform, when it reports one.
    pub facing: Option<FacingMode>,
}

impl CameraDevice {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            facing: None,
        }
    }

    pub fn with_facing(mut self, facing: FacingMode) -> Self {
        self.facing = Some(facing);
        self
    }
}

/// Preferences handed to a [`crate::MediaSource`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaPreferences {
    pub facing: FacingMode,
    /// Exact device to open; wins over the facing hint when it is present in
    /// the enumerated list.
    pub device_id: Option<String>,
}

impl MediaPreferences {
    pub fn facing(facing: FacingMode) -> Self {
        Self {
            facing,
            device_id: None,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// Best device for `facing`, or the first device when nothing matches.
pub fn select_device(devices: &[CameraDevice], facing: FacingMode) -> Option<&CameraDevice> {
    devices
        .iter()
        .enumerate()
        .filter(|(_, device)| faces(device, facing))
        .min_by_key(|(index, device)| (rank(device, facing), *index))
        .map(|(_, device)| device)
        .or_else(|| devices.first())
}

/// Applies the full preference set: exact id first, then the facing ranking.
pub fn select_for<'a>(
    devices: &'a [CameraDevice],
    preferences: &MediaPreferences,
) -> Option<&'a CameraDevice> {
    preferences
        .device_id
        .as_deref()
        .and_then(|wanted| devices.iter().find(|device| device.id == wanted))
        .or_else(|| select_device(devices, preferences.facing))
}

fn faces(device: &CameraDevice, facing: FacingMode) -> bool {
    if let Some(reported) = device.facing {
        return reported == facing;
    }
    let keywords: &[&str] = match facing {
        FacingMode::Environment => &["back", "rear", "environment"],
        FacingMode::User => &["front", "user", "face"],
    };
    let label = device.label.to_ascii_lowercase();
    keywords.iter().any(|keyword| label.contains(keyword))
}

fn rank(device: &CameraDevice, facing: FacingMode) -> u8 {
    if facing != FacingMode::Environment {
        return 0;
    }
    let words = label_words(&device.label);
    // "camera2 0, facing back" is the primary sensor on most Android builds.
    if let Some(camera_at) = words.iter().position(|word| word.starts_with("camera")) {
        if words[camera_at..].iter().any(|word| word == "0") {
            return 0;
        }
    }
    if words.iter().any(|word| word == "main" || word == "wide") {
        return 1;
    }
    2
}

fn label_words(label: &str) -> Vec<String> {
    label
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn android_rear_cameras() -> Vec<CameraDevice> {
        vec![
            CameraDevice::new("front", "camera2 1, facing front"),
            CameraDevice::new("tele", "camera2 3, facing back"),
            CameraDevice::new("primary", "camera2 0, facing back"),
            CameraDevice::new("ultra", "camera2 2, facing back"),
        ]
    }

    #[test_timeout::timeout]
    fn primary_rear_sensor_ranks_first() {
        let devices = android_rear_cameras();
        let chosen = select_device(&devices, FacingMode::Environment).unwrap();
        assert_eq!(chosen.id, "primary");
    }

    #[test_timeout::timeout]
    fn main_or_wide_beats_unlabelled_rear() {
        let devices = vec![
            CameraDevice::new("a", "Back Telephoto Camera"),
            CameraDevice::new("b", "Back Wide Camera"),
        ];
        assert_eq!(
            select_device(&devices, FacingMode::Environment).unwrap().id,
            "b"
        );
    }

    #[test_timeout::timeout]
    fn ties_keep_enumeration_order() {
        let devices = vec![
            CameraDevice::new("a", "Rear Camera"),
            CameraDevice::new("b", "Rear Camera"),
        ];
        assert_eq!(
            select_device(&devices, FacingMode::Environment).unwrap().id,
            "a"
        );
    }

    #[test_timeout::timeout]
    fn reported_facing_overrides_label() {
        let devices = vec![
            CameraDevice::new("a", "Integrated Webcam"),
            CameraDevice::new("b", "USB Capture").with_facing(FacingMode::Environment),
        ];
        assert_eq!(
            select_device(&devices, FacingMode::Environment).unwrap().id,
            "b"
        );
    }

    #[test_timeout::timeout]
    fn falls_back_to_first_device() {
        let devices = vec![
            CameraDevice::new("a", "Integrated Webcam"),
            CameraDevice::new("b", "Capture Card"),
        ];
        assert_eq!(
            select_device(&devices, FacingMode::Environment).unwrap().id,
            "a"
        );
        assert!(select_device(&[], FacingMode::Environment).is_none());
    }

    #[test_timeout::timeout]
    fn front_hint_matches_front_labels() {
        let devices = android_rear_cameras();
        assert_eq!(select_device(&devices, FacingMode::User).unwrap().id, "front");
    }

    #[test_timeout::timeout]
    fn exact_device_id_wins() {
        let devices = android_rear_cameras();
        let prefs = MediaPreferences::default().with_device("ultra");
        assert_eq!(select_for(&devices, &prefs).unwrap().id, "ultra");

        let missing = MediaPreferences::default().with_device("gone");
        assert_eq!(select_for(&devices, &missing).unwrap().id, "primary");
    }
}

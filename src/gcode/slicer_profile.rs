// src/gcode/slicer_profile.rs - Settings a slicer left behind in program comments
use std::collections::BTreeMap;
use std::fmt;

use super::Instruction;

/// Cura's per-layer comment, not a setting.
const LAYER_MARKER: &str = "LAYER";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlicerKind {
    Cura,
    Slic3r,
    Simplify3D,
}

impl SlicerKind {
    /// Recognise the slicer from a header comment.
    fn detect(comment: &str) -> Option<Self> {
        let lower = comment.to_ascii_lowercase();
        if lower.contains("simplify3d") {
            Some(SlicerKind::Simplify3D)
        } else if lower.contains("slic3r") || lower.contains("prusaslicer") {
            Some(SlicerKind::Slic3r)
        } else if lower.contains("cura") {
            Some(SlicerKind::Cura)
        } else {
            None
        }
    }

    /// Split one comment into a setting, in this slicer's notation.
    fn setting(self, comment: &str) -> Option<(String, String)> {
        let (key, value) = match self {
            // "layer_height = 0.2"
            SlicerKind::Slic3r => comment.split_once(" = ")?,
            // "layerHeight,0.2"
            SlicerKind::Simplify3D => comment.split_once(',')?,
            // "Layer height: 0.2", "FLAVOR:RepRap"
            SlicerKind::Cura => comment.split_once(':')?,
        };
        let key = key.trim();
        let valid = match self {
            SlicerKind::Cura => key.starts_with(|c: char| c.is_ascii_alphabetic()) && key != LAYER_MARKER,
            _ => !key.is_empty() && !key.contains(char::is_whitespace),
        };
        valid.then(|| (key.to_string(), value.trim().to_string()))
    }
}

impl fmt::Display for SlicerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlicerKind::Cura => "Cura",
            SlicerKind::Slic3r => "Slic3r",
            SlicerKind::Simplify3D => "Simplify3D",
        };
        write!(f, "{}", name)
    }
}

/// Key/value settings recovered from the comments of a sliced program.
#[derive(Debug, Clone, PartialEq)]
pub struct SlicerProfile {
    pub kind: SlicerKind,
    settings: BTreeMap<String, String>,
}

impl SlicerProfile {
    /// `None` unless a comment names a known slicer.
    pub fn from_lines(lines: &[Instruction]) -> Option<Self> {
        let kind = lines.iter().filter_map(Instruction::comment).find_map(SlicerKind::detect)?;
        let settings = lines
            .iter()
            .filter(|line| !line.has_fields())
            .filter_map(Instruction::comment)
            .filter_map(|comment| kind.setting(comment))
            .collect();
        Some(Self { kind, settings })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.parse().ok()
    }

    /// The value for display; lists and units are left as written.
    pub fn formatted_value(&self, key: &str) -> String {
        match (self.get_f64(key), self.get(key)) {
            (Some(number), _) => format!("{}", number),
            (None, Some(text)) => text.to_string(),
            (None, None) => "-".to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

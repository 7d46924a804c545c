// src/gcode/program.rs - Ordered instruction list with motion replay and structural analysis
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use super::{Field, GCodeError, Instruction, SlicerProfile};
use crate::geometry::{AbsolutePosition, Cuboid};

const LAYER_MARKER: &str = "LAYER:";
const Z_EPSILON: f64 = 1e-6;

/// Replays positioning semantics one instruction at a time.
///
/// This is the only place that knows how G90/G91, M82/M83, G92 and G28
/// affect the position, so every consumer of motion goes through it.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionTracker {
    position: AbsolutePosition,
    relative_xyz: bool,
    relative_e: bool,
    feed_rate: f64,
}

impl Default for MotionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionTracker {
    pub fn new() -> Self {
        Self {
            position: AbsolutePosition::ORIGIN,
            relative_xyz: false,
            relative_e: false,
            feed_rate: 0.0,
        }
    }

    pub fn position(&self) -> AbsolutePosition {
        self.position
    }

    pub fn is_relative(&self) -> bool {
        self.relative_xyz
    }

    pub fn is_relative_extrusion(&self) -> bool {
        self.relative_e
    }

    /// Last feed rate seen, in mm/min.
    pub fn feed_rate(&self) -> f64 {
        self.feed_rate
    }

    pub fn set_position(&mut self, position: AbsolutePosition) {
        self.position = position;
    }

    /// Apply one instruction. Returns `(from, to)` for G0/G1.
    pub fn apply(&mut self, code: &Instruction) -> Option<(AbsolutePosition, AbsolutePosition)> {
        if let Some(m) = code.m() {
            match m {
                82 => self.relative_e = false,
                83 => self.relative_e = true,
                _ => {}
            }
            return None;
        }

        match code.g()? {
            0 | 1 => {
                let from = self.position;
                let axis = |field: Field, current: f64, relative: bool| match code.get(field) {
                    Some(v) if relative => current + v,
                    Some(v) => v,
                    None => current,
                };
                let to = AbsolutePosition {
                    x: axis(Field::X, from.x, self.relative_xyz),
                    y: axis(Field::Y, from.y, self.relative_xyz),
                    z: axis(Field::Z, from.z, self.relative_xyz),
                    e: axis(Field::E, from.e, self.relative_e),
                };
                if let Some(f) = code.get(Field::F) {
                    self.feed_rate = f;
                }
                self.position = to;
                Some((from, to))
            }
            28 => {
                let named = [Field::X, Field::Y, Field::Z].iter().any(|f| code.has(*f));
                if !named || code.has(Field::X) {
                    self.position.x = 0.0;
                }
                if !named || code.has(Field::Y) {
                    self.position.y = 0.0;
                }
                if !named || code.has(Field::Z) {
                    self.position.z = 0.0;
                }
                None
            }
            90 => {
                self.relative_xyz = false;
                self.relative_e = false;
                None
            }
            91 => {
                self.relative_xyz = true;
                self.relative_e = true;
                None
            }
            92 => {
                let named = [Field::X, Field::Y, Field::Z, Field::E].iter().any(|f| code.has(*f));
                if !named {
                    self.position = AbsolutePosition::ORIGIN;
                } else {
                    self.position.x = code.value_or(Field::X, self.position.x);
                    self.position.y = code.value_or(Field::Y, self.position.y);
                    self.position.z = code.value_or(Field::Z, self.position.z);
                    self.position.e = code.value_or(Field::E, self.position.e);
                }
                None
            }
            _ => None,
        }
    }
}

/// One motion step produced by [`Program::enumerate_moves`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Move<'a> {
    pub from: AbsolutePosition,
    pub to: AbsolutePosition,
    /// mm/min, sticky across moves.
    pub feed_rate: f64,
    pub instruction: &'a Instruction,
    pub index: usize,
}

impl Move<'_> {
    pub fn is_extruding(&self) -> bool {
        self.to.e > self.from.e
    }

    pub fn distance(&self) -> f64 {
        self.from.distance_to(&self.to)
    }

    /// XY direction of travel; zero when the move has no XY component.
    pub fn xy_vector(&self) -> (f64, f64) {
        (self.to.x - self.from.x, self.to.y - self.from.y)
    }
}

/// Iterator over the moves of a program.
#[derive(Debug, Clone)]
pub struct Moves<'a> {
    lines: std::iter::Enumerate<std::slice::Iter<'a, Instruction>>,
    tracker: MotionTracker,
}

impl<'a> Iterator for Moves<'a> {
    type Item = Move<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        for (index, instruction) in self.lines.by_ref() {
            if let Some((from, to)) = self.tracker.apply(instruction) {
                return Some(Move {
                    from,
                    to,
                    feed_rate: self.tracker.feed_rate(),
                    instruction,
                    index,
                });
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrintPhase {
    Preamble,
    Adhesion,
    Model,
    Postamble,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRange {
    pub phase: PrintPhase,
    pub lines: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub index: usize,
    pub z: f64,
    pub lines: Range<usize>,
}

#[derive(Debug, Clone)]
struct Analysis {
    bounding_box: Option<Cuboid>,
    phases: Vec<PhaseRange>,
    layers: Vec<Layer>,
}

/// An ordered sequence of instructions.
#[derive(Debug, Clone, Default)]
pub struct Program {
    lines: Vec<Instruction>,
    analysis: OnceLock<Analysis>,
}

impl PartialEq for Program {
    fn eq(&self, other: &Self) -> bool {
        self.lines == other.lines
    }
}

impl Program {
    pub fn new(lines: Vec<Instruction>) -> Self {
        Self { lines, analysis: OnceLock::new() }
    }

    /// Parse program text; blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self, GCodeError> {
        let mut lines = Vec::new();
        for (number, raw) in text.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            let code = Instruction::parse(raw).map_err(|e| e.at_line(number + 1))?;
            lines.push(code);
        }
        Ok(Self::new(lines))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, GCodeError> {
        let path = path.as_ref();
        tracing::info!("Reading G-code file: {}", path.display());
        let content = tokio::fs::read_to_string(path).await?;
        let program = Self::parse(&content)?;
        tracing::info!("Loaded {} G-code lines from {}", program.len(), path.display());
        Ok(program)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), GCodeError> {
        let path = path.as_ref();
        tracing::info!("Writing G-code file: {}", path.display());
        tokio::fs::write(path, self.to_ascii()).await?;
        Ok(())
    }

    pub fn lines(&self) -> &[Instruction] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<Instruction> {
        self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.lines.get(index)
    }

    /// Settings of the slicer that produced this program, if it left any.
    pub fn slicer_profile(&self) -> Option<SlicerProfile> {
        SlicerProfile::from_lines(&self.lines)
    }

    pub fn to_ascii(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.to_ascii());
            out.push('\n');
        }
        out
    }

    /// Replay the program from the origin, yielding every G0/G1.
    pub fn enumerate_moves(&self) -> Moves<'_> {
        Moves { lines: self.lines.iter().enumerate(), tracker: MotionTracker::new() }
    }

    /// Volume covered by all move targets, `None` without motion.
    pub fn bounding_box(&self) -> Option<Cuboid> {
        self.analysis().bounding_box
    }

    pub fn phases(&self) -> &[PhaseRange] {
        &self.analysis().phases
    }

    pub fn layers(&self) -> &[Layer] {
        &self.analysis().layers
    }

    pub fn phase_at(&self, index: usize) -> Option<PrintPhase> {
        self.phases()
            .iter()
            .find(|range| range.lines.contains(&index))
            .map(|range| range.phase)
    }

    pub fn phase_range(&self, phase: PrintPhase) -> Option<&PhaseRange> {
        self.phases().iter().find(|range| range.phase == phase)
    }

    pub fn layer_at(&self, index: usize) -> Option<&Layer> {
        self.layers().iter().find(|layer| layer.lines.contains(&index))
    }

    fn analysis(&self) -> &Analysis {
        self.analysis.get_or_init(|| Analysis {
            bounding_box: measure_bounding_box(self),
            phases: detect_phases(&self.lines),
            layers: detect_layers(self),
        })
    }
}

impl FromStr for Program {
    type Err = GCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Vec<Instruction>> for Program {
    fn from(lines: Vec<Instruction>) -> Self {
        Self::new(lines)
    }
}

fn measure_bounding_box(program: &Program) -> Option<Cuboid> {
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    let mut any = false;
    for step in program.enumerate_moves() {
        any = true;
        for (axis, value) in step.to.xyz().into_iter().enumerate() {
            min[axis] = min[axis].min(value);
            max[axis] = max[axis].max(value);
        }
    }
    any.then(|| Cuboid::from_corners(min, max))
}

fn layer_marker(code: &Instruction) -> Option<i64> {
    let comment = code.comment()?.trim();
    let rest = comment.strip_prefix(LAYER_MARKER)?;
    rest.trim().parse().ok()
}

fn is_postamble_marker(code: &Instruction) -> bool {
    let Some(comment) = code.comment() else {
        return false;
    };
    let upper = comment.trim().to_ascii_uppercase();
    upper == "END"
        || upper.starts_with("POSTAMBLE")
        || upper.starts_with("END GCODE")
        || upper.starts_with("END OF GCODE")
        || upper.starts_with("END G-CODE")
}

fn detect_phases(lines: &[Instruction]) -> Vec<PhaseRange> {
    let mut boundaries: Vec<(usize, PrintPhase)> = Vec::new();
    for (index, code) in lines.iter().enumerate() {
        let phase = if let Some(layer) = layer_marker(code) {
            if layer < 0 { PrintPhase::Adhesion } else { PrintPhase::Model }
        } else if is_postamble_marker(code) {
            PrintPhase::Postamble
        } else {
            continue;
        };
        if boundaries.last().map(|(_, last)| *last) != Some(phase) {
            boundaries.push((index, phase));
        }
    }

    // Without markers the whole program counts as model.
    if boundaries.is_empty() {
        return vec![PhaseRange { phase: PrintPhase::Model, lines: 0..lines.len() }];
    }
    if boundaries[0].0 > 0 {
        boundaries.insert(0, (0, PrintPhase::Preamble));
    }

    boundaries
        .iter()
        .enumerate()
        .map(|(i, (start, phase))| {
            let end = boundaries.get(i + 1).map_or(lines.len(), |(next, _)| *next);
            PhaseRange { phase: *phase, lines: *start..end }
        })
        .collect()
}

fn detect_layers(program: &Program) -> Vec<Layer> {
    let lines = program.lines();
    let explicit: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, code)| layer_marker(code).is_some())
        .map(|(index, _)| index)
        .collect();

    let starts: Vec<(usize, Option<f64>)> = if explicit.is_empty() {
        let mut starts = Vec::new();
        let mut current_z = f64::NEG_INFINITY;
        for step in program.enumerate_moves().filter(|m| m.is_extruding()) {
            if step.to.z > current_z + Z_EPSILON {
                current_z = step.to.z;
                starts.push((step.index, Some(step.to.z)));
            }
        }
        starts
    } else {
        explicit.into_iter().map(|index| (index, None)).collect()
    };

    let mut layers = Vec::with_capacity(starts.len());
    let mut moves = program.enumerate_moves().peekable();
    for (i, (start, z)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map_or(lines.len(), |(next, _)| *next);
        let z = z.unwrap_or_else(|| {
            // Height of the first extruding move inside the layer.
            while moves.peek().is_some_and(|m| m.index < *start) {
                moves.next();
            }
            moves
                .clone()
                .take_while(|m| m.index < end)
                .find(|m| m.is_extruding())
                .map_or_else(|| moves.peek().map_or(0.0, |m| m.from.z), |m| m.to.z)
        });
        layers.push(Layer { index: i, z, lines: *start..end });
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
;Generated
G90
M104 S215
G28
;LAYER:-1
G1 Z0.3 F1200
G1 X10 Y10 E1
;LAYER:0
G1 Z0.5
G1 X20 Y10 E2
G1 X20 Y20 E3
;LAYER:1
G1 Z0.7
G1 X10 Y20 E4
;End GCode
M104 S0
";

    #[test]
    fn test_parse_skips_blank_lines() {
        let program = Program::parse("G28\n\n   \nG1 X1\n").unwrap();
        assert_eq!(program.len(), 2);
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = Program::parse("G28\nG1 X1\n#oops\n").unwrap_err();
        assert_eq!(err, GCodeError::Parse { text: "#oops".to_string(), line: Some(3) });
    }

    #[test]
    fn test_enumerate_moves_relative_and_reset() {
        let program = Program::parse("G1 X10 Y10\nG91\nG1 X5 E1\nG92 E0\nG90\nG1 X0 E2").unwrap();
        let moves: Vec<_> = program.enumerate_moves().collect();
        assert_eq!(moves.len(), 3);
        assert_eq!(moves[1].from, AbsolutePosition::new(10.0, 10.0, 0.0, 0.0));
        assert_eq!(moves[1].to, AbsolutePosition::new(15.0, 10.0, 0.0, 1.0));
        assert_eq!(moves[2].from.e, 0.0);
        assert_eq!(moves[2].to, AbsolutePosition::new(0.0, 10.0, 0.0, 2.0));
        assert_eq!(moves[2].index, 5);
    }

    #[test]
    fn test_feed_rate_is_sticky() {
        let program = Program::parse("G1 X1 F600\nG1 X2\nG1 X3 F1200").unwrap();
        let rates: Vec<f64> = program.enumerate_moves().map(|m| m.feed_rate).collect();
        assert_eq!(rates, vec![600.0, 600.0, 1200.0]);
    }

    #[test]
    fn test_bounding_box_matches_traversal() {
        let program = Program::parse(SAMPLE).unwrap();
        let bbox = program.bounding_box().unwrap();
        let mut min = [f64::MAX; 3];
        let mut max = [f64::MIN; 3];
        for m in program.enumerate_moves() {
            for (axis, v) in m.to.xyz().into_iter().enumerate() {
                min[axis] = min[axis].min(v);
                max[axis] = max[axis].max(v);
            }
        }
        assert_eq!(bbox.origin, min);
        for axis in 0..3 {
            assert!((bbox.size[axis] - (max[axis] - min[axis])).abs() < 1e-9);
        }
        assert_eq!(bbox.origin, [0.0, 0.0, 0.3]);
    }

    #[test]
    fn test_no_motion_has_no_bounding_box() {
        assert!(Program::parse("M104 S200\n;hello").unwrap().bounding_box().is_none());
    }

    #[test]
    fn test_phases_from_markers() {
        let program = Program::parse(SAMPLE).unwrap();
        let phases: Vec<_> = program.phases().iter().map(|p| (p.phase, p.lines.clone())).collect();
        assert_eq!(
            phases,
            vec![
                (PrintPhase::Preamble, 0..4),
                (PrintPhase::Adhesion, 4..7),
                (PrintPhase::Model, 7..14),
                (PrintPhase::Postamble, 14..16),
            ]
        );
        assert_eq!(program.phase_at(9), Some(PrintPhase::Model));
    }

    #[test]
    fn test_layers_from_markers() {
        let program = Program::parse(SAMPLE).unwrap();
        let layers = program.layers();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].lines, 4..7);
        assert!((layers[0].z - 0.3).abs() < 1e-9);
        assert!((layers[1].z - 0.5).abs() < 1e-9);
        assert_eq!(layers[2].lines, 11..16);
        assert_eq!(program.layer_at(12).map(|l| l.index), Some(2));
    }

    #[test]
    fn test_layers_from_z_changes() {
        let program =
            Program::parse("G1 Z0.2\nG1 X5 E1\nG1 X6 E2\nG1 Z0.4\nG1 X7 E3\nG1 Z0.3\nG1 X8 E4")
                .unwrap();
        let layers = program.layers();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].lines, 1..4);
        assert_eq!(layers[1].lines, 4..7);
        assert!((layers[1].z - 0.4).abs() < 1e-9);
        // Without markers everything is model.
        assert_eq!(program.phases().len(), 1);
        assert_eq!(program.phase_at(0), Some(PrintPhase::Model));
    }

    #[test]
    fn test_ascii_export_round_trip() {
        let program = Program::parse(SAMPLE).unwrap();
        assert_eq!(Program::parse(&program.to_ascii()).unwrap(), program);
    }
}

// src/preprocess.rs - Turns a raw program into one that is safe to send to the printer
use std::collections::BTreeMap;

use thiserror::Error;

use crate::gcode::{helpers, Field, Instruction, Program};
use crate::geometry::Cuboid;
use crate::parameters::PrintParameters;

pub const TACK_POINT_COMMENT: &str = "tack point";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Program extends outside the print volume: program {program:?}, printer {volume:?}")]
    OutOfBounds { program: Cuboid, volume: Cuboid },
}

/// Tack point timing for wave bonding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveBondingSettings {
    /// Interior corner angle below which a tack point is inserted.
    pub angle_threshold_degrees: f64,
    pub ms_per_mm: f64,
    pub min_ms: u32,
    pub max_ms: u32,
}

impl Default for WaveBondingSettings {
    fn default() -> Self {
        Self { angle_threshold_degrees: 90.0, ms_per_mm: 4.0, min_ms: 20, max_ms: 200 }
    }
}

impl WaveBondingSettings {
    fn dwell_for(&self, distance: f64) -> u32 {
        let ms = (distance * self.ms_per_mm).ceil().max(0.0);
        (ms.min(u32::MAX as f64) as u32).clamp(self.min_ms, self.max_ms)
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    params: PrintParameters,
    wave_bonding: WaveBondingSettings,
}

impl Preprocessor {
    pub fn new(params: PrintParameters) -> Self {
        Self { params, wave_bonding: WaveBondingSettings::default() }
    }

    pub fn with_wave_bonding(mut self, settings: WaveBondingSettings) -> Self {
        self.wave_bonding = settings;
        self
    }

    pub fn parameters(&self) -> &PrintParameters {
        &self.params
    }

    /// Run the whole pipeline. The output depends only on the inputs.
    pub fn process(&self, program: &Program) -> Result<Program, ValidationError> {
        tracing::debug!("Preprocessing {} lines", program.len());
        let lines = strip_line_numbers(program.lines());
        let lines = self.clamp_temperatures(lines);
        let mut program = Program::new(lines);
        if self.params.use_wave_bonding {
            program = self.insert_tack_points(&program);
        }
        let program = Self::renumber(&program);
        self.validate(&program)?;
        tracing::debug!("Preprocessed program has {} lines", program.len());
        Ok(program)
    }

    /// Clamp every heater target into the filament's range. Heater-off
    /// requests (S0) are kept. Programs that never heat get a blocking heat
    /// command up front.
    pub fn clamp_temperatures(&self, lines: Vec<Instruction>) -> Vec<Instruction> {
        let filament = self.params.filament;
        let mut heats = false;
        let mut out: Vec<Instruction> = lines
            .into_iter()
            .map(|code| {
                if !matches!(code.m(), Some(104) | Some(109)) {
                    return code;
                }
                match code.get(Field::S) {
                    Some(target) if target > 0.0 => {
                        heats = true;
                        let clamped = filament.clamp_temperature(target);
                        if clamped != target {
                            tracing::warn!(
                                "Clamping temperature {} to {} for {}",
                                target,
                                clamped,
                                filament.kind
                            );
                        }
                        code.with_field(Field::S, clamped)
                    }
                    _ => code,
                }
            })
            .collect();
        if !heats {
            out.insert(0, helpers::set_heater(self.params.target_temperature(), true));
        }
        out
    }

    /// Insert a dwell after every sharp corner of the first layer.
    pub fn insert_tack_points(&self, program: &Program) -> Program {
        let Some(first_layer) = program.layers().first() else {
            return program.clone();
        };
        let settings = self.wave_bonding;
        let mut tacks: BTreeMap<usize, u32> = BTreeMap::new();
        let mut since_last_tack = 0.0;
        let mut previous: Option<(usize, (f64, f64))> = None;

        for step in program.enumerate_moves() {
            if !first_layer.lines.contains(&step.index) {
                if step.index >= first_layer.lines.end {
                    break;
                }
                continue;
            }
            let vector = step.xy_vector();
            if !step.is_extruding() || (vector.0 == 0.0 && vector.1 == 0.0) {
                previous = None;
                continue;
            }
            since_last_tack += step.distance();
            if let Some((corner, incoming)) = previous {
                let angle = interior_angle(incoming, vector);
                if angle < settings.angle_threshold_degrees {
                    // The corner is at the end of the previous move.
                    let travelled = since_last_tack - step.distance();
                    tacks.insert(corner, settings.dwell_for(travelled));
                    since_last_tack = step.distance();
                }
            }
            previous = Some((step.index, vector));
        }

        if tacks.is_empty() {
            return program.clone();
        }
        tracing::debug!("Inserting {} tack points", tacks.len());
        let mut lines = Vec::with_capacity(program.len() + tacks.len());
        for (index, code) in program.lines().iter().enumerate() {
            lines.push(code.clone());
            if let Some(ms) = tacks.get(&index) {
                lines.push(helpers::dwell(*ms).with_comment(TACK_POINT_COMMENT));
            }
        }
        Program::new(lines)
    }

    pub fn validate(&self, program: &Program) -> Result<(), ValidationError> {
        let Some(bounds) = program.bounding_box() else {
            return Ok(());
        };
        if self.params.print_volume.contains(&bounds) {
            Ok(())
        } else {
            tracing::error!("Program bounding box {:?} exceeds the print volume", bounds);
            Err(ValidationError::OutOfBounds { program: bounds, volume: self.params.print_volume })
        }
    }

    /// Contiguous line numbers from 0 on every line that carries fields.
    pub fn renumber(program: &Program) -> Program {
        let mut next = 0u32;
        let lines = program
            .lines()
            .iter()
            .map(|code| {
                if !code.has_fields() {
                    return code.clone();
                }
                let numbered = code.with_field(Field::N, next as f64);
                next += 1;
                numbered
            })
            .collect();
        Program::new(lines)
    }
}

/// Line numbers belong to the protocol layer; drop whatever the file had.
fn strip_line_numbers(lines: &[Instruction]) -> Vec<Instruction> {
    lines
        .iter()
        .filter_map(|code| {
            if !code.has(Field::N) {
                return Some(code.clone());
            }
            let stripped = code.without_field(Field::N);
            (stripped.has_fields() || stripped.comment().is_some()).then_some(stripped)
        })
        .collect()
}

/// Angle at the vertex between an incoming and an outgoing direction, in
/// degrees. 180 means straight on, 0 means a full reversal.
fn interior_angle(incoming: (f64, f64), outgoing: (f64, f64)) -> f64 {
    let back = (-incoming.0, -incoming.1);
    let dot = back.0 * outgoing.0 + back.1 * outgoing.1;
    let norms = (back.0.hypot(back.1)) * (outgoing.0.hypot(outgoing.1));
    if norms == 0.0 {
        return 180.0;
    }
    (dot / norms).clamp(-1.0, 1.0).acos().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::FilamentType;

    fn params() -> PrintParameters {
        PrintParameters::for_filament(FilamentType::Pla)
    }

    #[test]
    fn test_temperatures_are_clamped() {
        let program = Program::parse("M104 S300\nM109 S100\nM104 S0\nG28").unwrap();
        let out = Preprocessor::new(params()).process(&program).unwrap();
        assert_eq!(out.lines()[0].get(Field::S), Some(240.0));
        assert_eq!(out.lines()[1].get(Field::S), Some(150.0));
        assert_eq!(out.lines()[2].get(Field::S), Some(0.0));
    }

    #[test]
    fn test_heating_is_prepended_when_missing() {
        let program = Program::parse("G28\nG1 X10 E1").unwrap();
        let out = Preprocessor::new(params()).process(&program).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out.lines()[0].to_ascii(), "N0 M109 S215");
    }

    #[test]
    fn test_incoming_line_numbers_are_replaced() {
        let program = Program::parse("N10 M104 S200\nN11 G28\nN12").unwrap();
        let out = Preprocessor::new(params()).process(&program).unwrap();
        assert_eq!(out.len(), 2);
        let numbers: Vec<_> = out.lines().iter().filter_map(|c| c.line_number()).collect();
        assert_eq!(numbers, vec![0, 1]);
    }

    #[test]
    fn test_renumber_is_contiguous() {
        let program = Program::parse("M104 S200\n;comment\nG28\nG1 X1").unwrap();
        let numbered = Preprocessor::renumber(&program);
        let numbers: Vec<_> = numbered.lines().iter().filter_map(|c| c.line_number()).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
        assert!(!numbered.lines()[1].has(Field::N));
    }

    #[test]
    fn test_out_of_bounds_program_is_rejected() {
        let program = Program::parse("M104 S200\nG1 X200 Y10 Z1 E1").unwrap();
        let err = Preprocessor::new(params()).process(&program).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfBounds { .. }));
    }

    #[test]
    fn test_interior_angle() {
        assert!((interior_angle((1.0, 0.0), (1.0, 0.0)) - 180.0).abs() < 1e-9);
        assert!((interior_angle((1.0, 0.0), (0.0, 1.0)) - 90.0).abs() < 1e-9);
        assert!(interior_angle((1.0, 0.0), (-1.0, 0.2)) < 15.0);
    }

    #[test]
    fn test_tack_points_on_sharp_first_layer_corners() {
        let text = "\
M104 S200
G1 Z0.3
G1 X10 Y10 E1
G1 X30 Y10 E2
G1 X12 Y14 E3
G1 X30 Y20 E4
G1 Z0.6
G1 X10 Y10 E5
G1 X30 Y10 E6
G1 X10 Y12 E7";
        let mut p = params();
        p.use_wave_bonding = true;
        let pre = Preprocessor::new(p);
        let out = pre.process(&Program::parse(text).unwrap()).unwrap();
        let tacks: Vec<_> = out
            .lines()
            .iter()
            .enumerate()
            .filter(|(_, code)| code.comment() == Some(TACK_POINT_COMMENT))
            .map(|(index, code)| (index, code.get(Field::P)))
            .collect();
        // Two hairpins on layer one, none on layer two.
        assert_eq!(tacks.len(), 2);
        assert_eq!(out.lines()[tacks[0].0 - 1].get(Field::X), Some(30.0));
        assert_eq!(out.lines()[tacks[0].0].g(), Some(4));
        let first_ms = tacks[0].1.unwrap();
        assert!(first_ms >= 20.0 && first_ms <= 200.0);

        // Numbering runs through the inserted dwells without gaps.
        let numbers: Vec<u16> = out.lines().iter().filter_map(|c| c.line_number()).collect();
        assert_eq!(numbers, (0..out.len() as u16).collect::<Vec<_>>());
        assert_eq!(out.lines()[tacks[0].0].line_number(), Some(tacks[0].0 as u16));
    }

    #[test]
    fn test_tack_point_dwell_grows_with_distance() {
        let settings = WaveBondingSettings::default();
        assert_eq!(settings.dwell_for(0.0), 20);
        assert_eq!(settings.dwell_for(10.0), 40);
        assert_eq!(settings.dwell_for(10.1), 41);
        assert_eq!(settings.dwell_for(1000.0), 200);
    }

    #[test]
    fn test_process_is_deterministic() {
        let text = "M104 S200\nG1 Z0.3\nG1 X10 Y10 E1\nG1 X30 Y10 E2\nG1 X12 Y14 E3";
        let mut p = params();
        p.use_wave_bonding = true;
        let pre = Preprocessor::new(p);
        let program = Program::parse(text).unwrap();
        assert_eq!(pre.process(&program).unwrap(), pre.process(&program).unwrap());
    }
}

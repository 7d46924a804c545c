// src/printer/compensation.rs - Bed-level and backlash corrections applied to outgoing moves
use serde::{Deserialize, Serialize};

use crate::gcode::helpers::convert_feed_rate;
use crate::gcode::program::MotionTracker;
use crate::gcode::{Field, Instruction};
use crate::geometry::AbsolutePosition;
use crate::parameters::{BacklashValues, BedLevelOffsets};

/// What bed-level interpolation does for points outside the calibrated rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutOfBoundsPolicy {
    /// Use the value at the nearest edge.
    #[default]
    Clamp,
    /// Continue the bilinear surface.
    Extrapolate,
}

/// Calibrated area of the bed, in machine XY.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BedRectangle {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BedRectangle {
    /// Bed of `width` x `depth` shrunk by `inset` on every side.
    pub fn inset(width: f64, depth: f64, inset: f64) -> Self {
        Self { min_x: inset, min_y: inset, max_x: width - inset, max_y: depth - inset }
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0)
    }

    /// Normalised coordinates; the front-left corner is (0, 0).
    fn normalize(&self, x: f64, y: f64) -> (f64, f64) {
        let width = self.max_x - self.min_x;
        let depth = self.max_y - self.min_y;
        let u = if width > 0.0 { (x - self.min_x) / width } else { 0.0 };
        let v = if depth > 0.0 { (y - self.min_y) / depth } else { 0.0 };
        (u, v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BedLevelCompensator {
    offsets: BedLevelOffsets,
    area: BedRectangle,
    policy: OutOfBoundsPolicy,
}

impl BedLevelCompensator {
    pub fn new(offsets: BedLevelOffsets, area: BedRectangle, policy: OutOfBoundsPolicy) -> Self {
        Self { offsets, area, policy }
    }

    pub fn offsets(&self) -> &BedLevelOffsets {
        &self.offsets
    }

    /// Z correction at (x, y): bilinear over the corners plus the common offset.
    pub fn z_adjustment_at(&self, x: f64, y: f64) -> f64 {
        let (mut u, mut v) = self.area.normalize(x, y);
        if self.policy == OutOfBoundsPolicy::Clamp {
            u = u.clamp(0.0, 1.0);
            v = v.clamp(0.0, 1.0);
        }
        let o = &self.offsets;
        o.common
            + o.front_left * (1.0 - u) * (1.0 - v)
            + o.front_right * u * (1.0 - v)
            + o.back_left * (1.0 - u) * v
            + o.back_right * u * v
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Positive,
    Negative,
}

impl Direction {
    fn of(delta: f64) -> Option<Self> {
        if delta > 0.0 {
            Some(Direction::Positive)
        } else if delta < 0.0 {
            Some(Direction::Negative)
        } else {
            None
        }
    }

    fn sign(self) -> f64 {
        match self {
            Direction::Positive => 1.0,
            Direction::Negative => -1.0,
        }
    }
}

/// Remembers the last travel direction per axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BacklashCompensator {
    last: [Option<Direction>; 2],
}

pub const AXIS_X: usize = 0;
pub const AXIS_Y: usize = 1;

impl BacklashCompensator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a move of `delta` on `axis` and return the extra travel the
    /// machine needs: `±amount` on a reversal, zero otherwise.
    pub fn register(&mut self, axis: usize, delta: f64, amount: f64) -> f64 {
        let Some(direction) = Direction::of(delta) else {
            return 0.0;
        };
        let previous = self.last[axis].replace(direction);
        match previous {
            Some(previous) if previous != direction => direction.sign() * amount,
            _ => 0.0,
        }
    }

    /// Forget direction history, e.g. after homing.
    pub fn reset(&mut self) {
        self.last = [None, None];
    }
}

/// Which corrections one rewrite applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct Compensation<'a> {
    pub bed_level: Option<&'a BedLevelCompensator>,
    pub backlash: Option<BacklashValues>,
    pub convert_feed_rate: bool,
}

/// Position bookkeeping for one printer.
///
/// `logical` follows the instructions as callers wrote them, `machine`
/// follows what was actually transmitted after compensation.
#[derive(Debug, Clone, Default)]
pub struct MotionState {
    logical: MotionTracker,
    machine: MotionTracker,
    backlash: BacklashCompensator,
    slack: [f64; 2],
}

impl MotionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logical_position(&self) -> AbsolutePosition {
        self.logical.position()
    }

    pub fn machine_position(&self) -> AbsolutePosition {
        self.machine.position()
    }

    pub fn is_relative(&self) -> bool {
        self.logical.is_relative()
    }

    pub fn is_relative_extrusion(&self) -> bool {
        self.logical.is_relative_extrusion()
    }

    /// Adopt a position reported by the firmware.
    pub fn synchronize(&mut self, position: AbsolutePosition) {
        self.logical.set_position(position);
        self.machine.set_position(position);
        self.reset_backlash();
    }

    fn reset_backlash(&mut self) {
        self.backlash.reset();
        self.slack = [0.0, 0.0];
    }

    /// Rewrite one instruction into what goes on the wire. Non-moves pass
    /// through unchanged; a move may be preceded by a backlash take-up move.
    pub fn rewrite(&mut self, code: &Instruction, compensation: &Compensation<'_>) -> Vec<Instruction> {
        let Some((from, to)) = self.logical.apply(code) else {
            let homes = code.g() == Some(28);
            let redefines_xy = code.g() == Some(92) && (code.has(Field::X) || code.has(Field::Y));
            if homes || redefines_xy {
                self.reset_backlash();
            }
            self.machine.apply(code);
            return vec![code.clone()];
        };
        let relative = self.logical.is_relative();
        let feed = |f: f64| if compensation.convert_feed_rate { convert_feed_rate(f) } else { f };
        let mut out = Vec::with_capacity(2);

        let mut took_up = false;
        if let Some(values) = compensation.backlash {
            let take_x = self.backlash.register(AXIS_X, to.x - from.x, values.x);
            let take_y = self.backlash.register(AXIS_Y, to.y - from.y, values.y);
            if take_x != 0.0 || take_y != 0.0 {
                let here = self.machine.position();
                let mut take_up = Instruction::with_field_value(Field::G, 0.0);
                if take_x != 0.0 {
                    take_up = take_up.with_field(Field::X, if relative { take_x } else { here.x + take_x });
                }
                if take_y != 0.0 {
                    take_up = take_up.with_field(Field::Y, if relative { take_y } else { here.y + take_y });
                }
                take_up = take_up.with_field(Field::F, feed(values.speed));
                tracing::trace!("Backlash take-up: {}", take_up);
                self.slack[AXIS_X] += take_x;
                self.slack[AXIS_Y] += take_y;
                self.machine.apply(&take_up);
                out.push(take_up);
                took_up = true;
            }
        }

        let here = self.machine.position();
        let emit = |target: f64, current: f64| if relative { target - current } else { target };
        let mut real = code.clone();
        let (slack_x, slack_y) = match compensation.backlash {
            Some(_) => (self.slack[AXIS_X], self.slack[AXIS_Y]),
            None => (0.0, 0.0),
        };
        if code.has(Field::X) {
            real = real.with_field(Field::X, emit(to.x + slack_x, here.x));
        }
        if code.has(Field::Y) {
            real = real.with_field(Field::Y, emit(to.y + slack_y, here.y));
        }
        let moves_xy = code.has(Field::X) || code.has(Field::Y);
        match compensation.bed_level {
            Some(bed) if code.has(Field::Z) || moves_xy => {
                let z = to.z + bed.z_adjustment_at(to.x, to.y);
                real = real.with_field(Field::Z, emit(z, here.z));
            }
            _ => {
                if code.has(Field::Z) {
                    real = real.with_field(Field::Z, emit(to.z, here.z));
                }
            }
        }
        match code.get(Field::F) {
            Some(f) => real = real.with_field(Field::F, feed(f)),
            None if took_up && self.logical.feed_rate() > 0.0 => {
                real = real.with_field(Field::F, feed(self.logical.feed_rate()));
            }
            None => {}
        }
        self.machine.apply(&real);
        out.push(real);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets() -> BedLevelOffsets {
        BedLevelOffsets { common: 0.1, back_left: 0.4, back_right: -0.2, front_right: 0.3, front_left: -0.1 }
    }

    fn compensator(policy: OutOfBoundsPolicy) -> BedLevelCompensator {
        BedLevelCompensator::new(offsets(), BedRectangle::inset(109.0, 113.0, 9.0), policy)
    }

    #[test]
    fn test_corners_are_exact() {
        let c = compensator(OutOfBoundsPolicy::Clamp);
        let o = offsets();
        let close = |a: f64, b: f64| (a - b).abs() < 1e-12;
        assert!(close(c.z_adjustment_at(9.0, 9.0), o.front_left + o.common));
        assert!(close(c.z_adjustment_at(100.0, 9.0), o.front_right + o.common));
        assert!(close(c.z_adjustment_at(9.0, 104.0), o.back_left + o.common));
        assert!(close(c.z_adjustment_at(100.0, 104.0), o.back_right + o.common));
    }

    #[test]
    fn test_center_is_average() {
        let c = compensator(OutOfBoundsPolicy::Clamp);
        let o = offsets();
        let (x, y) = BedRectangle::inset(109.0, 113.0, 9.0).center();
        let average = (o.back_left + o.back_right + o.front_right + o.front_left) / 4.0;
        assert!((c.z_adjustment_at(x, y) - (average + o.common)).abs() < 1e-12);
    }

    #[test]
    fn test_outside_rectangle() {
        let clamped = compensator(OutOfBoundsPolicy::Clamp);
        assert_eq!(clamped.z_adjustment_at(0.0, 0.0), clamped.z_adjustment_at(9.0, 9.0));
        let extrapolated = compensator(OutOfBoundsPolicy::Extrapolate);
        assert_ne!(extrapolated.z_adjustment_at(0.0, 0.0), extrapolated.z_adjustment_at(9.0, 9.0));
    }

    #[test]
    fn test_backlash_only_on_reversal() {
        let mut b = BacklashCompensator::new();
        assert_eq!(b.register(AXIS_X, 10.0, 0.3), 0.0);
        assert_eq!(b.register(AXIS_X, 5.0, 0.3), 0.0);
        assert_eq!(b.register(AXIS_X, 0.0, 0.3), 0.0);
        assert_eq!(b.register(AXIS_X, -2.0, 0.3), -0.3);
        assert_eq!(b.register(AXIS_X, -2.0, 0.3), 0.0);
        assert_eq!(b.register(AXIS_X, 1.0, 0.3), 0.3);
        // Axes are independent.
        assert_eq!(b.register(AXIS_Y, -1.0, 0.6), 0.0);
        b.reset();
        assert_eq!(b.register(AXIS_X, -1.0, 0.3), 0.0);
    }

    fn rewrite_all(state: &mut MotionState, text: &str, compensation: &Compensation<'_>) -> Vec<String> {
        text.lines()
            .flat_map(|line| state.rewrite(&Instruction::parse(line).unwrap(), compensation))
            .map(|code| code.to_ascii())
            .collect()
    }

    #[test]
    fn test_rewrite_applies_bed_level_and_feed_rate() {
        let bed = compensator(OutOfBoundsPolicy::Clamp);
        let compensation = Compensation { bed_level: Some(&bed), backlash: None, convert_feed_rate: true };
        let mut state = MotionState::new();
        let out = state.rewrite(&Instruction::parse("G0 X9 Y9 Z0.3 F1200").unwrap(), &compensation);
        assert_eq!(out.len(), 1);
        let z = out[0].get(Field::Z).unwrap();
        assert!((z - (0.3 + offsets().front_left + offsets().common)).abs() < 1e-9);
        assert!((out[0].get(Field::F).unwrap() - convert_feed_rate(1200.0)).abs() < 1e-9);
        assert_eq!(state.logical_position().z, 0.3);
        assert!((state.machine_position().z - z).abs() < 1e-9);
    }

    #[test]
    fn test_rewrite_inserts_backlash_take_up() {
        let compensation = Compensation {
            bed_level: None,
            backlash: Some(BacklashValues { x: 0.3, y: 0.6, speed: 1500.0 }),
            convert_feed_rate: false,
        };
        let mut state = MotionState::new();
        let out = rewrite_all(&mut state, "G1 X10 Y10 F600\nG1 X20\nG1 X5", &compensation);
        assert_eq!(out, vec!["G1 X10 Y10 F600", "G1 X20", "G0 X19.7 F1500", "G1 X4.7 F600"]);
        assert_eq!(state.logical_position().x, 5.0);
        assert!((state.machine_position().x - 4.7).abs() < 1e-9);

        // Same direction again: nothing extra.
        let out = rewrite_all(&mut state, "G1 X1", &compensation);
        assert_eq!(out, vec!["G1 X0.7"]);
    }

    #[test]
    fn test_rewrite_relative_mode() {
        let compensation = Compensation {
            bed_level: None,
            backlash: Some(BacklashValues { x: 0.5, y: 0.5, speed: 1000.0 }),
            convert_feed_rate: false,
        };
        let mut state = MotionState::new();
        let out = rewrite_all(&mut state, "G91\nG1 X10 F300\nG1 X-4", &compensation);
        assert_eq!(out, vec!["G91", "G1 X10 F300", "G0 X-0.5 F1000", "G1 X-4 F300"]);
        assert_eq!(state.logical_position().x, 6.0);
        assert!((state.machine_position().x - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_homing_resets_backlash() {
        let compensation = Compensation {
            bed_level: None,
            backlash: Some(BacklashValues { x: 0.3, y: 0.6, speed: 1500.0 }),
            convert_feed_rate: false,
        };
        let mut state = MotionState::new();
        let out = rewrite_all(&mut state, "G1 X10\nG1 X5\nG28\nG1 X3", &compensation);
        assert_eq!(out.last().map(String::as_str), Some("G1 X3"));
        assert_eq!(state.machine_position().x, 3.0);
    }
}

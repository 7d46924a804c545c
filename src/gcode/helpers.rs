// src/gcode/helpers.rs - Builders for the instructions the host sends on its own
use super::{Field, Instruction};
use crate::geometry::Vector3;

/// Highest feed rate the firmware distinguishes, in mm/s.
const MAX_FEED_RATE_MM_PER_SEC: f64 = 60.0001;

/// Convert a feed rate in mm/min to the firmware's inverted speed units.
pub fn convert_feed_rate(feed_rate: f64) -> f64 {
    let mm_per_sec = (feed_rate / 60.0).min(MAX_FEED_RATE_MM_PER_SEC);
    let factor = mm_per_sec / MAX_FEED_RATE_MM_PER_SEC;
    30.0 + (1.0 - factor) * 800.0
}

fn g(code: u16) -> Instruction {
    Instruction::with_field_value(Field::G, code as f64)
}

fn m(code: u16) -> Instruction {
    Instruction::with_field_value(Field::M, code as f64)
}

/// G0/G1 to the components present in `position`.
pub fn move_to(position: &Vector3, feed_rate: Option<f64>) -> Instruction {
    let mut code = g(0);
    if let Some(x) = position.x {
        code = code.with_field(Field::X, x);
    }
    if let Some(y) = position.y {
        code = code.with_field(Field::Y, y);
    }
    if let Some(z) = position.z {
        code = code.with_field(Field::Z, z);
    }
    if let Some(f) = feed_rate {
        code = code.with_field(Field::F, f);
    }
    code
}

/// Extruding move on the E axis only.
pub fn extrude(amount: f64, feed_rate: f64) -> Instruction {
    g(1).with_field(Field::E, amount).with_field(Field::F, feed_rate)
}

pub fn absolute_mode() -> Instruction {
    g(90)
}

pub fn relative_mode() -> Instruction {
    g(91)
}

pub fn absolute_extrusion() -> Instruction {
    m(82)
}

pub fn relative_extrusion() -> Instruction {
    m(83)
}

pub fn move_to_origin() -> Instruction {
    g(28)
}

/// G30: lower the head until it touches the bed and call that Z zero.
pub fn find_bed_zero() -> Instruction {
    g(30)
}

pub fn dwell(milliseconds: u32) -> Instruction {
    g(4).with_field(Field::P, milliseconds as f64)
}

/// G92: redefine the current extruder position.
pub fn reset_position(e: f64) -> Instruction {
    g(92).with_field(Field::E, e)
}

pub fn turn_off_motors() -> Instruction {
    m(18)
}

pub fn set_heater(temperature: f64, wait: bool) -> Instruction {
    m(if wait { 109 } else { 104 }).with_field(Field::S, temperature.round())
}

pub fn heater_off() -> Instruction {
    set_heater(0.0, false)
}

pub fn read_temperature() -> Instruction {
    m(105)
}

pub fn fetch_position() -> Instruction {
    m(114)
}

pub fn firmware_info() -> Instruction {
    m(115)
}

pub fn wait_for_moves() -> Instruction {
    m(400)
}

pub fn set_fan(speed: u8) -> Instruction {
    if speed == 0 { m(107) } else { m(106).with_field(Field::S, speed as f64) }
}

/// Virtual EEPROM slots are 4 bytes wide.
const EEPROM_SLOT_SIZE: f64 = 4.0;

pub fn read_eeprom(index: u16) -> Instruction {
    m(619)
        .with_field(Field::S, index as f64)
        .with_field(Field::T, EEPROM_SLOT_SIZE)
}

pub fn write_eeprom(index: u16, value: i32) -> Instruction {
    m(618)
        .with_field(Field::S, index as f64)
        .with_field(Field::P, value as f64)
        .with_field(Field::T, EEPROM_SLOT_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_feed_rate() {
        assert!((convert_feed_rate(0.0) - 830.0).abs() < 1e-9);
        assert!((convert_feed_rate(3600.006) - 30.0).abs() < 1e-6);
        assert!((convert_feed_rate(100_000.0) - 30.0).abs() < 1e-9);
        assert!(convert_feed_rate(1200.0) > convert_feed_rate(2400.0));
    }

    #[test]
    fn test_builders_round_trip() {
        let codes = vec![
            move_to(&Vector3::new(10.5, 20.25, 0.4), Some(1800.0)),
            move_to(&Vector3::z(5.0), None),
            extrude(-2.0, 600.0),
            absolute_mode(),
            relative_mode(),
            dwell(250),
            reset_position(0.0),
            set_heater(215.0, true),
            read_eeprom(16),
            write_eeprom(20, -1234),
            set_fan(255),
            move_to_origin(),
            find_bed_zero(),
        ];
        for code in codes {
            let parsed = Instruction::parse(&code.to_ascii()).unwrap();
            assert_eq!(parsed, code);
        }
    }

    #[test]
    fn test_move_only_present_axes() {
        let code = move_to(&Vector3::xy(1.0, 2.0), None);
        assert_eq!(code.to_ascii(), "G0 X1 Y2");
    }

    #[test]
    fn test_eeprom_codes() {
        assert_eq!(read_eeprom(3).to_ascii(), "M619 T4 S3");
        assert_eq!(write_eeprom(3, 42).to_ascii(), "M618 T4 S3 P42");
    }
}

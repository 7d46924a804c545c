// src/parameters.rs - Filament profiles and calibration values shared by preprocessing and the printer
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::geometry::Cuboid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilamentType {
    #[default]
    Pla,
    Abs,
    Hips,
    Other,
}

impl FilamentType {
    /// Id stored in the filament type EEPROM slot.
    pub fn eeprom_id(self) -> i32 {
        match self {
            FilamentType::Pla => 1,
            FilamentType::Abs => 2,
            FilamentType::Hips => 3,
            FilamentType::Other => 4,
        }
    }

    pub fn from_eeprom_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(FilamentType::Pla),
            2 => Some(FilamentType::Abs),
            3 => Some(FilamentType::Hips),
            4 => Some(FilamentType::Other),
            _ => None,
        }
    }

    pub fn profile(self) -> Filament {
        match self {
            FilamentType::Pla => Filament {
                kind: self,
                default_temperature: 215.0,
                min_temperature: 150.0,
                max_temperature: 240.0,
                fan_speed: 255,
            },
            FilamentType::Abs => Filament {
                kind: self,
                default_temperature: 275.0,
                min_temperature: 200.0,
                max_temperature: 285.0,
                fan_speed: 50,
            },
            FilamentType::Hips => Filament {
                kind: self,
                default_temperature: 265.0,
                min_temperature: 200.0,
                max_temperature: 285.0,
                fan_speed: 50,
            },
            FilamentType::Other => Filament {
                kind: self,
                default_temperature: 210.0,
                min_temperature: 150.0,
                max_temperature: 285.0,
                fan_speed: 255,
            },
        }
    }
}

impl fmt::Display for FilamentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilamentType::Pla => "PLA",
            FilamentType::Abs => "ABS",
            FilamentType::Hips => "HIPS",
            FilamentType::Other => "Other",
        };
        f.write_str(name)
    }
}

impl FromStr for FilamentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PLA" => Ok(FilamentType::Pla),
            "ABS" => Ok(FilamentType::Abs),
            "HIPS" => Ok(FilamentType::Hips),
            "OTHER" => Ok(FilamentType::Other),
            other => Err(format!("Unknown filament type '{}'", other)),
        }
    }
}

/// Temperature and cooling profile for one filament type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Filament {
    pub kind: FilamentType,
    pub default_temperature: f64,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub fan_speed: u8,
}

impl Filament {
    pub fn clamp_temperature(&self, temperature: f64) -> f64 {
        temperature.clamp(self.min_temperature, self.max_temperature)
    }
}

impl Default for Filament {
    fn default() -> Self {
        FilamentType::default().profile()
    }
}

/// Measured Z offsets for the four bed corners plus one common offset.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BedLevelOffsets {
    pub common: f64,
    pub back_left: f64,
    pub back_right: f64,
    pub front_right: f64,
    pub front_left: f64,
}

impl fmt::Display for BedLevelOffsets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "common {:.3}, back left {:.3}, back right {:.3}, front right {:.3}, front left {:.3}",
            self.common, self.back_left, self.back_right, self.front_right, self.front_left
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacklashValues {
    pub x: f64,
    pub y: f64,
    /// Feed rate used for compensation moves, mm/min.
    pub speed: f64,
}

impl Default for BacklashValues {
    fn default() -> Self {
        Self { x: 0.3, y: 0.6, speed: 1500.0 }
    }
}

impl fmt::Display for BacklashValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X {:.3}, Y {:.3} @ F{:.0}", self.x, self.y, self.speed)
    }
}

/// Everything the preprocessor and print job need besides the program.
#[derive(Debug, Clone, PartialEq)]
pub struct PrintParameters {
    pub filament: Filament,
    pub ideal_temperature: f64,
    /// Printable volume the program has to fit in.
    pub print_volume: Cuboid,
    pub bed_level_offsets: BedLevelOffsets,
    pub backlash_values: BacklashValues,
    pub use_wave_bonding: bool,
    pub use_backlash_compensation: bool,
    /// Heating counts as done once within this many degrees of the target.
    pub temperature_tolerance: f64,
    pub verbose: bool,
}

impl Default for PrintParameters {
    fn default() -> Self {
        let filament = Filament::default();
        Self {
            filament,
            ideal_temperature: filament.default_temperature,
            print_volume: Cuboid::new([0.0, 0.0, 0.0], [109.0, 113.0, 116.0]),
            bed_level_offsets: BedLevelOffsets::default(),
            backlash_values: BacklashValues::default(),
            use_wave_bonding: false,
            use_backlash_compensation: true,
            temperature_tolerance: 3.0,
            verbose: false,
        }
    }
}

impl PrintParameters {
    pub fn for_filament(kind: FilamentType) -> Self {
        let filament = kind.profile();
        Self { filament, ideal_temperature: filament.default_temperature, ..Self::default() }
    }

    /// Target temperature after clamping into the filament's safe range.
    pub fn target_temperature(&self) -> f64 {
        self.filament.clamp_temperature(self.ideal_temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filament_parsing() {
        assert_eq!("pla".parse::<FilamentType>().unwrap(), FilamentType::Pla);
        assert_eq!("HIPS".parse::<FilamentType>().unwrap(), FilamentType::Hips);
        assert!("nylon".parse::<FilamentType>().is_err());
    }

    #[test]
    fn test_target_temperature_is_clamped() {
        let mut params = PrintParameters::for_filament(FilamentType::Pla);
        assert_eq!(params.target_temperature(), 215.0);
        params.ideal_temperature = 300.0;
        assert_eq!(params.target_temperature(), 240.0);
    }

    #[test]
    fn test_eeprom_ids_round_trip() {
        for kind in [FilamentType::Pla, FilamentType::Abs, FilamentType::Hips, FilamentType::Other] {
            assert_eq!(FilamentType::from_eeprom_id(kind.eeprom_id()), Some(kind));
        }
    }
}

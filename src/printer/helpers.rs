// src/printer/helpers.rs - Higher level commands built on a context
use std::collections::BTreeMap;

use super::eeprom::{decode_float, EepromIndex};
use super::{Calibration, Context, PrinterError};
use crate::gcode::{helpers, Instruction};
use crate::geometry::{AbsolutePosition, Vector3};
use crate::parameters::{BacklashValues, BedLevelOffsets, FilamentType, PrintParameters};

const BED_OFFSET_SLOTS: [u16; 5] = [
    EepromIndex::BED_OFFSET_BACK_LEFT,
    EepromIndex::BED_OFFSET_BACK_RIGHT,
    EepromIndex::BED_OFFSET_FRONT_RIGHT,
    EepromIndex::BED_OFFSET_FRONT_LEFT,
    EepromIndex::BED_OFFSET_COMMON,
];

const BACKLASH_SLOTS: [u16; 3] = [
    EepromIndex::BACKLASH_COMPENSATION_X,
    EepromIndex::BACKLASH_COMPENSATION_Y,
    EepromIndex::BACKLASH_COMPENSATION_SPEED,
];

/// Where the head logically is and how coordinates are currently interpreted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Positioning {
    pub position: AbsolutePosition,
    pub relative: bool,
    pub relative_extrusion: bool,
}

impl Positioning {
    /// Instructions that put the firmware back into this positioning mode.
    pub fn restore_mode(&self) -> Vec<Instruction> {
        let axes = if self.relative { helpers::relative_mode() } else { helpers::absolute_mode() };
        let extruder = if self.relative_extrusion {
            helpers::relative_extrusion()
        } else {
            helpers::absolute_extrusion()
        };
        vec![axes, extruder]
    }
}

impl Context {
    pub async fn fetch_bed_offsets(&self) -> Result<BedLevelOffsets, PrinterError> {
        let values = self.read_eeprom_floats(&BED_OFFSET_SLOTS).await?;
        let offsets = BedLevelOffsets {
            back_left: values[0],
            back_right: values[1],
            front_right: values[2],
            front_left: values[3],
            common: values[4],
        };
        self.session()?.update_calibration(|c| c.bed_level = offsets).await;
        tracing::debug!("Bed offsets: {}", offsets);
        Ok(offsets)
    }

    pub async fn set_bed_offsets(&self, offsets: BedLevelOffsets) -> Result<(), PrinterError> {
        let values = BTreeMap::from([
            (EepromIndex::BED_OFFSET_BACK_LEFT, offsets.back_left),
            (EepromIndex::BED_OFFSET_BACK_RIGHT, offsets.back_right),
            (EepromIndex::BED_OFFSET_FRONT_RIGHT, offsets.front_right),
            (EepromIndex::BED_OFFSET_FRONT_LEFT, offsets.front_left),
            (EepromIndex::BED_OFFSET_COMMON, offsets.common),
        ]);
        self.write_eeprom_floats(&values).await?;
        self.session()?.update_calibration(|c| c.bed_level = offsets).await;
        tracing::info!("Stored bed offsets: {}", offsets);
        Ok(())
    }

    /// Backlash values; a speed of zero means the slot was never written.
    pub async fn fetch_backlash_values(&self) -> Result<BacklashValues, PrinterError> {
        let raw = self.read_eeprom_values(&BACKLASH_SLOTS).await?;
        let speed = decode_float(raw[2]);
        let values = BacklashValues {
            x: decode_float(raw[0]),
            y: decode_float(raw[1]),
            speed: if speed > 0.0 { speed } else { BacklashValues::default().speed },
        };
        self.session()?.update_calibration(|c| c.backlash = values).await;
        tracing::debug!("Backlash values: {}", values);
        Ok(values)
    }

    pub async fn set_backlash_values(&self, values: BacklashValues) -> Result<(), PrinterError> {
        let slots = BTreeMap::from([
            (EepromIndex::BACKLASH_COMPENSATION_X, values.x),
            (EepromIndex::BACKLASH_COMPENSATION_Y, values.y),
            (EepromIndex::BACKLASH_COMPENSATION_SPEED, values.speed),
        ]);
        self.write_eeprom_floats(&slots).await?;
        self.session()?.update_calibration(|c| c.backlash = values).await;
        tracing::info!("Stored backlash values: {}", values);
        Ok(())
    }

    /// Re-read bed offsets and backlash values from the printer.
    pub async fn refresh_calibration(&self) -> Result<Calibration, PrinterError> {
        let bed_level = self.fetch_bed_offsets().await?;
        let backlash = self.fetch_backlash_values().await?;
        Ok(Calibration { bed_level, backlash })
    }

    /// Fill the printer's stored calibration into `params`.
    pub async fn load_calibration(&self, params: &mut PrintParameters) -> Result<(), PrinterError> {
        let calibration = self.refresh_calibration().await?;
        params.bed_level_offsets = calibration.bed_level;
        params.backlash_values = calibration.backlash;
        Ok(())
    }

    /// Filament recorded in the EEPROM. An unset temperature falls back to
    /// the type's default; an unknown type yields `None`.
    pub async fn fetch_filament(&self) -> Result<Option<(FilamentType, f64)>, PrinterError> {
        let values = self
            .read_eeprom_values(&[EepromIndex::FILAMENT_TYPE_ID, EepromIndex::FILAMENT_TEMPERATURE])
            .await?;
        let Some(kind) = FilamentType::from_eeprom_id(values[0]) else {
            return Ok(None);
        };
        let temperature = match values[1] {
            t if t > 0 => t as f64,
            _ => kind.profile().default_temperature,
        };
        Ok(Some((kind, temperature)))
    }

    /// Ask the firmware where the head is and adopt that as the current position.
    pub async fn fetch_position(&self) -> Result<AbsolutePosition, PrinterError> {
        let response = self.execute(helpers::fetch_position()).await?;
        let axis = |key: &str| {
            response.param_f64(key).ok_or_else(|| {
                PrinterError::UnexpectedResponse(format!("position report without {}: {}", key, response))
            })
        };
        let e = response.param_f64("E").unwrap_or(0.0);
        let position = AbsolutePosition::new(axis("X")?, axis("Y")?, axis("Z")?, e);
        self.session()?.synchronize_position(position).await;
        Ok(position)
    }

    pub async fn positioning(&self) -> Result<Positioning, PrinterError> {
        let session = self.session()?;
        let motion = session.motion.lock().await;
        Ok(Positioning {
            position: motion.logical_position(),
            relative: motion.is_relative(),
            relative_extrusion: motion.is_relative_extrusion(),
        })
    }

    pub async fn set_relative_mode(&self, relative: bool) -> Result<(), PrinterError> {
        let code = if relative { helpers::relative_mode() } else { helpers::absolute_mode() };
        self.execute(code).await?;
        Ok(())
    }

    pub async fn move_to(&self, position: &Vector3, feed_rate: f64) -> Result<(), PrinterError> {
        self.execute(helpers::move_to(position, Some(feed_rate))).await?;
        Ok(())
    }

    /// Resolves once every queued move has physically finished.
    pub async fn wait_for_moves(&self) -> Result<(), PrinterError> {
        self.execute(helpers::wait_for_moves()).await?;
        Ok(())
    }

    pub async fn set_heater(&self, temperature: f64) -> Result<(), PrinterError> {
        self.execute(helpers::set_heater(temperature, false)).await?;
        Ok(())
    }

    pub async fn read_temperature(&self) -> Result<f64, PrinterError> {
        let response = self.execute(helpers::read_temperature()).await?;
        match response.param_f64("T") {
            Some(temperature) => Ok(temperature),
            None => self.session()?.heater().current.ok_or_else(|| {
                PrinterError::UnexpectedResponse(format!("temperature request answered with {}", response))
            }),
        }
    }

    /// Set the heater, then poll until within `tolerance` of `target`.
    /// `progress` sees every reading. Returns the final reading.
    pub async fn heat_and_wait(
        &self,
        target: f64,
        tolerance: f64,
        mut progress: impl FnMut(f64),
    ) -> Result<f64, PrinterError> {
        tracing::info!("Heating to {:.0}°C", target);
        self.set_heater(target).await?;
        let interval = self.session()?.options().poll_interval;
        loop {
            let current = self.read_temperature().await?;
            progress(current);
            if current >= target - tolerance {
                tracing::info!("Reached {:.1}°C (target {:.0}°C)", current, target);
                return Ok(current);
            }
            tracing::debug!("Heating: {:.1}°C of {:.0}°C", current, target);
            tokio::time::sleep(interval).await;
        }
    }
}

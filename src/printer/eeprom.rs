// src/printer/eeprom.rs - Virtual EEPROM addressing and value encoding
use std::collections::BTreeMap;

use futures::future::join_all;

use super::{Context, PrinterError, Response};
use crate::gcode::helpers;

/// Slot addresses of the printer's virtual EEPROM.
pub struct EepromIndex;

impl EepromIndex {
    pub const BACKLASH_COMPENSATION_X: u16 = 0;
    pub const BACKLASH_COMPENSATION_Y: u16 = 1;

    pub const BED_COMPENSATION_BACK_RIGHT: u16 = 2;
    pub const BED_COMPENSATION_BACK_LEFT: u16 = 3;
    pub const BED_COMPENSATION_FRONT_LEFT: u16 = 4;
    pub const BED_COMPENSATION_FRONT_RIGHT: u16 = 5;

    pub const FILAMENT_COLOR: u16 = 6;
    pub const FILAMENT_TYPE_ID: u16 = 7;
    pub const FILAMENT_TEMPERATURE: u16 = 8;
    pub const FILAMENT_AMOUNT: u16 = 9;

    pub const BACKLASH_EXPANSION_X_PLUS: u16 = 10;
    pub const BACKLASH_EXPANSION_YL_PLUS: u16 = 11;
    pub const BACKLASH_EXPANSION_YR_PLUS: u16 = 12;
    pub const BACKLASH_EXPANSION_YR_MINUS: u16 = 13;
    pub const BACKLASH_EXPANSION_Z: u16 = 14;
    pub const BACKLASH_EXPANSION_E: u16 = 15;

    pub const BED_OFFSET_BACK_LEFT: u16 = 16;
    pub const BED_OFFSET_BACK_RIGHT: u16 = 17;
    pub const BED_OFFSET_FRONT_RIGHT: u16 = 18;
    pub const BED_OFFSET_FRONT_LEFT: u16 = 19;
    pub const BED_OFFSET_COMMON: u16 = 20;

    pub const RESERVED_FOR_SPOOLER: u16 = 21;
    pub const BACKLASH_COMPENSATION_SPEED: u16 = 22;
    pub const G32_VERSION: u16 = 23;

    pub const G32_FIRST_SAMPLE: u16 = 64;
    pub const G32_LAST_SAMPLE: u16 = 126;

    pub fn is_valid(index: u16) -> bool {
        index <= Self::G32_VERSION || (Self::G32_FIRST_SAMPLE..=Self::G32_LAST_SAMPLE).contains(&index)
    }
}

const FIXED_POINT_SCALE: f64 = 65536.0;

/// Float to the 16.16 fixed point the firmware stores.
pub fn encode_float(value: f64) -> i32 {
    (value * FIXED_POINT_SCALE).round() as i32
}

pub fn decode_float(value: i32) -> f64 {
    value as f64 / FIXED_POINT_SCALE
}

fn check_index(index: u16) -> Result<(), PrinterError> {
    if EepromIndex::is_valid(index) {
        Ok(())
    } else {
        Err(PrinterError::InvalidEepromIndex(index))
    }
}

fn parse_read_response(index: u16, response: &Response) -> Result<i32, PrinterError> {
    let slot = response.param_i64("PT");
    let value = response.param_i64("DT");
    match (slot, value) {
        (Some(slot), Some(value)) if slot == index as i64 => Ok(value as i32),
        _ => Err(PrinterError::UnexpectedResponse(format!(
            "EEPROM read of slot {} answered with {}",
            index, response
        ))),
    }
}

impl Context {
    pub async fn read_eeprom(&self, index: u16) -> Result<i32, PrinterError> {
        check_index(index)?;
        let response = self.send(helpers::read_eeprom(index)).await?.wait().await?;
        parse_read_response(index, &response)
    }

    pub async fn write_eeprom(&self, index: u16, value: i32) -> Result<(), PrinterError> {
        check_index(index)?;
        self.send(helpers::write_eeprom(index, value)).await?.wait().await?;
        Ok(())
    }

    /// Read several slots. The firmware has no multi-slot command, so all
    /// reads are queued at once and awaited together.
    pub async fn read_eeprom_values(&self, indexes: &[u16]) -> Result<Vec<i32>, PrinterError> {
        for index in indexes {
            check_index(*index)?;
        }
        let mut handles = Vec::with_capacity(indexes.len());
        for index in indexes {
            handles.push(self.send(helpers::read_eeprom(*index)).await?);
        }
        let responses = join_all(handles.into_iter().map(|h| h.wait())).await;
        indexes
            .iter()
            .zip(responses)
            .map(|(index, response)| parse_read_response(*index, &response?))
            .collect()
    }

    pub async fn write_eeprom_values(&self, values: &BTreeMap<u16, i32>) -> Result<(), PrinterError> {
        for index in values.keys() {
            check_index(*index)?;
        }
        let mut handles = Vec::with_capacity(values.len());
        for (index, value) in values {
            handles.push(self.send(helpers::write_eeprom(*index, *value)).await?);
        }
        for result in join_all(handles.into_iter().map(|h| h.wait())).await {
            result?;
        }
        tracing::debug!("Wrote {} EEPROM slots", values.len());
        Ok(())
    }

    pub async fn read_eeprom_floats(&self, indexes: &[u16]) -> Result<Vec<f64>, PrinterError> {
        Ok(self.read_eeprom_values(indexes).await?.into_iter().map(decode_float).collect())
    }

    pub async fn write_eeprom_floats(&self, values: &BTreeMap<u16, f64>) -> Result<(), PrinterError> {
        let encoded = values.iter().map(|(index, value)| (*index, encode_float(*value))).collect();
        self.write_eeprom_values(&encoded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_point() {
        assert_eq!(encode_float(1.0), 65536);
        assert_eq!(encode_float(-0.5), -32768);
        assert_eq!(encode_float(0.3), 19661);
        assert!((decode_float(encode_float(0.3)) - 0.3).abs() < 1.0 / 65536.0);
    }

    #[test]
    fn test_valid_indexes() {
        assert!(EepromIndex::is_valid(0));
        assert!(EepromIndex::is_valid(EepromIndex::G32_VERSION));
        assert!(!EepromIndex::is_valid(24));
        assert!(!EepromIndex::is_valid(63));
        assert!(EepromIndex::is_valid(64));
        assert!(EepromIndex::is_valid(126));
        assert!(!EepromIndex::is_valid(127));
    }
}

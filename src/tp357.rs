use thiserror::Error;
use uuid::Uuid;

use crate::reading::Reading;

/// Characteristic answering direct reads with the current measurement.
pub const REALTIME_CHAR_UUID: Uuid = Uuid::from_u128(0x00010203_0405_0607_0809_0a0b0c0d2b11);

/// Characteristic pushing measurement frames as notifications.
pub const DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x00010203_0405_0607_0809_0a0b0c0d2b10);

pub const MIN_FRAME_LEN: usize = 6;

pub const TEMPERATURE_BYTE: usize = 3;
pub const HUMIDITY_BYTE: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame too short: expected at least {MIN_FRAME_LEN} bytes, got {len}")]
    TooShort { len: usize },
}

/// Decodes a TP357S measurement frame.
///
/// Byte 3 carries tenths of a degree Celsius and byte 5 the relative
/// humidity in percent. Anything after byte 5 is ignored.
pub fn decode(data: &[u8]) -> Result<Reading, DecodeError> {
    if data.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort { len: data.len() });
    }

    let celsius = round_tenths(f64::from(data[TEMPERATURE_BYTE]) / 10.0);
    let fahrenheit = round_tenths(celsius * 9.0 / 5.0 + 32.0);

    Ok(Reading {
        temperature_celsius: celsius,
        temperature_fahrenheit: fahrenheit,
        humidity_percent: data[HUMIDITY_BYTE],
        raw_hex: hex::encode(data),
    })
}

fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

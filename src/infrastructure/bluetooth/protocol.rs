//! Physio Sensor Protocol
//!
//! Identifiers fixed by the device firmware and the codec that turns raw
//! characteristic payloads into readings. The wire format is device specific,
//! so decoding goes through the [`SensorCodec`] trait.

use crate::domain::models::{DevicePlacement, MotionReading};
use crate::infrastructure::bluetooth::error::LinkError;
use thiserror::Error;
use uuid::Uuid;

/// Sensor BLE Service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc);

/// Motion characteristic - accelerometer, gyroscope and derived angle
pub const SENSOR_CHAR_UUID: Uuid = Uuid::from_u128(0x87654321_4321_4321_4321_cba987654321);

/// Placement characteristic - whether the sensor is worn correctly
pub const PLACEMENT_CHAR_UUID: Uuid = Uuid::from_u128(0x11111111_2222_3333_4444_555555555555);

/// Advertised name prefix of the supported device family
pub const DEVICE_NAME_PREFIX: &str = "PhysioDevice";

/// Size of a motion frame: seven little-endian f32 values
pub const MOTION_FRAME_LEN: usize = 28;

/// Size of a placement frame
pub const PLACEMENT_FRAME_LEN: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid packet size: {actual} (expected {expected})")]
    InvalidLength { expected: usize, actual: usize },
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    #[error("unknown placement code: {0:#04x}")]
    UnknownPlacement(u8),
}

/// Device-specific payload decoding.
pub trait SensorCodec: Send + Sync {
    /// Decode a motion notification; `timestamp` is the arrival time.
    fn decode_motion(&self, bytes: &[u8], timestamp: u64) -> Result<MotionReading, CodecError>;

    fn decode_placement(&self, bytes: &[u8]) -> Result<DevicePlacement, CodecError>;
}

/// Default codec.
///
/// ```text
/// Motion frame (28 bytes, all f32 little-endian):
/// [0-3]   : Accel X
/// [4-7]   : Accel Y
/// [8-11]  : Accel Z
/// [12-15] : Gyro X
/// [16-19] : Gyro Y
/// [20-23] : Gyro Z
/// [24-27] : Angle (degrees)
///
/// Placement frame (1 byte):
/// 0 = incorrect, 1 = correct, 2 = unknown
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct LittleEndianCodec;

const MOTION_FIELDS: [&str; 7] = [
    "accel_x", "accel_y", "accel_z", "gyro_x", "gyro_y", "gyro_z", "angle",
];

impl LittleEndianCodec {
    pub fn encode_motion(reading: &MotionReading) -> Vec<u8> {
        [
            reading.accelerometer_x,
            reading.accelerometer_y,
            reading.accelerometer_z,
            reading.gyroscope_x,
            reading.gyroscope_y,
            reading.gyroscope_z,
            reading.angle,
        ]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
    }

    pub fn encode_placement(placement: DevicePlacement) -> Vec<u8> {
        let code = match placement {
            DevicePlacement::Incorrect => 0,
            DevicePlacement::Correct => 1,
            DevicePlacement::Unknown => 2,
        };
        vec![code]
    }
}

impl SensorCodec for LittleEndianCodec {
    fn decode_motion(&self, bytes: &[u8], timestamp: u64) -> Result<MotionReading, CodecError> {
        if bytes.len() != MOTION_FRAME_LEN {
            return Err(CodecError::InvalidLength {
                expected: MOTION_FRAME_LEN,
                actual: bytes.len(),
            });
        }

        let mut values = [0f32; 7];
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if !value.is_finite() {
                return Err(CodecError::NonFinite(MOTION_FIELDS[i]));
            }
            values[i] = value;
        }

        Ok(MotionReading {
            timestamp,
            accelerometer_x: values[0],
            accelerometer_y: values[1],
            accelerometer_z: values[2],
            gyroscope_x: values[3],
            gyroscope_y: values[4],
            gyroscope_z: values[5],
            angle: values[6],
        })
    }

    fn decode_placement(&self, bytes: &[u8]) -> Result<DevicePlacement, CodecError> {
        match bytes {
            [0] => Ok(DevicePlacement::Incorrect),
            [1] => Ok(DevicePlacement::Correct),
            [2] => Ok(DevicePlacement::Unknown),
            [code] => Err(CodecError::UnknownPlacement(*code)),
            _ => Err(CodecError::InvalidLength {
                expected: PLACEMENT_FRAME_LEN,
                actual: bytes.len(),
            }),
        }
    }
}

/// Parse a UUID string from configuration.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid, LinkError> {
    Uuid::parse_str(uuid_str.trim()).map_err(|_| LinkError::InvalidUuid(uuid_str.to_string()))
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Barometric {
    pub pressure: f32,
    pub temperature: f32,
    pub altitude: f32,
}

/// One decoded datagram. Only `datagram::decode` builds these from wire
/// bytes; the zeroed `Default` stands in until the first good datagram.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub message_id: u8,
    // Accelerometer channels (raw sensor units)
    pub acceleration: Vector3,
    // Gyroscope channels
    pub angular_rate: Vector3,
    pub barometric: Barometric,
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Scale applied to telemetry registers unless a field says otherwise.
pub const DEFAULT_SCALE: f32 = 100.0;
/// Scale for the auxiliary rail and for configuration calibration values.
pub const FINE_SCALE: f32 = 1000.0;

/// Number of calibration values following the switch setup register.
pub const CALIBRATION_COUNT: usize = 8;

/// Immutable identity of an inverter endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub slave_address: u8,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16, slave_address: u8) -> Self {
        let ip = ip.into();
        Self {
            id: Self::id_for(&ip),
            name: name.into(),
            ip,
            port,
            slave_address,
        }
    }

    /// One device per address, so the id is a pure function of the IP.
    pub fn id_for(ip: &str) -> String {
        format!("inverter-{}", ip.replace('.', "-"))
    }
}

/// Registry record: identity plus the fields that change over a device's life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub identity: DeviceIdentity,
    pub is_online: bool,
    /// Epoch milliseconds of the last successful exchange, 0 when never seen.
    pub last_seen_ms: i64,
    pub panel_location: String,
    pub firmware_version: String,
}

impl DeviceState {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            is_online: false,
            last_seen_ms: 0,
            panel_location: String::new(),
            firmware_version: String::new(),
        }
    }

    /// Manually entered device, not yet contacted.
    pub fn manual(name: impl Into<String>, ip: impl Into<String>, port: u16, slave_address: u8) -> Self {
        Self::new(DeviceIdentity::new(name, ip, port, slave_address))
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn mark_online(&mut self, now_ms: i64) {
        self.is_online = true;
        self.last_seen_ms = now_ms;
    }

    pub fn mark_offline(&mut self) {
        self.is_online = false;
    }
}

/// One telemetry sample as decoded from the input register block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub timestamp_ms: i64,
    pub solar_voltage: f32,
    pub solar_current: f32,
    pub output_voltage: f32,
    pub output_current: f32,
    pub internal_temp_c: f32,
    pub panel_temp_c: f32,
    pub aux_rail_voltage: f32,
}

impl Reading {
    pub fn solar_power(&self) -> f32 {
        self.solar_voltage * self.solar_current
    }

    pub fn output_power(&self) -> f32 {
        self.output_voltage * self.output_current
    }

    /// Conversion efficiency in percent; 0 when there is no solar input.
    pub fn efficiency_pct(&self) -> f32 {
        let solar = self.solar_power();
        if solar > 0.0 {
            self.output_power() / solar * 100.0
        } else {
            0.0
        }
    }
}

/// Holding register block 0..=8. Values are kept raw; calibration values are
/// fixed-point at [`FINE_SCALE`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    /// Raw mode bitfield.
    pub switch_setup: u16,
    pub solar_voltage_cal: u16,
    pub solar_current_cal: u16,
    pub output_voltage_cal: u16,
    pub output_current_cal: u16,
    pub internal_temp_cal: u16,
    pub panel_temp_cal: u16,
    pub aux_rail_cal: u16,
    pub efficiency_cal: u16,
}

impl DeviceConfiguration {
    pub const REGISTER_COUNT: usize = 1 + CALIBRATION_COUNT;

    /// Registers in wire order, address 0 first.
    pub fn to_registers(&self) -> [u16; Self::REGISTER_COUNT] {
        [
            self.switch_setup,
            self.solar_voltage_cal,
            self.solar_current_cal,
            self.output_voltage_cal,
            self.output_current_cal,
            self.internal_temp_cal,
            self.panel_temp_cal,
            self.aux_rail_cal,
            self.efficiency_cal,
        ]
    }

    /// Returns `None` unless exactly [`Self::REGISTER_COUNT`] registers are given.
    pub fn from_registers(registers: &[u16]) -> Option<Self> {
        match *registers {
            [switch_setup, solar_voltage_cal, solar_current_cal, output_voltage_cal, output_current_cal, internal_temp_cal, panel_temp_cal, aux_rail_cal, efficiency_cal] => {
                Some(Self {
                    switch_setup,
                    solar_voltage_cal,
                    solar_current_cal,
                    output_voltage_cal,
                    output_current_cal,
                    internal_temp_cal,
                    panel_temp_cal,
                    aux_rail_cal,
                    efficiency_cal,
                })
            }
            _ => None,
        }
    }

    /// Scaled calibration value `index` (0-based, excluding the switch setup).
    pub fn calibration(&self, index: usize) -> Option<f32> {
        if index >= CALIBRATION_COUNT {
            return None;
        }
        Some(f32::from(self.to_registers()[index + 1]) / FINE_SCALE)
    }

    /// Stores a calibration value, truncating to the fixed-point grid.
    pub fn set_calibration(&mut self, index: usize, value: f32) -> bool {
        let raw = (value * FINE_SCALE) as u16;
        let slot = match index {
            0 => &mut self.solar_voltage_cal,
            1 => &mut self.solar_current_cal,
            2 => &mut self.output_voltage_cal,
            3 => &mut self.output_current_cal,
            4 => &mut self.internal_temp_cal,
            5 => &mut self.panel_temp_cal,
            6 => &mut self.aux_rail_cal,
            7 => &mut self.efficiency_cal,
            _ => return false,
        };
        *slot = raw;
        true
    }
}

/// Cloud synchronisation target for fresh readings.
#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn sync_reading(&self, reading: &Reading) -> anyhow::Result<()>;
}

/// Historical range queries over stored readings.
#[async_trait]
pub trait ReadingHistory: Send + Sync {
    /// Readings for `device_id` with `start_ms <= timestamp_ms <= end_ms`, oldest first.
    async fn query_range(&self, device_id: &str, start_ms: i64, end_ms: i64) -> anyhow::Result<Vec<Reading>>;
}

/// Sink and history that store nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

#[async_trait]
impl ReadingSink for Discard {
    async fn sync_reading(&self, _reading: &Reading) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ReadingHistory for Discard {
    async fn query_range(&self, _device_id: &str, _start_ms: i64, _end_ms: i64) -> anyhow::Result<Vec<Reading>> {
        Ok(Vec::new())
    }
}

/// Milliseconds since the Unix epoch.
pub fn unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

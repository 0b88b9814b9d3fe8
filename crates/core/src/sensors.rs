//! Sensor taxonomy, request merging, and the sensor request manager.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::event::{EventType, InstanceId};
use crate::multiplexer::{Request, RequestMultiplexer};
use crate::time::Nanoseconds;

/// The sensors a hub can expose, including calibrated/uncalibrated variants
/// for the three motion sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SensorType {
    Unknown = 0,
    Accelerometer = 1,
    InstantMotion = 2,
    StationaryDetect = 3,
    Gyroscope = 4,
    GeomagneticField = 5,
    Pressure = 6,
    Light = 7,
    Proximity = 8,
    UncalibratedAccelerometer = 9,
    UncalibratedGyroscope = 10,
    UncalibratedGeomagneticField = 11,
}

impl SensorType {
    pub fn name(self) -> &'static str {
        match self {
            SensorType::Unknown => "Unknown",
            SensorType::Accelerometer => "Accelerometer",
            SensorType::InstantMotion => "Instant Motion",
            SensorType::StationaryDetect => "Stationary Detect",
            SensorType::Gyroscope => "Gyroscope",
            SensorType::GeomagneticField => "Geomagnetic Field",
            SensorType::Pressure => "Pressure",
            SensorType::Light => "Light",
            SensorType::Proximity => "Proximity",
            SensorType::UncalibratedAccelerometer => "Uncalibrated Accelerometer",
            SensorType::UncalibratedGyroscope => "Uncalibrated Gyroscope",
            SensorType::UncalibratedGeomagneticField => "Uncalibrated Geomagnetic Field",
        }
    }

    /// The broadcast event type carrying samples of this sensor, or `None`
    /// for `Unknown`.
    pub fn sample_event_type(self) -> Option<EventType> {
        if self == SensorType::Unknown {
            return None;
        }
        Some(EventType(EventType::SENSOR_DATA_BASE.0 + self as u16))
    }
}

/// How a client wants a sensor driven.
///
/// Active modes may turn the sensor on; passive modes only piggyback on an
/// already-active sensor. One-shot modes auto-disable after the first
/// sample. The variant order is the merge priority.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SensorMode {
    #[default]
    Off,
    PassiveOneShot,
    PassiveContinuous,
    ActiveOneShot,
    ActiveContinuous,
}

impl SensorMode {
    pub fn is_active(self) -> bool {
        matches!(self, SensorMode::ActiveOneShot | SensorMode::ActiveContinuous)
    }

    pub fn is_one_shot(self) -> bool {
        matches!(self, SensorMode::PassiveOneShot | SensorMode::ActiveOneShot)
    }
}

/// One client's demand on a sensor.
///
/// The default request (`Off`, default interval, default latency) is the
/// merge identity: the sentinels are the all-ones value, so a plain `min`
/// ignores them, and `LATENCY_ASAP` (zero) is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorRequest {
    pub mode: SensorMode,
    pub interval: Nanoseconds,
    pub latency: Nanoseconds,
}

impl SensorRequest {
    pub const INTERVAL_DEFAULT: Nanoseconds = Nanoseconds::MAX;
    pub const LATENCY_ASAP: Nanoseconds = Nanoseconds::ZERO;
    pub const LATENCY_DEFAULT: Nanoseconds = Nanoseconds::MAX;

    pub fn new(mode: SensorMode, interval: Nanoseconds, latency: Nanoseconds) -> Self {
        Self {
            mode,
            interval,
            latency,
        }
    }
}

impl Default for SensorRequest {
    fn default() -> Self {
        Self {
            mode: SensorMode::Off,
            interval: Self::INTERVAL_DEFAULT,
            latency: Self::LATENCY_DEFAULT,
        }
    }
}

impl Request for SensorRequest {
    fn is_equivalent_to(&self, other: &Self) -> bool {
        self == other
    }

    fn merge(&self, other: &Self) -> Self {
        Self {
            mode: self.mode.max(other.mode),
            interval: self.interval.min(other.interval),
            latency: self.latency.min(other.latency),
        }
    }
}

/// One sensor sample as produced by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub sensor_type: SensorType,
    pub timestamp: Nanoseconds,
    pub values: Vec<f32>,
}

/// Capability set of the platform sensor backend. The runtime does not
/// depend on any specific vendor RPC; indications flow back through the hub
/// handle as posted sample events.
pub trait PlatformSensorDriver: Send {
    fn list_sensors(&mut self) -> Vec<SensorType>;

    /// Programs the merged request into the hardware. Returns false when the
    /// platform rejects it.
    fn set_request(&mut self, sensor: SensorType, request: &SensorRequest) -> bool;
}

/// Driver stub for hubs without a sensor backend: no sensors, accepts
/// nothing but the identity request.
#[derive(Debug, Default)]
pub struct NullSensorDriver;

impl PlatformSensorDriver for NullSensorDriver {
    fn list_sensors(&mut self) -> Vec<SensorType> {
        Vec::new()
    }

    fn set_request(&mut self, _sensor: SensorType, _request: &SensorRequest) -> bool {
        false
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("sensor {} not provided by the platform", .0.name())]
    UnknownSensor(SensorType),
    #[error("platform driver rejected the request")]
    DriverRejected,
}

enum Revert {
    Reinsert(InstanceId, SensorRequest),
    Restore(usize, SensorRequest),
    Pop,
}

struct SensorEntry {
    multiplexer: RequestMultiplexer<SensorRequest>,
    // clients[i] owns multiplexer.requests()[i]
    clients: Vec<InstanceId>,
}

impl SensorEntry {
    fn new() -> Self {
        Self {
            multiplexer: RequestMultiplexer::new(),
            clients: Vec::new(),
        }
    }
}

/// Per-sensor request multiplexing against the platform driver.
///
/// Single-threaded by design: callers enter on the loop thread via nanoapp
/// contexts or deferred system events.
pub struct SensorRequestManager {
    driver: Box<dyn PlatformSensorDriver>,
    sensors: HashMap<SensorType, SensorEntry>,
}

impl SensorRequestManager {
    pub fn new(mut driver: Box<dyn PlatformSensorDriver>) -> Self {
        let sensors = driver
            .list_sensors()
            .into_iter()
            .map(|sensor| (sensor, SensorEntry::new()))
            .collect();
        Self { driver, sensors }
    }

    pub fn has_sensor(&self, sensor: SensorType) -> bool {
        self.sensors.contains_key(&sensor)
    }

    /// The merged request currently programmed for `sensor`.
    pub fn maximal_for(&self, sensor: SensorType) -> Option<&SensorRequest> {
        self.sensors
            .get(&sensor)
            .map(|entry| entry.multiplexer.current_maximal())
    }

    /// Applies one client's request: update, add, or (for `Off`) remove the
    /// client's slot, then reprogram the driver if the maximal changed. A
    /// driver failure reverts the edit.
    pub fn set_request(
        &mut self,
        instance_id: InstanceId,
        sensor: SensorType,
        request: SensorRequest,
    ) -> Result<(), SensorError> {
        let entry = self
            .sensors
            .get_mut(&sensor)
            .ok_or(SensorError::UnknownSensor(sensor))?;
        let slot = entry.clients.iter().position(|id| *id == instance_id);
        let turn_off = request.mode == SensorMode::Off;

        let (changed, revert) = match (slot, turn_off) {
            (Some(index), true) => {
                let previous = entry.multiplexer.requests()[index];
                let changed = entry.multiplexer.remove(index);
                entry.clients.remove(index);
                (changed, Revert::Reinsert(instance_id, previous))
            }
            (Some(index), false) => {
                let previous = entry.multiplexer.requests()[index];
                let changed = entry.multiplexer.update(index, request);
                (changed, Revert::Restore(index, previous))
            }
            (None, true) => return Ok(()),
            (None, false) => {
                let (_, changed) = entry.multiplexer.add(request);
                entry.clients.push(instance_id);
                (changed, Revert::Pop)
            }
        };

        if changed && !self.driver.set_request(sensor, entry_maximal(&self.sensors, sensor)) {
            let entry = self.sensors.get_mut(&sensor).expect("entry just edited");
            match revert {
                Revert::Reinsert(id, previous) => {
                    entry.multiplexer.add(previous);
                    entry.clients.push(id);
                }
                Revert::Restore(index, previous) => {
                    entry.multiplexer.update(index, previous);
                }
                Revert::Pop => {
                    let last = entry.multiplexer.requests().len() - 1;
                    entry.multiplexer.remove(last);
                    entry.clients.pop();
                }
            }
            warn!(sensor = sensor.name(), "platform rejected sensor request");
            return Err(SensorError::DriverRejected);
        }
        Ok(())
    }

    /// Drops every request held by an unloading nanoapp, reprogramming any
    /// sensor whose maximal changes.
    pub fn remove_all_requests(&mut self, instance_id: InstanceId) {
        let affected: Vec<SensorType> = self
            .sensors
            .iter()
            .filter(|(_, entry)| entry.clients.contains(&instance_id))
            .map(|(sensor, _)| *sensor)
            .collect();
        for sensor in affected {
            let entry = self.sensors.get_mut(&sensor).expect("listed above");
            if let Some(index) = entry.clients.iter().position(|id| *id == instance_id) {
                let changed = entry.multiplexer.remove(index);
                entry.clients.remove(index);
                if changed {
                    let maximal = *entry.multiplexer.current_maximal();
                    if !self.driver.set_request(sensor, &maximal) {
                        warn!(
                            sensor = sensor.name(),
                            "driver rejected reconfigure after client removal"
                        );
                    }
                }
            }
        }
    }

    /// One-shot requests auto-disable after their first sample: clears every
    /// one-shot slot for `sensor` and reprograms the driver if needed.
    pub fn handle_one_shot_fired(&mut self, sensor: SensorType) {
        let Some(entry) = self.sensors.get_mut(&sensor) else {
            return;
        };
        let before = *entry.multiplexer.current_maximal();
        if !before.mode.is_one_shot() {
            return;
        }

        let mut index = entry.multiplexer.requests().len();
        while index > 0 {
            index -= 1;
            if entry.multiplexer.requests()[index].mode.is_one_shot() {
                entry.multiplexer.remove(index);
                entry.clients.remove(index);
            }
        }

        let after = *entry.multiplexer.current_maximal();
        if !before.is_equivalent_to(&after) {
            debug!(sensor = sensor.name(), "one-shot complete, reconfiguring");
            if !self.driver.set_request(sensor, &after) {
                warn!(sensor = sensor.name(), "driver rejected one-shot teardown");
            }
        }
    }
}

fn entry_maximal(
    sensors: &HashMap<SensorType, SensorEntry>,
    sensor: SensorType,
) -> &SensorRequest {
    sensors
        .get(&sensor)
        .expect("caller verified the entry exists")
        .multiplexer
        .current_maximal()
}

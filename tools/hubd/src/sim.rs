//! Simulated platform backends for running the hub on a development host.

use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use ctxhub_core::{
    HubHandle, PlatformSensorDriver, PlatformWifi, SensorRequest, SensorType,
};

/// Accepts every request and logs what real hardware would be asked to do.
#[derive(Debug, Default)]
pub struct SimSensorDriver;

impl PlatformSensorDriver for SimSensorDriver {
    fn list_sensors(&mut self) -> Vec<SensorType> {
        vec![
            SensorType::Accelerometer,
            SensorType::Gyroscope,
            SensorType::GeomagneticField,
            SensorType::Pressure,
            SensorType::Light,
            SensorType::Proximity,
        ]
    }

    fn set_request(&mut self, sensor: SensorType, request: &SensorRequest) -> bool {
        info!(
            sensor = sensor.name(),
            mode = ?request.mode,
            interval = %request.interval,
            latency = %request.latency,
            "sensor reconfigured"
        );
        true
    }
}

const COMPLETION_DELAY: Duration = Duration::from_millis(50);

/// Accepts scan-monitor transitions and reports each completion a little
/// later from a worker thread, the way asynchronous firmware does.
pub struct SimWifi {
    handle: Arc<OnceLock<HubHandle>>,
}

impl SimWifi {
    pub fn new(handle: Arc<OnceLock<HubHandle>>) -> Self {
        Self { handle }
    }
}

impl PlatformWifi for SimWifi {
    fn configure_scan_monitor(&mut self, enable: bool) -> bool {
        debug!(enable, "scan monitor transition accepted");
        let handle = Arc::clone(&self.handle);
        thread::spawn(move || {
            thread::sleep(COMPLETION_DELAY);
            match handle.get() {
                Some(handle) => {
                    if handle.handle_scan_monitor_state_change(enable, 0).is_err() {
                        warn!("could not deliver scan monitor completion");
                    }
                }
                None => warn!("scan monitor completion before hub was wired"),
            }
        });
        true
    }
}

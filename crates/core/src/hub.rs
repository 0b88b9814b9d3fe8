//! Runtime assembly: builder, service wiring, and the cross-thread handle.
//!
//! There is no process-wide state: a [`Hub`] owns its event loop and
//! services, and everything that needs to reach the runtime from another
//! thread goes through an explicit [`HubHandle`].

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::event::{EventPayload, EventType, FreeCallback, InstanceId, PostError};
use crate::event_loop::{EventLoop, EventLoopHandle, SharedState};
use crate::host::{HostCommsManager, HostLink, HostMessage};
use crate::nanoapp::NanoappInfo;
use crate::sensors::{
    NullSensorDriver, PlatformSensorDriver, SensorRequestManager, SensorSample, SensorType,
};
use crate::timer::TimerPool;
use crate::wifi::{NullWifi, PlatformWifi, WifiRequestManager};

/// Identity and capability figures served in hub-info responses.
#[derive(Debug, Clone)]
pub struct HubInfo {
    pub name: String,
    pub vendor: String,
    pub toolchain: String,
    pub legacy_platform_version: u32,
    pub legacy_toolchain_version: u32,
    pub peak_mips: f32,
    pub stopped_power_mw: f32,
    pub sleep_power_mw: f32,
    pub peak_power_mw: f32,
    pub max_message_len: u32,
    pub platform_id: u64,
    pub version: u32,
}

impl Default for HubInfo {
    fn default() -> Self {
        Self {
            name: "ctxhub".into(),
            vendor: "ctxhub project".into(),
            toolchain: "rustc".into(),
            legacy_platform_version: 0,
            legacy_toolchain_version: 0,
            peak_mips: 350.0,
            stopped_power_mw: 0.0,
            sleep_power_mw: 1.0,
            peak_power_mw: 15.0,
            max_message_len: 4000,
            platform_id: 0x476f_6f67_6c00_0001,
            version: 0x0001_0000,
        }
    }
}

/// Deferred runtime work, always carried by a system-targeted event so it
/// executes on the loop thread.
#[derive(Debug, Clone)]
pub(crate) enum SystemOp {
    WifiScanMonitorStateChange { enabled: bool, error_code: u8 },
    SensorSamplePosted { sensor: SensorType },
    RetryPendingHostMessages,
}

/// The loop-thread-owned service managers.
pub(crate) struct Services {
    pub(crate) handle: EventLoopHandle,
    pub(crate) sensors: SensorRequestManager,
    pub(crate) wifi: WifiRequestManager,
    pub(crate) timers: TimerPool,
    pub(crate) host: HostCommsManager,
}

impl Services {
    pub(crate) fn handle_op(&mut self, op: SystemOp) {
        match op {
            SystemOp::WifiScanMonitorStateChange {
                enabled,
                error_code,
            } => {
                let Services { wifi, handle, .. } = self;
                wifi.handle_scan_monitor_state_change_sync(enabled, error_code, handle);
            }
            SystemOp::SensorSamplePosted { sensor } => {
                self.sensors.handle_one_shot_fired(sensor);
            }
            SystemOp::RetryPendingHostMessages => {
                self.host.retry_pending();
            }
        }
    }
}

/// Configures and wires a [`Hub`].
pub struct HubBuilder {
    info: HubInfo,
    event_pool_capacity: usize,
    nanoapp_queue_capacity: usize,
    max_nanoapps: usize,
    sensor_driver: Option<Box<dyn PlatformSensorDriver>>,
    wifi: Option<Box<dyn PlatformWifi>>,
    host_link: Option<Box<dyn HostLink>>,
}

impl HubBuilder {
    pub fn new() -> Self {
        Self {
            info: HubInfo::default(),
            event_pool_capacity: 96,
            nanoapp_queue_capacity: 16,
            max_nanoapps: 16,
            sensor_driver: None,
            wifi: None,
            host_link: None,
        }
    }

    pub fn with_info(mut self, info: HubInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_event_pool_capacity(mut self, capacity: usize) -> Self {
        self.event_pool_capacity = capacity;
        self
    }

    pub fn with_nanoapp_queue_capacity(mut self, capacity: usize) -> Self {
        self.nanoapp_queue_capacity = capacity;
        self
    }

    pub fn with_max_nanoapps(mut self, max: usize) -> Self {
        self.max_nanoapps = max;
        self
    }

    pub fn with_sensor_driver(mut self, driver: Box<dyn PlatformSensorDriver>) -> Self {
        self.sensor_driver = Some(driver);
        self
    }

    pub fn with_wifi(mut self, wifi: Box<dyn PlatformWifi>) -> Self {
        self.wifi = Some(wifi);
        self
    }

    pub fn with_host_link(mut self, link: Box<dyn HostLink>) -> Self {
        self.host_link = Some(link);
        self
    }

    pub fn build(self) -> Hub {
        let (shared, rx) = SharedState::new(self.event_pool_capacity);
        let handle = EventLoopHandle::from_shared(Arc::clone(&shared));
        let timers = TimerPool::new();
        let services = Services {
            handle: handle.clone(),
            sensors: SensorRequestManager::new(
                self.sensor_driver
                    .unwrap_or_else(|| Box::new(NullSensorDriver)),
            ),
            wifi: WifiRequestManager::new(self.wifi.unwrap_or_else(|| Box::new(NullWifi))),
            timers: timers.clone(),
            host: HostCommsManager::new(self.host_link),
        };
        let event_loop = EventLoop::new(
            shared,
            rx,
            services,
            self.nanoapp_queue_capacity,
            self.max_nanoapps,
        );
        Hub {
            event_loop,
            timers,
            info: Arc::new(self.info),
        }
    }
}

impl Default for HubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An assembled context hub.
pub struct Hub {
    event_loop: EventLoop,
    timers: TimerPool,
    info: Arc<HubInfo>,
}

impl Hub {
    pub fn builder() -> HubBuilder {
        HubBuilder::new()
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle {
            loop_handle: self.event_loop.handle(),
            timers: self.timers.clone(),
            info: Arc::clone(&self.info),
        }
    }

    /// Loop-thread access for loading apps and (in single-threaded
    /// embeddings) stepping the loop.
    pub fn event_loop_mut(&mut self) -> &mut EventLoop {
        &mut self.event_loop
    }

    pub fn info(&self) -> &HubInfo {
        &self.info
    }

    /// Runs the event loop on the current thread with the timer arming
    /// thread alongside; returns after `stop()` once the shutdown drain
    /// completes.
    pub fn run(&mut self) {
        let timer_thread = self.timers.spawn_arming_thread(self.event_loop.handle());
        self.event_loop.run();
        self.timers.shutdown();
        if timer_thread.join().is_err() {
            error!("timer arming thread panicked");
        }
    }
}

/// Cloneable, thread-safe handle onto a hub: the injection point for
/// platform completions and the host daemon.
#[derive(Clone)]
pub struct HubHandle {
    loop_handle: EventLoopHandle,
    timers: TimerPool,
    info: Arc<HubInfo>,
}

impl HubHandle {
    pub fn hub_info(&self) -> &HubInfo {
        &self.info
    }

    pub fn event_loop(&self) -> &EventLoopHandle {
        &self.loop_handle
    }

    pub fn stop(&self) {
        self.loop_handle.stop();
    }

    /// Posts a system-sent event.
    pub fn post_event(
        &self,
        event_type: EventType,
        payload: EventPayload,
        free_callback: Option<FreeCallback>,
        target: InstanceId,
    ) -> Result<(), PostError> {
        self.loop_handle
            .post_event(event_type, payload, free_callback, InstanceId::SYSTEM, target)
    }

    /// Packages a platform sensor sample as a broadcast event; the sample
    /// buffer is released when the last subscriber is done with it. One-shot
    /// teardown is deferred behind the sample so subscribers observe it
    /// first.
    pub fn post_sensor_sample(&self, sample: SensorSample) -> Result<(), PostError> {
        let sensor = sample.sensor_type;
        let Some(event_type) = sensor.sample_event_type() else {
            debug_assert!(false, "sample for an unknown sensor type");
            error!("discarding sample for an unknown sensor type");
            return Ok(());
        };
        self.loop_handle.post_event(
            event_type,
            Box::new(sample),
            None,
            InstanceId::SYSTEM,
            InstanceId::BROADCAST,
        )?;
        self.defer(SystemOp::SensorSamplePosted { sensor })
    }

    /// Platform completion for an asynchronous scan-monitor transition.
    /// Safe from any thread; the state machine runs on the loop thread.
    pub fn handle_scan_monitor_state_change(
        &self,
        enabled: bool,
        error_code: u8,
    ) -> Result<(), PostError> {
        self.defer(SystemOp::WifiScanMonitorStateChange {
            enabled,
            error_code,
        })
    }

    /// Routes a host client's message to the nanoapp owning its app id.
    pub fn send_host_message_to_nanoapp(&self, message: HostMessage) -> bool {
        match self.loop_handle.find_nanoapp_by_app_id(message.app_id) {
            Some(info) => {
                debug!(app_id = %message.app_id, "routing host message");
                self.loop_handle
                    .post_event(
                        EventType::HOST_MESSAGE,
                        Box::new(message),
                        None,
                        InstanceId::SYSTEM,
                        info.instance_id,
                    )
                    .is_ok()
            }
            None => {
                warn!(app_id = %message.app_id, "host message for unknown app");
                false
            }
        }
    }

    /// Tells the runtime the host link can accept traffic again.
    pub fn host_link_ready(&self) {
        if self.defer(SystemOp::RetryPendingHostMessages).is_err() {
            warn!("could not schedule host message retry");
        }
    }

    pub fn find_nanoapp_by_app_id(&self, app_id: crate::event::AppId) -> Option<NanoappInfo> {
        self.loop_handle.find_nanoapp_by_app_id(app_id)
    }

    pub fn find_nanoapp_by_instance_id(&self, instance_id: InstanceId) -> Option<NanoappInfo> {
        self.loop_handle.find_nanoapp_by_instance_id(instance_id)
    }

    pub fn for_each_nanoapp(&self, callback: impl FnMut(&NanoappInfo)) {
        self.loop_handle.for_each_nanoapp(callback)
    }

    /// Snapshot of the live nanoapps, for the nanoapp-list response.
    pub fn nanoapp_entries(&self) -> Vec<NanoappInfo> {
        let mut entries = Vec::new();
        self.loop_handle
            .for_each_nanoapp(|info| entries.push(info.clone()));
        entries
    }

    pub fn timers(&self) -> &TimerPool {
        &self.timers
    }

    fn defer(&self, op: SystemOp) -> Result<(), PostError> {
        self.loop_handle.post_event(
            EventType::SYSTEM_CALLBACK,
            Box::new(op),
            None,
            InstanceId::SYSTEM,
            InstanceId::SYSTEM,
        )
    }
}

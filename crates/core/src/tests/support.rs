//! Shared probes and fakes for kernel tests.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::event::{AppId, EventType, InstanceId};
use crate::event_loop::NanoappContext;
use crate::nanoapp::Nanoapp;
use crate::sensors::{PlatformSensorDriver, SensorRequest, SensorType};
use crate::wifi::PlatformWifi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Observed {
    Started(InstanceId),
    Event {
        instance_id: InstanceId,
        sender: InstanceId,
        event_type: EventType,
    },
    Ended(InstanceId),
}

pub(crate) type Log = Arc<Mutex<Vec<Observed>>>;

pub(crate) fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) fn events_for(log: &Log, instance_id: InstanceId) -> Vec<EventType> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|entry| match entry {
            Observed::Event {
                instance_id: id,
                event_type,
                ..
            } if *id == instance_id => Some(*event_type),
            _ => None,
        })
        .collect()
}

/// Nanoapp that records its lifecycle and every delivered event.
pub(crate) struct Recorder {
    app_id: AppId,
    log: Log,
    subscribe_to: Vec<EventType>,
    start_ok: bool,
    system: bool,
}

impl Recorder {
    pub(crate) fn new(app_id: u64, log: Log) -> Self {
        Self {
            app_id: AppId(app_id),
            log,
            subscribe_to: Vec::new(),
            start_ok: true,
            system: false,
        }
    }

    pub(crate) fn subscribed(mut self, event_type: EventType) -> Self {
        self.subscribe_to.push(event_type);
        self
    }

    pub(crate) fn failing_start(mut self) -> Self {
        self.start_ok = false;
        self
    }

    pub(crate) fn system(mut self) -> Self {
        self.system = true;
        self
    }
}

impl Nanoapp for Recorder {
    fn app_id(&self) -> AppId {
        self.app_id
    }

    fn is_system(&self) -> bool {
        self.system
    }

    fn start(&mut self, ctx: &mut NanoappContext<'_>) -> bool {
        for event_type in &self.subscribe_to {
            ctx.subscribe(*event_type);
        }
        self.log
            .lock()
            .unwrap()
            .push(Observed::Started(ctx.instance_id()));
        self.start_ok
    }

    fn handle_event(
        &mut self,
        ctx: &mut NanoappContext<'_>,
        sender: InstanceId,
        event_type: EventType,
        _payload: &(dyn Any + Send + Sync),
    ) {
        self.log.lock().unwrap().push(Observed::Event {
            instance_id: ctx.instance_id(),
            sender,
            event_type,
        });
    }

    fn end(&mut self, ctx: &mut NanoappContext<'_>) {
        self.log
            .lock()
            .unwrap()
            .push(Observed::Ended(ctx.instance_id()));
    }
}

type EventHook =
    Box<dyn FnMut(&mut NanoappContext<'_>, EventType, &(dyn Any + Send + Sync)) + Send>;
type EndHook = Box<dyn FnMut(&mut NanoappContext<'_>) + Send>;

/// Nanoapp whose event handling is a closure supplied by the test.
pub(crate) struct Scripted {
    app_id: AppId,
    on_event: EventHook,
    on_end: Option<EndHook>,
}

impl Scripted {
    pub(crate) fn new(
        app_id: u64,
        on_event: impl FnMut(&mut NanoappContext<'_>, EventType, &(dyn Any + Send + Sync)) + Send + 'static,
    ) -> Self {
        Self {
            app_id: AppId(app_id),
            on_event: Box::new(on_event),
            on_end: None,
        }
    }

    pub(crate) fn with_end(
        mut self,
        on_end: impl FnMut(&mut NanoappContext<'_>) + Send + 'static,
    ) -> Self {
        self.on_end = Some(Box::new(on_end));
        self
    }
}

impl Nanoapp for Scripted {
    fn app_id(&self) -> AppId {
        self.app_id
    }

    fn start(&mut self, _ctx: &mut NanoappContext<'_>) -> bool {
        true
    }

    fn handle_event(
        &mut self,
        ctx: &mut NanoappContext<'_>,
        _sender: InstanceId,
        event_type: EventType,
        payload: &(dyn Any + Send + Sync),
    ) {
        (self.on_event)(ctx, event_type, payload);
    }

    fn end(&mut self, ctx: &mut NanoappContext<'_>) {
        if let Some(on_end) = &mut self.on_end {
            on_end(ctx);
        }
    }
}

/// Sensor driver that records every reconfiguration.
pub(crate) struct FakeSensorDriver {
    sensors: Vec<SensorType>,
    pub(crate) calls: Arc<Mutex<Vec<(SensorType, SensorRequest)>>>,
    accept: bool,
}

impl FakeSensorDriver {
    pub(crate) fn new(sensors: Vec<SensorType>) -> Self {
        Self {
            sensors,
            calls: Arc::new(Mutex::new(Vec::new())),
            accept: true,
        }
    }

    pub(crate) fn rejecting(mut self) -> Self {
        self.accept = false;
        self
    }

    pub(crate) fn call_log(&self) -> Arc<Mutex<Vec<(SensorType, SensorRequest)>>> {
        Arc::clone(&self.calls)
    }
}

impl PlatformSensorDriver for FakeSensorDriver {
    fn list_sensors(&mut self) -> Vec<SensorType> {
        self.sensors.clone()
    }

    fn set_request(&mut self, sensor: SensorType, request: &SensorRequest) -> bool {
        self.calls.lock().unwrap().push((sensor, *request));
        self.accept
    }
}

/// Wifi backend that records transition requests.
pub(crate) struct FakeWifi {
    pub(crate) calls: Arc<Mutex<Vec<bool>>>,
    accept: bool,
}

impl FakeWifi {
    pub(crate) fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            accept: true,
        }
    }

    pub(crate) fn rejecting(mut self) -> Self {
        self.accept = false;
        self
    }

    pub(crate) fn call_log(&self) -> Arc<Mutex<Vec<bool>>> {
        Arc::clone(&self.calls)
    }
}

impl PlatformWifi for FakeWifi {
    fn configure_scan_monitor(&mut self, enable: bool) -> bool {
        self.calls.lock().unwrap().push(enable);
        self.accept
    }
}

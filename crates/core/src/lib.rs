#![doc = r#"# ctxhub-core

The runtime kernel of an embedded context hub: a small executor that hosts
sandboxed *nanoapps* on a low-power coprocessor and mediates their access to
sensors, radios, timers, and the host processor.

## Module Overview
- [`event`]       – Event record, instance/app identifiers, bounded event pool.
- [`nanoapp`]     – The `Nanoapp` trait and per-app runtime bookkeeping.
- [`event_loop`]  – Two-stage event distribution on a single dedicated thread.
- [`multiplexer`] – Generic request merging with a cached maximal.
- [`sensors`]     – Sensor taxonomy, request merging, platform driver boundary.
- [`wifi`]        – Scan-monitor state machine with pending-transition queue.
- [`timer`]       – Deadline heap with a dedicated arming thread.
- [`host`]        – Host-bound message bookkeeping (runtime side of the bridge).
- [`hub`]         – Runtime assembly: builder, service wiring, cross-thread handle.

The crate keeps the platform boundary narrow: sensors, wifi, and the host link
are traits injected at construction, so the kernel runs identically under a
real transport, a simulator, or a test double.
"#]

pub mod event;
pub mod event_loop;
pub mod host;
pub mod hub;
pub mod multiplexer;
pub mod nanoapp;
pub mod sensors;
pub mod timer;
pub mod wifi;

pub use event::{
    AppId, Event, EventPayload, EventPool, EventType, FreeCallback, InstanceId, PostError,
};
pub use event_loop::{ApiError, EventLoop, EventLoopHandle, NanoappContext, StartNanoappError};
pub use host::{HostLink, HostMessage};
pub use hub::{Hub, HubBuilder, HubHandle, HubInfo};
pub use multiplexer::{Request, RequestMultiplexer};
pub use nanoapp::{Nanoapp, NanoappInfo};
pub use sensors::{
    NullSensorDriver, PlatformSensorDriver, SensorError, SensorMode, SensorRequest,
    SensorRequestManager, SensorSample, SensorType,
};
pub use timer::{TimerEvent, TimerId, TimerPool};
pub use wifi::{AsyncResult, NullWifi, PlatformWifi, WifiRequestManager, ERROR_GENERIC, ERROR_NONE};

pub mod time;
pub use time::Nanoseconds;

#[cfg(test)]
mod tests;

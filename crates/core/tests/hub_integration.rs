//! End-to-end scenarios against the public hub API.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ctxhub_core::{
    AppId, EventType, Hub, HostLink, HostMessage, InstanceId, Nanoapp, NanoappContext,
    PlatformSensorDriver, SensorMode, SensorRequest, SensorSample, SensorType, Nanoseconds,
};

const CONFIGURE_ACCEL: EventType = EventType(0x0400);
const PING: EventType = EventType(0x0401);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Sample(InstanceId),
    HostMessage(InstanceId, Vec<u8>),
    Ping(InstanceId),
}

type SeenLog = Arc<Mutex<Vec<Seen>>>;

struct TestApp {
    app_id: AppId,
    seen: SeenLog,
}

impl TestApp {
    fn new(app_id: u64, seen: SeenLog) -> Self {
        Self {
            app_id: AppId(app_id),
            seen,
        }
    }
}

impl Nanoapp for TestApp {
    fn app_id(&self) -> AppId {
        self.app_id
    }

    fn start(&mut self, ctx: &mut NanoappContext<'_>) -> bool {
        ctx.subscribe(PING);
        true
    }

    fn handle_event(
        &mut self,
        ctx: &mut NanoappContext<'_>,
        _sender: InstanceId,
        event_type: EventType,
        payload: &(dyn Any + Send + Sync),
    ) {
        if event_type == CONFIGURE_ACCEL {
            ctx.configure_sensor(
                SensorType::Accelerometer,
                SensorRequest::new(
                    SensorMode::ActiveOneShot,
                    Nanoseconds::from_millis(20),
                    SensorRequest::LATENCY_ASAP,
                ),
            )
            .unwrap();
        } else if event_type == PING {
            self.seen.lock().unwrap().push(Seen::Ping(ctx.instance_id()));
            ctx.send_message_to_host(0xFFFE, 7, vec![0xAB]).unwrap();
        } else if event_type == EventType::HOST_MESSAGE {
            let message = payload.downcast_ref::<HostMessage>().unwrap();
            self.seen
                .lock()
                .unwrap()
                .push(Seen::HostMessage(ctx.instance_id(), message.payload.clone()));
        } else if Some(event_type) == SensorType::Accelerometer.sample_event_type() {
            let sample = payload.downcast_ref::<SensorSample>().unwrap();
            assert_eq!(sample.sensor_type, SensorType::Accelerometer);
            self.seen.lock().unwrap().push(Seen::Sample(ctx.instance_id()));
        }
    }

    fn end(&mut self, _ctx: &mut NanoappContext<'_>) {}
}

struct RecordingDriver {
    calls: Arc<Mutex<Vec<(SensorType, SensorRequest)>>>,
}

impl PlatformSensorDriver for RecordingDriver {
    fn list_sensors(&mut self) -> Vec<SensorType> {
        vec![SensorType::Accelerometer]
    }

    fn set_request(&mut self, sensor: SensorType, request: &SensorRequest) -> bool {
        self.calls.lock().unwrap().push((sensor, *request));
        true
    }
}

struct RecordingLink {
    sent: Arc<Mutex<Vec<HostMessage>>>,
}

impl HostLink for RecordingLink {
    fn send(&mut self, message: &HostMessage) -> bool {
        self.sent.lock().unwrap().push(message.clone());
        true
    }
}

#[test]
fn one_shot_sensor_stream_reaches_the_app_then_disables() {
    let seen: SeenLog = Arc::new(Mutex::new(Vec::new()));
    let driver_calls = Arc::new(Mutex::new(Vec::new()));
    let mut hub = Hub::builder()
        .with_sensor_driver(Box::new(RecordingDriver {
            calls: Arc::clone(&driver_calls),
        }))
        .build();
    let handle = hub.handle();

    let app = hub
        .event_loop_mut()
        .start_nanoapp(Box::new(TestApp::new(0x1001, Arc::clone(&seen))))
        .unwrap();
    handle
        .post_event(CONFIGURE_ACCEL, Box::new(()), None, app)
        .unwrap();
    hub.event_loop_mut().run_until_idle();

    {
        let calls = driver_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.mode, SensorMode::ActiveOneShot);
    }

    handle
        .post_sensor_sample(SensorSample {
            sensor_type: SensorType::Accelerometer,
            timestamp: Nanoseconds::from_millis(1),
            values: vec![0.0, 0.0, 9.81],
        })
        .unwrap();
    hub.event_loop_mut().run_until_idle();

    assert_eq!(*seen.lock().unwrap(), vec![Seen::Sample(app)]);
    // The one-shot request cleared itself and the driver saw the teardown.
    let calls = driver_calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1.mode, SensorMode::Off);
}

#[test]
fn nanoapp_messages_cross_the_host_link_both_ways() {
    let seen: SeenLog = Arc::new(Mutex::new(Vec::new()));
    let sent = Arc::new(Mutex::new(Vec::new()));
    let mut hub = Hub::builder()
        .with_host_link(Box::new(RecordingLink {
            sent: Arc::clone(&sent),
        }))
        .build();
    let handle = hub.handle();

    let app = hub
        .event_loop_mut()
        .start_nanoapp(Box::new(TestApp::new(0x2002, Arc::clone(&seen))))
        .unwrap();

    // Host -> nanoapp.
    assert!(handle.send_host_message_to_nanoapp(HostMessage {
        app_id: AppId(0x2002),
        host_endpoint: 0x0001,
        message_type: 7,
        payload: vec![1, 2, 3],
    }));
    assert!(!handle.send_host_message_to_nanoapp(HostMessage {
        app_id: AppId(0xDEAD),
        host_endpoint: 0x0001,
        message_type: 7,
        payload: vec![],
    }));
    hub.event_loop_mut().run_until_idle();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Seen::HostMessage(app, vec![1, 2, 3])]
    );

    // Nanoapp -> host, triggered by a ping.
    handle.post_event(PING, Box::new(()), None, app).unwrap();
    hub.event_loop_mut().run_until_idle();
    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].app_id, AppId(0x2002));
    assert_eq!(sent[0].payload, vec![0xAB]);
}

#[test]
fn hub_runs_on_its_own_thread_until_stopped() {
    let seen: SeenLog = Arc::new(Mutex::new(Vec::new()));
    let mut hub = Hub::builder().build();
    let handle = hub.handle();
    let app = hub
        .event_loop_mut()
        .start_nanoapp(Box::new(TestApp::new(0x3003, Arc::clone(&seen))))
        .unwrap();

    let runner = thread::spawn(move || hub.run());
    handle
        .post_event(PING, Box::new(()), None, InstanceId::BROADCAST)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    handle.stop();
    runner.join().unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&Seen::Ping(app)));
}

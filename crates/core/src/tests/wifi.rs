use std::sync::{Arc, Mutex};

use crate::event::{EventType, InstanceId};
use crate::hub::Hub;
use crate::tests::support::FakeWifi;
use crate::wifi::{AsyncResult, ERROR_GENERIC, ERROR_NONE};
use crate::Nanoapp;
use crate::{AppId, NanoappContext};

const ENABLE_CMD: EventType = EventType(0x0340);
const DISABLE_CMD: EventType = EventType(0x0341);

type Results = Arc<Mutex<Vec<(InstanceId, AsyncResult)>>>;

/// Issues scan-monitor requests on command events and records async results.
struct MonitorApp {
    app_id: AppId,
    cookie: u64,
    results: Results,
}

impl MonitorApp {
    fn new(app_id: u64, cookie: u64, results: Results) -> Self {
        Self {
            app_id: AppId(app_id),
            cookie,
            results,
        }
    }
}

impl Nanoapp for MonitorApp {
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
        payload: &(dyn std::any::Any + Send + Sync),
    ) {
        match event_type {
            ENABLE_CMD => {
                assert!(ctx.configure_scan_monitor(true, self.cookie));
            }
            DISABLE_CMD => {
                assert!(ctx.configure_scan_monitor(false, self.cookie));
            }
            EventType::WIFI_ASYNC_RESULT => {
                let result = payload.downcast_ref::<AsyncResult>().unwrap();
                self.results
                    .lock()
                    .unwrap()
                    .push((ctx.instance_id(), *result));
            }
            _ => {}
        }
    }

    fn end(&mut self, _ctx: &mut NanoappContext<'_>) {}
}

struct Fixture {
    hub: Hub,
    calls: Arc<Mutex<Vec<bool>>>,
    results: Results,
}

fn fixture() -> Fixture {
    let wifi = FakeWifi::new();
    let calls = wifi.call_log();
    Fixture {
        hub: Hub::builder().with_wifi(Box::new(wifi)).build(),
        calls,
        results: Arc::new(Mutex::new(Vec::new())),
    }
}

impl Fixture {
    fn start_app(&mut self, app_id: u64, cookie: u64) -> InstanceId {
        let app = MonitorApp::new(app_id, cookie, Arc::clone(&self.results));
        self.hub.event_loop_mut().start_nanoapp(Box::new(app)).unwrap()
    }

    fn command(&mut self, target: InstanceId, command: EventType) {
        self.hub
            .handle()
            .post_event(command, Box::new(()), None, target)
            .unwrap();
        self.hub.event_loop_mut().run_until_idle();
    }

    fn complete(&mut self, enabled: bool, error_code: u8) {
        self.hub
            .handle()
            .handle_scan_monitor_state_change(enabled, error_code)
            .unwrap();
        self.hub.event_loop_mut().run_until_idle();
    }

    fn monitoring_list(&mut self) -> Vec<InstanceId> {
        self.hub
            .event_loop_mut()
            .services
            .wifi
            .scan_monitor_nanoapps()
            .to_vec()
    }
}

#[test]
fn enable_calls_driver_and_completion_updates_the_list() {
    let mut f = fixture();
    let x = f.start_app(1, 0x10);

    f.command(x, ENABLE_CMD);
    assert_eq!(*f.calls.lock().unwrap(), vec![true]);
    assert!(f.results.lock().unwrap().is_empty());

    f.complete(true, ERROR_NONE);
    let results = f.results.lock().unwrap().clone();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, x);
    assert!(results[0].1.success);
    assert_eq!(results[0].1.cookie, 0x10);
    drop(results);
    assert_eq!(f.monitoring_list(), vec![x]);
}

#[test]
fn concurrent_enables_coalesce_into_one_transition() {
    let mut f = fixture();
    let x = f.start_app(1, 0x10);
    let y = f.start_app(2, 0x20);

    f.command(x, ENABLE_CMD);
    f.command(y, ENABLE_CMD);
    // Only the first request reaches the platform.
    assert_eq!(*f.calls.lock().unwrap(), vec![true]);

    f.complete(true, ERROR_NONE);
    let results = f.results.lock().unwrap().clone();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, result)| result.success));
    assert_eq!(*f.calls.lock().unwrap(), vec![true]);
    drop(results);

    let mut list = f.monitoring_list();
    list.sort_by_key(|id| id.0);
    assert_eq!(list, vec![x, y]);
}

#[test]
fn enable_when_already_enabled_succeeds_without_the_driver() {
    let mut f = fixture();
    let x = f.start_app(1, 0x10);
    let y = f.start_app(2, 0x20);

    f.command(x, ENABLE_CMD);
    f.complete(true, ERROR_NONE);
    f.results.lock().unwrap().clear();

    f.command(y, ENABLE_CMD);
    let results = f.results.lock().unwrap().clone();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, y);
    assert!(results[0].1.success);
    assert_eq!(*f.calls.lock().unwrap(), vec![true]);
}

#[test]
fn disable_without_a_request_is_an_immediate_success() {
    let mut f = fixture();
    let x = f.start_app(1, 0x10);

    f.command(x, DISABLE_CMD);
    let results = f.results.lock().unwrap().clone();
    assert_eq!(results.len(), 1);
    assert!(results[0].1.success);
    assert!(!results[0].1.enable);
    assert!(f.calls.lock().unwrap().is_empty());
}

#[test]
fn disable_from_last_requester_turns_the_monitor_off() {
    let mut f = fixture();
    let x = f.start_app(1, 0x10);

    f.command(x, ENABLE_CMD);
    f.complete(true, ERROR_NONE);
    f.results.lock().unwrap().clear();

    f.command(x, DISABLE_CMD);
    assert_eq!(*f.calls.lock().unwrap(), vec![true, false]);

    f.complete(false, ERROR_NONE);
    let results = f.results.lock().unwrap().clone();
    assert_eq!(results.len(), 1);
    assert!(results[0].1.success);
    drop(results);
    assert!(f.monitoring_list().is_empty());
}

#[test]
fn synchronous_driver_rejection_leaves_no_pending_transition() {
    let wifi = FakeWifi::new().rejecting();
    let calls = wifi.call_log();
    let results: Results = Arc::new(Mutex::new(Vec::new()));
    let mut hub = Hub::builder().with_wifi(Box::new(wifi)).build();
    let app = MonitorApp::new(1, 0x10, Arc::clone(&results));
    let x = hub.event_loop_mut().start_nanoapp(Box::new(app)).unwrap();

    // The command handler asserts acceptance, so drive the manager directly.
    let el = hub.event_loop_mut();
    let wifi_handle = el.handle();
    let accepted =
        el.services
            .wifi
            .configure_scan_monitor(x, true, 0x10, &wifi_handle);
    assert!(!accepted);
    assert!(!el.services.wifi.has_pending_transitions());
    assert_eq!(*calls.lock().unwrap(), vec![true]);
    assert!(results.lock().unwrap().is_empty());
}

#[test]
fn failed_completion_does_not_update_the_list() {
    let mut f = fixture();
    let x = f.start_app(1, 0x10);

    f.command(x, ENABLE_CMD);
    f.complete(false, ERROR_GENERIC);

    let results = f.results.lock().unwrap().clone();
    assert_eq!(results.len(), 1);
    assert!(!results[0].1.success);
    assert_eq!(results[0].1.error_code, ERROR_GENERIC);
    drop(results);
    assert!(f.monitoring_list().is_empty());
}

#[test]
fn unload_during_inflight_enable_leaves_no_ghost_requester() {
    let mut f = fixture();
    let x = f.start_app(1, 0x10);

    f.command(x, ENABLE_CMD);
    assert_eq!(*f.calls.lock().unwrap(), vec![true]);

    // The requester goes away while its transition is still in flight.
    assert!(f.hub.event_loop_mut().unload_nanoapp(x, false));

    f.complete(true, ERROR_NONE);
    // The completion must not resurrect the dead instance, and the now
    // unwanted monitor is turned back off.
    assert!(f.monitoring_list().is_empty());
    assert_eq!(*f.calls.lock().unwrap(), vec![true, false]);
    assert!(f.results.lock().unwrap().is_empty());

    f.complete(false, ERROR_NONE);
    assert!(f.monitoring_list().is_empty());
    assert!(!f.hub.event_loop_mut().services.wifi.has_pending_transitions());
    assert!(f.results.lock().unwrap().is_empty());
}

#[test]
fn queued_requests_from_other_apps_survive_an_unload() {
    let mut f = fixture();
    let x = f.start_app(1, 0x10);
    let y = f.start_app(2, 0x20);

    f.command(x, ENABLE_CMD);
    f.command(y, ENABLE_CMD);
    assert_eq!(*f.calls.lock().unwrap(), vec![true]);

    assert!(f.hub.event_loop_mut().unload_nanoapp(x, false));
    f.complete(true, ERROR_NONE);

    // Y's queued request rides the follow-up transition to completion.
    assert_eq!(*f.calls.lock().unwrap(), vec![true, true]);
    f.complete(true, ERROR_NONE);

    let results = f.results.lock().unwrap().clone();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, y);
    assert!(results[0].1.success);
    drop(results);
    assert_eq!(f.monitoring_list(), vec![y]);
}

#[test]
fn every_configure_call_yields_exactly_one_result() {
    let mut f = fixture();
    let x = f.start_app(1, 0x10);
    let y = f.start_app(2, 0x20);
    let z = f.start_app(3, 0x30);

    f.command(x, ENABLE_CMD);
    f.command(y, ENABLE_CMD);
    f.command(z, ENABLE_CMD);
    f.complete(true, ERROR_NONE);

    let results = f.results.lock().unwrap().clone();
    assert_eq!(results.len(), 3);
    let mut seen: Vec<u64> = results.iter().map(|(_, result)| result.cookie).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0x10, 0x20, 0x30]);
    // Exactly one driver transition regardless of requester count.
    assert_eq!(*f.calls.lock().unwrap(), vec![true]);
}

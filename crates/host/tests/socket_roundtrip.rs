//! Client/server round trip over a real Unix socket.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ctxhub_host::{ClientCallbacks, ClientConfig, SocketClient, SocketServer, UnixDialer};
use ctxhub_wire::{HubInfoResponse, HubMessage};

#[derive(Default)]
struct Collector {
    messages: Mutex<Vec<HubMessage>>,
}

impl ClientCallbacks for Collector {
    fn on_message_received(&self, message: HubMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

fn sample_hub_info() -> HubInfoResponse {
    HubInfoResponse {
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
        platform_id: 1,
        version: 1,
    }
}

#[test]
fn hub_info_request_is_answered_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub-test.sock");

    let server = SocketServer::bind(&path).unwrap();
    let registry = server.registry();
    let shutdown = server.shutdown_flag();

    let responder = registry.clone();
    let server_thread = thread::spawn(move || {
        server.run(Arc::new(move |client_id, message| {
            if message == HubMessage::HubInfoRequest {
                responder.send_to(
                    client_id,
                    &HubMessage::HubInfoResponse(sample_hub_info()),
                );
            }
        }))
    });

    let callbacks = Arc::new(Collector::default());
    let mut client = SocketClient::connect(
        UnixDialer::new(&path),
        ClientConfig::default(),
        false,
        Arc::clone(&callbacks) as Arc<dyn ClientCallbacks>,
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        registry.client_count() == 1
    }));
    assert!(client.send_message(&HubMessage::HubInfoRequest));

    assert!(wait_until(Duration::from_secs(2), || {
        !callbacks.messages.lock().unwrap().is_empty()
    }));
    let received = callbacks.messages.lock().unwrap();
    assert_eq!(
        *received,
        vec![HubMessage::HubInfoResponse(sample_hub_info())]
    );
    drop(received);

    client.disconnect();
    assert!(wait_until(Duration::from_secs(2), || {
        registry.client_count() == 0
    }));

    shutdown.store(true, Ordering::Release);
    server_thread.join().unwrap().unwrap();
    assert!(!path.exists());
}

#[test]
fn broadcast_reaches_every_connected_client() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub-broadcast.sock");

    let server = SocketServer::bind(&path).unwrap();
    let registry = server.registry();
    let shutdown = server.shutdown_flag();
    let server_thread = thread::spawn(move || server.run(Arc::new(|_, _| {})));

    let first = Arc::new(Collector::default());
    let second = Arc::new(Collector::default());
    let mut clients = Vec::new();
    for callbacks in [&first, &second] {
        clients.push(
            SocketClient::connect(
                UnixDialer::new(&path),
                ClientConfig::default(),
                false,
                Arc::clone(callbacks) as Arc<dyn ClientCallbacks>,
            )
            .unwrap(),
        );
    }
    assert!(wait_until(Duration::from_secs(2), || {
        registry.client_count() == 2
    }));

    registry.broadcast(&HubMessage::NanoappListRequest);
    for callbacks in [&first, &second] {
        assert!(wait_until(Duration::from_secs(2), || {
            !callbacks.messages.lock().unwrap().is_empty()
        }));
        assert_eq!(
            *callbacks.messages.lock().unwrap(),
            vec![HubMessage::NanoappListRequest]
        );
    }

    for client in &mut clients {
        client.disconnect();
    }
    shutdown.store(true, Ordering::Release);
    server_thread.join().unwrap().unwrap();
}

//! Context hub daemon: embeds the runtime and bridges it to host clients
//! over the named local socket.

mod echo;
mod sim;

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ctxhub_core::{AppId, HostLink, HostMessage, Hub, HubHandle, HubInfo};
use ctxhub_host::server::ClientMessageCallback;
use ctxhub_host::{socket_path, ClientRegistry, SocketServer};
use ctxhub_wire as wire;

use echo::EchoApp;
use sim::{SimSensorDriver, SimWifi};

/// Default app id of the built-in echo nanoapp.
const ECHO_APP_ID: u64 = 0x0123_4567_8900_0001;

#[derive(Parser, Debug)]
#[command(name = "hubd")]
#[command(about = "Context hub daemon", long_about = None)]
struct Args {
    /// Name of the local socket to serve
    #[arg(short = 's', long, default_value = wire::DEFAULT_SOCKET_NAME)]
    socket_name: String,

    /// Hub name reported in hub-info responses
    #[arg(long, default_value = "ctxhub")]
    hub_name: String,

    /// App id of the built-in echo nanoapp
    #[arg(long, default_value_t = ECHO_APP_ID)]
    echo_app_id: u64,
}

/// Outbound half of the bridge: nanoapp messages fan out to every connected
/// client.
struct ServerLink {
    registry: ClientRegistry,
}

impl HostLink for ServerLink {
    fn send(&mut self, message: &HostMessage) -> bool {
        if self.registry.client_count() == 0 {
            return false;
        }
        self.registry
            .broadcast(&wire::HubMessage::NanoappMessage(wire::NanoappMessage {
                app_id: message.app_id.0,
                host_endpoint: message.host_endpoint,
                message_type: message.message_type,
                payload: message.payload.clone(),
            }));
        true
    }
}

fn hub_info_response(info: &HubInfo) -> wire::HubInfoResponse {
    wire::HubInfoResponse {
        name: info.name.clone(),
        vendor: info.vendor.clone(),
        toolchain: info.toolchain.clone(),
        legacy_platform_version: info.legacy_platform_version,
        legacy_toolchain_version: info.legacy_toolchain_version,
        peak_mips: info.peak_mips,
        stopped_power_mw: info.stopped_power_mw,
        sleep_power_mw: info.sleep_power_mw,
        peak_power_mw: info.peak_power_mw,
        max_message_len: info.max_message_len,
        platform_id: info.platform_id,
        version: info.version,
    }
}

fn dispatch(handle: HubHandle, registry: ClientRegistry) -> ClientMessageCallback {
    Arc::new(move |client_id, message| match message {
        wire::HubMessage::HubInfoRequest => {
            handle.host_link_ready();
            let response = wire::HubMessage::HubInfoResponse(hub_info_response(handle.hub_info()));
            registry.send_to(client_id, &response);
        }
        wire::HubMessage::NanoappListRequest => {
            let entries = handle
                .nanoapp_entries()
                .into_iter()
                .map(|info| wire::NanoappListEntry {
                    app_id: info.app_id.0,
                    version: info.version,
                    enabled: true,
                    is_system: info.is_system,
                })
                .collect();
            let response =
                wire::HubMessage::NanoappListResponse(wire::NanoappListResponse { entries });
            registry.send_to(client_id, &response);
        }
        wire::HubMessage::NanoappMessage(message) => {
            handle.host_link_ready();
            handle.send_host_message_to_nanoapp(HostMessage {
                app_id: AppId(message.app_id),
                host_endpoint: message.host_endpoint,
                message_type: message.message_type,
                payload: message.payload,
            });
        }
        other => warn!(?other, "unexpected message from host client"),
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let path = socket_path(&args.socket_name);

    // Socket or signal setup failing at startup is fatal.
    let server = SocketServer::bind(&path)
        .with_context(|| format!("binding daemon socket {}", path.display()))?;
    let registry = server.registry();
    let shutdown = server.shutdown_flag();
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("registering SIGTERM")?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("registering SIGINT")?;

    let wifi_handle = Arc::new(OnceLock::new());
    let mut hub = Hub::builder()
        .with_info(HubInfo {
            name: args.hub_name.clone(),
            ..HubInfo::default()
        })
        .with_sensor_driver(Box::new(SimSensorDriver))
        .with_wifi(Box::new(SimWifi::new(Arc::clone(&wifi_handle))))
        .with_host_link(Box::new(ServerLink {
            registry: registry.clone(),
        }))
        .build();
    let handle = hub.handle();
    let _ = wifi_handle.set(handle.clone());

    hub.event_loop_mut()
        .start_nanoapp(Box::new(EchoApp::new(args.echo_app_id)))
        .context("starting echo nanoapp")?;

    let server_thread = {
        let callback = dispatch(handle.clone(), registry.clone());
        thread::spawn(move || server.run(callback))
    };
    let watcher = {
        let flag = Arc::clone(&shutdown);
        let handle = handle.clone();
        thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(100));
            }
            info!("shutdown requested");
            handle.stop();
        })
    };

    info!(socket = %path.display(), "hub running");
    hub.run();

    shutdown.store(true, Ordering::Release);
    server_thread
        .join()
        .expect("server thread panicked")
        .context("socket server failed")?;
    watcher.join().expect("watcher thread panicked");
    info!("hub stopped");
    Ok(())
}

//! Test utility that connects to the hub daemon, pokes it with a hub-info
//! request and a sample nanoapp message, and prints whatever comes back.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use ctxhub_host::{ClientCallbacks, ClientConfig, SocketClient, UnixDialer};
use ctxhub_wire as wire;
use ctxhub_wire::HubMessage;

/// App id of the daemon's built-in echo nanoapp.
const DEFAULT_APP_ID: u64 = 0x0123_4567_8900_0001;

#[derive(Parser, Debug)]
#[command(name = "chre_test_client")]
#[command(about = "Context hub daemon test client", long_about = None)]
struct Args {
    /// Name of the daemon's local socket
    #[arg(short = 's', long, default_value = wire::DEFAULT_SOCKET_NAME)]
    socket_name: String,

    /// Target app id for the sample nanoapp message
    #[arg(short = 'a', long, default_value_t = DEFAULT_APP_ID)]
    app_id: u64,

    /// How long to wait for responses before exiting
    #[arg(short = 'w', long, default_value_t = 5)]
    listen_secs: u64,
}

struct PrintingCallbacks;

impl ClientCallbacks for PrintingCallbacks {
    fn on_message_received(&self, message: HubMessage) {
        match message {
            HubMessage::HubInfoResponse(info) => {
                println!("{}", "Got hub info response:".green());
                println!("  Name: '{}', Vendor: '{}'", info.name, info.vendor);
                println!("  Toolchain: '{}'", info.toolchain);
                println!(
                    "  Legacy versions: platform {:#010x} toolchain {:#010x}",
                    info.legacy_platform_version, info.legacy_toolchain_version
                );
                println!(
                    "  MIPS {} Power (mW): stopped {} sleep {} peak {}",
                    info.peak_mips, info.stopped_power_mw, info.sleep_power_mw, info.peak_power_mw
                );
                println!("  Max message len: {}", info.max_message_len);
                println!(
                    "  Platform ID: {:#018x} Version: {:#010x}",
                    info.platform_id, info.version
                );
            }
            HubMessage::NanoappListResponse(list) => {
                println!("{}", "Got nanoapp list response:".green());
                for entry in list.entries {
                    println!(
                        "  App ID {:#018x} version {} enabled {} system {}",
                        entry.app_id, entry.version, entry.enabled, entry.is_system
                    );
                }
            }
            HubMessage::NanoappMessage(message) => {
                println!(
                    "{} from app {:#018x} to endpoint {:#06x} type {} ({} bytes)",
                    "Got message".green(),
                    message.app_id,
                    message.host_endpoint,
                    message.message_type,
                    message.payload.len()
                );
            }
            other => println!("{} {:?}", "Got unexpected message:".yellow(), other),
        }
    }

    fn on_socket_disconnected_by_remote(&self) {
        println!("{}", "Socket disconnected".red());
    }

    fn on_socket_reconnected(&self) {
        println!("{}", "Socket reconnected".yellow());
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let client = SocketClient::connect(
        UnixDialer::for_socket_name(&args.socket_name),
        ClientConfig::default(),
        true,
        Arc::new(PrintingCallbacks),
    )
    .with_context(|| format!("connecting to socket '{}'", args.socket_name))?;

    println!("Sending hub info request");
    anyhow::ensure!(
        client.send_message(&HubMessage::HubInfoRequest),
        "failed to send hub info request"
    );

    println!("Sending nanoapp list request");
    anyhow::ensure!(
        client.send_message(&HubMessage::NanoappListRequest),
        "failed to send nanoapp list request"
    );

    let sample = wire::NanoappMessage {
        app_id: args.app_id,
        host_endpoint: wire::HOST_ENDPOINT_UNSPECIFIED,
        message_type: 1234,
        payload: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11],
    };
    println!(
        "Sending nanoapp message to app {:#018x} ({} bytes)",
        sample.app_id,
        sample.payload.len()
    );
    anyhow::ensure!(
        client.send_message(&HubMessage::NanoappMessage(sample)),
        "failed to send nanoapp message"
    );

    println!("Listening for responses for {} s", args.listen_secs);
    thread::sleep(Duration::from_secs(args.listen_secs));
    Ok(())
}

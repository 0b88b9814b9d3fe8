//! Built-in system nanoapp that echoes host messages back to their sender.

use std::any::Any;

use tracing::info;

use ctxhub_core::{AppId, EventType, HostMessage, InstanceId, Nanoapp, NanoappContext};

pub struct EchoApp {
    app_id: AppId,
}

impl EchoApp {
    pub fn new(app_id: u64) -> Self {
        Self {
            app_id: AppId(app_id),
        }
    }
}

impl Nanoapp for EchoApp {
    fn app_id(&self) -> AppId {
        self.app_id
    }

    fn version(&self) -> u32 {
        1
    }

    fn is_system(&self) -> bool {
        true
    }

    fn start(&mut self, ctx: &mut NanoappContext<'_>) -> bool {
        info!(instance_id = %ctx.instance_id(), "echo app started");
        true
    }

    fn handle_event(
        &mut self,
        ctx: &mut NanoappContext<'_>,
        _sender: InstanceId,
        event_type: EventType,
        payload: &(dyn Any + Send + Sync),
    ) {
        if event_type == EventType::HOST_MESSAGE {
            if let Some(message) = payload.downcast_ref::<HostMessage>() {
                info!(
                    message_type = message.message_type,
                    len = message.payload.len(),
                    "echoing host message"
                );
                let _ = ctx.send_message_to_host(
                    message.host_endpoint,
                    message.message_type,
                    message.payload.clone(),
                );
            }
        }
    }

    fn end(&mut self, _ctx: &mut NanoappContext<'_>) {}
}

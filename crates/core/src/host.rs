//! Host-bound message bookkeeping: the runtime side of the host bridge.
//!
//! The transport itself (socket plumbing, envelope codec) lives outside the
//! kernel; this module only owns attribution and the pending queue that the
//! unload sequence flushes.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::event::{AppId, EventType, InstanceId};
use crate::event_loop::EventLoopHandle;

/// A nanoapp message crossing the host bridge in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMessage {
    pub app_id: AppId,
    pub host_endpoint: u16,
    pub message_type: u32,
    pub payload: Vec<u8>,
}

/// Transport boundary toward the host daemon. Returning false means the
/// message is not deliverable right now; the manager keeps it pending.
pub trait HostLink: Send {
    fn send(&mut self, message: &HostMessage) -> bool;
}

const MAX_PENDING_HOST_MESSAGES: usize = 32;

/// Owns the pending outbound queue against an injected [`HostLink`].
/// Loop-thread only.
pub struct HostCommsManager {
    link: Option<Box<dyn HostLink>>,
    pending: VecDeque<HostMessage>,
}

impl HostCommsManager {
    pub(crate) fn new(link: Option<Box<dyn HostLink>>) -> Self {
        Self {
            link,
            pending: VecDeque::new(),
        }
    }

    /// Sends immediately when the link accepts it, otherwise queues. Returns
    /// false only when the pending queue is full.
    pub(crate) fn send_message_to_host(&mut self, message: HostMessage) -> bool {
        if let Some(link) = &mut self.link {
            if link.send(&message) {
                return true;
            }
        }
        if self.pending.len() >= MAX_PENDING_HOST_MESSAGES {
            warn!(app_id = %message.app_id, "host-bound message queue full");
            return false;
        }
        self.pending.push_back(message);
        true
    }

    /// Retries queued messages in order, stopping at the first the link
    /// still refuses.
    pub(crate) fn retry_pending(&mut self) {
        let Some(link) = &mut self.link else {
            return;
        };
        while let Some(message) = self.pending.front() {
            if link.send(message) {
                self.pending.pop_front();
            } else {
                break;
            }
        }
    }

    /// Removes every pending message sent by `app_id`, routing each
    /// completion through the inbound queue so the unload drain observes it
    /// before the app's memory goes away.
    pub(crate) fn flush_messages_sent_by(&mut self, app_id: AppId, poster: &EventLoopHandle) {
        let mut remaining = VecDeque::with_capacity(self.pending.len());
        for message in self.pending.drain(..) {
            if message.app_id == app_id {
                debug!(%app_id, "flushing undelivered host-bound message");
                if poster
                    .post_event(
                        EventType::HOST_MESSAGE_FLUSHED,
                        Box::new(message),
                        None,
                        InstanceId::SYSTEM,
                        InstanceId::SYSTEM,
                    )
                    .is_err()
                {
                    warn!(%app_id, "dropped flush notice for host-bound message");
                }
            } else {
                remaining.push_back(message);
            }
        }
        self.pending = remaining;
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

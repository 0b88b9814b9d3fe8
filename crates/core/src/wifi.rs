//! Wifi request manager: the scan-monitor state machine.
//!
//! The scan monitor is a two-state resource (disabled/enabled) shared by a
//! list of interested nanoapps. The platform call is asynchronous: it
//! returns immediately and later delivers a completion, so transitions queue
//! behind the one in flight. Redundant requests coalesce, and every
//! requester receives exactly one async-result event.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::event::{EventType, InstanceId};
use crate::event_loop::EventLoopHandle;

/// Async completion code; zero means success.
pub const ERROR_NONE: u8 = 0;
/// Unspecified platform failure.
pub const ERROR_GENERIC: u8 = 1;

/// Payload delivered with [`EventType::WIFI_ASYNC_RESULT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncResult {
    pub success: bool,
    pub error_code: u8,
    /// True when the request asked to enable the monitor.
    pub enable: bool,
    pub cookie: u64,
}

/// Platform wifi backend. `configure_scan_monitor` is asynchronous: the
/// return value only acknowledges acceptance; the outcome arrives later via
/// [`crate::hub::HubHandle::handle_scan_monitor_state_change`].
pub trait PlatformWifi: Send {
    fn configure_scan_monitor(&mut self, enable: bool) -> bool;
}

/// Backend stub for hubs without wifi hardware; rejects every transition.
#[derive(Debug, Default)]
pub struct NullWifi;

impl PlatformWifi for NullWifi {
    fn configure_scan_monitor(&mut self, _enable: bool) -> bool {
        false
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WifiError {
    #[error("too many scan monitor state transitions pending")]
    TransitionQueueFull,
}

#[derive(Debug, Clone, Copy)]
struct ScanMonitorStateTransition {
    instance_id: InstanceId,
    enable: bool,
    cookie: u64,
}

const MAX_PENDING_TRANSITIONS: usize = 16;

/// Owns the scan-monitoring nanoapp list and the pending-transition FIFO.
///
/// Single-threaded: all entry points run on the loop thread. Platform
/// completions are deferred onto the loop as system events before they reach
/// [`Self::handle_scan_monitor_state_change_sync`].
pub struct WifiRequestManager {
    platform: Box<dyn PlatformWifi>,
    scan_monitor_nanoapps: Vec<InstanceId>,
    pending_transitions: VecDeque<ScanMonitorStateTransition>,
}

impl WifiRequestManager {
    pub fn new(platform: Box<dyn PlatformWifi>) -> Self {
        Self {
            platform,
            scan_monitor_nanoapps: Vec::new(),
            pending_transitions: VecDeque::new(),
        }
    }

    pub fn scan_monitor_is_enabled(&self) -> bool {
        !self.scan_monitor_nanoapps.is_empty()
    }

    pub fn scan_monitor_nanoapps(&self) -> &[InstanceId] {
        &self.scan_monitor_nanoapps
    }

    pub fn has_pending_transitions(&self) -> bool {
        !self.pending_transitions.is_empty()
    }

    /// Requests that the scan monitor be enabled or disabled on behalf of
    /// `instance_id`. Returns true when the request was accepted; the
    /// outcome arrives as exactly one async-result event to the requester.
    pub fn configure_scan_monitor(
        &mut self,
        instance_id: InstanceId,
        enable: bool,
        cookie: u64,
        poster: &EventLoopHandle,
    ) -> bool {
        let has_request = self.nanoapp_has_scan_monitor_request(instance_id);
        if !self.pending_transitions.is_empty() {
            // A transition is in flight; everything queues behind it.
            self.add_transition_to_queue(instance_id, enable, cookie).is_ok()
        } else if self.scan_monitor_is_in_requested_state(enable, has_request) {
            self.post_scan_monitor_async_result(
                poster,
                instance_id,
                true,
                enable,
                ERROR_NONE,
                cookie,
            )
        } else if self.scan_monitor_state_transition_is_required(enable, has_request) {
            if self.add_transition_to_queue(instance_id, enable, cookie).is_err() {
                return false;
            }
            if self.platform.configure_scan_monitor(enable) {
                true
            } else {
                self.pending_transitions.pop_back();
                error!(
                    instance_id = instance_id.0,
                    enable, "platform rejected scan monitor transition"
                );
                false
            }
        } else {
            debug_assert!(false, "invalid scan monitor configuration");
            error!(
                instance_id = instance_id.0,
                enable, "invalid scan monitor configuration"
            );
            false
        }
    }

    /// Processes a platform completion on the loop thread: resolves the head
    /// transition, then drains the queue until the platform accepts another
    /// transition or the queue empties.
    pub fn handle_scan_monitor_state_change_sync(
        &mut self,
        enabled: bool,
        error_code: u8,
        poster: &EventLoopHandle,
    ) {
        let mut success = error_code == ERROR_NONE;

        match self.pending_transitions.pop_front() {
            Some(head) => {
                success &= head.enable == enabled;
                self.post_scan_monitor_async_result(
                    poster,
                    head.instance_id,
                    success,
                    head.enable,
                    error_code,
                    head.cookie,
                );
            }
            None => {
                debug_assert!(false, "scan monitor completion with no pending transition");
                error!("scan monitor state change with no pending transition");
                return;
            }
        }

        while let Some(next) = self.pending_transitions.front().copied() {
            let has_request = self.nanoapp_has_scan_monitor_request(next.instance_id);
            if self.scan_monitor_is_in_requested_state(next.enable, has_request) {
                // Already where this requester wants to be; resolve with the
                // completed transition's outcome.
                self.post_scan_monitor_async_result(
                    poster,
                    next.instance_id,
                    success,
                    next.enable,
                    error_code,
                    next.cookie,
                );
            } else if self.scan_monitor_state_transition_is_required(next.enable, has_request) {
                if self.platform.configure_scan_monitor(next.enable) {
                    // Head stays queued until its completion arrives.
                    break;
                }
                self.post_scan_monitor_async_result(
                    poster,
                    next.instance_id,
                    false,
                    next.enable,
                    ERROR_GENERIC,
                    next.cookie,
                );
            } else {
                debug_assert!(false, "invalid scan monitor state");
                error!("invalid scan monitor state while draining transitions");
                break;
            }

            self.pending_transitions.pop_front();
        }

        // A requester that unloaded mid-transition can leave the monitor
        // enabled with no one asking for it.
        if enabled
            && self.pending_transitions.is_empty()
            && self.scan_monitor_nanoapps.is_empty()
        {
            if self.platform.configure_scan_monitor(false) {
                let _ = self.add_transition_to_queue(InstanceId::SYSTEM, false, 0);
            } else {
                warn!("could not disable orphaned scan monitor");
            }
        }
    }

    /// Drops an unloaded nanoapp from the monitoring list and the pending
    /// queue, turning the monitor off when it was the last requester and
    /// nothing is in flight.
    pub(crate) fn handle_nanoapp_unloaded(&mut self, instance_id: InstanceId) {
        // Transitions queued behind the in-flight head can simply vanish.
        // The head must stay so the platform completion still matches up,
        // but it becomes system-owned so its result cannot re-add the dead
        // instance to the monitoring list.
        if let Some(head) = self.pending_transitions.front_mut() {
            if head.instance_id == instance_id {
                head.instance_id = InstanceId::SYSTEM;
            }
        }
        let mut index = self.pending_transitions.len();
        while index > 1 {
            index -= 1;
            if self.pending_transitions[index].instance_id == instance_id {
                self.pending_transitions.remove(index);
            }
        }

        let Some(index) = self
            .scan_monitor_nanoapps
            .iter()
            .position(|id| *id == instance_id)
        else {
            return;
        };
        self.scan_monitor_nanoapps.remove(index);

        if self.scan_monitor_nanoapps.is_empty() && self.pending_transitions.is_empty() {
            if self.platform.configure_scan_monitor(false) {
                // Synthetic system-owned transition; its async result goes to
                // the system instance and is dropped there.
                let _ = self.add_transition_to_queue(InstanceId::SYSTEM, false, 0);
            } else {
                warn!("could not disable scan monitor after last requester unloaded");
            }
        }
    }

    fn nanoapp_has_scan_monitor_request(&self, instance_id: InstanceId) -> bool {
        self.scan_monitor_nanoapps.contains(&instance_id)
    }

    // Disabling is a no-op for a requester whose removal leaves others.
    fn scan_monitor_is_in_requested_state(&self, enable: bool, has_request: bool) -> bool {
        enable == self.scan_monitor_is_enabled()
            || (!enable && (!has_request || self.scan_monitor_nanoapps.len() > 1))
    }

    fn scan_monitor_state_transition_is_required(&self, enable: bool, has_request: bool) -> bool {
        (enable && self.scan_monitor_nanoapps.is_empty())
            || (!enable && has_request && self.scan_monitor_nanoapps.len() == 1)
    }

    fn add_transition_to_queue(
        &mut self,
        instance_id: InstanceId,
        enable: bool,
        cookie: u64,
    ) -> Result<(), WifiError> {
        if self.pending_transitions.len() >= MAX_PENDING_TRANSITIONS {
            warn!("too many scan monitor state transitions");
            return Err(WifiError::TransitionQueueFull);
        }
        self.pending_transitions.push_back(ScanMonitorStateTransition {
            instance_id,
            enable,
            cookie,
        });
        Ok(())
    }

    // Enabling adds the requester if absent; disabling removes it if
    // present. A no-op disable is legitimate when the requester was only
    // piggybacking on an already-satisfied state.
    fn update_nanoapp_scan_monitoring_list(&mut self, enable: bool, instance_id: InstanceId) {
        let existing = self
            .scan_monitor_nanoapps
            .iter()
            .position(|id| *id == instance_id);
        if enable {
            if existing.is_none() {
                self.scan_monitor_nanoapps.push(instance_id);
            }
        } else if let Some(index) = existing {
            self.scan_monitor_nanoapps.remove(index);
        }
    }

    /// Updates the monitoring list (on success) and posts the async-result
    /// event to the requester. Returns whether the event was posted.
    fn post_scan_monitor_async_result(
        &mut self,
        poster: &EventLoopHandle,
        instance_id: InstanceId,
        success: bool,
        enable: bool,
        error_code: u8,
        cookie: u64,
    ) -> bool {
        if success && instance_id != InstanceId::SYSTEM {
            self.update_nanoapp_scan_monitoring_list(enable, instance_id);
        }

        let result = AsyncResult {
            success,
            error_code,
            enable,
            cookie,
        };
        debug!(
            instance_id = instance_id.0,
            success, enable, "posting scan monitor async result"
        );
        match poster.post_event(
            EventType::WIFI_ASYNC_RESULT,
            Box::new(result),
            None,
            InstanceId::SYSTEM,
            instance_id,
        ) {
            Ok(()) => true,
            Err(err) => {
                // Losing a completion would desynchronize every requester.
                error!(%err, "failed to post scan monitor async result");
                false
            }
        }
    }
}

//! Registry of companion computers seen on the telemetry link.
//!
//! The registry is the single source of truth for which companion computers
//! are alive and which one is "current" for operator actions (unlock, reboot,
//! position-estimate injection). It is a plain state machine: liveness is
//! evaluated against the `now` supplied by the caller, and every observable
//! change is queued as a [`RegistryEvent`] for the owner to drain.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ocu_tunnel::{Link, LinkCommand};
use tracing::{debug, info, warn};

use crate::config::CompanionConfig;
use crate::errors::RegistryError;
use crate::types::{CompanionInfo, ComponentId, NO_DEVICE};

// ============================================================================
// Events
// ============================================================================

/// Observable registry changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// First heartbeat from a previously unknown device
    DeviceDiscovered(ComponentId),
    /// The current selection changed (`NO_DEVICE` when cleared)
    CurrentChanged(ComponentId),
    /// Metadata arrived for a device
    InfoUpdated {
        component_id: ComponentId,
        is_current: bool,
    },
    /// The device never answered its info requests; it stays usable
    InfoRequestFailed(ComponentId),
    /// The device stopped sending heartbeats and was removed
    DeviceTimedOut(ComponentId),
}

// ============================================================================
// Device
// ============================================================================

/// A companion computer known to the registry.
#[derive(Clone, Debug)]
pub struct CompanionDevice {
    component_id: ComponentId,
    info: Option<CompanionInfo>,
    last_heartbeat_at: Instant,
    info_request_count: u8,
    info_failure_reported: bool,
}

impl CompanionDevice {
    fn new(component_id: ComponentId, now: Instant) -> Self {
        Self {
            component_id,
            info: None,
            last_heartbeat_at: now,
            info_request_count: 0,
            info_failure_reported: false,
        }
    }

    pub fn component_id(&self) -> ComponentId {
        self.component_id
    }

    pub fn info(&self) -> Option<&CompanionInfo> {
        self.info.as_ref()
    }

    pub fn last_heartbeat_at(&self) -> Instant {
        self.last_heartbeat_at
    }

    /// Info retries sent after the initial request.
    pub fn info_request_count(&self) -> u8 {
        self.info_request_count
    }

    pub fn is_vendor_module(&self) -> bool {
        self.info.as_ref().is_some_and(CompanionInfo::is_vendor_module)
    }

    /// A record with a zero vendor id counts as unanswered.
    pub fn has_info(&self) -> bool {
        self.info.as_ref().is_some_and(|i| i.vendor_id != 0)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registry tuning.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Period of `check_timeouts`; a device is dropped after twice this.
    pub check_interval: Duration,
    /// Info retries after the initial request before giving up.
    pub max_info_retries: u8,
    /// Component ids reserved for companion computers.
    pub component_range: RangeInclusive<ComponentId>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&CompanionConfig::default())
    }
}

impl From<&CompanionConfig> for RegistryConfig {
    fn from(config: &CompanionConfig) -> Self {
        Self {
            check_interval: config.heartbeat_check_interval(),
            max_info_retries: config.info_request_max_retries,
            component_range: config.component_range(),
        }
    }
}

/// Live set of companion computers and the current selection.
///
/// Events accumulate until [`DeviceRegistry::drain_events`] is called; an
/// owner that never drains lets the queue grow without bound.
pub struct DeviceRegistry<L: Link> {
    config: RegistryConfig,
    link: Arc<L>,
    devices: BTreeMap<ComponentId, CompanionDevice>,
    current: ComponentId,
    events: Vec<RegistryEvent>,
}

impl<L: Link> DeviceRegistry<L> {
    pub fn new(link: Arc<L>) -> Self {
        Self::with_config(RegistryConfig::default(), link)
    }

    pub fn with_config(config: RegistryConfig, link: Arc<L>) -> Self {
        Self {
            config,
            link,
            devices: BTreeMap::new(),
            current: NO_DEVICE,
            events: Vec::new(),
        }
    }

    /// Take every event queued since the last call.
    pub fn drain_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.events)
    }

    /// Record a heartbeat from `component_id`.
    pub fn on_heartbeat(&mut self, component_id: ComponentId, now: Instant) {
        if !self.config.component_range.contains(&component_id) {
            debug!(component_id, "heartbeat outside companion range ignored");
            return;
        }

        let max_retries = self.config.max_info_retries;
        let Some(device) = self.devices.get_mut(&component_id) else {
            self.devices
                .insert(component_id, CompanionDevice::new(component_id, now));
            info!(component_id, "companion computer discovered");
            self.events.push(RegistryEvent::DeviceDiscovered(component_id));
            self.request_info(component_id);
            if self.current == NO_DEVICE {
                self.set_current(component_id);
            }
            return;
        };

        device.last_heartbeat_at = now;
        if device.has_info() || device.info_failure_reported {
            return;
        }

        if device.info_request_count < max_retries {
            device.info_request_count += 1;
            debug!(
                component_id,
                attempt = device.info_request_count,
                "retrying companion info request"
            );
            self.request_info(component_id);
        } else {
            device.info_failure_reported = true;
            warn!(component_id, "companion info request retry limit reached");
            self.events.push(RegistryEvent::InfoRequestFailed(component_id));
        }
    }

    /// Store the metadata published by `component_id`.
    pub fn on_info_response(&mut self, component_id: ComponentId, info: CompanionInfo) {
        let Some(device) = self.devices.get_mut(&component_id) else {
            debug!(component_id, "info for unknown companion ignored");
            return;
        };

        debug!(component_id, vendor_id = info.vendor_id, "companion info received");
        device.info = Some(info);
        self.events.push(RegistryEvent::InfoUpdated {
            component_id,
            is_current: component_id == self.current,
        });
    }

    /// Make `component_id` current. Fails for unknown devices.
    pub fn select_current(&mut self, component_id: ComponentId) -> bool {
        if !self.devices.contains_key(&component_id) {
            debug!(component_id, "cannot select unknown companion");
            return false;
        }
        if self.current != component_id {
            self.set_current(component_id);
        }
        true
    }

    /// Drop every device silent for more than twice the check interval.
    pub fn check_timeouts(&mut self, now: Instant) {
        let limit = self.config.check_interval * 2;
        let expired: Vec<ComponentId> = self
            .devices
            .values()
            .filter(|d| now.saturating_duration_since(d.last_heartbeat_at) > limit)
            .map(|d| d.component_id)
            .collect();

        for &component_id in &expired {
            self.devices.remove(&component_id);
            info!(component_id, "companion computer timed out");

            if self.current == component_id {
                let next = self
                    .devices
                    .keys()
                    .find(|id| !expired.contains(*id))
                    .copied()
                    .unwrap_or(NO_DEVICE);
                self.set_current(next);
            }
            self.events.push(RegistryEvent::DeviceTimedOut(component_id));
        }
    }

    /// Ask every known device to reboot. Returns how many requests were queued.
    pub fn reboot_all(&self) -> usize {
        let mut queued = 0;
        for component_id in self.devices.keys().copied() {
            info!(component_id, "rebooting companion computer");
            match self.link.send_command(component_id, LinkCommand::RebootCompanion) {
                Ok(()) => queued += 1,
                Err(e) => warn!(component_id, error = %e, "reboot request not sent"),
            }
        }
        queued
    }

    /// Inject an external position estimate into the current device.
    pub fn send_position_estimate(
        &self,
        latitude: f64,
        longitude: f64,
        altitude: f32,
    ) -> Result<(), RegistryError> {
        let target = self.current_device().ok_or_else(|| {
            warn!("position estimate without a current companion");
            RegistryError::NoCurrentDevice
        })?;

        debug!(component_id = target, "sending external position estimate");
        self.link.send_command(
            target,
            LinkCommand::ExternalPositionEstimate {
                latitude,
                longitude,
                altitude,
            },
        )?;
        Ok(())
    }

    /// Current selection, `NO_DEVICE` when none.
    pub fn current_device_id(&self) -> ComponentId {
        self.current
    }

    pub fn current_device(&self) -> Option<ComponentId> {
        (self.current != NO_DEVICE).then_some(self.current)
    }

    pub fn device(&self, component_id: ComponentId) -> Option<&CompanionDevice> {
        self.devices.get(&component_id)
    }

    pub fn device_metadata(&self, component_id: ComponentId) -> Option<CompanionInfo> {
        self.devices.get(&component_id)?.info.clone()
    }

    pub fn current_is_vendor_module(&self) -> bool {
        self.devices
            .get(&self.current)
            .is_some_and(CompanionDevice::is_vendor_module)
    }

    pub fn devices(&self) -> impl Iterator<Item = &CompanionDevice> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn set_current(&mut self, component_id: ComponentId) {
        debug!(component_id, "setting current companion");
        self.current = component_id;
        self.events.push(RegistryEvent::CurrentChanged(component_id));
    }

    fn request_info(&self, component_id: ComponentId) {
        if let Err(e) = self
            .link
            .send_command(component_id, LinkCommand::RequestCompanionInfo)
        {
            warn!(component_id, error = %e, "companion info request not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocu_tunnel::testing::MockLink;
    use proptest::prelude::*;

    fn registry() -> (DeviceRegistry<MockLink>, Arc<MockLink>) {
        let link = Arc::new(MockLink::new());
        (DeviceRegistry::new(link.clone()), link)
    }

    fn info(vendor_id: u16) -> CompanionInfo {
        CompanionInfo {
            vendor_id,
            firmware_version: 3,
            os_version_hash: "abc123".into(),
            ..CompanionInfo::default()
        }
    }

    fn info_requests(link: &MockLink, id: ComponentId) -> usize {
        link.sent_commands()
            .iter()
            .filter(|(t, c)| *t == id && *c == LinkCommand::RequestCompanionInfo)
            .count()
    }

    #[test]
    fn test_first_heartbeat_creates_current_device() {
        let (mut reg, link) = registry();
        let now = Instant::now();

        reg.on_heartbeat(2, now);

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.current_device_id(), 2);
        assert_eq!(
            reg.drain_events(),
            vec![
                RegistryEvent::DeviceDiscovered(2),
                RegistryEvent::CurrentChanged(2)
            ]
        );
        assert_eq!(info_requests(&link, 2), 1);
    }

    #[test]
    fn test_second_device_does_not_steal_selection() {
        let (mut reg, _link) = registry();
        let now = Instant::now();

        reg.on_heartbeat(1, now);
        reg.on_heartbeat(3, now);

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.current_device_id(), 1);
    }

    #[test]
    fn test_heartbeat_outside_range_ignored() {
        let (mut reg, link) = registry();
        reg.on_heartbeat(0, Instant::now());
        reg.on_heartbeat(191, Instant::now());

        assert!(reg.is_empty());
        assert_eq!(reg.current_device(), None);
        assert!(link.get_sent().is_empty());
    }

    #[test]
    fn test_info_retries_then_gives_up_once() {
        let (mut reg, link) = registry();
        let now = Instant::now();

        reg.on_heartbeat(1, now);
        for _ in 0..10 {
            reg.on_heartbeat(1, now);
        }

        // initial request + 4 retries
        assert_eq!(info_requests(&link, 1), 5);
        let failures = reg
            .drain_events()
            .into_iter()
            .filter(|e| *e == RegistryEvent::InfoRequestFailed(1))
            .count();
        assert_eq!(failures, 1);
        assert_eq!(reg.device(1).unwrap().info_request_count(), 4);
        // still usable
        assert_eq!(reg.current_device_id(), 1);
    }

    #[test]
    fn test_info_response_stops_retries() {
        let (mut reg, link) = registry();
        let now = Instant::now();

        reg.on_heartbeat(1, now);
        reg.on_info_response(1, info(0xF4));
        reg.on_heartbeat(1, now);
        reg.on_heartbeat(1, now);

        assert_eq!(info_requests(&link, 1), 1);
        assert_eq!(reg.device_metadata(1), Some(info(0xF4)));
        assert!(reg.current_is_vendor_module());
    }

    #[test]
    fn test_zero_vendor_info_keeps_retrying() {
        let (mut reg, link) = registry();
        let now = Instant::now();

        reg.on_heartbeat(1, now);
        reg.on_info_response(1, CompanionInfo::default());
        reg.on_heartbeat(1, now);

        assert!(!reg.device(1).unwrap().has_info());
        assert_eq!(info_requests(&link, 1), 2);
    }

    #[test]
    fn test_info_response_reports_currentness() {
        let (mut reg, _link) = registry();
        let now = Instant::now();
        reg.on_heartbeat(1, now);
        reg.on_heartbeat(2, now);
        reg.drain_events();

        reg.on_info_response(1, info(1));
        reg.on_info_response(2, info(2));

        assert_eq!(
            reg.drain_events(),
            vec![
                RegistryEvent::InfoUpdated {
                    component_id: 1,
                    is_current: true
                },
                RegistryEvent::InfoUpdated {
                    component_id: 2,
                    is_current: false
                },
            ]
        );
    }

    #[test]
    fn test_info_for_unknown_device_ignored() {
        let (mut reg, _link) = registry();
        reg.on_info_response(4, info(1));
        assert!(reg.is_empty());
        assert!(reg.drain_events().is_empty());
    }

    #[test]
    fn test_select_current() {
        let (mut reg, _link) = registry();
        let now = Instant::now();
        reg.on_heartbeat(1, now);
        reg.on_heartbeat(2, now);
        reg.drain_events();

        assert!(!reg.select_current(4));
        assert_eq!(reg.current_device_id(), 1);

        assert!(reg.select_current(2));
        assert_eq!(reg.current_device_id(), 2);
        assert_eq!(reg.drain_events(), vec![RegistryEvent::CurrentChanged(2)]);

        // reselecting is accepted without a change notification
        assert!(reg.select_current(2));
        assert!(reg.drain_events().is_empty());
    }

    #[test]
    fn test_timeout_removes_device_once() {
        let (mut reg, _link) = registry();
        let t0 = Instant::now();
        reg.on_heartbeat(1, t0);
        reg.drain_events();

        // exactly twice the interval is still alive
        reg.check_timeouts(t0 + Duration::from_millis(4000));
        assert_eq!(reg.len(), 1);

        reg.check_timeouts(t0 + Duration::from_millis(4001));
        assert!(reg.is_empty());
        assert_eq!(reg.current_device_id(), NO_DEVICE);
        assert_eq!(
            reg.drain_events(),
            vec![
                RegistryEvent::CurrentChanged(NO_DEVICE),
                RegistryEvent::DeviceTimedOut(1)
            ]
        );

        reg.check_timeouts(t0 + Duration::from_secs(60));
        assert!(reg.drain_events().is_empty());
    }

    #[test]
    fn test_timeout_of_current_reelects_remaining() {
        let (mut reg, _link) = registry();
        let t0 = Instant::now();
        reg.on_heartbeat(2, t0);
        reg.on_heartbeat(3, t0);
        reg.on_heartbeat(4, t0 + Duration::from_secs(3));
        reg.on_heartbeat(3, t0 + Duration::from_secs(3));
        reg.drain_events();

        reg.check_timeouts(t0 + Duration::from_secs(5));

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.current_device_id(), 3);
        assert_eq!(
            reg.drain_events(),
            vec![
                RegistryEvent::CurrentChanged(3),
                RegistryEvent::DeviceTimedOut(2)
            ]
        );
    }

    #[test]
    fn test_reelection_skips_devices_expiring_in_same_sweep() {
        let (mut reg, _link) = registry();
        let t0 = Instant::now();
        reg.on_heartbeat(1, t0);
        reg.on_heartbeat(2, t0);
        reg.on_heartbeat(3, t0 + Duration::from_secs(3));
        reg.drain_events();

        reg.check_timeouts(t0 + Duration::from_secs(5));

        assert_eq!(reg.current_device_id(), 3);
        assert_eq!(
            reg.drain_events(),
            vec![
                RegistryEvent::CurrentChanged(3),
                RegistryEvent::DeviceTimedOut(1),
                RegistryEvent::DeviceTimedOut(2)
            ]
        );
    }

    #[test]
    fn test_all_expiring_clears_selection_once() {
        let (mut reg, _link) = registry();
        let t0 = Instant::now();
        reg.on_heartbeat(1, t0);
        reg.on_heartbeat(2, t0);
        reg.drain_events();

        reg.check_timeouts(t0 + Duration::from_secs(5));

        assert_eq!(
            reg.drain_events(),
            vec![
                RegistryEvent::CurrentChanged(NO_DEVICE),
                RegistryEvent::DeviceTimedOut(1),
                RegistryEvent::DeviceTimedOut(2)
            ]
        );
    }

    #[test]
    fn test_drain_empties_event_queue() {
        let (mut reg, _link) = registry();
        reg.on_heartbeat(1, Instant::now());
        assert_eq!(reg.drain_events().len(), 2);
        assert!(reg.drain_events().is_empty());
    }

    #[test]
    fn test_heartbeat_keeps_device_alive() {
        let (mut reg, _link) = registry();
        let t0 = Instant::now();
        reg.on_heartbeat(1, t0);
        reg.on_heartbeat(1, t0 + Duration::from_secs(3));
        reg.check_timeouts(t0 + Duration::from_secs(6));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_reboot_all_addresses_every_device() {
        let (mut reg, link) = registry();
        let now = Instant::now();
        reg.on_heartbeat(1, now);
        reg.on_heartbeat(4, now);
        link.clear_sent();

        assert_eq!(reg.reboot_all(), 2);
        assert_eq!(
            link.sent_commands(),
            vec![
                (1, LinkCommand::RebootCompanion),
                (4, LinkCommand::RebootCompanion)
            ]
        );
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_reboot_all_with_link_down() {
        let (mut reg, link) = registry();
        reg.on_heartbeat(1, Instant::now());
        link.disconnect();
        assert_eq!(reg.reboot_all(), 0);
    }

    #[test]
    fn test_position_estimate_targets_current() {
        let (mut reg, link) = registry();
        assert_eq!(
            reg.send_position_estimate(50.0, 14.0, 300.0),
            Err(RegistryError::NoCurrentDevice)
        );

        reg.on_heartbeat(2, Instant::now());
        link.clear_sent();
        reg.send_position_estimate(50.0, 14.0, 300.0).unwrap();
        assert_eq!(
            link.sent_commands(),
            vec![(
                2,
                LinkCommand::ExternalPositionEstimate {
                    latitude: 50.0,
                    longitude: 14.0,
                    altitude: 300.0
                }
            )]
        );
    }

    #[derive(Clone, Debug)]
    enum Op {
        Heartbeat(u8, u64),
        Sweep(u64),
        Select(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u8..=4, 0u64..3000).prop_map(|(id, dt)| Op::Heartbeat(id, dt)),
            (0u64..6000).prop_map(Op::Sweep),
            (0u8..=5).prop_map(Op::Select),
        ]
    }

    proptest! {
        #[test]
        fn prop_current_always_references_live_device(ops in prop::collection::vec(op(), 1..60)) {
            let (mut reg, _link) = registry();
            let mut now = Instant::now();
            let mut discovered = std::collections::HashMap::new();
            let mut timed_out = std::collections::HashMap::new();

            for op in ops {
                match op {
                    Op::Heartbeat(id, dt) => {
                        now += Duration::from_millis(dt);
                        reg.on_heartbeat(id, now);
                    }
                    Op::Sweep(dt) => {
                        now += Duration::from_millis(dt);
                        reg.check_timeouts(now);
                    }
                    Op::Select(id) => {
                        let known = reg.device(id).is_some();
                        prop_assert_eq!(reg.select_current(id), known);
                    }
                }

                for event in reg.drain_events() {
                    match event {
                        RegistryEvent::DeviceDiscovered(id) => *discovered.entry(id).or_insert(0) += 1,
                        RegistryEvent::DeviceTimedOut(id) => *timed_out.entry(id).or_insert(0) += 1,
                        _ => {}
                    }
                }

                if reg.is_empty() {
                    prop_assert_eq!(reg.current_device_id(), NO_DEVICE);
                } else {
                    prop_assert!(reg.device(reg.current_device_id()).is_some());
                }
            }

            // every removal follows exactly one discovery of the same entry
            for (id, removed) in timed_out {
                let created = discovered.get(&id).copied().unwrap_or(0);
                prop_assert!(created == removed || created == removed + 1);
            }
        }
    }
}

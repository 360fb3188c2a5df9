//! Simulated companion computers for tests and the demo.
//!
//! A [`SimulatedCompanion`] answers outbound link records the way a real
//! companion computer would: info requests with its [`CompanionInfo`], a
//! signed token with a blinded challenge, and the unlock key with an ack.
//! [`run_fleet`] pumps a [`ChannelLink`] queue through a set of companions and
//! feeds their replies back into a [`CompanionHandle`].

use std::sync::Arc;
use std::time::Duration;

use getrandom::getrandom;
use ocu_token::SecurityToken;
use ocu_tunnel::{
    ChannelLink, LinkCommand, Outbound, PayloadType, TunnelMessage, BLINDED_CHALLENGE_SIZE,
    DEFAULT_LINK_QUEUE_DEPTH,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::CompanionConfig;
use crate::errors::{CoreError, ServiceError};
use crate::registry::RegistryEvent;
use crate::service::{CompanionHandle, CompanionService, ServiceEvent};
use crate::types::{CompanionInfo, ComponentId, VENDOR_MODULE_ID};
use crate::unlock::UnlockEvent;

/// Fill an array from the OS RNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], getrandom::Error> {
    let mut b = [0u8; N];
    getrandom(&mut b)?;
    Ok(b)
}

/// Record delivered from a companion to the station.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Heartbeat(ComponentId),
    Info(ComponentId, CompanionInfo),
    Tunnel(TunnelMessage),
}

impl Inbound {
    pub async fn deliver(self, handle: &CompanionHandle) -> Result<(), ServiceError> {
        match self {
            Inbound::Heartbeat(id) => handle.heartbeat(id).await,
            Inbound::Info(id, info) => handle.info_response(id, info).await,
            Inbound::Tunnel(message) => handle.tunnel_message(message).await,
        }
    }
}

/// Scriptable companion computer.
#[derive(Clone, Debug)]
pub struct SimulatedCompanion {
    component_id: ComponentId,
    info: CompanionInfo,
    challenge: Option<[u8; BLINDED_CHALLENGE_SIZE]>,
    silent_info: bool,
    drop_ack: bool,
    received_key: Option<Vec<u8>>,
    reboots: usize,
}

impl SimulatedCompanion {
    /// A vendor guidance module answering every request.
    pub fn new(component_id: ComponentId) -> Self {
        Self {
            component_id,
            info: CompanionInfo {
                vendor_id: VENDOR_MODULE_ID,
                product_id: 1,
                uid: u64::from(component_id),
                firmware_version: 0x0102_0000,
                firmware_version_hash: "c0ffee".into(),
                ..CompanionInfo::default()
            },
            challenge: None,
            silent_info: false,
            drop_ack: false,
            received_key: None,
            reboots: 0,
        }
    }

    /// Use a fixed challenge instead of a random one.
    pub fn with_challenge(mut self, challenge: [u8; BLINDED_CHALLENGE_SIZE]) -> Self {
        self.challenge = Some(challenge);
        self
    }

    pub fn with_info(mut self, info: CompanionInfo) -> Self {
        self.info = info;
        self
    }

    /// Never answer info requests.
    pub fn silent_info(mut self) -> Self {
        self.silent_info = true;
        self
    }

    /// Accept the unlock key without acknowledging it.
    pub fn drop_ack(mut self) -> Self {
        self.drop_ack = true;
        self
    }

    pub fn component_id(&self) -> ComponentId {
        self.component_id
    }

    /// The unlock key this companion received, if any.
    pub fn received_key(&self) -> Option<&[u8]> {
        self.received_key.as_deref()
    }

    pub fn reboots(&self) -> usize {
        self.reboots
    }

    pub fn heartbeat(&self) -> Inbound {
        Inbound::Heartbeat(self.component_id)
    }

    /// Replies to one outbound record. Records for other companions yield nothing.
    pub fn respond(&mut self, outbound: &Outbound) -> Vec<Inbound> {
        match outbound {
            Outbound::Command { target, command } if *target == self.component_id => {
                match command {
                    LinkCommand::RequestCompanionInfo if !self.silent_info => {
                        vec![Inbound::Info(self.component_id, self.info.clone())]
                    }
                    LinkCommand::RebootCompanion => {
                        self.reboots += 1;
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            Outbound::Tunnel(message) if message.target_component() == self.component_id => {
                self.on_tunnel(message)
            }
            _ => Vec::new(),
        }
    }

    fn on_tunnel(&mut self, message: &TunnelMessage) -> Vec<Inbound> {
        let reply = match message.payload_type() {
            PayloadType::SignedToken => {
                let challenge = match self.challenge {
                    Some(c) => c,
                    None => match random_bytes() {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(error = %e, "no challenge generated");
                            return Vec::new();
                        }
                    },
                };
                TunnelMessage::new(self.component_id, PayloadType::BlindedChallenge, &challenge)
            }
            PayloadType::UnlockKeyResponse => {
                self.received_key = Some(message.payload().to_vec());
                if self.drop_ack {
                    debug!(component_id = self.component_id, "dropping ack");
                    return Vec::new();
                }
                TunnelMessage::new(self.component_id, PayloadType::Ack, &[])
            }
            _ => return Vec::new(),
        };

        match reply {
            Ok(m) => vec![Inbound::Tunnel(m)],
            Err(e) => {
                warn!(error = %e, "simulated reply not framed");
                Vec::new()
            }
        }
    }
}

/// Pump outbound records through `fleet` until the link queue closes.
/// Every companion heartbeats once per `heartbeat_period` while the service
/// is running; records still queued after it stops are drained.
pub async fn run_fleet(
    mut fleet: Vec<SimulatedCompanion>,
    mut outbound: mpsc::Receiver<Outbound>,
    handle: CompanionHandle,
    heartbeat_period: Duration,
) -> Vec<SimulatedCompanion> {
    let mut heartbeat = tokio::time::interval(heartbeat_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stopped = false;

    loop {
        let replies: Vec<Inbound> = tokio::select! {
            _ = heartbeat.tick(), if !stopped => {
                fleet.iter().map(SimulatedCompanion::heartbeat).collect()
            }
            record = outbound.recv() => match record {
                Some(record) => fleet.iter_mut().flat_map(|c| c.respond(&record)).collect(),
                None => break,
            },
        };

        for reply in replies {
            if stopped {
                break;
            }
            if reply.deliver(&handle).await.is_err() {
                debug!("service stopped, draining link queue");
                stopped = true;
            }
        }
    }
    fleet
}

/// Result of a completed [`run_unlock_flow`].
#[derive(Debug)]
pub struct FlowReport {
    pub target: ComponentId,
    pub fleet: Vec<SimulatedCompanion>,
}

/// Bring up a service against a simulated fleet, wait for a current device,
/// and run one unlock with `signed_token`.
pub async fn run_unlock_flow<T: SecurityToken + 'static>(
    config: CompanionConfig,
    token: Arc<T>,
    fleet: Vec<SimulatedCompanion>,
    signed_token: &[u8],
) -> Result<FlowReport, CoreError> {
    let heartbeat_period = config.heartbeat_check_interval() / 2;
    let (link, outbound) = ChannelLink::new(DEFAULT_LINK_QUEUE_DEPTH);
    let (handle, task) = CompanionService::spawn(config, Arc::new(link), token)?;
    let mut events = handle.subscribe();
    let pump = tokio::spawn(run_fleet(fleet, outbound, handle.clone(), heartbeat_period));

    let outcome = drive_unlock(&handle, &mut events, signed_token).await;

    // already stopped is fine; the pump ends once the service drops its link
    let _ = handle.shutdown().await;
    let _ = task.await;
    let fleet = pump.await.map_err(|_| ServiceError::Stopped)?;

    let target = outcome?;
    Ok(FlowReport { target, fleet })
}

async fn drive_unlock(
    handle: &CompanionHandle,
    events: &mut broadcast::Receiver<ServiceEvent>,
    signed_token: &[u8],
) -> Result<ComponentId, CoreError> {
    let target = loop {
        if let ServiceEvent::Registry(RegistryEvent::CurrentChanged(id)) = next_event(events).await? {
            if id != 0 {
                break id;
            }
        }
    };

    handle.start_unlock(signed_token).await??;
    loop {
        match next_event(events).await? {
            ServiceEvent::Unlock(UnlockEvent::Completed) => return Ok(target),
            ServiceEvent::Unlock(UnlockEvent::Failed(failure)) => return Err(failure.into()),
            ServiceEvent::Registry(_) => {}
        }
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<ServiceEvent>,
) -> Result<ServiceEvent, ServiceError> {
    loop {
        match events.recv().await {
            Ok(event) => return Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "event receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(ServiceError::Stopped),
        }
    }
}

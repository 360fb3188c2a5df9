//! Companion service runtime.
//!
//! One tokio task owns the [`DeviceRegistry`] and the [`UnlockEngine`] and is
//! the only place either is mutated. Everything else talks to it through a
//! cloneable [`CompanionHandle`] and listens to [`ServiceEvent`]s on a
//! broadcast channel.
//!
//! The task multiplexes four sources:
//! - handle commands
//! - the periodic liveness sweep
//! - key derivation results coming back from the blocking pool
//! - the unlock deadline (only armed while a session is awaiting)

use std::sync::Arc;

use ocu_token::{SecurityToken, TokenError};
use ocu_tunnel::{Link, TunnelMessage};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::{CompanionConfig, ConfigError};
use crate::errors::{RegistryError, ServiceError, StartError};
use crate::registry::{DeviceRegistry, RegistryConfig, RegistryEvent};
use crate::types::{CompanionInfo, ComponentId};
use crate::unlock::{derive_unlock_key, KeyRequest, UnlockEngine, UnlockEvent, UnlockState, UnlockStep};

/// Notification published by the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    Registry(RegistryEvent),
    Unlock(UnlockEvent),
}

enum Command {
    Heartbeat(ComponentId),
    InfoResponse(ComponentId, CompanionInfo),
    Tunnel(TunnelMessage),
    SelectCurrent(ComponentId, oneshot::Sender<bool>),
    CurrentDeviceId(oneshot::Sender<ComponentId>),
    DeviceMetadata(ComponentId, oneshot::Sender<Option<CompanionInfo>>),
    CurrentIsVendorModule(oneshot::Sender<bool>),
    UnlockState(oneshot::Sender<UnlockState>),
    RebootAll(oneshot::Sender<usize>),
    PositionEstimate {
        latitude: f64,
        longitude: f64,
        altitude: f32,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    StartUnlock(Zeroizing<Vec<u8>>, oneshot::Sender<Result<(), StartError>>),
    ResetUnlock(oneshot::Sender<()>),
    Shutdown,
}

type Derived = (u64, Result<Zeroizing<Vec<u8>>, TokenError>);

/// Cloneable handle to a running service.
#[derive(Clone)]
pub struct CompanionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ServiceEvent>,
}

impl CompanionHandle {
    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub async fn heartbeat(&self, component_id: ComponentId) -> Result<(), ServiceError> {
        self.send(Command::Heartbeat(component_id)).await
    }

    pub async fn info_response(
        &self,
        component_id: ComponentId,
        info: CompanionInfo,
    ) -> Result<(), ServiceError> {
        self.send(Command::InfoResponse(component_id, info)).await
    }

    pub async fn tunnel_message(&self, message: TunnelMessage) -> Result<(), ServiceError> {
        self.send(Command::Tunnel(message)).await
    }

    pub async fn select_current(&self, component_id: ComponentId) -> Result<bool, ServiceError> {
        self.request(|reply| Command::SelectCurrent(component_id, reply))
            .await
    }

    pub async fn current_device_id(&self) -> Result<ComponentId, ServiceError> {
        self.request(Command::CurrentDeviceId).await
    }

    pub async fn device_metadata(
        &self,
        component_id: ComponentId,
    ) -> Result<Option<CompanionInfo>, ServiceError> {
        self.request(|reply| Command::DeviceMetadata(component_id, reply))
            .await
    }

    pub async fn current_is_vendor_module(&self) -> Result<bool, ServiceError> {
        self.request(Command::CurrentIsVendorModule).await
    }

    pub async fn unlock_state(&self) -> Result<UnlockState, ServiceError> {
        self.request(Command::UnlockState).await
    }

    /// Returns how many reboot requests were queued.
    pub async fn reboot_all(&self) -> Result<usize, ServiceError> {
        self.request(Command::RebootAll).await
    }

    pub async fn send_position_estimate(
        &self,
        latitude: f64,
        longitude: f64,
        altitude: f32,
    ) -> Result<Result<(), RegistryError>, ServiceError> {
        self.request(|reply| Command::PositionEstimate {
            latitude,
            longitude,
            altitude,
            reply,
        })
        .await
    }

    /// Start an unlock session against the current device.
    ///
    /// The outer error means the service is gone; the inner one is the
    /// engine's rejection.
    pub async fn start_unlock(
        &self,
        signed_token: &[u8],
    ) -> Result<Result<(), StartError>, ServiceError> {
        let token = Zeroizing::new(signed_token.to_vec());
        self.request(|reply| Command::StartUnlock(token, reply)).await
    }

    /// Abandon any unlock session. The deadline is disarmed when this returns.
    pub async fn reset_unlock(&self) -> Result<(), ServiceError> {
        self.request(Command::ResetUnlock).await
    }

    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<(), ServiceError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServiceError::Stopped)
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }
}

/// The service task.
pub struct CompanionService<L: Link, T: SecurityToken> {
    config: CompanionConfig,
    registry: DeviceRegistry<L>,
    engine: UnlockEngine<L>,
    token: Arc<T>,
    events: broadcast::Sender<ServiceEvent>,
    derived_tx: mpsc::UnboundedSender<Derived>,
}

impl<L, T> CompanionService<L, T>
where
    L: Link + 'static,
    T: SecurityToken + 'static,
{
    /// Validate `config` and spawn the service on the current runtime.
    pub fn spawn(
        config: CompanionConfig,
        link: Arc<L>,
        token: Arc<T>,
    ) -> Result<(CompanionHandle, JoinHandle<()>), ConfigError> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let (derived_tx, derived_rx) = mpsc::unbounded_channel();

        let service = Self {
            registry: DeviceRegistry::with_config(RegistryConfig::from(&config), link.clone()),
            engine: UnlockEngine::with_config(&config, link),
            config,
            token,
            events: event_tx.clone(),
            derived_tx,
        };

        let task = tokio::spawn(service.run(command_rx, derived_rx));
        let handle = CompanionHandle {
            commands: command_tx,
            events: event_tx,
        };
        Ok((handle, task))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut derived: mpsc::UnboundedReceiver<Derived>,
    ) {
        let period = self.config.heartbeat_check_interval();
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?period, "companion service started");

        loop {
            let deadline = self.engine.deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = sweep.tick() => {
                    self.registry.check_timeouts(now());
                    self.publish_registry_events();
                }
                Some((generation, result)) = derived.recv() => {
                    if let Some(event) = self.engine.on_key_derived(generation, result, now()) {
                        self.publish(ServiceEvent::Unlock(event));
                    }
                }
                _ = wait_for(deadline) => {
                    if let Some(event) = self.engine.poll_timeout(now()) {
                        self.publish(ServiceEvent::Unlock(event));
                    }
                }
            }
        }

        self.engine.reset();
        info!("companion service stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Heartbeat(id) => {
                self.registry.on_heartbeat(id, now());
                self.publish_registry_events();
            }
            Command::InfoResponse(id, info) => {
                self.registry.on_info_response(id, info);
                self.publish_registry_events();
            }
            Command::Tunnel(message) => self.handle_tunnel(&message),
            Command::SelectCurrent(id, reply) => {
                let selected = self.registry.select_current(id);
                self.publish_registry_events();
                let _ = reply.send(selected);
            }
            Command::CurrentDeviceId(reply) => {
                let _ = reply.send(self.registry.current_device_id());
            }
            Command::DeviceMetadata(id, reply) => {
                let _ = reply.send(self.registry.device_metadata(id));
            }
            Command::CurrentIsVendorModule(reply) => {
                let _ = reply.send(self.registry.current_is_vendor_module());
            }
            Command::UnlockState(reply) => {
                let _ = reply.send(self.engine.state());
            }
            Command::RebootAll(reply) => {
                let _ = reply.send(self.registry.reboot_all());
            }
            Command::PositionEstimate {
                latitude,
                longitude,
                altitude,
                reply,
            } => {
                let result = self
                    .registry
                    .send_position_estimate(latitude, longitude, altitude);
                let _ = reply.send(result);
            }
            Command::StartUnlock(token, reply) => {
                let current = self.registry.current_device();
                let result = self.engine.start(&token, current, now());
                if let Err(e) = &result {
                    debug!(error = %e, "unlock start rejected");
                }
                let _ = reply.send(result);
            }
            Command::ResetUnlock(reply) => {
                self.engine.reset();
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_tunnel(&mut self, message: &TunnelMessage) {
        match self.engine.handle_message(message) {
            UnlockStep::Ignored => {}
            UnlockStep::DeriveKey(request) => self.spawn_derivation(request),
            UnlockStep::Finished(event) => self.publish(ServiceEvent::Unlock(event)),
        }
    }

    fn spawn_derivation(&self, request: KeyRequest) {
        let token = self.token.clone();
        let results = self.derived_tx.clone();
        debug!(generation = request.generation, "dispatching key derivation");
        tokio::task::spawn_blocking(move || {
            let result = derive_unlock_key(token.as_ref(), &request);
            if results.send((request.generation, result)).is_err() {
                debug!("service gone before key derivation finished");
            }
        });
    }

    fn publish_registry_events(&mut self) {
        for event in self.registry.drain_events() {
            let changed_to = match event {
                RegistryEvent::CurrentChanged(id) => Some(id),
                _ => None,
            };
            self.publish(ServiceEvent::Registry(event));
            if let Some(id) = changed_to {
                if let Some(outcome) = self.engine.abandon_for_device_change() {
                    warn!(component_id = id, "current companion changed, unlock abandoned");
                    self.publish(ServiceEvent::Unlock(outcome));
                }
            }
        }
    }

    fn publish(&self, event: ServiceEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn wait_for(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => sleep_until(Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

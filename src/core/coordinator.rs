//! Multi-unit coordination
//!
//! Some instruments are really several devices sharing a deployment (a
//! profiler plus its helper subsystems, for instance). The coordinator
//! drives a set of units through their lifecycle in a declared order,
//! tags the samples they produce with the unit id, and issues serial
//! breaks with a pause between units.

use crate::core::sample::Sample;
use crate::core::session::{
    CommandRequest, InstrumentSession, Response, SessionBuilder, SessionError, SessionEvent,
};
use crate::core::state_machine::Token;
use crate::core::transport::{connect, TcpConfig};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};

/// Lifecycle commands fanned out to every unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleCommand {
    /// Open the connection
    Connect,
    /// Close the connection
    Disconnect,
    /// Reset the device
    Reset,
    /// Start sampling
    Start,
    /// Stop sampling
    Stop,
}

/// Coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// No unit with this id
    #[error("unknown unit {0:?}")]
    UnknownUnit(String),

    /// A unit id was registered twice
    #[error("duplicate unit {0:?}")]
    DuplicateUnit(String),

    /// A unit failed a command
    #[error("unit {unit}: {source}")]
    Unit {
        /// Unit id
        unit: String,
        /// What went wrong
        #[source]
        source: SessionError,
    },
}

/// One coordinated device
#[async_trait]
pub trait InstrumentUnit: Send + Sync {
    /// Unit id
    fn id(&self) -> &str;

    /// Apply a lifecycle command
    async fn command(&self, command: LifecycleCommand) -> Result<(), SessionError>;

    /// Send a device command
    async fn send(&self, request: CommandRequest) -> Result<Option<Response>, SessionError>;

    /// Send a serial break
    async fn send_break(&self, duration: Duration) -> Result<(), SessionError>;

    /// Event stream, once connected
    async fn subscribe(&self) -> Option<broadcast::Receiver<SessionEvent>>;
}

/// Per-command unit orders; `None` falls back to the declared order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderOverrides {
    /// Connect order
    pub connect: Option<Vec<String>>,
    /// Disconnect order
    pub disconnect: Option<Vec<String>>,
    /// Reset order
    pub reset: Option<Vec<String>>,
    /// Start order
    pub start: Option<Vec<String>>,
    /// Stop order
    pub stop: Option<Vec<String>>,
}

impl OrderOverrides {
    /// Override for `command`
    pub fn get(&self, command: LifecycleCommand) -> Option<&[String]> {
        match command {
            LifecycleCommand::Connect => self.connect.as_deref(),
            LifecycleCommand::Disconnect => self.disconnect.as_deref(),
            LifecycleCommand::Reset => self.reset.as_deref(),
            LifecycleCommand::Start => self.start.as_deref(),
            LifecycleCommand::Stop => self.stop.as_deref(),
        }
    }
}

/// Coordinator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Declared unit order
    pub order: Vec<String>,
    /// Per-command orders
    pub overrides: OrderOverrides,
    /// Pause between units during a coordinated break
    #[serde(with = "crate::core::transport::duration_ms")]
    pub break_delay: Duration,
    /// Break length
    #[serde(with = "crate::core::transport::duration_ms")]
    pub break_duration: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            overrides: OrderOverrides::default(),
            break_delay: Duration::from_millis(500),
            break_duration: Duration::from_millis(500),
        }
    }
}

/// A sample tagged with the unit that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedSample {
    /// Unit id
    pub unit: String,
    /// The sample
    pub sample: Sample,
}

/// Drives a set of units in a fixed order
pub struct MultiUnitCoordinator {
    settings: CoordinatorSettings,
    units: Vec<Arc<dyn InstrumentUnit>>,
}

impl MultiUnitCoordinator {
    /// Create an empty coordinator
    pub fn new(settings: CoordinatorSettings) -> Self {
        Self {
            settings,
            units: Vec::new(),
        }
    }

    /// Add a unit
    pub fn add_unit(&mut self, unit: Arc<dyn InstrumentUnit>) -> Result<(), CoordinatorError> {
        if self.unit(unit.id()).is_some() {
            return Err(CoordinatorError::DuplicateUnit(unit.id().to_string()));
        }
        tracing::debug!(unit = unit.id(), "unit added");
        self.units.push(unit);
        Ok(())
    }

    /// Look up a unit
    pub fn unit(&self, id: &str) -> Option<&Arc<dyn InstrumentUnit>> {
        self.units.iter().find(|u| u.id() == id)
    }

    /// Unit ids in insertion order
    pub fn unit_ids(&self) -> Vec<String> {
        self.units.iter().map(|u| u.id().to_string()).collect()
    }

    /// Settings
    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Order in which `command` visits the units: the command's override,
    /// else the declared order; units neither names follow in insertion
    /// order
    pub fn order_for(&self, command: LifecycleCommand) -> Result<Vec<String>, CoordinatorError> {
        self.resolve(self.settings.overrides.get(command).unwrap_or(self.settings.order.as_slice()))
    }

    fn resolve(&self, listed: &[String]) -> Result<Vec<String>, CoordinatorError> {
        let mut order: Vec<String> = Vec::with_capacity(self.units.len());
        for id in listed {
            if self.unit(id).is_none() {
                return Err(CoordinatorError::UnknownUnit(id.clone()));
            }
            if !order.contains(id) {
                order.push(id.clone());
            }
        }
        for unit in &self.units {
            if !order.iter().any(|id| id == unit.id()) {
                order.push(unit.id().to_string());
            }
        }
        Ok(order)
    }

    fn ordered_units(&self, order: Vec<String>) -> Result<Vec<Arc<dyn InstrumentUnit>>, CoordinatorError> {
        order
            .iter()
            .map(|id| self.unit(id).cloned().ok_or_else(|| CoordinatorError::UnknownUnit(id.clone())))
            .collect()
    }

    /// Apply `command` to each unit in order, stopping at the first failure
    pub async fn run(&self, command: LifecycleCommand) -> Result<(), CoordinatorError> {
        for unit in self.ordered_units(self.order_for(command)?)? {
            tracing::info!(unit = unit.id(), ?command, "lifecycle step");
            unit.command(command).await.map_err(|source| {
                tracing::warn!(unit = unit.id(), ?command, error = %source, "lifecycle step failed");
                CoordinatorError::Unit {
                    unit: unit.id().to_string(),
                    source,
                }
            })?;
        }
        Ok(())
    }

    /// Connect all units
    pub async fn connect(&self) -> Result<(), CoordinatorError> {
        self.run(LifecycleCommand::Connect).await
    }

    /// Disconnect all units
    pub async fn disconnect(&self) -> Result<(), CoordinatorError> {
        self.run(LifecycleCommand::Disconnect).await
    }

    /// Reset all units
    pub async fn reset(&self) -> Result<(), CoordinatorError> {
        self.run(LifecycleCommand::Reset).await
    }

    /// Start all units
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        self.run(LifecycleCommand::Start).await
    }

    /// Stop all units
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        self.run(LifecycleCommand::Stop).await
    }

    /// Send a break to every unit in declared order, pausing between units
    pub async fn coordinated_break(&self) -> Result<(), CoordinatorError> {
        let units = self.ordered_units(self.resolve(&self.settings.order)?)?;
        for (i, unit) in units.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.break_delay).await;
            }
            tracing::info!(unit = unit.id(), duration = ?self.settings.break_duration, "coordinated break");
            unit.send_break(self.settings.break_duration)
                .await
                .map_err(|source| CoordinatorError::Unit {
                    unit: unit.id().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Send the same command to every unit concurrently
    pub async fn broadcast_command(
        &self,
        request: CommandRequest,
    ) -> Vec<(String, Result<Option<Response>, SessionError>)> {
        let sends = self.units.iter().map(|unit| {
            let request = request.clone();
            async move { (unit.id().to_string(), unit.send(request).await) }
        });
        join_all(sends).await
    }

    /// Forward every unit's samples, tagged with the unit id, into one
    /// channel. Units that are not connected yet are skipped.
    pub async fn forward_samples(&self, capacity: usize) -> mpsc::Receiver<TaggedSample> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        for unit in &self.units {
            let Some(mut events) = unit.subscribe().await else {
                tracing::debug!(unit = unit.id(), "unit not connected; no samples forwarded");
                continue;
            };
            let tx = tx.clone();
            let id = unit.id().to_string();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(SessionEvent::Sample(sample)) => {
                            let tagged = TaggedSample {
                                unit: id.clone(),
                                sample,
                            };
                            if tx.send(tagged).await.is_err() {
                                break;
                            }
                        }
                        Ok(SessionEvent::Closed(_)) | Err(broadcast::error::RecvError::Closed) => break,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(unit = %id, skipped = n, "sample forwarder lagged");
                        }
                    }
                }
            });
        }
        rx
    }
}

/// Builds a fresh session description for each connect
pub type SessionFactory<S, E, C> = Box<dyn Fn() -> SessionBuilder<S, E, C> + Send + Sync>;

/// A unit backed by a port-agent TCP connection and an [`InstrumentSession`].
///
/// Lifecycle commands other than connect and disconnect are mapped to
/// state machine events.
pub struct SessionUnit<S, E, C> {
    id: String,
    tcp: TcpConfig,
    factory: SessionFactory<S, E, C>,
    events: HashMap<LifecycleCommand, E>,
    session: RwLock<Option<Arc<InstrumentSession<S, E, C>>>>,
}

impl<S: Token + Sync, E: Token + Sync, C: Send + 'static> SessionUnit<S, E, C> {
    /// New disconnected unit
    pub fn new<F>(id: &str, tcp: TcpConfig, factory: F) -> Self
    where
        F: Fn() -> SessionBuilder<S, E, C> + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            tcp,
            factory: Box::new(factory),
            events: HashMap::new(),
            session: RwLock::new(None),
        }
    }

    /// Map a lifecycle command to a state machine event
    #[must_use]
    pub fn on(mut self, command: LifecycleCommand, event: E) -> Self {
        self.events.insert(command, event);
        self
    }

    /// The live session, if connected
    pub async fn session(&self) -> Option<Arc<InstrumentSession<S, E, C>>> {
        self.session.read().await.clone()
    }

    async fn live(&self) -> Result<Arc<InstrumentSession<S, E, C>>, SessionError> {
        self.session().await.ok_or(SessionError::NotConnected)
    }
}

#[async_trait]
impl<S: Token + Sync, E: Token + Sync, C: Send + 'static> InstrumentUnit for SessionUnit<S, E, C> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn command(&self, command: LifecycleCommand) -> Result<(), SessionError> {
        match command {
            LifecycleCommand::Connect => {
                let mut slot = self.session.write().await;
                if slot.as_ref().is_some_and(|s| !s.is_closed()) {
                    return Ok(());
                }
                let stream = connect(&self.tcp).await?;
                let session = (self.factory)().start(stream)?;
                *slot = Some(Arc::new(session));
                Ok(())
            }
            LifecycleCommand::Disconnect => {
                let session = self.session.write().await.take();
                if let Some(session) = session {
                    session.disconnect().await;
                }
                Ok(())
            }
            other => {
                let event = *self
                    .events
                    .get(&other)
                    .ok_or_else(|| SessionError::Unsupported(format!("{:?} has no event mapping", other)))?;
                self.live().await?.dispatch(event, serde_json::Value::Null).await?;
                Ok(())
            }
        }
    }

    async fn send(&self, request: CommandRequest) -> Result<Option<Response>, SessionError> {
        self.live().await?.send(request).await
    }

    async fn send_break(&self, duration: Duration) -> Result<(), SessionError> {
        self.live().await?.send_break(duration).await
    }

    async fn subscribe(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        self.session().await.map(|s| s.subscribe())
    }
}

//! The hub: composition root for the registry, tracked set, route table and
//! handshake handling. One instance is built at startup and shared through `Arc`.
use std::{
    collections::HashMap,
    ops::RangeInclusive,
    sync::{Arc, Mutex},
};

use chrono::Utc;

use crate::{
    config::models::HubConfig,
    core::{
        error::HandshakeError,
        module::ModuleRecord,
        registry::ModuleRegistry,
        route_table::RouteTable,
        tracked::TrackedSet,
    },
    ports::persistence::PersistenceHook,
    protocol::{
        messages::{EnvelopeHeader, HandshakeRequest, HandshakeResponse, MessageKind},
        secret::{IdentityToken, SecretToken},
    },
};

/// Which module holds which port.
#[derive(Debug)]
pub struct PortLedger {
    range: RangeInclusive<u16>,
    owners: Mutex<HashMap<u16, String>>,
}

impl PortLedger {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a statically configured port.
    pub fn reserve(&self, port: u16, module: &str) {
        let mut owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());
        owners.insert(port, module.to_string());
    }

    /// Pick a port for `module`: its configured port, else the requested one if no
    /// other module holds it, else the port it already holds, else the lowest free
    /// port in range.
    pub fn assign(&self, module: &str, configured: u16, requested: Option<u16>) -> Option<u16> {
        let mut owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());

        if configured != 0 {
            owners.insert(configured, module.to_string());
            return Some(configured);
        }

        let (held, port) = {
            let view: &HashMap<u16, String> = &owners;
            let free_for = |port: u16| view.get(&port).is_none_or(|owner| owner == module);
            let held = view
                .iter()
                .find(|(_, owner)| owner.as_str() == module)
                .map(|(port, _)| *port);
            let port = match requested {
                Some(port) if free_for(port) => Some(port),
                _ => held.or_else(|| self.range.clone().find(|p| free_for(*p))),
            };
            (held, port?)
        };

        if let Some(previous) = held.filter(|p| *p != port) {
            owners.remove(&previous);
        }
        owners.insert(port, module.to_string());
        Some(port)
    }

    pub fn owner(&self, port: u16) -> Option<String> {
        let owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());
        owners.get(&port).cloned()
    }
}

pub struct Hub {
    config: Arc<HubConfig>,
    secret: SecretToken,
    registry: ModuleRegistry,
    tracked: TrackedSet,
    routes: RouteTable,
    ports: PortLedger,
    persistence: Arc<dyn PersistenceHook>,
}

impl Hub {
    /// Seed the registry and route table from static configuration.
    pub async fn new(
        config: Arc<HubConfig>,
        secret: SecretToken,
        persistence: Arc<dyn PersistenceHook>,
    ) -> Self {
        let registry = ModuleRegistry::new();
        let ports = PortLedger::new(
            config.protocol.port_range_start..=config.protocol.port_range_end,
        );

        let mut records: Vec<ModuleRecord> = config
            .modules
            .iter()
            .map(|(name, module)| ModuleRecord::from_config(name.clone(), module))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));

        let routes = RouteTable::build(records.iter());
        for record in records {
            if record.binding.port != 0 {
                ports.reserve(record.binding.port, &record.name);
            }
            registry.insert(record).await;
        }

        tracing::info!(
            "Hub '{}' initialized with {} configured modules and {} routes",
            config.name,
            registry.len(),
            routes.len()
        );

        Self {
            config,
            secret,
            registry,
            tracked: TrackedSet::new(),
            routes,
            ports,
            persistence,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn secret(&self) -> &SecretToken {
        &self.secret
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn tracked(&self) -> &TrackedSet {
        &self.tracked
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn ports(&self) -> &PortLedger {
        &self.ports
    }

    pub fn module_identity(&self, name: &str) -> IdentityToken {
        self.secret.identity_for(name)
    }

    /// Forward a published record to the persistence hook.
    pub fn persist(&self, record: &ModuleRecord) {
        self.persistence.persist(record);
    }

    pub fn loading_timeout(&self) -> Option<chrono::Duration> {
        match self.config.supervisor.loading_timeout_ms {
            0 => None,
            ms => i64::try_from(ms).ok().map(chrono::Duration::milliseconds),
        }
    }

    /// Authenticate and apply a module's registration.
    ///
    /// The token is checked on the envelope header before the payload is decoded, so a
    /// wrong token is rejected whatever the rest of the body contains.
    pub async fn handle_handshake(&self, body: &[u8]) -> Result<HandshakeResponse, HandshakeError> {
        let header =
            EnvelopeHeader::decode(body).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        if !self.secret.matches(&header.hash) {
            tracing::warn!("Handshake rejected: token mismatch");
            return Err(HandshakeError::AuthMismatch);
        }
        header
            .expect(MessageKind::Handshake)
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;

        let request =
            HandshakeRequest::decode(body).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(HandshakeError::Malformed("empty module name".to_string()));
        }

        let identity = self.module_identity(&name);
        let guard = self
            .registry
            .lock_or_insert_with(&name, || {
                tracing::info!("Registering unconfigured module '{}'", name);
                ModuleRecord::dynamic(name.clone(), &self.config.protocol)
            })
            .await;

        let current = guard.record();
        if let Some(existing) = current.secret_hash() {
            if !identity.matches(existing) {
                tracing::warn!("Handshake from '{}' rejected: identity changed", name);
                return Err(HandshakeError::IdentityConflict(name));
            }
        }

        let port = self
            .ports
            .assign(&name, current.binding.port, request.requested_port())
            .ok_or_else(|| HandshakeError::NoPortAvailable(name.clone()))?;

        let (_, record) = guard.update(|r| {
            r.accept_handshake(
                identity.into_string(),
                port,
                request.pid,
                request.commands.clone(),
                Utc::now(),
            )
        });
        drop(guard);

        self.tracked.add(&name);
        self.persist(&record);
        tracing::info!(
            module = %name,
            port,
            pid = request.pid,
            "Handshake accepted, module is loading"
        );

        Ok(HandshakeResponse::accepted(port))
    }
}

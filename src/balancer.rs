use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

/// A backend with a live connection count.
#[derive(Debug)]
pub struct Server {
    pub id: String,
    pub address: String,
    active: AtomicUsize,
    healthy: AtomicBool,
}

impl Server {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            active: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn connect(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns false if there was nothing to release.
    fn release(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) active={} {}",
            self.id,
            self.address,
            self.active_connections(),
            if self.is_healthy() { "healthy" } else { "down" }
        )
    }
}

/// Picks one server out of a non-empty healthy set.
pub trait BalancingStrategy: Send + Sync {
    fn select<'a>(&self, healthy: &'a [Arc<Server>]) -> Option<&'a Arc<Server>>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl BalancingStrategy for RoundRobin {
    fn select<'a>(&self, healthy: &'a [Arc<Server>]) -> Option<&'a Arc<Server>> {
        if healthy.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        healthy.get(i % healthy.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Fewest active connections; ties go to the earliest server.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl BalancingStrategy for LeastConnections {
    fn select<'a>(&self, healthy: &'a [Arc<Server>]) -> Option<&'a Arc<Server>> {
        let mut best: Option<(&Arc<Server>, usize)> = None;
        for server in healthy {
            let n = server.active_connections();
            if best.is_none_or(|(_, min)| n < min) {
                best = Some((server, n));
            }
        }
        best.map(|(s, _)| s)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalancerError {
    UnknownServer(String),
    DuplicateServer(String),
}

impl std::fmt::Display for BalancerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalancerError::UnknownServer(id) => write!(f, "unknown server: {id}"),
            BalancerError::DuplicateServer(id) => write!(f, "server already registered: {id}"),
        }
    }
}

impl std::error::Error for BalancerError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub id: String,
    pub address: String,
    pub active_connections: usize,
    pub healthy: bool,
}

pub struct LoadBalancer {
    servers: RwLock<Vec<Arc<Server>>>,
    strategy: RwLock<Arc<dyn BalancingStrategy>>,
}

impl LoadBalancer {
    pub fn new(strategy: Arc<dyn BalancingStrategy>) -> Self {
        Self {
            servers: RwLock::new(Vec::new()),
            strategy: RwLock::new(strategy),
        }
    }

    pub fn add_server(&self, server: Server) -> Result<Arc<Server>, BalancerError> {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        if servers.iter().any(|s| s.id == server.id) {
            return Err(BalancerError::DuplicateServer(server.id));
        }
        info!(server = %server.id, address = %server.address, "server added");
        let server = Arc::new(server);
        servers.push(server.clone());
        Ok(server)
    }

    /// In-flight requests on the removed server are simply forgotten.
    pub fn remove_server(&self, server_id: &str) -> Result<(), BalancerError> {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        let before = servers.len();
        servers.retain(|s| s.id != server_id);
        if servers.len() == before {
            return Err(BalancerError::UnknownServer(server_id.to_string()));
        }
        info!(server = server_id, "server removed");
        Ok(())
    }

    pub fn set_strategy(&self, strategy: Arc<dyn BalancingStrategy>) {
        info!(strategy = strategy.name(), "balancing strategy changed");
        *self.strategy.write().unwrap_or_else(PoisonError::into_inner) = strategy;
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name()
    }

    pub fn set_healthy(&self, server_id: &str, healthy: bool) -> Result<(), BalancerError> {
        let server = self.server(server_id)?;
        if server.healthy.swap(healthy, Ordering::AcqRel) != healthy {
            info!(server = server_id, healthy, "server health changed");
        }
        Ok(())
    }

    fn server(&self, server_id: &str) -> Result<Arc<Server>, BalancerError> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| s.id == server_id)
            .cloned()
            .ok_or_else(|| BalancerError::UnknownServer(server_id.to_string()))
    }

    /// Pick a healthy server and count the request against it. `None` when
    /// every server is down.
    pub fn route(&self, request_id: &str) -> Option<Arc<Server>> {
        let healthy: Vec<Arc<Server>> = self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.is_healthy())
            .cloned()
            .collect();
        let strategy = self
            .strategy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(server) = strategy.select(&healthy).cloned() else {
            metrics::counter!(crate::observability::ROUTES_UNAVAILABLE_TOTAL).increment(1);
            warn!(request_id, "no healthy servers");
            return None;
        };
        server.connect();
        metrics::counter!(crate::observability::ROUTES_TOTAL, "strategy" => strategy.name())
            .increment(1);
        debug!(request_id, server = %server.id, strategy = strategy.name(), "routed");
        Some(server)
    }

    /// Release one connection on `server_id`. Never drops below zero.
    pub fn complete(&self, server_id: &str) -> Result<(), BalancerError> {
        let server = self.server(server_id)?;
        if !server.release() {
            debug!(server = server_id, "complete with no active connections");
        }
        Ok(())
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| ServerStatus {
                id: s.id.clone(),
                address: s.address.clone(),
                active_connections: s.active_connections(),
                healthy: s.is_healthy(),
            })
            .collect()
    }
}

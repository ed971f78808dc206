use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::server::ServerId;
use crate::server::supervisor::{ServerSupervisor, SupervisorContext};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Supervisors of every managed server, keyed by id.
///
/// Built once when the runner starts and shared with the scheduler, the
/// command queue and the realtime loop.
pub struct ServerRegistry {
    supervisors: RwLock<HashMap<ServerId, Arc<ServerSupervisor>>>,
    ctx: SupervisorContext,
}

impl ServerRegistry {
    pub fn new(ctx: SupervisorContext) -> Self {
        Self {
            supervisors: RwLock::new(HashMap::new()),
            ctx,
        }
    }

    /// Creates and registers a supervisor. Fails if the id is taken.
    pub fn register(&self, config: ServerConfig) -> Result<Arc<ServerSupervisor>> {
        let mut supervisors = self
            .supervisors
            .write()
            .map_err(|_| Error::Other("Failed to lock server registry".to_string()))?;

        if supervisors.contains_key(&config.id) {
            return Err(Error::ConfigInvalid(format!(
                "Server id {} is already registered",
                config.id
            )));
        }

        let id = config.id;
        let supervisor = ServerSupervisor::new(config, self.ctx.clone());
        supervisors.insert(id, supervisor.clone());
        tracing::debug!(server_id = %id, "Registered server");
        Ok(supervisor)
    }

    /// Removes a supervisor. The server must already be stopped.
    pub fn unregister(&self, id: ServerId) -> Option<Arc<ServerSupervisor>> {
        self.supervisors.write().ok()?.remove(&id)
    }

    pub fn get(&self, id: ServerId) -> Result<Arc<ServerSupervisor>> {
        self.supervisors
            .read()
            .map_err(|_| Error::Other("Failed to lock server registry".to_string()))?
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))
    }

    /// Every supervisor, ordered by id.
    pub fn all(&self) -> Vec<Arc<ServerSupervisor>> {
        let mut all: Vec<_> = self
            .supervisors
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by_key(|s| s.id());
        all
    }

    pub fn ids(&self) -> Vec<ServerId> {
        self.all().iter().map(|s| s.id()).collect()
    }

    pub fn context(&self) -> &SupervisorContext {
        &self.ctx
    }
}

use crate::error::{Error, Result};
use crate::server::{ServerId, ServerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const MAX_EVENTS: usize = 1000;

/// Server lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerLifecycleEvent {
    /// Server started
    Started,
    /// Server stopped on request or exited cleanly
    Stopped,
    /// Server exited unexpectedly
    Crashed,
    /// Server was restarted after a crash
    Restarted,
    /// Crash recovery gave up
    GaveUp,
    /// Server was force-killed
    Killed,
}

impl ServerLifecycleEvent {
    fn status(self) -> ServerStatus {
        match self {
            ServerLifecycleEvent::Started | ServerLifecycleEvent::Restarted => ServerStatus::Running,
            ServerLifecycleEvent::Stopped | ServerLifecycleEvent::Killed => ServerStatus::Stopped,
            ServerLifecycleEvent::Crashed | ServerLifecycleEvent::GaveUp => ServerStatus::Crashed,
        }
    }
}

/// Server lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Server ID
    pub id: ServerId,
    /// Server name
    pub name: String,
    /// Event type
    pub event: ServerLifecycleEvent,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Event details
    pub details: Option<String>,
}

/// Records lifecycle events of every server and the status they imply.
pub struct ServerLifecycleManager {
    events: Mutex<VecDeque<ServerEvent>>,
    statuses: Mutex<HashMap<ServerId, ServerStatus>>,
}

impl ServerLifecycleManager {
    /// Create a new server lifecycle manager
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Record a server event
    pub fn record_event(
        &self,
        id: ServerId,
        name: String,
        event: ServerLifecycleEvent,
        details: Option<String>,
    ) -> Result<()> {
        tracing::debug!(server_id = %id, event = ?event, details = ?details, "Lifecycle event");

        {
            let mut statuses = self
                .statuses
                .lock()
                .map_err(|_| Error::Other("Failed to lock server statuses".to_string()))?;
            statuses.insert(id, event.status());
        }

        let mut events = self
            .events
            .lock()
            .map_err(|_| Error::Other("Failed to lock server events".to_string()))?;
        events.push_back(ServerEvent {
            id,
            name,
            event,
            timestamp: Utc::now(),
            details,
        });
        if events.len() > MAX_EVENTS {
            events.pop_front();
        }

        Ok(())
    }

    /// Status implied by the last recorded event
    pub fn get_status(&self, id: ServerId) -> Result<ServerStatus> {
        let statuses = self
            .statuses
            .lock()
            .map_err(|_| Error::Other("Failed to lock server statuses".to_string()))?;

        statuses
            .get(&id)
            .copied()
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))
    }

    /// Get recent events for a server, newest first
    pub fn get_server_events(&self, id: ServerId, limit: Option<usize>) -> Result<Vec<ServerEvent>> {
        let events = self
            .events
            .lock()
            .map_err(|_| Error::Other("Failed to lock server events".to_string()))?;

        let server_events = events.iter().rev().filter(|e| e.id == id).cloned();
        Ok(match limit {
            Some(limit) => server_events.take(limit).collect(),
            None => server_events.collect(),
        })
    }

    /// Get all events, newest first
    pub fn get_all_events(&self, limit: Option<usize>) -> Result<Vec<ServerEvent>> {
        let events = self
            .events
            .lock()
            .map_err(|_| Error::Other("Failed to lock server events".to_string()))?;

        let all_events = events.iter().rev().cloned();
        Ok(match limit {
            Some(limit) => all_events.take(limit).collect(),
            None => all_events.collect(),
        })
    }
}

impl Default for ServerLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

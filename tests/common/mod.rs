#![allow(dead_code)]

use game_runner::broadcast::{Audience, BroadcastMessage, Broadcaster, Subscriber, Topic, UserId};
use game_runner::config::{ServerConfig, Settings};
use game_runner::error::{Error, Result};
use game_runner::server::{
    Downloader, ServerId, ServerLifecycleManager, ServerRegistry, SupervisorContext,
};
use game_runner::stats::StatsCollector;
use game_runner::store::MemoryStore;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Broadcaster that keeps every published message.
#[derive(Default)]
pub struct RecordingBroadcaster {
    messages: Mutex<Vec<BroadcastMessage>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user_id: UserId, servers: Vec<ServerId>) {
        self.subscribers.lock().unwrap().push(Subscriber {
            user_id,
            authorized_servers: servers,
        });
    }

    pub fn messages(&self) -> Vec<BroadcastMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.event).collect()
    }

    pub fn user_events(&self, user_id: UserId) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.audience == Audience::User(user_id))
            .map(|m| m.event)
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }

    fn record(&self, audience: Audience, event: &str, payload: Value) {
        self.messages.lock().unwrap().push(BroadcastMessage {
            audience,
            event: event.to_string(),
            payload,
        });
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    fn subscribers(&self) -> Vec<Subscriber> {
        self.subscribers.lock().unwrap().clone()
    }

    fn server_users(&self, server_id: ServerId) -> Vec<UserId> {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.authorized_servers.contains(&server_id))
            .map(|s| s.user_id)
            .collect()
    }

    fn publish_to_topic(&self, topic: Topic, event: &str, payload: Value) {
        self.record(Audience::Topic(topic), event, payload);
    }

    fn publish_to_user(&self, user_id: UserId, event: &str, payload: Value) {
        self.record(Audience::User(user_id), event, payload);
    }
}

/// Downloader that always fails.
pub struct OfflineDownloader;

#[async_trait::async_trait]
impl Downloader for OfflineDownloader {
    async fn download(&self, url: &str, _dest: &Path) -> Result<()> {
        Err(Error::Update(format!("offline, cannot fetch {}", url)))
    }
}

/// Settings with short timings.
pub fn fast_settings() -> Settings {
    Settings {
        stop_poll_interval_ms: 100,
        stop_max_polls: 20,
        restart_settle_ms: 100,
        backup_progress_interval_ms: 50,
        crash_check_interval_secs: 3600,
        stats_poll_interval_secs: 3600,
        ..Settings::default()
    }
}

/// Creates a server directory with an executable and an accepted license.
pub fn server_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("server.jar"), b"jar").unwrap();
    std::fs::write(dir.path().join("eula.txt"), b"eula=true\n").unwrap();
    dir
}

/// A server whose launch command runs `script` in a shell.
pub fn shell_server(id: i64, dir: &Path, script: &str) -> ServerConfig {
    ServerConfig::new(
        id,
        format!("server-{}", id),
        dir,
        "server.jar",
        format!("sh -c '{}'", script),
    )
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub registry: Arc<ServerRegistry>,
}

pub fn fixture(servers: Vec<ServerConfig>) -> Fixture {
    fixture_with(servers, Arc::new(OfflineDownloader))
}

pub fn fixture_with(servers: Vec<ServerConfig>, downloader: Arc<dyn Downloader>) -> Fixture {
    fixture_with_settings(servers, downloader, fast_settings())
}

pub fn fixture_with_settings(
    servers: Vec<ServerConfig>,
    downloader: Arc<dyn Downloader>,
    settings: Settings,
) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let ctx = SupervisorContext {
        settings: Arc::new(settings),
        store: store.clone(),
        broadcaster: broadcaster.clone(),
        stats: Arc::new(StatsCollector::with_ping_settings(
            Duration::from_secs(10),
            Duration::from_millis(200),
        )),
        downloader,
        lifecycle: Arc::new(ServerLifecycleManager::new()),
    };
    let registry = Arc::new(ServerRegistry::new(ctx));
    for server in servers {
        store.insert_server(server.clone());
        registry.register(server).unwrap();
    }
    Fixture {
        store,
        broadcaster,
        registry,
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

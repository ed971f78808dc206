use game_runner::broadcast::{Audience, Hub, Subscriber};
use game_runner::error::Result;
use game_runner::server::HttpDownloader;
use game_runner::tasks::{IntervalSpec, IntervalUnit, NoopMaintenance};
use game_runner::{
    CommandAction, GameRunner, Issuer, JobSpec, MemoryStore, RunnerConfig, ServerId, Trigger,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    // `RUST_LOG=game_runner=debug` shows the supervisor at work.
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    tracing::info!("Starting supervise demo");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/runner.json".to_string());
    let config = RunnerConfig::from_file(&config_path)?;
    let server_ids: Vec<ServerId> = config.servers.iter().map(|s| s.id).collect();

    // Keep a handle on the hub so we can subscribe to it.
    let hub = Arc::new(Hub::default());
    let store = Arc::new(MemoryStore::from_config(&config));
    let runner = GameRunner::connect(
        config,
        store,
        hub.clone(),
        Arc::new(HttpDownloader::new()),
        Arc::new(NoopMaintenance),
    )?;

    let mut messages = hub.register(Subscriber {
        user_id: 1,
        authorized_servers: server_ids.clone(),
    });
    tokio::spawn(async move {
        while let Ok(message) = messages.recv().await {
            match message.audience {
                Audience::Topic(topic) if message.event == "vterm_new_line" => {
                    println!("[{}] {}", topic, message.payload["line"]);
                }
                _ => println!("<{}> {}", message.event, message.payload),
            }
        }
    });

    runner.start().await?;

    for id in &server_ids {
        println!("Queueing start of server {}", id);
        runner
            .enqueue(*id, Issuer::User(1), CommandAction::StartServer)
            .await?;

        // Nightly backup at 04:00.
        let task = runner
            .schedule_job(JobSpec {
                target_id: *id,
                action: CommandAction::BackupServer,
                trigger: Trigger::Interval(IntervalSpec {
                    unit: IntervalUnit::Days,
                    every: 1,
                    at_time: Some("04:00".to_string()),
                }),
                enabled: true,
                one_time: false,
            })
            .await?;
        println!(
            "Next backups: {:?}",
            runner.scheduler().upcoming(task.id, 3)
        );
    }

    tokio::time::sleep(Duration::from_secs(30)).await;

    for status in runner.server_statuses().await {
        println!(
            "{} ({}) status={:?} pid={:?} restarts={}",
            status.name, status.id, status.status, status.pid, status.restart_count
        );
    }

    println!("Shutting down");
    runner.shutdown().await?;
    Ok(())
}

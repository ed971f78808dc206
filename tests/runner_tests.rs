mod common;

use common::{fixture, server_dir, shell_server};
use game_runner::error::Error;
use game_runner::server::ServerStatus;
use game_runner::stats::StatsCollector;
use game_runner::tasks::RealtimeLoop;
use game_runner::{CommandAction, GameRunner, Issuer, JobSpec, ServerId, Trigger};
use std::sync::Arc;

const CONFIG: &str = r#"{
    "settings": { "commandPollIntervalMs": 50 },
    "servers": [
        {
            "id": 1,
            "name": "lobby",
            "path": "/srv/lobby",
            "executable": "server.jar",
            "executionCommand": "java -jar server.jar nogui"
        },
        {
            "id": 2,
            "name": "survival",
            "path": "/srv/survival",
            "executable": "server.jar",
            "executionCommand": "java -jar server.jar nogui"
        }
    ]
}"#;

#[tokio::test]
async fn test_runner_lifecycle() {
    let runner = GameRunner::from_config_str(CONFIG).unwrap();
    runner.start().await.unwrap();

    let statuses = runner.server_statuses().await;
    let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["lobby", "survival"]);
    assert!(statuses.iter().all(|s| s.status == ServerStatus::Stopped && !s.running));

    assert!(matches!(runner.supervisor(ServerId(3)), Err(Error::ServerNotFound(_))));
    assert!(matches!(
        runner
            .enqueue(ServerId(3), Issuer::System, CommandAction::StartServer)
            .await,
        Err(Error::ServerNotFound(_))
    ));

    let task = runner
        .schedule_job(JobSpec {
            target_id: ServerId(2),
            action: CommandAction::BackupServer,
            trigger: Trigger::Cron("0 4 * * *".to_string()),
            enabled: true,
            one_time: false,
        })
        .await
        .unwrap();
    assert!(runner.scheduler().is_registered(task.id));

    runner.shutdown().await.unwrap();
    assert!(!runner.scheduler().is_registered(task.id));
}

#[tokio::test]
async fn test_runner_rejects_duplicate_ids() {
    let config = CONFIG.replace("\"id\": 2", "\"id\": 1");
    assert!(matches!(
        GameRunner::from_config_str(&config),
        Err(Error::ConfigInvalid(_))
    ));
}

#[tokio::test]
async fn test_realtime_tick_needs_subscribers() {
    let dir = server_dir();
    let fx = fixture(vec![
        shell_server(1, dir.path(), "sleep 30"),
        shell_server(2, dir.path(), "sleep 30"),
    ]);
    let realtime = RealtimeLoop::new(
        fx.registry.clone(),
        fx.broadcaster.clone(),
        Arc::new(StatsCollector::new()),
    );

    let idle = realtime.tick().await;
    assert!(!idle.host_published);
    assert_eq!(idle.users_updated, 0);
    assert!(fx.broadcaster.messages().is_empty());

    fx.broadcaster.subscribe(10, vec![ServerId(2)]);
    let report = realtime.tick().await;
    assert!(report.host_published);
    assert_eq!(report.users_updated, 1);
    assert_eq!(
        fx.broadcaster.user_events(10),
        vec!["update_server_details", "update_server_status"]
    );

    let details = fx
        .broadcaster
        .messages()
        .into_iter()
        .find(|m| m.event == "update_server_details")
        .unwrap();
    assert_eq!(details.payload["id"], 2);
    assert_eq!(details.payload["running"], false);
    assert_eq!(details.payload["stats"]["ping"]["status"], "unreachable");
}

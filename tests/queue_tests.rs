#![cfg(unix)]

mod common;

use common::{fixture, server_dir, shell_server};
use game_runner::server::{Issuer, ServerId};
use game_runner::store::Store;
use game_runner::tasks::{CommandAction, CommandQueue};

#[tokio::test]
async fn test_stop_then_start_runs_in_order() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(7, dir.path(), "sleep 30")]);
    let queue = CommandQueue::new(fx.store.clone(), fx.registry.clone());

    let stop = queue
        .enqueue(ServerId(7), Issuer::User(1), CommandAction::StopServer)
        .await
        .unwrap();
    let start = queue
        .enqueue(ServerId(7), Issuer::System, CommandAction::StartServer)
        .await
        .unwrap();

    let processed = queue.drain_once().await.unwrap();
    assert_eq!(processed, vec![stop.id, start.id]);

    let server = fx.registry.get(ServerId(7)).unwrap();
    assert!(server.is_running().await);
    assert!(fx.store.command(stop.id).await.unwrap().unwrap().completed);
    assert!(fx.store.command(start.id).await.unwrap().unwrap().completed);
    assert!(fx.store.pending_commands().await.unwrap().is_empty());

    server.stop(Issuer::System).await.unwrap();
}

#[tokio::test]
async fn test_failed_and_unknown_targets_are_still_completed() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "sleep 30")]);
    let queue = CommandQueue::new(fx.store.clone(), fx.registry.clone());

    let unknown = queue
        .enqueue(ServerId(99), Issuer::System, CommandAction::StartServer)
        .await
        .unwrap();
    // Console command to a stopped server fails.
    let console = queue
        .enqueue(ServerId(1), Issuer::User(2), CommandAction::parse("say hi"))
        .await
        .unwrap();

    let processed = queue.drain_once().await.unwrap();
    assert_eq!(processed, vec![unknown.id, console.id]);
    assert!(fx.store.pending_commands().await.unwrap().is_empty());

    // Nothing left to do on the next cycle.
    assert!(queue.drain_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_restart_command_starts_stopped_server() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "sleep 30")]);
    let queue = CommandQueue::new(fx.store.clone(), fx.registry.clone());

    queue
        .enqueue(ServerId(1), Issuer::System, CommandAction::RestartServer)
        .await
        .unwrap();
    queue.drain_once().await.unwrap();

    let server = fx.registry.get(ServerId(1)).unwrap();
    assert!(server.is_running().await);
    server.stop(Issuer::System).await.unwrap();
}

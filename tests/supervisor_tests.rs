#![cfg(unix)]

mod common;

use common::{OfflineDownloader, eventually, fast_settings, fixture, fixture_with_settings, server_dir, shell_server};
use game_runner::error::{Error, StartupError};
use game_runner::server::{CrashCheck, Issuer, ServerId, ServerLifecycleEvent, ServerStatus};
use game_runner::store::Store;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_start_then_stop() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "sleep 30")]);
    fx.broadcaster.subscribe(5, vec![ServerId(1)]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    server.start(Issuer::User(5)).await.unwrap();
    assert!(server.is_running().await);
    assert_eq!(server.status().await, ServerStatus::Running);
    assert!(server.pid().await.is_some());

    let again = server.start(Issuer::User(5)).await;
    assert!(matches!(again, Err(Error::Startup(StartupError::AlreadyRunning))));

    server.stop(Issuer::User(5)).await.unwrap();
    assert!(!server.is_running().await);
    assert_eq!(server.status().await, ServerStatus::Stopped);
    assert_eq!(server.pid().await, None);

    let events: Vec<_> = server.events(None).unwrap().into_iter().map(|e| e.event).collect();
    assert_eq!(events, vec![ServerLifecycleEvent::Stopped, ServerLifecycleEvent::Started]);
    assert!(fx.broadcaster.user_events(5).contains(&"send_start_reload".to_string()));
}

#[tokio::test]
async fn test_stop_when_not_running_is_noop() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "sleep 30")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    server.stop(Issuer::System).await.unwrap();
    assert_eq!(server.status().await, ServerStatus::Stopped);
    assert!(server.events(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_command_exits_gracefully() {
    let dir = server_dir();
    let mut config = shell_server(1, dir.path(), "read line; exit 0");
    config.stop_command = Some("stop".to_string());
    let fx = fixture(vec![config]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    server.start(Issuer::System).await.unwrap();
    server.stop(Issuer::System).await.unwrap();

    let snapshot = server.snapshot().await;
    assert!(!snapshot.running);
    assert_eq!(snapshot.last_exit_code, Some(0));
}

#[tokio::test]
async fn test_restart_replaces_process() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "sleep 30")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    server.start(Issuer::System).await.unwrap();
    let first = server.pid().await.unwrap();
    server.restart(Issuer::System).await.unwrap();
    let second = server.pid().await.unwrap();

    assert_ne!(first, second);
    assert!(server.is_running().await);
    server.stop(Issuer::System).await.unwrap();
}

#[tokio::test]
async fn test_kill_process_tree() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "sleep 30 & sleep 30")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    assert!(matches!(server.kill().await, Err(Error::NotRunning)));

    server.start(Issuer::System).await.unwrap();
    server.kill().await.unwrap();
    assert!(!server.is_running().await);
    let latest = server.events(Some(1)).unwrap();
    assert_eq!(latest[0].event, ServerLifecycleEvent::Killed);
}

#[tokio::test]
async fn test_crash_restarts_are_bounded() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "exit 3")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    server.start(Issuer::System).await.unwrap();

    for attempt in 1..=4 {
        assert!(eventually(Duration::from_secs(5), || async { !server.is_running().await }).await);
        assert_eq!(server.detect_crash().await.unwrap(), CrashCheck::Restarted { attempt });
        assert_eq!(server.restart_count().await, attempt);
        assert!(server.is_crashed().await);
    }

    assert!(eventually(Duration::from_secs(5), || async { !server.is_running().await }).await);
    assert_eq!(server.detect_crash().await.unwrap(), CrashCheck::GaveUp);
    assert_eq!(server.restart_count().await, 4);
    assert!(server.is_crashed().await);
    assert!(fx.store.is_crashed(ServerId(1)));
    assert_eq!(server.status().await, ServerStatus::Crashed);
    assert_eq!(server.snapshot().await.last_exit_code, Some(3));

    // No further starts once the budget is spent.
    assert_eq!(server.detect_crash().await.unwrap(), CrashCheck::GaveUp);
    assert_eq!(server.restart_count().await, 4);

    // A manual start resets the crash state.
    server.start(Issuer::System).await.unwrap();
    assert_eq!(server.restart_count().await, 0);
    assert!(!server.is_crashed().await);
    assert!(!fx.store.is_crashed(ServerId(1)));
}

#[tokio::test]
async fn test_failed_crash_restarts_count_toward_limit() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "exit 3")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    server.start(Issuer::System).await.unwrap();
    assert!(eventually(Duration::from_secs(5), || async { !server.is_running().await }).await);
    std::fs::remove_file(dir.path().join("server.jar")).unwrap();

    for attempt in 1..=4 {
        assert_eq!(server.detect_crash().await.unwrap(), CrashCheck::RestartFailed);
        assert_eq!(server.restart_count().await, attempt);
        assert_eq!(server.status().await, ServerStatus::Crashed);
    }
    assert_eq!(server.detect_crash().await.unwrap(), CrashCheck::GaveUp);
    assert_eq!(server.restart_count().await, 4);
    assert!(server.is_crashed().await);

    let latest = server.events(Some(1)).unwrap();
    assert_eq!(latest[0].event, ServerLifecycleEvent::GaveUp);
}

#[tokio::test]
async fn test_stop_kills_server_that_ignores_it() {
    let dir = server_dir();
    let mut config = shell_server(1, dir.path(), "trap \"\" TERM; while true; do sleep 1; done");
    config.stop_command = Some("stop".to_string());
    let settings = game_runner::config::Settings {
        stop_poll_interval_ms: 100,
        stop_max_polls: 3,
        ..fast_settings()
    };
    let fx = fixture_with_settings(vec![config], Arc::new(OfflineDownloader), settings);
    let server = fx.registry.get(ServerId(1)).unwrap();

    server.start(Issuer::System).await.unwrap();
    let pid = server.pid().await.unwrap();

    let started = Instant::now();
    server.stop(Issuer::System).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));

    assert!(!server.is_running().await);
    assert_eq!(server.status().await, ServerStatus::Stopped);
    assert_eq!(server.pid().await, None);
    assert_eq!(server.restart_count().await, 0);
    assert!(!server.is_crashed().await);
    // Killed by a signal, so there is no exit code to record.
    assert_eq!(server.snapshot().await.last_exit_code, None);
    let latest = server.events(Some(1)).unwrap();
    assert_eq!(latest[0].event, ServerLifecycleEvent::Stopped);

    let gone = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
    assert_eq!(gone, Err(nix::errno::Errno::ESRCH));

    // The server starts again normally afterwards.
    server.start(Issuer::System).await.unwrap();
    server.kill().await.unwrap();
}

#[tokio::test]
async fn test_clean_exit_is_not_a_crash() {
    let dir = server_dir();
    let mut config = shell_server(1, dir.path(), "exit 0");
    config.crash_detection = true;
    let fx = fixture(vec![config]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    server.start(Issuer::System).await.unwrap();
    assert!(server.is_watching_for_crashes());
    assert!(eventually(Duration::from_secs(5), || async { !server.is_running().await }).await);

    assert_eq!(server.detect_crash().await.unwrap(), CrashCheck::CleanExit);
    assert!(!server.is_crashed().await);
    assert!(!server.is_watching_for_crashes());
    assert_eq!(server.status().await, ServerStatus::Stopped);
}

#[tokio::test]
async fn test_detect_crash_before_start() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "sleep 30")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    assert_eq!(server.detect_crash().await.unwrap(), CrashCheck::NotStarted);
}

#[tokio::test]
async fn test_crash_detection_toggle() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "sleep 30")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    server.start(Issuer::System).await.unwrap();
    assert!(!server.is_watching_for_crashes());
    server.set_crash_detection(true).await;
    assert!(server.is_watching_for_crashes());
    server.set_crash_detection(false).await;
    assert!(!server.is_watching_for_crashes());
    server.stop(Issuer::System).await.unwrap();
}

#[tokio::test]
async fn test_unaccepted_license_refuses_start() {
    let dir = server_dir();
    std::fs::write(dir.path().join("eula.txt"), b"eula=false\n").unwrap();
    let fx = fixture(vec![shell_server(1, dir.path(), "sleep 30")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    let result = server.start(Issuer::User(9)).await;
    assert!(matches!(
        result,
        Err(Error::Startup(StartupError::LicenseNotAccepted(_)))
    ));
    assert_eq!(fx.broadcaster.user_events(9), vec!["send_eula_bootbox".to_string()]);
    assert!(!server.is_running().await);

    server.accept_license(Issuer::User(9)).await.unwrap();
    assert!(server.is_running().await);
    server.stop(Issuer::System).await.unwrap();
}

#[tokio::test]
async fn test_update_flag_refuses_start() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "sleep 30")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    fx.store.set_updating_flag(ServerId(1), true).await.unwrap();
    let result = server.start(Issuer::System).await;
    assert!(matches!(result, Err(Error::Startup(StartupError::UpdateInProgress))));
    assert!(!server.is_running().await);
}

#[tokio::test]
async fn test_missing_executable_refuses_start() {
    let dir = server_dir();
    std::fs::remove_file(dir.path().join("server.jar")).unwrap();
    let fx = fixture(vec![shell_server(1, dir.path(), "sleep 30")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    let result = server.start(Issuer::User(2)).await;
    assert!(matches!(
        result,
        Err(Error::Startup(StartupError::ExecutableMissing(_)))
    ));
    assert_eq!(fx.broadcaster.user_events(2), vec!["send_start_error".to_string()]);
}

#[tokio::test]
async fn test_send_command_requires_running_server() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "while read line; do echo \"got $line\"; done")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    assert!(matches!(server.send_command("list").await, Err(Error::NotRunning)));

    server.start(Issuer::System).await.unwrap();
    server.send_command("list").await.unwrap();
    assert!(
        eventually(Duration::from_secs(5), || async {
            server.terminal_lines().contains(&"got list".to_string())
        })
        .await
    );
    server.stop(Issuer::System).await.unwrap();
}

#[tokio::test]
async fn test_console_output_reaches_terminal() {
    let dir = server_dir();
    let fx = fixture(vec![shell_server(1, dir.path(), "echo hello; echo \"<b>&\"; sleep 30")]);
    let server = fx.registry.get(ServerId(1)).unwrap();

    server.start(Issuer::System).await.unwrap();
    assert!(
        eventually(Duration::from_secs(5), || async { server.terminal_lines().len() == 2 }).await
    );
    assert_eq!(
        server.terminal_lines(),
        vec!["hello".to_string(), "&lt;b&gt;&amp;".to_string()]
    );
    assert!(fx.broadcaster.events().contains(&"vterm_new_line".to_string()));
    server.stop(Issuer::System).await.unwrap();
}

use sker_core::{FsContextIndexer, RefreshOptions, WatchConfigManager};
use sker_daemon::{CliDaemon, DaemonPaths, StartOptions, StopOptions, WatchOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn daemon(home: &Path) -> CliDaemon {
    CliDaemon::new(
        DaemonPaths::in_dir(home.join(".sker")),
        WatchConfigManager::with_home(home),
        Arc::new(FsContextIndexer::new()),
    )
}

async fn wait_for(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{:?} never appeared", path);
}

#[tokio::test]
async fn start_twice_then_stop() {
    let home = TempDir::new().unwrap();
    let daemon = daemon(home.path());

    let status = daemon.get_daemon_status().await;
    assert!(!status.is_running);
    assert!(status.error.unwrap().contains("No PID file"));

    let first = daemon.start_daemon(StartOptions::default()).await.unwrap();
    assert!(first.success, "{}", first.message);

    let status = daemon.get_daemon_status().await;
    assert!(status.is_running);
    assert_eq!(status.pid, Some(std::process::id()));

    let second = daemon.start_daemon(StartOptions::default()).await.unwrap();
    assert!(!second.success);
    assert!(second.message.contains("already running"));

    let stopped = daemon.stop_daemon(StopOptions::default()).await.unwrap();
    assert!(stopped.success, "{}", stopped.message);
    assert!(!daemon.paths().pid_file.exists());
    assert!(!daemon.paths().socket_path.exists());
    assert!(!daemon.get_daemon_status().await.is_running);

    let again = daemon.stop_daemon(StopOptions::default()).await.unwrap();
    assert!(!again.success);
    assert!(again.message.contains("not running"));
}

#[tokio::test]
async fn watched_project_is_refreshed_through_running_daemon() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    std::fs::write(project.path().join("index.ts"), "export const a = 1;").unwrap();
    let daemon = daemon(home.path());

    let enabled = daemon
        .enable_watch(project.path(), WatchOptions::default())
        .await
        .unwrap();
    assert!(enabled.success, "{}", enabled.message);

    assert!(daemon.start_daemon(StartOptions::default()).await.unwrap().success);
    wait_for(&daemon.paths().socket_path).await;

    let refreshed = daemon
        .refresh_context(
            project.path(),
            RefreshOptions {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(refreshed.success, "{}", refreshed.message);
    let details = refreshed.details.unwrap();
    assert_eq!(details["viaDaemon"], true);
    // index.ts and the sker.json written by enable_watch
    assert_eq!(details["filesProcessed"], 2);

    let stats = daemon.daemon_stats().await.unwrap();
    assert_eq!(stats.project_count, 1);

    let stopped = daemon.stop_daemon(StopOptions::default()).await.unwrap();
    assert!(stopped.success);
    daemon.wait().await.unwrap();
}

/// Stand-in daemon binary that records its PID the way `daemon run` does
#[cfg(unix)]
fn fake_daemon(dir: &Path, ignore_term: bool) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let record_pid = r#"echo $$ > "$SKER_HOME/.sker/daemon.pid""#;
    let text = if ignore_term {
        format!("#!/bin/sh\ntrap '' TERM\n{}\nwhile :; do sleep 1; done\n", record_pid)
    } else {
        format!("#!/bin/sh\n{}\nexec sleep 30\n", record_pid)
    };

    let script = dir.join("fake-sker");
    std::fs::write(&script, text).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

/// Spawning a freshly written script can hit ETXTBSY while another test forks
#[cfg(unix)]
async fn start_background(daemon: &CliDaemon) -> sker_daemon::CommandResult {
    let options = StartOptions {
        background: true,
        force: false,
    };
    for _ in 0..5 {
        match daemon.start_daemon(options).await {
            Ok(result) => return result,
            Err(e) => eprintln!("spawn failed, retrying: {}", e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("background daemon never spawned");
}

#[cfg(unix)]
#[tokio::test]
async fn background_daemon_stops_on_sigterm() {
    let home = TempDir::new().unwrap();
    let script = fake_daemon(home.path(), false);
    let daemon = daemon(home.path()).with_executable(script);

    let started = start_background(&daemon).await;
    assert!(started.success, "{}", started.message);
    let details = started.details.unwrap();
    assert_eq!(details["background"], true);
    let pid = details["pid"].as_u64().unwrap() as u32;

    let status = daemon.get_daemon_status().await;
    assert!(status.is_running);
    assert_eq!(status.pid, Some(pid));
    assert_ne!(status.pid, Some(std::process::id()));

    let second = daemon
        .start_daemon(StartOptions {
            background: true,
            force: false,
        })
        .await
        .unwrap();
    assert!(!second.success);
    assert!(second.message.contains("already running"), "{}", second.message);

    let stopped = daemon.stop_daemon(StopOptions::default()).await.unwrap();
    assert!(stopped.success, "{}", stopped.message);
    let details = stopped.details.unwrap();
    assert_eq!(details["pid"], pid);
    assert_eq!(details["forced"], false);
    assert!(!daemon.paths().pid_file.exists());
    assert!(!daemon.get_daemon_status().await.is_running);
}

#[cfg(unix)]
#[tokio::test]
async fn daemon_ignoring_sigterm_is_killed_after_timeout() {
    let home = TempDir::new().unwrap();
    let script = fake_daemon(home.path(), true);
    let stop_timeout = Duration::from_millis(600);
    let daemon = daemon(home.path())
        .with_executable(script)
        .with_stop_timeout(stop_timeout);

    let started = start_background(&daemon).await;
    assert!(started.success, "{}", started.message);

    let begun = Instant::now();
    let stopped = daemon.stop_daemon(StopOptions::default()).await.unwrap();
    let elapsed = begun.elapsed();

    assert!(stopped.success, "{}", stopped.message);
    assert_eq!(stopped.details.unwrap()["forced"], true);
    assert!(elapsed >= stop_timeout, "escalated after only {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    assert!(!daemon.get_daemon_status().await.is_running);
}

#[cfg(unix)]
#[tokio::test]
async fn forced_stop_skips_sigterm() {
    let home = TempDir::new().unwrap();
    let script = fake_daemon(home.path(), true);
    let daemon = daemon(home.path())
        .with_executable(script)
        .with_stop_timeout(Duration::from_secs(30));

    assert!(start_background(&daemon).await.success);

    let begun = Instant::now();
    let stopped = daemon.stop_daemon(StopOptions { force: true }).await.unwrap();
    assert!(stopped.success, "{}", stopped.message);
    assert_eq!(stopped.details.unwrap()["forced"], true);
    assert!(begun.elapsed() < Duration::from_secs(5));
}

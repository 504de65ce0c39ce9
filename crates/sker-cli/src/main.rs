//! Sker CLI - Background Context Watcher
//!
//! Commands:
//! - sker daemon start [--background] [--force]
//! - sker daemon stop [--force]
//! - sker daemon status
//! - sker watch enable [path] [--debounce N] [--patterns P] [--exclude P]
//! - sker watch disable [path]
//! - sker context refresh [path] [--force] [--patterns P] [--exclude P]
//! - sker context clear [path]

mod commands;

use anyhow::Result;
use commands::{
    help_text, parse_command, Command, CommandError, ContextCommand, DaemonCommand, WatchCommand,
};
use sker_core::{FsContextIndexer, RefreshOptions, WatchConfigManager};
use sker_daemon::{
    CliDaemon, CommandResult, DaemonServer, StartOptions, StopOptions, WatchOptions, HOME_ENV,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "SKER_LOG";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let command = match parse_command(std::env::args_os().skip(1)) {
        Ok(command) => command,
        Err(CommandError::Help(text)) => {
            print!("{}", text);
            return Ok(ExitCode::SUCCESS);
        }
        Err(e @ CommandError::Invalid(_)) => {
            eprint!("{}", e);
            return Ok(ExitCode::from(2));
        }
        Err(CommandError::MissingAction(family)) => {
            eprintln!("❌ missing action for '{}'\n", family);
            if let Some(help) = help_text(&family) {
                eprint!("{}", help);
            }
            return Ok(ExitCode::from(2));
        }
        Err(e) => {
            eprintln!("❌ {}", e);
            eprintln!("   Run `sker --help` for usage");
            return Ok(ExitCode::from(2));
        }
    };

    let config = match std::env::var_os(HOME_ENV) {
        Some(home) => WatchConfigManager::with_home(home),
        None => WatchConfigManager::new()?,
    };
    let global = config.load_global_config()?;
    init_tracing(&global.daemon.log_level);
    debug!("Command: {:?}", command);

    let indexer = Arc::new(FsContextIndexer::new());

    let daemon = CliDaemon::from_config(config.clone(), indexer.clone())?;
    let foreground = matches!(
        command,
        Command::Daemon(DaemonCommand::Start {
            background: false,
            ..
        })
    );

    let result = match command {
        Command::Daemon(action) => match action {
            DaemonCommand::Start { background, force } => {
                daemon.start_daemon(StartOptions { background, force }).await?
            }
            DaemonCommand::Stop { force } => daemon.stop_daemon(StopOptions { force }).await?,
            DaemonCommand::Status => {
                print_status(&daemon).await;
                return Ok(ExitCode::SUCCESS);
            }
            DaemonCommand::Run => {
                DaemonServer::new(config, indexer)?.run().await?;
                return Ok(ExitCode::SUCCESS);
            }
        },

        Command::Watch(action) => match action {
            WatchCommand::Enable(args) => {
                let options = WatchOptions {
                    debounce_ms: args.debounce,
                    batch_size: args.batch_size,
                    patterns: args.patterns,
                    exclude: args.exclude,
                };
                daemon.enable_watch(&args.project_path, options).await?
            }
            WatchCommand::Disable { project_path } => daemon.disable_watch(&project_path).await?,
        },

        Command::Context(action) => match action {
            ContextCommand::Refresh(args) => {
                let options = RefreshOptions {
                    force: args.force,
                    patterns: args.patterns,
                    exclude: args.exclude,
                    ..Default::default()
                };
                daemon.refresh_context(&args.project_path, options).await?
            }
            ContextCommand::Clear { project_path } => daemon.clear_context(&project_path).await?,
        },
    };

    print_result(&result);

    if foreground && result.success {
        println!("   Press Ctrl-C to stop");
        daemon.wait().await?;
        println!("✅ Daemon stopped");
    }

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_result(result: &CommandResult) {
    if result.success {
        println!("✅ {}", result.message);
    } else {
        println!("❌ {}", result.message);
    }
}

async fn print_status(daemon: &CliDaemon) {
    let status = daemon.get_daemon_status().await;

    if !status.is_running {
        println!("💤 Daemon is not running");
        if let Some(error) = &status.error {
            println!("   {}", error);
        }
        return;
    }

    println!("📊 Daemon Status:");
    if let Some(pid) = status.pid {
        println!("   PID: {}", pid);
    }
    if let Some(uptime) = status.uptime {
        println!("   Uptime: {}s", uptime);
    }

    if let Some(stats) = daemon.daemon_stats().await {
        println!("   Projects: {}", stats.project_count);
        println!("   File changes: {}", stats.file_changes);
        println!("   Context updates: {}", stats.context_updates);
        println!("   Errors: {}", stats.errors);
    } else {
        println!("   ⚠️  Control socket not answering");
    }
}

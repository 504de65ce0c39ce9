//! Command parsing for the `daemon`, `watch` and `context` families

use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

pub const FAMILIES: [&str; 3] = ["daemon", "watch", "context"];

/// Sker - keeps project context fresh in the background
#[derive(Parser, Debug)]
#[command(name = "sker", version, about = "Background context watcher")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Daemon management
    #[command(subcommand)]
    Daemon(DaemonCommand),
    /// File watching per project
    #[command(subcommand)]
    Watch(WatchCommand),
    /// Project context maintenance
    #[command(subcommand)]
    Context(ContextCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Detach and run in the background
        #[arg(long)]
        background: bool,
        /// Restart if already running
        #[arg(long)]
        force: bool,
    },
    /// Stop the daemon
    Stop {
        /// Kill immediately instead of a graceful shutdown
        #[arg(long)]
        force: bool,
    },
    /// Show daemon status
    Status,
    /// Run the daemon body (used by `start --background`)
    #[command(hide = true)]
    Run,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum WatchCommand {
    /// Start watching a project
    Enable(WatchEnableArgs),
    /// Stop watching a project
    Disable {
        /// Project root
        #[arg(default_value = ".")]
        project_path: PathBuf,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct WatchEnableArgs {
    /// Project root
    #[arg(default_value = ".")]
    pub project_path: PathBuf,
    /// Quiet period in milliseconds before a batch is emitted
    #[arg(long)]
    pub debounce: Option<u64>,
    /// Pending changes that force an immediate batch
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Glob patterns to watch
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub patterns: Vec<String>,
    /// Glob patterns to ignore
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub exclude: Vec<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ContextCommand {
    /// Rescan a project into its context
    Refresh(RefreshArgs),
    /// Drop a project's context
    Clear {
        /// Project root
        #[arg(default_value = ".")]
        project_path: PathBuf,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RefreshArgs {
    /// Project root
    #[arg(default_value = ".")]
    pub project_path: PathBuf,
    /// Reprocess files even when unchanged
    #[arg(long)]
    pub force: bool,
    /// Glob patterns to include
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub patterns: Vec<String>,
    /// Glob patterns to skip
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub exclude: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("missing command; expected one of: {}", FAMILIES.join(", "))]
    Missing,

    #[error("unknown command '{family}'; expected one of: {}", FAMILIES.join(", "), family = .0)]
    UnknownFamily(String),

    /// A family was given without an action
    #[error("missing action for '{0}'")]
    MissingAction(String),

    #[error("{0}")]
    Invalid(String),

    /// `--help` or `--version` was requested; carries the rendered text
    #[error("{0}")]
    Help(String),
}

/// Parse arguments without the program name
pub fn parse_command<I, T>(args: I) -> Result<Command, CommandError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();

    let Some(first) = args.first() else {
        return Err(CommandError::Missing);
    };
    let first = first.to_string_lossy();
    if !first.starts_with('-') {
        if !FAMILIES.contains(&first.as_ref()) {
            return Err(CommandError::UnknownFamily(first.into_owned()));
        }
        if args.len() == 1 {
            return Err(CommandError::MissingAction(first.into_owned()));
        }
    }

    let argv = std::iter::once(OsString::from("sker")).chain(args);
    Cli::try_parse_from(argv)
        .map(|cli| cli.command)
        .map_err(|e| match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                CommandError::Help(e.render().to_string())
            }
            _ => CommandError::Invalid(e.render().to_string()),
        })
}

/// Rendered help for one command family
pub fn help_text(family: &str) -> Option<String> {
    let mut cli = Cli::command();
    cli.build();
    cli.find_subcommand_mut(family)
        .map(|cmd| cmd.render_long_help().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_start_background() {
        let command = parse_command(["daemon", "start", "--background"]).unwrap();
        assert_eq!(
            command,
            Command::Daemon(DaemonCommand::Start {
                background: true,
                force: false
            })
        );
    }

    #[test]
    fn test_unknown_family() {
        let err = parse_command(["bogus", "x"]).unwrap_err();
        assert!(matches!(err, CommandError::UnknownFamily(ref f) if f == "bogus"));
        assert!(matches!(parse_command(Vec::<String>::new()), Err(CommandError::Missing)));
        assert!(err.to_string().starts_with("unknown command 'bogus'; expected one of: daemon"));
    }

    #[test]
    fn test_family_without_action() {
        let err = parse_command(["watch"]).unwrap_err();
        assert!(matches!(err, CommandError::MissingAction(ref f) if f == "watch"));
        assert_eq!(err.to_string(), "missing action for 'watch'");
        assert!(help_text("watch").unwrap().contains("enable"));
    }

    #[test]
    fn test_watch_enable_numeric_and_lists() {
        let command = parse_command([
            "watch",
            "enable",
            "./app",
            "--debounce",
            "150",
            "--patterns",
            "src/**,docs/**",
            "--exclude",
            "*.log",
            "--exclude",
            "tmp/**",
        ])
        .unwrap();

        let Command::Watch(WatchCommand::Enable(args)) = command else {
            panic!("expected watch enable, got {:?}", command);
        };
        assert_eq!(args.project_path, PathBuf::from("./app"));
        assert_eq!(args.debounce, Some(150));
        assert_eq!(args.patterns, vec!["src/**", "docs/**"]);
        assert_eq!(args.exclude, vec!["*.log", "tmp/**"]);
    }

    #[test]
    fn test_malformed_flag_values() {
        let err = parse_command(["watch", "enable", "--debounce", "soon"]).unwrap_err();
        assert!(matches!(err, CommandError::Invalid(_)));

        let err = parse_command(["daemon", "restart"]).unwrap_err();
        assert!(matches!(err, CommandError::Invalid(_)));
    }

    #[test]
    fn test_project_path_defaults_to_cwd() {
        let command = parse_command(["context", "clear"]).unwrap();
        assert_eq!(
            command,
            Command::Context(ContextCommand::Clear {
                project_path: PathBuf::from(".")
            })
        );
    }

    #[test]
    fn test_help_text_per_family() {
        for family in FAMILIES {
            assert!(help_text(family).is_some(), "no help for {}", family);
        }
        assert!(help_text("context").unwrap().contains("refresh"));
        assert!(help_text("nope").is_none());
    }
}

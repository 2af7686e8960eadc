use anyhow::Result;
use clap::{Parser, Subcommand};
use mctl_control::logging::{init_cli_logging, init_server_logging};
use mctl_core::instance::running_as_server;

mod commands;
mod picker;
mod session_host;
mod sources;
mod wrapper;

use commands::{ListArgs, NewArgs, QueryArgs, ServerCommand, ShowArgs, UpdateArgs};

#[derive(Parser)]
#[command(name = "mctl", version)]
#[command(about = "Mission control for long-running agent sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// List missions, newest first
    List(ListArgs),
    /// Show one mission in detail
    Show(ShowArgs),
    /// Create a mission and print its short id
    New(NewArgs),
    /// Stop the agent of one or more missions
    Stop(QueryArgs),
    /// Stop and archive one or more missions
    Archive(QueryArgs),
    /// Restart a mission's agent, in place when it lives in a tmux pane
    Reload(QueryArgs),
    /// Change a mission's description or pinned configuration
    Update(UpdateArgs),
    /// Run a mission's agent in this terminal
    Resume { id: String },
    /// Manage the background control server
    Server {
        #[command(subcommand)]
        action: ServerCommand,
    },
    /// Stop everything and delete the registry, missions and run state
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

impl Commands {
    fn manages_server(&self) -> bool {
        matches!(self, Commands::Server { .. } | Commands::Reset { .. })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mctl: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(command: Commands) -> Result<i32> {
    let ctx = commands::Context::load()?;

    let serving = running_as_server()
        && matches!(
            command,
            Commands::Server {
                action: ServerCommand::Start
            }
        );
    let _log_guard = if serving {
        init_server_logging(&ctx.instance, &ctx.settings.log_level)
    } else {
        init_cli_logging();
        None
    };

    if !command.manages_server() {
        ctx.supervisor().refresh_if_skewed().await;
    }

    match command {
        Commands::List(args) => commands::list(&ctx, &args).await?,
        Commands::Show(args) => commands::show(&ctx, &args).await?,
        Commands::New(args) => commands::new_mission(&ctx, &args).await?,
        Commands::Stop(args) => commands::stop(&ctx, &args).await?,
        Commands::Archive(args) => commands::archive(&ctx, &args).await?,
        Commands::Reload(args) => return commands::reload(&ctx, &args).await,
        Commands::Update(args) => commands::update(&ctx, &args).await?,
        Commands::Resume { id } => return commands::resume(&ctx, &id).await,
        Commands::Server { action } => commands::server(&ctx, &action).await?,
        Commands::Reset { yes } => commands::reset(&ctx, yes).await?,
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn new_accepts_bare_repo_flag_for_the_picker() {
        let cli = Cli::try_parse_from(["mctl", "new", "--repo", "--name", "x"]).expect("parse");
        let Commands::New(args) = cli.command else {
            panic!("expected new");
        };
        assert_eq!(args.repo.as_deref(), Some(""));
        assert_eq!(args.name.as_deref(), Some("x"));
        assert!(args.template.is_none());
    }

    #[test]
    fn query_words_are_collected() {
        let cli = Cli::try_parse_from(["mctl", "stop", "flaky", "tests"]).expect("parse");
        let Commands::Stop(args) = cli.command else {
            panic!("expected stop");
        };
        assert_eq!(args.query, vec!["flaky", "tests"]);
        assert!(!cli_manages_server(["mctl", "stop"]));
        assert!(cli_manages_server(["mctl", "server", "status"]));
    }

    fn cli_manages_server<const N: usize>(argv: [&str; N]) -> bool {
        Cli::try_parse_from(argv)
            .expect("parse")
            .command
            .manages_server()
    }
}

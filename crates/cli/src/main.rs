//! vbroker CLI - persistent Visum instances behind a local TCP broker

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;

use commands::{
  ProjectRequest, cmd_config_init, cmd_config_show, cmd_open, cmd_project_request, cmd_run, cmd_serve, cmd_servers,
  cmd_stop, report_error,
};
use logging::{init_cli_logging, init_server_logging};

#[derive(Parser)]
#[command(name = "vbroker")]
#[command(about = "Keep Visum projects loaded and run commands against them")]
#[command(after_help = "\
QUICK START:
  vbroker open model.ver                          # Start (or reuse) a project server
  vbroker query model.ver --code \"result = 1\"     # Run code in the loaded project
  vbroker stop model.ver                          # Stop the project server

All commands print JSON on stdout and exit with status 1 on failure.")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

/// Code to run, inline or from a file
#[derive(clap::Args)]
#[group(required = true, multiple = false)]
pub struct CodeSource {
  /// Code to execute
  #[arg(short, long)]
  code: Option<String>,
  /// File containing the code to execute
  #[arg(short, long, value_name = "FILE")]
  file: Option<PathBuf>,
}

/// Subcommands for `vbroker config`
#[derive(Subcommand)]
pub enum ConfigCommand {
  /// Show the effective configuration
  #[command(long_about = "Show the effective configuration.\n\n\
    With --project, shows what a server for that project would use \
    (project .vbroker.toml, then user config, then defaults).")]
  Show {
    /// Project file whose configuration to show
    #[arg(short, long)]
    project: Option<PathBuf>,
  },

  /// Write a commented default config file
  #[command(long_about = "Write a commented default configuration.\n\n\
    With --project, creates .vbroker.toml next to the project file; \
    otherwise creates the user config.")]
  Init {
    /// Project file to create a .vbroker.toml next to
    #[arg(short, long)]
    project: Option<PathBuf>,
  },
}

#[derive(Subcommand)]
enum Commands {
  /// Run a project server (normally started by `open`)
  Serve {
    /// Project (.ver) file to load
    #[arg(long)]
    project: PathBuf,
    /// Port to listen on (0 picks a free one)
    #[arg(long, default_value = "0")]
    port: u16,
    /// Log to the console instead of the server log file
    #[arg(long)]
    foreground: bool,
  },
  /// Start the project server if needed and print its port
  Open {
    /// Project (.ver) file
    project: PathBuf,
  },
  /// Run code against a loaded project
  #[command(after_help = "\
The code runs with `Visum` bound to the loaded project. Assign the value to
return to `result`; printed output is returned separately.

EXAMPLES:
  vbroker query model.ver --code \"result = Visum.Net.Nodes.Count\"
  vbroker query model.ver --file analysis.py --timeout-ms 600000")]
  Query {
    /// Project (.ver) file
    project: PathBuf,
    #[command(flatten)]
    source: CodeSource,
    /// Human-readable description, recorded in the server log
    #[arg(short, long)]
    description: Option<String>,
    /// Command timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
  },
  /// Health-probe the project's engine
  Ping {
    /// Project (.ver) file
    project: PathBuf,
  },
  /// Show project and engine information
  Info {
    /// Project (.ver) file
    project: PathBuf,
  },
  /// Save the loaded project
  Save {
    /// Project (.ver) file
    project: PathBuf,
    /// Save to this path instead of the original file
    #[arg(long)]
    path: Option<String>,
  },
  /// Show which attribute names the engine version supports
  Capabilities {
    /// Project (.ver) file
    project: PathBuf,
  },
  /// List candidate mode / transport system / demand segment mappings
  ModeMappings {
    /// Project (.ver) file
    project: PathBuf,
  },
  /// Show broker-side status of the project server
  Status {
    /// Project (.ver) file
    project: PathBuf,
  },
  /// Stop the project server
  Stop {
    /// Project (.ver) file
    project: PathBuf,
  },
  /// List registered project servers
  Servers {
    /// Remove entries whose process is gone
    #[arg(long)]
    prune: bool,
  },
  /// Run code once in a fresh engine process
  Run {
    #[command(flatten)]
    source: CodeSource,
    /// Timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
  },
  /// Manage configuration
  #[command(after_help = "\
CONFIG LOCATIONS:
  Project: <project dir>/.vbroker.toml
  User:    ~/.config/vbroker/config.toml")]
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

#[tokio::main]
async fn main() {
  let cli = Cli::parse();

  // File logging for project servers, console (stderr) for everything else
  let _guard = match &cli.command {
    Commands::Serve { project, foreground, .. } => init_server_logging(project, *foreground),
    _ => {
      init_cli_logging();
      None
    }
  };

  if let Err(e) = dispatch(cli.command).await {
    report_error(&e);
    std::process::exit(1);
  }
}

async fn dispatch(command: Commands) -> Result<()> {
  match command {
    Commands::Serve { project, port, .. } => cmd_serve(&project, port).await,
    Commands::Open { project } => cmd_open(&project).await,
    Commands::Query {
      project,
      source,
      description,
      timeout_ms,
    } => {
      let code = source.read().await?;
      cmd_project_request(
        &project,
        ProjectRequest::Query {
          code,
          description,
          timeout_ms,
        },
      )
      .await
    }
    Commands::Ping { project } => cmd_project_request(&project, ProjectRequest::Ping).await,
    Commands::Info { project } => cmd_project_request(&project, ProjectRequest::Info).await,
    Commands::Save { project, path } => cmd_project_request(&project, ProjectRequest::Save { path }).await,
    Commands::Capabilities { project } => cmd_project_request(&project, ProjectRequest::Capabilities).await,
    Commands::ModeMappings { project } => cmd_project_request(&project, ProjectRequest::ModeMappings).await,
    Commands::Status { project } => cmd_project_request(&project, ProjectRequest::Status).await,
    Commands::Stop { project } => cmd_stop(&project).await,
    Commands::Servers { prune } => cmd_servers(prune).await,
    Commands::Run { source, timeout_ms } => {
      let config_anchor = source.file.clone();
      let code = source.read().await?;
      cmd_run(&code, config_anchor.as_deref(), timeout_ms).await
    }

    // Config subcommands
    Commands::Config { command } => match command {
      ConfigCommand::Show { project } => cmd_config_show(project.as_deref()).await,
      ConfigCommand::Init { project } => cmd_config_init(project.as_deref()).await,
    },
  }
}

impl CodeSource {
  async fn read(self) -> Result<String> {
    match (self.code, self.file) {
      (Some(code), _) => Ok(code),
      (None, Some(file)) => {
        use anyhow::Context;
        tokio::fs::read_to_string(&file)
          .await
          .with_context(|| format!("Failed to read {}", file.display()))
      }
      (None, None) => anyhow::bail!("either --code or --file is required"),
    }
  }
}

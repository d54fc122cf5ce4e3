mod logs;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::client::{self, Connector};
use crate::config::Settings;
use crate::pty::UserContext;

#[derive(Parser, Debug)]
#[command(name = "termbridge", version, about = "Remote shells on per-user PTY servers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (default: ~/.config/termbridge/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the spawner that launches PTY servers on request
    Spawner {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Control port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one PTY server (launched by the spawner)
    Server {
        /// Port to listen on
        port: u16,

        /// Numeric uid whose shells this server runs
        uid: u32,
    },

    /// Open a remote shell in this terminal (Ctrl+] to detach)
    Connect {
        /// Spawner host
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// User to request a server for (default: current user)
        #[arg(short, long)]
        identity: Option<String>,
    },

    /// Tail the spawner log, or a server's log
    Logs {
        /// Number of lines
        #[arg(short, default_value_t = 50)]
        n: usize,

        /// Show the log of the server on this port
        #[arg(short, long)]
        port: Option<u16>,
    },
}

impl Cli {
    /// Expanded `--config` path, if one was given.
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::resolve(cli.config.as_deref())?;
    let config_path = cli.config_path();

    match cli.command {
        Commands::Spawner { bind, port } => {
            let mut spawner = settings.spawner;
            if let Some(bind) = bind {
                spawner.bind = bind;
            }
            if let Some(port) = port {
                spawner.port = port;
            }
            crate::spawner::run_spawner(spawner, config_path, cli.verbose).await?;
        }
        Commands::Server { port, uid } => {
            crate::server::run_server(port, uid, &settings).await?;
        }
        Commands::Connect { host, identity } => {
            let identity = match identity {
                Some(identity) => identity,
                None => UserContext::current()?.name,
            };
            let host = host.unwrap_or_else(|| settings.client.host.clone());
            let connector = Connector::new(settings.client, identity);
            client::attach(connector, &host).await?;
        }
        Commands::Logs { n, port } => {
            logs::tail_logs(port, n)?;
        }
    }

    Ok(())
}

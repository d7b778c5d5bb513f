//! d5tun command line
//!
//! One binary for both roles. The role comes from `--server`/`--client`, or
//! is auto-detected from the config file's shape when neither is given. The
//! `issue` subcommand writes ready-to-run client credential files.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use d5tun::client::ClientMgr;
use d5tun::config::{self, Role};
use d5tun::server::Server;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "d5tun")]
#[command(about = "Encrypted multiplexing tunnel proxy")]
#[command(version)]
struct Args {
    /// Configuration file path (.d5s server / .d5c client)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run as server
    #[arg(long)]
    server: bool,

    /// Run as client
    #[arg(long)]
    client: bool,

    /// Log verbosity 0-5 (overrides the config file)
    #[arg(short = 'v', long)]
    verbose: Option<u8>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue client credential files for one or more users
    Issue {
        /// Public address clients will dial, host:port
        listen_addr: String,
        /// Usernames to issue credentials for
        #[arg(required = true)]
        users: Vec<String>,
        /// Directory the .d5c files are written to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

fn init_logging(level: u8) {
    let filter = match level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Look for a config in the usual places when none was given.
fn detect_config() -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &[
        "d5tun.d5s",
        "d5tun.d5c",
        "/etc/d5tun/d5tun.d5s",
        "/etc/d5tun/d5tun.d5c",
    ];
    CANDIDATES
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = match args.config.clone().or_else(detect_config) {
        Some(path) => path,
        None => {
            eprintln!("no config file found; put one in a typical path or pass --config");
            return ExitCode::FAILURE;
        }
    };

    if let Some(Command::Issue {
        listen_addr,
        users,
        output,
    }) = &args.command
    {
        init_logging(args.verbose.unwrap_or(1));
        return match issue(&config_path, listen_addr, users, output) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let role = if args.server {
        Role::Server
    } else if args.client {
        Role::Client
    } else {
        match config::detect_role(&config_path) {
            Ok(role) => role,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        }
    };

    let run = match role {
        Role::Server => run_server(&config_path, args.verbose).await,
        Role::Client => run_client(&config_path, args.verbose).await,
    };
    match run {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn issue(config_path: &Path, listen_addr: &str, users: &[String], output: &Path) -> Result<()> {
    if !listen_addr.contains(':') {
        return Err(anyhow!("listen address needs host:port: {listen_addr}"));
    }
    let server_config = config::load_server(config_path)
        .map_err(|e| anyhow!("{e}"))
        .context("issue needs a server config")?;
    std::fs::create_dir_all(output)?;
    for user in users {
        let (pass, path) =
            config::create_client_credential(output, &server_config, listen_addr, user)
                .map_err(|e| anyhow!("{e}"))?;
        println!("issued {} (append `{user}:{pass}` to the auth file)", path.display());
    }
    Ok(())
}

async fn run_server(config_path: &Path, verbose: Option<u8>) -> Result<()> {
    let config = match config::load_server(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    init_logging(verbose.or(config.verbose).unwrap_or(2));
    info!("d5tun v{}", d5tun::version_string(d5tun::version_word()));

    let server = Server::new(config).map_err(|e| anyhow!("{e}"))?;
    tokio::select! {
        res = server.run() => res.map_err(|e| anyhow!("{e}")),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

async fn run_client(config_path: &Path, verbose: Option<u8>) -> Result<()> {
    let config = match config::load_client(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    init_logging(verbose.or(config.verbose).unwrap_or(2));
    info!("d5tun v{}", d5tun::version_string(d5tun::version_word()));
    info!("socks5/http is working at {}", config.listen_addr);

    let mgr = std::sync::Arc::new(ClientMgr::new(&config).map_err(|e| anyhow!("{e}"))?);
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((conn, _)) => {
                    let mgr = std::sync::Arc::clone(&mgr);
                    tokio::spawn(async move { mgr.serve_local(conn).await });
                }
                Err(e) => error!("accept error: {e}"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down\n{}", mgr.stats());
                return Ok(());
            }
        }
    }
}

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use colored::*;
use env_logger::{Builder, Env};
use rouillesync::core_cache::DirectoryListing;
use rouillesync::core_cli::{Cli, Command};
use rouillesync::core_engine::{FileExistsAction, ListFlags, TransferCommand};
use rouillesync::core_network::{AutoAnswer, Connection};
use rouillesync::core_server::{Protocol, Server, ServerPath};
use rouillesync::{EngineConfig, ReplyCode, SessionContext};
use std::io::Write;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize the logger with a custom format and colors
    let default_filter = if args.verbose { "debug" } else { "info" };
    Builder::from_env(Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            let timestamp = buf.timestamp().to_string();
            let level = match record.level() {
                log::Level::Error => record.level().to_string().red(),
                log::Level::Warn => record.level().to_string().yellow(),
                log::Level::Info => record.level().to_string().green(),
                log::Level::Debug => record.level().to_string().blue(),
                log::Level::Trace => record.level().to_string().white(),
            };
            writeln!(buf, "[{}] [{}] {}", timestamp, level, record.args())
        })
        .init();

    let config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration file: {}", path))?,
        None => EngineConfig::default(),
    };
    let ctx = SessionContext::with_cache_timeout(config.engine.cache_timeout());

    match args.command {
        Command::Ls { url, refresh } => {
            let (server, path) = parse_url(&url)?;
            let mut handler = AutoAnswer::default();
            let mut conn = connect(&ctx, &config, &server, &mut handler).await?;
            let flags = ListFlags {
                refresh,
                ..ListFlags::default()
            };
            let code = conn
                .run(&mut handler, |socket| socket.list(path, "", flags))
                .await;
            check(code, "Listing")?;
            let listed = conn.current_path().clone();
            let (listing, _) = ctx
                .cache
                .lookup(&server, &listed, true)
                .with_context(|| format!("No listing of {} available", listed))?;
            print_listing(&listing);
        }
        Command::Get { url, local, resume } => {
            let (server, path) = parse_url(&url)?;
            let (remote_path, remote_file) = match (path.parent(), path.last_segment()) {
                (Some(parent), Some(file)) => (parent, file.to_string()),
                _ => bail!("{} does not name a file", url),
            };
            let local_path = local.unwrap_or_else(|| PathBuf::from(&remote_file));
            let (local_size, local_time) = match std::fs::metadata(&local_path) {
                Ok(meta) => (
                    Some(meta.len()),
                    meta.modified().ok().map(DateTime::<Utc>::from),
                ),
                Err(_) => (None, None),
            };

            let mut handler = AutoAnswer {
                overwrite: if resume {
                    FileExistsAction::Resume
                } else {
                    FileExistsAction::Overwrite
                },
            };
            let mut conn = connect(&ctx, &config, &server, &mut handler).await?;
            let command = TransferCommand {
                download: true,
                local_path: local_path.clone(),
                local_size,
                local_time,
                remote_path,
                remote_file,
            };
            let code = conn
                .run(&mut handler, |socket| socket.file_transfer(command))
                .await;
            check(code, "Download")?;
            println!("{} {}", "Saved".green(), local_path.display());
        }
    }
    Ok(())
}

/// Parses the URL. Plain `ftp://` never attempts a TLS upgrade.
fn parse_url(url: &str) -> Result<(Server, ServerPath)> {
    let (mut server, path) =
        Server::from_url(url).with_context(|| format!("Invalid URL: {}", url))?;
    match server.protocol {
        Protocol::Ftp => server.protocol = Protocol::InsecureFtp,
        Protocol::Ftps | Protocol::Ftpes => {
            bail!("TLS is not supported by this client, use ftp:// or sftp://")
        }
        Protocol::InsecureFtp | Protocol::Sftp => {}
    }
    Ok((server, path))
}

async fn connect(
    ctx: &SessionContext,
    config: &EngineConfig,
    server: &Server,
    handler: &mut AutoAnswer,
) -> Result<Connection> {
    let mut conn = Connection::new(ctx.clone(), config, server.protocol);
    let target = server.clone();
    let code = conn.run(handler, |socket| socket.connect(target)).await;
    check(code, &format!("Connection to {}", server.display_name()))?;
    Ok(conn)
}

fn check(code: ReplyCode, what: &str) -> Result<()> {
    if code.is_ok() {
        return Ok(());
    }
    if code.is_password_failed() {
        bail!("{} failed: wrong user name or password", what);
    }
    bail!("{} failed: {}", what, code)
}

fn print_listing(listing: &DirectoryListing) {
    println!("{}", listing.path.get_path().bold());
    for entry in listing.entries() {
        let time = entry
            .time
            .map(|t| t.time.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let size = entry.size.map(|s| s.to_string()).unwrap_or_default();
        let name = if entry.is_dir() {
            format!("{}/", entry.name).blue().bold()
        } else if entry.is_link() {
            entry.name.cyan()
        } else {
            entry.name.normal()
        };
        match &entry.target {
            Some(target) => println!("{:>12}  {:16}  {} -> {}", size, time, name, target),
            None => println!("{:>12}  {:16}  {}", size, time, name),
        }
    }
}

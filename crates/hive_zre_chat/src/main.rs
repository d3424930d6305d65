//! hive-zre-chat: a line-oriented group chat over ZRE.
//!
//! Usage:
//!   hive_zre_chat --name alice --group CHAT
//!
//! Every stdin line is shouted to the group. `/w <peer-id> <text>` whispers
//! to one peer, `/peers` lists known peers. Ctrl+C leaves cleanly.

mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use hive_zre::{Headers, NodeConfig, NodeId, ZreEvent, ZreNode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hive_zre_chat", about = "Group chat over the ZRE protocol", version)]
struct Cli {
    /// Node name shown to peers. Defaults to a prefix of the node identity.
    #[arg(long, short = 'n')]
    name: Option<String>,

    /// Network interface to use.
    #[arg(long, short = 'i', value_name = "IFACE")]
    interface: Option<String>,

    /// Group to join and shout to.
    #[arg(long, short = 'g', default_value = "CHAT")]
    group: String,

    /// Extra HELLO header (repeatable).
    #[arg(long = "header", value_name = "KEY=VALUE", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Path to a JSON node configuration. Defaults to ~/.hive/zre.json.
    #[arg(long, short = 'c', value_name = "PATH")]
    config: Option<PathBuf>,

    /// Also write logs to daily-rotated files in this directory.
    #[arg(long, value_name = "PATH")]
    log_dir: Option<PathBuf>,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".hive").join("zre.json"))
}

/// File config (if any) overlaid with command-line flags.
fn build_config(cli: &Cli) -> NodeConfig {
    let mut config = cli
        .config
        .clone()
        .or_else(default_config_path)
        .map(|path| NodeConfig::load_or_default(&path))
        .unwrap_or_default();

    if let Some(name) = &cli.name {
        config.name = Some(name.clone());
    }
    if let Some(interface) = &cli.interface {
        config.interface = Some(interface.clone());
    }
    config.headers.extend(cli.headers.iter().cloned());
    config
}

/// A line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Shout(&'a str),
    Whisper(NodeId, &'a str),
    Peers,
}

fn parse_input(line: &str) -> Result<Option<Input<'_>>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if line == "/peers" {
        return Ok(Some(Input::Peers));
    }
    if let Some(rest) = line.strip_prefix("/w ") {
        let Some((peer, text)) = rest.trim_start().split_once(' ') else {
            bail!("usage: /w <peer-id> <text>");
        };
        let peer: NodeId = peer.parse().context("invalid peer id")?;
        return Ok(Some(Input::Whisper(peer, text)));
    }
    Ok(Some(Input::Shout(line)))
}

fn format_event(event: &ZreEvent) -> String {
    match event {
        ZreEvent::Connect { peer, name, headers } => {
            format!("* {name} ({}) connected{}", peer.short_name(), format_headers(headers))
        }
        ZreEvent::Disconnect { peer, name } => {
            format!("* {name} ({}) disconnected", peer.short_name())
        }
        ZreEvent::Expired { peer, name } => format!("* {name} ({}) timed out", peer.short_name()),
        ZreEvent::Evasive { name, .. } => format!("* {name} is not responding"),
        ZreEvent::Back { name, .. } => format!("* {name} is back"),
        ZreEvent::Whisper { name, content, .. } => {
            format!("[{name} -> you] {}", String::from_utf8_lossy(content))
        }
        ZreEvent::Shout {
            name,
            group,
            content,
            ..
        } => format!("[{group}] {name}: {}", String::from_utf8_lossy(content)),
        ZreEvent::Join { name, group, .. } => format!("* {name} joined {group}"),
        ZreEvent::Leave { name, group, .. } => format!("* {name} left {group}"),
    }
}

fn format_headers(headers: &Headers) -> String {
    if headers.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = headers.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!(" [{}]", pairs.join(", "))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init_logging(cli.log_dir.as_deref(), logging::DEFAULT_FILTER)?;

    let mut node = ZreNode::new(build_config(&cli));
    let mut events = node.start().await.context("failed to start node")?;
    node.join(cli.group.as_str()).await?;

    println!(
        "{} ({}) on {}, group {}",
        node.name(),
        node.identity(),
        node.endpoint().unwrap_or("?"),
        cli.group
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_input(&line) {
                    Ok(Some(Input::Shout(text))) => {
                        node.shout(cli.group.as_str(), text).await?;
                    }
                    Ok(Some(Input::Whisper(peer, text))) => {
                        if let Err(e) = node.whisper(peer, text).await {
                            println!("! {e}");
                        }
                    }
                    Ok(Some(Input::Peers)) => {
                        for peer in node.peers().await? {
                            println!(
                                "  {} {} {:?}{}",
                                peer.id,
                                peer.name.as_deref().unwrap_or("-"),
                                peer.state,
                                if peer.evasive { " (evasive)" } else { "" }
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("! {e:#}"),
                }
            }
            Some(event) = events.recv() => {
                println!("{}", format_event(&event));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving");
                break;
            }
        }
    }

    if let Err(e) = node.leave(cli.group.as_str()).await {
        warn!("Leave failed: {e}");
    }
    node.stop().await;
    Ok(())
}

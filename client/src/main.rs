use clap::Parser;
use client::mirror::Mirror;
use client::network::Remote;
use client::predict;
use log::{error, info, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:4000")]
    server: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Connecting to: {}", args.server);

    let mut remote = Remote::connect(&args.server).await?;
    let mut mirror = Mirror::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    info!("Commands: set <key> <value>, get [<key>], shout <text>, show");

    loop {
        tokio::select! {
            incoming = remote.recv() => {
                match incoming? {
                    Some(payload) => {
                        mirror.apply_payload(&payload);
                        while let Some((name, data)) = mirror.next_response() {
                            info!("Message {}: {}", name, data);
                        }
                    }
                    None => {
                        info!("Server closed the connection");
                        break;
                    }
                }
            }
            line = stdin.next_line() => {
                match line? {
                    Some(line) => {
                        if let Err(e) = run_command(&mut remote, &mut mirror, line.trim()).await {
                            error!("Command failed: {}", e);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

/// Parses one interactive command. Keys are dotted paths under this
/// client's own subtree.
async fn run_command(
    remote: &mut Remote,
    mirror: &mut Mirror,
    line: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or("");
    match command {
        "set" => {
            let key = match parts.next() {
                Some(key) => key,
                None => {
                    warn!("Usage: set <key> <value>");
                    return Ok(());
                }
            };
            let raw = parts.next().unwrap_or("null");
            let value: Value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            let path = match own_path(mirror, key) {
                Some(path) => path,
                None => return Ok(()),
            };
            // Predict locally, send the intent, let the echo settle it.
            match predict::apply_optimistic(mirror, &path, &value) {
                Some(predicted) => {
                    info!("Predicted {} = {}", key, predicted);
                    remote.send_edit(path, value).await?;
                }
                None => warn!("Rejected locally: {} cannot take {}", key, value),
            }
        }
        "get" => match parts.next() {
            Some(key) => {
                if let Some(path) = own_path(mirror, key) {
                    match mirror.value(&path) {
                        Some(value) => info!("{} = {}", key, value),
                        None => info!("{} is unset", key),
                    }
                }
            }
            None => info!("{}", mirror.snapshot()),
        },
        "shout" => {
            let text = line.strip_prefix("shout").unwrap_or("").trim();
            remote.send_message("shout", json!(text)).await?;
        }
        "show" => {
            info!("self: {:?}", mirror.self_id());
            info!("peers: {:?}", mirror.peers().collect::<Vec<_>>());
            info!("teams: {:?}", mirror.teams().collect::<Vec<_>>());
            info!("state: {}", mirror.snapshot());
        }
        "" => {}
        _ => info!("Commands: set <key> <value>, get [<key>], shout <text>, show"),
    }
    Ok(())
}

fn own_path(mirror: &Mirror, key: &str) -> Option<Vec<String>> {
    match mirror.self_id() {
        Some(id) => {
            let mut path = vec![id.to_string()];
            path.extend(key.split('.').map(str::to_string));
            Some(path)
        }
        None => {
            warn!("Not initialized yet");
            None
        }
    }
}

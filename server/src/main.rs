use clap::Parser;
use log::info;
use serde_json::json;
use server::constraint::Constraint;
use server::engine::{Engine, EngineConfig, EVENT_CONNECT};
use server::network::{Gateway, TcpTransport};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Main-method of the application.
/// Parses command-line arguments, wires a small demo application into
/// the engine and serves it over TCP until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "4000")]
        port: u16,
        /// Tick rate (broadcast passes per second)
        #[clap(short, long, default_value = "30")]
        tick_rate: u32,
        /// Per-connection backlog, in bytes, before a flush is skipped
        #[clap(long, default_value = "65536")]
        high_water: usize,
    }

    env_logger::init();
    let args = Args::parse();

    let config = EngineConfig {
        tick_rate: args.tick_rate,
        high_water_mark: args.high_water,
        ..EngineConfig::default()
    };
    let transport = Arc::new(TcpTransport::new());
    let engine = Arc::new(Mutex::new(Engine::new(config, transport.clone())));

    // Demo application: a shared lobby with a capped chat log, plus a
    // non-negative integer score cell per client.
    {
        let mut engine = engine.lock().await;
        engine.create_team("lobby")?;
        engine.set(&path(&["lobby", "chat"]), json!([]))?;

        engine.on(EVENT_CONNECT, |eng, client, _| {
            let score = vec![client.to_string(), "score".to_string()];
            let _ = eng.set(&score, json!(0));
            let _ = eng.add_constraint(&score, Constraint::int());
            let _ = eng.add_constraint(&score, Constraint::min(0.0));
            let _ = eng.team_add_client("lobby", client);
        });

        engine.on("shout", |eng, client, payload| {
            let line = json!({ "from": client, "text": payload });
            let _ = eng.list_push(&path(&["lobby", "chat"]), line);
        });

        engine.before_tick(|eng| {
            let chat = path(&["lobby", "chat"]);
            while eng.list_len(&chat).map(|n| n > 50).unwrap_or(false) {
                if eng.list_shift(&chat).is_err() {
                    break;
                }
            }
        });
    }

    let address = format!("{}:{}", args.host, args.port);
    let gateway = Gateway::bind(&address, engine, transport).await?;

    tokio::select! {
        _ = gateway.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

fn path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

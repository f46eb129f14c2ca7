//! TCP gateway handling client connections and tick loop coordination

use crate::engine::Engine;
use crate::transport::Transport;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};

/// Outbound half of one accepted connection.
struct Sink {
    tx: mpsc::UnboundedSender<String>,
    backlog: Arc<AtomicUsize>,
}

/// [`Transport`] backed by per-connection writer tasks. Each payload
/// goes onto the connection's channel and counts toward its backlog
/// until the writer task has flushed it to the socket, so the
/// scheduler's backpressure check sees real unsent bytes.
#[derive(Default)]
pub struct TcpTransport {
    conns: StdMutex<HashMap<String, Sink>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, client: &str, tx: mpsc::UnboundedSender<String>, backlog: Arc<AtomicUsize>) {
        self.conns
            .lock()
            .unwrap()
            .insert(client.to_string(), Sink { tx, backlog });
    }

    fn unregister(&self, client: &str) {
        self.conns.lock().unwrap().remove(client);
    }
}

impl Transport for TcpTransport {
    fn send(&self, client: &str, payload: String) {
        let conns = self.conns.lock().unwrap();
        if let Some(sink) = conns.get(client) {
            // Count the newline the writer appends.
            sink.backlog.fetch_add(payload.len() + 1, Ordering::Relaxed);
            if sink.tx.send(payload).is_err() {
                debug!("Writer for {} is gone", client);
            }
        }
    }

    fn buffered_amount(&self, client: &str) -> usize {
        self.conns
            .lock()
            .unwrap()
            .get(client)
            .map(|sink| sink.backlog.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Accept loop and tick loop around one shared [`Engine`].
pub struct Gateway {
    listener: TcpListener,
    engine: Arc<Mutex<Engine>>,
    transport: Arc<TcpTransport>,
}

impl Gateway {
    pub async fn bind(
        addr: &str,
        engine: Arc<Mutex<Engine>>,
        transport: Arc<TcpTransport>,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", addr);
        Ok(Gateway {
            listener,
            engine,
            transport,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Runs the accept loop and the broadcast tick until the task is
    /// cancelled. Each accepted connection gets its own reader and
    /// writer task.
    pub async fn run(&self) {
        let tick_rate = {
            let engine = self.engine.lock().await;
            engine.config().tick_rate.max(1)
        };
        let mut ticker = interval(Duration::from_secs_f64(1.0 / tick_rate as f64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("Connection from {}", addr);
                            let engine = Arc::clone(&self.engine);
                            let transport = Arc::clone(&self.transport);
                            tokio::spawn(async move {
                                handle_connection(engine, transport, stream).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.engine.lock().await.tick();
                }
            }
        }
    }
}

/// One connection from admission to teardown. Inbound lines feed the
/// engine; outbound payloads drain from the channel the transport
/// writes into.
async fn handle_connection(
    engine: Arc<Mutex<Engine>>,
    transport: Arc<TcpTransport>,
    stream: TcpStream,
) {
    let (reader, writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let backlog = Arc::new(AtomicUsize::new(0));

    // Admission and registration happen under one engine lock, so a
    // tick cannot flush the welcome snapshot before the sink exists.
    let id = {
        let mut engine = engine.lock().await;
        let id = engine.client_connected();
        transport.register(&id, tx, Arc::clone(&backlog));
        id
    };

    let writer_backlog = Arc::clone(&backlog);
    let writer_task = tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        while let Some(payload) = rx.recv().await {
            let bytes = payload.len() + 1;
            let result = async {
                writer.write_all(payload.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            }
            .await;
            writer_backlog.fetch_sub(bytes, Ordering::Relaxed);
            if let Err(e) = result {
                debug!("Write failed: {}", e);
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let cut = {
                    let mut engine = engine.lock().await;
                    engine.handle_message(&id, &line)
                };
                if cut {
                    warn!("Cutting connection to {}", id);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Read from {} failed: {}", id, e);
                break;
            }
        }
    }

    transport.unregister(&id);
    engine.lock().await.client_disconnected(&id);
    writer_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use shared::update::Update;

    #[tokio::test]
    async fn transport_tracks_backlog_until_drained() {
        let transport = TcpTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        transport.register("a", tx, Arc::clone(&backlog));

        transport.send("a", "hello".to_string());
        assert_eq!(transport.buffered_amount("a"), 6);
        assert_eq!(rx.recv().await.unwrap(), "hello");

        // The writer task accounts for the drain.
        backlog.fetch_sub(6, Ordering::Relaxed);
        assert_eq!(transport.buffered_amount("a"), 0);

        transport.unregister("a");
        transport.send("a", "dropped".to_string());
        assert_eq!(transport.buffered_amount("a"), 0);
    }

    #[tokio::test]
    async fn gateway_round_trips_a_connection() {
        let transport = Arc::new(TcpTransport::new());
        let engine = Arc::new(Mutex::new(Engine::new(
            EngineConfig::default(),
            transport.clone(),
        )));
        let gateway = Gateway::bind("127.0.0.1:0", Arc::clone(&engine), Arc::clone(&transport))
            .await
            .unwrap();
        let addr = gateway.local_addr().unwrap();
        let server = tokio::spawn(async move { gateway.run().await });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let first = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("no welcome within deadline")
            .unwrap()
            .expect("connection closed early");

        let mut units = shared::decode_batch(&first).into_iter();
        match units.next() {
            Some(Ok(Update::Initialize { self_id, .. })) => {
                assert!(engine.lock().await.is_connected(&self_id));
            }
            other => panic!("expected an initialize, got {:?}", other),
        }

        drop(lines);
        // Teardown is driven by the reader task noticing the close.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if engine.lock().await.clients().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client was not torn down");
        server.abort();
    }
}

use log::info;
use serde_json::Value;
use shared::update::{Update, WireValue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// One persistent connection to the server. Inbound traffic is
/// newline-framed batches; outbound units are written one per line.
pub struct Remote {
    writer: BufWriter<OwnedWriteHalf>,
    lines: Lines<BufReader<OwnedReadHalf>>,
}

impl Remote {
    pub async fn connect(addr: &str) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect(addr).await?;
        info!("Connected to {}", addr);
        let (reader, writer) = stream.into_split();
        Ok(Remote {
            writer: BufWriter::new(writer),
            lines: BufReader::new(reader).lines(),
        })
    }

    /// Next raw payload from the server; `None` once the server closed
    /// the connection.
    pub async fn recv(&mut self) -> Result<Option<String>, std::io::Error> {
        self.lines.next_line().await
    }

    pub async fn send_update(&mut self, update: &Update) -> Result<(), std::io::Error> {
        let payload = shared::encode(update);
        self.writer.write_all(payload.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Writes into a cell this client has authority over.
    pub async fn send_edit(&mut self, path: Vec<String>, value: Value) -> Result<(), std::io::Error> {
        self.send_update(&Update::Edit {
            path,
            value: WireValue::Json(value),
        })
        .await
    }

    /// Sends a named message for the server's handlers or waiters.
    pub async fn send_message(&mut self, name: &str, payload: Value) -> Result<(), std::io::Error> {
        self.send_update(&Update::Response {
            name: name.to_string(),
            payload,
        })
        .await
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{timeout, Duration};

use crate::config::Config;
use crate::modbus::frame::{encode_frame, FrameDecoder};
use crate::services::dispatcher::RequestDispatcher;
use crate::utils::error::ServerError;

/// Per-connection bookkeeping, snapshotted into the stats log.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub address: String,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub rx_transactions: u64,
    pub tx_transactions: u64,
    /// Per-function-code request counts; only codes actually seen appear.
    pub function_counts: HashMap<u8, u64>,
}

/// Accepts TCP connections and runs one task per connection.
///
/// Each connection owns its reassembly buffer and a bounded response queue;
/// responses are written in the order their requests were decoded on that
/// connection. A connection-fatal error (framing corruption, peer reset,
/// write failure, idle timeout) terminates only that connection; the
/// listener, other connections, and the shared datastore are unaffected.
#[derive(Clone)]
pub struct ModbusTcpServer {
    config: Config,
    dispatcher: Arc<RequestDispatcher>,
    client_stats: Arc<RwLock<HashMap<String, ClientInfo>>>,
    shutdown: watch::Receiver<bool>,
}

impl ModbusTcpServer {
    pub fn new(
        config: Config,
        dispatcher: Arc<RequestDispatcher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            client_stats: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }

    /// Bind the configured address and run until the shutdown signal fires.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let bind_address = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_address).await?;
        self.serve_on(listener).await
    }

    /// Accept loop over an already-bound listener. Tests bind port 0 and
    /// pass the listener in to learn the ephemeral port first.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            "🔌 Modbus TCP server listening on {}",
            listener.local_addr()?
        );
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown too; otherwise
                    // changed() resolves instantly forever.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("🛑 Shutdown signal received, closing listener");
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            info!("🔗 Client connected: {}", addr);
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, addr.to_string()).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        self.log_client_stats().await;
        info!("✅ Modbus TCP server stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, client_id: String) {
        self.client_stats.write().await.insert(
            client_id.clone(),
            ClientInfo {
                address: client_id.clone(),
                connected_at: chrono::Utc::now(),
                rx_transactions: 0,
                tx_transactions: 0,
                function_counts: HashMap::new(),
            },
        );

        let (read_half, write_half) = stream.into_split();

        // Bounded queue: a peer that stops reading gets backpressure here
        // instead of unbounded response buffering.
        let (response_tx, response_rx) =
            mpsc::channel::<Vec<u8>>(self.config.response_queue_depth);

        let mut writer = tokio::spawn(Self::write_responses(
            write_half,
            response_rx,
            Arc::clone(&self.client_stats),
            client_id.clone(),
        ));

        let result = self.read_requests(read_half, response_tx, &client_id).await;
        if let Err(e) = &result {
            warn!("❌ Connection {} terminated: {}", client_id, e);
        }

        // The sender is dropped once the read loop returns, so the writer
        // drains whatever is queued and exits. If the peer has stopped
        // reading, abandon the remaining responses instead of waiting.
        if timeout(Duration::from_secs(5), &mut writer).await.is_err() {
            writer.abort();
        }

        if let Some(stats) = self.client_stats.write().await.remove(&client_id) {
            info!(
                "🔌 Client disconnected: {} (rx: {}, tx: {})",
                client_id, stats.rx_transactions, stats.tx_transactions
            );
        }
    }

    /// Read loop: reassemble frames, dispatch each, queue the response.
    async fn read_requests(
        &self,
        mut read_half: OwnedReadHalf,
        response_tx: mpsc::Sender<Vec<u8>>,
        client_id: &str,
    ) -> Result<(), ServerError> {
        let decoder = FrameDecoder::new();
        let mut buf = BytesMut::with_capacity(4096);
        let mut shutdown = self.shutdown.clone();
        let idle = self.config.idle_timeout_seconds.map(Duration::from_secs);

        loop {
            let n = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("closing {} on shutdown", client_id);
                        return Ok(());
                    }
                    continue;
                }
                result = Self::read_chunk(&mut read_half, &mut buf, idle) => result?,
            };

            if n == 0 {
                debug!("peer {} closed the connection", client_id);
                return Ok(());
            }

            // Drain every complete frame the buffer now holds.
            while let Some(frame) = decoder.decode(&mut buf)? {
                {
                    let mut stats = self.client_stats.write().await;
                    if let Some(info) = stats.get_mut(client_id) {
                        info.rx_transactions += 1;
                        *info.function_counts.entry(frame.function).or_insert(0) += 1;
                    }
                }

                let pdu = self.dispatcher.dispatch(&frame);
                let response = encode_frame(frame.transaction_id, frame.unit_id, &pdu);
                debug!("📤 {} <- {}", client_id, hex::encode(&response));

                if response_tx.send(response).await.is_err() {
                    // Writer already failed; the connection is done.
                    return Err(ServerError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "response writer gone",
                    )));
                }
            }
        }
    }

    async fn read_chunk(
        read_half: &mut OwnedReadHalf,
        buf: &mut BytesMut,
        idle: Option<Duration>,
    ) -> std::io::Result<usize> {
        match idle {
            Some(limit) => match timeout(limit, read_half.read_buf(buf)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "idle timeout",
                )),
            },
            None => read_half.read_buf(buf).await,
        }
    }

    /// Writer task: drains the queue in FIFO order.
    async fn write_responses(
        mut write_half: OwnedWriteHalf,
        mut response_rx: mpsc::Receiver<Vec<u8>>,
        client_stats: Arc<RwLock<HashMap<String, ClientInfo>>>,
        client_id: String,
    ) {
        while let Some(response) = response_rx.recv().await {
            if let Err(e) = write_half.write_all(&response).await {
                warn!("❌ Write to {} failed: {}", client_id, e);
                // Closing the receiver makes the read loop observe the
                // failure on its next send.
                response_rx.close();
                return;
            }
            let mut stats = client_stats.write().await;
            if let Some(info) = stats.get_mut(&client_id) {
                info.tx_transactions += 1;
            }
        }
    }

    pub async fn client_count(&self) -> usize {
        self.client_stats.read().await.len()
    }

    /// Log a JSON snapshot of all connected clients.
    pub async fn log_client_stats(&self) {
        let stats = self.client_stats.read().await;
        if stats.is_empty() {
            return;
        }
        match serde_json::to_string(&*stats) {
            Ok(json) => info!("📊 Client stats: {}", json),
            Err(e) => warn!("Failed to serialize client stats: {}", e),
        }
    }
}

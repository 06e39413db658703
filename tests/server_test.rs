use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};

use modbus_tcp_server::config::Config;
use modbus_tcp_server::services::{ModbusTcpServer, RequestDispatcher};
use modbus_tcp_server::storage::{MemoryStore, UnitRouter};
use modbus_tcp_server::QuantityLimits;

struct TestServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

async fn start_server() -> TestServer {
    let mut config = Config::default();
    config.bind_address = "127.0.0.1".to_string();
    config.port = 0;

    let store = Arc::new(MemoryStore::new(config.region_size));
    let dispatcher = Arc::new(RequestDispatcher::new(
        UnitRouter::single(store),
        QuantityLimits::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ModbusTcpServer::new(config, dispatcher, shutdown_rx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let task = tokio::spawn(async move {
        server.serve_on(listener).await.unwrap();
    });

    TestServer {
        addr,
        shutdown: shutdown_tx,
        task,
    }
}

/// Build a request frame from transaction id, unit id, and PDU bytes.
fn frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&transaction_id.to_be_bytes());
    bytes.extend_from_slice(&0u16.to_be_bytes());
    bytes.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    bytes.push(unit_id);
    bytes.extend_from_slice(pdu);
    bytes
}

/// Read one complete response frame, returning (transaction id, unit id,
/// PDU bytes).
async fn read_response(stream: &mut TcpStream) -> (u16, u8, Vec<u8>) {
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await.unwrap();
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    assert_eq!(protocol_id, 0);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let unit_id = header[6];
    let mut pdu = vec![0u8; length - 1];
    stream.read_exact(&mut pdu).await.unwrap();
    (transaction_id, unit_id, pdu)
}

#[tokio::test]
async fn read_coils_from_zeroed_store() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    // transaction 1, unit 1, read 10 coils starting at address 0
    stream
        .write_all(&frame(1, 1, &[0x01, 0x00, 0x00, 0x00, 0x0A]))
        .await
        .unwrap();

    let (tx_id, unit, pdu) = read_response(&mut stream).await;
    assert_eq!(tx_id, 1);
    assert_eq!(unit, 1);
    assert_eq!(pdu, vec![0x01, 0x02, 0x00, 0x00]);

    server.shutdown.send(true).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn write_register_then_read_back() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(&frame(7, 1, &[0x06, 0x00, 0x05, 0x12, 0x34]))
        .await
        .unwrap();
    let (_, _, echo) = read_response(&mut stream).await;
    assert_eq!(echo, vec![0x06, 0x00, 0x05, 0x12, 0x34]);

    stream
        .write_all(&frame(8, 1, &[0x03, 0x00, 0x05, 0x00, 0x01]))
        .await
        .unwrap();
    let (tx_id, _, pdu) = read_response(&mut stream).await;
    assert_eq!(tx_id, 8);
    assert_eq!(pdu, vec![0x03, 0x02, 0x12, 0x34]);

    server.shutdown.send(true).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn unknown_function_code_yields_exception() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream.write_all(&frame(2, 1, &[0x99])).await.unwrap();
    let (tx_id, _, pdu) = read_response(&mut stream).await;
    assert_eq!(tx_id, 2);
    // 0x99 already has bit 7 set, so 0x99 | 0x80 == 0x99
    assert_eq!(pdu, vec![0x99, 0x01]);

    server.shutdown.send(true).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn out_of_range_read_yields_illegal_data_address() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    // address 10000 with region length 10000
    stream
        .write_all(&frame(3, 1, &[0x03, 0x27, 0x10, 0x00, 0x01]))
        .await
        .unwrap();
    let (_, _, pdu) = read_response(&mut stream).await;
    assert_eq!(pdu, vec![0x83, 0x02]);

    server.shutdown.send(true).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn oversized_quantity_yields_illegal_data_value() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    // 126 holding registers exceeds the protocol maximum of 125
    stream
        .write_all(&frame(4, 1, &[0x03, 0x00, 0x00, 0x00, 126]))
        .await
        .unwrap();
    let (_, _, pdu) = read_response(&mut stream).await;
    assert_eq!(pdu, vec![0x83, 0x03]);

    server.shutdown.send(true).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn split_frame_delivery_decodes_once_complete() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let request = frame(5, 1, &[0x01, 0x00, 0x00, 0x00, 0x08]);
    stream.write_all(&request[..4]).await.unwrap();
    stream.flush().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    stream.write_all(&request[4..]).await.unwrap();

    let (tx_id, _, pdu) = read_response(&mut stream).await;
    assert_eq!(tx_id, 5);
    assert_eq!(pdu, vec![0x01, 0x01, 0x00]);

    server.shutdown.send(true).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn pipelined_requests_answered_in_fifo_order() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut batch = Vec::new();
    for tx_id in 10u16..15 {
        batch.extend_from_slice(&frame(tx_id, 1, &[0x03, 0x00, 0x00, 0x00, 0x01]));
    }
    stream.write_all(&batch).await.unwrap();

    for expected in 10u16..15 {
        let (tx_id, _, pdu) = read_response(&mut stream).await;
        assert_eq!(tx_id, expected);
        assert_eq!(pdu, vec![0x03, 0x02, 0x00, 0x00]);
    }

    server.shutdown.send(true).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn framing_error_closes_only_that_connection() {
    let server = start_server().await;
    let mut bad = TcpStream::connect(server.addr).await.unwrap();
    let mut good = TcpStream::connect(server.addr).await.unwrap();

    // Nonzero protocol id: connection-fatal, no response sent
    let mut corrupt = frame(6, 1, &[0x01, 0x00, 0x00, 0x00, 0x01]);
    corrupt[3] = 0x01;
    bad.write_all(&corrupt).await.unwrap();

    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), bad.read(&mut buf))
        .await
        .expect("connection should close")
        .unwrap();
    assert_eq!(n, 0, "server must close the corrupted connection");

    // The healthy connection is unaffected
    good.write_all(&frame(9, 1, &[0x01, 0x00, 0x00, 0x00, 0x01]))
        .await
        .unwrap();
    let (tx_id, _, pdu) = read_response(&mut good).await;
    assert_eq!(tx_id, 9);
    assert_eq!(pdu, vec![0x01, 0x01, 0x00]);

    server.shutdown.send(true).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn writes_from_one_connection_visible_to_another() {
    let server = start_server().await;
    let mut writer = TcpStream::connect(server.addr).await.unwrap();
    let mut reader = TcpStream::connect(server.addr).await.unwrap();

    // write multiple registers [1, 2, 3] at address 100
    writer
        .write_all(&frame(
            20,
            1,
            &[0x10, 0x00, 0x64, 0x00, 0x03, 0x06, 0, 1, 0, 2, 0, 3],
        ))
        .await
        .unwrap();
    let (_, _, ack) = read_response(&mut writer).await;
    assert_eq!(ack, vec![0x10, 0x00, 0x64, 0x00, 0x03]);

    reader
        .write_all(&frame(21, 1, &[0x03, 0x00, 0x64, 0x00, 0x03]))
        .await
        .unwrap();
    let (_, _, pdu) = read_response(&mut reader).await;
    assert_eq!(pdu, vec![0x03, 0x06, 0, 1, 0, 2, 0, 3]);

    server.shutdown.send(true).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn dropped_shutdown_sender_stops_server() {
    let server = start_server().await;

    // Closing the channel without ever sending must behave like shutdown,
    // not leave the accept loop spinning.
    drop(server.shutdown);
    timeout(Duration::from_secs(2), server.task)
        .await
        .expect("server should stop when the shutdown channel closes")
        .unwrap();
}

#[tokio::test]
async fn dropped_shutdown_sender_closes_connections() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(&frame(1, 1, &[0x01, 0x00, 0x00, 0x00, 0x01]))
        .await
        .unwrap();
    let (_, _, pdu) = read_response(&mut stream).await;
    assert_eq!(pdu, vec![0x01, 0x01, 0x00]);

    drop(server.shutdown);

    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("connection should close when the shutdown channel closes")
        .unwrap();
    assert_eq!(n, 0);

    timeout(Duration::from_secs(2), server.task)
        .await
        .expect("server should stop when the shutdown channel closes")
        .unwrap();
}

#[tokio::test]
async fn bind_failure_surfaces_as_error() {
    // Occupy a port, then point a second server at it.
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = occupied.local_addr().unwrap();

    let mut config = Config::default();
    config.bind_address = addr.ip().to_string();
    config.port = addr.port();

    let store = Arc::new(MemoryStore::new(config.region_size));
    let dispatcher = Arc::new(RequestDispatcher::new(
        UnitRouter::single(store),
        QuantityLimits::default(),
    ));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ModbusTcpServer::new(config, dispatcher, shutdown_rx);

    assert!(server.serve().await.is_err());
}

#[tokio::test]
async fn graceful_shutdown_stops_accept_loop() {
    let server = start_server().await;

    server.shutdown.send(true).unwrap();
    timeout(Duration::from_secs(2), server.task)
        .await
        .expect("server should stop promptly")
        .unwrap();

    // New connections are refused once the listener is gone
    sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(server.addr).await.is_err());
}

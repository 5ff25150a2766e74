//! End-to-end tests against a server bound on loopback ephemeral ports.

use async_trait::async_trait;
use plaza_server::{
    DisconnectReason, InboundPacket, Packet, PacketHandler, PacketRouter, PacketType,
    PresenceServer, ReliablePacket, Result, ServerConfig, Session, SessionObserver,
    SessionRegistry, UnreliablePacket,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const ECHO: PacketType = 1;
const READY: PacketType = 2;
const UDP_ECHO: PacketType = 3;
const BLAST: PacketType = 5;

/// Replies on the reliable channel with the same type and payload.
struct Echo;

#[async_trait]
impl PacketHandler for Echo {
    fn packet_type(&self) -> PacketType {
        ECHO
    }

    async fn handle(&self, packet: &InboundPacket, session: &Arc<Session>) -> Result<()> {
        let reply = ReliablePacket::new(ECHO, session.id(), packet.payload().to_vec());
        session.send_reliable(&reply).await
    }
}

/// Marks the session ready and tells the client its id.
struct MarkReady;

#[async_trait]
impl PacketHandler for MarkReady {
    fn packet_type(&self) -> PacketType {
        READY
    }

    async fn handle(&self, _packet: &InboundPacket, session: &Arc<Session>) -> Result<()> {
        session.set_ready(true);
        let reply = ReliablePacket::new(READY, session.id(), session.id().to_string());
        session.send_reliable(&reply).await
    }
}

/// Replies on the unreliable channel.
struct UdpEcho;

#[async_trait]
impl PacketHandler for UdpEcho {
    fn packet_type(&self) -> PacketType {
        UDP_ECHO
    }

    async fn handle(&self, packet: &InboundPacket, session: &Arc<Session>) -> Result<()> {
        let reply = UnreliablePacket::new(UDP_ECHO, session.id(), packet.payload().to_vec())
            .with_sequence(session.next_unreliable_sequence());
        session.send_unreliable(&reply).await
    }
}

/// Sends a near-maximum frame to every other ready session.
struct Blast(Arc<SessionRegistry>);

#[async_trait]
impl PacketHandler for Blast {
    fn packet_type(&self) -> PacketType {
        BLAST
    }

    async fn handle(&self, _packet: &InboundPacket, session: &Arc<Session>) -> Result<()> {
        let packet = ReliablePacket::new(BLAST, session.id(), vec![0xAB; 60_000]);
        self.0.broadcast_reliable_except(&packet, session.id()).await?;
        Ok(())
    }
}

struct ClosedSessions(mpsc::UnboundedSender<(u32, DisconnectReason)>);

#[async_trait]
impl SessionObserver for ClosedSessions {
    async fn on_session_closed(&self, session: &Arc<Session>, reason: &DisconnectReason) {
        let _ = self.0.send((session.id(), reason.clone()));
    }
}

struct Running {
    reliable: SocketAddr,
    unreliable: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
    closed: mpsc::UnboundedReceiver<(u32, DisconnectReason)>,
}

async fn start_server() -> Running {
    start_server_with_write_timeout(ServerConfig::default().write_timeout).await
}

async fn start_server_with_write_timeout(write_timeout: Duration) -> Running {
    let config = ServerConfig {
        reliable_bind_address: "127.0.0.1:0".parse().unwrap(),
        unreliable_bind_address: "127.0.0.1:0".parse().unwrap(),
        supervisor_interval: Duration::from_millis(100),
        write_timeout,
        ..ServerConfig::default()
    };

    let (tx, closed) = mpsc::unbounded_channel();
    let server = PresenceServer::bind_with(config, |registry| {
        PacketRouter::new().with_handlers([
            Arc::new(Echo) as Arc<dyn PacketHandler>,
            Arc::new(MarkReady),
            Arc::new(UdpEcho),
            Arc::new(Blast(registry.clone())),
        ])
    })
    .await
    .unwrap()
    .with_observer(Arc::new(ClosedSessions(tx)));

    Running {
        reliable: server.reliable_addr(),
        unreliable: server.unreliable_addr(),
        registry: server.registry(),
        shutdown: server.shutdown_token(),
        task: tokio::spawn(server.run()),
        closed,
    }
}

async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> ReliablePacket {
    timeout(Duration::from_secs(2), next_frame(stream))
        .await
        .expect("timed out waiting for a frame")
}

async fn next_frame<R: AsyncRead + Unpin>(stream: &mut R) -> ReliablePacket {
    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).await.unwrap();
    let total = u16::from_be_bytes(prefix) as usize;
    let mut rest = vec![0u8; total];
    stream.read_exact(&mut rest).await.unwrap();

    let mut frame = prefix.to_vec();
    frame.extend_from_slice(&rest);
    ReliablePacket::decode(&frame).unwrap()
}

async fn wait_for_sessions(registry: &SessionRegistry, count: usize) {
    timeout(Duration::from_secs(2), async {
        while registry.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry never reached the expected size");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_split_and_coalesced_frames_arrive_in_order() {
    let server = start_server().await;
    let mut client = TcpStream::connect(server.reliable).await.unwrap();

    let payloads: Vec<Vec<u8>> = vec![b"first".to_vec(), Vec::new(), vec![9u8; 5000], b"last".to_vec()];
    let mut stream = Vec::new();
    for payload in &payloads {
        stream.extend_from_slice(&ReliablePacket::new(ECHO, 0, payload.clone()).to_bytes().unwrap());
    }

    // Half the stream one byte at a time, the rest in a single write.
    let split = stream.len() / 2;
    for byte in &stream[..split] {
        client.write_all(std::slice::from_ref(byte)).await.unwrap();
        client.flush().await.unwrap();
    }
    client.write_all(&stream[split..]).await.unwrap();

    for payload in &payloads {
        let reply = read_frame(&mut client).await;
        assert_eq!(reply.packet_type, ECHO);
        assert_eq!(reply.payload.to_vec(), *payload);
    }

    server.shutdown.cancel();
    server.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_frame_keeps_connection_open() {
    let server = start_server().await;
    let mut client = TcpStream::connect(server.reliable).await.unwrap();

    // Length prefix of 3 is shorter than the header: dropped, not fatal.
    client.write_all(&[0, 3, 1, 2, 3]).await.unwrap();
    client
        .write_all(&ReliablePacket::new(ECHO, 0, &b"after"[..]).to_bytes().unwrap())
        .await
        .unwrap();

    let reply = read_frame(&mut client).await;
    assert_eq!(&reply.payload[..], b"after");

    server.shutdown.cancel();
    server.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_datagram_address_binding() {
    let server = start_server().await;
    let mut client = TcpStream::connect(server.reliable).await.unwrap();
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client
        .write_all(&ReliablePacket::new(READY, 0, Vec::<u8>::new()).to_bytes().unwrap())
        .await
        .unwrap();
    let ready = read_frame(&mut client).await;
    let session_id: u32 = ready.payload_str().unwrap().parse().unwrap();
    assert_eq!(ready.session_id, session_id);

    let ping = UnreliablePacket::new(UDP_ECHO, session_id, &b"pos"[..]).with_sequence(1);
    udp.send_to(&ping.to_bytes(), server.unreliable).await.unwrap();

    let mut buf = [0u8; 512];
    let (len, from) = timeout(Duration::from_secs(2), udp.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, server.unreliable);
    let reply = UnreliablePacket::decode(&buf[..len]).unwrap();
    assert_eq!(reply.session_id, session_id);
    assert_eq!(&reply.payload[..], b"pos");

    let bound = server
        .registry
        .get_by_unreliable_addr(udp.local_addr().unwrap())
        .unwrap();
    assert_eq!(bound.id(), session_id);

    // A datagram naming an unknown session is silently dropped.
    udp.send_to(&UnreliablePacket::new(UDP_ECHO, 9999, Vec::<u8>::new()).to_bytes(), server.unreliable)
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(200), udp.recv_from(&mut buf)).await.is_err());

    server.shutdown.cancel();
    server.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_close_removes_session_once() {
    let mut server = start_server().await;
    let client = TcpStream::connect(server.reliable).await.unwrap();
    wait_for_sessions(&server.registry, 1).await;

    drop(client);
    let (id, reason) = timeout(Duration::from_secs(2), server.closed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, 1);
    assert_eq!(reason, DisconnectReason::PeerClosed);
    assert!(server.registry.is_empty());

    server.shutdown.cancel();
    server.task.await.unwrap().unwrap();
    assert!(server.closed.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_open_connections() {
    let mut server = start_server().await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(server.reliable).await.unwrap());
    }
    wait_for_sessions(&server.registry, 3).await;

    server.shutdown.cancel();
    timeout(Duration::from_secs(2), server.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert!(server.registry.is_empty());

    for client in &mut clients {
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    let mut reasons = Vec::new();
    while let Ok((_, reason)) = server.closed.try_recv() {
        reasons.push(reason);
    }
    assert_eq!(reasons.len(), 3);
    assert!(reasons.iter().all(|r| *r == DisconnectReason::Shutdown));
}

/// Connects and marks the session ready, returning its id.
async fn connect_ready(addr: SocketAddr) -> (TcpStream, u32) {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&ReliablePacket::new(READY, 0, Vec::<u8>::new()).to_bytes().unwrap())
        .await
        .unwrap();
    let ready = read_frame(&mut client).await;
    (client, ready.payload_str().unwrap().parse().unwrap())
}

/// Writes `count` broadcast requests followed by an echo of `marker`.
fn spawn_blaster(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    count: usize,
    marker: &'static [u8],
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let blast = ReliablePacket::new(BLAST, 0, Vec::<u8>::new()).to_bytes().unwrap();
        for _ in 0..count {
            if writer.write_all(&blast).await.is_err() {
                return;
            }
        }
        let echo = ReliablePacket::new(ECHO, 0, marker).to_bytes().unwrap();
        let _ = writer.write_all(&echo).await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_reader_is_dropped_without_wedging_others() {
    let mut server = start_server_with_write_timeout(Duration::from_millis(200)).await;

    // Ready, then never reads again.
    let (_stalled, stalled_id) = connect_ready(server.reliable).await;
    let (sender, sender_id) = connect_ready(server.reliable).await;
    let (mut reader, writer) = sender.into_split();
    let blaster = spawn_blaster(writer, 400, b"done");

    // The sender's later packets are still dispatched.
    let reply = timeout(Duration::from_secs(10), next_frame(&mut reader))
        .await
        .expect("sender's echo never came back");
    assert_eq!(reply.packet_type, ECHO);
    assert_eq!(&reply.payload[..], b"done");
    blaster.await.unwrap();

    assert!(server.registry.get(stalled_id).is_none());
    assert!(server.registry.get(sender_id).is_some());
    let (id, reason) = timeout(Duration::from_secs(2), server.closed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, stalled_id);
    assert_eq!(reason, DisconnectReason::Closed);

    server.shutdown.cancel();
    timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_interrupts_stalled_broadcast() {
    // Long enough that only cancellation can end the stalled write.
    let server = start_server_with_write_timeout(Duration::from_secs(60)).await;

    let (_stalled, _) = connect_ready(server.reliable).await;
    let (sender, _) = connect_ready(server.reliable).await;
    let (_reader, writer) = sender.into_split();
    let blaster = spawn_blaster(writer, 400, b"never");

    tokio::time::sleep(Duration::from_millis(500)).await;
    server.shutdown.cancel();

    timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server wedged on a stalled write")
        .unwrap()
        .unwrap();
    assert!(server.registry.is_empty());
    blaster.abort();
}

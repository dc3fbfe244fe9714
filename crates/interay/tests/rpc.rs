use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use interay::entity::Envelope;
use interay::{
    Access, DisconnectReason, GenericSerializer, HostType, MethodHandler, NetContext, NetError,
    NetworkEntity, NetworkId, NetworkManager, NetworkSettings, PacketBuffer, PeerId, Recipient,
    ReliableUdpTransport, Serializer, Transport, TransportHandler, Value, method_id,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(42000);
static SESSION_LOCK: Mutex<()> = Mutex::new(());

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn lock() -> MutexGuard<'static, ()> {
    SESSION_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct Board {
    posts: Vec<String>,
    resets: usize,
    welcomed: Vec<PeerId>,
}

impl NetworkEntity for Board {
    fn on_client_connect(&mut self, ctx: &mut NetContext<'_>, peer: PeerId) -> interay::Result<()> {
        self.welcomed.push(peer);
        let greeting = format!("welcome {}", peer);
        ctx.send("welcome", Some(Value::from(greeting)), Recipient::Peer(peer.0.into()));
        Ok(())
    }
}

fn board_server(port: u16) -> NetworkManager {
    let mut manager = NetworkManager::with_transport(ReliableUdpTransport::new()).unwrap();
    manager.set_host_entity(Box::new(Board::default()));
    manager
        .register_method(
            "post",
            Access::ALLOW_CLIENT,
            MethodHandler::data(|board: &mut Board, _ctx, data: Value| {
                let text = data
                    .as_str()
                    .ok_or_else(|| NetError::entity("post expects a string"))?;
                board.posts.push(text.to_string());
                Ok(())
            }),
        )
        .unwrap();
    manager
        .register_method(
            "reset",
            Access::ALLOW_SERVER,
            MethodHandler::unit(|board: &mut Board, _ctx| {
                board.resets += 1;
                Ok(())
            }),
        )
        .unwrap();
    manager
        .start_hostname(HostType::Server, &format!("127.0.0.1:{}", port))
        .unwrap();
    manager
}

#[derive(Default)]
struct Inbox {
    connected: bool,
    messages: Vec<Vec<u8>>,
}

impl TransportHandler for Inbox {
    fn on_connected(&mut self, _peer: PeerId) -> interay::Result<()> {
        self.connected = true;
        Ok(())
    }

    fn on_disconnected(&mut self, _peer: PeerId, _reason: DisconnectReason) -> interay::Result<()> {
        self.connected = false;
        Ok(())
    }

    fn on_received(&mut self, _peer: PeerId, packet: &mut PacketBuffer<'_>) -> interay::Result<()> {
        self.messages.push(packet.read_bytes(packet.remaining())?);
        Ok(())
    }
}

struct RawClient {
    transport: ReliableUdpTransport,
    inbox: Inbox,
}

impl RawClient {
    fn connect(port: u16) -> Self {
        let mut transport = ReliableUdpTransport::new();
        transport.initialize().unwrap();
        transport.start(HostType::Client, "127.0.0.1", port).unwrap();
        Self {
            transport,
            inbox: Inbox::default(),
        }
    }

    fn call(&mut self, instance: NetworkId, method: &str, payload: Option<Value>) {
        let envelope = Envelope::new(instance, method_id(method), Recipient::Broadcast, payload.is_some());
        let serializer = GenericSerializer::new();
        let payload_len = payload
            .as_ref()
            .map_or(0, |value| serializer.encoded_len(value).unwrap());
        let mut packet = self.transport.create_packet(envelope.encoded_len() + payload_len);
        envelope.encode(&mut packet).unwrap();
        if let Some(value) = &payload {
            serializer.serialize(&mut packet, value).unwrap();
        }
        self.transport.send(&packet).unwrap();
    }
}

fn pump_until(
    manager: &mut NetworkManager,
    client: &mut RawClient,
    timeout_ms: u64,
    done: impl Fn(&NetworkManager, &RawClient) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        manager.tick(Duration::from_millis(1));
        client
            .transport
            .tick(Duration::from_millis(1), &mut client.inbox);
        if done(manager, client) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn board(manager: &NetworkManager) -> &Board {
    manager.entity::<Board>(NetworkId::HOST).unwrap()
}

#[test]
fn payload_only_call_reaches_the_host_entity() {
    let _lock = lock();
    let port = next_port();
    let mut server = board_server(port);
    let mut client = RawClient::connect(port);

    assert!(pump_until(&mut server, &mut client, 2000, |_, client| client.inbox.connected));
    client.call(NetworkId::HOST, "post", Some(Value::from("first!")));

    assert!(pump_until(&mut server, &mut client, 2000, |server, _| {
        !board(server).posts.is_empty()
    }));
    assert_eq!(board(&server).posts, vec!["first!".to_string()]);
    assert_eq!(server.peers(), &[PeerId(1)]);
}

#[test]
fn connect_hook_answers_the_new_client() {
    let _lock = lock();
    let port = next_port();
    let mut server = board_server(port);
    let mut client = RawClient::connect(port);

    assert!(pump_until(&mut server, &mut client, 2000, |_, client| {
        !client.inbox.messages.is_empty()
    }));
    assert_eq!(board(&server).welcomed, vec![PeerId(1)]);

    let mut bytes = client.inbox.messages[0].clone();
    let mut packet = PacketBuffer::borrowed(&mut bytes);
    let envelope = Envelope::decode(&mut packet).unwrap();
    assert_eq!(envelope.instance, NetworkId::HOST);
    assert_eq!(envelope.method, method_id("welcome"));
    assert_eq!(envelope.recipient, Recipient::Peer(1));
    let greeting = GenericSerializer::new().deserialize(&mut packet).unwrap();
    assert_eq!(greeting.as_str(), Some("welcome 1"));
}

#[test]
fn rejected_messages_do_not_block_later_ones() {
    let _lock = lock();
    let port = next_port();
    let mut server = board_server(port);
    let mut client = RawClient::connect(port);

    assert!(pump_until(&mut server, &mut client, 2000, |_, client| client.inbox.connected));
    // server-only method
    client.call(NetworkId::HOST, "reset", None);
    // no such entity
    client.call(NetworkId(77), "post", Some(Value::from("lost")));
    // wrong payload type
    client.call(NetworkId::HOST, "post", Some(Value::from(5i32)));
    client.call(NetworkId::HOST, "post", Some(Value::from("kept")));

    assert!(pump_until(&mut server, &mut client, 2000, |server, _| {
        !board(server).posts.is_empty()
    }));
    let board = board(&server);
    assert_eq!(board.posts, vec!["kept".to_string()]);
    assert_eq!(board.resets, 0);
}

#[test]
fn live_settings_changes_can_be_refused() {
    let _lock = lock();
    let port = next_port();
    let mut server = board_server(port);
    let before = server.settings().clone();

    let refused = server.set_settings(before.clone().with_max_connections(3));
    assert!(refused.is_err());
    assert_eq!(server.settings(), &before);

    server.set_settings(before.with_tick_rate(30)).unwrap();
    assert_eq!(server.settings().tick_rate(), 30);

    server.stop();
    server
        .set_settings(NetworkSettings::default().with_max_connections(3))
        .unwrap();
    assert_eq!(server.settings().max_connections(), 3);
}

#[test]
fn stopped_manager_ignores_ticks() {
    let _lock = lock();
    let port = next_port();
    let mut server = board_server(port);
    server.stop();
    assert!(!server.is_running());

    server.tick(Duration::from_secs(1));
    assert!(server
        .send(NetworkId::HOST, "post", Some(Value::from("late")), Recipient::Broadcast)
        .is_err());
    assert!(board(&server).posts.is_empty());

    // the port is free again
    server
        .start_hostname(HostType::Server, &format!("127.0.0.1:{}", port))
        .unwrap();
    assert!(server.local_addr().is_some());
}

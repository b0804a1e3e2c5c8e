//! Full-stack tests over real TCP: login, document lifecycle, concurrent
//! edits from two clients, sync, presence, and idle reaping.

use std::io::BufReader;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use cowrite::client::DocumentClient;
use cowrite::config::{Config, ServerConfig};
use cowrite::ot::OpKind;
use cowrite::protocol::{
    AuthPayload, Body, DocPayload, EditPayload, FrameReader, FrameWriter, Header, Message,
    MessageType, SyncPayload,
};
use cowrite::server::Server;

struct Client {
    writer: FrameWriter<TcpStream>,
    reader: FrameReader<BufReader<TcpStream>>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        Self {
            writer: FrameWriter::new(stream.try_clone().expect("clone"), 1 << 20),
            reader: FrameReader::new(BufReader::new(stream), 1 << 20),
        }
    }

    fn send(&mut self, kind: MessageType, body: Body) {
        let message = Message::new(kind, Header::default(), body);
        self.writer
            .write_frame(&message.encode().expect("encode"))
            .expect("write");
    }

    fn recv(&mut self) -> Message {
        let line = self.reader.read_next().expect("read").expect("frame");
        Message::decode(&line).expect("decode")
    }

    /// Skip frames (presence updates arrive interleaved) until `kind`.
    fn recv_until(&mut self, kind: MessageType) -> Message {
        for _ in 0..16 {
            let message = self.recv();
            if message.kind == kind {
                return message;
            }
        }
        panic!("no {kind:?} frame within 16 frames");
    }

    fn login(&mut self, name: &str) {
        self.send(
            MessageType::AuthLogin,
            Body::Auth(AuthPayload {
                username: name.into(),
                error_message: None,
            }),
        );
        let reply = self.recv_until(MessageType::AuthSuccess);
        assert_eq!(reply.auth().unwrap().username, name);
    }

    fn open(&mut self, doc: &str) -> (String, u64) {
        self.send(
            MessageType::DocOpen,
            Body::Document(DocPayload {
                document_id: doc.into(),
                ..Default::default()
            }),
        );
        let reply = self.recv_until(MessageType::DocResponse);
        let payload = reply.document().unwrap();
        assert_eq!(payload.success, Some(true));
        (
            payload.document_content.clone().unwrap_or_default(),
            payload.document_version.unwrap_or_default(),
        )
    }

    fn insert(&mut self, doc: &str, op_id: &str, base: u64, position: usize, text: &str) {
        self.send(
            MessageType::EditInsert,
            Body::Edit(EditPayload {
                document_id: doc.into(),
                document_version: base,
                operation_id: op_id.into(),
                position: Some(position),
                text: Some(text.into()),
                ..Default::default()
            }),
        );
    }
}

fn start_server(config: Config) -> (cowrite::server::ServerHandle, SocketAddr) {
    let handle = Server::new(config).start().expect("start");
    let mut addr = handle.local_addr();
    addr.set_ip("127.0.0.1".parse().unwrap());
    (handle, addr)
}

fn test_config() -> Config {
    Config {
        server: ServerConfig {
            port: 0,
            threads: Some(2),
            ..ServerConfig::default()
        },
        ..Config::default()
    }
}

#[test]
fn two_clients_converge_on_concurrent_inserts() {
    let (handle, addr) = start_server(test_config());

    let mut alice = Client::connect(addr);
    alice.login("alice");
    alice.send(
        MessageType::DocCreate,
        Body::Document(DocPayload {
            document_id: "notes".into(),
            document_name: Some("Notes".into()),
            document_content: Some("ab".into()),
            ..Default::default()
        }),
    );
    let created = alice.recv_until(MessageType::DocResponse);
    assert_eq!(created.document().unwrap().success, Some(true));
    let (content, version) = alice.open("notes");
    assert_eq!((content.as_str(), version), ("ab", 0));

    let mut bob = Client::connect(addr);
    bob.login("bob");
    let (content, _) = bob.open("notes");
    assert_eq!(content, "ab");

    // Alice inserts at 1; both sides see the canonical broadcast.
    alice.insert("notes", "alice#1", 0, 1, "X");
    let ack = alice.recv_until(MessageType::EditApply);
    assert_eq!(ack.edit().unwrap().document_version, 1);
    assert_eq!(ack.edit().unwrap().operation_id, "alice#1");
    let seen = bob.recv_until(MessageType::EditApply);
    assert_eq!(seen.edit().unwrap().operation, Some(OpKind::insert(1, "X")));

    // Bob, still on base 0, inserts at the same spot; the author tie-break
    // lands him after Alice.
    bob.insert("notes", "bob#1", 0, 1, "Y");
    let seen = alice.recv_until(MessageType::EditApply);
    let edit = seen.edit().unwrap();
    assert_eq!(edit.document_version, 2);
    assert_eq!(edit.operation, Some(OpKind::insert(2, "Y")));
    let ack = bob.recv_until(MessageType::EditApply);
    assert_eq!(ack.edit().unwrap().operation, Some(OpKind::insert(2, "Y")));

    // A cold client can replay the full canonical history.
    let mut carol = Client::connect(addr);
    carol.login("carol");
    let (content, version) = carol.open("notes");
    assert_eq!((content.as_str(), version), ("aXYb", 2));

    handle.stop();
}

#[test]
fn sync_request_replays_canonical_operations() {
    let (handle, addr) = start_server(test_config());

    let mut alice = Client::connect(addr);
    alice.login("alice");
    alice.send(
        MessageType::DocCreate,
        Body::Document(DocPayload {
            document_id: "doc".into(),
            ..Default::default()
        }),
    );
    alice.recv_until(MessageType::DocResponse);
    alice.open("doc");

    alice.insert("doc", "alice#1", 0, 0, "a");
    alice.recv_until(MessageType::EditApply);
    alice.insert("doc", "alice#2", 1, 1, "b");
    alice.recv_until(MessageType::EditApply);

    alice.send(
        MessageType::SyncRequest,
        Body::Sync(SyncPayload {
            document_id: "doc".into(),
            from_version: Some(0),
            ..Default::default()
        }),
    );
    let reply = alice.recv_until(MessageType::SyncResponse);
    let sync = reply.sync().unwrap();
    assert_eq!(sync.to_version, Some(2));
    assert_eq!(sync.operations.len(), 2);
    assert_eq!(
        OpKind::from_wire(&sync.operations[0]).unwrap(),
        OpKind::insert(0, "a")
    );

    handle.stop();
}

#[test]
fn rejected_edits_reach_only_their_author() {
    let (handle, addr) = start_server(test_config());

    let mut alice = Client::connect(addr);
    alice.login("alice");
    alice.send(
        MessageType::DocCreate,
        Body::Document(DocPayload {
            document_id: "doc".into(),
            document_content: Some("ab".into()),
            ..Default::default()
        }),
    );
    alice.recv_until(MessageType::DocResponse);
    alice.open("doc");

    // Way out of bounds even after rebasing.
    alice.send(
        MessageType::EditDelete,
        Body::Edit(EditPayload {
            document_id: "doc".into(),
            document_version: 0,
            operation_id: "alice#1".into(),
            position: Some(0),
            length: Some(99),
            ..Default::default()
        }),
    );
    let reply = alice.recv_until(MessageType::EditReject);
    let edit = reply.edit().unwrap();
    assert_eq!(edit.operation_id, "alice#1");
    assert_eq!(edit.success, Some(false));
    assert!(edit.error_message.is_some());

    handle.stop();
}

#[test]
fn presence_flows_between_participants() {
    let (handle, addr) = start_server(test_config());

    let mut alice = Client::connect(addr);
    alice.login("alice");
    alice.send(
        MessageType::DocCreate,
        Body::Document(DocPayload {
            document_id: "doc".into(),
            ..Default::default()
        }),
    );
    alice.recv_until(MessageType::DocResponse);
    alice.open("doc");

    let mut bob = Client::connect(addr);
    bob.login("bob");
    bob.open("doc");

    // Alice learns that Bob joined.
    let join = alice.recv_until(MessageType::PresenceJoin);
    let Body::Presence(presence) = &join.body else {
        panic!("presence body");
    };
    assert_eq!(presence.username, "bob");

    // Dropping Bob's socket produces a leave notice.
    drop(bob);
    let leave = alice.recv_until(MessageType::PresenceLeave);
    let Body::Presence(presence) = &leave.body else {
        panic!("presence body");
    };
    assert_eq!(presence.document_id, "doc");
    assert_eq!(presence.username, "bob");

    handle.stop();
}

#[test]
fn document_clients_converge_through_the_full_stack() {
    let (handle, addr) = start_server(test_config());

    let mut alice = DocumentClient::connect(addr, "alice").expect("alice");
    alice.create_document("pad", "Pad", "ab").expect("create");
    let (content, version) = alice.open("pad").expect("open");
    assert_eq!((content.as_str(), version), ("ab", 0));

    let mut bob = DocumentClient::connect(addr, "bob").expect("bob");
    bob.open("pad").expect("open");

    // Both type at the same position before seeing each other's edit.
    alice.insert(1, "X").expect("insert");
    bob.insert(1, "Y").expect("insert");
    alice.sync_to(2).expect("alice sync");
    bob.sync_to(2).expect("bob sync");

    assert_eq!(alice.content().unwrap(), "aXYb");
    assert_eq!(bob.content().unwrap(), "aXYb");

    handle.stop();
}

#[test]
fn undo_propagates_through_the_full_stack() {
    let (handle, addr) = start_server(test_config());

    let mut alice = DocumentClient::connect(addr, "alice").expect("alice");
    alice.create_document("doc", "doc", "").expect("create");
    alice.open("doc").expect("open");
    let mut bob = DocumentClient::connect(addr, "bob").expect("bob");
    bob.open("doc").expect("open");

    alice.insert(0, "hello").expect("insert");
    alice.sync_to(1).expect("sync");
    bob.sync_to(1).expect("sync");

    bob.insert(5, " world").expect("insert");
    bob.sync_to(2).expect("sync");
    alice.sync_to(2).expect("sync");
    assert_eq!(alice.content().unwrap(), "hello world");

    // Alice's undo removes only her own text, wherever it now lives.
    assert!(alice.undo().expect("undo"));
    alice.sync_to(3).expect("sync");
    bob.sync_to(3).expect("sync");
    assert_eq!(alice.content().unwrap(), " world");
    assert_eq!(bob.content().unwrap(), " world");

    handle.stop();
}

#[test]
fn queued_local_edits_drain_in_order() {
    let (handle, addr) = start_server(test_config());

    let mut alice = DocumentClient::connect(addr, "alice").expect("alice");
    alice.create_document("doc", "doc", "").expect("create");
    alice.open("doc").expect("open");

    // Two edits back to back; the second waits for the first ack.
    alice.insert(0, "a").expect("insert");
    alice.insert(1, "b").expect("insert");
    alice.sync_to(2).expect("sync");
    assert_eq!(alice.content().unwrap(), "ab");

    // A fresh client sees the same canonical result.
    let mut carol = DocumentClient::connect(addr, "carol").expect("carol");
    let (content, version) = carol.open("doc").expect("open");
    assert_eq!((content.as_str(), version), ("ab", 2));

    handle.stop();
}

#[test]
fn idle_sessions_receive_a_disconnect_notice() {
    let mut config = test_config();
    config.server.cleanup_interval_secs = 1;
    config.server.max_idle_secs = 0;
    let (handle, addr) = start_server(config);

    let mut client = Client::connect(addr);
    client.login("alice");

    // The reaper closes the session on its next sweep.
    let notice = client.recv_until(MessageType::SysDisconnect);
    let Body::System(system) = &notice.body else {
        panic!("system body");
    };
    assert_eq!(system.message.as_deref(), Some("idle timeout"));
    assert!(matches!(client.reader.read_next(), Ok(None) | Err(_)));

    handle.stop();
}

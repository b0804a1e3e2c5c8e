//! TCP runtime: accept loop, per-connection reader/writer threads, the
//! worker pool, the idle reaper, and graceful shutdown.
//!
//! Ordering: inbound frames are routed to workers by session, so one
//! client's stream is handled in submission order; a per-document dispatch
//! guard spans sequencing and fan-out, so broadcasts leave in log order.
//! No lock is held across socket I/O; outbound frames go through
//! per-connection channels drained by writer threads.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use thiserror::Error;

use super::handlers::{Engine, Outbound, Recipient};
use super::registry::SessionId;
use super::{DocumentId, now_ms};
use crate::config::Config;
use crate::protocol::{Body, FrameReader, FrameWriter, Message};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Server {
    config: Config,
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    router: Arc<Router>,
    joins: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Stop accepting, close every session, and join all server threads.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.router.close_all();
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.server.port))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let engine = Arc::new(Engine::new(&self.config.limits));
        let router = Arc::new(Router::default());
        let max_frame_bytes = self.config.limits.max_frame_bytes;

        let workers = self.config.server.worker_threads();
        let mut inboxes: Vec<Sender<(SessionId, Message)>> = Vec::with_capacity(workers);
        let mut joins = Vec::new();
        for index in 0..workers {
            let (tx, rx) = crossbeam::channel::unbounded();
            inboxes.push(tx);
            let worker_engine = Arc::clone(&engine);
            let worker_router = Arc::clone(&router);
            let span = tracing::Span::current();
            joins.push(thread::spawn(move || {
                span.in_scope(|| run_worker(index, rx, worker_engine, worker_router));
            }));
        }

        let accept = AcceptLoop {
            listener,
            engine: Arc::clone(&engine),
            router: Arc::clone(&router),
            inboxes,
            shutdown: Arc::clone(&shutdown),
            max_frame_bytes,
        };
        let accept_span = tracing::Span::current();
        joins.push(thread::spawn(move || {
            accept_span.in_scope(|| accept.run());
        }));

        let reaper_engine = Arc::clone(&engine);
        let reaper_router = Arc::clone(&router);
        let reaper_shutdown = Arc::clone(&shutdown);
        let interval = Duration::from_secs(self.config.server.cleanup_interval_secs.max(1));
        let max_idle = self.config.server.max_idle_secs;
        let reaper_span = tracing::Span::current();
        joins.push(thread::spawn(move || {
            reaper_span.in_scope(|| {
                run_reaper(reaper_engine, reaper_router, reaper_shutdown, interval, max_idle);
            });
        }));

        tracing::info!(addr = %local_addr, workers, "server started");
        Ok(ServerHandle {
            local_addr,
            shutdown,
            router,
            joins,
        })
    }
}

/// Run the server until SIGINT/SIGTERM, then shut down gracefully.
pub fn run(config: Config) -> Result<(), ServerError> {
    let handle = Server::new(config).start()?;
    let shutdown = handle.shutdown_flag();
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(50));
    }
    tracing::info!("shutdown signal received");
    handle.stop();
    tracing::info!("server stopped");
    Ok(())
}

struct Outlet {
    tx: Sender<String>,
    stream: TcpStream,
}

#[derive(Default)]
struct Router {
    outlets: Mutex<HashMap<SessionId, Outlet>>,
    /// Serializes sequencing + fan-out per document so broadcasts leave in
    /// log order.
    dispatch_guards: Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl Router {
    fn register(&self, session: SessionId, tx: Sender<String>, stream: TcpStream) {
        self.outlets
            .lock()
            .expect("router lock poisoned")
            .insert(session, Outlet { tx, stream });
    }

    fn dispatch(&self, batch: Vec<Outbound>) {
        for outbound in batch {
            match outbound {
                Outbound::Send { to, message } => {
                    let line = match message.encode() {
                        Ok(line) => line,
                        Err(err) => {
                            tracing::warn!("dropping unencodable frame: {err}");
                            continue;
                        }
                    };
                    match to {
                        Recipient::Session(session) => self.send(session, line),
                        Recipient::Sessions(sessions) => {
                            for session in sessions {
                                self.send(session, line.clone());
                            }
                        }
                    }
                }
                Outbound::Close { session } => self.close(session),
            }
        }
    }

    fn send(&self, session: SessionId, line: String) {
        let outlets = self.outlets.lock().expect("router lock poisoned");
        if let Some(outlet) = outlets.get(&session) {
            // A full/closed channel means the writer is gone; the reader
            // side will tear the session down.
            let _ = outlet.tx.send(line);
        }
    }

    // Dropping the outlet ends the writer's channel; the writer drains any
    // queued frames (a disconnect notice, typically) and then shuts the
    // socket down, which also unblocks the reader.
    fn close(&self, session: SessionId) {
        drop(
            self.outlets
                .lock()
                .expect("router lock poisoned")
                .remove(&session),
        );
    }

    fn close_all(&self) {
        let mut outlets = self.outlets.lock().expect("router lock poisoned");
        for (_, outlet) in outlets.drain() {
            let _ = outlet.stream.shutdown(Shutdown::Both);
        }
    }

    fn dispatch_guard(&self, message: &Message) -> Option<Arc<Mutex<()>>> {
        let document_id = match &message.body {
            Body::Edit(payload) => &payload.document_id,
            Body::Sync(payload) => &payload.document_id,
            Body::Document(payload) => &payload.document_id,
            Body::Presence(payload) => &payload.document_id,
            Body::Auth(_) | Body::System(_) => return None,
        };
        if document_id.is_empty() {
            return None;
        }
        let mut guards = self.dispatch_guards.lock().expect("router lock poisoned");
        Some(Arc::clone(
            guards
                .entry(DocumentId::new(document_id.clone()))
                .or_default(),
        ))
    }
}

fn run_worker(
    index: usize,
    inbox: Receiver<(SessionId, Message)>,
    engine: Arc<Engine>,
    router: Arc<Router>,
) {
    tracing::debug!(worker = index, "worker started");
    while let Ok((session, message)) = inbox.recv() {
        match router.dispatch_guard(&message) {
            Some(guard) => {
                let _serialized = guard.lock().expect("dispatch guard poisoned");
                let out = engine.handle(session, message, now_ms());
                router.dispatch(out);
            }
            None => {
                let out = engine.handle(session, message, now_ms());
                router.dispatch(out);
            }
        }
    }
    tracing::debug!(worker = index, "worker stopped");
}

struct AcceptLoop {
    listener: TcpListener,
    engine: Arc<Engine>,
    router: Arc<Router>,
    inboxes: Vec<Sender<(SessionId, Message)>>,
    shutdown: Arc<AtomicBool>,
    max_frame_bytes: usize,
}

impl AcceptLoop {
    fn run(self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(err) = self.spawn_connection(stream, peer) {
                        tracing::warn!(peer = %peer, "connection setup failed: {err}");
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(25));
                }
                Err(err) => {
                    tracing::warn!("accept error: {err}");
                    thread::sleep(Duration::from_millis(25));
                }
            }
        }
        tracing::debug!("accept loop stopped");
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        stream.set_nodelay(true).ok();
        let session = self.engine.connect(now_ms());
        let span = tracing::info_span!("session", session = %session, peer = %peer);

        let (tx, rx) = crossbeam::channel::unbounded::<String>();
        self.router.register(session, tx, stream.try_clone()?);

        let mut writer = FrameWriter::new(stream.try_clone()?, self.max_frame_bytes);
        let writer_span = span.clone();
        thread::spawn(move || {
            writer_span.in_scope(|| {
                for line in rx {
                    if let Err(err) = writer.write_frame(&line) {
                        tracing::debug!("writer closing: {err}");
                        break;
                    }
                }
                writer.shutdown();
            });
        });

        let inbox = self.worker_for(session);
        let engine = Arc::clone(&self.engine);
        let router = Arc::clone(&self.router);
        let max_frame_bytes = self.max_frame_bytes;
        thread::spawn(move || {
            span.in_scope(|| {
                run_reader(stream, session, inbox, engine, router, max_frame_bytes);
            });
        });
        Ok(())
    }

    fn worker_for(&self, session: SessionId) -> Sender<(SessionId, Message)> {
        let mut hasher = DefaultHasher::new();
        session.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.inboxes.len();
        self.inboxes[index].clone()
    }
}

fn run_reader(
    stream: TcpStream,
    session: SessionId,
    inbox: Sender<(SessionId, Message)>,
    engine: Arc<Engine>,
    router: Arc<Router>,
    max_frame_bytes: usize,
) {
    let mut reader = FrameReader::new(BufReader::new(stream), max_frame_bytes);
    loop {
        match reader.read_next() {
            Ok(Some(line)) => match Message::decode(&line) {
                Ok(message) => {
                    if inbox.send((session, message)).is_err() {
                        break;
                    }
                }
                // Transport policy for malformed frames: drop and log.
                Err(err) => {
                    tracing::warn!("dropping malformed frame: {err}");
                }
            },
            Ok(None) => break,
            Err(err) => {
                tracing::debug!("reader closing: {err}");
                break;
            }
        }
    }
    let out = engine.disconnect(session, now_ms());
    router.dispatch(out);
    router.close(session);
}

fn run_reaper(
    engine: Arc<Engine>,
    router: Arc<Router>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
    max_idle_secs: u64,
) {
    let mut last_sweep = Instant::now();
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        thread::sleep(Duration::from_millis(100));
        if last_sweep.elapsed() >= interval {
            let out = engine.cleanup_idle(max_idle_secs, now_ms());
            router.dispatch(out);
            last_sweep = Instant::now();
        }
    }
}

use crate::command::CommandTable;
use crate::config::Config;
use crate::dispatch::{Chain, Request};
use crate::replication::{ReplicationInfo, Role, master};
use crate::resp::{Parser, Value};
use crate::store::{SharedStore, Store};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handles every handler and stage needs.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<Config>,
    pub store: SharedStore,
    pub repl: Arc<ReplicationInfo>,
    pub registry: master::SharedRegistry,
    pub table: Arc<CommandTable>,
}

impl ServerContext {
    pub fn new(config: Config) -> Self {
        let role = if config.replicaof.is_some() {
            Role::Replica
        } else {
            Role::Master
        };
        ServerContext {
            config: Arc::new(config),
            store: Store::shared(),
            repl: ReplicationInfo::new(role),
            registry: master::ReplicaRegistry::shared(),
            table: Arc::new(CommandTable::standard()),
        }
    }
}

/// Requested by a handler: after the reply is released, the serve loop
/// stops client-style handling and hands the socket over.
pub enum Takeover {
    /// PSYNC accepted; the connection becomes a propagation sink fed by
    /// this channel.
    ReplicaSink(mpsc::UnboundedReceiver<Bytes>),
}

/// Per-connection state. The `id` is the process-unique accept sequence
/// number; registries key by it, never by remote address.
pub struct ClientState {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    pub should_close: bool,
    pub takeover: Option<Takeover>,
}

impl ClientState {
    pub fn new(peer: SocketAddr) -> Self {
        ClientState {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            peer: Some(peer),
            should_close: false,
            takeover: None,
        }
    }

    /// A client record with no socket behind it: the replica's
    /// master-link applies commands through one of these.
    pub fn detached() -> Self {
        ClientState {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            peer: None,
            should_close: false,
            takeover: None,
        }
    }
}

/// Accumulates a request's reply bytes; `release` on the serve loop side
/// flushes them to the socket in a single write. The silent variant
/// discards everything; used on the replica's master-facing connection.
pub struct ReplyBuffer {
    buf: Vec<u8>,
    silent: bool,
}

impl Default for ReplyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyBuffer {
    pub fn new() -> Self {
        ReplyBuffer {
            buf: Vec::new(),
            silent: false,
        }
    }

    pub fn silent() -> Self {
        ReplyBuffer {
            buf: Vec::new(),
            silent: true,
        }
    }

    pub fn write(&mut self, value: &Value) {
        if !self.silent {
            value.write_to(&mut self.buf);
        }
    }

    /// Append pre-framed bytes, e.g. the unterminated snapshot header.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        if !self.silent {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Drain the accumulated bytes for flushing.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Bind the listener and serve until cancelled.
pub async fn run_server(ctx: ServerContext, cancel: CancellationToken) -> std::io::Result<()> {
    let addr = format!("{}:{}", ctx.config.bind, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {addr} as {}", ctx.repl.role);

    // Expired-key sweep
    {
        let store = ctx.store.clone();
        let hz = ctx.config.hz;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sweep_loop(store, hz, cancel).await;
        });
    }

    // Master keeps trying to revive dead replicas
    if ctx.repl.role == Role::Master {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            master::health_check_loop(ctx, cancel).await;
        });
    }

    let mut serve_tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                debug!("accepted connection from {peer}");

                let ctx = ctx.clone();
                let cancel = cancel.clone();
                serve_tasks.spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx, cancel).await {
                        debug!("connection {peer} ended with error: {e}");
                    }
                    debug!("connection closed: {peer}");
                });
            }
            Some(_) = serve_tasks.join_next(), if !serve_tasks.is_empty() => {}
            _ = cancel.cancelled() => {
                info!("shutting down, waiting for {} connections", serve_tasks.len());
                while serve_tasks.join_next().await.is_some() {}
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: ServerContext,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut client = ClientState::new(peer);
    let mut buf = BytesMut::with_capacity(4096);

    let chain = match ctx.repl.role {
        Role::Master => Chain::master(),
        Role::Replica => Chain::replica_client(),
    };

    loop {
        // Drain every complete frame already buffered before reading again.
        loop {
            let before = buf.clone();
            match Parser::parse(&mut buf) {
                Ok(Some(value)) => {
                    let consumed = before.len() - buf.len();
                    let raw = Bytes::copy_from_slice(&before[..consumed]);

                    match ctx.table.resolve(&value.flatten()) {
                        Ok(command) => {
                            let from_replica =
                                ctx.registry.read().await.contains(client.id);
                            let req = Request {
                                raw,
                                command,
                                client_id: client.id,
                                peer_ip: Some(peer.ip()),
                                from_replica,
                            };

                            let mut reply = ReplyBuffer::new();
                            chain.run(&ctx, &mut client, &req, &mut reply).await;

                            // Release: one write per request.
                            let bytes = reply.take();
                            if !bytes.is_empty() {
                                stream.write_all(&bytes).await?;
                            }

                            if let Some(Takeover::ReplicaSink(rx)) = client.takeover.take() {
                                debug!("connection {peer} promoted to replica sink");
                                master::stream_to_replica(
                                    stream,
                                    client.id,
                                    ctx.registry.clone(),
                                    rx,
                                )
                                .await;
                                return Ok(());
                            }
                            if client.should_close {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            let err = Value::error(format!("ERR: {e}"));
                            stream.write_all(&err.serialize()).await?;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("framing error from {peer}: {e}");
                    let err = Value::error(format!("ERR: {e}"));
                    stream.write_all(&err.serialize()).await?;
                    // Drop the unframeable bytes and resynchronize on
                    // whatever arrives next.
                    buf.clear();
                }
            }
        }

        tokio::select! {
            result = stream.read_buf(&mut buf) => {
                match result {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

/// Periodically remove entries whose expiry deadline has passed.
async fn sweep_loop(store: SharedStore, hz: u64, cancel: CancellationToken) {
    let period = Duration::from_millis(1000 / hz.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = cancel.cancelled() => return,
        }
        let removed = store.write().await.sweep_expired();
        if removed > 0 {
            debug!("swept {removed} expired keys");
        }
    }
}

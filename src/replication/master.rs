use crate::replication::ReplicationInfo;
use crate::resp::{Parser, Value};
use crate::server::ServerContext;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the master tries to revive dead replicas.
const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(30);
/// WAIT's GETACK fan-out cadence.
const WAIT_TICK: Duration = Duration::from_millis(100);

/// One follower as the master sees it.
///
/// Created by the first REPLCONF on a connection, filled in by later
/// REPLCONFs, brought live by PSYNC. Records are demoted on failure but
/// never removed; the health check needs the announced address to
/// attempt a reconnect.
#[derive(Debug)]
pub struct ReplicaHandle {
    pub id: u64,
    pub peer: String,
    /// Announced coordinates: peer host + REPLCONF listening-port.
    pub announced: Option<(String, u16)>,
    pub capabilities: Vec<String>,
    pub live: bool,
    /// Highest offset this replica has REPLCONF ACKed.
    pub acked_offset: u64,
    pub last_error: Option<String>,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl ReplicaHandle {
    fn new(id: u64, peer: String) -> Self {
        ReplicaHandle {
            id,
            peer,
            announced: None,
            capabilities: Vec::new(),
            live: false,
            acked_offset: 0,
            last_error: None,
            tx: None,
        }
    }

    /// Wire a fresh propagation channel and mark the replica live.
    pub fn go_live(&mut self, tx: mpsc::UnboundedSender<Bytes>) {
        self.tx = Some(tx);
        self.live = true;
        self.last_error = None;
    }
}

/// Registry of every replica that ever announced itself, keyed by the
/// accepting connection's client id.
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    replicas: HashMap<u64, ReplicaHandle>,
}

pub type SharedRegistry = Arc<RwLock<ReplicaRegistry>>;

impl ReplicaRegistry {
    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(ReplicaRegistry::default()))
    }

    pub fn ensure(&mut self, id: u64, peer: String) -> &mut ReplicaHandle {
        self.replicas
            .entry(id)
            .or_insert_with(|| ReplicaHandle::new(id, peer))
    }

    pub fn get(&self, id: u64) -> Option<&ReplicaHandle> {
        self.replicas.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.replicas.contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.replicas.values().filter(|r| r.live).count()
    }

    pub fn demote(&mut self, id: u64, reason: &str) {
        if let Some(rec) = self.replicas.get_mut(&id) {
            rec.live = false;
            rec.tx = None;
            rec.last_error = Some(reason.to_string());
        }
    }

    pub fn record_ack(&mut self, id: u64, offset: u64) {
        if let Some(rec) = self.replicas.get_mut(&id) {
            rec.acked_offset = rec.acked_offset.max(offset);
        }
    }

    /// Copy-then-iterate snapshot of live propagation channels.
    fn live_senders(&self) -> Vec<(u64, mpsc::UnboundedSender<Bytes>)> {
        self.replicas
            .values()
            .filter(|r| r.live)
            .filter_map(|r| r.tx.clone().map(|tx| (r.id, tx)))
            .collect()
    }

    /// Dead replicas whose announced address makes a reconnect possible.
    fn reconnect_targets(&self) -> Vec<(u64, String, u16)> {
        self.replicas
            .values()
            .filter(|r| !r.live)
            .filter_map(|r| {
                r.announced
                    .as_ref()
                    .map(|(host, port)| (r.id, host.clone(), *port))
            })
            .collect()
    }
}

/// Write the raw bytes of an accepted write command to every live
/// replica. A failed send demotes the replica; the caller's own reply
/// is never affected.
pub async fn broadcast(registry: &SharedRegistry, data: &[u8]) {
    fan_out(registry, Bytes::copy_from_slice(data)).await;
}

async fn fan_out(registry: &SharedRegistry, payload: Bytes) {
    let targets = registry.read().await.live_senders();
    for (id, tx) in targets {
        if tx.send(payload.clone()).is_err() {
            registry
                .write()
                .await
                .demote(id, "propagation channel closed");
            warn!("replica {id} lost: propagation channel closed");
        }
    }
}

async fn count_acked(registry: &SharedRegistry, target: u64) -> usize {
    registry
        .read()
        .await
        .replicas
        .values()
        .filter(|r| r.live && r.acked_offset >= target)
        .count()
}

/// The WAIT protocol: block until `numreplicas` followers have ACKed the
/// current master offset, or until the deadline.
///
/// A zero master offset means nothing to wait for; answer with the live
/// replica count. Otherwise fan `REPLCONF GETACK *` out on every tick and
/// count ACKs; quorum reached by the deadline counts, late ACKs only
/// update the registry.
pub async fn wait_for_acks(
    registry: &SharedRegistry,
    repl: &ReplicationInfo,
    numreplicas: usize,
    timeout_ms: u64,
) -> usize {
    let target = repl.offset();
    if target == 0 {
        return registry.read().await.live_count();
    }

    let getack = Bytes::from(Value::command(&["REPLCONF", "GETACK", "*"]).serialize());
    let mut ticker = tokio::time::interval(WAIT_TICK);
    let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
    tokio::pin!(deadline);
    // WAIT with timeout 0 blocks until quorum.
    let has_deadline = timeout_ms > 0;

    loop {
        tokio::select! {
            _ = &mut deadline, if has_deadline => {
                return count_acked(registry, target).await;
            }
            _ = ticker.tick() => {
                fan_out(registry, getack.clone()).await;
                let acked = count_acked(registry, target).await;
                if acked >= numreplicas {
                    return acked;
                }
            }
        }
    }
}

/// Run a PSYNC-promoted connection as a propagation sink: forward
/// everything the channel delivers, and fold `REPLCONF ACK` frames sent
/// back by the replica into the registry.
pub async fn stream_to_replica(
    mut stream: TcpStream,
    id: u64,
    registry: SharedRegistry,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut buf = BytesMut::with_capacity(256);

    let reason = loop {
        tokio::select! {
            data = rx.recv() => {
                match data {
                    Some(bytes) => {
                        if let Err(e) = stream.write_all(&bytes).await {
                            break format!("write failed: {e}");
                        }
                    }
                    None => break "propagation channel dropped".to_string(),
                }
            }
            result = stream.read_buf(&mut buf) => {
                match result {
                    Ok(0) => break "replica disconnected".to_string(),
                    Ok(_) => drain_acks(&mut buf, id, &registry).await,
                    Err(e) => break format!("read failed: {e}"),
                }
            }
        }
    };

    registry.write().await.demote(id, &reason);
    debug!("replica {id} sink stopped: {reason}");
}

async fn drain_acks(buf: &mut BytesMut, id: u64, registry: &SharedRegistry) {
    loop {
        match Parser::parse(buf) {
            Ok(Some(value)) => {
                let tokens = value.flatten();
                if tokens.len() == 3
                    && tokens[0].eq_ignore_ascii_case("replconf")
                    && tokens[1].eq_ignore_ascii_case("ack")
                    && let Ok(offset) = tokens[2].parse::<u64>()
                {
                    registry.write().await.record_ack(id, offset);
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("unparseable bytes from replica {id}: {e}");
                buf.clear();
                return;
            }
        }
    }
}

/// Periodically dial dead replicas at their announced address and, on
/// success, resume propagation. No missed writes are replayed.
pub async fn health_check_loop(ctx: ServerContext, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(HEALTH_CHECK_PERIOD);
    ticker.tick().await; // the first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }

        let targets = ctx.registry.read().await.reconnect_targets();
        for (id, host, port) in targets {
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    ctx.registry.write().await.ensure(id, String::new()).go_live(tx);
                    tokio::spawn(stream_to_replica(
                        stream,
                        id,
                        ctx.registry.clone(),
                        rx,
                    ));
                    info!("revived replica {id} at {host}:{port}");
                }
                Err(e) => {
                    debug!("replica {id} still down ({host}:{port}): {e}");
                }
            }
        }
    }
}

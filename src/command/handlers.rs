use crate::dispatch::Request;
use crate::replication::{EMPTY_RDB, master};
use crate::resp::Value;
use crate::server::{ClientState, ReplyBuffer, ServerContext, Takeover};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Terminal handlers a chain's `CallHandlers` stage can resolve to.
#[derive(Debug, Clone, Copy)]
pub enum HandlerKind {
    Ping,
    Echo,
    Get,
    Set,
    Info,
    Replconf,
    Psync,
    Wait,
}

/// Canonical command name to terminal handler, per connection role.
pub struct HandlerSet {
    map: HashMap<&'static str, HandlerKind>,
}

impl HandlerSet {
    fn from_entries(entries: &[(&'static str, HandlerKind)]) -> Self {
        HandlerSet {
            map: entries.iter().copied().collect(),
        }
    }

    pub fn master() -> Self {
        Self::from_entries(&[
            ("PING", HandlerKind::Ping),
            ("ECHO", HandlerKind::Echo),
            ("GET", HandlerKind::Get),
            ("SET", HandlerKind::Set),
            ("INFO", HandlerKind::Info),
            ("REPLCONF", HandlerKind::Replconf),
            ("PSYNC", HandlerKind::Psync),
            ("WAIT", HandlerKind::Wait),
        ])
    }

    pub fn replica_client() -> Self {
        Self::from_entries(&[
            ("PING", HandlerKind::Ping),
            ("ECHO", HandlerKind::Echo),
            ("GET", HandlerKind::Get),
            ("SET", HandlerKind::Set),
            ("INFO", HandlerKind::Info),
        ])
    }

    /// The master-facing connection applies writes; everything else on
    /// that link falls through `CallHandlers` as a no-op.
    pub fn replica_link() -> Self {
        Self::from_entries(&[("SET", HandlerKind::Set)])
    }

    pub fn get(&self, name: &str) -> Option<HandlerKind> {
        self.map.get(name).copied()
    }
}

pub async fn execute(
    kind: HandlerKind,
    ctx: &ServerContext,
    client: &mut ClientState,
    req: &Request,
    reply: &mut ReplyBuffer,
) {
    match kind {
        HandlerKind::Ping => cmd_ping(reply),
        HandlerKind::Echo => cmd_echo(req, reply),
        HandlerKind::Get => cmd_get(ctx, req, reply).await,
        HandlerKind::Set => cmd_set(ctx, req, reply).await,
        HandlerKind::Info => cmd_info(ctx, req, reply).await,
        HandlerKind::Replconf => cmd_replconf(ctx, client, req, reply).await,
        HandlerKind::Psync => cmd_psync(ctx, client, req, reply).await,
        HandlerKind::Wait => cmd_wait(ctx, req, reply).await,
    }
}

fn cmd_ping(reply: &mut ReplyBuffer) {
    reply.write(&Value::simple("PONG"));
}

fn cmd_echo(req: &Request, reply: &mut ReplyBuffer) {
    reply.write(&Value::bulk(req.command.args[0].as_bytes().to_vec()));
}

async fn cmd_get(ctx: &ServerContext, req: &Request, reply: &mut ReplyBuffer) {
    let value = ctx.store.read().await.get(&req.command.args[0]);
    match value {
        Some(v) => reply.write(&Value::bulk(v.into_bytes())),
        None => reply.write(&Value::null_bulk()),
    }
}

async fn cmd_set(ctx: &ServerContext, req: &Request, reply: &mut ReplyBuffer) {
    let key = req.command.args[0].clone();
    let value = req.command.args[1].clone();

    match req.command.option("PX") {
        Some(opt) => {
            let ttl_ms = match opt[0].parse::<u64>() {
                Ok(ms) => ms,
                Err(_) => {
                    reply.write(&Value::error("ERR: PX value is not an integer"));
                    return;
                }
            };
            ctx.store.write().await.set_ex(key, value, ttl_ms);
        }
        None => ctx.store.write().await.set(key, value),
    }

    reply.write(&Value::ok());
}

async fn cmd_info(ctx: &ServerContext, req: &Request, reply: &mut ReplyBuffer) {
    let all = req.command.options.is_empty();
    let mut out = String::new();

    if all || req.command.has_option("server") {
        out.push_str("# Server\r\n");
        out.push_str(concat!("replis_version:", env!("CARGO_PKG_VERSION"), "\r\n"));
        out.push_str(&format!("tcp_port:{}\r\n\r\n", ctx.config.port));
    }

    if all || req.command.has_option("replication") {
        let connected = ctx.registry.read().await.live_count();
        out.push_str("# Replication\r\n");
        out.push_str(&format!("role:{}\r\n", ctx.repl.role));
        out.push_str(&format!("connected_slaves:{connected}\r\n"));
        out.push_str(&format!("master_replid:{}\r\n", ctx.repl.replid));
        out.push_str(&format!("master_repl_offset:{}\r\n\r\n", ctx.repl.offset()));
    }

    if all || req.command.has_option("stats") {
        let store = ctx.store.read().await;
        out.push_str("# Stats\r\n");
        out.push_str(&format!("keys:{}\r\n", store.len()));
        out.push_str(&format!("expires:{}\r\n\r\n", store.expires_count()));
    }

    reply.write(&Value::bulk(out.into_bytes()));
}

/// REPLCONF on the master: the first one on a connection creates the
/// replica record; listening-port and capa fill it in; ACK updates the
/// acked offset and gets no reply.
async fn cmd_replconf(
    ctx: &ServerContext,
    client: &mut ClientState,
    req: &Request,
    reply: &mut ReplyBuffer,
) {
    let peer = client
        .peer
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut registry = ctx.registry.write().await;
    let rec = registry.ensure(req.client_id, peer);

    if let Some(opt) = req.command.option("listening-port") {
        let port = match opt[0].parse::<u16>() {
            Ok(p) => p,
            Err(_) => {
                reply.write(&Value::error("ERR: listening-port is not a valid port"));
                return;
            }
        };
        let host = req
            .peer_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        rec.announced = Some((host, port));
        debug!("replica {} announced {:?}", req.client_id, rec.announced);
    }

    if let Some(opt) = req.command.option("capa") {
        rec.capabilities.push(opt[0].clone());
    }

    if let Some(opt) = req.command.option("ACK") {
        if let Ok(offset) = opt[0].parse::<u64>() {
            rec.acked_offset = rec.acked_offset.max(offset);
        }
        return; // ACK never gets a reply
    }

    reply.write(&Value::ok());
}

/// PSYNC: answer FULLRESYNC plus the snapshot blob, bring the record
/// live, and ask the serve loop to convert this connection into a
/// propagation sink.
async fn cmd_psync(
    ctx: &ServerContext,
    client: &mut ClientState,
    req: &Request,
    reply: &mut ReplyBuffer,
) {
    if req.command.args[0] != "?" {
        debug!(
            "PSYNC with replid {}, only full resync is supported",
            req.command.args[0]
        );
    }

    reply.write(&Value::simple(format!(
        "FULLRESYNC {} {}",
        ctx.repl.replid,
        ctx.repl.offset()
    )));
    // Snapshot framing: $<N>\r\n then N raw bytes, no trailing CRLF.
    reply.write_raw(format!("${}\r\n", EMPTY_RDB.len()).as_bytes());
    reply.write_raw(EMPTY_RDB);

    let peer = client
        .peer
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let (tx, rx) = mpsc::unbounded_channel();
    ctx.registry
        .write()
        .await
        .ensure(req.client_id, peer)
        .go_live(tx);

    client.takeover = Some(Takeover::ReplicaSink(rx));
    info!("replica {} synced, streaming from offset {}", req.client_id, ctx.repl.offset());
}

async fn cmd_wait(ctx: &ServerContext, req: &Request, reply: &mut ReplyBuffer) {
    let numreplicas = req.command.args[0].parse::<usize>();
    let timeout_ms = req.command.args[1].parse::<u64>();

    match (numreplicas, timeout_ms) {
        (Ok(numreplicas), Ok(timeout_ms)) => {
            let acked =
                master::wait_for_acks(&ctx.registry, &ctx.repl, numreplicas, timeout_ms).await;
            reply.write(&Value::Integer(acked as i64));
        }
        _ => {
            reply.write(&Value::error("ERR: value is not an integer or out of range"));
        }
    }
}

use crate::dispatch::{Chain, Request};
use crate::replication::ReplicationError;
use crate::resp::{Parser, Value};
use crate::server::{ClientState, ReplyBuffer, ServerContext};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handshake progress on the master-facing connection.
///
/// Commands are sent to the master only in a state's entry action; the
/// state moves only on the expected reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Ping,
    ReplconfPort,
    ReplconfCapa,
    Psync,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    Pong,
    Ok,
    FullResync,
}

impl HandshakeState {
    /// The transition table. Anything not listed is unexpected; the FSM
    /// does not auto-recover.
    pub fn on(self, event: HandshakeEvent) -> Option<HandshakeState> {
        match (self, event) {
            (HandshakeState::Ping, HandshakeEvent::Pong) => Some(HandshakeState::ReplconfPort),
            (HandshakeState::ReplconfPort, HandshakeEvent::Ok) => Some(HandshakeState::ReplconfCapa),
            (HandshakeState::ReplconfCapa, HandshakeEvent::Ok) => Some(HandshakeState::Psync),
            (HandshakeState::Psync, HandshakeEvent::FullResync) => Some(HandshakeState::Done),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HandshakeState::Idle => "idle",
            HandshakeState::Ping => "ping",
            HandshakeState::ReplconfPort => "replconf-listening-port",
            HandshakeState::ReplconfCapa => "replconf-capa",
            HandshakeState::Psync => "psync",
            HandshakeState::Done => "done",
        }
    }
}

/// The command dispatched to the master when a state is entered.
fn entry_action(state: HandshakeState, listen_port: u16) -> Option<Vec<u8>> {
    match state {
        HandshakeState::Ping => Some(Value::command(&["ping"]).serialize()),
        HandshakeState::ReplconfPort => Some(
            Value::command(&["REPLCONF", "listening-port", &listen_port.to_string()]).serialize(),
        ),
        HandshakeState::ReplconfCapa => {
            Some(Value::command(&["REPLCONF", "capa", "psync2"]).serialize())
        }
        HandshakeState::Psync => Some(Value::command(&["PSYNC", "?", "-1"]).serialize()),
        HandshakeState::Idle | HandshakeState::Done => None,
    }
}

fn event_for(command_name: &str) -> Option<HandshakeEvent> {
    match command_name {
        "PONG" => Some(HandshakeEvent::Pong),
        "OK" => Some(HandshakeEvent::Ok),
        "FULLRESYNC" => Some(HandshakeEvent::FullResync),
        _ => None,
    }
}

/// Dial the master, drive the handshake, swallow the snapshot, then
/// apply the command stream until cancelled or the link drops.
pub async fn run_replica_link(
    ctx: ServerContext,
    cancel: CancellationToken,
) -> Result<(), ReplicationError> {
    let Some((host, port)) = ctx.config.replicaof.clone() else {
        return Ok(());
    };
    let addr = format!("{host}:{port}");
    info!("connecting to master at {addr}");
    let mut stream = TcpStream::connect(&addr).await?;
    let mut buf = BytesMut::with_capacity(8192);

    let mut state = HandshakeState::Ping;
    if let Some(bytes) = entry_action(state, ctx.config.port) {
        stream.write_all(&bytes).await?;
    }

    while state != HandshakeState::Done {
        let value = read_value(&mut stream, &mut buf, &cancel).await?;
        let tokens = value.flatten();

        let event = ctx
            .table
            .resolve(&tokens)
            .ok()
            .and_then(|cmd| event_for(cmd.name))
            .ok_or_else(|| ReplicationError::UnexpectedReply {
                state: state.name(),
                got: tokens.join(" "),
            })?;

        state = state.on(event).ok_or(ReplicationError::UnexpectedReply {
            state: state.name(),
            got: tokens.join(" "),
        })?;
        debug!("handshake advanced to {}", state.name());

        if state == HandshakeState::Done {
            consume_snapshot(&mut stream, &mut buf, &cancel).await?;
            ctx.repl.reset();
            info!("full resync complete, applying command stream");
        } else if let Some(bytes) = entry_action(state, ctx.config.port) {
            stream.write_all(&bytes).await?;
        }
    }

    apply_stream(ctx, stream, buf, cancel).await
}

/// Steady state: parse frames from the master and run them through the
/// replica chain with a silent reply writer. GETACK is the one command
/// that answers on this connection, with the offset as of before its
/// own frame.
async fn apply_stream(
    ctx: ServerContext,
    mut stream: TcpStream,
    mut buf: BytesMut,
    cancel: CancellationToken,
) -> Result<(), ReplicationError> {
    let chain = Chain::replica_link();
    let mut client = ClientState::detached();

    loop {
        loop {
            let before = buf.clone();
            match Parser::parse(&mut buf) {
                Ok(Some(value)) => {
                    let consumed = before.len() - buf.len();
                    let raw = Bytes::copy_from_slice(&before[..consumed]);

                    let command = match ctx.table.resolve(&value.flatten()) {
                        Ok(command) => command,
                        Err(e) => {
                            debug!("ignoring unresolvable master frame: {e}");
                            continue;
                        }
                    };

                    if command.name == "REPLCONF" && command.has_option("GETACK") {
                        let ack = ack_frame(ctx.repl.offset());
                        stream.write_all(&ack).await?;
                        continue;
                    }

                    let req = Request {
                        raw,
                        command,
                        client_id: client.id,
                        peer_ip: None,
                        from_replica: false,
                    };
                    let mut reply = ReplyBuffer::silent();
                    chain.run(&ctx, &mut client, &req, &mut reply).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("framing error on master link: {e}");
                    buf.clear();
                    break;
                }
            }
        }

        tokio::select! {
            result = stream.read_buf(&mut buf) => {
                match result {
                    Ok(0) => return Err(ReplicationError::MasterClosed),
                    Ok(_) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

/// `REPLCONF ACK <offset>` as sent back to the master.
pub fn ack_frame(offset: u64) -> Vec<u8> {
    Value::command(&["REPLCONF", "ACK", &offset.to_string()]).serialize()
}

/// The snapshot arrives as `$<N>\r\n` followed by exactly N raw bytes,
/// deliberately without a trailing CRLF, so it cannot go through the
/// value parser. Contents are discarded.
async fn consume_snapshot(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    cancel: &CancellationToken,
) -> Result<(), ReplicationError> {
    let header = read_line(stream, buf, cancel).await?;
    if !header.starts_with('$') {
        return Err(ReplicationError::BadSnapshotHeader(header));
    }
    let len: usize = header[1..]
        .parse()
        .map_err(|_| ReplicationError::BadSnapshotHeader(header.clone()))?;

    let buffered = len.min(buf.len());
    buf.advance(buffered);
    let mut remaining = len - buffered;

    let mut chunk = vec![0u8; 8192];
    while remaining > 0 {
        tokio::select! {
            result = stream.read(&mut chunk[..remaining.min(8192)]) => {
                match result {
                    Ok(0) => return Err(ReplicationError::MasterClosed),
                    Ok(n) => remaining -= n,
                    Err(e) => return Err(e.into()),
                }
            }
            _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
        }
    }

    debug!("discarded {len}-byte snapshot");
    Ok(())
}

async fn read_value(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    cancel: &CancellationToken,
) -> Result<Value, ReplicationError> {
    loop {
        if let Some(value) = Parser::parse(buf)? {
            return Ok(value);
        }
        tokio::select! {
            result = stream.read_buf(buf) => {
                match result {
                    Ok(0) => return Err(ReplicationError::MasterClosed),
                    Ok(_) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
        }
    }
}

async fn read_line(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    cancel: &CancellationToken,
) -> Result<String, ReplicationError> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
            buf.advance(pos + 2);
            return Ok(line);
        }
        tokio::select! {
            result = stream.read_buf(buf) => {
                match result {
                    Ok(0) => return Err(ReplicationError::MasterClosed),
                    Ok(_) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
        }
    }
}

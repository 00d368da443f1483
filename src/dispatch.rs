use crate::command::handlers::{self, HandlerSet};
use crate::command::{Command, CommandClass};
use crate::replication::master;
use crate::server::{ClientState, ReplyBuffer, ServerContext};
use bytes::Bytes;
use std::net::IpAddr;

/// One decoded request travelling through the chain.
#[derive(Debug)]
pub struct Request {
    /// The exact bytes this command arrived as. Propagation and offset
    /// accounting use these, never a re-serialization.
    pub raw: Bytes,
    pub command: Command,
    pub client_id: u64,
    pub peer_ip: Option<IpAddr>,
    /// True when the sending connection is a registered replica.
    pub from_replica: bool,
}

/// Stage verdict: keep walking the chain or short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// A dispatch stage. Stages run in chain order; each may inspect the
/// request, produce reply bytes, touch shared state, or stop the walk.
#[derive(Debug, Clone, Copy)]
pub enum Stage {
    /// Fan the raw bytes of write-class commands out to live replicas.
    PropagateWrites,
    /// Resolve the canonical name in the handler set; unregistered names
    /// are a no-op.
    CallHandlers,
    /// Count accepted write bytes into the master offset.
    AdvanceMasterOffset,
    /// Count applied write bytes into the replica offset.
    AdvanceReplicaOffset,
}

/// An ordered, owned sequence of stages plus the handler set
/// `CallHandlers` resolves against.
pub struct Chain {
    stages: Vec<Stage>,
    handlers: HandlerSet,
}

impl Chain {
    /// Master shape: propagate, then apply, then account.
    pub fn master() -> Self {
        Chain {
            stages: vec![
                Stage::PropagateWrites,
                Stage::CallHandlers,
                Stage::AdvanceMasterOffset,
            ],
            handlers: HandlerSet::master(),
        }
    }

    /// Replica client-facing shape: handlers only.
    pub fn replica_client() -> Self {
        Chain {
            stages: vec![Stage::CallHandlers],
            handlers: HandlerSet::replica_client(),
        }
    }

    /// Replica master-link steady-state shape: apply, then account.
    pub fn replica_link() -> Self {
        Chain {
            stages: vec![Stage::CallHandlers, Stage::AdvanceReplicaOffset],
            handlers: HandlerSet::replica_link(),
        }
    }

    pub async fn run(
        &self,
        ctx: &ServerContext,
        client: &mut ClientState,
        req: &Request,
        reply: &mut ReplyBuffer,
    ) {
        for stage in &self.stages {
            match self.step(*stage, ctx, client, req, reply).await {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }
    }

    async fn step(
        &self,
        stage: Stage,
        ctx: &ServerContext,
        client: &mut ClientState,
        req: &Request,
        reply: &mut ReplyBuffer,
    ) -> Flow {
        match stage {
            Stage::PropagateWrites => {
                if req.command.class == CommandClass::Write && !req.from_replica {
                    master::broadcast(&ctx.registry, &req.raw).await;
                }
                Flow::Continue
            }
            Stage::CallHandlers => {
                if let Some(kind) = self.handlers.get(req.command.name) {
                    handlers::execute(kind, ctx, client, req, reply).await;
                }
                if client.should_close || client.takeover.is_some() {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            Stage::AdvanceMasterOffset => {
                if req.command.class == CommandClass::Write && !req.from_replica {
                    ctx.repl.advance(req.raw.len() as u64);
                }
                Flow::Continue
            }
            Stage::AdvanceReplicaOffset => {
                if req.command.class == CommandClass::Write {
                    ctx.repl.advance(req.raw.len() as u64);
                }
                Flow::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::resp::Value;

    fn request(ctx: &ServerContext, parts: &[&str], from_replica: bool) -> Request {
        let value = Value::command(parts);
        let raw = Bytes::from(value.serialize());
        let command = ctx.table.resolve(&value.flatten()).unwrap();
        Request {
            raw,
            command,
            client_id: 1,
            peer_ip: None,
            from_replica,
        }
    }

    #[tokio::test]
    async fn master_chain_applies_write_and_advances_offset() {
        let ctx = ServerContext::new(Config::default());
        let chain = Chain::master();
        let mut client = ClientState::detached();

        let req = request(&ctx, &["SET", "k", "v"], false);
        let raw_len = req.raw.len() as u64;
        let mut reply = ReplyBuffer::new();
        chain.run(&ctx, &mut client, &req, &mut reply).await;

        assert_eq!(reply.take(), b"+OK\r\n");
        assert_eq!(ctx.repl.offset(), raw_len);
        assert_eq!(ctx.store.write().await.get("k"), Some("v".to_string()));
    }

    #[tokio::test]
    async fn master_offset_ignores_reads() {
        let ctx = ServerContext::new(Config::default());
        let chain = Chain::master();
        let mut client = ClientState::detached();

        let req = request(&ctx, &["GET", "k"], false);
        let mut reply = ReplyBuffer::new();
        chain.run(&ctx, &mut client, &req, &mut reply).await;

        assert_eq!(ctx.repl.offset(), 0);
        assert_eq!(reply.take(), b"$-1\r\n");
    }

    #[tokio::test]
    async fn writes_from_replicas_do_not_advance_master_offset() {
        let ctx = ServerContext::new(Config::default());
        let chain = Chain::master();
        let mut client = ClientState::detached();

        let req = request(&ctx, &["SET", "k", "v"], true);
        let mut reply = ReplyBuffer::new();
        chain.run(&ctx, &mut client, &req, &mut reply).await;

        assert_eq!(ctx.repl.offset(), 0);
        // The write itself still applies.
        assert_eq!(ctx.store.write().await.get("k"), Some("v".to_string()));
    }

    #[tokio::test]
    async fn replica_link_chain_counts_applied_writes() {
        let ctx = ServerContext::new(Config::default());
        let chain = Chain::replica_link();
        let mut client = ClientState::detached();

        let req = request(&ctx, &["SET", "k", "v"], false);
        let raw_len = req.raw.len() as u64;
        let mut reply = ReplyBuffer::silent();
        chain.run(&ctx, &mut client, &req, &mut reply).await;

        assert_eq!(ctx.repl.offset(), raw_len);
        assert!(reply.take().is_empty());
    }

    #[tokio::test]
    async fn replica_link_chain_ignores_non_writes() {
        let ctx = ServerContext::new(Config::default());
        let chain = Chain::replica_link();
        let mut client = ClientState::detached();

        // GETACK is repl-class; applying it must not move the offset.
        let req = request(&ctx, &["REPLCONF", "GETACK", "*"], false);
        let mut reply = ReplyBuffer::silent();
        chain.run(&ctx, &mut client, &req, &mut reply).await;

        assert_eq!(ctx.repl.offset(), 0);
    }

    #[tokio::test]
    async fn unregistered_handler_is_a_noop() {
        let ctx = ServerContext::new(Config::default());
        // The replica link set has no PSYNC handler.
        let chain = Chain::replica_link();
        let mut client = ClientState::detached();

        let req = request(&ctx, &["PSYNC", "?", "-1"], false);
        let mut reply = ReplyBuffer::new();
        chain.run(&ctx, &mut client, &req, &mut reply).await;

        assert!(reply.take().is_empty());
        assert!(client.takeover.is_none());
    }
}

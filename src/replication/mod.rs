pub mod master;
pub mod replica;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which side of the replication link this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Replica => write!(f, "slave"),
        }
    }
}

/// Process-wide replication identity and offset.
///
/// The offset counts the raw bytes of write-class commands: accepted
/// writes on a master, applied writes on a replica. Owned by the
/// replication component and handed around as an `Arc`; the interface is
/// deliberately narrow (`offset`, `advance`, `reset`).
#[derive(Debug)]
pub struct ReplicationInfo {
    pub role: Role,
    /// 40-hex replication ID, fixed for the lifetime of the process.
    pub replid: String,
    offset: AtomicU64,
}

impl ReplicationInfo {
    pub fn new(role: Role) -> Arc<Self> {
        Arc::new(ReplicationInfo {
            role,
            replid: generate_replid(),
            offset: AtomicU64::new(0),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    pub fn advance(&self, bytes: u64) {
        self.offset.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.offset.store(0, Ordering::SeqCst);
    }
}

/// Generate a 40-character hex replication ID.
fn generate_replid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| format!("{:02x}", rng.r#gen::<u8>()))
        .collect()
}

/// The snapshot image sent after FULLRESYNC: a valid empty-database RDB.
/// Replicas consume and discard it; their state begins from the ensuing
/// command stream.
pub const EMPTY_RDB: &[u8] = &[
    0x52, 0x45, 0x44, 0x49, 0x53, 0x30, 0x30, 0x31, 0x31, // "REDIS0011"
    0xfa, 0x09, 0x72, 0x65, 0x64, 0x69, 0x73, 0x2d, 0x76, 0x65, 0x72, 0x05, 0x37, 0x2e, 0x32,
    0x2e, 0x30, // redis-ver 7.2.0
    0xfa, 0x0a, 0x72, 0x65, 0x64, 0x69, 0x73, 0x2d, 0x62, 0x69, 0x74, 0x73, 0xc0,
    0x40, // redis-bits 64
    0xfa, 0x05, 0x63, 0x74, 0x69, 0x6d, 0x65, 0xc2, 0x6d, 0x08, 0xbc, 0x65, // ctime
    0xfa, 0x08, 0x75, 0x73, 0x65, 0x64, 0x2d, 0x6d, 0x65, 0x6d, 0xc2, 0xb0, 0xc4, 0x10,
    0x00, // used-mem
    0xfa, 0x08, 0x61, 0x6f, 0x66, 0x2d, 0x62, 0x61, 0x73, 0x65, 0xc0, 0x00, // aof-base 0
    0xff, // EOF opcode
    0xf0, 0x6e, 0x3b, 0xfe, 0xc0, 0xff, 0x5a, 0xa2, // CRC64
];

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("unexpected reply during handshake in state {state}: {got}")]
    UnexpectedReply { state: &'static str, got: String },

    #[error("master closed the connection")]
    MasterClosed,

    #[error("bad snapshot header: {0}")]
    BadSnapshotHeader(String),

    #[error("protocol error on master link: {0}")]
    Protocol(#[from] crate::resp::RespError),

    #[error("replica link cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

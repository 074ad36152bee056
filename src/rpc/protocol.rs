//! Client-facing wire protocol used by `agentctl`: a request/response enum
//! pair, bincode-encoded exactly like the teacher's `cli.rs` talks to
//! `rusty-db-server`, but framed with a 4-byte big-endian length prefix so a
//! response larger than one TCP read never gets truncated (the teacher's own
//! client reads a single fixed-size buffer per round trip, which is the kind
//! of thing worth fixing in a generalization of that pattern).

use crate::common::{NodeRole, ServiceId, SessionId};
use crate::error::{AgentError, Result};
use crate::fsm::{CatalogNode, CatalogService, CheckEntry, SessionBehavior};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    CatalogRegisterNode {
        name: String,
        role: NodeRole,
        address: String,
        datacenter: String,
        segment: String,
    },
    CatalogDeregisterNode {
        name: String,
    },
    CatalogRegisterService {
        node_name: String,
        service_id: ServiceId,
        name: String,
        tags: Vec<String>,
        port: u16,
    },
    CatalogDeregisterService {
        node_name: String,
        service_id: ServiceId,
    },
    CatalogListNodes,
    CatalogListServices {
        name: String,
        only_passing: bool,
    },
    KvGet {
        key: String,
    },
    KvPut {
        key: String,
        value: Vec<u8>,
    },
    KvDelete {
        key: String,
    },
    KvLock {
        key: String,
        session: SessionId,
    },
    KvUnlock {
        key: String,
        session: SessionId,
    },
    SessionCreate {
        node_name: String,
        behavior: SessionBehavior,
        ttl_seconds: u64,
    },
    SessionRenew {
        session: SessionId,
    },
    SessionDestroy {
        session: SessionId,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientResponse {
    Ok,
    Pong,
    Value(Option<Vec<u8>>),
    Nodes(Vec<CatalogNode>),
    Services(Vec<(CatalogService, Vec<CheckEntry>)>),
    SessionId(SessionId),
    Bool(bool),
    Error(String),
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
    if encoded.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(AgentError::InvalidArgument("frame exceeds maximum size".to_string()));
    }
    writer.write_u32(encoded.len() as u32).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(AgentError::InvalidArgument("incoming frame exceeds maximum size".to_string()));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let (value, _) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())?;
    Ok(value)
}

//! TCP listener for the client-facing wire protocol (`ClientRequest` /
//! `ClientResponse`), the server side of `agentctl`'s connection. Grounded
//! in the teacher's `cli.rs` client / `network::Server` split: here the
//! listener owns one `tokio::spawn`ed task per connection, matching the
//! teacher's per-connection task model in `networking::transport`.

use super::protocol::{read_frame, write_frame, ClientRequest, ClientResponse};
use crate::common::NodeId;
use crate::error::AgentError;
use crate::services::{CatalogService, KvService, SessionService};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub struct ClientServer {
    catalog: Arc<CatalogService>,
    kv: Arc<KvService>,
    sessions: Arc<SessionService>,
}

impl ClientServer {
    pub fn new(catalog: Arc<CatalogService>, kv: Arc<KvService>, sessions: Arc<SessionService>) -> Self {
        Self { catalog, kv, sessions }
    }

    /// Accept connections until the listener is closed, spawning one task
    /// per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept client connection");
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    error!(%peer, error = %e, "client connection ended with an error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: tokio::net::TcpStream) -> crate::error::Result<()> {
        loop {
            let request: ClientRequest = match read_frame(&mut stream).await {
                Ok(r) => r,
                Err(_) => return Ok(()), // peer closed the connection
            };
            let response = self.dispatch(request).await;
            write_frame(&mut stream, &response).await?;
        }
    }

    async fn resolve_node_id(&self, name: &str) -> Option<NodeId> {
        self.catalog.nodes().await.into_iter().find(|n| n.node_id.name == name).map(|n| n.node_id)
    }

    async fn dispatch(&self, request: ClientRequest) -> ClientResponse {
        match self.dispatch_inner(request).await {
            Ok(response) => response,
            Err(e) => ClientResponse::Error(e.to_string()),
        }
    }

    async fn dispatch_inner(&self, request: ClientRequest) -> crate::error::Result<ClientResponse> {
        match request {
            ClientRequest::Ping => Ok(ClientResponse::Pong),

            ClientRequest::CatalogRegisterNode { name, role, address, datacenter, segment } => {
                let node_id = self.resolve_node_id(&name).await.unwrap_or_else(|| NodeId::new(name));
                self.catalog
                    .register_node(
                        node_id,
                        role,
                        address,
                        datacenter,
                        segment,
                        Default::default(),
                        Default::default(),
                    )
                    .await?;
                Ok(ClientResponse::Ok)
            }
            ClientRequest::CatalogDeregisterNode { name } => {
                let node_id = self
                    .resolve_node_id(&name)
                    .await
                    .ok_or_else(|| AgentError::NotFound(format!("node {name}")))?;
                self.catalog.deregister_node(node_id).await?;
                Ok(ClientResponse::Ok)
            }
            ClientRequest::CatalogRegisterService { node_name, service_id, name, tags, port } => {
                let node_id = self
                    .resolve_node_id(&node_name)
                    .await
                    .ok_or_else(|| AgentError::NotFound(format!("node {node_name}")))?;
                self.catalog
                    .register_service(node_id, service_id, name, tags, port, Default::default())
                    .await?;
                Ok(ClientResponse::Ok)
            }
            ClientRequest::CatalogDeregisterService { node_name, service_id } => {
                let node_id = self
                    .resolve_node_id(&node_name)
                    .await
                    .ok_or_else(|| AgentError::NotFound(format!("node {node_name}")))?;
                self.catalog.deregister_service(node_id, service_id).await?;
                Ok(ClientResponse::Ok)
            }
            ClientRequest::CatalogListNodes => Ok(ClientResponse::Nodes(self.catalog.nodes().await)),
            ClientRequest::CatalogListServices { name, only_passing } => {
                Ok(ClientResponse::Services(self.catalog.services_by_name(&name, only_passing).await))
            }

            ClientRequest::KvGet { key } => {
                Ok(ClientResponse::Value(self.kv.get(&key).await.map(|v| v.value)))
            }
            ClientRequest::KvPut { key, value } => {
                self.kv.put(key, value).await?;
                Ok(ClientResponse::Ok)
            }
            ClientRequest::KvDelete { key } => {
                self.kv.delete(key).await?;
                Ok(ClientResponse::Ok)
            }
            ClientRequest::KvLock { key, session } => Ok(ClientResponse::Bool(self.kv.acquire_lock(key, session).await?)),
            ClientRequest::KvUnlock { key, session } => Ok(ClientResponse::Bool(self.kv.release_lock(key, session).await?)),

            ClientRequest::SessionCreate { node_name, behavior, ttl_seconds } => {
                let node_id = self.resolve_node_id(&node_name).await.unwrap_or_else(|| NodeId::new(node_name));
                let id = self.sessions.create(node_id, behavior, ttl_seconds, 0, Vec::new()).await?;
                Ok(ClientResponse::SessionId(id))
            }
            ClientRequest::SessionRenew { session } => {
                self.sessions.renew(session).await?;
                Ok(ClientResponse::Ok)
            }
            ClientRequest::SessionDestroy { session } => {
                self.sessions.destroy(session).await?;
                Ok(ClientResponse::Ok)
            }
        }
    }
}

/// Bind and serve on `addr`, logging the listening address the way the
/// teacher's `main.rs` announces its native protocol port.
pub async fn serve(server: Arc<ClientServer>, addr: &str) -> crate::error::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "client RPC listener ready");
    server.run(listener).await;
    Ok(())
}

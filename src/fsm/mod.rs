//! Deterministic state machine (component E): applies committed log entries
//! to the state store (component D) in index order. Every command is
//! content-addressed by a `request_id` so a log replay after a crash (or a
//! leader re-sending an un-acknowledged entry) never double-applies it --
//! the same idempotence guarantee the teacher gives client requests via
//! `LogEntry::client_id`/`request_id` in `clustering::raft`.

use crate::common::{CheckId, CheckStatus, Index, NodeId, NodeMeta, NodeRole, ServiceId, SessionId, TaggedAddresses};
use crate::common::bounded_map::BoundedHashMap;
use crate::coordinate::Coordinate;
use crate::store::Table;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

const DEDUP_WINDOW: usize = 65_536;
/// How many entries the check-status audit trail retains before the oldest
/// are dropped (spec §4.4: "status transitions are audited").
const CHECK_AUDIT_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogNode {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub address: String,
    pub datacenter: String,
    pub segment: String,
    pub tagged_addresses: TaggedAddresses,
    pub meta: NodeMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogService {
    pub service_id: ServiceId,
    pub node_id: NodeId,
    pub name: String,
    pub tags: Vec<String>,
    pub port: u16,
    pub meta: NodeMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckEntry {
    pub check_id: CheckId,
    pub node_id: NodeId,
    pub service_id: Option<ServiceId>,
    pub status: CheckStatus,
    pub output: String,
}

/// One audited old->new status transition, recorded every time a check is
/// applied (spec §4.4: "status transitions are audited").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckTransition {
    pub node_id: NodeId,
    pub check_id: CheckId,
    pub old_status: Option<CheckStatus>,
    pub new_status: CheckStatus,
    pub index: Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionBehavior {
    Release,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: SessionId,
    pub node_id: NodeId,
    pub behavior: SessionBehavior,
    pub ttl_seconds: u64,
    pub lock_delay_seconds: u64,
    pub checks: Vec<CheckId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub session: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclToken {
    pub id: Uuid,
    pub secret: String,
    /// Policy names attached directly to the token.
    pub policies: Vec<String>,
    /// Role names; resolution walks token -> policies + roles -> rules, so
    /// each role's own policies apply as if attached directly.
    pub roles: Vec<String>,
    /// Local tokens are only valid in the datacenter that created them;
    /// global tokens replicate and resolve everywhere.
    pub local: bool,
}

/// A named, reusable bundle of rule strings (`service:<name>:{read,write}`
/// or `*`), attached to tokens either directly or through a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclPolicy {
    pub name: String,
    pub rules: Vec<String>,
}

/// A named group of policies, attached to tokens to grant all of its
/// policies' rules at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRole {
    pub name: String,
    pub policy_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub kind: String,
    pub name: String,
    pub payload: serde_json::Value,
}

/// Every mutation the cluster can agree on goes through one of these
/// variants; each is wrapped with a `request_id` for dedup (spec §3.2:
/// "applying the same entry twice must be a no-op").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    RegisterNode { request_id: Uuid, node: CatalogNode },
    DeregisterNode { request_id: Uuid, node_id: NodeId, index: Index },
    RegisterService { request_id: Uuid, service: CatalogService },
    DeregisterService { request_id: Uuid, node_id: NodeId, service_id: ServiceId, index: Index },
    UpdateCheck { request_id: Uuid, check: CheckEntry },
    RemoveCheck { request_id: Uuid, node_id: NodeId, check_id: CheckId, index: Index },

    KvPut { request_id: Uuid, key: String, entry: KvEntry },
    KvCas { request_id: Uuid, key: String, entry: KvEntry, expected_index: Index },
    KvDelete { request_id: Uuid, key: String, index: Index },

    SessionCreate { request_id: Uuid, session: SessionEntry },
    SessionDestroy { request_id: Uuid, session_id: SessionId, index: Index },

    AclTokenUpsert { request_id: Uuid, token: AclToken },
    AclTokenDelete { request_id: Uuid, token_id: Uuid, index: Index },
    AclPolicyUpsert { request_id: Uuid, policy: AclPolicy },
    AclPolicyDelete { request_id: Uuid, name: String, index: Index },
    AclRoleUpsert { request_id: Uuid, role: AclRole },
    AclRoleDelete { request_id: Uuid, name: String, index: Index },

    ConfigEntryUpsert { request_id: Uuid, entry: ConfigEntry },
    ConfigEntryDelete { request_id: Uuid, kind: String, name: String, index: Index },

    CoordinateUpdate { request_id: Uuid, node_id: NodeId, coordinate: Coordinate },

    ReapTombstones { request_id: Uuid, below_index: Index },
}

impl Command {
    pub fn request_id(&self) -> Uuid {
        match self {
            Command::RegisterNode { request_id, .. }
            | Command::DeregisterNode { request_id, .. }
            | Command::RegisterService { request_id, .. }
            | Command::DeregisterService { request_id, .. }
            | Command::UpdateCheck { request_id, .. }
            | Command::RemoveCheck { request_id, .. }
            | Command::KvPut { request_id, .. }
            | Command::KvCas { request_id, .. }
            | Command::KvDelete { request_id, .. }
            | Command::SessionCreate { request_id, .. }
            | Command::SessionDestroy { request_id, .. }
            | Command::AclTokenUpsert { request_id, .. }
            | Command::AclTokenDelete { request_id, .. }
            | Command::AclPolicyUpsert { request_id, .. }
            | Command::AclPolicyDelete { request_id, .. }
            | Command::AclRoleUpsert { request_id, .. }
            | Command::AclRoleDelete { request_id, .. }
            | Command::ConfigEntryUpsert { request_id, .. }
            | Command::ConfigEntryDelete { request_id, .. }
            | Command::CoordinateUpdate { request_id, .. }
            | Command::ReapTombstones { request_id, .. } => *request_id,
        }
    }
}

/// Outcome of applying one command, handed back to the caller awaiting the
/// write (CAS failures are not errors, they are a normal negative result).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApplyResult {
    Ok,
    CasFailed,
    NotFound,
    Duplicate,
    /// Rejected because the command references an entity that must exist
    /// first but doesn't (spec §3.4 invariant #2: a service registration
    /// must reference an already-registered node).
    InvalidReference,
}

pub struct Fsm {
    pub nodes: Table<NodeId, CatalogNode>,
    pub services: Table<(NodeId, ServiceId), CatalogService>,
    pub checks: Table<(NodeId, CheckId), CheckEntry>,
    pub kv: Table<String, KvEntry>,
    pub sessions: Table<SessionId, SessionEntry>,
    pub acl_tokens: Table<Uuid, AclToken>,
    pub acl_policies: Table<String, AclPolicy>,
    pub acl_roles: Table<String, AclRole>,
    pub config_entries: Table<(String, String), ConfigEntry>,
    pub coordinates: Table<NodeId, Coordinate>,
    applied: Index,
    dedup: BoundedHashMap<Uuid, Index>,
    check_audit: VecDeque<CheckTransition>,
}

impl Fsm {
    pub fn new() -> Self {
        Self {
            nodes: Table::new(),
            services: Table::new(),
            checks: Table::new(),
            kv: Table::new(),
            sessions: Table::new(),
            acl_tokens: Table::new(),
            acl_policies: Table::new(),
            acl_roles: Table::new(),
            config_entries: Table::new(),
            coordinates: Table::new(),
            applied: 0,
            dedup: BoundedHashMap::new(DEDUP_WINDOW),
            check_audit: VecDeque::new(),
        }
    }

    pub fn last_applied(&self) -> Index {
        self.applied
    }

    /// The audited history of check status transitions, oldest first,
    /// bounded to the last [`CHECK_AUDIT_LOG_CAPACITY`] entries.
    pub fn check_audit(&self) -> impl Iterator<Item = &CheckTransition> {
        self.check_audit.iter()
    }

    fn record_check_transition(&mut self, node_id: NodeId, check_id: CheckId, old_status: Option<CheckStatus>, new_status: CheckStatus, index: Index) {
        if self.check_audit.len() >= CHECK_AUDIT_LOG_CAPACITY {
            self.check_audit.pop_front();
        }
        self.check_audit.push_back(CheckTransition {
            node_id,
            check_id,
            old_status,
            new_status,
            index,
        });
    }

    /// Apply one committed command at `index`. Idempotent: replaying the
    /// same `request_id` returns `ApplyResult::Duplicate` without mutating
    /// any table.
    pub fn apply(&mut self, index: Index, command: Command) -> ApplyResult {
        let request_id = command.request_id();
        if self.dedup.contains_key(&request_id) {
            return ApplyResult::Duplicate;
        }
        let result = self.apply_inner(index, command);
        self.dedup.insert(request_id, index);
        self.applied = self.applied.max(index);
        result
    }

    fn apply_inner(&mut self, index: Index, command: Command) -> ApplyResult {
        match command {
            Command::RegisterNode { node, .. } => {
                self.nodes.put(node.node_id.clone(), node, index);
                ApplyResult::Ok
            }
            Command::DeregisterNode { node_id, .. } => {
                // Deregistering a node cascades to its services and checks
                // (spec §4.3: "deregistering a node removes its services").
                let keys: Vec<_> = self
                    .services
                    .iter_values()
                    .into_iter()
                    .filter(|(k, _)| k.0 == node_id)
                    .map(|(k, _)| k)
                    .collect();
                for key in keys {
                    self.services.delete(&key, index);
                }
                let check_keys: Vec<_> = self
                    .checks
                    .iter_values()
                    .into_iter()
                    .filter(|(k, _)| k.0 == node_id)
                    .map(|(k, _)| k)
                    .collect();
                for key in check_keys {
                    self.checks.delete(&key, index);
                }
                if self.nodes.delete(&node_id, index) {
                    ApplyResult::Ok
                } else {
                    ApplyResult::NotFound
                }
            }
            Command::RegisterService { service, .. } => {
                if !self.nodes.contains(&service.node_id) {
                    return ApplyResult::InvalidReference;
                }
                self.services
                    .put((service.node_id.clone(), service.service_id.clone()), service, index);
                ApplyResult::Ok
            }
            Command::DeregisterService { node_id, service_id, .. } => {
                if self.services.delete(&(node_id, service_id), index) {
                    ApplyResult::Ok
                } else {
                    ApplyResult::NotFound
                }
            }
            Command::UpdateCheck { check, .. } => {
                let key = (check.node_id.clone(), check.check_id.clone());
                let old_status = self.checks.get(&key).map(|v| v.value.status);
                self.checks.put(key, check.clone(), index);
                self.record_check_transition(check.node_id, check.check_id, old_status, check.status, index);
                ApplyResult::Ok
            }
            Command::RemoveCheck { node_id, check_id, .. } => {
                if self.checks.delete(&(node_id, check_id), index) {
                    ApplyResult::Ok
                } else {
                    ApplyResult::NotFound
                }
            }
            Command::KvPut { key, entry, .. } => {
                self.kv.put(key, entry, index);
                ApplyResult::Ok
            }
            Command::KvCas { key, entry, expected_index, .. } => {
                if self.kv.cas(key, entry, expected_index, index) {
                    ApplyResult::Ok
                } else {
                    ApplyResult::CasFailed
                }
            }
            Command::KvDelete { key, .. } => {
                if self.kv.delete(&key, index) {
                    ApplyResult::Ok
                } else {
                    ApplyResult::NotFound
                }
            }
            Command::SessionCreate { session, .. } => {
                self.sessions.put(session.id, session, index);
                ApplyResult::Ok
            }
            Command::SessionDestroy { session_id, .. } => {
                // Invalidating a session releases or deletes any KV keys
                // held under it, per the session's configured behavior
                // (spec §5: session invalidation semantics).
                if let Some(session) = self.sessions.get(&session_id) {
                    let held_keys: Vec<String> = self
                        .kv
                        .iter_values()
                        .into_iter()
                        .filter(|(_, v)| v.value.session == Some(session_id))
                        .map(|(k, _)| k)
                        .collect();
                    for key in held_keys {
                        match session.value.behavior {
                            SessionBehavior::Release => {
                                if let Some(existing) = self.kv.get(&key) {
                                    let mut released = existing.value;
                                    released.session = None;
                                    self.kv.put(key, released, index);
                                }
                            }
                            SessionBehavior::Delete => {
                                self.kv.delete(&key, index);
                            }
                        }
                    }
                }
                if self.sessions.delete(&session_id, index) {
                    ApplyResult::Ok
                } else {
                    ApplyResult::NotFound
                }
            }
            Command::AclTokenUpsert { token, .. } => {
                self.acl_tokens.put(token.id, token, index);
                ApplyResult::Ok
            }
            Command::AclTokenDelete { token_id, .. } => {
                if self.acl_tokens.delete(&token_id, index) {
                    ApplyResult::Ok
                } else {
                    ApplyResult::NotFound
                }
            }
            Command::AclPolicyUpsert { policy, .. } => {
                self.acl_policies.put(policy.name.clone(), policy, index);
                ApplyResult::Ok
            }
            Command::AclPolicyDelete { name, .. } => {
                if self.acl_policies.delete(&name, index) {
                    ApplyResult::Ok
                } else {
                    ApplyResult::NotFound
                }
            }
            Command::AclRoleUpsert { role, .. } => {
                self.acl_roles.put(role.name.clone(), role, index);
                ApplyResult::Ok
            }
            Command::AclRoleDelete { name, .. } => {
                if self.acl_roles.delete(&name, index) {
                    ApplyResult::Ok
                } else {
                    ApplyResult::NotFound
                }
            }
            Command::ConfigEntryUpsert { entry, .. } => {
                self.config_entries
                    .put((entry.kind.clone(), entry.name.clone()), entry, index);
                ApplyResult::Ok
            }
            Command::ConfigEntryDelete { kind, name, .. } => {
                if self.config_entries.delete(&(kind, name), index) {
                    ApplyResult::Ok
                } else {
                    ApplyResult::NotFound
                }
            }
            Command::CoordinateUpdate { node_id, coordinate, .. } => {
                self.coordinates.put(node_id, coordinate, index);
                ApplyResult::Ok
            }
            Command::ReapTombstones { below_index, .. } => {
                self.nodes.reap_tombstones(below_index);
                self.services.reap_tombstones(below_index);
                self.checks.reap_tombstones(below_index);
                self.kv.reap_tombstones(below_index);
                self.sessions.reap_tombstones(below_index);
                self.acl_tokens.reap_tombstones(below_index);
                self.acl_policies.reap_tombstones(below_index);
                self.acl_roles.reap_tombstones(below_index);
                self.config_entries.reap_tombstones(below_index);
                ApplyResult::Ok
            }
        }
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of table lengths for periodic status reporting; not a real
/// byte-for-byte snapshot (see [`crate::consensus::Snapshot`] for that).
pub fn table_sizes(fsm: &Fsm) -> HashMap<&'static str, usize> {
    let mut sizes = HashMap::new();
    sizes.insert("nodes", fsm.nodes.len());
    sizes.insert("services", fsm.services.len());
    sizes.insert("checks", fsm.checks.len());
    sizes.insert("kv", fsm.kv.len());
    sizes.insert("sessions", fsm.sessions.len());
    sizes.insert("acl_tokens", fsm.acl_tokens.len());
    sizes.insert("acl_policies", fsm.acl_policies.len());
    sizes.insert("acl_roles", fsm.acl_roles.len());
    sizes.insert("config_entries", fsm.config_entries.len());
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    #[test]
    fn apply_is_idempotent_for_repeated_request_id() {
        let mut fsm = Fsm::new();
        let request_id = Uuid::new_v4();
        let n = node("n1");
        let cmd = Command::RegisterNode {
            request_id,
            node: CatalogNode {
                node_id: n.clone(),
                role: NodeRole::Server,
                address: "10.0.0.1".into(),
                datacenter: "dc1".into(),
                segment: "".into(),
                tagged_addresses: TaggedAddresses::default(),
                meta: NodeMeta::default(),
            },
        };
        assert!(matches!(fsm.apply(1, cmd.clone()), ApplyResult::Ok));
        assert!(matches!(fsm.apply(2, cmd), ApplyResult::Duplicate));
        assert_eq!(fsm.nodes.len(), 1);
    }

    #[test]
    fn deregister_node_cascades_to_services_and_checks() {
        let mut fsm = Fsm::new();
        let n = node("n1");
        fsm.apply(
            1,
            Command::RegisterNode {
                request_id: Uuid::new_v4(),
                node: CatalogNode {
                    node_id: n.clone(),
                    role: NodeRole::Client,
                    address: "10.0.0.1".into(),
                    datacenter: "dc1".into(),
                    segment: "".into(),
                    tagged_addresses: TaggedAddresses::default(),
                    meta: NodeMeta::default(),
                },
            },
        );
        fsm.apply(
            2,
            Command::RegisterService {
                request_id: Uuid::new_v4(),
                service: CatalogService {
                    service_id: "web".into(),
                    node_id: n.clone(),
                    name: "web".into(),
                    tags: vec![],
                    port: 8080,
                    meta: NodeMeta::default(),
                },
            },
        );
        fsm.apply(
            3,
            Command::DeregisterNode {
                request_id: Uuid::new_v4(),
                node_id: n,
                index: 3,
            },
        );
        assert_eq!(fsm.nodes.len(), 0);
        assert_eq!(fsm.services.len(), 0);
    }

    #[test]
    fn register_service_without_its_node_is_rejected() {
        let mut fsm = Fsm::new();
        let result = fsm.apply(
            1,
            Command::RegisterService {
                request_id: Uuid::new_v4(),
                service: CatalogService {
                    service_id: "web".into(),
                    node_id: node("ghost"),
                    name: "web".into(),
                    tags: vec![],
                    port: 8080,
                    meta: NodeMeta::default(),
                },
            },
        );
        assert!(matches!(result, ApplyResult::InvalidReference));
        assert_eq!(fsm.services.len(), 0);
    }

    #[test]
    fn session_destroy_releases_held_keys() {
        let mut fsm = Fsm::new();
        let session_id = Uuid::new_v4();
        fsm.apply(
            1,
            Command::SessionCreate {
                request_id: Uuid::new_v4(),
                session: SessionEntry {
                    id: session_id,
                    node_id: node("n1"),
                    behavior: SessionBehavior::Release,
                    ttl_seconds: 15,
                    lock_delay_seconds: 15,
                    checks: vec![],
                },
            },
        );
        fsm.apply(
            2,
            Command::KvPut {
                request_id: Uuid::new_v4(),
                key: "lock/a".into(),
                entry: KvEntry {
                    value: b"x".to_vec(),
                    session: Some(session_id),
                },
            },
        );
        fsm.apply(
            3,
            Command::SessionDestroy {
                request_id: Uuid::new_v4(),
                session_id,
                index: 3,
            },
        );
        let entry = fsm.kv.get(&"lock/a".to_string()).unwrap();
        assert!(entry.value.session.is_none());
    }

    #[test]
    fn update_check_audits_the_old_to_new_transition() {
        let mut fsm = Fsm::new();
        let n = node("n1");
        let check = |status: CheckStatus| CheckEntry {
            check_id: "c1".into(),
            node_id: n.clone(),
            service_id: None,
            status,
            output: String::new(),
        };
        fsm.apply(1, Command::UpdateCheck { request_id: Uuid::new_v4(), check: check(CheckStatus::Passing) });
        fsm.apply(2, Command::UpdateCheck { request_id: Uuid::new_v4(), check: check(CheckStatus::Critical) });

        let audit: Vec<&CheckTransition> = fsm.check_audit().collect();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].old_status, None);
        assert_eq!(audit[0].new_status, CheckStatus::Passing);
        assert_eq!(audit[1].old_status, Some(CheckStatus::Passing));
        assert_eq!(audit[1].new_status, CheckStatus::Critical);
    }
}

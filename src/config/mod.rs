//! Agent configuration: option record, schema-driven merge, and validation.
//!
//! Grounded in the teacher's `Config`/`DatabaseConfig` struct-with-`Default`
//! pattern (`lib.rs`, `main.rs`), generalized to the two-source-format,
//! four-stage merge spec §6 describes: `defaults -> files (alphabetical) ->
//! flags -> overrides`.

mod merge;
mod validate;

pub use merge::{merge_configs, MergeRule};
pub use validate::{bootstrap_warnings, validate};

use crate::common::Datacenter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    pub dns: i32,
    pub http: i32,
    pub https: i32,
    pub grpc: i32,
    pub server: i32,
    pub serf_lan: i32,
    pub serf_wan: i32,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            dns: 8600,
            http: 8500,
            https: -1,
            grpc: -1,
            server: 8300,
            serf_lan: 8301,
            serf_wan: 8302,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownPolicy {
    Deny,
    Allow,
    ExtendCache,
    AsyncCache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclConfig {
    pub enabled: bool,
    pub default_policy: String,
    pub down_policy: DownPolicy,
    pub policy_ttl: Duration,
    pub role_ttl: Duration,
    pub token_ttl: Duration,
    pub tokens: HashMap<String, String>,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_policy: "allow".to_string(),
            down_policy: DownPolicy::ExtendCache,
            policy_ttl: Duration::from_secs(30),
            role_ttl: Duration::from_secs(30),
            token_ttl: Duration::from_secs(30),
            tokens: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    pub enabled: bool,
    pub ca_provider: String,
    pub ca_config: HashMap<String, String>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_provider: "consul".to_string(),
            ca_config: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoEncryptConfig {
    pub tls: bool,
    pub allow_tls: bool,
    pub dns_san: Vec<String>,
    pub ip_san: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoConfigConfig {
    pub enabled: bool,
    pub intro_token: Option<String>,
    pub server_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub rpc_rate: f64,
    pub rpc_max_burst: u32,
    pub rpc_max_conns_per_client: u32,
    pub http_max_conns_per_client: u32,
    pub kv_max_value_size: u64,
    pub txn_max_req_len: u64,
    pub https_handshake_timeout: Duration,
    pub rpc_handshake_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rpc_rate: f64::INFINITY,
            rpc_max_burst: 1000,
            rpc_max_conns_per_client: 100,
            http_max_conns_per_client: 200,
            kv_max_value_size: 512 * 1024,
            txn_max_req_len: 512 * 1024,
            https_handshake_timeout: Duration::from_secs(5),
            rpc_handshake_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub raft_multiplier: u32,
    pub leave_drain_time: Duration,
    pub rpc_hold_timeout: Duration,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            raft_multiplier: 1,
            leave_drain_time: Duration::from_secs(5),
            rpc_hold_timeout: Duration::from_secs(7),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotConfig {
    pub cleanup_dead_servers: bool,
    pub last_contact_threshold: Duration,
    pub max_trailing_logs: u64,
    pub min_quorum: u32,
    pub server_stabilization_time: Duration,
    pub disable_upgrade_migration: bool,
    pub redundancy_zone_tag: Option<String>,
    pub upgrade_version_tag: Option<String>,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            cleanup_dead_servers: true,
            last_contact_threshold: Duration::from_millis(200),
            max_trailing_logs: 250,
            min_quorum: 0,
            server_stabilization_time: Duration::from_secs(10),
            disable_upgrade_migration: false,
            redundancy_zone_tag: None,
            upgrade_version_tag: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Deregister a service once one of its checks has been `critical`
    /// longer than this. `None` disables the sweep (spec §4.4).
    pub deregister_critical_service_after: Option<Duration>,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            deregister_critical_service_after: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    pub allow_stale: bool,
    pub max_stale: Duration,
    pub node_ttl: Duration,
    pub service_ttl: HashMap<String, Duration>,
    pub udp_answer_limit: u32,
    pub a_record_limit: Option<u32>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            allow_stale: true,
            max_stale: Duration::from_secs(10 * 365 * 24 * 3600),
            node_ttl: Duration::from_secs(0),
            service_ttl: HashMap::new(),
            udp_answer_limit: 3,
            a_record_limit: None,
        }
    }
}

/// Deprecated UI surface fields, deep-merged per spec §9: the legacy form
/// (`ui`, `ui_dir`, `ui_content_path`) only wins when `ui_config.*` is unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyUiConfig {
    pub ui: Option<bool>,
    pub ui_dir: Option<String>,
    pub ui_content_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiConfig {
    pub enabled: Option<bool>,
    pub content_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub datacenter: Datacenter,
    pub primary_datacenter: Option<Datacenter>,
    pub data_dir: String,
    pub bind_addr: String,
    pub advertise_addr: Option<String>,
    pub advertise_addr_wan: Option<String>,
    pub client_addr: String,
    pub ports: PortsConfig,
    pub encrypt: Option<String>,
    pub server: bool,
    pub bootstrap: bool,
    pub bootstrap_expect: i32,
    pub retry_join: Vec<String>,
    pub retry_join_wan: Vec<String>,
    pub retry_interval: Duration,
    pub retry_max: u32,
    pub acl: AclConfig,
    pub connect: ConnectConfig,
    pub auto_encrypt: AutoEncryptConfig,
    pub auto_config: AutoConfigConfig,
    pub limits: LimitsConfig,
    pub performance: PerformanceConfig,
    pub autopilot: AutopilotConfig,
    pub checks: CheckConfig,
    pub dns_config: DnsConfig,
    pub legacy_ui: LegacyUiConfig,
    pub ui_config: UiConfig,
    pub alt_domain: Option<String>,
    pub node_name: String,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            datacenter: "dc1".to_string(),
            primary_datacenter: None,
            data_dir: "./data".to_string(),
            bind_addr: "0.0.0.0".to_string(),
            advertise_addr: None,
            advertise_addr_wan: None,
            client_addr: "127.0.0.1".to_string(),
            ports: PortsConfig::default(),
            encrypt: None,
            server: false,
            bootstrap: false,
            bootstrap_expect: 0,
            retry_join: Vec::new(),
            retry_join_wan: Vec::new(),
            retry_interval: Duration::from_secs(30),
            retry_max: 0,
            acl: AclConfig::default(),
            connect: ConnectConfig::default(),
            auto_encrypt: AutoEncryptConfig::default(),
            auto_config: AutoConfigConfig::default(),
            limits: LimitsConfig::default(),
            performance: PerformanceConfig::default(),
            autopilot: AutopilotConfig::default(),
            checks: CheckConfig::default(),
            dns_config: DnsConfig::default(),
            legacy_ui: LegacyUiConfig::default(),
            ui_config: UiConfig::default(),
            alt_domain: None,
            node_name: "agent-1".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Apply the bootstrap_expect=1 => bootstrap=true policy kept from the
    /// source behavior per spec §9 (flagged there as worth reconsidering,
    /// but not changed).
    pub fn normalize(&mut self) {
        if self.bootstrap_expect == 1 {
            self.bootstrap = true;
        }
        if self.legacy_ui.ui_dir.is_some() && self.ui_config.content_path.is_none() {
            self.ui_config.content_path = self.legacy_ui.ui_dir.clone();
        }
        if self.legacy_ui.ui.is_some() && self.ui_config.enabled.is_none() {
            self.ui_config.enabled = self.legacy_ui.ui;
        }
    }

    pub fn resolved_ui_enabled(&self) -> bool {
        self.ui_config
            .enabled
            .or(self.legacy_ui.ui)
            .unwrap_or(false)
    }
}

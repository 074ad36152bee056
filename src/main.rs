//! agentd - distributed service-discovery and coordination agent.
//!
//! Entry point: parse flags, load and merge configuration, start the
//! consensus/FSM/services stack, and run until a termination signal.
//! Follows the teacher's `main.rs` shape (`tracing_subscriber::fmt()`
//! banner, then subsystem init, then a blocking run loop).

use agent::agent::{AgentSignal, AgentSupervisor};
use agent::anti_entropy::{LocalRegistry, Reconciler};
use agent::common::NodeId;
use agent::config::{self, AgentConfig};
use agent::consensus::RaftConsensus;
use agent::fsm::Fsm;
use agent::rpc::server::{serve, ClientServer};
use agent::rpc::{Dispatcher, DispatchingSubmitter, RateLimiter};
use agent::services::acl::LocalAclSource;
use agent::services::{AclService, CatalogService, HealthService, KvService, SessionService};
use agent::{Result, VERSION};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "agentd", version, about = "distributed service-discovery and coordination agent")]
struct Flags {
    #[arg(long)]
    config_file: Vec<PathBuf>,
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    advertise: Option<String>,
    #[arg(long)]
    client: Option<String>,
    #[arg(long)]
    server: bool,
    #[arg(long)]
    bootstrap: bool,
    #[arg(long)]
    bootstrap_expect: Option<i32>,
    #[arg(long)]
    datacenter: Option<String>,
    #[arg(long)]
    data_dir: Option<String>,
    #[arg(long)]
    node_name: Option<String>,
    #[arg(long)]
    dev: bool,
    #[arg(long = "retry-join")]
    retry_join: Vec<String>,
    #[arg(long = "join-wan")]
    retry_join_wan: Vec<String>,
    #[arg(long)]
    dns_port: Option<i32>,
    #[arg(long)]
    http_port: Option<i32>,
    #[arg(long)]
    log_level: Option<String>,
}

impl Flags {
    /// Build the flag-overlay JSON value merged on top of the config-file
    /// layer (spec §6: `defaults -> files -> flags -> overrides`).
    fn to_overlay(&self) -> serde_json::Value {
        let mut overlay = serde_json::Map::new();
        macro_rules! put {
            ($key:literal, $field:expr) => {
                if let Some(v) = &$field {
                    overlay.insert($key.to_string(), serde_json::json!(v));
                }
            };
        }
        put!("bind_addr", self.bind);
        put!("advertise_addr", self.advertise);
        put!("client_addr", self.client);
        put!("datacenter", self.datacenter);
        put!("data_dir", self.data_dir);
        put!("node_name", self.node_name);
        put!("bootstrap_expect", self.bootstrap_expect);
        put!("log_level", self.log_level);
        if self.server {
            overlay.insert("server".into(), serde_json::json!(true));
        }
        if self.bootstrap {
            overlay.insert("bootstrap".into(), serde_json::json!(true));
        }
        if !self.retry_join.is_empty() {
            overlay.insert("retry_join".into(), serde_json::json!(self.retry_join));
        }
        if !self.retry_join_wan.is_empty() {
            overlay.insert("retry_join_wan".into(), serde_json::json!(self.retry_join_wan));
        }
        let mut ports = serde_json::Map::new();
        if let Some(p) = self.dns_port {
            ports.insert("dns".into(), serde_json::json!(p));
        }
        if let Some(p) = self.http_port {
            ports.insert("http".into(), serde_json::json!(p));
        }
        if !ports.is_empty() {
            overlay.insert("ports".into(), serde_json::Value::Object(ports));
        }
        serde_json::Value::Object(overlay)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let flags = Flags::parse();

    let mut sources = vec![serde_json::to_value(AgentConfig::default()).expect("default config always serializes")];

    let mut file_paths = flags.config_file.clone();
    file_paths.sort();
    for path in &file_paths {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| agent::AgentError::Config(format!("reading {}: {e}", path.display())))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| agent::AgentError::Config(format!("parsing {}: {e}", path.display())))?;
        sources.push(value);
    }
    sources.push(flags.to_overlay());

    let merged = config::merge_configs(&sources);
    let mut agent_config: AgentConfig = serde_json::from_value(merged)?;
    agent_config.normalize();
    if flags.dev {
        agent_config.bootstrap_expect = 1;
        agent_config.server = true;
    }
    config::validate(&agent_config)?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_env_filter(tracing_subscriber::EnvFilter::new(agent_config.log_level.clone()))
        .init();

    print_banner(&agent_config);

    for warning in config::bootstrap_warnings(agent_config.bootstrap_expect) {
        warn!("{warning}");
    }

    let node_id = NodeId::new(agent_config.node_name.clone());
    let members = vec![node_id.clone()];
    let consensus = Arc::new(RaftConsensus::new(
        node_id.clone(),
        members,
        false,
        agent_config.bootstrap_expect.max(1) as usize,
        agent_config.performance.raft_multiplier,
    ));
    consensus.maybe_self_bootstrap().await;

    let fsm = Arc::new(RwLock::new(Fsm::new()));
    let rate_limiter = Arc::new(RateLimiter::new(agent_config.limits.rpc_rate, agent_config.limits.rpc_max_burst as f64));
    let dispatcher = Arc::new(Dispatcher::new(
        agent_config.datacenter.clone(),
        consensus.clone(),
        fsm.clone(),
        rate_limiter,
        None,
    ));
    let submitter: Arc<dyn agent::services::CommandSubmitter> =
        Arc::new(DispatchingSubmitter::new(dispatcher.clone(), node_id.to_string()));

    let catalog = Arc::new(CatalogService::new(fsm.clone(), submitter.clone()));
    let _health = Arc::new(HealthService::new(
        fsm.clone(),
        submitter.clone(),
        agent_config.checks.deregister_critical_service_after,
    ));
    let kv = Arc::new(KvService::new(fsm.clone(), submitter.clone()));
    let sessions = Arc::new(SessionService::new(fsm.clone(), submitter.clone(), kv.clone()));
    let _acl = Arc::new(AclService::new(
        fsm.clone(),
        submitter.clone(),
        Arc::new(LocalAclSource::new(fsm.clone())),
        agent_config.acl.down_policy,
        agent_config.acl.policy_ttl,
        agent_config.acl.role_ttl,
        agent_config.acl.token_ttl,
    ));

    let registry = Arc::new(LocalRegistry::new());
    let reconciler = Arc::new(Reconciler::new(node_id.clone(), registry, catalog.clone()));

    let mut supervisor = AgentSupervisor::new(node_id.clone(), agent_config.clone())
        .with_reconciler(reconciler)
        .with_sessions(sessions.clone());
    supervisor.acquire_pid_file().await?;
    let supervisor = Arc::new(supervisor);

    supervisor.join(&agent_config.retry_join).await?;
    supervisor.spawn_background_loops();

    let client_addr = format!("{}:{}", agent_config.client_addr, agent_config.ports.server);
    let client_server = Arc::new(ClientServer::new(catalog, kv, sessions));
    tokio::spawn(async move {
        if let Err(e) = serve(client_server, &client_addr).await {
            warn!(error = %e, "client RPC listener stopped");
        }
    });

    info!(node = %node_id, version = VERSION, "agentd is ready");

    let only_server = agent_config.bootstrap_expect <= 1;
    loop {
        let signal = supervisor.wait_for_signal().await;
        supervisor.handle_shutdown_signal(signal, only_server).await?;
        if matches!(signal, AgentSignal::Terminate | AgentSignal::Interrupt) {
            break;
        }
    }

    info!("agentd shutdown complete");
    Ok(())
}

fn print_banner(config: &AgentConfig) {
    println!("==============================================================");
    println!(" agentd v{VERSION} - distributed service-discovery agent");
    println!("==============================================================");
    println!("  datacenter:       {}", config.datacenter);
    println!("  node name:        {}", config.node_name);
    println!("  data dir:         {}", config.data_dir);
    println!("  server:           {}", config.server);
    println!("  bootstrap_expect: {}", config.bootstrap_expect);
    println!("  client addr:      {}:{}", config.client_addr, config.ports.server);
    println!("==============================================================");
    println!();
}

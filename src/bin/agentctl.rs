//! agentctl - interactive client for agentd.
//!
//! Grounded in the teacher's `cli.rs`: connects over TCP, sends one framed
//! request, prints the response. Generalized from a SQL REPL into
//! catalog/KV/session subcommands, with a REPL mode for ad hoc use (spec
//! §A.4).

use agent::common::SessionId;
use agent::fsm::SessionBehavior;
use agent::rpc::protocol::{read_frame, write_frame, ClientRequest, ClientResponse};
use agent::{AgentError, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(name = "agentctl", about = "command-line client for agentd")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:8300")]
    addr: String,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },
    Kv {
        #[command(subcommand)]
        action: KvAction,
    },
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand, Debug)]
enum CatalogAction {
    Register {
        name: String,
        address: String,
        #[arg(long, default_value = "dc1")]
        datacenter: String,
    },
    Deregister {
        name: String,
    },
    Services {
        name: String,
        #[arg(long)]
        only_passing: bool,
    },
    Nodes,
}

#[derive(Subcommand, Debug)]
enum KvAction {
    Get { key: String },
    Put { key: String, value: String },
    Delete { key: String },
    Lock { key: String, session: SessionId },
    Unlock { key: String, session: SessionId },
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    Create {
        node_name: String,
        #[arg(long, default_value_t = 30)]
        ttl_seconds: u64,
        #[arg(long, default_value_t = false)]
        delete_on_invalidate: bool,
    },
    Renew {
        session: SessionId,
    },
    Destroy {
        session: SessionId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(command) => {
            let mut stream = connect(&cli.addr).await?;
            let request = to_request(command);
            let response = round_trip(&mut stream, request).await?;
            print_response(&response);
        }
        None => repl(&cli.addr).await?,
    }
    Ok(())
}

async fn connect(addr: &str) -> Result<TcpStream> {
    TcpStream::connect(addr)
        .await
        .map_err(|e| AgentError::Transport(format!("connecting to {addr}: {e}")))
}

async fn round_trip(stream: &mut TcpStream, request: ClientRequest) -> Result<ClientResponse> {
    write_frame(stream, &request).await?;
    read_frame(stream).await
}

fn to_request(command: Command) -> ClientRequest {
    match command {
        Command::Catalog { action } => match action {
            CatalogAction::Register { name, address, datacenter } => ClientRequest::CatalogRegisterNode {
                name,
                role: agent::common::NodeRole::Client,
                address,
                datacenter,
                segment: String::new(),
            },
            CatalogAction::Deregister { name } => ClientRequest::CatalogDeregisterNode { name },
            CatalogAction::Services { name, only_passing } => ClientRequest::CatalogListServices { name, only_passing },
            CatalogAction::Nodes => ClientRequest::CatalogListNodes,
        },
        Command::Kv { action } => match action {
            KvAction::Get { key } => ClientRequest::KvGet { key },
            KvAction::Put { key, value } => ClientRequest::KvPut { key, value: value.into_bytes() },
            KvAction::Delete { key } => ClientRequest::KvDelete { key },
            KvAction::Lock { key, session } => ClientRequest::KvLock { key, session },
            KvAction::Unlock { key, session } => ClientRequest::KvUnlock { key, session },
        },
        Command::Session { action } => match action {
            SessionAction::Create { node_name, ttl_seconds, delete_on_invalidate } => ClientRequest::SessionCreate {
                node_name,
                behavior: if delete_on_invalidate { SessionBehavior::Delete } else { SessionBehavior::Release },
                ttl_seconds,
            },
            SessionAction::Renew { session } => ClientRequest::SessionRenew { session },
            SessionAction::Destroy { session } => ClientRequest::SessionDestroy { session },
        },
    }
}

fn print_response(response: &ClientResponse) {
    match response {
        ClientResponse::Ok => println!("OK"),
        ClientResponse::Pong => println!("PONG"),
        ClientResponse::Value(Some(v)) => println!("{}", String::from_utf8_lossy(v)),
        ClientResponse::Value(None) => println!("(nil)"),
        ClientResponse::Nodes(nodes) => {
            for node in nodes {
                println!("{}\t{}\t{}", node.node_id.name, node.address, node.datacenter);
            }
        }
        ClientResponse::Services(services) => {
            for (service, checks) in services {
                let worst = checks
                    .iter()
                    .map(|c| format!("{:?}", c.status))
                    .collect::<Vec<_>>()
                    .join(",");
                println!("{}\t{}:{}\t[{}]", service.name, service.node_id.name, service.port, worst);
            }
        }
        ClientResponse::SessionId(id) => println!("{id}"),
        ClientResponse::Bool(b) => println!("{b}"),
        ClientResponse::Error(e) => println!("ERROR: {e}"),
    }
}

async fn repl(addr: &str) -> Result<()> {
    println!("agentctl interactive mode, connected to {addr}");
    println!("commands: catalog nodes | catalog services <name> | kv get <key> | kv put <key> <value> | exit");
    let mut stream = connect(addr).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("agentctl> ");
        use std::io::Write;
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await.map_err(agent::AgentError::from)? else {
            break;
        };
        let parts: Vec<&str> = line.trim().split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts[0].eq_ignore_ascii_case("exit") || parts[0].eq_ignore_ascii_case("quit") {
            break;
        }
        let request = match parse_repl_line(&parts) {
            Some(r) => r,
            None => {
                println!("unrecognized command");
                continue;
            }
        };
        match round_trip(&mut stream, request).await {
            Ok(response) => print_response(&response),
            Err(e) => println!("ERROR: {e}"),
        }
    }
    Ok(())
}

fn parse_repl_line(parts: &[&str]) -> Option<ClientRequest> {
    match parts {
        ["catalog", "nodes"] => Some(ClientRequest::CatalogListNodes),
        ["catalog", "services", name] => Some(ClientRequest::CatalogListServices { name: name.to_string(), only_passing: false }),
        ["kv", "get", key] => Some(ClientRequest::KvGet { key: key.to_string() }),
        ["kv", "put", key, value] => Some(ClientRequest::KvPut { key: key.to_string(), value: value.as_bytes().to_vec() }),
        ["kv", "delete", key] => Some(ClientRequest::KvDelete { key: key.to_string() }),
        ["ping"] => Some(ClientRequest::Ping),
        _ => None,
    }
}

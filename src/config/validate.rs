//! Validation rules from spec §6.

use super::AgentConfig;
use crate::error::{AgentError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::net::IpAddr;

const RESERVED_ALT_DOMAIN_PREFIXES: &[&str] = &["service", "connect", "node", "query", "addr"];

pub fn validate(config: &AgentConfig) -> Result<()> {
    validate_name(&config.datacenter, "datacenter")?;

    if config.auto_config.enabled && config.auto_encrypt.tls {
        return Err(AgentError::Config(
            "auto_config and auto_encrypt.tls are mutually exclusive".to_string(),
        ));
    }

    validate_bind_addr(&config.bind_addr)?;
    validate_alt_domain(config)?;
    validate_ports(config)?;
    validate_bootstrap_expect(config.bootstrap_expect)?;

    if config.limits.http_max_conns_per_client == 0 {
        return Err(AgentError::Config(
            "http_max_conns_per_client must be > 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_name(name: &str, field: &str) -> Result<()> {
    let re = Regex::new(r"^[a-z0-9_-]+$").expect("static regex is valid");
    if !re.is_match(name) {
        return Err(AgentError::Config(format!(
            "{field} '{name}' must match ^[a-z0-9_-]+$"
        )));
    }
    Ok(())
}

fn validate_bind_addr(addr: &str) -> Result<()> {
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| AgentError::Config(format!("bind_addr '{addr}' is not a single IP literal")))?;
    if ip.is_multicast() || ip.is_unspecified() {
        return Err(AgentError::Config(
            "bind_addr must not be a multicast or any address after expansion".to_string(),
        ));
    }
    Ok(())
}

fn validate_alt_domain(config: &AgentConfig) -> Result<()> {
    let Some(domain) = &config.alt_domain else {
        return Ok(());
    };
    let lower = domain.to_ascii_lowercase();
    let mut reserved: Vec<String> = RESERVED_ALT_DOMAIN_PREFIXES
        .iter()
        .map(|s| s.to_string())
        .collect();
    reserved.push(config.datacenter.clone());

    for prefix in reserved {
        if lower.starts_with(&prefix) {
            return Err(AgentError::Config(format!(
                "alt_domain must not be prefixed by reserved keyword '{prefix}'"
            )));
        }
    }
    Ok(())
}

fn port_in_range(port: i32) -> bool {
    port < 0 || (1..=65535).contains(&port)
}

fn validate_ports(config: &AgentConfig) -> Result<()> {
    let ports = &config.ports;
    let named = [
        ("dns", ports.dns),
        ("http", ports.http),
        ("https", ports.https),
        ("grpc", ports.grpc),
        ("server", ports.server),
        ("serf_lan", ports.serf_lan),
        ("serf_wan", ports.serf_wan),
    ];

    for (name, port) in named {
        if !port_in_range(port) {
            return Err(AgentError::Config(format!(
                "port '{name}' must be negative (disabled) or in [1,65535], got {port}"
            )));
        }
    }

    let mut seen = HashSet::new();
    for (name, port) in named {
        if port < 0 {
            continue;
        }
        if !seen.insert(port) {
            return Err(AgentError::Config(format!(
                "listener port {port} (from '{name}') is not unique across DNS/HTTP/HTTPS/RPC/Serf-LAN/Serf-WAN"
            )));
        }
    }

    Ok(())
}

fn validate_bootstrap_expect(expect: i32) -> Result<()> {
    if expect < 0 {
        return Err(AgentError::Config(
            "bootstrap_expect must not be negative".to_string(),
        ));
    }
    Ok(())
}

/// Non-fatal policy warnings surfaced alongside a valid config (spec §8).
pub fn bootstrap_warnings(expect: i32) -> Vec<String> {
    let mut warnings = Vec::new();
    if expect == 1 {
        warnings.push("bootstrap_expect=1: single-server bootstrap, no fault tolerance".into());
    } else if expect == 2 {
        warnings.push("bootstrap_expect=2: cluster has no fault tolerance".into());
    } else if expect > 2 && expect % 2 == 0 {
        warnings.push(format!(
            "bootstrap_expect={expect}: even cluster sizes do not improve fault tolerance over expect-1"
        ));
    }
    warnings
}

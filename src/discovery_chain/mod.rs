//! Discovery chain compiler (component I): compiles a named entry point's
//! router/splitter/resolver configuration entries into an executable DAG
//! used to route an L7 request to a concrete service instance set.
//!
//! The teacher has no direct analogue -- its `networking::routing::router`
//! module resolves a single hop by node id, not a multi-stage traffic
//! policy -- so this module is designed fresh, following the crate's
//! established idiom (small value types, a `Result`-returning compile step,
//! `thiserror`-backed error variants) and the vocabulary of router/splitter/
//! resolver config entries used by production service meshes. Path/header/
//! query matching reuses `regex::Regex`, compiled inline at match time the
//! same way `config::validate::validate_name` compiles its pattern on each
//! call rather than caching it.

use crate::error::{AgentError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub type ChainNodeName = String;

/// Tolerance for a splitter's weights summing to 100 (spec: "weights must be
/// non-negative reals summing to 100, tolerance ε").
const WEIGHT_SUM_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Connect,
    Trace,
}

impl Default for HttpMethod {
    fn default() -> Self {
        HttpMethod::Get
    }
}

/// A service's declared protocol, used by the "router may only target
/// HTTP-class services" validation rule (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceProtocol {
    Http,
    Http2,
    Grpc,
    Tcp,
}

impl ServiceProtocol {
    fn is_http_class(self) -> bool {
        matches!(self, ServiceProtocol::Http | ServiceProtocol::Http2 | ServiceProtocol::Grpc)
    }
}

impl Default for ServiceProtocol {
    fn default() -> Self {
        ServiceProtocol::Http
    }
}

/// A path matcher; the three forms are mutually exclusive by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

impl PathMatch {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact(p) => path == p,
            PathMatch::Prefix(p) => path.starts_with(p.as_str()),
            PathMatch::Regex(pattern) => Regex::new(pattern).map(|re| re.is_match(path)).unwrap_or(false),
        }
    }

    fn is_rewrite_compatible(&self) -> bool {
        matches!(self, PathMatch::Exact(_) | PathMatch::Prefix(_))
    }
}

/// A header/query-param matcher form (spec: "present|exact|prefix|suffix|
/// regex|invert"). At most one form applies per matcher; `invert` negates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MatchForm {
    Present,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Regex(String),
}

impl MatchForm {
    fn matches(&self, value: Option<&str>) -> bool {
        match self {
            MatchForm::Present => value.is_some(),
            MatchForm::Exact(expected) => value == Some(expected.as_str()),
            MatchForm::Prefix(prefix) => value.map(|v| v.starts_with(prefix.as_str())).unwrap_or(false),
            MatchForm::Suffix(suffix) => value.map(|v| v.ends_with(suffix.as_str())).unwrap_or(false),
            MatchForm::Regex(pattern) => value
                .map(|v| Regex::new(pattern).map(|re| re.is_match(v)).unwrap_or(false))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueMatch {
    pub name: String,
    pub form: MatchForm,
    pub invert: bool,
}

impl ValueMatch {
    fn evaluate(&self, value: Option<&str>) -> bool {
        self.form.matches(value) != self.invert
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteMatch {
    pub path: Option<PathMatch>,
    /// Empty means "any method".
    pub methods: Vec<HttpMethod>,
    pub headers: Vec<ValueMatch>,
    pub query_params: Vec<ValueMatch>,
}

impl RouteMatch {
    pub fn matches(&self, request: &RequestFacts) -> bool {
        if let Some(path) = &self.path {
            if !path.matches(&request.path) {
                return false;
            }
        }
        if !self.methods.is_empty() && !self.methods.contains(&request.method) {
            return false;
        }
        for header in &self.headers {
            if !header.evaluate(request.headers.get(&header.name).map(String::as_str)) {
                return false;
            }
        }
        for param in &self.query_params {
            if !param.evaluate(request.query.get(&param.name).map(String::as_str)) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default, Clone)]
pub struct RequestFacts {
    pub path: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub matches: RouteMatch,
    pub destination: ChainNodeName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterEntry {
    pub name: ChainNodeName,
    pub rules: Vec<RouteRule>,
    pub default_destination: ChainNodeName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedSplit {
    pub weight: f64,
    pub destination: ChainNodeName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitterEntry {
    pub name: ChainNodeName,
    pub splits: Vec<WeightedSplit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub num_retries: u32,
    pub retry_on_connect_failure: bool,
    pub retry_on_status_codes: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverEntry {
    pub name: ChainNodeName,
    pub service_name: String,
    pub protocol: ServiceProtocol,
    /// Rewrite to a named subset of `service_name` (e.g. `version=canary`).
    pub subset: Option<String>,
    pub only_passing: bool,
    pub failover_datacenters: Vec<String>,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub prefix_rewrite: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChainConfigEntry {
    Router(RouterEntry),
    Splitter(SplitterEntry),
    Resolver(ResolverEntry),
}

impl ChainConfigEntry {
    fn name(&self) -> &str {
        match self {
            ChainConfigEntry::Router(r) => &r.name,
            ChainConfigEntry::Splitter(s) => &s.name,
            ChainConfigEntry::Resolver(r) => &r.name,
        }
    }

    fn children(&self) -> Vec<&str> {
        match self {
            ChainConfigEntry::Router(r) => {
                let mut out: Vec<&str> = r.rules.iter().map(|rule| rule.destination.as_str()).collect();
                out.push(r.default_destination.as_str());
                out
            }
            ChainConfigEntry::Splitter(s) => s.splits.iter().map(|w| w.destination.as_str()).collect(),
            ChainConfigEntry::Resolver(_) => Vec::new(),
        }
    }
}

/// A compiled, cycle-free chain ready to evaluate against a request.
#[derive(Debug, Clone)]
pub struct CompiledChain {
    entry: ChainNodeName,
    nodes: HashMap<ChainNodeName, ChainConfigEntry>,
}

/// Compile a set of router/splitter/resolver entries rooted at `entry_point`
/// into a [`CompiledChain`], rejecting dangling references and cycles
/// (spec: "a chain with a cycle is a configuration error, rejected at
/// compile time, never at evaluation time"). If no entry exists for
/// `entry_point`, a default catch-all resolver targeting `entry_point`
/// itself as the service name is synthesized (spec step 1).
pub fn compile(entry_point: &str, entries: Vec<ChainConfigEntry>) -> Result<CompiledChain> {
    let mut nodes: HashMap<ChainNodeName, ChainConfigEntry> =
        entries.into_iter().map(|e| (e.name().to_string(), e)).collect();

    if !nodes.contains_key(entry_point) {
        nodes.insert(entry_point.to_string(), ChainConfigEntry::Resolver(default_catch_all(entry_point)));
    }

    detect_cycle(&nodes, entry_point)?;
    validate_entries(&nodes)?;

    Ok(CompiledChain {
        entry: entry_point.to_string(),
        nodes,
    })
}

fn default_catch_all(service_name: &str) -> ResolverEntry {
    ResolverEntry {
        name: service_name.to_string(),
        service_name: service_name.to_string(),
        protocol: ServiceProtocol::Http,
        subset: None,
        only_passing: true,
        failover_datacenters: Vec::new(),
        connect_timeout: None,
        request_timeout: None,
        retry_policy: RetryPolicy::default(),
        prefix_rewrite: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Done,
}

fn detect_cycle(nodes: &HashMap<ChainNodeName, ChainConfigEntry>, start: &str) -> Result<()> {
    let mut state: HashMap<&str, VisitState> = HashMap::new();
    dfs(nodes, start, &mut state)
}

fn dfs<'a>(
    nodes: &'a HashMap<ChainNodeName, ChainConfigEntry>,
    name: &'a str,
    state: &mut HashMap<&'a str, VisitState>,
) -> Result<()> {
    match state.get(name) {
        Some(VisitState::Visiting) => {
            return Err(AgentError::DiscoveryChain(format!("cycle detected at node {name}")));
        }
        Some(VisitState::Done) => return Ok(()),
        None => {}
    }

    let Some(entry) = nodes.get(name) else {
        return Err(AgentError::DiscoveryChain(format!("dangling reference to {name}")));
    };

    state.insert(name, VisitState::Visiting);
    for child in entry.children() {
        dfs(nodes, child, state)?;
    }
    state.insert(name, VisitState::Done);
    Ok(())
}

/// Collect every resolver leaf reachable from `start` by following router
/// and splitter children. Assumes the graph is already known cycle-free.
fn collect_resolvers<'a>(nodes: &'a HashMap<ChainNodeName, ChainConfigEntry>, start: &str, out: &mut Vec<&'a ResolverEntry>) {
    match nodes.get(start) {
        Some(ChainConfigEntry::Resolver(r)) => out.push(r),
        Some(entry) => {
            for child in entry.children() {
                collect_resolvers(nodes, child, out);
            }
        }
        None => {}
    }
}

/// The "Validation (bounding policy)" rules from spec §4.7, run once at
/// compile time so they never have to be re-checked during evaluation.
fn validate_entries(nodes: &HashMap<ChainNodeName, ChainConfigEntry>) -> Result<()> {
    for entry in nodes.values() {
        match entry {
            ChainConfigEntry::Splitter(splitter) => {
                if splitter.splits.iter().any(|s| s.destination == splitter.name) {
                    return Err(AgentError::DiscoveryChain(format!(
                        "splitter {} may not reference itself",
                        splitter.name
                    )));
                }
                if splitter.splits.iter().any(|s| s.weight < 0.0) {
                    return Err(AgentError::DiscoveryChain(format!(
                        "splitter {} has a negative weight",
                        splitter.name
                    )));
                }
                let total: f64 = splitter.splits.iter().map(|s| s.weight).sum();
                if (total - 100.0).abs() > WEIGHT_SUM_EPSILON {
                    return Err(AgentError::DiscoveryChain(format!(
                        "splitter {} weights sum to {total}, not 100",
                        splitter.name
                    )));
                }
            }
            ChainConfigEntry::Router(router) => {
                for rule in &router.rules {
                    let mut resolvers = Vec::new();
                    collect_resolvers(nodes, &rule.destination, &mut resolvers);
                    for resolver in &resolvers {
                        if !resolver.protocol.is_http_class() {
                            return Err(AgentError::DiscoveryChain(format!(
                                "router {} targets non-HTTP-class service {}",
                                router.name, resolver.service_name
                            )));
                        }
                        if resolver.prefix_rewrite.is_some()
                            && !rule.matches.path.as_ref().map(PathMatch::is_rewrite_compatible).unwrap_or(false)
                        {
                            return Err(AgentError::DiscoveryChain(format!(
                                "resolver {} sets prefix_rewrite but its route has no exact/prefix path match",
                                resolver.name
                            )));
                        }
                    }
                }
            }
            ChainConfigEntry::Resolver(_) => {}
        }
    }
    Ok(())
}

/// One leaf resolver decision: the service to query, plus any
/// failover datacenters to try if the primary has no healthy instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub service_name: String,
    pub subset: Option<String>,
    pub only_passing: bool,
    pub failover_datacenters: Vec<String>,
    pub prefix_rewrite: Option<String>,
}

impl CompiledChain {
    /// Evaluate the chain against a request's facts, walking
    /// router-rules/splitter-weights until a resolver leaf is reached.
    /// `split_sample` is a draw in `[0, 100)` used to pick among a
    /// splitter's weighted destinations.
    pub fn evaluate(&self, request: &RequestFacts, split_sample: f64) -> Result<ResolvedTarget> {
        self.evaluate_node(&self.entry, request, split_sample, 0)
    }

    fn evaluate_node(
        &self,
        name: &str,
        request: &RequestFacts,
        split_sample: f64,
        depth: usize,
    ) -> Result<ResolvedTarget> {
        if depth > self.nodes.len() + 1 {
            return Err(AgentError::DiscoveryChain("chain evaluation exceeded node count; compile-time cycle check should have caught this".to_string()));
        }
        let entry = self
            .nodes
            .get(name)
            .ok_or_else(|| AgentError::DiscoveryChain(format!("missing node {name} during evaluation")))?;

        match entry {
            ChainConfigEntry::Resolver(resolver) => Ok(ResolvedTarget {
                service_name: resolver.service_name.clone(),
                subset: resolver.subset.clone(),
                only_passing: resolver.only_passing,
                failover_datacenters: resolver.failover_datacenters.clone(),
                prefix_rewrite: resolver.prefix_rewrite.clone(),
            }),
            ChainConfigEntry::Router(router) => {
                // First matching route wins; unmatched traffic falls through
                // to the implicit default route (spec §4.7 step 3).
                let destination = router
                    .rules
                    .iter()
                    .find(|rule| rule.matches.matches(request))
                    .map(|rule| rule.destination.as_str())
                    .unwrap_or(router.default_destination.as_str());
                self.evaluate_node(destination, request, split_sample, depth + 1)
            }
            ChainConfigEntry::Splitter(splitter) => {
                let total: f64 = splitter.splits.iter().map(|s| s.weight).sum();
                if total <= 0.0 {
                    return Err(AgentError::DiscoveryChain(format!(
                        "splitter {name} has zero total weight"
                    )));
                }
                let sample = split_sample.rem_euclid(total);
                let mut cumulative = 0.0;
                let destination = splitter
                    .splits
                    .iter()
                    .find(|split| {
                        cumulative += split.weight;
                        sample < cumulative
                    })
                    .map(|s| s.destination.as_str())
                    .unwrap_or_else(|| splitter.splits.last().unwrap().destination.as_str());
                self.evaluate_node(destination, request, split_sample, depth + 1)
            }
        }
    }
}

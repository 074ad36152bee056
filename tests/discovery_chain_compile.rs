//! Scenario 4: discovery chain compilation and evaluation. A router with an
//! `/admin` path-prefix rule plus a default route compiles into a chain
//! that sends `/admin/users` to the admin resolver and everything else to
//! the default. A service with no router at all still compiles, routed
//! through a synthesized catch-all resolver.

use agent::discovery_chain::{
    compile, ChainConfigEntry, PathMatch, RequestFacts, ResolverEntry, RetryPolicy, RouteMatch,
    RouteRule, RouterEntry, ServiceProtocol,
};

fn resolver(name: &str, service_name: &str) -> ChainConfigEntry {
    ChainConfigEntry::Resolver(ResolverEntry {
        name: name.to_string(),
        service_name: service_name.to_string(),
        protocol: ServiceProtocol::Http,
        subset: None,
        only_passing: true,
        failover_datacenters: vec![],
        connect_timeout: None,
        request_timeout: None,
        retry_policy: RetryPolicy::default(),
        prefix_rewrite: None,
    })
}

fn entries() -> Vec<ChainConfigEntry> {
    vec![
        ChainConfigEntry::Router(RouterEntry {
            name: "web".to_string(),
            rules: vec![RouteRule {
                matches: RouteMatch { path: Some(PathMatch::Prefix("/admin".to_string())), ..Default::default() },
                destination: "admin".to_string(),
            }],
            default_destination: "web-default".to_string(),
        }),
        resolver("admin", "admin"),
        resolver("web-default", "web"),
    ]
}

#[tokio::test]
async fn path_prefix_route_wins_and_root_falls_through_to_default() {
    let chain = compile("web", entries()).unwrap();

    let admin_request = RequestFacts { path: "/admin/users".to_string(), ..Default::default() };
    let target = chain.evaluate(&admin_request, 0.0).unwrap();
    assert_eq!(target.service_name, "admin");

    let root_request = RequestFacts { path: "/".to_string(), ..Default::default() };
    let target = chain.evaluate(&root_request, 0.0).unwrap();
    assert_eq!(target.service_name, "web");
}

#[test]
fn a_cycle_between_routers_is_rejected_at_compile_time() {
    let cyclic = vec![
        ChainConfigEntry::Router(RouterEntry {
            name: "a".to_string(),
            rules: vec![],
            default_destination: "b".to_string(),
        }),
        ChainConfigEntry::Router(RouterEntry {
            name: "b".to_string(),
            rules: vec![],
            default_destination: "a".to_string(),
        }),
    ];
    assert!(compile("a", cyclic).is_err());
}

#[test]
fn a_service_with_no_router_gets_a_synthesized_catch_all() {
    let chain = compile("orphan-service", vec![]).unwrap();
    let target = chain.evaluate(&RequestFacts::default(), 0.0).unwrap();
    assert_eq!(target.service_name, "orphan-service");
    assert!(target.only_passing);
    assert!(target.failover_datacenters.is_empty());
}

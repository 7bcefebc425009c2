use std::sync::Arc;
use std::time::Duration;

use client_lb::{FailureKind, LbConfig, LbParts, LoadBalancer, RuleKind, Server, StaticServerList, ZoneAwareLoadBalancer};

fn two_zones() -> Vec<Server> {
    let mut servers = Vec::new();
    for zone in ["z1", "z2"] {
        for i in 0..3 {
            servers.push(Server::new(format!("{}-{}", zone, i), 80).with_zone(zone));
        }
    }
    servers
}

fn config(rule: RuleKind) -> LbConfig {
    LbConfig {
        name: "zones".to_string(),
        rule,
        zone_rule: RuleKind::AvailabilityFiltering,
        client_zone: Some("z1".to_string()),
        update_interval_ms: 3_600_000,
        initial_update_delay_ms: 3_600_000,
        ping_interval_ms: 3_600_000,
        ..LbConfig::default()
    }
}

fn trip_zone(report: impl Fn(&Server), zone: &str) {
    for server in two_zones().iter().filter(|s| s.zone() == Some(zone)) {
        for _ in 0..3 {
            report(server);
        }
    }
}

#[tokio::test]
async fn test_zone_avoidance_rule_skips_tripped_zone() {
    let lb = LoadBalancer::new(
        config(RuleKind::ZoneAvoidance),
        LbParts::new(Arc::new(StaticServerList::new(two_zones()))),
    )
    .unwrap();
    lb.start().await.unwrap();
    trip_zone(
        |s| lb.report_failure(s, FailureKind::Connection, Duration::from_millis(1)),
        "z1",
    );

    for _ in 0..300 {
        assert_eq!(lb.choose_server(None).unwrap().zone(), Some("z2"));
    }
    lb.stop();
}

#[tokio::test]
async fn test_zone_aware_balancer_skips_tripped_zone() {
    let lb = ZoneAwareLoadBalancer::new(
        config(RuleKind::RoundRobin),
        LbParts::new(Arc::new(StaticServerList::new(two_zones()))),
    )
    .unwrap();
    lb.start().await.unwrap();
    trip_zone(
        |s| lb.report_failure(s, FailureKind::Throttled, Duration::from_millis(1)),
        "z1",
    );

    for _ in 0..300 {
        assert_eq!(lb.choose_server(None).unwrap().zone(), Some("z2"));
    }
    lb.stop();
}

#[tokio::test]
async fn test_zone_aware_balancer_uses_both_healthy_zones() {
    let lb = ZoneAwareLoadBalancer::new(
        config(RuleKind::RoundRobin),
        LbParts::new(Arc::new(StaticServerList::new(two_zones()))),
    )
    .unwrap();
    lb.start().await.unwrap();
    let mut z1 = 0;
    for _ in 0..1000 {
        if lb.choose_server(None).unwrap().zone() == Some("z1") {
            z1 += 1;
        }
    }
    assert!((350..=650).contains(&z1), "z1 picked {} times", z1);
    lb.stop();
}

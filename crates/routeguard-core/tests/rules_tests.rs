//! Integration tests for the rule store, classifier and ruleset loader

mod common;

use common::CountingUpstream;
use ipnet::IpNet;
use proptest::prelude::*;
use routeguard_core::config::{Config, RoutingMode};
use routeguard_core::rules::{GeoIpTable, RoutingSettings};
use routeguard_core::{RouteAction, Rule, RuleKind, RuleStore, Target};
use std::sync::Arc;
use std::thread;

fn store() -> RuleStore {
    RuleStore::new(RoutingSettings::default())
}

// ============ Ordering ============

#[test]
fn test_higher_priority_wins_over_more_specific() {
    let store = store();
    store
        .add(Rule::new("wide", RuleKind::Domain, ["example.com"], RouteAction::Block).with_priority(10))
        .unwrap();
    store
        .add(Rule::new("narrow", RuleKind::Domain, ["ads.example.com"], RouteAction::Direct).with_priority(5))
        .unwrap();

    let verdict = store.evaluate(&Target::domain("ads.example.com"));
    assert_eq!(verdict.action, RouteAction::Block);
    assert_eq!(verdict.rule_id.as_deref(), Some("wide"));
}

#[test]
fn test_specificity_among_equal_priority() {
    let store = store();
    store
        .add(Rule::new("wide", RuleKind::Domain, ["example.com"], RouteAction::Block).with_priority(5))
        .unwrap();
    store
        .add(Rule::new("narrow", RuleKind::Domain, ["ads.example.com"], RouteAction::Direct).with_priority(5))
        .unwrap();

    assert_eq!(store.evaluate(&Target::domain("ads.example.com")).action, RouteAction::Direct);
    assert_eq!(store.evaluate(&Target::domain("www.example.com")).action, RouteAction::Block);
}

#[test]
fn test_ip_rules_with_geoip() {
    let store = store();
    let net: IpNet = "203.0.113.0/24".parse().unwrap();
    store.set_geoip(GeoIpTable::from_entries([(net, "TR".to_string())]));
    store
        .add(Rule::new("tr", RuleKind::Geoip, ["TR"], RouteAction::Vpn))
        .unwrap();
    store
        .add(Rule::new("host", RuleKind::Cidr, ["203.0.113.7"], RouteAction::Direct))
        .unwrap();

    // same priority: /32 beats the country match
    assert_eq!(store.evaluate(&Target::parse("203.0.113.7")).action, RouteAction::Direct);
    assert_eq!(store.evaluate(&Target::parse("203.0.113.8")).action, RouteAction::Vpn);
    assert_eq!(store.evaluate(&Target::parse("198.51.100.1")).action, RouteAction::Direct);
    assert!(!store.evaluate(&Target::parse("198.51.100.1")).is_match());
}

#[test]
fn test_mode_switch_filters_pattern_kinds() {
    let store = store();
    store
        .add(
            Rule::new("m", RuleKind::Mixed, ["vpn.test", "10.0.0.0/8"], RouteAction::Vpn),
        )
        .unwrap();

    store.set_settings(RoutingSettings {
        mode: RoutingMode::Cidr,
        ..RoutingSettings::default()
    });
    assert_eq!(store.evaluate(&Target::domain("vpn.test")).action, RouteAction::Direct);
    assert_eq!(store.evaluate(&Target::parse("10.1.2.3")).action, RouteAction::Vpn);
}

// ============ Snapshot isolation ============

#[test]
fn test_readers_never_see_partial_updates() {
    let store = Arc::new(store());
    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 0..200 {
                let id = format!("r{i}");
                store
                    .add(Rule::new(&id, RuleKind::Domain, [format!("d{i}.test")], RouteAction::Vpn))
                    .unwrap();
                if i % 2 == 0 {
                    store.remove(&id);
                }
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..500 {
                    let snapshot = store.snapshot();
                    let first = snapshot.evaluate(&Target::domain("d199.test"));
                    let second = snapshot.evaluate(&Target::domain("d199.test"));
                    assert_eq!(first, second);
                    assert_eq!(snapshot.len(), snapshot.rules().len());
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(store.len(), 100);
}

// ============ Ruleset directory ============

#[test]
fn test_reload_skips_bad_file_and_keeps_api_rules() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("10-streaming.toml"),
        r#"
[[rules]]
id = "streaming"
kind = "domain"
patterns = ["netflix.com"]
action = "vpn"
priority = 10
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("20-broken.toml"),
        r#"
[[rules]]
kind = "cidr"
patterns = ["300.0.0.0/8"]
action = "direct"
"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let mut config = Config::default();
    config.routing.rulesets_dir = Some(dir.path().to_path_buf());
    let (engine, _tunnel) = common::engine(config, Arc::new(CountingUpstream::new()));

    assert_eq!(engine.list_rules().len(), 1);
    engine
        .add_rule(Rule::new("manual", RuleKind::Domain, ["manual.test"], RouteAction::Vpn))
        .unwrap();

    std::fs::write(
        dir.path().join("10-streaming.toml"),
        r#"
[[rules]]
id = "streaming"
kind = "domain"
patterns = ["netflix.com", "nflxvideo.net"]
action = "vpn"

[[rules]]
kind = "cidr"
patterns = ["192.0.2.0/24"]
action = "block"
"#,
    )
    .unwrap();
    let report = engine.reload_rules();
    assert_eq!(report.loaded.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.rules, 2);

    let ids: Vec<String> = engine.list_rules().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["manual", "streaming", "10-streaming:1"]);
    assert_eq!(
        engine.evaluate(&Target::domain("cdn.nflxvideo.net")).action,
        RouteAction::Vpn
    );
}

// ============ Properties ============

fn label() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,10}"
}

proptest! {
    #[test]
    fn prop_evaluate_is_deterministic(
        labels in prop::collection::vec(label(), 1..4),
        priorities in prop::collection::vec(-5i32..5, 1..6),
        query in prop::collection::vec(label(), 1..5),
    ) {
        let store = store();
        for (i, p) in priorities.iter().enumerate() {
            let pattern = labels[i % labels.len()].clone() + ".test";
            let action = if i % 2 == 0 { RouteAction::Vpn } else { RouteAction::Direct };
            store.add(Rule::new(format!("r{i}"), RuleKind::Domain, [pattern], action).with_priority(*p)).unwrap();
        }
        let target = Target::domain(&(query.join(".") + ".test"));
        let snapshot = store.snapshot();
        let first = snapshot.evaluate(&target);
        for _ in 0..3 {
            prop_assert_eq!(&snapshot.evaluate(&target), &first);
        }
        prop_assert_eq!(store.evaluate(&target), first);
    }

    #[test]
    fn prop_suffix_matches_on_label_boundary(base in label(), sub in label(), glue in label()) {
        let store = store();
        let pattern = format!("{base}.test");
        store.add(Rule::new("r", RuleKind::Domain, [pattern.clone()], RouteAction::Vpn)).unwrap();

        prop_assert!(store.evaluate(&Target::domain(&pattern)).is_match());
        let child = format!("{sub}.{pattern}");
        prop_assert!(store.evaluate(&Target::domain(&child)).is_match());
        let glued = format!("{glue}{pattern}");
        prop_assert!(!store.evaluate(&Target::domain(&glued)).is_match());
    }
}

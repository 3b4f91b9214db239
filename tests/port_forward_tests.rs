mod common;

use common::FakeFilter;
use vpn_gateway::nat::{self, Installation, RuleKind};
use vpn_gateway::store::Protocol;
use vpn_gateway::Error;

#[test]
fn add_then_remove_restores_rule_count() {
    let filter = FakeFilter::default();
    nat::setup_firewall(&filter, "10.8.0.0/24").unwrap();
    let before = filter.snapshot();

    nat::add_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp).unwrap();
    assert_eq!(filter.count(), before.len() + 3);

    let removal = nat::remove_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp, false);
    assert_eq!(removal.removed, 3);
    assert!(removal.warnings.is_empty());
    assert_eq!(filter.snapshot(), before);
}

#[test]
fn adding_twice_installs_each_rule_once() {
    let filter = FakeFilter::default();
    nat::add_port_forward(&filter, 53, "10.8.0.7", 5353, Protocol::Udp).unwrap();
    nat::add_port_forward(&filter, 53, "10.8.0.7", 5353, Protocol::Udp).unwrap();
    assert_eq!(filter.count(), 3);
    assert_eq!(
        nat::inspect_port_forward(&filter, 53, "10.8.0.7", 5353, Protocol::Udp).unwrap(),
        Installation::Installed
    );
}

#[test]
fn removal_is_idempotent_and_never_fails() {
    let filter = FakeFilter::default();
    let removal = nat::remove_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp, false);
    assert_eq!(removal.removed, 0);
    assert!(removal.warnings.is_empty());

    nat::add_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp).unwrap();
    nat::remove_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp, false);
    let again = nat::remove_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp, false);
    assert_eq!(again.removed, 0);
    assert_eq!(filter.count(), 0);
}

#[test]
fn dnat_failure_installs_nothing() {
    let filter = FakeFilter::default();
    filter.fail_append_matching("PREROUTING");
    let err = nat::add_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp).unwrap_err();
    assert!(matches!(err, Error::KernelApply(_)));
    assert_eq!(filter.count(), 0);
}

#[test]
fn later_failure_rolls_back_earlier_rules() {
    let filter = FakeFilter::default();
    filter.fail_append_matching("FORWARD");
    let err = nat::add_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp).unwrap_err();
    assert!(matches!(err, Error::KernelApply(ref msg) if msg.contains("rolled back")));
    assert_eq!(filter.count(), 0);
    assert_eq!(
        nat::inspect_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp).unwrap(),
        Installation::Pending
    );
}

#[test]
fn failed_rollback_reports_leftovers() {
    let filter = FakeFilter::default();
    filter.fail_append_matching("filter FORWARD");
    filter.fail_delete_matching("PREROUTING");
    let err = nat::add_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp).unwrap_err();
    match err {
        Error::PortForwardIncomplete { left, .. } => assert_eq!(left, vec![RuleKind::Dnat]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        nat::inspect_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp).unwrap(),
        Installation::Partial(vec![RuleKind::Dnat])
    );
}

#[test]
fn removal_collects_warnings_and_keeps_going() {
    let filter = FakeFilter::default();
    nat::add_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp).unwrap();
    filter.fail_delete_matching("POSTROUTING");
    let removal = nat::remove_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp, false);
    assert_eq!(removal.removed, 2);
    assert_eq!(removal.warnings.len(), 1);
}

#[test]
fn different_mappings_do_not_interfere() {
    let filter = FakeFilter::default();
    nat::add_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp).unwrap();
    nat::add_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Udp).unwrap();
    nat::remove_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp, false);
    assert_eq!(filter.count(), 3);
    assert_eq!(
        nat::inspect_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Udp).unwrap(),
        Installation::Installed
    );
}

#[test]
fn firewall_baseline_is_idempotent() {
    let filter = FakeFilter::default();
    nat::setup_firewall(&filter, "10.8.0.0/24").unwrap();
    nat::setup_firewall(&filter, "10.8.0.0/24").unwrap();
    assert_eq!(filter.count(), 1);
    assert!(*filter.forwarding.lock().unwrap());
}

#[test]
fn shared_target_rules_survive_removal_of_one_mapping() {
    let filter = FakeFilter::default();
    nat::add_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp).unwrap();
    nat::add_port_forward(&filter, 9090, "10.8.0.5", 80, Protocol::Tcp).unwrap();
    assert_eq!(filter.count(), 4);

    let removal = nat::remove_port_forward(&filter, 9090, "10.8.0.5", 80, Protocol::Tcp, true);
    assert_eq!(removal.removed, 1);
    assert_eq!(filter.count(), 3);
    assert_eq!(
        nat::inspect_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp).unwrap(),
        Installation::Installed
    );

    nat::remove_port_forward(&filter, 8080, "10.8.0.5", 80, Protocol::Tcp, false);
    assert_eq!(filter.count(), 0);
}

//! Binary Star failover behaviour, end to end through a replica core

use telestar::common::audit::AuditLog;
use telestar::common::{Error, NodeConfig, NodeRole};
use telestar::node::fsm::{Event, FailoverCoordinator, FatalCondition, State};
use telestar::node::replication::{LocalOnly, ReplicationStore};
use telestar::NodeCore;
use tempfile::TempDir;

const HB: u64 = 1000;

fn core(dir: &TempDir, role: NodeRole) -> NodeCore {
    let mut config = NodeConfig::for_role(role);
    config.data_dir = dir.path().to_path_buf();
    config.heartbeat_interval_ms = HB;
    let store = ReplicationStore::open(dir.path(), Box::new(LocalOnly)).unwrap();
    NodeCore::new(&config, store, AuditLog::disabled())
}

#[test]
fn test_pair_settles_into_active_passive() {
    let primary_dir = TempDir::new().unwrap();
    let backup_dir = TempDir::new().unwrap();
    let mut primary = core(&primary_dir, NodeRole::Primary);
    let mut backup = core(&backup_dir, NodeRole::Backup);

    // primary hears the backup first
    primary.on_peer_state(backup.state(), 0).unwrap();
    assert_eq!(primary.state(), State::Active);

    backup.on_peer_state(primary.state(), 0).unwrap();
    assert_eq!(backup.state(), State::Passive);

    // steady state heartbeats change nothing
    for t in 1..5 {
        primary.on_peer_state(backup.state(), t * HB).unwrap();
        backup.on_peer_state(primary.state(), t * HB).unwrap();
    }
    assert_eq!(primary.state(), State::Active);
    assert_eq!(backup.state(), State::Passive);
}

#[test]
fn test_passive_refuses_while_peer_alive() {
    let dir = TempDir::new().unwrap();
    let mut backup = core(&dir, NodeRole::Backup);
    backup.on_peer_state(State::Active, 10_000).unwrap();

    let frames = backup
        .on_client_line("1,0,Speed,80,100", 10_000 + 2 * HB)
        .unwrap();
    assert!(frames.is_empty());
    assert_eq!(backup.state(), State::Passive);
    assert_eq!(backup.metrics().rejected_requests.get(), 1);
}

#[test]
fn test_passive_takes_over_after_expiry() {
    let dir = TempDir::new().unwrap();
    let mut backup = core(&dir, NodeRole::Backup);
    backup.on_peer_state(State::Active, 10_000).unwrap();

    let frames = backup
        .on_client_line("1,0,Speed,80,100", 10_000 + 2 * HB + 1)
        .unwrap();
    assert_eq!(backup.state(), State::Active);
    assert_eq!(frames.len(), 2);
}

#[test]
fn test_split_brain_halts_both_sides() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    let mut a = core(&a_dir, NodeRole::Primary);
    let mut b = core(&b_dir, NodeRole::Backup);

    a.on_peer_state(State::Backup, 0).unwrap();
    b.on_peer_state(State::Active, 0).unwrap();

    // the network partitions and b promotes itself on client traffic
    b.on_client_line("1,0,Speed,80,100", 5 * HB).unwrap();
    assert_eq!(b.state(), State::Active);

    // the partition heals: each side sees an active peer
    let err = a.on_peer_state(State::Active, 6 * HB).unwrap_err();
    assert!(matches!(err, Error::Fatal(FatalCondition::DualActive)));
    let err = b.on_peer_state(State::Active, 6 * HB).unwrap_err();
    assert!(err.is_fatal());

    // a halted core refuses everything after the fatal condition
    assert!(a.on_client_line("1,1,Speed,80,101", 7 * HB).is_err());
    assert!(a.on_peer_state(State::Passive, 7 * HB).is_err());
}

#[test]
fn test_dual_passive_is_fatal() {
    let mut fsm = FailoverCoordinator::new(NodeRole::Backup, HB);
    fsm.handle(Event::PeerActive, 0).unwrap();
    assert_eq!(
        fsm.handle(Event::PeerPassive, 1).unwrap_err(),
        FatalCondition::DualPassive
    );
    assert_eq!(fsm.halted(), Some(FatalCondition::DualPassive));
}

#[test]
fn test_client_requests_do_not_extend_expiry() {
    let mut fsm = FailoverCoordinator::new(NodeRole::Backup, HB);
    fsm.handle(Event::PeerActive, 0).unwrap();
    let expiry = fsm.peer_expiry();

    let outcome = fsm.handle(Event::ClientRequest, expiry).unwrap();
    assert!(!outcome.serve);
    assert_eq!(fsm.peer_expiry(), expiry);

    let outcome = fsm.handle(Event::ClientRequest, expiry + 1).unwrap();
    assert!(outcome.serve);
    assert!(outcome.took_over());
}

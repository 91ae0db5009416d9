use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tiered_buffer::{
    QueueDescriptor, RejectPolicy, SpillPolicy, StatsRegistry, Tier, TierChain, TierKind,
};

const SEGMENT_SIZE: u64 = 4096;

fn points(count: usize) -> Vec<String> {
    (0..count).map(|idx| format!("p{idx:03}")).collect()
}

/// Exact payload size of `count` four-byte points joined by newlines.
fn budget_for(count: usize) -> u64 {
    (count * 4 + count.saturating_sub(1)) as u64
}

fn open_spill() -> SpillPolicy {
    SpillPolicy {
        max_disk_usage_percent: 100.0,
        max_bytes: None,
        scan_interval: Duration::from_secs(60),
    }
}

fn chain(dir: &std::path::Path, memory_budget: u64) -> TierChain {
    let stats = Arc::new(StatsRegistry::new());
    let memory = Tier::memory("memory", 0, RejectPolicy::new(memory_budget), Arc::clone(&stats));
    let disk = Tier::disk("disk", 1, dir, open_spill(), SEGMENT_SIZE, Arc::clone(&stats))
        .expect("disk tier");
    let chain = TierChain::new(vec![Arc::new(memory), Arc::new(disk)], stats).expect("chain");
    chain.start().expect("start");
    chain
        .register_queue(&QueueDescriptor::new("points", 1))
        .expect("register");
    chain
}

#[test]
fn batch_within_budget_stays_in_first_tier() {
    let dir = tempdir().expect("tempdir");
    let k = 5;
    let chain = chain(dir.path(), budget_for(k));

    let landed = chain.send_points("points", "w", &points(k)[..]).expect("send");
    assert_eq!(landed, 0);
    assert_eq!(chain.tiers()[0].usage("points").points, k as u64);
    assert_eq!(chain.tiers()[1].usage("points").records, 0);
    assert_eq!(chain.stats().get("points").queued_full.get(), 0);
}

#[test]
fn oversized_batch_lands_entirely_in_second_tier() {
    let dir = tempdir().expect("tempdir");
    let k = 5;
    let chain = chain(dir.path(), budget_for(k));

    let landed = chain.send_points("points", "w", &points(k + 1)[..]).expect("send");
    assert_eq!(landed, 1);
    assert_eq!(chain.tiers()[0].usage("points").records, 0);
    let disk = chain.tiers()[1].usage("points");
    assert_eq!(disk.records, 1);
    assert_eq!(disk.points, (k + 1) as u64);
    assert_eq!(chain.stats().get("points").queued_full.get(), 1);
    assert_eq!(chain.tiers()[1].kind(), TierKind::Durable);
}

#[test]
fn saturated_chain_surfaces_capacity_exceeded() {
    let dir = tempdir().expect("tempdir");
    let stats = Arc::new(StatsRegistry::new());
    let memory = Tier::memory("memory", 0, RejectPolicy::new(4), Arc::clone(&stats));
    let disk = Tier::disk(
        "disk",
        1,
        dir.path(),
        SpillPolicy {
            max_bytes: Some(SEGMENT_SIZE),
            ..open_spill()
        },
        SEGMENT_SIZE,
        Arc::clone(&stats),
    )
    .expect("disk tier");
    let chain = TierChain::new(vec![Arc::new(memory), Arc::new(disk)], stats).expect("chain");
    chain.start().expect("start");
    chain
        .register_queue(&QueueDescriptor::new("points", 1))
        .expect("register");

    let line = "x".repeat(1500);
    let mut last_err = None;
    for _ in 0..10 {
        if let Err(err) = chain.send_points("points", "w", &[line.as_str()]) {
            last_err = Some(err);
            break;
        }
    }
    let err = last_err.expect("disk tier filled up");
    assert!(err.is_capacity_exceeded());
    assert!(chain.tiers()[1].is_full(None));
    let overflowed = chain.stats().get("points").queued_full.get();
    assert_eq!(overflowed, chain.tiers()[1].usage("points").records);
}

#[test]
fn disk_full_rejects_before_touching_the_store() {
    let dir = tempdir().expect("tempdir");
    let tier = Tier::disk(
        "disk",
        1,
        dir.path(),
        SpillPolicy {
            max_bytes: Some(0),
            ..open_spill()
        },
        SEGMENT_SIZE,
        Arc::new(StatsRegistry::new()),
    )
    .expect("disk tier");
    tier.start().expect("start");
    tier.register_queue(&QueueDescriptor::new("points", 1))
        .expect("register");
    let before = tier.disk_usage().expect("disk usage").used_bytes;

    assert!(tier.store().is_disk_full());
    let err = tier.accept("points", "w", &["cpu 1"]).expect_err("disk full");
    assert!(err.is_capacity_exceeded());
    assert_eq!(tier.usage("points").records, 0);
    assert_eq!(tier.disk_usage().expect("disk usage").used_bytes, before);
    assert!(tier.sessions().is_empty());
}

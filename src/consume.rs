//! Batch consume protocol: receive, admit, deliver, then commit or roll back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::FailurePolicy;
use crate::session::ConsumerSession;
use crate::store::Delivery;
use crate::throttle::ThrottledLog;
use crate::tier::Tier;
use crate::{Error, Result};

/// Rate limiting consulted once per received record.
///
/// `try_acquire` must not block and must not consume budget when it
/// returns false.
pub trait AdmissionControl {
    fn try_acquire(&self, count: usize) -> bool;
}

impl<F> AdmissionControl for F
where
    F: Fn(usize) -> bool,
{
    fn try_acquire(&self, count: usize) -> bool {
        self(count)
    }
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl AdmissionControl for Unlimited {
    fn try_acquire(&self, _count: usize) -> bool {
        true
    }
}

/// Downstream destination for drained point lines. Called at most once per cycle.
pub trait BatchSink {
    fn deliver(&mut self, batch: &[String]) -> anyhow::Result<()>;
}

impl<F> BatchSink for F
where
    F: FnMut(&[String]) -> anyhow::Result<()>,
{
    fn deliver(&mut self, batch: &[String]) -> anyhow::Result<()> {
        self(batch)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Records committed this cycle.
    pub records: usize,
    /// Point lines handed to the sink.
    pub points: usize,
    /// Admission control rejected a record and cut the cycle short.
    pub rate_limited: bool,
    pub elapsed: Duration,
}

struct Cycle<'a> {
    tier: &'a Tier,
    queue: &'a str,
    max_batch_size: usize,
}

impl Cycle<'_> {
    /// Steps 1-6: fill the batch, deliver it, settle the session.
    fn run(
        &self,
        session: &mut ConsumerSession,
        admission: &dyn AdmissionControl,
        sink: &mut dyn BatchSink,
    ) -> Result<DrainReport> {
        let drain = self.tier.drain_config();
        let stats = self.tier.stats().get(self.queue);
        let started = Instant::now();
        let budget = drain.batch_budget();
        let poll = drain.poll_timeout();

        session.start()?;
        let mut batch: Vec<String> = Vec::new();
        let mut admitted: Vec<Delivery> = Vec::new();
        let mut rate_limited = false;

        while batch.len() < self.max_batch_size {
            let elapsed = started.elapsed();
            if elapsed >= budget {
                break;
            }
            let Some(delivery) = session.receive(poll.min(budget - elapsed))? else {
                break;
            };
            let lines = delivery.record.points();
            if lines.is_empty() {
                self.tier.throttle().warn(&format!("empty.{}", self.queue), || {
                    format!("queue '{}' delivered a record with no points", self.queue)
                });
            }
            if !admission.try_acquire(lines.len()) {
                rate_limited = true;
                stats.rate_limited.inc();
                self.tier.throttle().info(&format!("rate.{}", self.queue), || {
                    format!("rate limit reached on queue '{}'", self.queue)
                });
                break;
            }
            batch.extend(lines);
            admitted.push(delivery);
        }

        let delivered = if batch.is_empty() {
            Ok(())
        } else {
            sink.deliver(&batch)
        };

        if let Err(err) = delivered {
            stats.delivery_failed.inc();
            self.settle_failure(session, &admitted)?;
            return Err(Error::DeliveryFailure {
                queue: self.queue.to_string(),
                reason: format!("{err:#}"),
            });
        }

        for delivery in &admitted {
            session.acknowledge(delivery.tag);
        }
        if let Err(err) = session.commit() {
            stats.delivery_failed.inc();
            if err.is_session_fault() {
                return Err(err);
            }
            if let Err(rollback_err) = session.rollback() {
                log::warn!(
                    "queue '{}': rollback after failed commit: {}",
                    self.queue,
                    rollback_err
                );
            }
            return Err(Error::DeliveryFailure {
                queue: self.queue.to_string(),
                reason: err.to_string(),
            });
        }
        // Returns the record admission control refused, if any.
        session.rollback()?;

        let now = self.tier.clock().now_ms();
        for delivery in &admitted {
            self.tier
                .record_queue_time(self.queue, now.saturating_sub(delivery.record.enqueued_ms()));
        }
        stats.delivered.add(admitted.len() as u64);
        stats.delivered_points.add(batch.len() as u64);

        Ok(DrainReport {
            records: admitted.len(),
            points: batch.len(),
            rate_limited,
            elapsed: started.elapsed(),
        })
    }

    fn settle_failure(&self, session: &mut ConsumerSession, admitted: &[Delivery]) -> Result<()> {
        match self.tier.drain_config().failure_policy {
            FailurePolicy::Redeliver => session.rollback(),
            FailurePolicy::Discard => {
                for delivery in admitted {
                    session.acknowledge(delivery.tag);
                }
                session.commit()?;
                session.rollback()?;
                log::error!(
                    "queue '{}': sink failed, discarded {} records",
                    self.queue,
                    admitted.len()
                );
                Ok(())
            }
        }
    }
}

/// One drain cycle against a partition. Session faults close and evict the
/// consumer before they are returned; its held records go back to the
/// partition for the next cycle.
pub(crate) fn drain_cycle(
    tier: &Tier,
    queue: &str,
    partition: usize,
    worker: &str,
    max_batch_size: usize,
    admission: &dyn AdmissionControl,
    sink: &mut dyn BatchSink,
) -> Result<DrainReport> {
    tier.ensure_running()?;
    let descriptor = tier
        .descriptor(queue)
        .ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;
    if partition >= descriptor.partition_count {
        return Err(Error::UnknownPartition {
            queue: queue.to_string(),
            partition,
        });
    }

    let handle = tier.sessions().consumer(queue, partition, worker)?;
    let fault = |err: Error| {
        tier.stats().get(queue).session_faults.inc();
        log::warn!("tier '{}': {}; evicting consumer", tier.name(), err);
        tier.sessions().evict_consumer(handle.key());
        err
    };

    let mut session = match handle.lock() {
        Ok(session) => session,
        Err(err) => return Err(fault(err)),
    };
    let cycle = Cycle {
        tier,
        queue,
        max_batch_size,
    };
    let outcome = cycle.run(&mut session, admission, sink);
    let stopped = if session.is_closed() { Ok(()) } else { session.stop() };
    drop(session);

    match (outcome, stopped) {
        (Err(err), _) if err.is_session_fault() => Err(fault(err)),
        (_, Err(err)) if err.is_session_fault() => Err(fault(err)),
        (outcome, _) => outcome,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainTarget {
    pub queue: String,
    pub partition: usize,
}

impl DrainTarget {
    pub fn new(queue: impl Into<String>, partition: usize) -> Self {
        Self {
            queue: queue.into(),
            partition,
        }
    }

    /// Every partition of every queue registered on `tier`.
    pub fn all(tier: &Tier) -> Vec<DrainTarget> {
        tier.queue_names()
            .into_iter()
            .filter_map(|queue| tier.descriptor(&queue))
            .flat_map(|descriptor| {
                (0..descriptor.partition_count)
                    .map(move |partition| DrainTarget::new(descriptor.name.clone(), partition))
            })
            .collect()
    }
}

pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(50);

/// A background thread running drain cycles over a fixed set of partitions.
pub struct DrainWorker {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DrainWorker {
    pub fn spawn<A, S>(
        name: impl Into<String>,
        tier: Arc<Tier>,
        targets: Vec<DrainTarget>,
        max_batch_size: usize,
        admission: A,
        mut sink: S,
    ) -> Result<Self>
    where
        A: AdmissionControl + Send + 'static,
        S: BatchSink + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker = name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("drain-{name}"))
            .spawn(move || {
                let throttle = ThrottledLog::default();
                while !worker_stop.load(Ordering::Acquire) {
                    let mut delivered = 0;
                    for target in &targets {
                        if worker_stop.load(Ordering::Acquire) {
                            break;
                        }
                        match tier.drain_batch(
                            &target.queue,
                            target.partition,
                            &worker,
                            max_batch_size,
                            &admission,
                            &mut sink,
                        ) {
                            Ok(report) => delivered += report.records,
                            Err(err) if err.is_tier_closed() => {
                                log::info!("drain worker '{}' exiting: {}", worker, err);
                                return;
                            }
                            Err(err) => {
                                let key = format!("{}.{}", target.queue, target.partition);
                                throttle.warn(&key, || {
                                    format!(
                                        "drain worker '{}' on {}.{}: {}",
                                        worker, target.queue, target.partition, err
                                    )
                                })
                            }
                        }
                    }
                    if delivered == 0 {
                        std::thread::sleep(DEFAULT_IDLE_SLEEP);
                    }
                }
            })
            .map_err(crate::core::Error::from)?;
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the worker and waits for its current cycle to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("drain worker '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for DrainWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StatsRegistry;
    use crate::store::RejectPolicy;
    use crate::tier::QueueDescriptor;
    use std::sync::Mutex;

    fn tier() -> Tier {
        let stats = Arc::new(StatsRegistry::new());
        let tier = Tier::memory("memory", 0, RejectPolicy::new(1 << 20), stats);
        tier.start().expect("start");
        tier.register_queue(&QueueDescriptor::new("points", 1)).expect("register");
        tier
    }

    #[test]
    fn closure_admission_and_sink() {
        let admission = |count: usize| count < 3;
        assert!(admission.try_acquire(2));
        assert!(!admission.try_acquire(3));
        assert!(Unlimited.try_acquire(usize::MAX));

        let mut seen = Vec::new();
        let mut sink = |batch: &[String]| -> anyhow::Result<()> {
            seen.extend_from_slice(batch);
            Ok(())
        };
        sink.deliver(&["a".to_string()]).expect("deliver");
        assert_eq!(seen, vec!["a".to_string()]);
    }

    #[test]
    fn batch_size_bounds_the_cycle() {
        let tier = tier();
        for idx in 0..5 {
            tier.accept("points", "w", &[format!("p{idx}")]).expect("accept");
        }
        let mut sink = |_: &[String]| -> anyhow::Result<()> { Ok(()) };
        let report = tier
            .drain_batch("points", 0, "drain", 2, &Unlimited, &mut sink)
            .expect("drain");
        assert_eq!(report.records, 2);
        assert_eq!(tier.usage("points").records, 3);
    }

    #[test]
    fn empty_records_are_committed() {
        let tier = tier();
        tier.accept::<&str>("points", "w", &[]).expect("accept");
        let mut calls = 0;
        let mut sink = |_: &[String]| -> anyhow::Result<()> {
            calls += 1;
            Ok(())
        };
        let report = tier
            .drain_batch("points", 0, "drain", 10, &Unlimited, &mut sink)
            .expect("drain");
        assert_eq!(report.records, 1);
        assert_eq!(report.points, 0);
        assert_eq!(calls, 0);
        assert_eq!(tier.usage("points").records, 0);
    }

    #[test]
    fn unknown_partition_is_rejected() {
        let tier = tier();
        let mut sink = |_: &[String]| -> anyhow::Result<()> { Ok(()) };
        let err = tier
            .drain_batch("points", 4, "drain", 10, &Unlimited, &mut sink)
            .expect_err("partition");
        assert!(matches!(err, Error::UnknownPartition { .. }));
    }

    #[test]
    fn worker_drains_until_stopped() {
        let tier = Arc::new(tier());
        for idx in 0..10 {
            tier.accept("points", "w", &[format!("p{idx}")]).expect("accept");
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let worker = DrainWorker::spawn(
            "test",
            Arc::clone(&tier),
            DrainTarget::all(&tier),
            4,
            Unlimited,
            move |batch: &[String]| -> anyhow::Result<()> {
                sink_seen.lock().expect("lock").extend_from_slice(batch);
                Ok(())
            },
        )
        .expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().expect("lock").len() < 10 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        worker.stop();
        let seen = seen.lock().expect("lock").clone();
        let expected: Vec<String> = (0..10).map(|idx| format!("p{idx}")).collect();
        assert_eq!(seen, expected);
        assert_eq!(tier.usage("points").records, 0);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::items_after_statements)] // Test helpers

//! End-to-end work-pulling scenarios: demand-driven routing over a dynamic
//! worker pool, buffering through total worker loss, rehoming of in-flight
//! messages, and the driver + registry integration.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;

use convoy::config::{DeliveryConfig, WorkPullingConfig};
use convoy::delivery::{Ack, ConsumerEndpoint, ConsumerOp, Request, SeqNr, SequencedMessage};
use convoy::runtime::WorkPullingDriver;
use convoy::work_pulling::{
    ServiceKey, StaticRegistry, WorkPullingRouter, WorkerEndpoint, WorkerStats,
};

#[derive(Clone, Default)]
struct Recording {
    sent: Arc<Mutex<Vec<SequencedMessage<String>>>>,
}

impl Recording {
    fn new() -> Self {
        Self::default()
    }

    fn payloads(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|m| m.payload.clone()).collect()
    }

    fn seqs(&self) -> Vec<SeqNr> {
        self.sent.lock().unwrap().iter().map(|m| m.seq_nr).collect()
    }

    fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl ConsumerEndpoint<String> for Recording {
    fn deliver(&self, msg: SequencedMessage<String>) {
        self.sent.lock().unwrap().push(msg);
    }
}

fn worker(id: &str) -> (WorkerEndpoint<String>, Recording) {
    let recording = Recording::new();
    (
        WorkerEndpoint {
            id: id.into(),
            endpoint: Arc::new(recording.clone()),
        },
        recording,
    )
}

/// Total worker loss: submissions accumulate up to `buffer_size`, demand is
/// withheld past it, and a late worker drains the backlog in order.
#[test]
fn total_worker_loss_buffers_and_recovers() {
    let config = WorkPullingConfig {
        buffer_size: 3,
        ..Default::default()
    };
    let mut router = WorkPullingRouter::new("wpr-1", config);
    let (producer_tx, producer_rx) = unbounded();
    router.on_start(Box::new(producer_tx));

    for n in 1..=3 {
        producer_rx.try_recv().expect("grant while buffer has room");
        router.on_msg(format!("job-{n}")).expect("submit");
    }
    assert_eq!(router.buffered_len(), 3);
    assert!(
        producer_rx.try_recv().is_err(),
        "full buffer backpressures the producer"
    );

    // A worker arrives: bootstrap demand takes the backlog head, its
    // Requests pull the rest, and producer demand resumes.
    let (w1, sink) = worker("w-1");
    router.on_workers_updated(vec![w1]).expect("snapshot");
    assert_eq!(sink.payloads(), vec!["job-1".to_string()]);
    assert!(producer_rx.try_recv().is_ok(), "grants resume below capacity");

    router
        .on_worker_op("w-1", ConsumerOp::Request(Request::new(1, 100, true, false)))
        .expect("request");
    assert_eq!(
        sink.payloads(),
        vec!["job-1".to_string(), "job-2".to_string(), "job-3".to_string()]
    );
    assert_eq!(sink.seqs(), vec![1, 2, 3], "one gapless stream per worker");
    assert_eq!(router.buffered_len(), 0);
}

/// Worker loss mid-stream: unconfirmed messages are rehomed and every job
/// still reaches the surviving worker at least once.
#[test]
fn worker_loss_rehomes_to_surviving_worker() {
    let mut router = WorkPullingRouter::new("wpr-1", WorkPullingConfig::default());
    let (producer_tx, _producer_rx) = unbounded();
    router.on_start(Box::new(producer_tx));

    let (w1, sink1) = worker("w-1");
    let (w2, sink2) = worker("w-2");
    router.on_workers_updated(vec![w1, w2.clone()]).expect("snapshot");

    // Give w-1 a wide demand window; w-2 only holds its bootstrap grant.
    router
        .on_worker_op("w-1", ConsumerOp::Request(Request::new(0, 100, true, false)))
        .expect("request");
    router.on_msg("job-1".into()).expect("submit");
    router.on_msg("job-2".into()).expect("submit");
    router.on_msg("job-3".into()).expect("submit");

    let (to_w1, to_w2) = (sink1.len(), sink2.len());
    assert_eq!(to_w1 + to_w2, 3, "all three dispatched");

    // w-1 confirms nothing and vanishes; its messages must come back out of
    // the surviving worker, in their original relative order.
    router.on_workers_updated(vec![w2]).expect("snapshot without w-1");
    router
        .on_worker_op("w-2", ConsumerOp::Request(Request::new(0, 100, true, false)))
        .expect("request");

    let mut observed: Vec<String> = sink2.payloads();
    observed.sort();
    observed.dedup();
    assert_eq!(
        observed,
        vec!["job-1".to_string(), "job-2".to_string(), "job-3".to_string()],
        "every job reaches the surviving worker at least once"
    );
    assert_eq!(router.worker_stats(), WorkerStats { worker_count: 1 });
}

/// Confirmation-variant submissions reply exactly once, with the sequence
/// number assigned by whichever worker finally confirmed the message.
#[test]
fn confirmation_fires_after_rehoming() {
    let mut router = WorkPullingRouter::new("wpr-1", WorkPullingConfig::default());
    let (producer_tx, _producer_rx) = unbounded();
    router.on_start(Box::new(producer_tx));

    let (w1, sink1) = worker("w-1");
    router.on_workers_updated(vec![w1]).expect("snapshot");

    let (reply_tx, reply_rx) = unbounded();
    router
        .on_msg_with_confirmation("job-1".into(), reply_tx)
        .expect("submit");
    assert_eq!(sink1.len(), 1);
    assert!(reply_rx.try_recv().is_err(), "not confirmed at dispatch");

    // w-1 dies before confirming; the replacement worker processes the
    // rehomed copy and the reply carries the new worker's sequence number.
    router.on_workers_updated(Vec::new()).expect("worker lost");
    let (w2, _sink2) = worker("w-2");
    router.on_workers_updated(vec![w2]).expect("snapshot");
    router
        .on_worker_op("w-2", ConsumerOp::Ack(Ack::new(1)))
        .expect("ack");

    assert_eq!(reply_rx.try_iter().collect::<Vec<_>>(), vec![1]);
}

/// Driver + registry integration: workers appear through discovery polling,
/// jobs flow, stats answer, and a deregistered worker's traffic rehomes.
#[test]
fn driver_with_registry_end_to_end() {
    let config = WorkPullingConfig {
        buffer_size: 16,
        registry_poll_interval_ms: 20,
        delivery: DeliveryConfig {
            resend_first_interval_ms: 50,
            ..Default::default()
        },
    };
    let registry = StaticRegistry::new();
    let key = ServiceKey::new("pool");
    let driver = WorkPullingDriver::spawn_with_registry(
        "wpr-1",
        config,
        Box::new(registry.clone()),
        key.clone(),
    );
    let handle = driver.handle();

    let (producer_tx, producer_rx) = unbounded();
    handle.start(Box::new(producer_tx));
    producer_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("initial grant");

    let (w1, sink1) = worker("w-1");
    registry.register(&key, w1);

    let deadline = Instant::now() + Duration::from_secs(2);
    while handle.worker_stats().map(|s| s.worker_count) != Some(1) {
        assert!(Instant::now() < deadline, "worker never discovered");
        thread::sleep(Duration::from_millis(10));
    }

    handle.send("job-1".to_string());
    let deadline = Instant::now() + Duration::from_secs(2);
    while sink1.len() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(sink1.payloads(), vec!["job-1".to_string()]);

    // The worker's consumer side answers through its reply address.
    handle
        .worker_ref("w-1")
        .request(Request::new(1, 10, true, false));

    // Worker drops out of discovery; a replacement receives later traffic.
    registry.deregister(&key, "w-1");
    let (w2, sink2) = worker("w-2");
    registry.register(&key, w2);

    // Give the 20 ms poller ample time to observe the swapped membership.
    thread::sleep(Duration::from_millis(500));
    assert_eq!(handle.worker_stats(), Some(WorkerStats { worker_count: 1 }));

    handle.send("job-2".to_string());
    let deadline = Instant::now() + Duration::from_secs(2);
    while sink2.len() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(sink2.payloads(), vec!["job-2".to_string()]);
    assert!(handle.is_running());
}

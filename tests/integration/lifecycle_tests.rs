//! End-to-end exporter lifecycle tests

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use taskmon_exporter::event::{ChannelSource, RawEvent, TcpJsonSource};
use taskmon_exporter::metrics::CounterKind;
use taskmon_exporter::store::{FileStore, MemoryStore};
use taskmon_exporter::Phase;

use crate::common::{exporter_with, memory_exporter, parse_exposition, settings, stored};

async fn wait_for_received(exporter: &taskmon_exporter::Exporter, expected: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while exporter.state().snapshot().counter(CounterKind::Received) < expected {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("events applied");
}

#[tokio::test]
async fn test_counters_match_event_counts() {
    let (exporter, store) = memory_exporter(Duration::from_secs(60)).await;
    let (tx, source) = ChannelSource::channel(256);
    exporter.start(source).unwrap();

    for i in 0..30 {
        let id = format!("task-{i}");
        tx.send(RawEvent::new("task-received", &id).with_name("tasks.add"))
            .await
            .unwrap();
        let outcome = if i % 3 == 0 { "task-failed" } else { "task-succeeded" };
        tx.send(RawEvent::new(outcome, &id).with_runtime(0.2)).await.unwrap();
    }
    tx.send(RawEvent::new("task-revoked", "task-x")).await.unwrap();
    tx.send(RawEvent::new("task-received", "task-last")).await.unwrap();

    wait_for_received(&exporter, 31).await;
    exporter.stop().await;

    let samples = stored(&store);
    assert_eq!(samples["celery_task_received_total"], 31.0);
    assert_eq!(samples["celery_task_succeeded_total"], 20.0);
    assert_eq!(samples["celery_task_failed_total"], 10.0);
}

#[tokio::test]
async fn test_runtime_histogram_totals() {
    let (exporter, store) = memory_exporter(Duration::from_secs(60)).await;
    let (tx, source) = ChannelSource::channel(64);
    exporter.start(source).unwrap();

    for (i, runtime) in [0.004, 0.3, 2.0, 12.0].into_iter().enumerate() {
        let id = format!("t{i}");
        tx.send(RawEvent::new("task-received", &id).with_name("tasks.mul"))
            .await
            .unwrap();
        tx.send(RawEvent::new("task-succeeded", &id).with_runtime(runtime))
            .await
            .unwrap();
    }
    tx.send(RawEvent::new("task-received", "done")).await.unwrap();

    wait_for_received(&exporter, 5).await;
    exporter.stop().await;

    let samples = stored(&store);
    let series = |suffix: &str, extra: &str| {
        samples[&format!(
            "celery_task_runtime_seconds_{suffix}{{task_name=\"tasks.mul\",state=\"success\"{extra}}}"
        )]
    };

    assert_eq!(series("count", ""), 4.0);
    assert!((series("sum", "") - 14.304).abs() < 1e-9);
    assert_eq!(series("bucket", ",le=\"0.005\""), 1.0);
    assert_eq!(series("bucket", ",le=\"0.5\""), 2.0);
    assert_eq!(series("bucket", ",le=\"2.5\""), 3.0);
    assert_eq!(series("bucket", ",le=\"10.0\""), 3.0);
    assert_eq!(series("bucket", ",le=\"+Inf\""), 4.0);
}

#[tokio::test(start_paused = true)]
async fn test_burst_costs_one_write() {
    let store = Arc::new(MemoryStore::new());
    let exporter = exporter_with(
        store.clone(),
        settings(Duration::from_millis(500), Duration::from_millis(100)),
    )
    .await;
    assert_eq!(store.write_count(), 1);

    let (tx, source) = ChannelSource::channel(2048);
    exporter.start(source).unwrap();

    for i in 0..1000 {
        tx.send(RawEvent::new("task-received", format!("b{i}"))).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(650)).await;
    assert_eq!(store.write_count(), 2);
    assert_eq!(stored(&store)["celery_task_received_total"], 1000.0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(store.write_count(), 2);

    exporter.stop().await;
    assert_eq!(store.write_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshots_are_self_consistent() {
    let store = Arc::new(MemoryStore::new());
    let exporter = exporter_with(
        store.clone(),
        settings(Duration::from_millis(5), Duration::from_millis(1)),
    )
    .await;
    let (tx, source) = ChannelSource::channel(1024);
    exporter.start(source).unwrap();

    let producer = tokio::spawn(async move {
        for i in 0..5000 {
            let event = RawEvent::new("task-succeeded", format!("c{i}"))
                .with_name("tasks.even")
                .with_runtime(1.0);
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });

    let count_key = "celery_task_runtime_seconds_count{task_name=\"tasks.even\",state=\"success\"}";
    let sum_key = "celery_task_runtime_seconds_sum{task_name=\"tasks.even\",state=\"success\"}";
    let inf_key =
        "celery_task_runtime_seconds_bucket{task_name=\"tasks.even\",state=\"success\",le=\"+Inf\"}";

    let mut last_count = 0.0;
    while !producer.is_finished() {
        if let Some(blob) = store.current() {
            let samples = parse_exposition(std::str::from_utf8(&blob).unwrap());
            if let Some(&count) = samples.get(count_key) {
                assert_eq!(samples[sum_key], count);
                assert_eq!(samples[inf_key], count);
                assert!(count >= last_count);
                last_count = count;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    producer.await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while exporter.state().snapshot().counter(CounterKind::Succeeded) < 5000 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("events applied");
    exporter.stop().await;
    assert_eq!(stored(&store)[count_key], 5000.0);
}

#[tokio::test]
async fn test_stop_persists_events_from_tcp_feed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.prom");
    let store = Arc::new(FileStore::new(&path));
    let exporter = exporter_with(
        store,
        settings(Duration::from_secs(60), Duration::from_millis(10)),
    )
    .await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let feed = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket
            .write_all(
                b"{\"type\":\"task-received\",\"uuid\":\"f1\",\"name\":\"tasks.io\"}\n\
                  {\"type\":\"task-succeeded\",\"uuid\":\"f1\",\"runtime\":0.05}\n",
            )
            .await
            .unwrap();
        // Keep the connection open until the test is done.
        socket
    });

    exporter
        .start(TcpJsonSource::new(addr.to_string(), Duration::from_secs(1)))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while exporter.state().snapshot().counter(CounterKind::Succeeded) < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("event applied");

    exporter.stop().await;
    assert_eq!(exporter.phase(), Phase::Stopped);

    let text = std::fs::read_to_string(&path).unwrap();
    let samples = parse_exposition(&text);
    assert_eq!(samples["celery_task_received_total"], 1.0);
    assert_eq!(samples["celery_task_succeeded_total"], 1.0);
    assert_eq!(
        samples["celery_task_runtime_seconds_count{task_name=\"tasks.io\",state=\"success\"}"],
        1.0
    );

    drop(feed.await.unwrap());
}

async fn submit_then_stop(events: u64) {
    let (exporter, store) = memory_exporter(Duration::from_secs(60)).await;
    let (tx, source) = ChannelSource::channel(64);
    exporter.start(source).unwrap();

    for i in 0..events {
        tx.send(RawEvent::new("task-received", format!("d{i}"))).await.unwrap();
    }
    exporter.stop().await;

    assert_eq!(stored(&store)["celery_task_received_total"], events as f64);
    assert!(!exporter.state().is_dirty());
}

#[tokio::test]
async fn test_stop_right_after_submit_keeps_the_event() {
    submit_then_stop(1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_right_after_submit_keeps_events_multi_thread() {
    for round in 0..50 {
        submit_then_stop(1 + round % 5).await;
    }
}

#[tokio::test]
async fn test_stop_twice() {
    let (exporter, store) = memory_exporter(Duration::from_secs(60)).await;
    let (tx, source) = ChannelSource::channel(8);
    exporter.start(source).unwrap();
    tx.send(RawEvent::new("task-received", "s1")).await.unwrap();

    exporter.stop().await;
    assert_eq!(stored(&store)["celery_task_received_total"], 1.0);
    let writes = store.write_count();
    exporter.stop().await;

    assert_eq!(exporter.phase(), Phase::Stopped);
    assert_eq!(store.write_count(), writes);
    assert!(exporter.start(ChannelSource::channel(1).1).is_err());
}

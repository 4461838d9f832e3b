mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{FakeRemote, Step, eventually, quiet_config};
use memsync_queue::{
    DrainOutcome, InMemoryQueueStore, Metadata, QueueEntry, QueueProcessor, QueueStore,
    WriteFailure, WriteQueue,
};

const ENTRIES: usize = 60;

async fn seed(store: &InMemoryQueueStore) -> Vec<QueueEntry> {
    let mut entries = Vec::with_capacity(ENTRIES);
    for i in 0..ENTRIES {
        let entry = QueueEntry::new(format!("e{i}").into_bytes(), Metadata::new(), chrono::Utc::now());
        store.insert(entry.clone()).await.unwrap();
        entries.push(entry);
    }
    entries
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_processors_never_send_an_entry_twice() {
    let store = Arc::new(InMemoryQueueStore::new());
    let remote = FakeRemote::slow(Duration::from_millis(1));
    let entries = seed(&store).await;

    // Separate processors share only the store, so its claim is the sole guard.
    let processors: Vec<Arc<QueueProcessor>> = (0..4)
        .map(|_| {
            Arc::new(QueueProcessor::new(store.clone(), remote.clone()).with_batch_size(16))
        })
        .collect();

    let mut tasks = Vec::new();
    for processor in &processors {
        for _ in 0..3 {
            let processor = processor.clone();
            tasks.push(tokio::spawn(async move { processor.drain().await }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }
    for processor in &processors {
        processor.drain().await;
    }

    assert_eq!(remote.overlaps(), 0);
    let calls = remote.calls();
    let delivered: HashSet<_> = calls.iter().map(|c| c.entry_id).collect();
    assert_eq!(calls.len(), ENTRIES, "every entry written exactly once");
    let expected: HashSet<_> = entries.iter().map(|e| e.id).collect();
    assert_eq!(delivered, expected);
    assert_eq!(store.count().await.unwrap().total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_drains_on_one_processor_coalesce() {
    let store = Arc::new(InMemoryQueueStore::new());
    let remote = FakeRemote::slow(Duration::from_millis(2));
    seed(&store).await;
    let processor = Arc::new(QueueProcessor::new(store.clone(), remote.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let processor = processor.clone();
            tokio::spawn(async move { processor.drain().await })
        })
        .collect();

    let mut completed = 0;
    for handle in handles {
        if let DrainOutcome::Completed(_) = handle.await.unwrap() {
            completed += 1;
        }
    }

    assert!(completed >= 1);
    assert_eq!(remote.overlaps(), 0);
    assert_eq!(remote.calls().len(), ENTRIES);
    let stats = processor.stats();
    assert_eq!(stats.succeeded, ENTRIES as u64);
    assert_eq!(stats.drains + stats.coalesced, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enqueue_returns_quickly_while_the_remote_is_slow() {
    let remote = FakeRemote::slow(Duration::from_secs(2));
    let queue = WriteQueue::builder(Arc::new(InMemoryQueueStore::new()), remote.clone())
        .config(quiet_config())
        .build()
        .unwrap();
    queue.start().await.unwrap();

    for i in 0..5 {
        let started = Instant::now();
        queue
            .enqueue(format!("m{i}").into_bytes(), Metadata::new())
            .await
            .unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(50),
            "enqueue took {:?}",
            started.elapsed()
        );
    }

    assert_eq!(queue.stats().await.unwrap().pending_count, 5);
    queue.shutdown().await;
}

#[tokio::test]
async fn enqueue_succeeds_during_an_outage() {
    let outage = (0..20).map(|_| Step::Fail(WriteFailure::network("unreachable")));
    let remote = FakeRemote::scripted(outage);
    let queue = WriteQueue::builder(Arc::new(InMemoryQueueStore::new()), remote.clone())
        .config(quiet_config())
        .build()
        .unwrap();

    let started = Instant::now();
    let id = queue.enqueue(b"note".to_vec(), Metadata::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));

    let (q, r) = (&queue, &*remote);
    eventually(|| async move { !r.calls().is_empty() }).await;
    eventually(|| async move {
        q.get(id)
            .await
            .unwrap()
            .is_some_and(|e| e.attempt_count == 1)
    })
    .await;
}

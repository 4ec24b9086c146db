//! Integration tests for the observer
//!
//! Most tests drive the observer through `ManualEventSource`, which delivers raw
//! batches from its own thread like a native facility would. The notify tests
//! use temporary directories and real filesystem operations.

use fsobserver_core::{FlagSet, ObserverConfig, ResumePoint, StreamConfig, SubscriptionError};
use fsobserver_watcher::testing::ManualEventSource;
use fsobserver_watcher::{EventRecord, Observer, ObserverState, RawEvent};
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manual_observer() -> (ManualEventSource, Observer<ManualEventSource>) {
    init_test_logging();
    let source = ManualEventSource::new();
    let observer = Observer::with_source(source.clone(), ObserverConfig::default()).unwrap();
    (source, observer)
}

fn recording_callback(observer: &Observer<ManualEventSource>) -> Arc<Mutex<Vec<EventRecord>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    observer.set_callback(move |record| sink.lock().unwrap().push(record.clone()));
    seen
}

#[tokio::test]
async fn test_end_to_end_created_file() {
    let (source, observer) = manual_observer();
    let seen = recording_callback(&observer);
    let mut stream = observer.subscribe();
    let mut sequence = observer.event_sequence().unwrap();

    observer.start(["/tmp/watched"]).unwrap();
    assert_eq!(observer.state(), ObserverState::Running);

    assert!(source.emit(vec![RawEvent::new(
        "/tmp/watched/a.txt",
        FlagSet::ITEM_CREATED | FlagSet::ITEM_IS_FILE,
        1,
    )]));

    let callback_records = seen.lock().unwrap().clone();
    assert_eq!(callback_records.len(), 1);
    let record = &callback_records[0];
    assert_eq!(record.path(), Path::new("/tmp/watched/a.txt"));
    assert_eq!(record.flags().decode(), vec!["itemCreated", "itemIsFile"]);
    assert_eq!(record.id(), 1);

    let broadcast = timeout(Duration::from_secs(1), stream.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&broadcast, record);

    let pulled = timeout(Duration::from_secs(1), sequence.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&pulled, record);
    assert_eq!(observer.last_event_id(), Some(1));
}

#[tokio::test]
async fn test_fan_out_exactly_once() {
    let (source, observer) = manual_observer();
    let seen = recording_callback(&observer);
    let mut first = observer.subscribe();
    let mut second = observer.subscribe();

    observer.start(["/tmp/watched"]).unwrap();
    source.emit(vec![RawEvent::new(
        "/tmp/watched/b",
        FlagSet::ITEM_MODIFIED | FlagSet::ITEM_IS_FILE,
        5,
    )]);

    let expected = seen.lock().unwrap().clone();
    assert_eq!(expected.len(), 1);
    assert_eq!(first.recv().await.as_ref(), expected.first());
    assert_eq!(second.recv().await.as_ref(), expected.first());
    assert!(first.try_recv().is_none());
    assert!(second.try_recv().is_none());
    assert_eq!(observer.stats().broadcast_subscribers, 2);
}

#[tokio::test]
async fn test_batch_order_reaches_consumers_intact() {
    let (source, observer) = manual_observer();
    let mut stream = observer.subscribe();
    observer.start(["/w"]).unwrap();

    source.emit(vec![
        RawEvent::new("/w/c", FlagSet::ITEM_CREATED, 30),
        RawEvent::new("/w/a", FlagSet::ITEM_REMOVED, 31),
        RawEvent::new("/w/b", FlagSet::ITEM_RENAMED, 32),
    ]);
    source.emit(vec![RawEvent::new("/w/d", FlagSet::ITEM_MODIFIED, 40)]);

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(stream.recv().await.unwrap().id());
    }
    assert_eq!(ids, vec![30, 31, 32, 40]);
    assert_eq!(observer.stats().batches_received, 2);
}

#[test]
fn test_stop_is_idempotent() {
    let (source, observer) = manual_observer();
    observer.stop();
    assert_eq!(observer.state(), ObserverState::Idle);
    observer.stop();
    assert_eq!(observer.state(), ObserverState::Idle);

    observer.start(["/tmp/watched"]).unwrap();
    observer.stop();
    observer.stop();
    assert_eq!(observer.state(), ObserverState::Idle);
    assert_eq!(source.active_count(), 0);
    assert!(!source.emit(vec![RawEvent::new("/tmp/watched/x", 0u32, 1)]));
}

#[test]
fn test_implicit_restart_keeps_one_subscription() {
    let (source, observer) = manual_observer();
    let seen = recording_callback(&observer);

    observer.start(["/paths/a"]).unwrap();
    observer.start(["/paths/b"]).unwrap();

    assert_eq!(observer.state(), ObserverState::Running);
    assert_eq!(source.active_count(), 1);
    let subscriptions = source.subscriptions();
    assert_eq!(subscriptions.len(), 2);
    assert!(!subscriptions[0].active);
    assert_eq!(subscriptions[1].paths, vec![PathBuf::from("/paths/b")]);
    assert_eq!(observer.watched_paths(), vec![PathBuf::from("/paths/b")]);

    // A late batch from the first subscription is dropped
    assert!(source.emit_to(0, vec![RawEvent::new("/paths/a/x", FlagSet::ITEM_CREATED, 9)]));
    assert!(seen.lock().unwrap().is_empty());

    source.emit(vec![RawEvent::new("/paths/b/y", FlagSet::ITEM_CREATED, 1)]);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path(), Path::new("/paths/b/y"));
}

#[tokio::test]
async fn test_pull_sequence_ends_on_stop() {
    let (source, observer) = manual_observer();
    let observer = Arc::new(observer);
    let mut sequence = observer.event_sequence().unwrap();
    assert!(observer.event_sequence().is_none());

    observer.start(["/tmp/watched"]).unwrap();
    source.emit(vec![RawEvent::new("/tmp/watched/a", FlagSet::ITEM_CREATED, 1)]);

    let stopper = Arc::clone(&observer);
    let stop_task = tokio::task::spawn_blocking(move || {
        std::thread::sleep(Duration::from_millis(50));
        stopper.stop();
    });

    assert_eq!(sequence.recv().await.map(|r| r.id()), Some(1));
    let end = timeout(Duration::from_secs(2), sequence.recv())
        .await
        .expect("consumer hung after stop");
    assert_eq!(end, None);
    assert!(sequence.is_closed());
    stop_task.await.unwrap();

    // Not restartable
    observer.start(["/tmp/watched"]).unwrap();
    source.emit(vec![RawEvent::new("/tmp/watched/b", FlagSet::ITEM_CREATED, 2)]);
    assert_eq!(sequence.recv().await, None);
}

#[test]
fn test_stop_waits_for_in_flight_batch() {
    let (source, observer) = manual_observer();
    let (started_tx, started_rx) = mpsc::channel();
    let started_tx = Mutex::new(started_tx);
    let calls = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&calls);
    observer.set_callback(move |_| {
        *counter.lock().unwrap() += 1;
        let _ = started_tx.lock().unwrap().send(());
        std::thread::sleep(Duration::from_millis(100));
    });
    observer.start(["/w"]).unwrap();

    let emitter = {
        let source = source.clone();
        std::thread::spawn(move || {
            source.emit(vec![
                RawEvent::new("/w/1", FlagSet::ITEM_CREATED, 1),
                RawEvent::new("/w/2", FlagSet::ITEM_CREATED, 2),
                RawEvent::new("/w/3", FlagSet::ITEM_CREATED, 3),
            ])
        })
    };

    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    observer.stop();

    // Nothing reaches a channel once stop has returned
    let after_stop = *calls.lock().unwrap();
    assert!(emitter.join().unwrap());
    assert_eq!(*calls.lock().unwrap(), after_stop);
    assert_eq!(after_stop, 1);

    let stats = observer.stats();
    assert_eq!(stats.events_dispatched, 1);
    assert_eq!(stats.events_dropped, 2);
}

#[tokio::test]
async fn test_panicking_callback_does_not_starve_other_channels() {
    let (source, observer) = manual_observer();
    observer.set_callback(|record| {
        if record.id() == 1 {
            panic!("consumer bug");
        }
    });
    let mut stream = observer.subscribe();
    observer.start(["/w"]).unwrap();

    source.emit(vec![
        RawEvent::new("/w/a", FlagSet::ITEM_CREATED, 1),
        RawEvent::new("/w/b", FlagSet::ITEM_CREATED, 2),
    ]);

    assert_eq!(stream.recv().await.map(|r| r.id()), Some(1));
    assert_eq!(stream.recv().await.map(|r| r.id()), Some(2));
    assert_eq!(observer.stats().callback_faults, 1);
    assert_eq!(observer.state(), ObserverState::Running);
}

#[test]
fn test_resume_point_reaches_native_source() {
    let (source, observer) = manual_observer();
    observer.start(["/w"]).unwrap();
    source.emit(vec![RawEvent::new("/w/a", FlagSet::ITEM_MODIFIED, 77)]);
    observer.stop();

    let resume = ResumePoint::After(observer.last_event_id().unwrap());
    observer
        .start_with(["/w"], StreamConfig::builder().resume_from(resume).build())
        .unwrap();

    let subscriptions = source.subscriptions();
    assert_eq!(subscriptions[0].config.resume_from, ResumePoint::Now);
    assert_eq!(subscriptions[1].config.resume_from, ResumePoint::After(77));
    assert!(subscriptions[1].config.watch_root);
    assert!(subscriptions[1].config.file_level_events);
}

#[test]
fn test_subscription_failure_is_reported() {
    let (source, observer) = manual_observer();
    observer.start(["/w"]).unwrap();

    source.fail_next_subscribe(SubscriptionError::ResourceExhausted("no watches left".into()));
    let err = observer.start(["/w2"]).unwrap_err();

    assert!(matches!(
        err.as_subscription(),
        Some(SubscriptionError::ResourceExhausted(_))
    ));
    // The previous subscription was torn down before the failed attempt
    assert_eq!(observer.state(), ObserverState::Idle);
    assert_eq!(source.active_count(), 0);
}

#[test]
fn test_unknown_flag_bits_are_delivered() {
    let (source, observer) = manual_observer();
    let seen = recording_callback(&observer);
    observer.start(["/w"]).unwrap();

    source.emit(vec![RawEvent::new("/w/a", 0x8000_0100u32, 3)]);

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen[0].flags().decode(),
        vec!["itemCreated", "unknown(raw: 2147483648)"]
    );
}

async fn wait_for<F>(stream: &mut fsobserver_watcher::EventStream, mut matches: F) -> EventRecord
where
    F: FnMut(&EventRecord) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let record = stream.recv().await.expect("stream ended");
            if matches(&record) {
                return record;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_notify_file_creation_detected() {
    init_test_logging();
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().canonicalize().unwrap();

    let observer = Observer::new(ObserverConfig::default()).unwrap();
    let mut stream = observer.subscribe();
    observer.start([root.clone()]).unwrap();
    assert!(observer.is_watching(&root));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let file = root.join("a.txt");
    tokio::fs::write(&file, "hello").await.unwrap();

    let record = wait_for(&mut stream, |r| {
        r.path() == file && r.flags().contains(FlagSet::ITEM_CREATED)
    })
    .await;
    assert!(record.is_file());
    assert!(record.id() >= 1);

    observer.stop();
    assert_eq!(observer.state(), ObserverState::Idle);
}

#[tokio::test]
async fn test_notify_file_removal_detected() {
    init_test_logging();
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().canonicalize().unwrap();
    let file = root.join("doomed.txt");
    tokio::fs::write(&file, "bye").await.unwrap();

    let observer = Observer::new(ObserverConfig::default()).unwrap();
    let mut stream = observer.subscribe();
    observer.start([root.clone()]).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    tokio::fs::remove_file(&file).await.unwrap();

    wait_for(&mut stream, |r| {
        r.path() == file && r.flags().contains(FlagSet::ITEM_REMOVED)
    })
    .await;
}

#[test]
fn test_notify_missing_path_fails_start() {
    init_test_logging();
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("does-not-exist");

    let observer = Observer::new(ObserverConfig::default()).unwrap();
    let err = observer.start([missing]).unwrap_err();

    assert!(matches!(
        err.as_subscription(),
        Some(SubscriptionError::PathNotFound(_))
    ));
    assert_eq!(observer.state(), ObserverState::Idle);
    assert!(observer.watched_paths().is_empty());
}

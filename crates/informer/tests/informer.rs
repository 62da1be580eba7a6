#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use mirra_core::{Error, ListWatch, Selector, Status, WatchEvent};
use mirra_informer::testing::FakeListWatch;
use mirra_informer::{
    notification_channel, CancellationToken, HandlerFuncs, InformerConfig, Notification, OverflowPolicy,
    SharedInformer, ShutdownPolicy,
};
use mirra_store::namespace_indexers;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

fn cm(name: &str, rv: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn tag(o: &ConfigMap) -> String {
    format!(
        "{}@{}",
        o.metadata.name.as_deref().unwrap_or_default(),
        o.metadata.resource_version.as_deref().unwrap_or_default()
    )
}

fn describe(n: &Notification<ConfigMap>) -> String {
    match n {
        Notification::Add { obj, initial: true } => format!("add {} initial", tag(obj)),
        Notification::Add { obj, initial: false } => format!("add {}", tag(obj)),
        Notification::Update { old, new } => format!("update {} -> {}", tag(old), tag(new)),
        Notification::Delete(obj) => format!("delete {}", obj.metadata.name.as_deref().unwrap_or_default()),
    }
}

async fn next(rx: &mut UnboundedReceiver<Notification<ConfigMap>>) -> String {
    let n = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("handler channel closed");
    describe(&n)
}

async fn take(rx: &mut UnboundedReceiver<Notification<ConfigMap>>, count: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(next(rx).await);
    }
    out
}

async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..300 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {}", what);
}

fn test_config() -> InformerConfig {
    let mut cfg = InformerConfig::default().with_backoff(Duration::from_millis(5), Duration::from_millis(20));
    cfg.sync_poll_interval = Duration::from_millis(5);
    cfg
}

fn informer(fake: &Arc<FakeListWatch<ConfigMap>>, cfg: InformerConfig) -> Arc<SharedInformer<ConfigMap>> {
    let lw: Arc<dyn ListWatch<ConfigMap>> = fake.clone();
    Arc::new(SharedInformer::new(lw, cfg, namespace_indexers()))
}

fn run(inf: &Arc<SharedInformer<ConfigMap>>) -> (CancellationToken, JoinHandle<mirra_core::Result<()>>) {
    let stop = CancellationToken::new();
    let task = {
        let inf = Arc::clone(inf);
        let stop = stop.clone();
        tokio::spawn(async move { inf.run(stop).await })
    };
    (stop, task)
}

fn names(inf: &SharedInformer<ConfigMap>) -> Vec<String> {
    let mut out: Vec<String> = inf.lister().list(&Selector::everything()).iter().map(|o| tag(o)).collect();
    out.sort();
    out
}

/// Handler that stalls its loop for `delay` on every callback.
fn slow_handler(delay: Duration, seen: Arc<AtomicUsize>) -> HandlerFuncs<ConfigMap> {
    let s = Arc::clone(&seen);
    HandlerFuncs::new("slow")
        .with_add(move |_, _| {
            std::thread::sleep(delay);
            s.fetch_add(1, Ordering::SeqCst);
        })
        .with_update(move |_, _| {
            std::thread::sleep(delay);
            seen.fetch_add(1, Ordering::SeqCst);
        })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_sees_list_then_watch_changes() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list(vec![cm("a", "1"), cm("b", "1")], "10");
    fake.push_watch(vec![WatchEvent::Modified(cm("a", "2")), WatchEvent::Deleted(cm("b", "3"))]);
    let inf = informer(&fake, test_config());
    let (handler, mut rx) = notification_channel("recorder");
    let reg = inf.add_event_handler(handler).await.unwrap();
    assert!(!inf.has_synced());

    let (stop, task) = run(&inf);
    assert!(inf.wait_for_cache_sync(&stop).await);
    assert!(reg.has_synced());

    assert_eq!(take(&mut rx, 4).await, vec!["add a@1 initial", "add b@1 initial", "update a@1 -> a@2", "delete b"]);
    assert_eq!(names(&inf), vec!["a@2"]);
    assert_eq!(inf.last_sync_resource_version(), "3");

    stop.cancel();
    task.await.unwrap().unwrap();
    assert!(inf.is_stopped());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_cursor_relist_is_diffed_against_store() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list(vec![cm("a", "1"), cm("b", "1")], "10");
    fake.push_watch(vec![
        WatchEvent::Modified(cm("a", "2")),
        WatchEvent::Deleted(cm("b", "3")),
        WatchEvent::Error(Status { code: 410, reason: "Expired".into(), message: "too old".into() }),
    ]);
    fake.push_list(vec![cm("a", "3"), cm("c", "1")], "20");
    let inf = informer(&fake, test_config());
    let (handler, mut rx) = notification_channel("recorder");
    inf.add_event_handler(handler).await.unwrap();
    let (stop, task) = run(&inf);

    assert_eq!(
        take(&mut rx, 6).await,
        vec!["add a@1 initial", "add b@1 initial", "update a@1 -> a@2", "delete b", "update a@2 -> a@3", "add c@1"]
    );
    eventually("relisted", || names(&inf) == vec!["a@3", "c@1"]).await;
    assert_eq!(fake.list_calls()[1].resource_version, "");

    // nothing else is pending: no duplicate add for a, no second delete for b
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relist_deletes_vanished_objects_once() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list(vec![cm("a", "1"), cm("b", "1")], "10");
    fake.push_watch_error(Error::Transport("connection refused".into()));
    fake.push_list(vec![cm("a", "1")], "11");
    let inf = informer(&fake, test_config());
    let (handler, mut rx) = notification_channel("recorder");
    inf.add_event_handler(handler).await.unwrap();
    let (stop, task) = run(&inf);

    assert_eq!(
        take(&mut rx, 4).await,
        vec!["add a@1 initial", "add b@1 initial", "delete b", "update a@1 -> a@1"]
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "b is deleted exactly once");

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resync_redelivers_cached_objects() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list(vec![cm("a", "1"), cm("b", "1")], "10");
    let inf = informer(&fake, test_config().with_resync(Duration::from_millis(40)));
    let (handler, mut rx) = notification_channel("recorder");
    inf.add_event_handler(handler).await.unwrap();
    let (stop, task) = run(&inf);

    take(&mut rx, 2).await;
    let mut resyncs = 0;
    for _ in 0..4 {
        let n = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(n.is_resync(), "unexpected {}", describe(&n));
        resyncs += 1;
    }
    assert_eq!(resyncs, 4);

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_resync_period_never_resyncs() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list(vec![cm("a", "1")], "10");
    let inf = informer(&fake, test_config().with_resync(Duration::ZERO));
    let (handler, mut rx) = notification_channel("recorder");
    inf.add_event_handler(handler).await.unwrap();
    let (stop, task) = run(&inf);

    assert_eq!(take(&mut rx, 1).await, vec!["add a@1 initial"]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_handler_gets_replay_before_live_events() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list(vec![cm("a", "1"), cm("b", "1")], "10");
    let live = fake.push_live_watch();
    let inf = informer(&fake, test_config());
    let (stop, task) = run(&inf);
    assert!(inf.wait_for_cache_sync(&stop).await, "no handlers: synced once the store is");

    live.unbounded_send(Ok(WatchEvent::Added(cm("c", "11")))).unwrap();
    eventually("c stored", || names(&inf).len() == 3).await;

    let (handler, mut rx) = notification_channel("late");
    let reg = inf.add_event_handler(handler).await.unwrap();
    live.unbounded_send(Ok(WatchEvent::Modified(cm("a", "12")))).unwrap();

    let mut replay = take(&mut rx, 3).await;
    replay.sort();
    assert_eq!(replay, vec!["add a@1 initial", "add b@1 initial", "add c@11 initial"]);
    assert_eq!(next(&mut rx).await, "update a@1 -> a@12");
    eventually("late handler synced", || reg.has_synced()).await;
    assert!(inf.has_synced());

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removed_handler_stops_receiving() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list(vec![cm("a", "1")], "10");
    let live = fake.push_live_watch();
    let inf = informer(&fake, test_config());
    let (keep, mut keep_rx) = notification_channel("keep");
    let (gone, mut gone_rx) = notification_channel("gone");
    inf.add_event_handler(keep).await.unwrap();
    let reg = inf.add_event_handler(gone).await.unwrap();
    let (stop, task) = run(&inf);
    assert!(inf.wait_for_cache_sync(&stop).await);
    take(&mut keep_rx, 1).await;
    take(&mut gone_rx, 1).await;

    assert!(inf.remove_event_handler(&reg).await);
    assert!(!inf.remove_event_handler(&reg).await);
    live.unbounded_send(Ok(WatchEvent::Added(cm("b", "11")))).unwrap();

    assert_eq!(next(&mut keep_rx).await, "add b@11");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(gone_rx.try_recv().is_err());

    stop.cancel();
    task.await.unwrap().unwrap();
}

fn adds(count: usize) -> Vec<WatchEvent<ConfigMap>> {
    (0..count).map(|i| WatchEvent::Added(cm(&format!("o{}", i), &(11 + i).to_string()))).collect()
}

#[tokio::test]
async fn large_initial_list_syncs_under_default_bound() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    let cfg = test_config();
    let total = cfg.queue_capacity * 2 + 1;
    fake.push_list((0..total).map(|i| cm(&format!("o{}", i), "1")).collect(), "10");
    let inf = informer(&fake, cfg);
    let seen = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&seen);
    let reg = inf
        .add_event_handler(HandlerFuncs::new("counter").with_add(move |_, _| {
            s.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();
    let (stop, task) = run(&inf);

    assert!(inf.wait_for_cache_sync(&stop).await);
    assert!(reg.has_synced());
    assert_eq!(seen.load(Ordering::SeqCst), total);
    assert_eq!(reg.dropped(), 0);

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fail_policy_stops_informer_on_overflow() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list(vec![], "10");
    fake.push_watch(adds(5));
    let inf = informer(&fake, test_config().with_queue(1, OverflowPolicy::Fail));
    let seen = Arc::new(AtomicUsize::new(0));
    inf.add_event_handler(slow_handler(Duration::from_millis(100), Arc::clone(&seen))).await.unwrap();
    let (_stop, task) = run(&inf);

    let outcome = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(Error::QueueOverflow { capacity: 1, .. })), "got {:?}", outcome);
    assert!(inf.is_stopped());
    assert!(seen.load(Ordering::SeqCst) < 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drop_oldest_policy_counts_losses() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list(vec![], "10");
    fake.push_watch(adds(20));
    let inf = informer(&fake, test_config().with_queue(2, OverflowPolicy::DropOldest));
    let seen = Arc::new(AtomicUsize::new(0));
    let reg = inf.add_event_handler(slow_handler(Duration::from_millis(20), Arc::clone(&seen))).await.unwrap();
    let (stop, task) = run(&inf);

    assert!(inf.wait_for_cache_sync(&stop).await);
    eventually("watch applied", || names(&inf).len() == 20).await;
    eventually("queue settled", || seen.load(Ordering::SeqCst) as u64 + reg.dropped() == 20).await;
    assert!(reg.dropped() > 0);
    assert_eq!(names(&inf).len(), 20, "the store itself never drops");

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn block_policy_delivers_everything() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list(vec![], "10");
    fake.push_watch(adds(10));
    let inf = informer(&fake, test_config().with_queue(1, OverflowPolicy::Block));
    let seen = Arc::new(AtomicUsize::new(0));
    let reg = inf.add_event_handler(slow_handler(Duration::from_millis(5), Arc::clone(&seen))).await.unwrap();
    let (stop, task) = run(&inf);

    assert!(inf.wait_for_cache_sync(&stop).await);
    eventually("all delivered", || seen.load(Ordering::SeqCst) == 10).await;
    assert_eq!(reg.dropped(), 0);

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_interrupts_blocked_resync() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list((0..40).map(|i| cm(&format!("o{}", i), "1")).collect(), "10");
    let cfg = test_config()
        .with_queue(1, OverflowPolicy::Block)
        .with_resync(Duration::from_millis(30))
        .with_shutdown_policy(ShutdownPolicy::Discard);
    let inf = informer(&fake, cfg);
    let seen = Arc::new(AtomicUsize::new(0));
    inf.add_event_handler(slow_handler(Duration::from_millis(50), Arc::clone(&seen))).await.unwrap();
    let (stop, task) = run(&inf);

    eventually("watching", || !fake.watch_calls().is_empty()).await;
    // first resync is now parked behind a full queue
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled = std::time::Instant::now();
    stop.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.expect("run outlived stop").unwrap().unwrap();
    assert!(cancelled.elapsed() < Duration::from_secs(1));
    assert!(seen.load(Ordering::SeqCst) < 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_policy_decides_pending_notifications() {
    for (policy, expect_all) in [(ShutdownPolicy::Drain, true), (ShutdownPolicy::Discard, false)] {
        let fake = Arc::new(FakeListWatch::new("configmaps"));
        fake.push_list((0..10).map(|i| cm(&format!("o{}", i), "1")).collect(), "10");
        let inf = informer(&fake, test_config().with_shutdown_policy(policy));
        let seen = Arc::new(AtomicUsize::new(0));
        inf.add_event_handler(slow_handler(Duration::from_millis(30), Arc::clone(&seen))).await.unwrap();
        let (stop, task) = run(&inf);

        eventually("store listed", || names(&inf).len() == 10).await;
        stop.cancel();
        task.await.unwrap().unwrap();
        let delivered = seen.load(Ordering::SeqCst);
        if expect_all {
            assert_eq!(delivered, 10, "{:?}", policy);
        } else {
            assert!(delivered < 10, "{:?} delivered {}", policy, delivered);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lifecycle_is_single_use() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list(vec![cm("a", "1")], "10");
    let inf = informer(&fake, test_config());
    let (stop, task) = run(&inf);
    assert!(inf.wait_for_cache_sync(&stop).await);

    assert!(matches!(inf.run(CancellationToken::new()).await, Err(Error::AlreadyStarted)));
    assert!(matches!(inf.add_indexers(namespace_indexers()), Err(Error::IndexersAfterStart)));

    stop.cancel();
    task.await.unwrap().unwrap();
    assert!(matches!(inf.run(CancellationToken::new()).await, Err(Error::Stopped)));
    let (handler, _rx) = notification_channel("too-late");
    assert!(matches!(inf.add_event_handler(handler).await, Err(Error::Stopped)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_for_cache_sync_gives_up_on_stop() {
    let fake = Arc::new(FakeListWatch::new("configmaps"));
    fake.push_list_error(Error::Transport("unreachable".into()));
    let inf = informer(&fake, test_config().with_backoff(Duration::from_secs(5), Duration::from_secs(5)));
    let (stop, task) = run(&inf);

    let waiter = {
        let inf = Arc::clone(&inf);
        let stop = stop.clone();
        tokio::spawn(async move { inf.wait_for_cache_sync(&stop).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.cancel();
    assert!(!waiter.await.unwrap());
    task.await.unwrap().unwrap();
}

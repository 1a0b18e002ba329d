use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use refzip::{HolderId, Host, Lifetime, Strong, Weak};

// Probes the kernel's lifecycle callbacks from multiple threads. The host
// only holds atomics, so its handles are Send + Sync.

struct Probe {
    first_refs: AtomicUsize,
    last_strongs: AtomicUsize,
    drops: Arc<AtomicUsize>,
    grant_all: bool,
}

impl Probe {
    fn new(drops: Arc<AtomicUsize>, grant_all: bool) -> Probe {
        Probe {
            first_refs: AtomicUsize::new(0),
            last_strongs: AtomicUsize::new(0),
            drops,
            grant_all,
        }
    }
}

impl Host for Probe {
    fn on_first_ref(&self) {
        self.first_refs.fetch_add(1, Ordering::SeqCst);
    }
    fn on_last_strong_ref(&self, _id: HolderId) {
        self.last_strongs.fetch_add(1, Ordering::SeqCst);
    }
    fn on_inc_strong_attempted(&self, first_attempt: bool, _id: HolderId) -> bool {
        self.grant_all || first_attempt
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn concurrent_first_promotion_fires_one_first_ref() {
    let drops = Arc::new(AtomicUsize::new(0));
    let weak = Weak::new(Probe::new(drops.clone(), false));

    let mut workers = Vec::new();
    for _ in 0..8 {
        let w = weak.clone();
        workers.push(thread::spawn(move || w.promote()));
    }
    let promoted: Vec<_> = workers
        .into_iter()
        .filter_map(|t| t.join().unwrap())
        .collect();

    assert!(!promoted.is_empty());
    assert_eq!(promoted[0].first_refs.load(Ordering::SeqCst), 1);

    drop(promoted);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    drop(weak);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_clone_drop_destroys_host_once() {
    let drops = Arc::new(AtomicUsize::new(0));
    let strong = Strong::new(Probe::new(drops.clone(), false));

    let mut workers = Vec::new();
    for _ in 0..8 {
        let s = strong.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..1000 {
                let extra = s.clone();
                drop(extra);
            }
        }));
    }
    for t in workers {
        t.join().unwrap();
    }

    assert_eq!(strong.first_refs.load(Ordering::SeqCst), 1);
    assert_eq!(strong.last_strongs.load(Ordering::SeqCst), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(strong);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn one_last_strong_ref_per_zero_crossing() {
    let drops = Arc::new(AtomicUsize::new(0));
    let strong = Strong::new(Probe::new(drops.clone(), true));
    strong.extend_lifetime(Lifetime::Weak);
    let weak = strong.downgrade();
    drop(strong);

    // The grant-all policy lets the strong count cross zero repeatedly.
    for crossing in 2..=5 {
        let revived = weak.promote().expect("policy grants re-promotion");
        assert_eq!(revived.last_strongs.load(Ordering::SeqCst), crossing - 1);
        drop(revived);
    }

    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(weak);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn weak_governed_host_observable_after_last_strong() {
    let drops = Arc::new(AtomicUsize::new(0));
    let strong = Strong::new(Probe::new(drops.clone(), true));
    strong.extend_lifetime(Lifetime::Weak);
    let weak = strong.downgrade();
    drop(strong);

    assert_eq!(drops.load(Ordering::SeqCst), 0);
    let revived = weak.promote().expect("host still alive");
    assert_eq!(revived.last_strongs.load(Ordering::SeqCst), 1);
    drop(revived);
    drop(weak);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

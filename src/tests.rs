//! Cross-module propagation tests: glitch-freedom, coalescing, ordering.
use crate::{
    AsyncError, AsyncValue, Effect, LocalRuntime, async_computed, batch, computed, effect, signal,
};
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn diamond_runs_the_join_exactly_once() {
    // a -> b, a -> c, (b, c) -> d: one change to a must evaluate d once
    let a = signal(1);

    let b_runs = Arc::new(AtomicUsize::new(0));
    let c_runs = Arc::new(AtomicUsize::new(0));
    let d_runs = Arc::new(AtomicUsize::new(0));

    let a2 = a.clone();
    let br = b_runs.clone();
    let b = computed(move |_| {
        br.fetch_add(1, Ordering::Relaxed);
        a2.get() + 1
    });

    let a3 = a.clone();
    let cr = c_runs.clone();
    let c = computed(move |_| {
        cr.fetch_add(1, Ordering::Relaxed);
        a3.get() * 10
    });

    let dr = d_runs.clone();
    let b2 = b.clone();
    let c2 = c.clone();
    let d = computed(move |_| {
        dr.fetch_add(1, Ordering::Relaxed);
        b2.get() + c2.get()
    });

    let d2 = d.clone();
    let _observer = effect(move || {
        d2.get();
    });

    assert_eq!(d_runs.load(Ordering::Relaxed), 1);

    a.set(2);
    assert_eq!(b_runs.load(Ordering::Relaxed), 2);
    assert_eq!(c_runs.load(Ordering::Relaxed), 2);
    assert_eq!(d_runs.load(Ordering::Relaxed), 2);
    assert_eq!(d.get(), 23);
}

#[test]
fn effect_log_follows_writes_and_skips_equal_values() {
    // a = 1; b = a * 2; effect logs b
    let a = signal(1);
    let log = Arc::new(Mutex::new(Vec::new()));

    let a2 = a.clone();
    let b = computed(move |_| a2.get() * 2);

    let b2 = b.clone();
    let log2 = log.clone();
    let _logger = effect(move || {
        log2.lock().push(b2.get());
    });

    assert_eq!(*log.lock(), vec![2]);

    a.set(5);
    assert_eq!(*log.lock(), vec![2, 10]);

    // Same value again: nothing happens
    a.set(5);
    assert_eq!(*log.lock(), vec![2, 10]);
}

#[test]
fn stopped_effect_never_runs_again() {
    let s = signal(0);
    let log = Arc::new(Mutex::new(Vec::new()));

    let s2 = s.clone();
    let log2 = log.clone();
    let eff = effect(move || {
        log2.lock().push(s2.get());
    });

    eff.stop();
    s.set(1);

    assert_eq!(*log.lock(), vec![0]);
    assert!(!s.has_subscribers());
}

#[test]
fn lazy_branches_subscribe_only_what_they_read() {
    let cond = signal(true);
    let a = signal("a1".to_string());
    let b = signal("b1".to_string());
    let runs = Arc::new(AtomicUsize::new(0));

    let cond2 = cond.clone();
    let a2 = a.clone();
    let b2 = b.clone();
    let runs2 = runs.clone();
    let picked = computed(move |_| {
        runs2.fetch_add(1, Ordering::Relaxed);
        if cond2.get() { a2.get() } else { b2.get() }
    });

    let picked2 = picked.clone();
    let _observer = effect(move || {
        picked2.get();
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    // The untaken branch is not subscribed
    b.set("b2".to_string());
    assert_eq!(runs.load(Ordering::Relaxed), 1);
    assert!(!b.has_subscribers());

    // Flip: edges are rebuilt for the other branch
    cond.set(false);
    assert_eq!(runs.load(Ordering::Relaxed), 2);
    assert_eq!(picked.get(), "b2");

    a.set("a2".to_string());
    assert_eq!(runs.load(Ordering::Relaxed), 2);
    assert!(!a.has_subscribers());

    b.set("b3".to_string());
    assert_eq!(runs.load(Ordering::Relaxed), 3);
}

#[test]
fn equal_computed_result_keeps_downstream_asleep() {
    cov_mark::check!(check_verified_clean);

    let n = signal(1);
    let effect_runs = Arc::new(AtomicUsize::new(0));

    let n2 = n.clone();
    let parity = computed(move |_| n2.get() % 2);

    let parity2 = parity.clone();
    let er = effect_runs.clone();
    let _observer = effect(move || {
        parity2.get();
        er.fetch_add(1, Ordering::Relaxed);
    });

    assert_eq!(effect_runs.load(Ordering::Relaxed), 1);

    // 1 -> 3: parity recomputes to 1 again, the effect must not run
    n.set(3);
    assert_eq!(effect_runs.load(Ordering::Relaxed), 1);

    n.set(2);
    assert_eq!(effect_runs.load(Ordering::Relaxed), 2);
}

#[test]
fn batch_coalesces_many_writes_to_many_signals() {
    let signals: Vec<_> = (0..4).map(signal).collect();
    let runs = Arc::new(AtomicUsize::new(0));

    let all = signals.clone();
    let runs2 = runs.clone();
    let _sum = effect(move || {
        let _: i32 = all.iter().map(|s| s.get()).sum();
        runs2.fetch_add(1, Ordering::Relaxed);
    });

    assert_eq!(runs.load(Ordering::Relaxed), 1);

    batch(|| {
        for round in 1..=5 {
            for s in &signals {
                s.update(|v| v + round);
            }
        }
    });

    // Twenty writes, one re-run
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

#[test]
fn effects_flush_in_creation_order() {
    let s = signal(0);
    let order = Arc::new(Mutex::new(Vec::new()));

    let s2 = s.clone();
    let order2 = order.clone();
    let _first = effect(move || {
        s2.get();
        order2.lock().push("first");
    });

    let s3 = s.clone();
    let order3 = order.clone();
    let _second = effect(move || {
        s3.get();
        order3.lock().push("second");
    });

    batch(|| {
        s.set(1);
    });

    assert_eq!(*order.lock(), vec!["first", "second", "first", "second"]);
}

#[test]
fn nested_effect_observes_consistent_state_after_batch() {
    // b is kept at a * 2; an inner effect created by the outer one must
    // never observe a torn (a, b) pair when both change in one batch.
    let a = signal(1);
    let b = signal(2);
    let pairs = Arc::new(Mutex::new(Vec::new()));
    let inner_handle: Arc<Mutex<Option<Effect>>> = Arc::new(Mutex::new(None));

    let a2 = a.clone();
    let b2 = b.clone();
    let pairs2 = pairs.clone();
    let inner2 = inner_handle.clone();
    let _outer = effect(move || {
        a2.get();

        // Replace the inner effect each run; nesting does not auto-own
        if let Some(previous) = inner2.lock().take() {
            previous.stop();
        }
        let a3 = a2.clone();
        let b3 = b2.clone();
        let pairs3 = pairs2.clone();
        let inner = effect(move || {
            pairs3.lock().push((a3.get(), b3.get()));
        });
        *inner2.lock() = Some(inner);
    });

    batch(|| {
        a.set(3);
        b.set(6);
    });
    batch(|| {
        a.set(5);
        b.set(10);
    });

    for (a_seen, b_seen) in pairs.lock().iter() {
        assert_eq!(*b_seen, a_seen * 2, "inner effect saw a torn pair");
    }
}

#[test]
fn global_trigger_renotifies_after_in_place_mutation() {
    // Interior mutability: equality is identity, the documented fallback
    // for types without meaningful value equality
    #[derive(Clone)]
    struct Shared(Arc<Mutex<Vec<i32>>>);
    impl PartialEq for Shared {
        fn eq(&self, other: &Self) -> bool {
            Arc::ptr_eq(&self.0, &other.0)
        }
    }

    let items = signal(Shared(Arc::new(Mutex::new(vec![1]))));
    let lengths = Arc::new(Mutex::new(Vec::new()));

    let items2 = items.clone();
    let lengths2 = lengths.clone();
    let _observer = effect(move || {
        let held = items2.get();
        let len = held.0.lock().len();
        lengths2.lock().push(len);
    });

    assert_eq!(*lengths.lock(), vec![1]);

    // In-place mutation: the signal cannot see it...
    items.peek().0.lock().push(2);
    assert_eq!(*lengths.lock(), vec![1]);

    // ...until reactivity is re-asserted by hand
    crate::trigger(|| {
        items.get();
    });
    assert_eq!(*lengths.lock(), vec![1, 2]);
}

#[test]
fn async_tracks_only_the_synchronous_prefix() {
    let mut rt = LocalRuntime::new();

    let tracked = signal(1_u32);
    let post_suspension = signal(10_u32);

    let tracked2 = tracked.clone();
    let post2 = post_suspension.clone();
    let combined = async_computed(move || {
        // Tracked: read before the future is constructed
        let base = tracked2.get();
        let post = post2.clone();
        async move {
            // Untracked by design: reads after suspension must use peek
            Ok(base + post.peek())
        }
        .boxed_local()
    });

    rt.run_until_stalled();
    assert_eq!(combined.peek_value(), AsyncValue::Data(11));

    // Changing the post-suspension signal must NOT restart anything
    post_suspension.set(100);
    rt.run_until_stalled();
    assert_eq!(combined.peek_value(), AsyncValue::Data(11));

    // Changing the tracked one restarts (and picks up the new peek too)
    tracked.set(2);
    rt.run_until_stalled();
    assert_eq!(combined.peek_value(), AsyncValue::Data(102));
}

#[test]
fn async_value_feeds_back_into_the_sync_graph() {
    let mut rt = LocalRuntime::new();

    let input = signal(4_u32);
    let input2 = input.clone();
    let fetched = async_computed(move || {
        let v = input2.get();
        async move {
            if v == 0 {
                Err(AsyncError::msg("zero"))
            } else {
                Ok(v * v)
            }
        }
        .boxed_local()
    });

    let states = Arc::new(Mutex::new(Vec::new()));
    let fetched2 = fetched.clone();
    let states2 = states.clone();
    let _observer = effect(move || {
        states2.lock().push(fetched2.value());
    });

    rt.run_until_stalled();
    assert_eq!(
        *states.lock(),
        vec![AsyncValue::Loading, AsyncValue::Data(16)]
    );

    input.set(0);
    rt.run_until_stalled();
    let last = states.lock().last().cloned();
    assert_eq!(
        last,
        Some(AsyncValue::ErrorWithPrevious(AsyncError::msg("zero"), 16))
    );
}

//! Minimal signal/effect reactive runtime with automatic dependency
//! tracking.
//!
//! - [`Signal`]: a mutable cell. Reading it inside a running [`Effect`]
//!   records a dependency edge; writing it re-runs the subscribed
//!   effects. A write that does not change the value (by `PartialEq`)
//!   notifies nobody.
//! - [`Effect`]: runs immediately and again whenever a signal it read on
//!   its previous run changes. Dependencies are re-collected on every
//!   run, so they can grow and shrink.
//! - [`batch`]: coalesces notifications; an effect touched by several
//!   writes inside one batch runs once, after the outermost batch exits.
//! - [`Computed`]: an effect that writes its result into an internally
//!   owned signal.
//!
//! Dependency tracking state is thread-local: an effect's body runs
//! synchronously on the thread that triggered it, so reads always see
//! the correct active effect. Values and callbacks are `Send`, letting
//! signals be shared with the session task.
//!
//! Cycle protection: an effect that writes a signal it also reads would
//! re-enter itself; that and notification cascades deeper than
//! [`MAX_NOTIFY_DEPTH`] panic with an explicit message. Both indicate an
//! effect cycle, a programming defect rather than a data condition.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Bound on synchronous notification nesting (and on batch drain
/// passes) before the runtime declares an effect cycle.
pub const MAX_NOTIFY_DEPTH: usize = 64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Cleanup callback an effect run can hand back; invoked before the
/// next run and on disposal.
pub type CleanupFn = Box<dyn FnOnce() + Send>;

type EffectFn = Box<dyn FnMut() -> Option<CleanupFn> + Send>;

thread_local! {
    /// Stack of effects currently executing on this thread.
    static ACTIVE: RefCell<Vec<Arc<EffectInner>>> = const { RefCell::new(Vec::new()) };
    /// Current batch nesting depth.
    static BATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
    /// Effects pending notification from the current batch.
    static PENDING: RefCell<Vec<Arc<EffectInner>>> = const { RefCell::new(Vec::new()) };
    /// Current synchronous notification nesting depth.
    static NOTIFY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// A dependency source an effect can unsubscribe from.
trait Source: Send + Sync {
    fn source_id(&self) -> u64;
    fn unsubscribe(&self, effect_id: u64);
}

struct EffectInner {
    id: u64,
    f: Mutex<EffectFn>,
    cleanup: Mutex<Option<CleanupFn>>,
    /// Sources subscribed to during the last run.
    sources: Mutex<Vec<(u64, Weak<dyn Source>)>>,
    disposed: AtomicBool,
}

impl EffectInner {
    fn clear_sources(&self) {
        let sources = std::mem::take(&mut *self.sources.lock().unwrap());
        for (_, source) in sources {
            if let Some(source) = source.upgrade() {
                source.unsubscribe(self.id);
            }
        }
    }

    fn run_cleanup(&self) {
        if let Some(cleanup) = self.cleanup.lock().unwrap().take() {
            cleanup();
        }
    }
}

/// Pops the active-effect stack even if the effect body panics.
struct ActiveGuard;

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn run_effect(inner: &Arc<EffectInner>) {
    if inner.disposed.load(Ordering::Acquire) {
        return;
    }

    inner.run_cleanup();
    // Previous dependencies are dropped wholesale; the run below
    // re-subscribes to exactly the signals it reads this time.
    inner.clear_sources();

    // A locked body means this effect is already running further up the
    // stack: it wrote a signal it reads.
    let Ok(mut f) = inner.f.try_lock() else {
        panic!(
            "reactive cycle: effect re-entered during its own run \
             (an effect wrote a signal it depends on)"
        );
    };

    ACTIVE.with(|stack| stack.borrow_mut().push(inner.clone()));
    let _guard = ActiveGuard;
    let cleanup = (f)();
    drop(f);

    *inner.cleanup.lock().unwrap() = cleanup;
}

fn schedule(subscribers: Vec<Arc<EffectInner>>) {
    if subscribers.is_empty() {
        return;
    }

    if BATCH_DEPTH.with(|d| d.get()) > 0 {
        PENDING.with(|pending| {
            let mut pending = pending.borrow_mut();
            for effect in subscribers {
                if !pending.iter().any(|e| e.id == effect.id) {
                    pending.push(effect);
                }
            }
        });
        return;
    }

    NOTIFY_DEPTH.with(|depth| {
        if depth.get() >= MAX_NOTIFY_DEPTH {
            panic!(
                "reactive cycle: notification depth exceeded {} \
                 (effects keep triggering each other)",
                MAX_NOTIFY_DEPTH
            );
        }
        depth.set(depth.get() + 1);
    });

    for effect in subscribers {
        run_effect(&effect);
    }

    NOTIFY_DEPTH.with(|depth| depth.set(depth.get() - 1));
}

// ============================================================================
// Signal
// ============================================================================

struct SignalInner<T> {
    id: u64,
    value: Mutex<T>,
    /// Subscribed effects in registration order.
    subscribers: Mutex<Vec<(u64, Weak<EffectInner>)>>,
}

impl<T: Send + 'static> Source for SignalInner<T> {
    fn source_id(&self) -> u64 {
        self.id
    }

    fn unsubscribe(&self, effect_id: u64) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != effect_id);
    }
}

/// A reactive mutable cell.
pub struct Signal<T>(Arc<SignalInner<T>>);

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Send + 'static> Signal<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(SignalInner {
            id: next_id(),
            value: Mutex::new(value),
            subscribers: Mutex::new(Vec::new()),
        }))
    }

    /// Read the value, registering the currently running effect (if any)
    /// as a subscriber.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.track();
        self.0.value.lock().unwrap().clone()
    }

    /// Read the value without ever registering a dependency.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        self.0.value.lock().unwrap().clone()
    }

    /// Borrow the value for a closure, registering a dependency.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        f(&self.0.value.lock().unwrap())
    }

    /// Write a new value. Subscribers are notified only when the value
    /// observably changed.
    pub fn set(&self, value: T)
    where
        T: PartialEq,
    {
        let changed = {
            let mut guard = self.0.value.lock().unwrap();
            if *guard == value {
                false
            } else {
                *guard = value;
                true
            }
        };
        if changed {
            self.notify();
        }
    }

    /// Mutate the value in place; notifies only on an observable change.
    pub fn update(&self, f: impl FnOnce(&mut T))
    where
        T: Clone + PartialEq,
    {
        let changed = {
            let mut guard = self.0.value.lock().unwrap();
            let before = guard.clone();
            f(&mut guard);
            *guard != before
        };
        if changed {
            self.notify();
        }
    }

    fn track(&self) {
        ACTIVE.with(|stack| {
            let stack = stack.borrow();
            let Some(effect) = stack.last() else {
                return;
            };

            let mut subscribers = self.0.subscribers.lock().unwrap();
            if !subscribers.iter().any(|(id, _)| *id == effect.id) {
                subscribers.push((effect.id, Arc::downgrade(effect)));
            }
            drop(subscribers);

            let mut sources = effect.sources.lock().unwrap();
            if !sources.iter().any(|(id, _)| *id == self.0.id) {
                let erased: Arc<dyn Source> = self.0.clone();
                sources.push((self.0.id, Arc::downgrade(&erased)));
            }
        });
    }

    fn notify(&self) {
        // Snapshot (and prune) subscribers before running anything, so a
        // subscription change mid-notification cannot invalidate the
        // iteration.
        let subscribers: Vec<Arc<EffectInner>> = {
            let mut subscribers = self.0.subscribers.lock().unwrap();
            subscribers.retain(|(_, effect)| effect.strong_count() > 0);
            subscribers
                .iter()
                .filter_map(|(_, effect)| effect.upgrade())
                .collect()
        };
        schedule(subscribers);
    }
}

// ============================================================================
// Effect
// ============================================================================

/// Handle to a running effect. Dropping the handle disposes the effect:
/// its cleanup runs and it never re-runs.
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl Effect {
    /// Run `f` now and again whenever a signal it read changes.
    pub fn new<F>(mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::create(Box::new(move || {
            f();
            None
        }))
    }

    /// Like [`Effect::new`], but each run returns a cleanup callback,
    /// invoked before the next run and on disposal.
    pub fn with_cleanup<F>(mut f: F) -> Self
    where
        F: FnMut() -> CleanupFn + Send + 'static,
    {
        Self::create(Box::new(move || Some(f())))
    }

    fn create(f: EffectFn) -> Self {
        let inner = Arc::new(EffectInner {
            id: next_id(),
            f: Mutex::new(f),
            cleanup: Mutex::new(None),
            sources: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });
        run_effect(&inner);
        Self { inner }
    }

    /// Stop the effect: run its last cleanup and drop all subscriptions.
    /// The current run (if any) has already completed; dispose only
    /// prevents future runs.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.run_cleanup();
        self.inner.clear_sources();
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ============================================================================
// Batch
// ============================================================================

/// Run `f` with notifications deferred. Signal writes inside the batch
/// enqueue their subscribers (deduplicated); when the outermost batch
/// exits, the pending set drains to a fixed point, each effect running
/// once per drain pass.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    BATCH_DEPTH.with(|d| d.set(d.get() + 1));
    let result = f();

    let outermost = BATCH_DEPTH.with(|d| d.get()) == 1;
    if outermost {
        let mut passes = 0;
        loop {
            let pending = PENDING.with(|p| std::mem::take(&mut *p.borrow_mut()));
            if pending.is_empty() {
                break;
            }
            passes += 1;
            if passes > MAX_NOTIFY_DEPTH {
                BATCH_DEPTH.with(|d| d.set(d.get() - 1));
                panic!(
                    "reactive cycle: batch failed to settle after {} passes",
                    MAX_NOTIFY_DEPTH
                );
            }
            for effect in pending {
                run_effect(&effect);
            }
        }
    }

    BATCH_DEPTH.with(|d| d.set(d.get() - 1));
    result
}

// ============================================================================
// Computed
// ============================================================================

/// A derived value: an effect that recomputes on dependency changes and
/// writes the result into an internally owned signal. Unchanged results
/// do not propagate downstream.
pub struct Computed<T> {
    output: Arc<std::sync::OnceLock<Signal<T>>>,
    _effect: Effect,
}

impl<T> Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new<F>(mut f: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        let output: Arc<std::sync::OnceLock<Signal<T>>> = Arc::new(std::sync::OnceLock::new());
        let cell = output.clone();
        let effect = Effect::new(move || {
            let value = f();
            match cell.get() {
                Some(signal) => signal.set(value),
                None => {
                    let _ = cell.set(Signal::new(value));
                }
            }
        });
        Self {
            output,
            _effect: effect,
        }
    }

    /// Read the derived value, registering a dependency when called from
    /// inside an effect.
    pub fn get(&self) -> T {
        self.signal().get()
    }

    /// Read the derived value without registering a dependency.
    pub fn peek(&self) -> T {
        self.signal().peek()
    }

    fn signal(&self) -> &Signal<T> {
        // Initialized by the synchronous first run in `new`.
        self.output
            .get()
            .expect("computed output signal initialized on first run")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let reader = {
            let count = count.clone();
            move || count.load(Ordering::SeqCst)
        };
        (count, reader)
    }

    #[test]
    fn test_effect_runs_immediately_and_on_change() {
        let signal = Signal::new(1);
        let (count, runs) = counter();

        let _effect = {
            let signal = signal.clone();
            Effect::new(move || {
                signal.get();
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(runs(), 1);

        signal.set(2);
        assert_eq!(runs(), 2);
    }

    #[test]
    fn test_unchanged_write_is_a_noop() {
        let signal = Signal::new(5);
        let (count, runs) = counter();

        let _effect = {
            let signal = signal.clone();
            Effect::new(move || {
                signal.get();
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        signal.set(5);
        assert_eq!(runs(), 1);
        signal.set(6);
        assert_eq!(runs(), 2);
    }

    #[test]
    fn test_update_notifies_only_on_change() {
        let signal = Signal::new(vec![1, 2]);
        let (count, runs) = counter();

        let _effect = {
            let signal = signal.clone();
            let count = count.clone();
            Effect::new(move || {
                signal.with(|items| items.len());
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(runs(), 1);

        signal.update(|items| items.push(3));
        assert_eq!(runs(), 2);
        assert_eq!(signal.peek(), vec![1, 2, 3]);

        signal.update(|_| {});
        assert_eq!(runs(), 2);
    }

    #[test]
    fn test_peek_does_not_subscribe() {
        let signal = Signal::new(1);
        let (count, runs) = counter();

        let _effect = {
            let signal = signal.clone();
            Effect::new(move || {
                signal.peek();
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        signal.set(2);
        assert_eq!(runs(), 1);
    }

    #[test]
    fn test_dynamic_dependencies() {
        let use_a = Signal::new(true);
        let a = Signal::new(0);
        let b = Signal::new(0);
        let (count, runs) = counter();

        let _effect = {
            let (use_a, a, b) = (use_a.clone(), a.clone(), b.clone());
            Effect::new(move || {
                if use_a.get() {
                    a.get();
                } else {
                    b.get();
                }
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(runs(), 1);

        // Reading A: writes to A trigger, writes to B do not.
        b.set(1);
        assert_eq!(runs(), 1);
        a.set(1);
        assert_eq!(runs(), 2);

        // Switch the branch: now subscribed to B and no longer to A.
        use_a.set(false);
        assert_eq!(runs(), 3);
        a.set(2);
        assert_eq!(runs(), 3);
        b.set(2);
        assert_eq!(runs(), 4);
    }

    #[test]
    fn test_dispose_stops_future_runs() {
        let signal = Signal::new(1);
        let (count, runs) = counter();

        let effect = {
            let signal = signal.clone();
            Effect::new(move || {
                signal.get();
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        effect.dispose();
        signal.set(2);
        assert_eq!(runs(), 1);
    }

    #[test]
    fn test_cleanup_runs_before_rerun_and_on_dispose() {
        let signal = Signal::new(1);
        let (cleanups, cleaned) = counter();

        let effect = {
            let signal = signal.clone();
            Effect::with_cleanup(move || {
                signal.get();
                let cleanups = cleanups.clone();
                Box::new(move || {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                }) as CleanupFn
            })
        };
        assert_eq!(cleaned(), 0);

        signal.set(2);
        assert_eq!(cleaned(), 1);

        effect.dispose();
        assert_eq!(cleaned(), 2);
    }

    #[test]
    fn test_batch_coalesces() {
        let a = Signal::new(0);
        let b = Signal::new(0);
        let (count, runs) = counter();

        let _effect = {
            let (a, b) = (a.clone(), b.clone());
            let count = count.clone();
            Effect::new(move || {
                a.get();
                b.get();
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(runs(), 1);

        batch(|| {
            a.set(1);
            b.set(1);
            a.set(2);
            // Nothing has run yet inside the batch.
            assert_eq!(count.load(Ordering::SeqCst), 1);
        });
        assert_eq!(runs(), 2);
    }

    #[test]
    fn test_nested_batches_drain_once() {
        let a = Signal::new(0);
        let (count, runs) = counter();

        let _effect = {
            let a = a.clone();
            let count = count.clone();
            Effect::new(move || {
                a.get();
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        batch(|| {
            a.set(1);
            batch(|| {
                a.set(2);
            });
            assert_eq!(count.load(Ordering::SeqCst), 1);
        });
        assert_eq!(runs(), 2);
    }

    #[test]
    fn test_batch_drains_to_fixed_point() {
        let first = Signal::new(0);
        let second = Signal::new(0);
        let (count, runs) = counter();

        // Effect A forwards first → second; effect B observes second.
        let _forward = {
            let (first, second) = (first.clone(), second.clone());
            Effect::new(move || {
                let v = first.get();
                second.set(v);
            })
        };
        let _observe = {
            let second = second.clone();
            Effect::new(move || {
                second.get();
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(runs(), 1);

        batch(|| first.set(7));
        assert_eq!(second.peek(), 7);
        assert_eq!(runs(), 2);
    }

    #[test]
    #[should_panic(expected = "reactive cycle")]
    fn test_self_writing_effect_panics() {
        let signal = Signal::new(0);
        let _effect = {
            let signal = signal.clone();
            Effect::new(move || {
                let v = signal.get();
                signal.set(v + 1);
            })
        };
    }

    #[test]
    fn test_computed_tracks_and_dedups() {
        let source = Signal::new(2);
        let doubled = {
            let source = source.clone();
            Computed::new(move || source.get() * 2)
        };
        assert_eq!(doubled.get(), 4);

        let (count, runs) = counter();
        let _observe = {
            let doubled = Signal::clone(doubled.output.get().unwrap());
            Effect::new(move || {
                doubled.get();
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(runs(), 1);

        source.set(5);
        assert_eq!(doubled.get(), 10);
        assert_eq!(runs(), 2);

        // Same derived value: downstream does not re-run.
        let parity = {
            let source = source.clone();
            Computed::new(move || source.get() % 2)
        };
        let (pcount, pruns) = counter();
        let _pobserve = {
            let parity = Signal::clone(parity.output.get().unwrap());
            Effect::new(move || {
                parity.get();
                pcount.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(pruns(), 1);
        source.set(7);
        assert_eq!(pruns(), 1);
        source.set(8);
        assert_eq!(pruns(), 2);
    }
}

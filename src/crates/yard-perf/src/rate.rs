//! Debounce and throttle wrappers
//!
//! Both wrappers keep the arguments of the *latest* call for trailing
//! execution. Timers run on the tokio clock, so `call` must be made from
//! inside a runtime.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Callback<A> = Box<dyn Fn(A) + Send + Sync>;

/// Wrap `func` so bursts of calls collapse into one trailing invocation
/// `delay` after the last call.
pub fn debounce<A, F>(func: F, delay: Duration) -> Debounced<A>
where
    A: Send + 'static,
    F: Fn(A) + Send + Sync + 'static,
{
    Debounced {
        inner: Arc::new(DebounceInner {
            func: Box::new(func),
            delay,
            state: Mutex::new(TimerSlot::default()),
        }),
    }
}

/// Wrap `func` so it runs at most once per `delay` window.
pub fn throttle<A, F>(func: F, delay: Duration, options: ThrottleOptions) -> Throttled<A>
where
    A: Send + 'static,
    F: Fn(A) + Send + Sync + 'static,
{
    Throttled {
        inner: Arc::new(ThrottleInner {
            func: Box::new(func),
            delay,
            options,
            state: Mutex::new(ThrottleState {
                last_fire: None,
                trailing_args: None,
                slot: TimerSlot::default(),
            }),
        }),
    }
}

/// Pending timer plus a generation counter. A timer whose generation no
/// longer matches was superseded and must not fire.
struct TimerSlot {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Default for TimerSlot {
    fn default() -> Self {
        Self {
            generation: 0,
            timer: None,
        }
    }
}

impl TimerSlot {
    fn reset(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation
    }
}

struct DebounceInner<A> {
    func: Callback<A>,
    delay: Duration,
    state: Mutex<TimerSlot>,
}

/// Debounced function handle. Clones share the same pending timer.
pub struct Debounced<A> {
    inner: Arc<DebounceInner<A>>,
}

impl<A> Clone for Debounced<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Send + 'static> Debounced<A> {
    /// Record a call. Any pending invocation is replaced by one carrying `args`.
    pub fn call(&self, args: A) {
        let mut slot = self.inner.state.lock();
        let generation = slot.reset();
        let inner = Arc::clone(&self.inner);
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.delay).await;
            {
                let mut slot = inner.state.lock();
                if slot.generation != generation {
                    return;
                }
                slot.timer = None;
            }
            (inner.func)(args);
        }));
    }

    /// Drop the pending invocation without running it.
    pub fn cancel(&self) {
        self.inner.state.lock().reset();
    }

    /// Whether an invocation is waiting to fire
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }
}

/// Leading/trailing edge selection for [`throttle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleOptions {
    /// Fire on the first call of a window
    pub leading: bool,
    /// Fire the latest arguments once more at the window boundary
    pub trailing: bool,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            leading: true,
            trailing: true,
        }
    }
}

struct ThrottleState<A> {
    last_fire: Option<Instant>,
    trailing_args: Option<A>,
    slot: TimerSlot,
}

struct ThrottleInner<A> {
    func: Callback<A>,
    delay: Duration,
    options: ThrottleOptions,
    state: Mutex<ThrottleState<A>>,
}

/// Throttled function handle. Clones share the same window.
pub struct Throttled<A> {
    inner: Arc<ThrottleInner<A>>,
}

impl<A> Clone for Throttled<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Send + 'static> Throttled<A> {
    /// Record a call, firing now or at the window boundary depending on options.
    pub fn call(&self, args: A) {
        let now = Instant::now();
        let delay = self.inner.delay;
        let mut state = self.inner.state.lock();

        let window_elapsed = state
            .last_fire
            .map_or(true, |last| now.duration_since(last) >= delay);

        if self.inner.options.leading && window_elapsed {
            state.last_fire = Some(now);
            drop(state);
            (self.inner.func)(args);
            return;
        }

        if !self.inner.options.trailing {
            return;
        }

        state.trailing_args = Some(args);
        if state.slot.timer.is_some() {
            return;
        }

        let wait = match state.last_fire {
            Some(last) => delay.saturating_sub(now.duration_since(last)),
            None => delay,
        };
        let generation = state.slot.reset();
        let inner = Arc::clone(&self.inner);
        state.slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let args = {
                let mut state = inner.state.lock();
                if state.slot.generation != generation {
                    return;
                }
                state.slot.timer = None;
                state.last_fire = Some(Instant::now());
                state.trailing_args.take()
            };
            if let Some(args) = args {
                (inner.func)(args);
            }
        }));
    }

    /// Drop any pending trailing invocation and reopen the window.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.slot.reset();
        state.trailing_args = None;
        state.last_fire = None;
    }

    /// Whether a trailing invocation is waiting to fire
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().slot.timer.is_some()
    }
}

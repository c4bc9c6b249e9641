use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Cancellation handle shared with background work; cooperative, checked at
/// loop boundaries.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Runs a side effect at most once per tick interval: the caller asks on
/// every state change, and only the first ask per interval fires. Stands in
/// for animation-frame coalescing without tying the logic to any runtime's
/// frame callback.
#[derive(Debug)]
pub struct TickCoalescer {
    interval: Duration,
    last_run: Option<Instant>,
}

impl TickCoalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: None,
        }
    }

    pub fn should_run(&mut self, now: Instant) -> bool {
        match self.last_run {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_run = Some(now);
                true
            }
        }
    }

    /// Clear the gate so the next ask fires regardless of elapsed time.
    pub fn force_next(&mut self) {
        self.last_run = None;
    }
}

/// Interval timer with an immediate-on-transition override: `due` reports at
/// the configured cadence, `force` makes the next check due right away.
#[derive(Debug)]
pub struct PeriodicRefresh {
    interval: Duration,
    last: Instant,
    forced: bool,
}

impl PeriodicRefresh {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last: now,
            forced: false,
        }
    }

    pub fn due(&mut self, now: Instant) -> bool {
        if self.forced || now.duration_since(self.last) >= self.interval {
            self.forced = false;
            self.last = now;
            true
        } else {
            false
        }
    }

    pub fn force(&mut self) {
        self.forced = true;
    }
}

/// Spawn a background safety-net timer invoking `tick` every `interval`
/// until the handle is cancelled.
pub fn spawn_periodic(
    name: &str,
    interval: Duration,
    cancel: CancelHandle,
    tick: impl Fn() + Send + 'static,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("preview-{name}"))
        .spawn(move || {
            // Sleep in short slices so cancellation is prompt.
            let slice = interval.min(Duration::from_millis(50));
            let mut next = Instant::now() + interval;
            while !cancel.is_cancelled() {
                thread::sleep(slice);
                let now = Instant::now();
                if now >= next {
                    tick();
                    next = now + interval;
                }
            }
        })
        .expect("failed to spawn periodic timer thread")
}

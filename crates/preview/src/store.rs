use std::sync::Arc;

use parking_lot::Mutex;
use timeline::Frame;

/// Authoritative playback state. `preview_frame` is the transient scrub/hover
/// position; it is distinct from `current_frame` and only meaningful while
/// not playing and not mid-drag-commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackSnapshot {
    pub current_frame: Frame,
    pub preview_frame: Option<Frame>,
    pub is_playing: bool,
    pub is_gizmo_interacting: bool,
}

type Listener = Box<dyn FnMut(&PlaybackSnapshot) + Send>;

struct Inner {
    state: PlaybackSnapshot,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

/// Explicit observable state container: `get_state` / `set_state` /
/// `subscribe`, with listeners invoked synchronously on every mutation.
/// Subsystems read via `get_state()` at the moment of action rather than
/// capturing stale copies.
#[derive(Clone)]
pub struct PlaybackStore {
    inner: Arc<Mutex<Inner>>,
}

/// Handle returned by [`PlaybackStore::subscribe`]; dropping it (or calling
/// `unsubscribe`) detaches the listener.
pub struct Subscription {
    inner: Arc<Mutex<Inner>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.listeners.retain(|(id, _)| *id != self.id);
    }
}

impl Default for PlaybackStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: PlaybackSnapshot::default(),
                listeners: Vec::new(),
                next_listener_id: 1,
            })),
        }
    }

    pub fn get_state(&self) -> PlaybackSnapshot {
        self.inner.lock().state
    }

    /// Apply a partial update atomically; listeners observe the final state
    /// exactly once even when several fields change together (e.g. a drag
    /// release committing `current_frame` and clearing `preview_frame`).
    pub fn set_state(&self, apply: impl FnOnce(&mut PlaybackSnapshot)) {
        let next = {
            let mut inner = self.inner.lock();
            let prev = inner.state;
            apply(&mut inner.state);
            if inner.state == prev {
                return;
            }
            inner.state
        };
        self.notify(&next);
    }

    pub fn subscribe(
        &self,
        listener: impl FnMut(&PlaybackSnapshot) + Send + 'static,
    ) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, Box::new(listener)));
        Subscription {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    pub fn set_current_frame(&self, frame: Frame) {
        self.set_state(|s| s.current_frame = frame);
    }

    pub fn set_preview_frame(&self, frame: Option<Frame>) {
        self.set_state(|s| s.preview_frame = frame);
    }

    pub fn set_gizmo_interacting(&self, active: bool) {
        self.set_state(|s| s.is_gizmo_interacting = active);
    }

    /// Starting playback clears any transient scrub position.
    pub fn play(&self) {
        self.set_state(|s| {
            s.is_playing = true;
            s.preview_frame = None;
        });
    }

    pub fn pause(&self) {
        self.set_state(|s| s.is_playing = false);
    }

    // Listeners are detached from the lock while they run so a listener may
    // read the store; listeners subscribed mid-notify are merged back in.
    fn notify(&self, state: &PlaybackSnapshot) {
        let mut taken = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.listeners)
        };
        for (_, listener) in taken.iter_mut() {
            listener(state);
        }
        let mut inner = self.inner.lock();
        let added = std::mem::take(&mut inner.listeners);
        inner.listeners = taken;
        inner.listeners.extend(added);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_listeners_called_synchronously_per_mutation() {
        let store = PlaybackStore::new();
        let calls = Arc::new(AtomicU64::new(0));
        let calls_in = Arc::clone(&calls);
        let _sub = store.subscribe(move |_| {
            calls_in.fetch_add(1, Ordering::SeqCst);
        });

        store.set_current_frame(10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        store.set_preview_frame(Some(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // No-op mutation does not notify.
        store.set_current_frame(10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_atomic_partial_update_notifies_once() {
        let store = PlaybackStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        let _sub = store.subscribe(move |s| seen_in.lock().push(*s));

        store.set_state(|s| {
            s.current_frame = 72;
            s.preview_frame = None;
        });

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].current_frame, 72);
        assert_eq!(seen[0].preview_frame, None);
    }

    #[test]
    fn test_unsubscribe_detaches() {
        let store = PlaybackStore::new();
        let calls = Arc::new(AtomicU64::new(0));
        let calls_in = Arc::clone(&calls);
        let sub = store.subscribe(move |_| {
            calls_in.fetch_add(1, Ordering::SeqCst);
        });
        store.set_current_frame(1);
        sub.unsubscribe();
        store.set_current_frame(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_play_clears_preview_frame() {
        let store = PlaybackStore::new();
        store.set_preview_frame(Some(42));
        store.play();
        let state = store.get_state();
        assert!(state.is_playing);
        assert_eq!(state.preview_frame, None);
    }
}

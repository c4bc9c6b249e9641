use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use timeline::{Frame, Sequence};
use tracing::debug;

use crate::clock::PlaybackClock;
use crate::config::PreviewConfig;
use crate::mode::{anchor_frame, resolve_mode, InteractionMode};
use crate::quality::{frame_budget_ms, AdaptiveQuality};
use crate::resolve::scheduler::{ResolveCandidate, ResolvePass, ResolveScheduler};
use crate::resolve::{MediaResolver, ResolvedSource};
use crate::sched::{spawn_periodic, CancelHandle, TickCoalescer};
use crate::scrub::renderer::{FastScrub, RequestOutcome};
use crate::scrub::{
    composition_fingerprint, should_show_fast_scrub_overlay, CompositionProps, FrameSink,
    RendererFactory,
};
use crate::store::{PlaybackSnapshot, PlaybackStore, Subscription};
use crate::telemetry::PreviewStats;
use crate::transition::{classify, PreloadBurst};
use crate::warm_set::{DecodeHandleOpener, SourceWarmSet, WarmCandidate};
use crate::window::preload_window;

/// The primary (real-time) player the preview coordinates with. Seeks and
/// transport changes are fire-and-forget; position comes back through the
/// playback store.
pub trait PlayerHandle: Send + Sync {
    fn seek_to(&self, frame: Frame);
    fn play(&self);
    fn pause(&self);
}

struct ControllerState {
    prev: PlaybackSnapshot,
    /// -1 backward, 0 unknown/neutral, 1 forward; derived from successive
    /// preview positions and cleared when scrubbing ends.
    scrub_direction: i32,
    warm_tick: TickCoalescer,
    clock: PlaybackClock,
    /// Instant and frame of the last playing-position sample, for quality
    /// measurement.
    last_play_sample: Option<(Instant, Frame)>,
    user_quality: f32,
    /// On-screen viewport, when smaller than the project dimensions.
    container_size: Option<(u32, u32)>,
    /// Host-driven override that hides the overlay regardless of state
    /// (e.g. while a modal covers the player).
    suspend_overlay: bool,
}

/// Orchestrates the preview pipeline: reacts to playback-store changes,
/// routes seeks between the primary player and the fast-scrub path, keeps
/// the resolve scheduler and warm set fed, and owns the adaptive quality
/// controller.
pub struct PreviewController {
    config: PreviewConfig,
    store: PlaybackStore,
    player: Arc<dyn PlayerHandle>,
    scheduler: ResolveScheduler,
    scrub: FastScrub,
    warm: Mutex<SourceWarmSet>,
    quality: Mutex<AdaptiveQuality>,
    stats: PreviewStats,
    state: Mutex<ControllerState>,
    sequence: Mutex<Arc<Sequence>>,
    fingerprint: Mutex<String>,
    cancel: CancelHandle,
    subscription: Mutex<Option<Subscription>>,
    periodic: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PreviewController {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: PreviewConfig,
        store: PlaybackStore,
        sequence: Arc<Sequence>,
        player: Arc<dyn PlayerHandle>,
        resolver: Arc<dyn MediaResolver>,
        opener: Box<dyn DecodeHandleOpener>,
        factory: Arc<dyn RendererFactory>,
        sink: Arc<dyn FrameSink>,
    ) -> Arc<Self> {
        let stats = PreviewStats::new();
        let scheduler = ResolveScheduler::new(resolver, &config, stats.clone());
        let scrub = FastScrub::new(factory, sink, &config, stats.clone());
        let warm = Mutex::new(SourceWarmSet::new(opener, &config, stats.clone()));
        let quality = Mutex::new(AdaptiveQuality::new(&config, stats.clone()));
        let fingerprint = composition_fingerprint(&sequence);
        let cancel = CancelHandle::new();

        let controller = Arc::new(Self {
            state: Mutex::new(ControllerState {
                prev: store.get_state(),
                scrub_direction: 0,
                warm_tick: TickCoalescer::new(config.periodic_refresh() / 2),
                clock: PlaybackClock::new(sequence.fps.as_f64()),
                last_play_sample: None,
                user_quality: 1.0,
                container_size: None,
                suspend_overlay: false,
            }),
            config,
            store: store.clone(),
            player,
            scheduler,
            scrub,
            warm,
            quality,
            stats,
            sequence: Mutex::new(sequence),
            fingerprint: Mutex::new(fingerprint),
            cancel: cancel.clone(),
            subscription: Mutex::new(None),
            periodic: Mutex::new(None),
        });

        controller.rebuild_renderer();

        let weak = Arc::downgrade(&controller);
        let sub = store.subscribe(move |snapshot| {
            if let Some(controller) = weak.upgrade() {
                controller.handle_change(*snapshot);
            }
        });
        *controller.subscription.lock() = Some(sub);

        // safety net: keeps resolution and the warm set converging even when
        // nothing mutates the store for a while
        let weak = Arc::downgrade(&controller);
        let periodic = spawn_periodic(
            "refresh",
            controller.config.periodic_refresh(),
            cancel,
            move || {
                if let Some(controller) = weak.upgrade() {
                    controller.refresh_now();
                }
            },
        );
        *controller.periodic.lock() = Some(periodic);

        controller
    }

    fn handle_change(&self, next: PlaybackSnapshot) {
        let mut st = self.state.lock();
        let prev = st.prev;
        if prev == next {
            return;
        }
        let t = classify(&prev, &next);
        let prev_mode = resolve_mode(prev.is_playing, prev.preview_frame, prev.is_gizmo_interacting);
        let mode = t.mode;

        if let (Some(a), Some(b)) = (prev.preview_frame, next.preview_frame) {
            if a != b {
                st.scrub_direction = (b - a).signum() as i32;
            }
        } else if next.preview_frame.is_none() {
            st.scrub_direction = 0;
        }
        let direction = st.scrub_direction;
        let anchor = anchor_frame(mode, next.current_frame, next.preview_frame);
        let sequence = Arc::clone(&self.sequence.lock());

        if t.entered_playing {
            self.scrub.invalidate();
            st.clock.play(next.current_frame);
            st.last_play_sample = Some((Instant::now(), next.current_frame));
            self.quality.lock().reset();
            self.player.play();
            // playback wants its look-ahead warm immediately, not next tick
            st.warm_tick.force_next();
        }
        if t.exited_playing {
            st.clock.pause(next.current_frame);
            st.last_play_sample = None;
            self.quality.lock().reset();
            self.player.pause();
        }
        if mode == InteractionMode::GizmoDragging && prev_mode != InteractionMode::GizmoDragging {
            self.scrub.invalidate();
        }
        if prev_mode == InteractionMode::Scrubbing && mode != InteractionMode::Scrubbing {
            self.scrub.invalidate();
        }

        if t.current_frame_changed && !t.should_skip_current_frame_seek {
            self.player.seek_to(next.current_frame);
            st.clock.seek_to(next.current_frame);
        }

        if mode == InteractionMode::Scrubbing && t.preview_frame_changed {
            if let Some(frame) = next.preview_frame {
                if self.scrub.request(frame) == RequestOutcome::Fallback {
                    self.player.seek_to(frame);
                } else {
                    self.scrub.plan_prewarm(
                        &sequence,
                        frame,
                        direction,
                        self.config.backward_granularity.max(1),
                    );
                }
            }
        }

        let pass = self.build_pass(&sequence, mode, anchor, direction);
        match t.burst {
            PreloadBurst::ScrubEnter => {
                debug!(target = "preview", anchor, "scrub enter, urgent resolution pass");
                let mut urgent = pass;
                urgent.deferrable = false;
                self.scheduler.request_pass(urgent);
            }
            PreloadBurst::PausedShortSeek => {
                for _ in 0..self.config.paused_seek_burst_passes {
                    self.scheduler.request_pass(pass.clone());
                }
            }
            PreloadBurst::None => self.scheduler.request_pass(pass),
        }

        let now = Instant::now();
        if st.warm_tick.should_run(now) {
            self.refresh_warm(&sequence, mode, anchor, direction, now);
        }
        {
            let mut warm = self.warm.lock();
            while let Some(id) = self.scrub.pop_source_touch() {
                warm.touch(&id, now);
            }
        }

        if mode == InteractionMode::Playing && t.current_frame_changed {
            if let Some((at, from)) = st.last_play_sample {
                let advanced = next.current_frame - from;
                let budget = frame_budget_ms(sequence.fps.as_f64(), st.clock.rate());
                self.quality.lock().note_frame_advance(
                    at.elapsed().as_secs_f64() * 1_000.0,
                    advanced,
                    budget,
                );
            }
            st.last_play_sample = Some((Instant::now(), next.current_frame));
        }

        st.prev = next;
        drop(st);
        self.push_props(&sequence);
    }

    /// Media ids needed by the preload window, each with the frame nearest
    /// the anchor at which it appears.
    fn build_pass(
        &self,
        sequence: &Sequence,
        mode: InteractionMode,
        anchor: Frame,
        direction: i32,
    ) -> ResolvePass {
        let fps = sequence.fps.rounded().max(1);
        let window = preload_window(mode, anchor, direction, fps, self.config.ahead_seconds);
        let mut nearest: HashMap<String, Frame> = HashMap::new();
        for item in sequence.items_intersecting(window.start_frame, window.end_frame + 1) {
            let Some(id) = item.kind.media_id() else { continue };
            let frame = anchor.clamp(item.from, item.end() - 1);
            nearest
                .entry(id.to_string())
                .and_modify(|f| {
                    if (frame - anchor).abs() < (*f - anchor).abs() {
                        *f = frame;
                    }
                })
                .or_insert(frame);
        }
        ResolvePass {
            candidates: nearest
                .into_iter()
                .map(|(media_id, nearest_frame)| ResolveCandidate {
                    media_id,
                    nearest_frame,
                })
                .collect(),
            anchor_frame: anchor,
            scrub_direction: direction,
            deferrable: mode == InteractionMode::Scrubbing,
        }
    }

    fn refresh_warm(
        &self,
        sequence: &Sequence,
        mode: InteractionMode,
        anchor: Frame,
        direction: i32,
        now: Instant,
    ) {
        let fps = sequence.fps.rounded().max(1);
        let window = preload_window(mode, anchor, direction, fps, self.config.ahead_seconds);
        let mut nearest: HashMap<String, Frame> = HashMap::new();
        for item in sequence.items_intersecting(window.start_frame, window.end_frame + 1) {
            let Some(id) = item.kind.media_id() else { continue };
            let frame = anchor.clamp(item.from, item.end() - 1);
            let distance = frame - anchor;
            nearest
                .entry(id.to_string())
                .and_modify(|d| {
                    if distance.abs() < d.abs() {
                        *d = distance;
                    }
                })
                .or_insert(distance);
        }
        let candidates: Vec<WarmCandidate> = nearest
            .into_iter()
            .map(|(media_id, distance_frames)| WarmCandidate {
                media_id,
                distance_frames,
            })
            .collect();
        self.warm
            .lock()
            .refresh(&candidates, &self.scheduler.resolved(), now);
    }

    fn compose_props(&self, sequence: &Arc<Sequence>) -> CompositionProps {
        let (user_quality, container) = {
            let st = self.state.lock();
            (st.user_quality, st.container_size)
        };
        let quality = self.quality.lock();
        let (base_w, base_h) = match container {
            Some((w, h)) => (w.min(sequence.width), h.min(sequence.height)),
            None => (sequence.width, sequence.height),
        };
        let (target_width, target_height) = quality.scale_dims(base_w, base_h, user_quality);
        CompositionProps {
            sequence: Arc::clone(sequence),
            resolved: self.scheduler.resolved(),
            quality: quality.effective(user_quality),
            target_width,
            target_height,
        }
    }

    fn push_props(&self, sequence: &Arc<Sequence>) {
        self.scrub.set_props(self.compose_props(sequence));
    }

    fn rebuild_renderer(&self) {
        let sequence = Arc::clone(&self.sequence.lock());
        self.scrub.rebuild(self.compose_props(&sequence));
    }

    /// Periodic safety net: re-derive the window from current state and let
    /// the scheduler/warm set converge on anything a burst of changes missed.
    fn refresh_now(&self) {
        let snapshot = self.store.get_state();
        let mode = resolve_mode(
            snapshot.is_playing,
            snapshot.preview_frame,
            snapshot.is_gizmo_interacting,
        );
        let anchor = anchor_frame(mode, snapshot.current_frame, snapshot.preview_frame);
        let direction = self.state.lock().scrub_direction;
        let sequence = Arc::clone(&self.sequence.lock());
        self.scheduler
            .request_pass(self.build_pass(&sequence, mode, anchor, direction));
        self.refresh_warm(&sequence, mode, anchor, direction, Instant::now());
        self.push_props(&sequence);
    }

    /// Swap in an edited sequence. A structural change rebuilds the scrub
    /// renderer and drops cached state for media the new cut no longer
    /// references; content-only changes just republish props.
    pub fn set_sequence(&self, sequence: Arc<Sequence>) {
        let fingerprint = composition_fingerprint(&sequence);
        let structural = {
            let mut current = self.fingerprint.lock();
            let changed = *current != fingerprint;
            *current = fingerprint;
            changed
        };
        *self.sequence.lock() = Arc::clone(&sequence);
        {
            let mut st = self.state.lock();
            st.clock = PlaybackClock::new(sequence.fps.as_f64());
        }
        if structural {
            let referenced: HashSet<String> =
                sequence.referenced_media_ids().into_iter().collect();
            self.scheduler.retain_referenced(referenced);
            self.rebuild_renderer();
        }
        self.refresh_now();
    }

    /// The asset behind `media_id` changed (re-import, proxy finished);
    /// forget its URL and failure history and re-resolve.
    pub fn media_updated(&self, media_id: &str) {
        self.scheduler.invalidate(media_id);
        self.refresh_now();
    }

    pub fn invalidate_all_media(&self) {
        self.scheduler.invalidate_all();
        self.refresh_now();
    }

    /// Media ids currently parked as broken, for UI badges.
    pub fn broken_media(&self) -> Vec<String> {
        self.scheduler.broken_media()
    }

    pub fn resolved(&self) -> Arc<HashMap<String, ResolvedSource>> {
        self.scheduler.resolved()
    }

    /// Whether the fast-scrub overlay should cover the player right now.
    pub fn should_show_overlay(&self) -> bool {
        if self.state.lock().suspend_overlay {
            return false;
        }
        let s = self.store.get_state();
        should_show_fast_scrub_overlay(
            s.is_playing,
            s.is_gizmo_interacting,
            s.preview_frame,
            self.scrub.rendered_frame(),
        )
    }

    pub fn set_user_quality(&self, quality: f32) {
        self.state.lock().user_quality = quality.clamp(0.1, 1.0);
        let sequence = Arc::clone(&self.sequence.lock());
        self.push_props(&sequence);
    }

    /// Viewport dimensions from the host; the render target never exceeds
    /// the smaller of viewport and project size.
    pub fn set_container_size(&self, width: u32, height: u32) {
        self.state.lock().container_size = Some((width, height));
        let sequence = Arc::clone(&self.sequence.lock());
        self.push_props(&sequence);
    }

    /// Host-driven overlay suppression (e.g. a modal over the player).
    pub fn set_suspend_overlay(&self, suspend: bool) {
        self.state.lock().suspend_overlay = suspend;
    }

    /// Playback rate from the host transport (1.0 = normal). Re-anchors the
    /// clock so frame budgets track the new rate immediately.
    pub fn set_playback_rate(&self, rate: f64) {
        let current = self.store.get_state().current_frame;
        self.state.lock().clock.set_rate(rate, current);
    }

    pub fn stats(&self) -> PreviewStats {
        self.stats.clone()
    }

    /// Multi-line diagnostic string for an on-screen overlay.
    pub fn hud(&self) -> String {
        let s = self.store.get_state();
        let mode = resolve_mode(s.is_playing, s.preview_frame, s.is_gizmo_interacting);
        let (quality, rate, drift) = {
            let st = self.state.lock();
            let drift = if st.clock.is_playing() {
                st.clock.drift_frames(s.current_frame)
            } else {
                0
            };
            (
                self.quality.lock().effective(st.user_quality),
                st.clock.rate(),
                drift,
            )
        };
        let (warm_sources, warm_elements) = {
            let warm = self.warm.lock();
            (warm.len(), warm.element_count())
        };
        format!(
            "mode {}  anchor {}  rate {:.2}  drift {}  quality {:.2}\nwarm sources {} elements {}\n{}",
            mode.name(),
            anchor_frame(mode, s.current_frame, s.preview_frame),
            rate,
            drift,
            quality,
            warm_sources,
            warm_elements,
            self.stats.hud(),
        )
    }
}

impl Drop for PreviewController {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.subscription.lock().take();
        if let Some(handle) = self.periodic.lock().take() {
            let _ = handle.join();
        }
        self.stats.log_summary();
    }
}

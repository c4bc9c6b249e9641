use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use timeline::Frame;
use tracing::{debug, info, warn};

use crate::config::PreviewConfig;
use crate::error::PreviewError;
use crate::scrub::prewarm::PrewarmQueue;
use crate::scrub::{CompositionProps, CompositionRenderer, FrameSink, RendererFactory};
use crate::telemetry::PreviewStats;

/// Outcome of a scrub render request after backward-scrub shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Queued for the worker at full priority.
    Accepted,
    /// Dropped by the backward throttle; a later request will cover it.
    Throttled,
    /// Backward fallback is enabled; the caller should seek the primary
    /// player instead.
    Fallback,
}

#[derive(Debug, Clone, Copy)]
struct PriorityRequest {
    /// Frame to render; backward quantization may have snapped it.
    frame: Frame,
    /// Anchor the caller asked for, before any shaping.
    requested: Frame,
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct RenderedOverlay {
    /// The requested anchor the overlay answers for, so the gate matches
    /// even when a quantized neighbor was rendered in its place.
    requested: Frame,
    generation: u64,
}

enum Command {
    /// Replace props without touching the renderer (resolved URLs or quality
    /// changed under the same composition structure).
    SetProps(CompositionProps),
    /// Composition structure changed; rebuild the renderer.
    Rebuild(CompositionProps),
    Stop,
}

/// Latest-wins mailbox: a newer scrub position silently cancels the older
/// one before it renders.
type Mailbox = Arc<Mutex<Option<PriorityRequest>>>;

/// Dedicated scrub renderer running beside the primary player. Requests go
/// through a single-slot priority mailbox; speculative prewarm work only runs
/// while the mailbox is empty. A generation counter guards against stale
/// frames being presented after the interaction that wanted them ended.
pub struct FastScrub {
    commands: Sender<Command>,
    mailbox: Mailbox,
    generation: Arc<AtomicU64>,
    overlay: Arc<Mutex<Option<RenderedOverlay>>>,
    prewarm: Arc<Mutex<PrewarmQueue>>,
    shaping: Mutex<BackwardShaping>,
    backward_fallback: bool,
    stats: PreviewStats,
    worker: Option<thread::JoinHandle<()>>,
}

struct BackwardShaping {
    granularity: Frame,
    min_interval: Duration,
    force_jump: Frame,
    last_frame: Option<Frame>,
    last_accept: Option<Instant>,
}

impl BackwardShaping {
    /// Quantize and throttle backward motion; forward motion passes through.
    /// Returns the frame to render, or None when throttled.
    fn shape(&mut self, frame: Frame, now: Instant) -> Option<Frame> {
        let prev = self.last_frame.replace(frame);
        let delta = match prev {
            Some(p) => frame - p,
            None => 0,
        };
        if delta >= 0 {
            // forward motion is never shaped and does not count against the
            // backward cadence
            return Some(frame);
        }

        let quantized = frame.div_euclid(self.granularity) * self.granularity;
        if delta.abs() >= self.force_jump {
            // a big jump back must land immediately, throttle or not
            self.last_accept = Some(now);
            return Some(quantized);
        }
        if let Some(last) = self.last_accept {
            if now.duration_since(last) < self.min_interval {
                return None;
            }
        }
        self.last_accept = Some(now);
        Some(quantized)
    }
}

impl FastScrub {
    pub fn new(
        factory: Arc<dyn RendererFactory>,
        sink: Arc<dyn FrameSink>,
        config: &PreviewConfig,
        stats: PreviewStats,
    ) -> Self {
        let (tx, rx) = unbounded();
        let mailbox: Mailbox = Arc::new(Mutex::new(None));
        let generation = Arc::new(AtomicU64::new(0));
        let overlay = Arc::new(Mutex::new(None));
        let prewarm = Arc::new(Mutex::new(PrewarmQueue::new(config)));

        let worker = Worker {
            factory,
            sink,
            mailbox: Arc::clone(&mailbox),
            generation: Arc::clone(&generation),
            overlay: Arc::clone(&overlay),
            prewarm: Arc::clone(&prewarm),
            stats: stats.clone(),
            preload_timeout: config.preload_timeout(),
        };
        let handle = thread::Builder::new()
            .name("preview-scrub".into())
            .spawn(move || worker.run(rx))
            .expect("failed to spawn fast-scrub worker thread");

        Self {
            commands: tx,
            mailbox,
            generation,
            overlay,
            prewarm,
            shaping: Mutex::new(BackwardShaping {
                granularity: config.backward_granularity.max(1),
                min_interval: config.backward_min_interval(),
                force_jump: config.backward_force_jump,
                last_frame: None,
                last_accept: None,
            }),
            backward_fallback: config.backward_fallback,
            stats,
            worker: Some(handle),
        }
    }

    /// Request a priority render of `frame`. Overwrites any not-yet-rendered
    /// request and drops pending speculative work, which is stale the moment
    /// the playhead moves.
    pub fn request(&self, frame: Frame) -> RequestOutcome {
        let now = Instant::now();
        let mut shaping = self.shaping.lock();
        let backward = shaping
            .last_frame
            .map(|prev| frame < prev)
            .unwrap_or(false);
        if backward && self.backward_fallback {
            shaping.last_frame = Some(frame);
            return RequestOutcome::Fallback;
        }
        let Some(shaped) = shaping.shape(frame, now) else {
            self.stats.scrub_throttled();
            return RequestOutcome::Throttled;
        };
        drop(shaping);

        self.prewarm.lock().clear();
        *self.mailbox.lock() = Some(PriorityRequest {
            frame: shaped,
            requested: frame,
            generation: self.generation.load(Ordering::SeqCst),
        });
        RequestOutcome::Accepted
    }

    /// Queue speculative neighbors/boundaries around the current position.
    pub fn plan_prewarm(
        &self,
        sequence: &timeline::Sequence,
        anchor_frame: Frame,
        scrub_direction: i32,
        step_frames: Frame,
    ) {
        self.prewarm
            .lock()
            .plan(sequence, anchor_frame, scrub_direction, step_frames, Instant::now());
    }

    /// Pull a queued source keep-alive touch, if any.
    pub fn pop_source_touch(&self) -> Option<String> {
        self.prewarm.lock().pop_source()
    }

    /// Push updated props (new resolved URLs, new quality) without a rebuild.
    pub fn set_props(&self, props: CompositionProps) {
        let _ = self.commands.send(Command::SetProps(props));
    }

    /// Tear down and reconstruct the renderer for a new composition shape.
    pub fn rebuild(&self, props: CompositionProps) {
        self.invalidate();
        let _ = self.commands.send(Command::Rebuild(props));
    }

    /// Invalidate all in-flight and future-presented work from the previous
    /// interaction; called when scrubbing ends, playback starts, or a gizmo
    /// drag begins.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.mailbox.lock() = None;
        self.prewarm.lock().clear();
        *self.overlay.lock() = None;
        let mut shaping = self.shaping.lock();
        shaping.last_frame = None;
        shaping.last_accept = None;
    }

    /// The requested anchor the overlay currently answers for, if it belongs
    /// to the live interaction generation. Reported as requested rather than
    /// as rendered so quantized backward renders still satisfy the gate.
    pub fn rendered_frame(&self) -> Option<Frame> {
        let current = self.generation.load(Ordering::SeqCst);
        let overlay = *self.overlay.lock();
        overlay
            .filter(|o| o.generation == current)
            .map(|o| o.requested)
    }
}

impl Drop for FastScrub {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    factory: Arc<dyn RendererFactory>,
    sink: Arc<dyn FrameSink>,
    mailbox: Mailbox,
    generation: Arc<AtomicU64>,
    overlay: Arc<Mutex<Option<RenderedOverlay>>>,
    prewarm: Arc<Mutex<PrewarmQueue>>,
    stats: PreviewStats,
    preload_timeout: Duration,
}

impl Worker {
    fn run(self, commands: Receiver<Command>) {
        let mut renderer: Option<Box<dyn CompositionRenderer>> = None;
        let mut props: Option<CompositionProps> = None;
        // renderer still preloading past the timeout; polled until it lands
        let mut late_renderer: Option<Receiver<Box<dyn CompositionRenderer>>> = None;

        loop {
            let mut stop = false;
            for command in commands.try_iter() {
                match command {
                    Command::SetProps(next) => props = Some(next),
                    Command::Rebuild(next) => {
                        renderer = None;
                        late_renderer = None;
                        match self.build_renderer(&next) {
                            BuildOutcome::Ready(r) => renderer = Some(r),
                            BuildOutcome::StillPreloading(rx) => late_renderer = Some(rx),
                            BuildOutcome::Failed => {}
                        }
                        props = Some(next);
                    }
                    Command::Stop => stop = true,
                }
            }
            if stop {
                break;
            }

            if let Some(rx) = &late_renderer {
                if let Ok(r) = rx.try_recv() {
                    info!(target = "scrub", "renderer preload finished late");
                    renderer = Some(r);
                    late_renderer = None;
                }
            }

            // requests stay parked in the mailbox until the renderer is
            // ready; the overlay stays hidden and the primary player remains
            // visible underneath
            let (Some(r), Some(p)) = (renderer.as_mut(), props.as_ref()) else {
                thread::sleep(Duration::from_millis(4));
                continue;
            };
            match self.mailbox.lock().take() {
                Some(req) => self.render_priority(req, r.as_mut(), p),
                None => {
                    let next = self.prewarm.lock().pop_frame();
                    match next {
                        Some(frame) => {
                            if let Err(err) = r.prewarm_frame(p, frame) {
                                debug!(target = "scrub", frame, error = %err, "prewarm render failed");
                            } else {
                                self.stats.scrub_prewarm_renders();
                            }
                        }
                        None => thread::sleep(Duration::from_millis(4)),
                    }
                }
            }
        }
    }

    fn render_priority(
        &self,
        req: PriorityRequest,
        renderer: &mut dyn CompositionRenderer,
        props: &CompositionProps,
    ) {
        match renderer.render_frame(props, req.frame) {
            Ok(buffer) => {
                // the interaction may have ended while we rendered
                if self.generation.load(Ordering::SeqCst) != req.generation {
                    self.stats.scrub_stale_drops();
                    debug!(target = "scrub", error = %PreviewError::StaleRender(req.frame), "dropping");
                    return;
                }
                *self.overlay.lock() = Some(RenderedOverlay {
                    requested: req.requested,
                    generation: req.generation,
                });
                self.sink.present(req.frame, buffer);
                self.stats.scrub_priority_renders();
            }
            Err(err) => {
                warn!(target = "scrub", frame = req.frame, error = %err, "priority render failed");
            }
        }
    }

    /// Construct and preload on a helper thread so a slow preload cannot
    /// stall scrub requests past the configured bound.
    fn build_renderer(&self, props: &CompositionProps) -> BuildOutcome {
        let (tx, rx) = bounded::<Box<dyn CompositionRenderer>>(1);
        let factory = Arc::clone(&self.factory);
        let build_props = props.clone();
        let spawned = thread::Builder::new()
            .name("preview-scrub-preload".into())
            .spawn(move || {
                let mut renderer = match factory.create(&build_props) {
                    Ok(r) => r,
                    Err(err) => {
                        let err = PreviewError::Renderer(err.to_string());
                        warn!(target = "scrub", error = %err, "renderer construction failed");
                        return;
                    }
                };
                if let Err(err) = renderer.preload(&build_props) {
                    warn!(target = "scrub", error = %err, "renderer preload failed, continuing cold");
                }
                let _ = tx.send(renderer);
            });
        if spawned.is_err() {
            return BuildOutcome::Failed;
        }
        match rx.recv_timeout(self.preload_timeout) {
            Ok(renderer) => BuildOutcome::Ready(renderer),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                warn!(
                    target = "scrub",
                    timeout_ms = self.preload_timeout.as_millis() as u64,
                    "renderer preload exceeded bound, first scrub renders degraded"
                );
                BuildOutcome::StillPreloading(rx)
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => BuildOutcome::Failed,
        }
    }
}

enum BuildOutcome {
    Ready(Box<dyn CompositionRenderer>),
    StillPreloading(Receiver<Box<dyn CompositionRenderer>>),
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrub::FrameBuffer;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    struct TestRenderer {
        renders: Arc<Mutex<Vec<Frame>>>,
        prewarms: Arc<AtomicU32>,
        render_delay: Duration,
    }

    impl CompositionRenderer for TestRenderer {
        fn preload(&mut self, _props: &CompositionProps) -> anyhow::Result<()> {
            Ok(())
        }

        fn render_frame(&mut self, _props: &CompositionProps, frame: Frame) -> anyhow::Result<FrameBuffer> {
            thread::sleep(self.render_delay);
            self.renders.lock().push(frame);
            Ok(FrameBuffer {
                width: 2,
                height: 2,
                pixels: vec![0; 16],
            })
        }

        fn prewarm_frame(&mut self, _props: &CompositionProps, _frame: Frame) -> anyhow::Result<()> {
            self.prewarms.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestFactory {
        renders: Arc<Mutex<Vec<Frame>>>,
        prewarms: Arc<AtomicU32>,
        render_delay: Duration,
    }

    impl RendererFactory for TestFactory {
        fn create(&self, _props: &CompositionProps) -> anyhow::Result<Box<dyn CompositionRenderer>> {
            Ok(Box::new(TestRenderer {
                renders: Arc::clone(&self.renders),
                prewarms: Arc::clone(&self.prewarms),
                render_delay: self.render_delay,
            }))
        }
    }

    #[derive(Default)]
    struct TestSink {
        presented: Arc<Mutex<Vec<Frame>>>,
    }

    impl FrameSink for TestSink {
        fn present(&self, frame: Frame, _buffer: FrameBuffer) {
            self.presented.lock().push(frame);
        }
    }

    fn props() -> CompositionProps {
        CompositionProps {
            sequence: Arc::new(timeline::Sequence::new(
                "seq",
                640,
                360,
                timeline::Fps::new(30, 1),
                600,
            )),
            resolved: Arc::new(HashMap::new()),
            quality: 1.0,
            target_width: 640,
            target_height: 360,
        }
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn scrub_with(config: &PreviewConfig) -> (FastScrub, Arc<Mutex<Vec<Frame>>>, Arc<Mutex<Vec<Frame>>>) {
        let factory = Arc::new(TestFactory::default());
        let renders = Arc::clone(&factory.renders);
        let sink = Arc::new(TestSink::default());
        let presented = Arc::clone(&sink.presented);
        let scrub = FastScrub::new(factory, sink, config, PreviewStats::new());
        scrub.rebuild(props());
        (scrub, renders, presented)
    }

    #[test]
    fn test_priority_render_reaches_sink() {
        let (scrub, _, presented) = scrub_with(&PreviewConfig::default());
        assert_eq!(scrub.request(48), RequestOutcome::Accepted);
        assert!(wait_until(2_000, || presented.lock().contains(&48)));
        assert_eq!(scrub.rendered_frame(), Some(48));
    }

    #[test]
    fn test_invalidate_hides_overlay() {
        let (scrub, _, presented) = scrub_with(&PreviewConfig::default());
        scrub.request(48);
        assert!(wait_until(2_000, || presented.lock().contains(&48)));
        scrub.invalidate();
        assert_eq!(scrub.rendered_frame(), None);
    }

    #[test]
    fn test_latest_request_wins() {
        let factory = Arc::new(TestFactory {
            render_delay: Duration::from_millis(40),
            ..TestFactory::default()
        });
        let renders = Arc::clone(&factory.renders);
        let sink = Arc::new(TestSink::default());
        let scrub = FastScrub::new(factory, sink, &PreviewConfig::default(), PreviewStats::new());
        scrub.rebuild(props());
        // rapid forward burst: intermediate positions overwrite each other
        for frame in [10, 20, 30, 40, 50] {
            scrub.request(frame);
        }
        assert!(wait_until(3_000, || renders.lock().contains(&50)));
        let rendered = renders.lock().clone();
        assert!(rendered.len() < 5, "expected coalescing, got {rendered:?}");
        assert_eq!(rendered.last(), Some(&50));
    }

    #[test]
    fn test_backward_quantize_and_throttle() {
        let (scrub, _, presented) = scrub_with(&PreviewConfig::default());
        scrub.request(100);
        assert!(wait_until(2_000, || presented.lock().contains(&100)));
        // first backward move: quantized to granularity 3
        assert_eq!(scrub.request(98), RequestOutcome::Accepted);
        // immediate second backward move inside the 90ms window: throttled
        assert_eq!(scrub.request(95), RequestOutcome::Throttled);
        assert!(wait_until(2_000, || presented.lock().contains(&96)));
    }

    #[test]
    fn test_backward_quantized_render_reports_requested_anchor() {
        let (scrub, _, presented) = scrub_with(&PreviewConfig::default());
        scrub.request(100);
        assert!(wait_until(2_000, || presented.lock().contains(&100)));
        // 97 quantizes to 96; the overlay must still answer for 97 or the
        // gate never opens on off-granularity backward anchors
        assert_eq!(scrub.request(97), RequestOutcome::Accepted);
        assert!(wait_until(2_000, || presented.lock().contains(&96)));
        assert_eq!(scrub.rendered_frame(), Some(97));
    }

    #[test]
    fn test_backward_force_jump_bypasses_throttle() {
        let (scrub, _, _) = scrub_with(&PreviewConfig::default());
        scrub.request(200);
        assert_eq!(scrub.request(197), RequestOutcome::Accepted);
        // 100+ frames back within the throttle window still lands
        assert_eq!(scrub.request(90), RequestOutcome::Accepted);
    }

    #[test]
    fn test_backward_fallback_defers_to_player() {
        let mut cfg = PreviewConfig::default();
        cfg.backward_fallback = true;
        let (scrub, _, _) = scrub_with(&cfg);
        assert_eq!(scrub.request(100), RequestOutcome::Accepted);
        assert_eq!(scrub.request(90), RequestOutcome::Fallback);
        // forward motion still uses the fast path
        assert_eq!(scrub.request(110), RequestOutcome::Accepted);
    }

    #[test]
    fn test_prewarm_runs_when_idle_and_clears_on_request() {
        let mut seq = timeline::Sequence::new("seq", 640, 360, timeline::Fps::new(30, 1), 600);
        let v1 = seq.add_track(timeline::Track::new("V1"));
        seq.add_item(
            v1,
            timeline::Item::new(
                0,
                240,
                timeline::ItemKind::Video {
                    media_id: "m1".into(),
                    in_offset_frames: 0,
                },
            ),
        )
        .unwrap();

        let factory = Arc::new(TestFactory::default());
        let prewarms = Arc::clone(&factory.prewarms);
        let sink = Arc::new(TestSink::default());
        let scrub = FastScrub::new(factory, sink, &PreviewConfig::default(), PreviewStats::new());
        scrub.rebuild(props());
        scrub.plan_prewarm(&seq, 100, 1, 3);
        assert!(wait_until(2_000, || prewarms.load(Ordering::SeqCst) > 0));
        assert_eq!(scrub.pop_source_touch(), Some("m1".to_string()));
    }
}

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use timeline::{Frame, Sequence};

use crate::config::PreviewConfig;

/// Speculative work queued behind priority scrub renders: nearby frames to
/// pre-render and sources to touch so their decoders stay responsive. Both
/// queues are bounded FIFOs; when full, the oldest (least relevant) entries
/// fall off first.
pub struct PrewarmQueue {
    frames: VecDeque<Frame>,
    queued_frames: HashSet<Frame>,
    sources: VecDeque<String>,
    queued_sources: HashSet<String>,
    last_source_touch: HashMap<String, Instant>,
    ahead_steps: u32,
    behind_steps: u32,
    boundary_window_seconds: i64,
    source_cooldown: Duration,
    max_frames: usize,
    max_sources: usize,
}

impl PrewarmQueue {
    pub fn new(config: &PreviewConfig) -> Self {
        Self {
            frames: VecDeque::new(),
            queued_frames: HashSet::new(),
            sources: VecDeque::new(),
            queued_sources: HashSet::new(),
            last_source_touch: HashMap::new(),
            ahead_steps: config.prewarm_ahead_steps,
            behind_steps: config.prewarm_behind_steps,
            boundary_window_seconds: config.boundary_window_seconds,
            source_cooldown: config.source_touch_cooldown(),
            max_frames: config.prewarm_max_frames,
            max_sources: config.prewarm_max_sources,
        }
    }

    /// Rebuild speculative targets around a new scrub position: stepped
    /// neighbors biased in the direction of travel, clip boundaries within
    /// the boundary window, and cooldown-limited touches for the sources
    /// visible at those frames.
    pub fn plan(
        &mut self,
        sequence: &Sequence,
        anchor_frame: Frame,
        scrub_direction: i32,
        step_frames: Frame,
        now: Instant,
    ) {
        let step = step_frames.max(1);
        let sign: Frame = if scrub_direction < 0 { -1 } else { 1 };

        for i in 1..=self.ahead_steps as Frame {
            self.push_frame(anchor_frame + sign * i * step);
        }
        for i in 1..=self.behind_steps as Frame {
            self.push_frame(anchor_frame - sign * i * step);
        }

        let fps = sequence.fps.rounded().max(1);
        let radius = fps * self.boundary_window_seconds;
        for boundary in sequence.boundaries_near(anchor_frame, radius) {
            // the first frame of a clip is the one a scrub lands on hardest
            self.push_frame(boundary.frame);
        }

        for id in sequence.media_ids_in(anchor_frame - radius, anchor_frame + radius + 1) {
            self.push_source(id, now);
        }
    }

    fn push_frame(&mut self, frame: Frame) {
        if frame < 0 || !self.queued_frames.insert(frame) {
            return;
        }
        self.frames.push_back(frame);
        while self.frames.len() > self.max_frames {
            if let Some(evicted) = self.frames.pop_front() {
                self.queued_frames.remove(&evicted);
            }
        }
    }

    fn push_source(&mut self, media_id: String, now: Instant) {
        if let Some(last) = self.last_source_touch.get(&media_id) {
            if now.duration_since(*last) < self.source_cooldown {
                return;
            }
        }
        if !self.queued_sources.insert(media_id.clone()) {
            return;
        }
        self.last_source_touch.insert(media_id.clone(), now);
        self.sources.push_back(media_id);
        while self.sources.len() > self.max_sources {
            if let Some(evicted) = self.sources.pop_front() {
                self.queued_sources.remove(&evicted);
            }
        }
    }

    /// Next speculative frame to render, oldest queued first.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop_front()?;
        self.queued_frames.remove(&frame);
        Some(frame)
    }

    /// Next source wanting a keep-alive touch.
    pub fn pop_source(&mut self) -> Option<String> {
        let id = self.sources.pop_front()?;
        self.queued_sources.remove(&id);
        Some(id)
    }

    pub fn frame_len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.sources.is_empty()
    }

    /// Drop all speculative work; a new priority request makes it stale.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.queued_frames.clear();
        self.sources.clear();
        self.queued_sources.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timeline::{Fps, Item, ItemKind, Track};

    fn sequence_with_cut() -> Sequence {
        let mut seq = Sequence::new("seq", 1280, 720, Fps::new(30, 1), 600);
        let v1 = seq.add_track(Track::new("V1"));
        seq.add_item(
            v1,
            Item::new(
                0,
                120,
                ItemKind::Video {
                    media_id: "m1".into(),
                    in_offset_frames: 0,
                },
            ),
        )
        .unwrap();
        seq.add_item(
            v1,
            Item::new(
                120,
                120,
                ItemKind::Video {
                    media_id: "m2".into(),
                    in_offset_frames: 0,
                },
            ),
        )
        .unwrap();
        seq
    }

    fn queue() -> PrewarmQueue {
        PrewarmQueue::new(&PreviewConfig::default())
    }

    #[test]
    fn test_directional_neighbors() {
        let seq = sequence_with_cut();
        let mut q = queue();
        q.plan(&seq, 400, 1, 3, Instant::now());
        let mut frames = Vec::new();
        while let Some(f) = q.pop_frame() {
            frames.push(f);
        }
        // 4 steps ahead, 2 behind, step 3; no boundaries near 400
        assert_eq!(frames, vec![403, 406, 409, 412, 397, 394]);
    }

    #[test]
    fn test_backward_direction_flips_bias() {
        let seq = sequence_with_cut();
        let mut q = queue();
        q.plan(&seq, 400, -1, 3, Instant::now());
        let mut frames = Vec::new();
        while let Some(f) = q.pop_frame() {
            frames.push(f);
        }
        assert_eq!(frames, vec![397, 394, 391, 388, 403, 406]);
    }

    #[test]
    fn test_boundary_frames_queued_near_cut() {
        let seq = sequence_with_cut();
        let mut q = queue();
        // anchor 100, cut at 120 is within the 2s (60 frame) window
        q.plan(&seq, 100, 1, 1, Instant::now());
        let mut frames = Vec::new();
        while let Some(f) = q.pop_frame() {
            frames.push(f);
        }
        assert!(frames.contains(&120));
        // item start at 0 is outside the window
        assert!(!frames.contains(&0));
    }

    #[test]
    fn test_negative_frames_skipped() {
        let seq = sequence_with_cut();
        let mut q = queue();
        q.plan(&seq, 2, -1, 3, Instant::now());
        let mut frames = Vec::new();
        while let Some(f) = q.pop_frame() {
            frames.push(f);
        }
        assert!(frames.iter().all(|f| *f >= 0));
    }

    #[test]
    fn test_frame_cap_evicts_oldest() {
        let mut cfg = PreviewConfig::default();
        cfg.prewarm_max_frames = 4;
        let seq = sequence_with_cut();
        let mut q = PrewarmQueue::new(&cfg);
        q.plan(&seq, 400, 1, 3, Instant::now());
        assert_eq!(q.frame_len(), 4);
        // oldest queued frames fell off; newest survivors remain in order
        assert_eq!(q.pop_frame(), Some(409));
    }

    #[test]
    fn test_source_touch_cooldown() {
        let seq = sequence_with_cut();
        let mut q = queue();
        let t0 = Instant::now();
        q.plan(&seq, 110, 1, 1, t0);
        assert_eq!(q.pop_source(), Some("m1".to_string()));
        assert_eq!(q.pop_source(), Some("m2".to_string()));
        // within cooldown: no re-touch
        q.plan(&seq, 112, 1, 1, t0 + Duration::from_millis(500));
        assert_eq!(q.pop_source(), None);
        // after cooldown: touched again
        q.plan(&seq, 114, 1, 1, t0 + Duration::from_millis(1_600));
        assert_eq!(q.pop_source(), Some("m1".to_string()));
    }

    #[test]
    fn test_clear_drops_everything() {
        let seq = sequence_with_cut();
        let mut q = queue();
        q.plan(&seq, 100, 1, 3, Instant::now());
        assert!(!q.is_empty());
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.pop_frame(), None);
    }
}

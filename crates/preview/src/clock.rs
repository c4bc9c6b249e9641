use std::time::Instant;

use timeline::Frame;

/// Monotonic playback clock anchored in frames. Re-anchors on every
/// play/pause/seek/rate change so derived positions never jump.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    playing: bool,
    rate: f64, // 1.0 = normal
    fps: f64,
    anchor_instant: Option<Instant>,
    anchor_frame: Frame,
}

impl PlaybackClock {
    pub fn new(fps: f64) -> Self {
        Self {
            playing: false,
            rate: 1.0,
            fps,
            anchor_instant: None,
            anchor_frame: 0,
        }
    }

    pub fn play(&mut self, current_frame: Frame) {
        self.playing = true;
        self.anchor_frame = current_frame;
        self.anchor_instant = Some(Instant::now());
    }

    pub fn pause(&mut self, current_frame: Frame) {
        self.playing = false;
        self.anchor_frame = current_frame;
        self.anchor_instant = None;
    }

    pub fn set_rate(&mut self, rate: f64, current_frame: Frame) {
        // re-anchor to avoid jumps
        self.anchor_frame = current_frame;
        self.anchor_instant = Some(Instant::now());
        self.rate = rate;
    }

    pub fn seek_to(&mut self, frame: Frame) {
        self.anchor_frame = frame;
        if self.playing {
            self.anchor_instant = Some(Instant::now());
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Frame the playhead should be at right now.
    pub fn expected_frame(&self) -> Frame {
        match (self.playing, self.anchor_instant) {
            (true, Some(anchor)) => {
                let dt = anchor.elapsed().as_secs_f64();
                self.anchor_frame + (dt * self.rate * self.fps).floor() as Frame
            }
            _ => self.anchor_frame,
        }
    }

    /// How far the reported position lags the wall clock; positive means the
    /// player is behind.
    pub fn drift_frames(&self, reported_frame: Frame) -> Frame {
        self.expected_frame() - reported_frame
    }
}

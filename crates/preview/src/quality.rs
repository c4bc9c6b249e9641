use crate::config::PreviewConfig;
use crate::telemetry::PreviewStats;
use tracing::info;

/// Resolution multipliers the adaptive controller may step through.
pub const QUALITY_LADDER: [f32; 3] = [1.0, 0.5, 0.25];

/// Wall-clock budget for one frame at the given rate, in milliseconds.
pub fn frame_budget_ms(fps: f64, rate: f64) -> f64 {
    let effective = (fps * rate.abs().max(0.01)).max(1.0);
    1000.0 / effective
}

/// Watches per-frame render latency during playback and lowers an internal
/// resolution cap when the EMA stays over budget. Recovery is never automatic
/// within a session: the cap only returns to full on an explicit reset
/// (playback stop / play restart), which is what keeps the tiers from
/// flapping.
#[derive(Debug)]
pub struct AdaptiveQuality {
    enabled: bool,
    alpha: f64,
    over_samples_to_step: u32,
    cap_index: usize,
    frame_time_ema_ms: Option<f64>,
    over_budget_samples: u32,
    under_budget_samples: u32,
    stats: PreviewStats,
}

impl AdaptiveQuality {
    pub fn new(config: &PreviewConfig, stats: PreviewStats) -> Self {
        Self {
            enabled: config.adaptive_quality,
            alpha: config.quality_ema_alpha,
            over_samples_to_step: config.quality_over_budget_samples,
            cap_index: 0,
            frame_time_ema_ms: None,
            over_budget_samples: 0,
            under_budget_samples: 0,
            stats,
        }
    }

    pub fn cap(&self) -> f32 {
        if self.enabled {
            QUALITY_LADDER[self.cap_index]
        } else {
            1.0
        }
    }

    /// Effective quality is always the stricter of the user's request and
    /// the adaptive cap.
    pub fn effective(&self, user_requested: f32) -> f32 {
        user_requested.min(self.cap())
    }

    pub fn frame_time_ema_ms(&self) -> Option<f64> {
        self.frame_time_ema_ms
    }

    /// Consecutive in-budget samples since the last over-budget one. Input
    /// for an explicit recovery pass; never drives automatic upgrades.
    pub fn under_budget_run(&self) -> u32 {
        self.under_budget_samples
    }

    /// Feed one observation: `elapsed_ms` wall time over `frames_advanced`
    /// frames. Normalizing by the advance count keeps a dropped/skipped frame
    /// from registering as one enormous slow frame.
    pub fn note_frame_advance(&mut self, elapsed_ms: f64, frames_advanced: i64, budget_ms: f64) {
        if !self.enabled || frames_advanced <= 0 || elapsed_ms <= 0.0 {
            return;
        }
        let per_frame = elapsed_ms / frames_advanced as f64;
        let ema = match self.frame_time_ema_ms {
            Some(prev) => prev + self.alpha * (per_frame - prev),
            None => per_frame,
        };
        self.frame_time_ema_ms = Some(ema);

        if ema > budget_ms {
            self.over_budget_samples += 1;
            self.under_budget_samples = 0;
            if self.over_budget_samples >= self.over_samples_to_step {
                self.step_down(ema, budget_ms);
                self.over_budget_samples = 0;
            }
        } else {
            self.under_budget_samples += 1;
            self.over_budget_samples = 0;
        }
    }

    fn step_down(&mut self, ema: f64, budget_ms: f64) {
        if self.cap_index + 1 >= QUALITY_LADDER.len() {
            return;
        }
        self.cap_index += 1;
        self.stats.quality_downgrades();
        info!(
            target = "quality",
            cap = QUALITY_LADDER[self.cap_index],
            ema_ms = format!("{ema:.1}"),
            budget_ms = format!("{budget_ms:.1}"),
            "stepping preview quality down"
        );
    }

    /// Explicit recovery: full cap, fresh sampling state. Called when
    /// playback stops, when play restarts, and when the feature is disabled.
    pub fn reset(&mut self) {
        if self.cap_index != 0 {
            info!(target = "quality", "restoring preview quality cap to full");
        }
        self.cap_index = 0;
        self.frame_time_ema_ms = None;
        self.over_budget_samples = 0;
        self.under_budget_samples = 0;
    }

    /// Scale render-target dimensions by the effective quality. Even values
    /// keep chroma-subsampled uploads happy.
    pub fn scale_dims(&self, width: u32, height: u32, user_requested: f32) -> (u32, u32) {
        let q = self.effective(user_requested);
        let w = ((width as f32 * q).round() as u32).max(2) & !1;
        let h = ((height as f32 * q).round() as u32).max(2) & !1;
        (w.max(2), h.max(2))
    }

    /// Scale a size-dependent visual parameter (stroke width, blur radius,
    /// pixel-space keyframe value) by the same factor, so reduced quality
    /// changes sampling resolution but not apparent geometry.
    pub fn scale_value(&self, value: f64, user_requested: f32) -> f64 {
        value * self.effective(user_requested) as f64
    }
}

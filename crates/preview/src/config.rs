use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the preview pipeline. Durations are stored as milliseconds so
/// a config snapshot can round-trip through serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Worker pool size for media resolution.
    pub resolve_workers: usize,
    /// Backoff floor/ceiling for failed resolutions.
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive failures after which an id is surfaced as broken.
    pub broken_after: u32,

    /// Look-ahead span of the preload window, in seconds of timeline time.
    pub ahead_seconds: i64,
    /// Delay before running a heavy resolution pass while the user is
    /// mid-scrub and at least one URL is already resolved.
    pub scrub_defer_ms: u64,
    /// Frame-count multiplier applied to decode cost when scoring candidates.
    pub cost_penalty: f64,
    /// Max decode cost in the window above which the pass budget is halved.
    pub expensive_cost_threshold: f64,
    /// Extra scheduling passes fired after a paused ruler-click seek.
    pub paused_seek_burst_passes: u32,

    /// Warm-set caps: sources kept hot, total decode elements, sticky grace.
    pub warm_max_sources: usize,
    pub warm_max_elements: usize,
    pub warm_grace_ms: u64,
    /// Safety-net cadence for warm-set/scheduler refresh.
    pub periodic_refresh_ms: u64,

    /// Prewarm shaping: steps with/against scrub direction, boundary window,
    /// per-source touch cooldown, and queue caps.
    pub prewarm_ahead_steps: u32,
    pub prewarm_behind_steps: u32,
    pub boundary_window_seconds: i64,
    pub source_touch_cooldown_ms: u64,
    pub prewarm_max_frames: usize,
    pub prewarm_max_sources: usize,

    /// Backward-scrub shaping: frame quantization, minimum interval between
    /// renders, jump distance that bypasses the throttle, and an optional
    /// full fallback to the primary player's seek path.
    pub backward_granularity: i64,
    pub backward_min_interval_ms: u64,
    pub backward_force_jump: i64,
    pub backward_fallback: bool,

    /// Bounded-time renderer preload on (re)construction.
    pub preload_timeout_ms: u64,

    /// Adaptive quality: EMA smoothing, consecutive over-budget samples
    /// before stepping down, and a master switch.
    pub quality_ema_alpha: f64,
    pub quality_over_budget_samples: u32,
    pub adaptive_quality: bool,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            resolve_workers: default_resolve_workers(),
            backoff_min_ms: 400,
            backoff_max_ms: 8_000,
            broken_after: 8,
            ahead_seconds: 5,
            scrub_defer_ms: 40,
            cost_penalty: 10.0,
            expensive_cost_threshold: 6.0,
            paused_seek_burst_passes: 3,
            warm_max_sources: 8,
            warm_max_elements: 10,
            warm_grace_ms: 4_000,
            periodic_refresh_ms: 500,
            prewarm_ahead_steps: 4,
            prewarm_behind_steps: 2,
            boundary_window_seconds: 2,
            source_touch_cooldown_ms: 1_500,
            prewarm_max_frames: 24,
            prewarm_max_sources: 16,
            backward_granularity: 3,
            backward_min_interval_ms: 90,
            backward_force_jump: 30,
            backward_fallback: false,
            preload_timeout_ms: 1_500,
            quality_ema_alpha: 0.3,
            quality_over_budget_samples: 12,
            adaptive_quality: true,
        }
    }
}

fn default_resolve_workers() -> usize {
    (num_cpus::get() / 2).clamp(2, 6)
}

impl PreviewConfig {
    /// Defaults with `PREVIEW_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.resolve_workers = env_parse("PREVIEW_RESOLVE_WORKERS", cfg.resolve_workers);
        cfg.backoff_min_ms = env_parse("PREVIEW_BACKOFF_MIN_MS", cfg.backoff_min_ms);
        cfg.backoff_max_ms = env_parse("PREVIEW_BACKOFF_MAX_MS", cfg.backoff_max_ms);
        cfg.broken_after = env_parse("PREVIEW_BROKEN_AFTER", cfg.broken_after);
        cfg.ahead_seconds = env_parse("PREVIEW_AHEAD_SECONDS", cfg.ahead_seconds);
        cfg.scrub_defer_ms = env_parse("PREVIEW_SCRUB_DEFER_MS", cfg.scrub_defer_ms);
        cfg.warm_max_sources = env_parse("PREVIEW_WARM_MAX_SOURCES", cfg.warm_max_sources);
        cfg.warm_max_elements = env_parse("PREVIEW_WARM_MAX_ELEMENTS", cfg.warm_max_elements);
        cfg.warm_grace_ms = env_parse("PREVIEW_WARM_GRACE_MS", cfg.warm_grace_ms);
        cfg.preload_timeout_ms = env_parse("PREVIEW_PRELOAD_TIMEOUT_MS", cfg.preload_timeout_ms);
        cfg.backward_fallback = env_parse("PREVIEW_BACKWARD_FALLBACK", cfg.backward_fallback);
        cfg.adaptive_quality = env_parse("PREVIEW_ADAPTIVE_QUALITY", cfg.adaptive_quality);
        cfg
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn scrub_defer(&self) -> Duration {
        Duration::from_millis(self.scrub_defer_ms)
    }

    pub fn warm_grace(&self) -> Duration {
        Duration::from_millis(self.warm_grace_ms)
    }

    pub fn periodic_refresh(&self) -> Duration {
        Duration::from_millis(self.periodic_refresh_ms)
    }

    pub fn source_touch_cooldown(&self) -> Duration {
        Duration::from_millis(self.source_touch_cooldown_ms)
    }

    pub fn backward_min_interval(&self) -> Duration {
        Duration::from_millis(self.backward_min_interval_ms)
    }

    pub fn preload_timeout(&self) -> Duration {
        Duration::from_millis(self.preload_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

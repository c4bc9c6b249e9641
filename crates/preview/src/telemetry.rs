use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct StatsSnapshot {
    pub resolve_attempts: u64,
    pub resolve_successes: u64,
    pub resolve_failures: u64,
    pub resolve_deduped: u64,
    pub resolve_passes: u64,
    pub broken_media: u64,
    pub warm_opens: u64,
    pub warm_reuses: u64,
    pub warm_evictions: u64,
    pub scrub_priority_renders: u64,
    pub scrub_prewarm_renders: u64,
    pub scrub_stale_drops: u64,
    pub scrub_throttled: u64,
    pub quality_downgrades: u64,
}

/// Shared diagnostic counters for the whole preview instance. Cheap to
/// clone; all paths bump these so the HUD can answer "what is the pipeline
/// doing" without a debugger.
#[derive(Debug, Clone, Default)]
pub struct PreviewStats(Arc<Mutex<StatsSnapshot>>);

macro_rules! bump {
    ($name:ident) => {
        pub fn $name(&self) {
            self.0.lock().$name += 1;
        }
    };
}

impl PreviewStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.0.lock()
    }

    bump!(resolve_attempts);
    bump!(resolve_successes);
    bump!(resolve_failures);
    bump!(resolve_deduped);
    bump!(resolve_passes);
    bump!(broken_media);
    bump!(warm_opens);
    bump!(warm_reuses);
    bump!(warm_evictions);
    bump!(scrub_priority_renders);
    bump!(scrub_prewarm_renders);
    bump!(scrub_stale_drops);
    bump!(scrub_throttled);
    bump!(quality_downgrades);

    /// One-line diagnostic string for an on-screen overlay.
    pub fn hud(&self) -> String {
        let s = self.snapshot();
        format!(
            "resolve: passes {}  ok {}/{}  dedup {}  broken {}\nwarm: open {}  reuse {}  evict {}\nscrub: prio {}  prewarm {}  stale {}  throttled {}\nquality: downgrades {}",
            s.resolve_passes,
            s.resolve_successes,
            s.resolve_attempts,
            s.resolve_deduped,
            s.broken_media,
            s.warm_opens,
            s.warm_reuses,
            s.warm_evictions,
            s.scrub_priority_renders,
            s.scrub_prewarm_renders,
            s.scrub_stale_drops,
            s.scrub_throttled,
            s.quality_downgrades,
        )
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            target = "preview_stats",
            resolve_attempts = s.resolve_attempts,
            resolve_successes = s.resolve_successes,
            resolve_failures = s.resolve_failures,
            scrub_priority_renders = s.scrub_priority_renders,
            scrub_stale_drops = s.scrub_stale_drops,
            quality_downgrades = s.quality_downgrades,
            "preview stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_hud() {
        let stats = PreviewStats::new();
        stats.resolve_attempts();
        stats.resolve_attempts();
        stats.resolve_successes();
        stats.scrub_stale_drops();
        let s = stats.snapshot();
        assert_eq!(s.resolve_attempts, 2);
        assert_eq!(s.resolve_successes, 1);
        assert_eq!(s.scrub_stale_drops, 1);
        let hud = stats.hud();
        assert!(hud.contains("ok 1/2"));
        assert!(hud.contains("stale 1"));
    }
}

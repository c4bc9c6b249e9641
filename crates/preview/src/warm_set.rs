use std::collections::HashMap;
use std::time::Instant;

use timeline::Frame;
use tracing::{debug, warn};

use crate::config::PreviewConfig;
use crate::resolve::ResolvedSource;
use crate::telemetry::PreviewStats;

/// An open decode pipeline for one source. Dropping the handle releases the
/// underlying decoder resources.
pub trait DecodeHandle: Send {
    fn media_id(&self) -> &str;
    /// Decoder elements this handle holds (e.g. one video + one audio = 2).
    fn element_count(&self) -> usize;
}

/// Opens decode handles for resolved sources. Opening is assumed to be the
/// expensive step the warm set exists to amortize.
pub trait DecodeHandleOpener: Send + Sync {
    fn open(&self, media_id: &str, source: &ResolvedSource) -> anyhow::Result<Box<dyn DecodeHandle>>;
}

/// A source the current preload window wants warm, ordered by how close its
/// first visible frame is to the anchor.
#[derive(Debug, Clone)]
pub struct WarmCandidate {
    pub media_id: String,
    pub distance_frames: Frame,
}

struct WarmEntry {
    handle: Box<dyn DecodeHandle>,
    /// Last time a refresh listed this source as wanted. Drives the sticky
    /// grace period and LRU eviction order.
    last_wanted: Instant,
}

/// Keeps the nearest sources' decoders open across refreshes. Bounded by a
/// source cap and a total-element cap; sources that fall out of the wanted
/// set linger for a grace period so a scrub that doubles back does not pay
/// the open cost twice.
pub struct SourceWarmSet {
    opener: Box<dyn DecodeHandleOpener>,
    entries: HashMap<String, WarmEntry>,
    max_sources: usize,
    max_elements: usize,
    grace: std::time::Duration,
    stats: PreviewStats,
}

impl SourceWarmSet {
    pub fn new(
        opener: Box<dyn DecodeHandleOpener>,
        config: &PreviewConfig,
        stats: PreviewStats,
    ) -> Self {
        Self {
            opener,
            entries: HashMap::new(),
            max_sources: config.warm_max_sources,
            max_elements: config.warm_max_elements,
            grace: config.warm_grace(),
            stats,
        }
    }

    /// Reconcile the warm set against the wanted candidates. Opens what is
    /// missing (and resolvable), refreshes what is still wanted, and evicts
    /// what has been unwanted past the grace period or overflows the caps.
    pub fn refresh(
        &mut self,
        candidates: &[WarmCandidate],
        resolved: &HashMap<String, ResolvedSource>,
        now: Instant,
    ) {
        let mut wanted = candidates.to_vec();
        wanted.sort_by_key(|c| c.distance_frames.abs());

        // nearest-first selection against both caps, opening as we go so the
        // element budget is charged with each handle's actual count
        let mut selected_ids: Vec<String> = Vec::new();
        let mut elements = 0usize;
        for candidate in &wanted {
            if selected_ids.len() >= self.max_sources {
                break;
            }
            let id = &candidate.media_id;
            if selected_ids.iter().any(|s| s == id) {
                continue;
            }
            if let Some(entry) = self.entries.get_mut(id) {
                if elements + entry.handle.element_count() > self.max_elements
                    && !selected_ids.is_empty()
                {
                    break;
                }
                elements += entry.handle.element_count();
                entry.last_wanted = now;
                self.stats.warm_reuses();
                selected_ids.push(id.clone());
                continue;
            }
            let Some(source) = resolved.get(id) else {
                continue; // not resolved yet; a later refresh will catch it
            };
            match self.opener.open(id, source) {
                Ok(handle) => {
                    let cost = handle.element_count();
                    if elements + cost > self.max_elements && !selected_ids.is_empty() {
                        // the handle turned out heavier than the remaining
                        // budget; dropping it here releases the decoder
                        debug!(target = "warm_set", media_id = %id, cost, "over element budget, not kept");
                        break;
                    }
                    elements += cost;
                    self.stats.warm_opens();
                    debug!(target = "warm_set", media_id = %id, "opened decode handle");
                    self.entries.insert(
                        id.clone(),
                        WarmEntry {
                            handle,
                            last_wanted: now,
                        },
                    );
                    selected_ids.push(id.clone());
                }
                Err(err) => {
                    warn!(target = "warm_set", media_id = %id, error = %err, "failed to open decode handle");
                }
            }
        }

        // unwanted entries survive within the grace window
        let grace = self.grace;
        let stats = self.stats.clone();
        self.entries.retain(|id, entry| {
            if selected_ids.iter().any(|s| s == id) {
                return true;
            }
            if now.duration_since(entry.last_wanted) < grace {
                return true;
            }
            stats.warm_evictions();
            debug!(target = "warm_set", media_id = %id, "evicting idle decode handle");
            false
        });

        self.evict_over_caps();
    }

    /// LRU eviction down to the caps; grace-kept stragglers go first because
    /// their `last_wanted` is oldest.
    fn evict_over_caps(&mut self) {
        while self.entries.len() > self.max_sources || self.element_count() > self.max_elements {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_wanted)
                .map(|(id, _)| id.clone());
            let Some(id) = oldest else { break };
            self.entries.remove(&id);
            self.stats.warm_evictions();
            debug!(target = "warm_set", media_id = %id, "evicting over cap");
        }
    }

    /// Bump recency for a source just used by a render.
    pub fn touch(&mut self, media_id: &str, now: Instant) {
        if let Some(entry) = self.entries.get_mut(media_id) {
            entry.last_wanted = now;
        }
    }

    pub fn contains(&self, media_id: &str) -> bool {
        self.entries.contains_key(media_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn element_count(&self) -> usize {
        self.entries.values().map(|e| e.handle.element_count()).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct FakeHandle {
        media_id: String,
        elements: usize,
    }

    impl DecodeHandle for FakeHandle {
        fn media_id(&self) -> &str {
            &self.media_id
        }
        fn element_count(&self) -> usize {
            self.elements
        }
    }

    struct FakeOpener {
        opens: Arc<AtomicU32>,
        elements: usize,
    }

    impl DecodeHandleOpener for FakeOpener {
        fn open(&self, media_id: &str, _source: &ResolvedSource) -> anyhow::Result<Box<dyn DecodeHandle>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeHandle {
                media_id: media_id.to_string(),
                elements: self.elements,
            }))
        }
    }

    fn warm_set(elements_per_source: usize) -> (SourceWarmSet, Arc<AtomicU32>) {
        let opens = Arc::new(AtomicU32::new(0));
        let opener = FakeOpener {
            opens: Arc::clone(&opens),
            elements: elements_per_source,
        };
        let set = SourceWarmSet::new(Box::new(opener), &PreviewConfig::default(), PreviewStats::new());
        (set, opens)
    }

    fn resolved_for(ids: &[&str]) -> HashMap<String, ResolvedSource> {
        ids.iter()
            .map(|id| (id.to_string(), ResolvedSource::original(format!("file:///{id}.mp4"))))
            .collect()
    }

    fn candidates(ids: &[&str]) -> Vec<WarmCandidate> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| WarmCandidate {
                media_id: id.to_string(),
                distance_frames: i as Frame * 10,
            })
            .collect()
    }

    #[test]
    fn test_opens_once_and_reuses() {
        let (mut set, opens) = warm_set(2);
        let resolved = resolved_for(&["a", "b"]);
        let now = Instant::now();
        set.refresh(&candidates(&["a", "b"]), &resolved, now);
        set.refresh(&candidates(&["a", "b"]), &resolved, now + Duration::from_millis(100));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_unresolved_sources_are_skipped() {
        let (mut set, opens) = warm_set(2);
        let resolved = resolved_for(&["a"]);
        set.refresh(&candidates(&["a", "pending"]), &resolved, Instant::now());
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(set.contains("a"));
        assert!(!set.contains("pending"));
    }

    #[test]
    fn test_grace_period_keeps_recently_wanted() {
        let (mut set, _) = warm_set(1);
        let resolved = resolved_for(&["a", "b"]);
        let t0 = Instant::now();
        set.refresh(&candidates(&["a"]), &resolved, t0);
        // "a" drops out of the wanted set but stays within grace
        set.refresh(&candidates(&["b"]), &resolved, t0 + Duration::from_secs(2));
        assert!(set.contains("a"));
        // past the 4s grace it goes
        set.refresh(&candidates(&["b"]), &resolved, t0 + Duration::from_secs(7));
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
    }

    #[test]
    fn test_source_cap_prefers_nearest() {
        let (mut set, _) = warm_set(1);
        let ids: Vec<String> = (0..12).map(|i| format!("m{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let resolved = resolved_for(&id_refs);
        // candidates ordered by distance already: m0 nearest
        set.refresh(&candidates(&id_refs), &resolved, Instant::now());
        // light 1-element handles fill the source cap, not a guessed budget
        assert_eq!(set.len(), 8);
        assert_eq!(set.element_count(), 8);
        assert!(set.contains("m0"));
        assert!(set.contains("m7"));
        assert!(!set.contains("m8"));
    }

    #[test]
    fn test_element_budget_shrinks_source_target() {
        // 4 elements per source against a 10-element budget: only 2 fit
        // before a third would overflow
        let (mut set, _) = warm_set(4);
        let resolved = resolved_for(&["a", "b", "c", "d"]);
        set.refresh(&candidates(&["a", "b", "c", "d"]), &resolved, Instant::now());
        assert_eq!(set.len(), 2);
        assert_eq!(set.element_count(), 8);
        // the open that overflowed the budget is not retained
        assert!(!set.contains("c"));
    }

    #[test]
    fn test_touch_updates_lru_order() {
        let (mut set, _) = warm_set(1);
        let resolved = resolved_for(&["a", "b"]);
        let t0 = Instant::now();
        set.refresh(&candidates(&["a", "b"]), &resolved, t0);
        set.touch("a", t0 + Duration::from_secs(10));
        // drop both from wanted, past grace relative to t0: "b" evicts,
        // "a" was touched recently enough to stay
        set.refresh(&[], &resolved, t0 + Duration::from_secs(11));
        assert!(set.contains("a"));
        assert!(!set.contains("b"));
    }
}

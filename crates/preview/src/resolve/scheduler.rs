use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use timeline::Frame;
use tracing::{debug, warn};

use crate::config::PreviewConfig;
use crate::error::PreviewError;
use crate::resolve::backoff::{BackoffPolicy, ResolutionEntry};
use crate::resolve::{lookup_proxy, MediaResolver, ResolvedSource};
use crate::telemetry::PreviewStats;

/// One media id the current preload window needs, with the nearest frame at
/// which it becomes visible.
#[derive(Debug, Clone)]
pub struct ResolveCandidate {
    pub media_id: String,
    pub nearest_frame: Frame,
}

/// A scheduling pass: the candidates inside the preload window plus enough
/// context to order them.
#[derive(Debug, Clone)]
pub struct ResolvePass {
    pub candidates: Vec<ResolveCandidate>,
    pub anchor_frame: Frame,
    pub scrub_direction: i32,
    /// Set while the user is mid-scrub and at least one URL is already
    /// resolved; the pass is delayed a beat so rapid playhead moves coalesce.
    pub deferrable: bool,
}

enum Command {
    Pass(ResolvePass),
    Invalidate(String),
    InvalidateAll,
    RetainReferenced(HashSet<String>),
    Shutdown,
}

struct Completion {
    media_id: String,
    /// Invalidation epoch captured at launch. A completion from before an
    /// invalidation must not republish the old URL.
    epoch: u64,
    result: anyhow::Result<Option<ResolvedSource>>,
}

/// Counting semaphore bounding concurrent resolver calls.
struct JobSemaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl JobSemaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    fn release(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }
}

struct SharedState {
    /// Published copy-on-write map; readers clone the Arc and never block
    /// the worker.
    resolved: Mutex<Arc<HashMap<String, ResolvedSource>>>,
    entries: Mutex<HashMap<String, ResolutionEntry>>,
    inflight: Mutex<HashSet<String>>,
}

/// Background scheduler that turns preload-window candidates into resolved
/// URLs. Deduplicates in-flight ids, bounds concurrency with a permit pool,
/// applies exponential backoff per id, and parks ids as broken after repeated
/// failure.
pub struct ResolveScheduler {
    commands: Sender<Command>,
    shared: Arc<SharedState>,
    policy: BackoffPolicy,
    worker: Option<thread::JoinHandle<()>>,
}

impl ResolveScheduler {
    pub fn new(
        resolver: Arc<dyn MediaResolver>,
        config: &PreviewConfig,
        stats: PreviewStats,
    ) -> Self {
        let (tx, rx) = unbounded();
        let shared = Arc::new(SharedState {
            resolved: Mutex::new(Arc::new(HashMap::new())),
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashSet::new()),
        });
        let policy = BackoffPolicy {
            min_delay: config.backoff_min(),
            max_delay: config.backoff_max(),
            broken_after: config.broken_after,
        };
        let worker = Worker {
            resolver,
            shared: Arc::clone(&shared),
            stats,
            policy,
            semaphore: Arc::new(JobSemaphore::new(config.resolve_workers.max(1))),
            cost_penalty: config.cost_penalty,
            expensive_cost_threshold: config.expensive_cost_threshold,
            pass_size: config.resolve_workers.max(1) * 2,
            scrub_defer: config.scrub_defer(),
        };
        let handle = thread::Builder::new()
            .name("preview-resolve".into())
            .spawn(move || worker.run(rx))
            .expect("failed to spawn resolve scheduler thread");
        Self {
            commands: tx,
            shared,
            policy,
            worker: Some(handle),
        }
    }

    pub fn request_pass(&self, pass: ResolvePass) {
        let _ = self.commands.send(Command::Pass(pass));
    }

    /// Latest published id -> source map. Cheap Arc clone; a new map is
    /// published wholesale on every change so holders never see tearing.
    pub fn resolved(&self) -> Arc<HashMap<String, ResolvedSource>> {
        Arc::clone(&self.shared.resolved.lock())
    }

    /// Ids parked after too many consecutive failures.
    pub fn broken_media(&self) -> Vec<String> {
        let entries = self.shared.entries.lock();
        let mut ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_broken(&self.policy))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Forget one id's URL and failure history so the next pass retries it
    /// from scratch (e.g. the asset was re-imported).
    pub fn invalidate(&self, media_id: &str) {
        let _ = self.commands.send(Command::Invalidate(media_id.to_string()));
    }

    pub fn invalidate_all(&self) {
        let _ = self.commands.send(Command::InvalidateAll);
    }

    /// Drop cached state for ids the sequence no longer references.
    pub fn retain_referenced(&self, referenced: HashSet<String>) {
        let _ = self.commands.send(Command::RetainReferenced(referenced));
    }
}

impl Drop for ResolveScheduler {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Order candidates nearest-first, penalized by decode cost and by lying
/// opposite the direction of travel.
pub fn score_candidates(
    candidates: &[ResolveCandidate],
    anchor_frame: Frame,
    scrub_direction: i32,
    cost_penalty: f64,
    cost_of: impl Fn(&str) -> f64,
) -> Vec<(f64, ResolveCandidate)> {
    let mut scored: Vec<(f64, ResolveCandidate)> = candidates
        .iter()
        .map(|c| {
            let delta = c.nearest_frame - anchor_frame;
            let mut score = delta.abs() as f64;
            score += cost_of(&c.media_id) * cost_penalty;
            let against_travel = (scrub_direction > 0 && delta < 0)
                || (scrub_direction < 0 && delta > 0);
            if against_travel {
                score += delta.abs() as f64;
            }
            (score, c.clone())
        })
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));
    scored
}

/// Attempts allowed in one pass; halved when the window contains expensive
/// media so heavyweight decodes do not pile up.
pub fn pass_budget(base: usize, max_cost_in_window: f64, expensive_threshold: f64) -> usize {
    if max_cost_in_window > expensive_threshold {
        (base / 2).max(1)
    } else {
        base.max(1)
    }
}

struct Worker {
    resolver: Arc<dyn MediaResolver>,
    shared: Arc<SharedState>,
    stats: PreviewStats,
    policy: BackoffPolicy,
    semaphore: Arc<JobSemaphore>,
    cost_penalty: f64,
    expensive_cost_threshold: f64,
    pass_size: usize,
    scrub_defer: Duration,
}

impl Worker {
    fn run(self, commands: Receiver<Command>) {
        let (done_tx, done_rx) = unbounded::<Completion>();
        let mut last_pass: Option<ResolvePass> = None;
        let mut deferred_until: Option<Instant> = None;
        // per-id invalidation epoch; bumping it fences out in-flight
        // resolutions launched before the invalidation
        let mut epochs: HashMap<String, u64> = HashMap::new();

        loop {
            let timeout = self.next_wake(&last_pass, deferred_until);
            match commands.recv_timeout(timeout) {
                Ok(Command::Pass(pass)) => {
                    // latest pass wins over a pending deferred one
                    let defer = pass.deferrable && !self.shared.resolved.lock().is_empty();
                    if defer {
                        deferred_until = Some(Instant::now() + self.scrub_defer);
                        last_pass = Some(pass);
                    } else {
                        deferred_until = None;
                        self.execute_pass(&pass, &epochs, &done_tx);
                        last_pass = Some(pass);
                    }
                }
                Ok(Command::Invalidate(id)) => {
                    self.remove_resolved(|key| key != id.as_str());
                    self.shared.entries.lock().remove(&id);
                    if self.shared.inflight.lock().remove(&id) {
                        *epochs.entry(id).or_insert(0) += 1;
                    }
                }
                Ok(Command::InvalidateAll) => {
                    *self.shared.resolved.lock() = Arc::new(HashMap::new());
                    self.shared.entries.lock().clear();
                    for id in self.shared.inflight.lock().drain() {
                        *epochs.entry(id).or_insert(0) += 1;
                    }
                }
                Ok(Command::RetainReferenced(keep)) => {
                    self.remove_resolved(|key| keep.contains(key));
                    self.shared.entries.lock().retain(|key, _| keep.contains(key));
                    let mut inflight = self.shared.inflight.lock();
                    let dropped: Vec<String> =
                        inflight.iter().filter(|id| !keep.contains(*id)).cloned().collect();
                    for id in dropped {
                        inflight.remove(&id);
                        *epochs.entry(id).or_insert(0) += 1;
                    }
                }
                Ok(Command::Shutdown) => break,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    // either a deferred pass came due or a backoff expired;
                    // both re-run the last pass
                    if let Some(pass) = last_pass.clone() {
                        deferred_until = None;
                        self.execute_pass(&pass, &epochs, &done_tx);
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }

            for completion in done_rx.try_iter() {
                self.apply_completion(completion, &epochs);
            }
        }
    }

    /// Sleep until the deferred pass or the earliest backoff deadline among
    /// the last pass's candidates, whichever comes first.
    fn next_wake(&self, last_pass: &Option<ResolvePass>, deferred_until: Option<Instant>) -> Duration {
        let now = Instant::now();
        let mut wake: Option<Instant> = deferred_until;
        if let Some(pass) = last_pass {
            let entries = self.shared.entries.lock();
            for candidate in &pass.candidates {
                if let Some(entry) = entries.get(&candidate.media_id) {
                    if entry.is_broken(&self.policy) {
                        continue;
                    }
                    if let Some(deadline) = entry.retry_after {
                        wake = Some(match wake {
                            Some(w) => w.min(deadline),
                            None => deadline,
                        });
                    }
                }
            }
        }
        match wake {
            Some(deadline) => deadline.saturating_duration_since(now).max(Duration::from_millis(5)),
            None => Duration::from_millis(100),
        }
    }

    fn remove_resolved(&self, keep: impl Fn(&str) -> bool) {
        let mut guard = self.shared.resolved.lock();
        let mut next: HashMap<String, ResolvedSource> = (**guard).clone();
        next.retain(|key, _| keep(key));
        *guard = Arc::new(next);
    }

    fn execute_pass(
        &self,
        pass: &ResolvePass,
        epochs: &HashMap<String, u64>,
        done_tx: &Sender<Completion>,
    ) {
        self.stats.resolve_passes();
        let now = Instant::now();
        let cost_of = |id: &str| {
            self.resolver
                .media_info(id)
                .map(|info| info.decode_cost())
                .unwrap_or(1.0)
        };
        let max_cost = pass
            .candidates
            .iter()
            .map(|c| cost_of(&c.media_id))
            .fold(0.0f64, f64::max);
        let budget = pass_budget(self.pass_size, max_cost, self.expensive_cost_threshold);

        let scored = score_candidates(
            &pass.candidates,
            pass.anchor_frame,
            pass.scrub_direction,
            self.cost_penalty,
            cost_of,
        );

        let mut launched = 0usize;
        for (_, candidate) in scored {
            if launched >= budget {
                break;
            }
            let id = candidate.media_id;
            if self.shared.resolved.lock().contains_key(&id) {
                continue;
            }
            {
                let entries = self.shared.entries.lock();
                if let Some(entry) = entries.get(&id) {
                    if !entry.is_retryable(&self.policy, now) {
                        continue;
                    }
                }
            }
            {
                let mut inflight = self.shared.inflight.lock();
                if !inflight.insert(id.clone()) {
                    self.stats.resolve_deduped();
                    continue;
                }
            }
            launched += 1;
            let epoch = epochs.get(&id).copied().unwrap_or(0);
            self.spawn_resolution(id, epoch, done_tx.clone());
        }
        if launched > 0 {
            debug!(target = "resolve", launched, budget, "resolution pass");
        }
    }

    fn spawn_resolution(&self, media_id: String, epoch: u64, done_tx: Sender<Completion>) {
        self.stats.resolve_attempts();
        let resolver = Arc::clone(&self.resolver);
        let semaphore = Arc::clone(&self.semaphore);
        let result = thread::Builder::new()
            .name(format!("resolve-{media_id}"))
            .spawn(move || {
                semaphore.acquire();
                let result = resolve_one(resolver.as_ref(), &media_id);
                semaphore.release();
                let _ = done_tx.send(Completion { media_id, epoch, result });
            });
        if let Err(err) = result {
            warn!(target = "resolve", error = %err, "failed to spawn resolution thread");
        }
    }

    fn apply_completion(&self, completion: Completion, epochs: &HashMap<String, u64>) {
        let Completion { media_id, epoch, result } = completion;
        if epochs.get(&media_id).copied().unwrap_or(0) != epoch {
            // launched before an invalidation; the result is stale and the
            // id was already released for relaunch
            debug!(target = "resolve", media_id = %media_id, "dropping pre-invalidation resolution");
            return;
        }
        self.shared.inflight.lock().remove(&media_id);
        match result {
            Ok(Some(source)) => {
                self.stats.resolve_successes();
                self.shared
                    .entries
                    .lock()
                    .entry(media_id.clone())
                    .or_default()
                    .mark_success();
                let mut guard = self.shared.resolved.lock();
                let mut next: HashMap<String, ResolvedSource> = (**guard).clone();
                next.insert(media_id, source);
                *guard = Arc::new(next);
            }
            Ok(None) => {
                self.note_failure(&media_id, "media id unknown to resolver");
            }
            Err(err) => {
                self.note_failure(&media_id, &err.to_string());
            }
        }
    }

    fn note_failure(&self, media_id: &str, reason: &str) {
        self.stats.resolve_failures();
        let mut entries = self.shared.entries.lock();
        let entry = entries.entry(media_id.to_string()).or_default();
        entry.mark_failure(&self.policy, Instant::now());
        if entry.is_broken(&self.policy) {
            self.stats.broken_media();
            let err = PreviewError::BrokenMedia {
                media_id: media_id.to_string(),
                failures: entry.failure_count,
            };
            warn!(target = "resolve", error = %err, "abandoning resolution");
        } else {
            let err = PreviewError::Resolution {
                media_id: media_id.to_string(),
                reason: reason.to_string(),
            };
            debug!(
                target = "resolve",
                error = %err,
                retry_in_ms = self
                    .policy
                    .delay_for(entry.failure_count)
                    .as_millis() as u64,
                "will retry"
            );
        }
    }
}

/// Prefer a scrub-friendly proxy rendition when one exists, either from the
/// resolver itself or the process-wide proxy registry.
fn resolve_one(
    resolver: &dyn MediaResolver,
    media_id: &str,
) -> anyhow::Result<Option<ResolvedSource>> {
    if let Some(url) = resolver.resolve_proxy_url(media_id)? {
        return Ok(Some(ResolvedSource::proxy(url)));
    }
    if let Some(url) = lookup_proxy(media_id) {
        return Ok(Some(ResolvedSource::proxy(url)));
    }
    Ok(resolver
        .resolve_media_url(media_id)?
        .map(ResolvedSource::original))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockResolver {
        urls: HashMap<String, String>,
        calls: AtomicU32,
        fail_ids: HashSet<String>,
    }

    impl MockResolver {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self {
                urls: entries
                    .iter()
                    .map(|(id, url)| (id.to_string(), url.to_string()))
                    .collect(),
                calls: AtomicU32::new(0),
                fail_ids: HashSet::new(),
            }
        }

        fn failing(ids: &[&str]) -> Self {
            let mut r = Self::new(&[]);
            r.fail_ids = ids.iter().map(|s| s.to_string()).collect();
            r
        }
    }

    impl MediaResolver for MockResolver {
        fn resolve_media_url(&self, media_id: &str) -> anyhow::Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_ids.contains(media_id) {
                anyhow::bail!("backend unavailable");
            }
            Ok(self.urls.get(media_id).cloned())
        }
    }

    fn test_config() -> PreviewConfig {
        let mut cfg = PreviewConfig::default();
        cfg.resolve_workers = 2;
        cfg.backoff_min_ms = 30;
        cfg.backoff_max_ms = 200;
        cfg.scrub_defer_ms = 10;
        cfg
    }

    fn pass_for(ids: &[&str]) -> ResolvePass {
        ResolvePass {
            candidates: ids
                .iter()
                .enumerate()
                .map(|(i, id)| ResolveCandidate {
                    media_id: id.to_string(),
                    nearest_frame: i as Frame * 10,
                })
                .collect(),
            anchor_frame: 0,
            scrub_direction: 0,
            deferrable: false,
        }
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn test_pass_resolves_candidates() {
        let resolver = Arc::new(MockResolver::new(&[("m1", "file:///m1.mp4")]));
        let stats = PreviewStats::new();
        let sched = ResolveScheduler::new(resolver.clone(), &test_config(), stats);
        sched.request_pass(pass_for(&["m1"]));
        assert!(wait_until(2_000, || sched.resolved().contains_key("m1")));
        assert_eq!(
            sched.resolved().get("m1").map(|s| s.url.clone()).as_deref(),
            Some("file:///m1.mp4")
        );
    }

    #[test]
    fn test_repeated_passes_do_not_re_resolve() {
        let resolver = Arc::new(MockResolver::new(&[("m1", "file:///m1.mp4")]));
        let sched = ResolveScheduler::new(resolver.clone(), &test_config(), PreviewStats::new());
        sched.request_pass(pass_for(&["m1"]));
        assert!(wait_until(2_000, || sched.resolved().contains_key("m1")));
        for _ in 0..5 {
            sched.request_pass(pass_for(&["m1"]));
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failures_back_off_then_break() {
        let resolver = Arc::new(MockResolver::failing(&["bad"]));
        let mut cfg = test_config();
        cfg.broken_after = 3;
        let sched = ResolveScheduler::new(resolver.clone(), &cfg, PreviewStats::new());
        sched.request_pass(pass_for(&["bad"]));
        assert!(wait_until(3_000, || sched.broken_media() == vec!["bad".to_string()]));
        let calls_at_break = resolver.calls.load(Ordering::SeqCst);
        assert_eq!(calls_at_break, 3);
        // broken ids are never retried by further passes
        sched.request_pass(pass_for(&["bad"]));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), calls_at_break);
    }

    #[test]
    fn test_invalidate_clears_url_and_history() {
        let resolver = Arc::new(MockResolver::new(&[("m1", "file:///m1.mp4")]));
        let sched = ResolveScheduler::new(resolver.clone(), &test_config(), PreviewStats::new());
        sched.request_pass(pass_for(&["m1"]));
        assert!(wait_until(2_000, || sched.resolved().contains_key("m1")));
        sched.invalidate("m1");
        assert!(wait_until(1_000, || !sched.resolved().contains_key("m1")));
        sched.request_pass(pass_for(&["m1"]));
        assert!(wait_until(2_000, || sched.resolved().contains_key("m1")));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    struct SlowSwitchingResolver {
        url: Mutex<String>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl MediaResolver for SlowSwitchingResolver {
        fn resolve_media_url(&self, _media_id: &str) -> anyhow::Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Ok(Some(self.url.lock().clone()))
        }
    }

    #[test]
    fn test_invalidate_mid_flight_drops_stale_resolution() {
        let resolver = Arc::new(SlowSwitchingResolver {
            url: Mutex::new("file:///old/m1.mp4".to_string()),
            delay: Duration::from_millis(150),
            calls: AtomicU32::new(0),
        });
        let sched = ResolveScheduler::new(resolver.clone(), &test_config(), PreviewStats::new());
        sched.request_pass(pass_for(&["m1"]));
        assert!(wait_until(1_000, || resolver.calls.load(Ordering::SeqCst) >= 1));
        // the asset is replaced while the first resolution is still running
        sched.invalidate("m1");
        *resolver.url.lock() = "file:///new/m1.mp4".to_string();
        // the slow first resolution must never republish the old URL, and
        // the id must re-enter the candidate pool and pick up the new one
        let deadline = Instant::now() + Duration::from_millis(1_500);
        let mut saw_new = false;
        while Instant::now() < deadline {
            if let Some(source) = sched.resolved().get("m1") {
                assert_ne!(source.url, "file:///old/m1.mp4");
                if source.url == "file:///new/m1.mp4" {
                    saw_new = true;
                    break;
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(saw_new);
    }

    #[test]
    fn test_retain_referenced_drops_stale_ids() {
        let resolver = Arc::new(MockResolver::new(&[
            ("m1", "file:///m1.mp4"),
            ("m2", "file:///m2.mp4"),
        ]));
        let sched = ResolveScheduler::new(resolver, &test_config(), PreviewStats::new());
        sched.request_pass(pass_for(&["m1", "m2"]));
        assert!(wait_until(2_000, || sched.resolved().len() == 2));
        sched.retain_referenced(HashSet::from(["m1".to_string()]));
        assert!(wait_until(1_000, || {
            let map = sched.resolved();
            map.contains_key("m1") && !map.contains_key("m2")
        }));
    }

    #[test]
    fn test_scoring_prefers_near_and_cheap() {
        let candidates = vec![
            ResolveCandidate { media_id: "far".into(), nearest_frame: 140 },
            ResolveCandidate { media_id: "near".into(), nearest_frame: 5 },
            ResolveCandidate { media_id: "near_heavy".into(), nearest_frame: 5 },
        ];
        let scored = score_candidates(&candidates, 0, 1, 10.0, |id| {
            if id == "near_heavy" { 12.0 } else { 1.0 }
        });
        let order: Vec<&str> = scored.iter().map(|(_, c)| c.media_id.as_str()).collect();
        assert_eq!(order, vec!["near", "near_heavy", "far"]);
    }

    #[test]
    fn test_scoring_penalizes_against_travel() {
        let candidates = vec![
            ResolveCandidate { media_id: "behind".into(), nearest_frame: -30 },
            ResolveCandidate { media_id: "ahead".into(), nearest_frame: 40 },
        ];
        let scored = score_candidates(&candidates, 0, 1, 0.0, |_| 0.0);
        assert_eq!(scored[0].1.media_id, "ahead");
    }

    #[test]
    fn test_pass_budget_halved_for_expensive_windows() {
        assert_eq!(pass_budget(4, 1.0, 6.0), 4);
        assert_eq!(pass_budget(4, 8.0, 6.0), 2);
        assert_eq!(pass_budget(1, 8.0, 6.0), 1);
    }
}

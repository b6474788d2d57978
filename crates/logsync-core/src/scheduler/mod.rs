//! Tiered sync scheduler.
//!
//! Decides which peers to ask the network about, and how often. Every tick
//! the known peers are bucketed into [`Tier`]s by recency of activity; each
//! tier then contributes a bounded batch, picked round-robin so that nobody
//! in a large tier starves. A per-tier minimum interval keeps any single
//! peer from being asked too often.
//!
//! "Asking about a peer" means enqueuing a request whose token is the peer's
//! identity: whoever holds that author's log answers with the latest
//! envelope.

mod tier;

pub use tier::{Tier, TierThresholds};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::error::{SyncError, SyncResult};
use crate::identity::PeerId;
use crate::queue::NetworkQueue;
use crate::storage::ContentStore;

/// How much of a tier may be requested per tick, and how often per peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub batch: usize,
    pub min_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    /// How often the known-peer set is reloaded from storage
    pub refresh_interval_ms: u64,
    /// Peers whose recency is seeded from storage on start
    pub bootstrap_limit: usize,
    pub thresholds: TierThresholds,
    pub hot: TierPolicy,
    pub warm: TierPolicy,
    pub cold: TierPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 15_000,
            refresh_interval_ms: 5 * 60_000,
            bootstrap_limit: 20,
            thresholds: TierThresholds::default(),
            hot: TierPolicy {
                batch: 4,
                min_interval_ms: 15_000,
            },
            warm: TierPolicy {
                batch: 2,
                min_interval_ms: 20 * 60_000,
            },
            cold: TierPolicy {
                batch: 1,
                min_interval_ms: 6 * 60 * 60_000,
            },
        }
    }
}

impl SchedulerConfig {
    pub fn policy(&self, tier: Tier) -> &TierPolicy {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.tick_interval_ms == 0 || self.refresh_interval_ms == 0 {
            return Err(SyncError::Config("scheduler intervals must be > 0".into()));
        }
        for tier in Tier::ALL {
            let policy = self.policy(tier);
            if policy.batch == 0 || policy.min_interval_ms == 0 {
                return Err(SyncError::Config(format!(
                    "scheduler {:?} tier needs a non-zero batch and interval",
                    tier
                )));
            }
        }
        Ok(())
    }
}

/// Peers per tier, for status display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
}

#[derive(Default)]
struct SchedulerState {
    known: Vec<PeerId>,
    known_set: HashSet<PeerId>,
    cursors: [usize; 3],
    /// (peer, last_requested) per tier, reused across ticks
    buckets: [Vec<(PeerId, u64)>; 3],
}

pub struct SyncScheduler {
    config: SchedulerConfig,
    local: PeerId,
    store: Arc<dyn ContentStore>,
    activity: Arc<ActivityTracker>,
    queue: Arc<NetworkQueue>,
    state: Mutex<SchedulerState>,
}

impl SyncScheduler {
    pub fn new(
        config: SchedulerConfig,
        local: PeerId,
        store: Arc<dyn ContentStore>,
        activity: Arc<ActivityTracker>,
        queue: Arc<NetworkQueue>,
    ) -> Self {
        Self {
            config,
            local,
            store,
            activity,
            queue,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Add a peer to the scheduled set. The local identity is ignored.
    pub fn track(&self, peer: &PeerId) -> bool {
        if *peer == self.local {
            return false;
        }
        let mut state = self.state.lock();
        if state.known_set.insert(*peer) {
            state.known.push(*peer);
            true
        } else {
            false
        }
    }

    /// Pull every author with a stored log into the known set.
    ///
    /// Returns the number of newly tracked peers.
    pub fn refresh_peers(&self) -> usize {
        let authors = match self.store.authors() {
            Ok(authors) => authors,
            Err(e) => {
                warn!(error = %e, "Could not list authors for peer refresh");
                return 0;
            }
        };
        let added = authors.iter().filter(|peer| self.track(peer)).count();
        if added > 0 {
            debug!(added, known = self.known_count(), "Known peers refreshed");
        }
        added
    }

    /// Seed recency for peers we have never seen this session, from the
    /// timestamp of their latest stored envelope.
    pub fn bootstrap(&self) -> usize {
        let candidates: Vec<PeerId> = self
            .state
            .lock()
            .known
            .iter()
            .filter(|peer| !self.activity.contains(peer))
            .take(self.config.bootstrap_limit)
            .copied()
            .collect();

        let mut seeded = 0;
        for peer in candidates {
            match self.store.latest(&peer) {
                Ok(Some(entry)) => {
                    self.activity.note_seen(&peer, entry.timestamp);
                    seeded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(peer = %peer, error = %e, "Could not read latest entry"),
            }
        }
        seeded
    }

    pub fn known_count(&self) -> usize {
        self.state.lock().known.len()
    }

    /// How many tracked peers fall in each tier at `now`.
    pub fn tier_counts(&self, now: u64) -> TierCounts {
        let known = self.state.lock().known.clone();
        let mut counts = TierCounts::default();
        for peer in &known {
            match self.config.thresholds.classify(&self.activity.get(peer), now) {
                Tier::Hot => counts.hot += 1,
                Tier::Warm => counts.warm += 1,
                Tier::Cold => counts.cold += 1,
            }
        }
        counts
    }

    /// Run one scheduling round at `now` (unix ms) and enqueue the chosen
    /// requests. Returns the peers requested, hot first.
    pub fn tick(&self, now: u64) -> Vec<PeerId> {
        let mut selected = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            for bucket in state.buckets.iter_mut() {
                bucket.clear();
            }
            for peer in &state.known {
                let entry = self.activity.get(peer);
                let tier = self.config.thresholds.classify(&entry, now);
                state.buckets[tier.index()].push((*peer, entry.last_requested));
            }

            for tier in Tier::ALL {
                let i = tier.index();
                let policy = self.config.policy(tier);
                let bucket = &state.buckets[i];
                if bucket.is_empty() {
                    continue;
                }

                let n = bucket.len();
                let start = state.cursors[i] % n;
                let mut examined = 0;
                let mut picked = 0;
                while examined < n && picked < policy.batch {
                    let (peer, last_requested) = bucket[(start + examined) % n];
                    examined += 1;
                    if last_requested > 0 && now.saturating_sub(last_requested) < policy.min_interval_ms
                    {
                        continue;
                    }
                    selected.push(peer);
                    picked += 1;
                }
                state.cursors[i] = (start + examined) % n;
            }
        }

        for peer in &selected {
            self.activity.note_requested(peer, now);
            self.queue.enqueue_request(peer.as_request());
        }
        if !selected.is_empty() {
            debug!(count = selected.len(), "Scheduled sync requests");
        }
        selected
    }

    /// Ask about a peer right now, outside of any tier or rate limit.
    pub fn request_sync(&self, peer: &PeerId, now: u64) {
        if *peer == self.local {
            debug!("Ignoring sync request for local identity");
            return;
        }
        self.track(peer);
        self.activity.note_requested(peer, now);
        self.queue.enqueue_request(peer.as_request());
        debug!(peer = %peer, "On-demand sync requested");
    }

    /// Spawn the tick loop: refresh and bootstrap once, then tick every
    /// `tick_interval` and refresh every `refresh_interval` until shutdown.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.refresh_peers();
            let seeded = scheduler.bootstrap();
            info!(
                known = scheduler.known_count(),
                seeded, "Sync scheduler started"
            );

            let mut tick = tokio::time::interval(scheduler.config.tick_interval());
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let refresh_every = scheduler.config.refresh_interval();
            let mut refresh =
                tokio::time::interval_at(tokio::time::Instant::now() + refresh_every, refresh_every);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        scheduler.tick(crate::now_millis());
                    }
                    _ = refresh.tick() => {
                        scheduler.refresh_peers();
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Sync scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Hash, Keypair};
    use crate::message::LogEntry;
    use crate::queue::QueueConfig;
    use crate::storage::MemoryStore;
    use crate::wire::WireFormat;

    const NOW: u64 = 1_700_000_000_000;

    struct Fixture {
        scheduler: SyncScheduler,
        store: Arc<MemoryStore>,
        activity: Arc<ActivityTracker>,
        queue: Arc<NetworkQueue>,
        local: PeerId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let activity = Arc::new(ActivityTracker::new());
        let queue = Arc::new(NetworkQueue::new(QueueConfig::default(), WireFormat::Tagged));
        let local = Keypair::from_seed(&[0u8; 32]).peer_id();
        let scheduler = SyncScheduler::new(
            SchedulerConfig::default(),
            local,
            store.clone(),
            activity.clone(),
            queue.clone(),
        );
        Fixture {
            scheduler,
            store,
            activity,
            queue,
            local,
        }
    }

    fn peer(n: u8) -> PeerId {
        Keypair::from_seed(&[n; 32]).peer_id()
    }

    fn log_for(store: &MemoryStore, peer: &PeerId, ts: u64) {
        store
            .append_log(
                peer,
                LogEntry {
                    timestamp: ts,
                    hash: Hash::of(&ts.to_be_bytes()),
                },
            )
            .unwrap();
    }

    #[test]
    fn test_refresh_skips_local_identity() {
        let f = fixture();
        log_for(&f.store, &f.local, NOW);
        log_for(&f.store, &peer(1), NOW);
        assert_eq!(f.scheduler.refresh_peers(), 1);
        assert_eq!(f.scheduler.refresh_peers(), 0);
        assert_eq!(f.scheduler.known_count(), 1);
    }

    #[test]
    fn test_bootstrap_seeds_last_seen_from_log() {
        let f = fixture();
        let p = peer(1);
        log_for(&f.store, &p, NOW - 1000);
        f.scheduler.refresh_peers();
        assert_eq!(f.scheduler.bootstrap(), 1);
        assert_eq!(f.activity.get(&p).last_seen, NOW - 1000);
        // already has an entry now
        assert_eq!(f.scheduler.bootstrap(), 0);
    }

    #[test]
    fn test_bootstrap_respects_limit() {
        let f = fixture();
        for n in 1..=25 {
            log_for(&f.store, &peer(n), NOW);
        }
        f.scheduler.refresh_peers();
        assert_eq!(f.scheduler.bootstrap(), 20);
    }

    #[test]
    fn test_tick_enqueues_peer_requests() {
        let f = fixture();
        let p = peer(1);
        f.scheduler.track(&p);
        f.activity.note_interest(&p, NOW);

        assert_eq!(f.scheduler.tick(NOW), vec![p]);
        assert!(f.queue.is_pending(&p.as_request()));
        assert_eq!(f.activity.get(&p).last_requested, NOW);
    }

    #[test]
    fn test_rate_limit_within_tier_interval() {
        let f = fixture();
        let p = peer(1);
        f.scheduler.track(&p);
        f.activity.note_interest(&p, NOW);

        assert_eq!(f.scheduler.tick(NOW).len(), 1);
        assert!(f.scheduler.tick(NOW + 5_000).is_empty());
        assert_eq!(f.scheduler.tick(NOW + 15_000).len(), 1);
    }

    #[test]
    fn test_cold_round_robin_visits_everyone() {
        let f = fixture();
        let peers: Vec<PeerId> = (1..=3).map(peer).collect();
        for p in &peers {
            f.scheduler.track(p);
        }
        let day = 24 * 60 * 60 * 1000;
        let mut seen = HashSet::new();
        // cold batch is 1, and each tick is far enough apart to clear the interval
        for i in 0..3 {
            let picked = f.scheduler.tick(NOW + i * day);
            assert_eq!(picked.len(), 1);
            seen.insert(picked[0]);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_request_sync_bypasses_rate_limit() {
        let f = fixture();
        let p = peer(1);
        f.activity.note_requested(&p, NOW);
        f.scheduler.request_sync(&p, NOW + 1);
        assert!(f.queue.is_pending(&p.as_request()));
        assert_eq!(f.activity.get(&p).last_requested, NOW + 1);
        assert_eq!(f.scheduler.known_count(), 1);
    }

    #[test]
    fn test_request_sync_ignores_local() {
        let f = fixture();
        f.scheduler.request_sync(&f.local, NOW);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_tier_counts() {
        let f = fixture();
        let (hot, cold) = (peer(1), peer(2));
        f.scheduler.track(&hot);
        f.scheduler.track(&cold);
        f.activity.note_interest(&hot, NOW);
        assert_eq!(
            f.scheduler.tier_counts(NOW),
            TierCounts {
                hot: 1,
                warm: 0,
                cold: 1
            }
        );
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        config.warm.batch = 0;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }
}

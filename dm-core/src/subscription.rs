//! Visible-set driven subscription planning.
//!
//! The backend limits how many conversation ids one filtered subscription
//! may carry, so the visible set is split into chunks of at most
//! `max_ids_per_channel` ids, one backend subscription per chunk.
//!
//! Visibility changes arrive in bursts while the user scrolls. The planner
//! debounces them: nothing is committed until the set has been stable for
//! `scroll_debounce`, and only the final set of a burst is planned.
//!
//! Planning is stable. Full chunks whose members are all still visible are
//! kept as-is, so scrolling one row does not churn every subscription.

use dm_types::{ConversationId, Table};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use crate::RealtimeConfig;

/// A set of conversation ids served by one backend subscription.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chunk(BTreeSet<ConversationId>);

impl Chunk {
    /// Ids in this chunk, in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ConversationId> + '_ {
        self.0.iter().copied()
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the chunk is empty. Planned chunks never are.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `id` is served by this chunk.
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.0.contains(id)
    }

    /// The backend subscription serving this chunk.
    pub fn channel_spec(&self) -> ChannelSpec {
        let list = self
            .ids()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let topic = match self.0.first() {
            Some(first) => format!("dm:{}+{}", first, self.len()),
            None => "dm:empty".to_string(),
        };
        ChannelSpec {
            topic,
            conversation_ids: self.ids().collect(),
            bindings: [Table::Messages, Table::Conversations, Table::ReadReceipts]
                .into_iter()
                .map(|table| {
                    let column = match table {
                        Table::Conversations => "id",
                        Table::Messages | Table::ReadReceipts => "conversation_id",
                    };
                    TableBinding {
                        table,
                        filter: format!("{}=in.({})", column, list),
                    }
                })
                .collect(),
        }
    }
}

impl FromIterator<ConversationId> for Chunk {
    fn from_iter<I: IntoIterator<Item = ConversationId>>(iter: I) -> Self {
        Chunk(iter.into_iter().collect())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({} ids)", self.len())
    }
}

/// What to ask the backend for when subscribing a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Channel topic; unique among concurrently planned chunks.
    pub topic: String,
    /// Conversations served by the channel.
    pub conversation_ids: Vec<ConversationId>,
    /// Row-change bindings carried by the channel.
    pub bindings: Vec<TableBinding>,
}

/// One table listened to on a channel, with its row filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBinding {
    /// Table.
    pub table: Table,
    /// Row filter, e.g. `conversation_id=in.(a,b)`.
    pub filter: String,
}

/// Backend changes needed to move from one plan to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    /// Chunks to unsubscribe.
    pub teardown: Vec<Chunk>,
    /// Chunks to subscribe.
    pub establish: Vec<Chunk>,
}

impl SubscriptionDiff {
    /// True when the backend needs no calls.
    pub fn is_empty(&self) -> bool {
        self.teardown.is_empty() && self.establish.is_empty()
    }
}

/// Outcome of [`SubscriptionPlanner::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Same as the current target; nothing to do.
    Unchanged,
    /// The committed set was requested again; the pending change is dropped.
    Cancelled,
    /// A recomputation is scheduled (window restarted).
    Scheduled {
        /// When the set will be committed if nothing else changes.
        commit_at: Instant,
    },
}

#[derive(Debug, Clone)]
struct Pending {
    ids: BTreeSet<ConversationId>,
    commit_at: Instant,
}

/// Debounced planner for the visible-set subscriptions.
#[derive(Debug, Clone)]
pub struct SubscriptionPlanner {
    max_ids: usize,
    debounce: Duration,
    committed: BTreeSet<ConversationId>,
    chunks: Vec<Chunk>,
    pending: Option<Pending>,
}

impl SubscriptionPlanner {
    /// Create a planner with nothing subscribed.
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            max_ids: config.max_ids_per_channel.max(1),
            debounce: config.scroll_debounce(),
            committed: BTreeSet::new(),
            chunks: Vec::new(),
            pending: None,
        }
    }

    /// Record a new visible set.
    pub fn request(&mut self, ids: BTreeSet<ConversationId>, now: Instant) -> Request {
        match &self.pending {
            Some(pending) if pending.ids == ids => Request::Unchanged,
            Some(_) if ids == self.committed => {
                self.pending = None;
                Request::Cancelled
            }
            None if ids == self.committed => Request::Unchanged,
            _ => {
                let commit_at = now + self.debounce;
                self.pending = Some(Pending { ids, commit_at });
                Request::Scheduled { commit_at }
            }
        }
    }

    /// Commit the pending set once its debounce window has passed.
    pub fn poll(&mut self, now: Instant) -> Option<SubscriptionDiff> {
        if self.pending.as_ref()?.commit_at > now {
            return None;
        }
        let pending = self.pending.take()?;
        let next = plan(&pending.ids, &self.chunks, self.max_ids);
        let diff = SubscriptionDiff {
            teardown: self
                .chunks
                .iter()
                .filter(|c| !next.contains(c))
                .cloned()
                .collect(),
            establish: next
                .iter()
                .filter(|c| !self.chunks.contains(c))
                .cloned()
                .collect(),
        };
        tracing::debug!(
            visible = pending.ids.len(),
            chunks = next.len(),
            teardown = diff.teardown.len(),
            establish = diff.establish.len(),
            "visible set committed"
        );
        self.committed = pending.ids;
        self.chunks = next;
        Some(diff)
    }

    /// Tear down and re-establish every committed chunk.
    pub fn resync(&self) -> SubscriptionDiff {
        SubscriptionDiff {
            teardown: self.chunks.clone(),
            establish: self.chunks.clone(),
        }
    }

    /// Latest requested set, committed or not.
    pub fn visible(&self) -> &BTreeSet<ConversationId> {
        match &self.pending {
            Some(pending) => &pending.ids,
            None => &self.committed,
        }
    }

    /// Set currently backed by subscriptions.
    pub fn committed(&self) -> &BTreeSet<ConversationId> {
        &self.committed
    }

    /// Chunks currently planned.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// When the pending set will be committed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.commit_at)
    }
}

/// Partition `ids` into chunks of at most `max` ids, reusing full chunks
/// from `existing` whose members are all still present.
pub fn plan(ids: &BTreeSet<ConversationId>, existing: &[Chunk], max: usize) -> Vec<Chunk> {
    let max = max.max(1);
    let mut chunks = Vec::with_capacity(ids.len().div_ceil(max));
    let mut covered = BTreeSet::new();

    for chunk in existing {
        if chunk.len() == max && chunk.0.is_subset(ids) && chunk.0.is_disjoint(&covered) {
            covered.extend(chunk.ids());
            chunks.push(chunk.clone());
        }
    }

    let rest: Vec<ConversationId> = ids.difference(&covered).copied().collect();
    chunks.extend(rest.chunks(max).map(|slice| slice.iter().copied().collect::<Chunk>()));
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> BTreeSet<ConversationId> {
        (0..n).map(|_| ConversationId::new()).collect()
    }

    fn planner(max: usize) -> SubscriptionPlanner {
        SubscriptionPlanner::new(&RealtimeConfig {
            max_ids_per_channel: max,
            ..RealtimeConfig::default()
        })
    }

    fn settle(planner: &mut SubscriptionPlanner, set: BTreeSet<ConversationId>, now: Instant) -> SubscriptionDiff {
        planner.request(set, now);
        planner.poll(now + Duration::from_millis(500)).unwrap()
    }

    // ===========================================
    // Chunking Tests
    // ===========================================

    #[test]
    fn chunk_count_is_ceiling() {
        for (n, expected) in [(0, 0), (1, 1), (100, 1), (101, 2), (250, 3)] {
            let set = ids(n);
            let chunks = plan(&set, &[], 100);
            assert_eq!(chunks.len(), expected, "n = {}", n);
            assert!(chunks.iter().all(|c| c.len() <= 100 && !c.is_empty()));
        }
    }

    #[test]
    fn each_id_in_exactly_one_chunk() {
        let set = ids(250);
        let chunks = plan(&set, &[], 100);

        let mut sizes: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![50, 100, 100]);

        for id in &set {
            assert_eq!(chunks.iter().filter(|c| c.contains(id)).count(), 1);
        }
    }

    #[test]
    fn full_chunks_survive_small_changes() {
        let set = ids(250);
        let before = plan(&set, &[], 100);

        let mut after_set = set.clone();
        let dropped = before
            .iter()
            .find(|c| c.len() == 50)
            .and_then(|c| c.ids().next())
            .unwrap();
        after_set.remove(&dropped);
        after_set.insert(ConversationId::new());

        let after = plan(&after_set, &before, 100);

        let kept = before.iter().filter(|c| after.contains(c)).count();
        assert_eq!(kept, 2);
        assert_eq!(after.len(), 3);
    }

    #[test]
    fn channel_spec_covers_three_tables() {
        let set = ids(3);
        let chunk: Chunk = set.iter().copied().collect();
        let spec = chunk.channel_spec();

        assert_eq!(spec.conversation_ids.len(), 3);
        assert_eq!(spec.bindings.len(), 3);
        let messages = &spec.bindings[0];
        assert_eq!(messages.table, Table::Messages);
        for id in &set {
            assert!(messages.filter.contains(&id.to_string()));
        }
        assert!(spec.bindings[1].filter.starts_with("id=in.("));
    }

    // ===========================================
    // Debounce Tests
    // ===========================================

    #[test]
    fn nothing_committed_before_debounce() {
        let mut planner = planner(100);
        let now = Instant::now();

        planner.request(ids(5), now);

        assert!(planner.poll(now + Duration::from_millis(499)).is_none());
        assert!(planner.committed().is_empty());
        assert_eq!(planner.visible().len(), 5);
    }

    #[test]
    fn rapid_changes_collapse_to_final_set() {
        let mut planner = planner(100);
        let start = Instant::now();
        let final_set = ids(7);

        for step in 0..10u64 {
            planner.request(ids(3), start + Duration::from_millis(step * 100));
        }
        let last = start + Duration::from_millis(1000);
        planner.request(final_set.clone(), last);

        assert!(planner.poll(last + Duration::from_millis(499)).is_none());
        let diff = planner.poll(last + Duration::from_millis(500)).unwrap();

        assert!(diff.teardown.is_empty());
        assert_eq!(diff.establish.len(), 1);
        assert_eq!(planner.committed(), &final_set);
        assert!(planner.poll(last + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn returning_to_committed_cancels_pending() {
        let mut planner = planner(100);
        let now = Instant::now();
        let set = ids(4);
        settle(&mut planner, set.clone(), now);

        assert!(matches!(planner.request(ids(2), now), Request::Scheduled { .. }));
        assert_eq!(planner.request(set.clone(), now), Request::Cancelled);
        assert!(planner.poll(now + Duration::from_secs(1)).is_none());
        assert_eq!(planner.visible(), &set);
    }

    #[test]
    fn identical_request_is_noop() {
        let mut planner = planner(100);
        let now = Instant::now();
        assert_eq!(planner.request(BTreeSet::new(), now), Request::Unchanged);

        let set = ids(2);
        settle(&mut planner, set.clone(), now);
        assert_eq!(planner.request(set, now), Request::Unchanged);
        assert!(planner.next_deadline().is_none());
    }

    #[test]
    fn shrinking_to_empty_tears_everything_down() {
        let mut planner = planner(2);
        let now = Instant::now();
        settle(&mut planner, ids(5), now);
        assert_eq!(planner.chunks().len(), 3);

        let diff = settle(&mut planner, BTreeSet::new(), now);

        assert_eq!(diff.teardown.len(), 3);
        assert!(diff.establish.is_empty());
        assert!(planner.chunks().is_empty());
    }

    #[test]
    fn resync_replays_every_chunk() {
        let mut planner = planner(100);
        let now = Instant::now();
        settle(&mut planner, ids(150), now);

        let diff = planner.resync();

        assert_eq!(diff.teardown.len(), 2);
        assert_eq!(diff.teardown, diff.establish);
    }
}

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use strum_macros::Display;

/// Minimum spacing between identify calls within one concurrency bucket;
/// the server rate limits anything tighter.
const DEFAULT_IDENTIFY_SPACING: Duration = Duration::from_secs(5);

/// Shard lifecycle; monotonic within a connection lifetime, reset to
/// [`ShardStatus::Idle`] on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ShardStatus {
    Idle,
    Connecting,
    Identifying,
    Ready,
    Disconnected,
}

/// One gateway connection's slice of the workload.
#[derive(Debug, Clone)]
pub struct Shard {
    pub id: u32,
    pub total: u32,
    pub status: ShardStatus,
    pub guilds: HashSet<u64>,
}

/// Computes shard counts, paces identify attempts against the concurrency
/// budget, and tracks per-shard guild assignment.
#[derive(Debug)]
pub struct ShardManager {
    total_shards: u32,
    max_concurrency: u32,
    identify_spacing: Duration,
    shards: Vec<Shard>,
    bucket_last_identify: HashMap<u32, Instant>,
}

impl ShardManager {
    /// Provision idle shard records.
    ///
    /// Effective shard count: explicit override, else the server
    /// recommendation, else one.
    #[must_use]
    pub fn spawn(
        guild_count: u64,
        max_concurrency: u32,
        recommended_shards: u32,
        override_shards: Option<u32>,
    ) -> Self {
        let total_shards = override_shards.unwrap_or(recommended_shards).max(1);
        let max_concurrency = max_concurrency.max(1);

        tracing::debug!(
            total_shards,
            max_concurrency,
            guild_count,
            "provisioning shards"
        );

        let shards = (0..total_shards)
            .map(|id| Shard {
                id,
                total: total_shards,
                status: ShardStatus::Idle,
                guilds: HashSet::new(),
            })
            .collect();

        Self {
            total_shards,
            max_concurrency,
            identify_spacing: DEFAULT_IDENTIFY_SPACING,
            shards,
            bucket_last_identify: HashMap::new(),
        }
    }

    /// Override the bucket spacing (tests and private gateways).
    pub fn set_identify_spacing(&mut self, spacing: Duration) {
        self.identify_spacing = spacing;
    }

    #[must_use]
    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    #[must_use]
    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    #[must_use]
    pub fn shard(&self, shard_id: u32) -> Option<&Shard> {
        self.shards.get(shard_id as usize)
    }

    /// Identify bucket for a shard.
    #[must_use]
    pub const fn bucket(&self, shard_id: u32) -> u32 {
        shard_id % self.max_concurrency
    }

    /// Next `[shard_id, total_shards]` allowed to begin identifying.
    ///
    /// Shards stage in id order: a shard becomes available only once every
    /// lower-id shard has at least reached [`ShardStatus::Identifying`], and
    /// only once its bucket's spacing window has elapsed. Returns `None`
    /// when no shard is currently eligible.
    #[must_use]
    pub fn get_available_shard(&self) -> Option<[u32; 2]> {
        for shard in &self.shards {
            match shard.status {
                ShardStatus::Idle | ShardStatus::Connecting | ShardStatus::Disconnected => {
                    if self.bucket_ready(self.bucket(shard.id)) {
                        return Some([shard.id, self.total_shards]);
                    }
                    return None;
                }
                // Already past the staging gate; look at the next shard.
                ShardStatus::Identifying | ShardStatus::Ready => {}
            }
        }
        None
    }

    /// How long the given shard must wait before it may identify.
    #[must_use]
    pub fn identify_delay(&self, shard_id: u32) -> Duration {
        match self.bucket_last_identify.get(&self.bucket(shard_id)) {
            Some(last) => self.identify_spacing.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn bucket_ready(&self, bucket: u32) -> bool {
        match self.bucket_last_identify.get(&bucket) {
            Some(last) => last.elapsed() >= self.identify_spacing,
            None => true,
        }
    }

    /// Drive a shard's lifecycle. Entering [`ShardStatus::Identifying`]
    /// stamps the bucket for pacing.
    pub fn set_shard_status(&mut self, shard_id: u32, status: ShardStatus) {
        let bucket = self.bucket(shard_id);
        let Some(shard) = self.shards.get_mut(shard_id as usize) else {
            tracing::warn!(shard_id, "status update for unknown shard");
            return;
        };

        tracing::debug!(shard_id, from = %shard.status, to = %status, "shard status change");
        shard.status = status;

        if status == ShardStatus::Identifying {
            self.bucket_last_identify.insert(bucket, Instant::now());
        }
    }

    /// Put a shard back at the start of its lifecycle for a reconnect.
    pub fn reset_shard(&mut self, shard_id: u32) {
        if let Some(shard) = self.shards.get_mut(shard_id as usize) {
            shard.status = ShardStatus::Idle;
        }
    }

    /// Deterministic guild routing: `(guild_id >> 22) % total_shards`.
    #[must_use]
    pub const fn shard_for_guild(&self, guild_id: u64) -> u32 {
        ((guild_id >> 22) % self.total_shards as u64) as u32
    }

    /// Track a guild on its routed shard (driven by guild-create dispatch).
    pub fn add_guild_to_shard(&mut self, guild_id: u64) {
        let shard_id = self.shard_for_guild(guild_id);
        if let Some(shard) = self.shards.get_mut(shard_id as usize) {
            shard.guilds.insert(guild_id);
        }
    }

    /// Drop a guild from its routed shard (driven by guild-delete dispatch).
    pub fn remove_guild_from_shard(&mut self, guild_id: u64) {
        let shard_id = self.shard_for_guild(guild_id);
        if let Some(shard) = self.shards.get_mut(shard_id as usize) {
            shard.guilds.remove(&guild_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(total: u32, max_concurrency: u32) -> ShardManager {
        let mut manager = ShardManager::spawn(0, max_concurrency, total, None);
        manager.set_identify_spacing(Duration::ZERO);
        manager
    }

    #[test]
    fn override_beats_recommendation() {
        let manager = ShardManager::spawn(10_000, 1, 9, Some(4));
        assert_eq!(manager.total_shards(), 4);
    }

    #[test]
    fn defaults_to_single_shard() {
        let manager = ShardManager::spawn(50, 1, 0, None);
        assert_eq!(manager.total_shards(), 1);
    }

    #[test]
    fn shards_stage_in_order_behind_identifying_gate() {
        let mut manager = manager(3, 1);

        assert_eq!(manager.get_available_shard(), Some([0, 3]));
        // Shard 0 has not reached identifying yet; 1 must wait.
        manager.set_shard_status(0, ShardStatus::Connecting);
        assert_eq!(manager.get_available_shard(), Some([0, 3]));

        manager.set_shard_status(0, ShardStatus::Identifying);
        assert_eq!(manager.get_available_shard(), Some([1, 3]));

        manager.set_shard_status(1, ShardStatus::Identifying);
        assert_eq!(manager.get_available_shard(), Some([2, 3]));

        manager.set_shard_status(2, ShardStatus::Ready);
        assert_eq!(manager.get_available_shard(), None);
    }

    #[test]
    fn bucket_spacing_blocks_same_bucket() {
        let mut manager = ShardManager::spawn(0, 1, 2, None);
        manager.set_identify_spacing(Duration::from_secs(60));

        assert_eq!(manager.get_available_shard(), Some([0, 2]));
        manager.set_shard_status(0, ShardStatus::Identifying);

        // Shard 1 shares bucket 0 and must wait out the spacing window.
        assert_eq!(manager.get_available_shard(), None);
        assert!(manager.identify_delay(1) > Duration::from_secs(50));
    }

    #[test]
    fn separate_buckets_do_not_block_each_other() {
        let mut manager = ShardManager::spawn(0, 2, 2, None);
        manager.set_identify_spacing(Duration::from_secs(60));

        manager.set_shard_status(0, ShardStatus::Identifying);
        // Shard 1 is in bucket 1, untouched by bucket 0's stamp.
        assert_eq!(manager.get_available_shard(), Some([1, 2]));
        assert_eq!(manager.identify_delay(1), Duration::ZERO);
    }

    #[test]
    fn guild_routing_is_deterministic() {
        let manager = manager(16, 1);

        for guild_id in [0_u64, 1 << 22, 81_384_788_765_712_384, u64::MAX] {
            assert_eq!(
                manager.shard_for_guild(guild_id),
                ((guild_id >> 22) % 16) as u32
            );
        }
    }

    #[test]
    fn guild_membership_follows_routing_regardless_of_order() {
        let mut manager = manager(4, 1);
        let guilds = [3_u64 << 22, 1 << 22, 9 << 22, 2 << 22];

        for guild_id in guilds {
            manager.add_guild_to_shard(guild_id);
        }

        for guild_id in guilds {
            let shard_id = manager.shard_for_guild(guild_id);
            assert!(manager.shard(shard_id).expect("shard").guilds.contains(&guild_id));
        }

        manager.remove_guild_from_shard(1 << 22);
        let shard_id = manager.shard_for_guild(1 << 22);
        assert!(!manager.shard(shard_id).expect("shard").guilds.contains(&(1 << 22)));
    }
}

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::services::packager::SignedArtifact;

/// Cards whose last artifact stays in memory
pub const DEFAULT_CAPACITY: usize = 512;

#[derive(Debug)]
struct CachedArtifact {
    artifact: Arc<SignedArtifact>,
    last_used: u64,
}

/// Last packaged artifact per card, for at most `capacity` cards. An entry only
/// answers for the exact tag it was built from, so a bumped tag makes it stale
/// without explicit invalidation. The least recently used card is evicted first.
#[derive(Debug)]
pub struct ArtifactCache {
    entries: DashMap<Uuid, CachedArtifact>,
    capacity: usize,
    clock: AtomicU64,
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, card_id: Uuid, update_tag: i64) -> Option<Arc<SignedArtifact>> {
        let mut entry = self.entries.get_mut(&card_id)?;
        if entry.artifact.update_tag != update_tag {
            return None;
        }
        entry.last_used = self.tick();
        Some(entry.artifact.clone())
    }

    /// Stores an artifact unless a newer one is already cached
    pub fn insert(&self, card_id: Uuid, artifact: Arc<SignedArtifact>) {
        let last_used = self.tick();
        self.entries
            .entry(card_id)
            .and_modify(|existing| {
                if artifact.update_tag >= existing.artifact.update_tag {
                    existing.artifact = artifact.clone();
                    existing.last_used = last_used;
                }
            })
            .or_insert_with(|| CachedArtifact {
                artifact: artifact.clone(),
                last_used,
            });

        while self.entries.len() > self.capacity {
            if !self.evict_least_recent() {
                break;
            }
        }
    }

    fn evict_least_recent(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.last_used)
            .map(|entry| (*entry.key(), entry.last_used));

        match oldest {
            Some((card_id, last_used)) => {
                // Skip if it was touched since the scan; the caller loops
                self.entries
                    .remove_if(&card_id, |_, entry| entry.last_used == last_used);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn artifact(update_tag: i64) -> Arc<SignedArtifact> {
        Arc::new(SignedArtifact {
            bytes: vec![update_tag as u8],
            serial: "serial".to_string(),
            update_tag,
            manifest: BTreeMap::new(),
        })
    }

    #[test]
    fn test_entry_only_matches_its_tag() {
        let cache = ArtifactCache::new();
        let card_id = Uuid::new_v4();
        cache.insert(card_id, artifact(5));

        assert!(cache.get(card_id, 5).is_some());
        assert!(cache.get(card_id, 6).is_none());
        assert!(cache.get(Uuid::new_v4(), 5).is_none());
    }

    #[test]
    fn test_older_artifact_does_not_replace_newer() {
        let cache = ArtifactCache::new();
        let card_id = Uuid::new_v4();
        cache.insert(card_id, artifact(7));
        cache.insert(card_id, artifact(6));

        assert!(cache.get(card_id, 7).is_some());
        assert!(cache.get(card_id, 6).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_least_recently_used_card_is_evicted() {
        let cache = ArtifactCache::with_capacity(2);
        let (first, second, third) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        cache.insert(first, artifact(1));
        cache.insert(second, artifact(1));

        // Reading keeps the first card warm
        assert!(cache.get(first, 1).is_some());
        cache.insert(third, artifact(1));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(first, 1).is_some());
        assert!(cache.get(second, 1).is_none());
        assert!(cache.get(third, 1).is_some());
    }

    #[test]
    fn test_cache_never_exceeds_capacity() {
        let cache = ArtifactCache::with_capacity(3);
        for _ in 0..20 {
            cache.insert(Uuid::new_v4(), artifact(1));
        }
        assert_eq!(cache.len(), 3);
    }
}

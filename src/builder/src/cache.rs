//! Layer cache lookup.
//!
//! An existing image can stand in for the result of an instruction when
//! its history is the working container's history plus exactly one entry
//! describing the same instruction, and its layers agree with that.

use chrono::{DateTime, Duration, Utc};
use kiln_core::error::Result;

use crate::history::entries_equal;
use crate::image::{HistoryEntry, ImageRecord};
use crate::store::ImageStore;

/// Whether a stage still consults the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Caching,
    NotCaching,
}

/// Description of the result an instruction would produce.
#[derive(Debug, Clone)]
pub struct CacheQuery<'a> {
    /// Top layer of the working container
    pub base_top_layer: Option<&'a str>,
    pub base_history: &'a [HistoryEntry],
    pub base_diff_ids: &'a [String],
    /// Canonical `created_by` of the instruction
    pub created_by: &'a str,
    /// Whether the instruction produces a filesystem layer
    pub adds_layer: bool,
}

/// Finds cached images for one stage.
#[derive(Debug, Clone)]
pub struct CacheMatcher {
    state: CacheState,
    ttl: Option<Duration>,
}

impl CacheMatcher {
    pub fn new(enabled: bool, ttl_secs: Option<u64>) -> Self {
        Self {
            state: if enabled {
                CacheState::Caching
            } else {
                CacheState::NotCaching
            },
            ttl: ttl_secs.map(|secs| Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))),
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn is_caching(&self) -> bool {
        self.state == CacheState::Caching
    }

    /// Stop consulting the cache for the rest of the stage.
    pub fn stop(&mut self) {
        if self.state == CacheState::Caching {
            tracing::debug!("Cache miss, no further lookups in this stage");
            self.state = CacheState::NotCaching;
        }
    }

    /// The best cached image for `query`, if any.
    ///
    /// Among several matches the most recently created wins; equal
    /// creation times fall back to the smallest ID.
    pub async fn find(
        &self,
        store: &dyn ImageStore,
        query: &CacheQuery<'_>,
    ) -> Result<Option<ImageRecord>> {
        if !self.is_caching() {
            return Ok(None);
        }
        let now = Utc::now();

        let mut best: Option<ImageRecord> = None;
        for image in store.images().await? {
            if query.adds_layer {
                let Some(top) = image.top_layer.as_deref() else {
                    continue;
                };
                let parent = store.layer(top).await?.and_then(|layer| layer.parent);
                if parent.as_deref() != query.base_top_layer {
                    continue;
                }
            } else if image.top_layer.as_deref() != query.base_top_layer {
                continue;
            }

            if self.expired(image.created, now) {
                continue;
            }
            if !history_matches(query, &image.history, &image.diff_ids) {
                continue;
            }

            best = match best {
                Some(current) if !preferred(&image, &current) => Some(current),
                _ => Some(image),
            };
        }

        if let Some(image) = &best {
            tracing::debug!(image = %image.id, created_by = query.created_by, "Cache hit");
        }
        Ok(best)
    }

    fn expired(&self, created: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => now.signed_duration_since(created) > ttl,
            None => false,
        }
    }
}

fn preferred(candidate: &ImageRecord, current: &ImageRecord) -> bool {
    candidate.created > current.created
        || (candidate.created == current.created && candidate.id < current.id)
}

/// Whether a candidate's history and diff IDs extend the base by exactly
/// the queried instruction.
pub fn history_matches(
    query: &CacheQuery<'_>,
    candidate_history: &[HistoryEntry],
    candidate_diff_ids: &[String],
) -> bool {
    let base = query.base_history;
    if candidate_history.len() != base.len() + 1 {
        return false;
    }
    if !base
        .iter()
        .zip(candidate_history)
        .all(|(a, b)| entries_equal(a, b))
    {
        return false;
    }

    let added = &candidate_history[base.len()];
    if added.created_by != query.created_by || added.empty_layer == query.adds_layer {
        return false;
    }

    let expected = query.base_diff_ids.len() + usize::from(query.adds_layer);
    candidate_diff_ids.len() == expected
        && candidate_diff_ids[..query.base_diff_ids.len()] == *query.base_diff_ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{CommitOptions, ImageConfig};
    use crate::storage::LocalStore;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    fn entry(created_by: &str, empty_layer: bool) -> HistoryEntry {
        HistoryEntry {
            created_by: created_by.to_string(),
            empty_layer,
            ..Default::default()
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("sha256:{}", i)).collect()
    }

    #[test]
    fn test_history_delta_of_one_matches() {
        let base = vec![entry("/bin/sh", false)];
        let base_ids = ids(1);
        let query = CacheQuery {
            base_top_layer: None,
            base_history: &base,
            base_diff_ids: &base_ids,
            created_by: "/bin/sh -c make",
            adds_layer: true,
        };
        let candidate = vec![entry("/bin/sh", false), entry("/bin/sh -c make", false)];
        assert!(history_matches(&query, &candidate, &ids(2)));
    }

    #[test]
    fn test_history_delta_zero_or_two_rejected() {
        let base = vec![entry("/bin/sh", false)];
        let base_ids = ids(1);
        let query = CacheQuery {
            base_top_layer: None,
            base_history: &base,
            base_diff_ids: &base_ids,
            created_by: "/bin/sh -c make",
            adds_layer: true,
        };
        assert!(!history_matches(&query, &base, &ids(1)));
        let two = vec![
            entry("/bin/sh", false),
            entry("/bin/sh -c make", false),
            entry("/bin/sh -c make", false),
        ];
        assert!(!history_matches(&query, &two, &ids(3)));
    }

    #[test]
    fn test_prefix_and_created_by_must_agree() {
        let base = vec![entry("/bin/sh", false)];
        let base_ids = ids(1);
        let query = CacheQuery {
            base_top_layer: None,
            base_history: &base,
            base_diff_ids: &base_ids,
            created_by: "/bin/sh -c #(nop) ENV A=1",
            adds_layer: false,
        };
        let other_prefix = vec![entry("/bin/sh -x", false), entry(query.created_by, true)];
        assert!(!history_matches(&query, &other_prefix, &ids(1)));
        let other_step = vec![entry("/bin/sh", false), entry("/bin/sh -c #(nop) ENV A=2", true)];
        assert!(!history_matches(&query, &other_step, &ids(1)));
        let good = vec![entry("/bin/sh", false), entry(query.created_by, true)];
        assert!(history_matches(&query, &good, &ids(1)));
        // A metadata step must not have produced a layer.
        assert!(!history_matches(&query, &good, &ids(2)));
    }

    #[test]
    fn test_stop_is_one_way() {
        let mut matcher = CacheMatcher::new(true, None);
        assert_eq!(matcher.state(), CacheState::Caching);
        matcher.stop();
        matcher.stop();
        assert_eq!(matcher.state(), CacheState::NotCaching);
        assert!(!CacheMatcher::new(false, None).is_caching());
    }

    async fn seeded() -> (TempDir, LocalStore, ImageRecord) {
        let tmp = TempDir::new().unwrap();
        let base_dir = tmp.path().join("base");
        fs::create_dir_all(&base_dir).unwrap();
        fs::write(base_dir.join("f"), "x").unwrap();
        let store = LocalStore::new(&tmp.path().join("store")).unwrap();
        let base = store
            .import_dir(&base_dir, "base", ImageConfig::default())
            .await
            .unwrap();
        (tmp, store, base)
    }

    async fn child(
        store: &LocalStore,
        base: &ImageRecord,
        created_by: &str,
        created: DateTime<Utc>,
    ) -> ImageRecord {
        let container = store.create_container(Some(&base.id)).await.unwrap();
        store
            .commit(
                &container.id,
                &CommitOptions {
                    empty_layer: true,
                    created: Some(created),
                    history: vec![entry(created_by, true)],
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_find_and_tie_break() {
        let (_tmp, store, base) = seeded().await;
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        child(&store, &base, "/bin/sh -c #(nop) USER app", old).await;
        let newer = child(&store, &base, "/bin/sh -c #(nop) USER app", new).await;

        let query = CacheQuery {
            base_top_layer: base.top_layer.as_deref(),
            base_history: &base.history,
            base_diff_ids: &base.diff_ids,
            created_by: "/bin/sh -c #(nop) USER app",
            adds_layer: false,
        };
        let matcher = CacheMatcher::new(true, None);
        let hit = matcher.find(&store, &query).await.unwrap().unwrap();
        assert_eq!(hit.id, newer.id);

        let miss = CacheQuery {
            created_by: "/bin/sh -c #(nop) USER root",
            ..query.clone()
        };
        assert!(matcher.find(&store, &miss).await.unwrap().is_none());

        let mut stopped = matcher.clone();
        stopped.stop();
        assert!(stopped.find(&store, &query).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_drops_stale_candidates() {
        let (_tmp, store, base) = seeded().await;
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        child(&store, &base, "/bin/sh -c #(nop) USER app", old).await;
        let query = CacheQuery {
            base_top_layer: base.top_layer.as_deref(),
            base_history: &base.history,
            base_diff_ids: &base.diff_ids,
            created_by: "/bin/sh -c #(nop) USER app",
            adds_layer: false,
        };
        let matcher = CacheMatcher::new(true, Some(3600));
        assert!(matcher.find(&store, &query).await.unwrap().is_none());
        let matcher = CacheMatcher::new(true, None);
        assert!(matcher.find(&store, &query).await.unwrap().is_some());
    }
}

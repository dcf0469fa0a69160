//! Process-local store. Every operation is one critical section.

use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::Mutex;

use crate::errors::VigilResult;
use crate::models::ActivityRecord;
use crate::store::{Store, WindowSnapshot};

#[derive(Default)]
struct Window {
    hits: VecDeque<i64>,
    expires_us: i64,
}

impl Window {
    fn evict(&mut self, cutoff_us: i64) {
        while self.hits.front().is_some_and(|&t| t <= cutoff_us) {
            self.hits.pop_front();
        }
    }

    fn snapshot(&self, cutoff_us: i64) -> WindowSnapshot {
        let live = self.hits.iter().filter(|&&t| t > cutoff_us);
        let count = live.clone().count();
        if count == 0 {
            return WindowSnapshot::default();
        }
        WindowSnapshot {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            oldest_us: live.clone().min().copied(),
            newest_us: live.max().copied(),
            expires_us: Some(self.expires_us),
        }
    }
}

struct ActivityEntry {
    record: ActivityRecord,
    expires_us: i64,
}

#[derive(Default)]
struct MemoryState {
    windows: HashMap<String, Window>,
    /// (expires_us, key) for every entry in `windows`.
    expiry: BTreeSet<(i64, String)>,
    activity: HashMap<(String, String), Vec<ActivityEntry>>,
}

impl MemoryState {
    /// Drop every window whose key expired at or before `now_us`.
    fn purge_expired(&mut self, now_us: i64) {
        while self.expiry.first().is_some_and(|(expires_us, _)| *expires_us <= now_us) {
            if let Some((_, key)) = self.expiry.pop_first() {
                self.windows.remove(&key);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn record_hit(
        &self,
        key: &str,
        now_us: i64,
        window_us: i64,
        ttl_us: i64,
    ) -> VigilResult<WindowSnapshot> {
        let mut state = self.state.lock();
        state.purge_expired(now_us);
        let MemoryState { windows, expiry, .. } = &mut *state;
        let window = windows.entry(key.to_string()).or_default();
        let cutoff_us = now_us - window_us;
        window.evict(cutoff_us);
        // keep the deque ordered even if the clock stepped back
        let at = window.hits.partition_point(|&t| t <= now_us);
        window.hits.insert(at, now_us);
        expiry.remove(&(window.expires_us, key.to_string()));
        window.expires_us = now_us + ttl_us;
        expiry.insert((window.expires_us, key.to_string()));
        Ok(window.snapshot(cutoff_us))
    }

    fn window_status(&self, key: &str, now_us: i64, window_us: i64) -> VigilResult<WindowSnapshot> {
        let state = self.state.lock();
        Ok(match state.windows.get(key) {
            Some(window) if window.expires_us > now_us => window.snapshot(now_us - window_us),
            _ => WindowSnapshot::default(),
        })
    }

    fn reset(&self, key: &str) -> VigilResult<bool> {
        let mut state = self.state.lock();
        let Some(window) = state.windows.remove(key) else {
            return Ok(false);
        };
        state.expiry.remove(&(window.expires_us, key.to_string()));
        Ok(true)
    }

    fn active_keys(&self, prefix: &str, now_us: i64, limit: usize) -> VigilResult<Vec<String>> {
        let mut state = self.state.lock();
        state.purge_expired(now_us);
        let mut keys: Vec<String> = state
            .windows
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    fn append_activity(
        &self,
        identity: &str,
        day: &str,
        record: &ActivityRecord,
        expires_us: i64,
    ) -> VigilResult<()> {
        let now_us = record.timestamp.timestamp_micros();
        let mut state = self.state.lock();
        state.activity.retain(|_, entries| {
            entries.retain(|e| e.expires_us > now_us);
            !entries.is_empty()
        });
        state
            .activity
            .entry((identity.to_string(), day.to_string()))
            .or_default()
            .push(ActivityEntry {
                record: record.clone(),
                expires_us,
            });
        Ok(())
    }

    fn activities(&self, identity: &str, day: &str, now_us: i64) -> VigilResult<Vec<ActivityRecord>> {
        let state = self.state.lock();
        Ok(state
            .activity
            .get(&(identity.to_string(), day.to_string()))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.expires_us > now_us)
                    .map(|e| e.record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::store::test_support::{exercise_activity, exercise_window};

    #[test]
    fn test_window_semantics() {
        exercise_window(&MemoryStore::new());
    }

    #[test]
    fn test_activity_semantics() {
        exercise_activity(&MemoryStore::new());
    }

    #[test]
    fn test_concurrent_hits_are_serialized() {
        let store = Arc::new(MemoryStore::new());
        let t0 = 1_700_000_000_000_000;
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..50)
                        .map(|i| {
                            store
                                .record_hit("k", t0 + worker * 1_000 + i, 60_000_000, 120_000_000)
                                .unwrap()
                                .count
                        })
                        .collect::<Vec<u32>>()
                })
            })
            .collect();
        let mut counts: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        counts.sort_unstable();
        assert_eq!(counts, (1..=400).collect::<Vec<u32>>());
    }

    #[test]
    fn test_expired_windows_are_reclaimed_on_write() {
        let store = MemoryStore::new();
        let t0 = 1_700_000_000_000_000;
        let (window, ttl) = (60_000_000, 120_000_000);
        for i in 0..100 {
            store
                .record_hit(&format!("rate_limit:ip:{i}"), t0, window, ttl)
                .unwrap();
        }
        assert_eq!(store.state.lock().windows.len(), 100);

        store.record_hit("rate_limit:ip:late", t0 + ttl, window, ttl).unwrap();
        let state = store.state.lock();
        assert_eq!(state.windows.len(), 1);
        assert_eq!(state.expiry.len(), 1);
        assert!(state.windows.contains_key("rate_limit:ip:late"));
    }
}

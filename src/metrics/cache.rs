// 有界计数缓存
// 容量上限 + 惰性TTL过期，record 只做内存操作，flush 通过原子换出建立新纪元

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    count: i64,
    last_seen: Instant,
}

/// take_all_and_clear 返回的单个条目快照
#[derive(Debug, Clone)]
pub struct CounterSnapshot<V> {
    pub value: V,
    pub count: i64,
}

struct CacheInner<V> {
    entries: HashMap<String, Entry<V>>,
    // 进入顺序，用于容量淘汰
    admission: VecDeque<String>,
}

impl<V> CacheInner<V> {
    // 按进入顺序淘汰最早的常驻条目
    fn evict_oldest(&mut self) {
        while let Some(key) = self.admission.pop_front() {
            if self.entries.remove(&key).is_some() {
                break;
            }
        }
    }
}

/// 键到计数条目的并发映射
/// 调用方标识与路由分别持有独立实例，容量与TTL独立配置
pub struct CounterCache<V> {
    inner: Mutex<CacheInner<V>>,
    capacity: usize,
    ttl: Duration,
}

impl<V> CounterCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                admission: VecDeque::new(),
            }),
            capacity,
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 为 key 累加一次观测，未命中时通过 init 创建条目
    /// 只持锁做内存操作，不会被进行中的 flush 阻塞在 I/O 上
    pub fn record(&self, key: &str, init: impl FnOnce() -> V) {
        let now = Instant::now();
        let mut inner = self.lock();

        if let Some(entry) = inner.entries.get_mut(key) {
            if now.duration_since(entry.last_seen) <= self.ttl {
                entry.count += 1;
                entry.last_seen = now;
            } else {
                // 过期条目：残余计数已随上一纪元落库或被放弃，直接重建
                *entry = Entry {
                    value: init(),
                    count: 1,
                    last_seen: now,
                };
            }
            return;
        }

        if inner.entries.len() >= self.capacity {
            inner.evict_oldest();
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: init(),
                count: 1,
                last_seen: now,
            },
        );
        inner.admission.push_back(key.to_string());
    }

    /// 原子取出全部常驻条目并清空缓存，建立新的 flush 纪元
    /// 与并发 record 线性化：任一观测要么进入返回的快照，要么进入下一纪元
    pub fn take_all_and_clear(&self) -> Vec<CounterSnapshot<V>> {
        let now = Instant::now();
        let entries = {
            let mut inner = self.lock();
            inner.admission.clear();
            std::mem::take(&mut inner.entries)
        };

        entries
            .into_values()
            .filter(|e| now.duration_since(e.last_seen) <= self.ttl)
            .map(|e| CounterSnapshot {
                value: e.value,
                count: e.count,
            })
            .collect()
    }

    /// 近似常驻条目数，仅用于运行状态展示
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn record_creates_then_increments() {
        let cache = CounterCache::new(16, Duration::from_secs(60));
        cache.record("a", || "payload".to_string());
        cache.record("a", || unreachable!("init must not run on hit"));
        cache.record("b", || "other".to_string());

        let mut taken = cache.take_all_and_clear();
        taken.sort_by(|l, r| l.value.cmp(&r.value));
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[1].value, "payload");
        assert_eq!(taken[1].count, 2);
        assert_eq!(taken[0].count, 1);
    }

    #[test]
    fn capacity_ceiling_holds_after_every_insert() {
        let cache = CounterCache::new(4, Duration::from_secs(60));
        for i in 0..20 {
            cache.record(&format!("key-{i}"), || i);
            assert!(cache.len() <= 4, "len {} exceeded capacity", cache.len());
        }
        assert_eq!(cache.take_all_and_clear().len(), 4);
    }

    #[test]
    fn eviction_drops_oldest_admitted() {
        let cache = CounterCache::new(2, Duration::from_secs(60));
        cache.record("first", || ());
        cache.record("second", || ());
        cache.record("third", || ());

        // first 是最早进入的，应被淘汰
        cache.record("second", || unreachable!());
        cache.record("third", || unreachable!());
        let mut created = false;
        cache.record("first", || created = true);
        assert!(created);
    }

    #[test]
    fn expired_entry_absent_from_next_drain() {
        let cache = CounterCache::new(16, Duration::from_millis(30));
        cache.record("stale", || ());
        thread::sleep(Duration::from_millis(60));
        cache.record("fresh", || ());

        let taken = cache.take_all_and_clear();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].count, 1);
    }

    #[test]
    fn expired_entry_is_rebuilt_on_access() {
        let cache = CounterCache::new(16, Duration::from_millis(30));
        cache.record("k", || ());
        cache.record("k", || unreachable!());
        thread::sleep(Duration::from_millis(60));
        // 过期后重新观测，从 1 重新计数
        cache.record("k", || ());

        let taken = cache.take_all_and_clear();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].count, 1);
    }

    #[test]
    fn drain_establishes_fresh_epoch() {
        let cache = CounterCache::new(16, Duration::from_secs(60));
        cache.record("a", || ());
        assert_eq!(cache.take_all_and_clear().len(), 1);
        assert!(cache.is_empty());
        assert!(cache.take_all_and_clear().is_empty());
    }

    #[test]
    fn concurrent_record_and_drain_conserves_counts() {
        let cache = Arc::new(CounterCache::new(1024, Duration::from_secs(60)));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..250 {
                        cache.record("shared", || ());
                    }
                })
            })
            .collect();

        // 写入进行中反复换出纪元
        let mut drained: i64 = 0;
        for _ in 0..20 {
            drained += cache
                .take_all_and_clear()
                .iter()
                .map(|s| s.count)
                .sum::<i64>();
            thread::yield_now();
        }
        for w in writers {
            w.join().expect("writer thread panicked");
        }
        drained += cache
            .take_all_and_clear()
            .iter()
            .map(|s| s.count)
            .sum::<i64>();

        // 既不丢失也不重复：所有纪元计数之和等于写入总量
        assert_eq!(drained, 1000);
        assert!(cache.is_empty());
    }
}

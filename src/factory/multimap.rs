use std::collections::HashMap;
use std::hash::Hash;

/// 一个键对应多个值的表，值按插入顺序保存
///
/// 桶变空时连同键一起删除，所以 `is_empty` 等价于没有任何值。
#[derive(Debug)]
pub(crate) struct MultiMap<K, V> {
    buckets: HashMap<K, Vec<V>>,
}

impl<K: Hash + Eq, V> MultiMap<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, key: K, value: V) {
        self.buckets.entry(key).or_default().push(value);
    }

    pub(crate) fn get(&self, key: &K) -> Option<&[V]> {
        self.buckets.get(key).map(Vec::as_slice)
    }

    /// 删除桶中第一个满足条件的值，返回是否删除
    pub(crate) fn remove_first(&mut self, key: &K, predicate: impl Fn(&V) -> bool) -> bool {
        let Some(bucket) = self.buckets.get_mut(key) else {
            return false;
        };
        let Some(index) = bucket.iter().position(predicate) else {
            return false;
        };
        bucket.remove(index);
        if bucket.is_empty() {
            self.buckets.remove(key);
        }
        true
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &V> {
        self.buckets.values().flatten()
    }

    /// 键的数量
    pub(crate) fn key_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

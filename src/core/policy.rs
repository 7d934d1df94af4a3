//! 策略解析
//!
//! 文件默认 Mirrored。目录不向子项传递策略，只有一个例外：任一祖先目录的记录为
//! Excluded 时，所有后代都视为 Excluded，子项自身的记录无法覆盖。

use crate::core::metadata::{RecordMap, SyncPolicy};

pub struct PolicyResolver<'a> {
    records: &'a RecordMap,
}

impl<'a> PolicyResolver<'a> {
    pub fn new(records: &'a RecordMap) -> Self {
        Self { records }
    }

    /// 路径（`/` 分隔的相对路径）的有效策略
    pub fn effective_policy(&self, path: &str) -> SyncPolicy {
        if self.excluding_ancestor(path).is_some() {
            return SyncPolicy::Excluded;
        }
        self.records
            .get(path)
            .map(|r| r.policy)
            .unwrap_or_default()
    }

    /// 第一个（最靠近根的）Excluded 祖先目录
    pub fn excluding_ancestor(&self, path: &str) -> Option<&'a str> {
        let path = path.trim_matches('/');
        path.match_indices('/')
            .map(|(i, _)| &path[..i])
            .find_map(|ancestor| {
                self.records
                    .get_key_value(ancestor)
                    .filter(|(_, r)| r.policy == SyncPolicy::Excluded)
                    .map(|(k, _)| k.as_str())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::SyncRecord;

    fn records(entries: &[(&str, SyncPolicy)]) -> RecordMap {
        entries
            .iter()
            .map(|(p, policy)| {
                let mut r = SyncRecord::new(*p);
                r.policy = *policy;
                (p.to_string(), r)
            })
            .collect()
    }

    #[test]
    fn test_default_is_mirrored() {
        let map = RecordMap::new();
        let resolver = PolicyResolver::new(&map);
        assert_eq!(resolver.effective_policy("a/b/c.txt"), SyncPolicy::Mirrored);
    }

    #[test]
    fn test_excluded_is_sticky_downward() {
        let map = records(&[
            ("private", SyncPolicy::Excluded),
            ("private/keep.txt", SyncPolicy::Mirrored),
            ("private/deep/move.txt", SyncPolicy::RemoteOnly),
        ]);
        let resolver = PolicyResolver::new(&map);
        assert_eq!(resolver.effective_policy("private/keep.txt"), SyncPolicy::Excluded);
        assert_eq!(resolver.effective_policy("private/deep/move.txt"), SyncPolicy::Excluded);
        assert_eq!(resolver.excluding_ancestor("private/deep/move.txt"), Some("private"));
        // 前缀相同但不是祖先
        assert_eq!(resolver.effective_policy("private2/a.txt"), SyncPolicy::Mirrored);
    }

    #[test]
    fn test_other_parent_policies_do_not_propagate() {
        let map = records(&[
            ("archive", SyncPolicy::RemoteOnly),
            ("archive/b.txt", SyncPolicy::Excluded),
        ]);
        let resolver = PolicyResolver::new(&map);
        assert_eq!(resolver.effective_policy("archive/a.txt"), SyncPolicy::Mirrored);
        assert_eq!(resolver.effective_policy("archive/b.txt"), SyncPolicy::Excluded);
        assert_eq!(resolver.effective_policy("archive"), SyncPolicy::RemoteOnly);
    }
}

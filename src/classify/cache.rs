// 内容检测缓存
//
// checked: 已确认安全或已处理的域名（持久化）
// in_progress: 正在检测中的域名（仅进程内，用于去重，不持久化）
//
// 两个集合都使用同步锁：只在挂起点之间短暂持有，且 InProgressToken 的 Drop 需要同步释放

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Default)]
pub struct ClassificationCache {
    checked: RwLock<BTreeSet<String>>,
    in_progress: Arc<Mutex<HashSet<String>>>,
}

impl ClassificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_checked(&self, domain: &str) -> bool {
        self.checked
            .read()
            .map(|c| c.contains(domain))
            .unwrap_or(false)
    }

    pub fn is_in_progress(&self, domain: &str) -> bool {
        self.in_progress
            .lock()
            .map(|p| p.contains(domain))
            .unwrap_or(false)
    }

    /// 标记为已检测，返回是否为新增
    pub fn mark_checked(&self, domain: &str) -> bool {
        match self.checked.write() {
            Ok(mut checked) => checked.insert(domain.to_string()),
            Err(_) => false,
        }
    }

    /// 合并服务器的已检测列表，返回新增数量
    pub fn merge_checked<I, S>(&self, domains: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Ok(mut checked) = self.checked.write() else {
            return 0;
        };
        let before = checked.len();
        for domain in domains {
            let domain = domain.as_ref().trim().to_lowercase();
            if !domain.is_empty() {
                checked.insert(domain);
            }
        }
        checked.len() - before
    }

    pub fn checked_domains(&self) -> Vec<String> {
        self.checked
            .read()
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn checked_count(&self) -> usize {
        self.checked.read().map(|c| c.len()).unwrap_or(0)
    }

    /// 标记域名开始检测
    ///
    /// 已在检测中返回 None；返回的 token 被释放时自动清除标记，
    /// 无论检测成功、失败还是提前返回
    pub fn begin(&self, domain: &str) -> Option<InProgressToken> {
        let mut in_progress = self.in_progress.lock().ok()?;
        if !in_progress.insert(domain.to_string()) {
            return None;
        }
        Some(InProgressToken {
            domain: domain.to_string(),
            in_progress: Arc::clone(&self.in_progress),
        })
    }
}

/// 检测中标记，Drop 时移除
pub struct InProgressToken {
    domain: String,
    in_progress: Arc<Mutex<HashSet<String>>>,
}

impl InProgressToken {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Drop for InProgressToken {
    fn drop(&mut self) {
        if let Ok(mut in_progress) = self.in_progress.lock() {
            in_progress.remove(&self.domain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_deduplicates() {
        let cache = ClassificationCache::new();

        let token = cache.begin("example.com").unwrap();
        assert_eq!(token.domain(), "example.com");
        assert!(cache.is_in_progress("example.com"));
        assert!(cache.begin("example.com").is_none());

        drop(token);
        assert!(!cache.is_in_progress("example.com"));
        assert!(cache.begin("example.com").is_some());
    }

    #[test]
    fn test_merge_checked() {
        let cache = ClassificationCache::new();
        assert!(cache.mark_checked("a.com"));
        assert!(!cache.mark_checked("a.com"));

        let added = cache.merge_checked(vec!["A.com", "b.com", " c.com ", ""]);
        assert_eq!(added, 2);
        assert_eq!(cache.checked_domains(), vec!["a.com", "b.com", "c.com"]);
        assert!(cache.is_checked("c.com"));
    }
}

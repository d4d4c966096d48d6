use std::collections::HashSet;

use crate::normalize::normalize_url;

/// Append-only set of normalized URLs seen during one run.
///
/// Entries are never removed; `len()` is monotonic.
#[derive(Debug, Default)]
pub struct DedupIndex {
    seen: HashSet<String>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize `url` and record it. Returns the normalized form when the
    /// URL was not seen before, `None` for a duplicate.
    pub fn insert(&mut self, url: &str) -> Option<String> {
        let normalized = normalize_url(url);
        if self.seen.contains(&normalized) {
            return None;
        }
        self.seen.insert(normalized.clone());
        Some(normalized)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seen.contains(&normalize_url(url))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_variants_are_duplicates() {
        let mut index = DedupIndex::new();
        assert!(index.insert("https://shop.example/p/1").is_some());
        assert!(index.insert("https://shop.example/p/1/?utm_source=mail").is_none());
        assert!(index.insert("https://shop.example/p/1#specs").is_none());
        assert_eq!(index.len(), 1);
        assert!(index.contains("https://shop.example/p/1?gclid=zzz"));
    }

    #[test]
    fn len_never_decreases() {
        let mut index = DedupIndex::new();
        let mut last = 0;
        for url in [
            "https://a.example/1",
            "https://a.example/2",
            "https://a.example/1",
            "https://a.example/2?fbclid=1",
            "https://a.example/3",
        ] {
            index.insert(url);
            assert!(index.len() >= last);
            last = index.len();
        }
        assert_eq!(last, 3);
    }
}

//! Pagination loop detection.
//!
//! Catalog sites happily serve page 999 of a 3-page category by repeating the
//! last page, or keep emitting the same "next" link. Each fetched page is
//! reduced to a fingerprint of its product URLs and tracked per category key;
//! a category is retired once its fingerprint keeps repeating or once it stops
//! producing new URLs.

use std::collections::{HashMap, HashSet};

use crate::models::compute_hash;

/// Number of product URLs that contribute to a fingerprint.
pub const FINGERPRINT_URL_LIMIT: usize = 200;

/// Sightings of one fingerprint within a category that count as a loop.
pub const LOOP_REPEAT_THRESHOLD: u32 = 3;

/// Consecutive pages without new unique URLs that retire a category.
pub const ZERO_UNIQUE_STREAK_LIMIT: u32 = 2;

/// Hash over the sorted, de-duplicated, truncated list of page URLs.
pub fn page_fingerprint(urls: &[String]) -> String {
    let mut unique: Vec<&str> = urls.iter().map(String::as_str).collect();
    unique.sort_unstable();
    unique.dedup();
    unique.truncate(FINGERPRINT_URL_LIMIT);
    compute_hash(&unique.join("\n"))
}

/// What the collector should do with a category after observing one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageVerdict {
    Continue,
    /// The same fingerprint was seen `LOOP_REPEAT_THRESHOLD` times.
    LoopDetected,
    /// `ZERO_UNIQUE_STREAK_LIMIT` pages in a row added nothing new.
    NoNewUniques,
}

#[derive(Debug, Default)]
pub struct LoopDetector {
    sightings: HashMap<(String, String), u32>,
    zero_unique_streak: HashMap<String, u32>,
    retired: HashSet<String>,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fetched page of `category_key`.
    pub fn observe(&mut self, category_key: &str, fingerprint: &str, new_unique: usize) -> PageVerdict {
        if self.retired.contains(category_key) {
            return PageVerdict::Continue;
        }

        let seen = self
            .sightings
            .entry((category_key.to_string(), fingerprint.to_string()))
            .or_insert(0);
        *seen += 1;
        if *seen >= LOOP_REPEAT_THRESHOLD {
            self.retired.insert(category_key.to_string());
            return PageVerdict::LoopDetected;
        }

        let streak = self
            .zero_unique_streak
            .entry(category_key.to_string())
            .or_insert(0);
        if new_unique == 0 {
            *streak += 1;
            if *streak >= ZERO_UNIQUE_STREAK_LIMIT {
                self.retired.insert(category_key.to_string());
                return PageVerdict::NoNewUniques;
            }
        } else {
            *streak = 0;
        }
        PageVerdict::Continue
    }

    /// Categories retired so far. Retirement is permanent for the run.
    pub fn is_retired(&self, category_key: &str) -> bool {
        self.retired.contains(category_key)
    }

    /// Retire a category for a reason decided elsewhere (e.g. an empty page).
    pub fn retire(&mut self, category_key: &str) {
        self.retired.insert(category_key.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fingerprint_ignores_order_and_duplicates() {
        let a = page_fingerprint(&urls(&["https://x/1", "https://x/2"]));
        let b = page_fingerprint(&urls(&["https://x/2", "https://x/1", "https://x/2"]));
        assert_eq!(a, b);
        assert_ne!(a, page_fingerprint(&urls(&["https://x/3"])));
    }

    #[test]
    fn fingerprint_truncates_long_pages() {
        let base: Vec<String> = (0..FINGERPRINT_URL_LIMIT)
            .map(|i| format!("https://x/{i:05}"))
            .collect();
        let mut longer = base.clone();
        longer.push("https://x/99999".to_string());
        assert_eq!(page_fingerprint(&base), page_fingerprint(&longer));
    }

    #[test]
    fn third_identical_sighting_is_a_loop() {
        let mut detector = LoopDetector::new();
        let fp = page_fingerprint(&urls(&["https://x/1"]));
        assert_eq!(detector.observe("cat", &fp, 1), PageVerdict::Continue);
        assert_eq!(detector.observe("cat", &fp, 1), PageVerdict::Continue);
        assert_eq!(detector.observe("cat", &fp, 1), PageVerdict::LoopDetected);
        assert!(detector.is_retired("cat"));
    }

    #[test]
    fn two_empty_harvests_retire_category() {
        let mut detector = LoopDetector::new();
        assert_eq!(detector.observe("cat", "a", 0), PageVerdict::Continue);
        assert_eq!(detector.observe("cat", "b", 0), PageVerdict::NoNewUniques);
        assert!(detector.is_retired("cat"));
    }

    #[test]
    fn new_uniques_reset_the_streak() {
        let mut detector = LoopDetector::new();
        assert_eq!(detector.observe("cat", "a", 0), PageVerdict::Continue);
        assert_eq!(detector.observe("cat", "b", 4), PageVerdict::Continue);
        assert_eq!(detector.observe("cat", "c", 0), PageVerdict::Continue);
        assert!(!detector.is_retired("cat"));
    }

    #[test]
    fn categories_are_tracked_independently() {
        let mut detector = LoopDetector::new();
        for _ in 0..2 {
            detector.observe("a", "fp", 1);
        }
        assert_eq!(detector.observe("b", "fp", 1), PageVerdict::Continue);
        assert_eq!(detector.observe("a", "fp", 1), PageVerdict::LoopDetected);
        assert!(!detector.is_retired("b"));
    }
}

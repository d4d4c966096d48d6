use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A discovered product URL, already normalized.
///
/// Identity is the normalized `url` string. Fields are declared in key
/// order so the wire form is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateUrl {
    pub material_type: Option<String>,
    pub url: String,
}

impl CandidateUrl {
    pub fn new(url: impl Into<String>, material_type: Option<String>) -> Self {
        Self {
            material_type,
            url: url.into(),
        }
    }
}

/// Stock state shown on a product page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    InStock,
    OnOrder,
}

/// Structured product record returned by an extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub article: String,
    pub name: String,
    /// `None` when the price could not be parsed.
    pub price_per_unit: Option<f64>,
    #[serde(rename = "type")]
    pub material_type: String,
    pub unit: String,
    pub availability_status: Availability,
    pub source_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub origin: String,
    pub parsed_at: DateTime<Utc>,
}

impl ProductRecord {
    /// True if a non-negative price was extracted.
    pub fn has_price(&self) -> bool {
        self.price_per_unit.is_some_and(|p| p >= 0.0)
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_compute_hash_different_inputs() {
        assert_ne!(compute_hash("hello"), compute_hash("world"));
    }

    #[test]
    fn test_has_price() {
        let mut record = crate::testutil::make_test_record("https://shop.example/p/1");
        assert!(record.has_price());
        record.price_per_unit = None;
        assert!(!record.has_price());
        record.price_per_unit = Some(-1.0);
        assert!(!record.has_price());
    }

    #[test]
    fn test_record_wire_shape() {
        let record = crate::testutil::make_test_record("https://shop.example/p/1");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "plate");
        assert_eq!(value["availability_status"], "in_stock");
        assert_eq!(value["origin"], "parser");
        assert!(value.get("currency").is_none());
    }
}

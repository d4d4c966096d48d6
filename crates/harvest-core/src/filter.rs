use serde::Serialize;

/// Counters kept by [`KeywordFilter::accept`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub checked: u64,
    pub passed: u64,
    pub excluded: u64,
    /// Accepted because no include keywords are configured.
    pub no_keywords: u64,
    pub matched: u64,
    pub no_match: u64,
}

/// Case-insensitive substring filter over candidate URLs.
///
/// Exclusion is evaluated first; an empty include list accepts everything
/// that was not excluded.
#[derive(Debug, Clone, Default)]
pub struct KeywordFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    material_types: Vec<String>,
}

fn lowered(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

impl KeywordFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            include: lowered(include),
            exclude: lowered(exclude),
            material_types: Vec::new(),
        }
    }

    /// Material tags tried first by [`KeywordFilter::infer_material`].
    pub fn with_material_types(mut self, material_types: &[String]) -> Self {
        self.material_types = lowered(material_types);
        self
    }

    pub fn accept(&self, url: &str, stats: &mut FilterStats) -> bool {
        stats.checked += 1;
        let lower = url.to_lowercase();

        if self.exclude.iter().any(|k| lower.contains(k.as_str())) {
            stats.excluded += 1;
            return false;
        }
        if self.include.is_empty() {
            stats.no_keywords += 1;
            stats.passed += 1;
            return true;
        }
        if self.include.iter().any(|k| lower.contains(k.as_str())) {
            stats.matched += 1;
            stats.passed += 1;
            true
        } else {
            stats.no_match += 1;
            false
        }
    }

    /// First configured material type contained in the URL, falling back to
    /// the first matching include keyword.
    pub fn infer_material(&self, url: &str) -> Option<String> {
        let lower = url.to_lowercase();
        self.material_types
            .iter()
            .chain(self.include.iter())
            .find(|k| lower.contains(k.as_str()))
            .cloned()
    }
}

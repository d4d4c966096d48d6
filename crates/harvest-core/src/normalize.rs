//! URL canonicalization used for identity comparison.
//!
//! Two hrefs that point at the same product must map to the same string:
//! tracking parameters, fragments and a trailing slash are dropped, and the
//! remaining query parameters keep their original order.

use url::Url;
use url::form_urlencoded;

/// Query parameters that never change page identity.
pub const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "yclid",
    "_ga",
];

fn is_tracking(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    TRACKING_PARAMS.contains(&key.as_str())
}

/// Canonicalize a URL. Unparseable input is returned unchanged.
///
/// ```
/// use harvest_core::normalize::normalize_url;
///
/// assert_eq!(
///     normalize_url("https://shop.example/p/5/?utm_source=x&id=5#reviews"),
///     "https://shop.example/p/5?id=5"
/// );
/// ```
pub fn normalize_url(raw: &str) -> String {
    let Ok(url) = Url::parse(raw.trim()) else {
        return raw.to_string();
    };
    rebuild(&url, |key| !is_tracking(key))
}

/// Group key for pagination state: the URL with the pagination parameter
/// (and tracking parameters) removed.
pub fn category_key(raw: &str, pagination_param: Option<&str>) -> String {
    let Ok(url) = Url::parse(raw.trim()) else {
        return raw.to_string();
    };
    rebuild(&url, |key| {
        !is_tracking(key) && pagination_param.is_none_or(|p| p != key)
    })
}

/// Resolve an href found on `base` into an absolute URL.
pub fn resolve_href(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href.starts_with("mailto:") {
        return None;
    }
    let base = Url::parse(base).ok()?;
    let joined = base.join(href).ok()?;
    match joined.scheme() {
        "http" | "https" => Some(joined.to_string()),
        _ => None,
    }
}

fn rebuild(url: &Url, keep: impl Fn(&str) -> bool) -> String {
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return strip_opaque(url, keep);
    }
    let path = match url.path() {
        "/" | "" => "/",
        p => p.trim_end_matches('/'),
    };
    let path = if path.is_empty() { "/" } else { path };

    let mut out = format!("{}://", url.scheme());
    if let Some(host) = url.host_str() {
        out.push_str(host);
    }
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    out.push_str(path);

    if let Some(query) = filtered_query(url, &keep) {
        out.push('?');
        out.push_str(&query);
    }
    out
}

/// URLs without an authority (`mailto:`, `data:`, `file:///...`) keep their
/// path as is; only the fragment and tracking parameters go.
fn strip_opaque(url: &Url, keep: impl Fn(&str) -> bool) -> String {
    let mut out = url.clone();
    out.set_fragment(None);
    let query = filtered_query(url, &keep);
    out.set_query(query.as_deref());
    out.to_string()
}

fn filtered_query(url: &Url, keep: &impl Fn(&str) -> bool) -> Option<String> {
    url.query()?;
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    let mut any = false;
    for (k, v) in url.query_pairs() {
        if keep(&k) {
            serializer.append_pair(&k, &v);
            any = true;
        }
    }
    any.then(|| serializer.finish())
}

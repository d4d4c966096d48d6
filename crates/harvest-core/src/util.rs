use std::sync::{Mutex, MutexGuard};

use url::Url;

/// Rate-limiting key of a URL: the network location (`host[:port]`).
///
/// Falls back to the raw input for unparseable URLs so they still share one
/// bucket instead of bypassing the limiter.
pub fn domain_key(url_str: &str) -> String {
    let Ok(url) = Url::parse(url_str) else {
        return url_str.to_string();
    };
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => url_str.to_string(),
    }
}

/// Acquires a std mutex, recovering from poison if necessary.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, name: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(lock = %name, "Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use parking_lot::Mutex;

/// In-memory response cache, fingerprinted by `(method, path)`.
///
/// The stored value is the complete wire response the proxy would otherwise
/// have produced, so a hit short-circuits backend selection entirely. Expiry
/// is checked on lookup, there is no background sweep, and mutating verbs
/// are never served from here.
///
/// # Test
///
/// ```
/// use bytes::Bytes;
/// use relay_server_service::cache::Cache;
///
/// let cache = Cache::default();
///
/// cache.put("GET", "/x", Bytes::from_static(b"response"), 60);
/// assert_eq!(cache.get("GET", "/x"), Some(Bytes::from_static(b"response")));
///
/// // POST entries are written but never read back.
/// cache.put("POST", "/x", Bytes::from_static(b"response"), 60);
/// assert_eq!(cache.get("POST", "/x"), None);
///
/// // A zero max-age is already expired at lookup time.
/// cache.put("GET", "/y", Bytes::from_static(b"response"), 0);
/// assert_eq!(cache.get("GET", "/y"), None);
/// ```
#[derive(Default)]
pub struct Cache(Mutex<HashMap<(String, String), (Bytes, Instant)>>);

impl Cache {
    /// Look a response up. Misses on `POST`, on absence, and on expiry; an
    /// expired entry is erased on the way out.
    pub fn get(&self, method: &str, path: &str) -> Option<Bytes> {
        let method = method.to_ascii_uppercase();
        if method == "POST" {
            return None;
        }

        let key = (method, path.to_string());
        let mut table = self.0.lock();

        match table.get(&key) {
            None => None,
            Some((message, expiry)) => {
                if Instant::now() >= *expiry {
                    table.remove(&key);
                    None
                } else {
                    Some(message.clone())
                }
            }
        }
    }

    /// Memoize a response for `max_age` seconds, overwriting any previous
    /// entry under the same fingerprint.
    pub fn put(&self, method: &str, path: &str, message: Bytes, max_age: u64) {
        let key = (method.to_ascii_uppercase(), path.to_string());
        let expiry = Instant::now() + Duration::from_secs(max_age);
        self.0.lock().insert(key, (message, expiry));
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

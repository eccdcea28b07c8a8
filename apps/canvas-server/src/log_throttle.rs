use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

const INTERVAL: Duration = Duration::from_secs(30);

static LAST_LOGGED: Lazy<Mutex<HashMap<&'static str, Instant>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Rate-limit repeated warnings for the same failing operation. A dead cache fails
/// on every placement; one line per op per interval is enough.
pub fn should_log(op: &'static str) -> bool {
    let mut guard = LAST_LOGGED.lock();
    let now = Instant::now();
    if let Some(last) = guard.get(op) {
        if now.duration_since(*last) < INTERVAL {
            return false;
        }
    }
    guard.insert(op, now);
    true
}

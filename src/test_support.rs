//! Helpers shared by the async tests.

use std::time::Duration;

/// Poll `check` every 10ms for up to two seconds.
pub(crate) async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

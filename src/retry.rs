use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait after forceful termination before declaring anything residual.
pub const SETTLE_WINDOW: Duration = Duration::from_secs(1);

/// Re-run `check` every `interval` until it returns true or `window` has
/// elapsed. The check always runs at least once, and once more at the
/// deadline. Returns whether the condition was observed.
pub async fn poll_until<F, Fut>(window: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + window;
    loop {
        if check().await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

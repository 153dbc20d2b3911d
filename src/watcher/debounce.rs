use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

/// Collapse bursts of change signals into one call to `on_quiet`.
///
/// The first signal opens a window; every further signal restarts it. Once
/// `window` passes without a signal, `on_quiet` runs once. Returns when the
/// sender side closes, flushing any open window first.
pub async fn debounce<F>(mut signals: mpsc::Receiver<()>, window: Duration, mut on_quiet: F)
where
    F: FnMut(),
{
    while signals.recv().await.is_some() {
        let deadline = sleep(window);
        tokio::pin!(deadline);
        let mut bursts = 1u32;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::debug!(bursts, "change window closed");
                    on_quiet();
                    break;
                }
                next = signals.recv() => match next {
                    Some(()) => {
                        bursts += 1;
                        deadline.as_mut().reset(Instant::now() + window);
                    }
                    None => {
                        on_quiet();
                        return;
                    }
                },
            }
        }
    }
}

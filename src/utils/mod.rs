use crate::shutdown::Shutdown;
use futures::future::Either;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::select;
use tokio::task::JoinHandle;
use tracing::error;

/// Spawns a future that retries on failure with a fixed backoff.
///
/// The future is retried until it succeeds or a shutdown signal is received.
/// During a shutdown, the in-flight attempt is cancelled immediately.
pub fn spawn_with_backoff_cancel_on_shutdown<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let shutting_down = AtomicBool::new(false);
        select! {
            () = retry_future(future_spawner, backoff_duration, &shutting_down) => {},
            () = await_shutdown_begin(shutdown, &shutting_down) => {},
        }
    })
}

/// Spawns a future that retries on failure with a fixed backoff.
///
/// The future is retried until it succeeds or a shutdown signal is received.
/// During a shutdown, the in-flight attempt is allowed to finish so it can run
/// its own cleanup logic.
pub fn spawn_with_backoff<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let shutting_down = AtomicBool::new(false);
        let retry = Either::Left(retry_future(future_spawner, backoff_duration, &shutting_down));
        let shutdown = Either::Right(await_shutdown_begin(shutdown, &shutting_down));

        futures::stream::iter(vec![retry, shutdown])
            .buffered(2)
            .next()
            .await;
    })
}

async fn await_shutdown_begin(shutdown: Shutdown, shutting_down: &AtomicBool) {
    shutdown.await_shutdown_begin().await;
    shutting_down.store(true, Ordering::SeqCst);
}

/// Adds up to 20% jitter to a backoff so a fleet of restarting tasks (e.g.
/// several site pools' refill loops restarting after a shared dependency
/// blip) doesn't retry in lockstep.
fn jittered(backoff_duration: Duration) -> Duration {
    let jitter_ms = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=backoff_duration.as_millis() as u64 / 5);
    backoff_duration + Duration::from_millis(jitter_ms)
}

async fn retry_future<S, F>(future_spawner: S, backoff_duration: Duration, shutting_down: &AtomicBool)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    loop {
        let future = std::panic::AssertUnwindSafe(future_spawner());
        let result = future.catch_unwind().await;

        match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                error!("Task failed: {e:?}");
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(jittered(backoff_duration)).await;
            }
            Err(e) => {
                error!("Task panicked: {e:?}");
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(jittered(backoff_duration)).await;
            }
        }
    }
}

/// Writes `contents` to `path` atomically by writing to a temp file in the
/// same directory and renaming over the target.
pub async fn atomic_write(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, contents)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn spawn_with_backoff_retries_until_success() {
        let can_finish = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicBool::new(false));
        let shutdown = Shutdown::spawn(Duration::from_secs(30), Duration::from_secs(1));

        let handle = {
            let can_finish = can_finish.clone();
            let attempts = attempts.clone();
            spawn_with_backoff(
                move || {
                    let can_finish = can_finish.clone();
                    let attempts = attempts.clone();
                    async move {
                        if can_finish.load(Ordering::SeqCst) {
                            Ok(())
                        } else {
                            attempts.store(true, Ordering::SeqCst);
                            anyhow::bail!("not yet")
                        }
                    }
                },
                Duration::from_millis(20),
                shutdown,
            )
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(attempts.load(Ordering::SeqCst));
        assert!(!handle.is_finished());

        can_finish.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("task should finish")
            .unwrap();
    }

    #[test]
    fn jittered_backoff_never_shrinks_and_stays_bounded() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let jittered = jittered(base);
            assert!(jittered >= base);
            assert!(jittered <= base + Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn atomic_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        atomic_write(&path, b"hello").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }
}

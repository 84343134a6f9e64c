//! Bridge from synchronous callers onto the async API.

use std::{future::Future, panic, sync::OnceLock};

use tokio::runtime::{Builder, Handle, Runtime};

/// Drive `future` to completion from synchronous code.
///
/// Inside a Tokio runtime the future runs on a scoped helper thread that
/// enters the caller's runtime, so the caller's worker is blocked but the
/// runtime keeps making progress on its other workers. That means this must
/// not be called from the thread of a current-thread runtime.
///
/// # Panics
/// Panics if no runtime is current and a fallback runtime cannot be built,
/// or if `future` panics.
pub(crate) fn block_on<F>(future: F) -> F::Output
where
    F: Future + Send,
    F::Output: Send,
{
    static RT: OnceLock<Runtime> = OnceLock::new();

    if let Ok(handle) = Handle::try_current() {
        std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = handle.enter();
                futures::executor::block_on(future)
            })
            .join()
            .unwrap_or_else(|payload| panic::resume_unwind(payload))
        })
    } else {
        RT.get_or_init(|| {
            Builder::new_current_thread()
                .enable_all()
                .thread_name("mdk-blocking")
                .build()
                .unwrap_or_else(|e| panic!("failed to build MDK blocking runtime: {e}"))
        })
        .block_on(future)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_block_on_without_runtime() {
        let value = block_on(async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            7
        });
        assert_eq!(value, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_on_inside_runtime() {
        let handle = tokio::spawn(async { 3 });
        let value = block_on(async move { handle.await.unwrap() * 2 });
        assert_eq!(value, 6);
    }
}

#![deny(missing_docs)]
//! Test utilities for fcplink.

pub mod node;

/// Enable tracing with the RUST_LOG environment variable.
///
/// This is intended to be used in tests, so it defaults to DEBUG level.
pub fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .try_init();
}

/// Poll a block until it returns, failing after a timeout in
/// milliseconds. Use `return value;` inside the block to finish.
#[macro_export]
macro_rules! iter_check {
    ($timeout_ms:expr, $code:block) => {{
        tokio::time::timeout(
            std::time::Duration::from_millis($timeout_ms),
            async {
                loop {
                    $code
                    tokio::time::sleep(std::time::Duration::from_millis(10))
                        .await;
                }
            },
        )
        .await
        .expect("iter_check timed out")
    }};
    ($code:block) => {
        $crate::iter_check!(1000, $code)
    };
}

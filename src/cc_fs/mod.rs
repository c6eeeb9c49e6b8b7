//! Small file utilities used by the configuration loader.
//!
//! Thin wrappers around `tokio::fs`, kept separate so call sites read like
//! `cc_fs::read_txt(path)` instead of bare `tokio::fs` calls scattered
//! through `config.rs`.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::task::LocalSet;

/// Reads the entire contents of a text file into a UTF-8 encoded string.
pub async fn read_txt(path: impl AsRef<Path>) -> Result<String> {
    Ok(tokio::fs::read_to_string(path).await?)
}

/// Writes the given string to a file at the given path, creating or truncating it.
pub async fn write_string(path: impl AsRef<Path>, txt: String) -> Result<()> {
    tokio::fs::write(path, txt.into_bytes()).await?;
    Ok(())
}

/// Recursively creates a directory and all missing parent directories.
pub async fn create_dir_all(path: impl AsRef<Path>) -> Result<()> {
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

/// Returns whether a path exists, without distinguishing file/directory.
pub async fn exists(path: impl AsRef<Path>) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Initialize and run the single-threaded Tokio runtime.
///
/// The supervisor loop and servo soft-motion tasks are all `!Send` (they
/// share state through `Rc`/`RefCell`), so everything runs on a `LocalSet`
/// inside a current-thread runtime rather than the multi-threaded scheduler.
pub fn runtime<F: std::future::Future>(future: F) -> F::Output {
    let rt = Builder::new_current_thread()
        .enable_all()
        .thread_name("dryercontrold-wrk")
        .thread_keep_alive(Duration::from_secs(5))
        .build();
    rt.unwrap().block_on(LocalSet::new().run_until(future))
}

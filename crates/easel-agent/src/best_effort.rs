//! Non-fatal operations: failures are logged at `warn` and dropped.
//!
//! Only the cleanup and detection sites that must not abort their caller go
//! through here (process termination, temp-file removal, directory cleanup).

use std::fmt::Display;

pub fn log_failure<T, E: Display>(what: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "{what} failed (ignored)");
            None
        }
    }
}

pub async fn run<T, E, F>(what: &str, fut: F) -> Option<T>
where
    E: Display,
    F: std::future::Future<Output = Result<T, E>>,
{
    log_failure(what, fut.await)
}

/// Remove a file if present; absence is not a failure.
pub async fn remove_file(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "remove file failed (ignored)");
        }
    }
}

/// Remove a directory tree if present; absence is not a failure.
pub async fn remove_dir_all(path: &std::path::Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "remove dir failed (ignored)");
        }
    }
}

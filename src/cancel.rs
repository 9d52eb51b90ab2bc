//! Cooperative cancellation shared by every in-flight task.
//!
//! One token propagates a single cancellation signal: blocking loops call
//! [`CancelToken::check`] at their suspension points and unwind with
//! [`LuigiError::Aborted`]. An observing UI can request cancellation by
//! dropping a `cancel.request` file into the run directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::info;

use crate::error::LuigiError;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Error out of the current operation when cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(anyhow!(LuigiError::Aborted));
        }
        Ok(())
    }

    /// Watch for a `cancel.request` file in `run_dir` on a background
    /// thread. The thread exits once the token fires.
    pub fn watch_file(&self, run_dir: PathBuf, poll_interval: Duration) {
        let token = self.clone();
        thread::spawn(move || {
            let marker = run_dir.join("cancel.request");
            loop {
                if token.is_cancelled() {
                    return;
                }
                if marker.exists() {
                    info!("cancel request file observed");
                    token.cancel();
                    return;
                }
                thread::sleep(poll_interval);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_fails_only_after_cancel() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        let err = token.check().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LuigiError>(),
            Some(LuigiError::Aborted)
        ));
    }

    #[test]
    fn cancel_file_fires_token() {
        let temp = tempfile::tempdir().expect("tempdir");
        let token = CancelToken::new();
        token.watch_file(temp.path().to_path_buf(), Duration::from_millis(10));
        std::fs::write(temp.path().join("cancel.request"), "").expect("write");
        for _ in 0..100 {
            if token.is_cancelled() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("cancel file was not observed");
    }
}

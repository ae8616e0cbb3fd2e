//! Per-invocation context threaded through every component.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::utils::errors::{Result, SyncError};

/// Created once by the entry point and passed explicitly.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub config: Arc<Config>,
    pub user_id: String,
    pub hostname: String,
    pub cancel: CancellationToken,
}

impl SyncContext {
    /// Build a context, resolving the user from the config or `$USER`.
    pub fn new(config: Config) -> Self {
        let user_id = config
            .repository
            .user_id
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "unknown".to_string());

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            config: Arc::new(config),
            user_id,
            hostname,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn configured_user_wins() {
        let mut config = Config::for_root(Path::new("/tmp/x"));
        config.repository.user_id = Some("carol".into());
        let ctx = SyncContext::new(config);
        assert_eq!(ctx.user_id, "carol");
        assert!(!ctx.hostname.is_empty());
    }

    #[test]
    fn cancellation_is_observed() {
        let ctx = SyncContext::new(Config::for_root(Path::new("/tmp/x")));
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(SyncError::Cancelled)));
    }
}

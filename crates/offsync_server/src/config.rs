//! Server configuration.

use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum mutations accepted in one batch request.
    pub max_batch_size: usize,
    /// Worker threads reconciling one batch.
    pub reconcile_workers: usize,
    /// Change feed page size when the request names none.
    pub default_feed_limit: usize,
    /// Upper bound on the change feed page size.
    pub max_feed_limit: usize,
    /// Whether to require authentication.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Lifetime of issued tokens.
    pub token_expiry: Duration,
}

impl ServerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_batch_size: 500,
            reconcile_workers: 4,
            default_feed_limit: 100,
            max_feed_limit: 1000,
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the maximum batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Sets the number of reconcile workers.
    pub fn with_reconcile_workers(mut self, workers: usize) -> Self {
        self.reconcile_workers = workers.max(1);
        self
    }

    /// Sets the default and maximum change feed page sizes.
    pub fn with_feed_limits(mut self, default: usize, max: usize) -> Self {
        self.max_feed_limit = max.max(1);
        self.default_feed_limit = default.clamp(1, self.max_feed_limit);
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Page size for a request asking for `requested`.
    pub fn feed_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_feed_limit)
            .clamp(1, self.max_feed_limit)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

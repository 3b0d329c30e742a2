//! Request handlers for sync endpoints.

use crate::auth::{Principal, PrincipalProvider};
use crate::change_feed::ChangeFeed;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::reconciler::Reconciler;
use crate::repository::EntityRepository;
use crate::resolver::ConflictResolver;
use offsync_protocol::{
    BatchRequest, BatchResponse, BulkRequest, BulkResponse, BulkSummary, ChangesRequest,
    ChangesResponse, EntityType, ResolveRequest, ResolveResponse, StatusResponse, Timestamp,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Entity storage (shared across all handlers).
    pub repository: Arc<dyn EntityRepository>,
    /// Resolves callers from bearer tokens.
    pub provider: Arc<dyn PrincipalProvider>,
    /// Last push time per user id.
    sessions: RwLock<HashMap<String, Timestamp>>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(
        config: ServerConfig,
        repository: Arc<dyn EntityRepository>,
        provider: Arc<dyn PrincipalProvider>,
    ) -> Self {
        Self {
            config,
            repository,
            provider,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Authenticates a bearer token.
    pub fn authenticate(&self, bearer: Option<&str>) -> ServerResult<Principal> {
        self.provider.authenticate(bearer)
    }

    fn record_sync(&self, principal: &Principal, at: Timestamp) {
        self.sessions.write().insert(principal.user_id.clone(), at);
    }

    /// Last recorded push of a user.
    pub fn last_sync(&self, user_id: &str) -> Option<Timestamp> {
        self.sessions.read().get(user_id).copied()
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
    reconciler: Reconciler,
    feed: ChangeFeed,
    resolver: ConflictResolver,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        let repository = Arc::clone(&context.repository);
        Self {
            reconciler: Reconciler::new(Arc::clone(&repository), context.config.reconcile_workers),
            feed: ChangeFeed::new(Arc::clone(&repository)),
            resolver: ConflictResolver::new(repository),
            context,
        }
    }

    /// Handles `POST sync/batch`.
    pub fn handle_batch(
        &self,
        principal: &Principal,
        request: &BatchRequest,
    ) -> ServerResult<BatchResponse> {
        self.check_batch_size(request.operations.len())?;
        let response = self.reconciler.reconcile(principal, request);
        self.context
            .record_sync(principal, self.context.repository.server_time());
        Ok(response)
    }

    /// Handles `POST sync/bulk`.
    pub fn handle_bulk(
        &self,
        principal: &Principal,
        request: &BulkRequest,
    ) -> ServerResult<BulkResponse> {
        let sections = request.sections();
        self.check_batch_size(sections.iter().map(|(_, ops)| ops.len()).sum())?;

        let mut results = BTreeMap::new();
        for (entity_type, operations) in sections {
            let batch = BatchRequest::new(entity_type, operations.to_vec());
            let response = self.reconciler.reconcile(principal, &batch);
            results.insert(
                entity_type.plural().to_string(),
                BulkSummary::from(&response),
            );
        }

        let server_time = self.context.repository.server_time();
        self.context.record_sync(principal, server_time);
        info!(user = %principal.user_id, types = results.len(), "bulk push");
        Ok(BulkResponse {
            results,
            server_time,
        })
    }

    /// Handles `GET sync/changes`.
    pub fn handle_changes(&self, request: &ChangesRequest) -> ServerResult<ChangesResponse> {
        let config = &self.context.config;
        self.feed.serve(request, |limit| config.feed_limit(limit))
    }

    /// Handles `POST sync/resolve-conflict`.
    pub fn handle_resolve(&self, request: &ResolveRequest) -> ServerResult<ResolveResponse> {
        self.resolver.resolve(request)
    }

    /// Handles `GET sync/status`.
    pub fn handle_status(&self, principal: &Principal) -> ServerResult<StatusResponse> {
        let mut entity_counts = BTreeMap::new();
        for entity_type in EntityType::ALL {
            entity_counts.insert(
                entity_type.plural().to_string(),
                self.context.repository.count(entity_type)?,
            );
        }
        Ok(StatusResponse {
            status: "ok".to_string(),
            server_time: self.context.repository.server_time(),
            last_sync: self.context.last_sync(&principal.user_id),
            entity_counts,
        })
    }

    fn check_batch_size(&self, len: usize) -> ServerResult<()> {
        let max = self.context.config.max_batch_size;
        if len > max {
            return Err(ServerError::InvalidRequest(format!(
                "too many operations: {len} > {max}"
            )));
        }
        Ok(())
    }
}

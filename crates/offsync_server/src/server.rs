//! Main sync server.

use crate::auth::{AuthConfig, DenyAll, PrincipalProvider, StaticPrincipal, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::repository::{EntityRepository, MemoryRepository};
use offsync_protocol::{ChangesRequest, HttpMethod, HttpRequest, HttpResponse};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// User id reported when authentication is disabled.
pub const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Batch,
    Bulk,
    Changes,
    Resolve,
    Status,
}

impl Route {
    fn parse(method: HttpMethod, path: &str) -> Option<Route> {
        let path = path.trim_matches('/');
        match (method, path) {
            (HttpMethod::Post, "sync/batch") => Some(Route::Batch),
            (HttpMethod::Post, "sync/bulk") => Some(Route::Bulk),
            (HttpMethod::Get, "sync/changes") => Some(Route::Changes),
            (HttpMethod::Post, "sync/resolve-conflict") => Some(Route::Resolve),
            (HttpMethod::Get, "sync/status") => Some(Route::Status),
            _ => None,
        }
    }
}

/// The sync server.
///
/// Dispatches HTTP-shaped requests to the reconciler, change feed and
/// conflict resolver. It does not listen on a socket; any HTTP framework can
/// translate its requests into `HttpRequest` and call [`SyncServer::handle`].
///
/// # Example
///
/// ```
/// use offsync_server::{SyncServer, ServerConfig};
/// use offsync_protocol::HttpRequest;
///
/// let server = SyncServer::new(ServerConfig::default());
/// let response = server.handle(HttpRequest::get("/sync/status"));
/// assert_eq!(response.status, 200);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a server with an in-memory repository.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_repository(config, Arc::new(MemoryRepository::new()))
    }

    /// Creates a server over an existing repository. The principal provider
    /// follows the configuration: signed tokens when auth is required,
    /// otherwise every caller is anonymous. Requiring auth without a secret
    /// rejects every request.
    pub fn with_repository(config: ServerConfig, repository: Arc<dyn EntityRepository>) -> Self {
        let provider: Arc<dyn PrincipalProvider> = match (&config.auth_secret, config.require_auth)
        {
            (Some(secret), true) => Arc::new(TokenValidator::new(
                AuthConfig::new(secret.clone()).with_expiry(config.token_expiry),
            )),
            (None, true) => {
                warn!("auth required but no secret configured, rejecting all requests");
                Arc::new(DenyAll)
            }
            (_, false) => Arc::new(StaticPrincipal::new(ANONYMOUS_USER)),
        };
        Self::with_parts(config, repository, provider)
    }

    /// Creates a server from explicit parts.
    pub fn with_parts(
        config: ServerConfig,
        repository: Arc<dyn EntityRepository>,
        provider: Arc<dyn PrincipalProvider>,
    ) -> Self {
        let context = Arc::new(HandlerContext::new(config, repository, provider));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Handles one request. Failures become JSON error bodies
    /// `{"error": .., "code": ..}` with the matching status.
    pub fn handle(&self, request: HttpRequest) -> HttpResponse {
        debug!(method = %request.method, path = %request.path, "request");
        match self.dispatch(&request) {
            Ok(response) => response,
            Err(e) => {
                if e.is_server_error() {
                    warn!(path = %request.path, error = %e, "request failed");
                } else {
                    debug!(path = %request.path, error = %e, "request rejected");
                }
                error_response(&e)
            }
        }
    }

    fn dispatch(&self, request: &HttpRequest) -> ServerResult<HttpResponse> {
        let route = Route::parse(request.method, &request.path).ok_or_else(|| {
            ServerError::NotFound(format!("{} {}", request.method, request.path))
        })?;
        let principal = self.context.authenticate(request.bearer.as_deref())?;

        match route {
            Route::Batch => ok(&self.handler.handle_batch(&principal, &request.json()?)?),
            Route::Bulk => ok(&self.handler.handle_bulk(&principal, &request.json()?)?),
            Route::Changes => {
                let query = ChangesRequest::from_query(&request.query)?;
                ok(&self.handler.handle_changes(&query)?)
            }
            Route::Resolve => ok(&self.handler.handle_resolve(&request.json()?)?),
            Route::Status => ok(&self.handler.handle_status(&principal)?),
        }
    }

    /// Returns the handler context.
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Returns the repository.
    pub fn repository(&self) -> &Arc<dyn EntityRepository> {
        &self.context.repository
    }
}

fn ok<T: Serialize>(body: &T) -> ServerResult<HttpResponse> {
    HttpResponse::json(200, body).map_err(|e| ServerError::Internal(e.to_string()))
}

fn error_response(error: &ServerError) -> HttpResponse {
    let status = error.status_code();
    let body = json!({ "error": error.to_string(), "code": error.code() });
    HttpResponse::json(status, &body).unwrap_or_else(|_| HttpResponse {
        status,
        body: error.to_string().into_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_protocol::{
        BatchRequest, BatchResponse, ChangesResponse, EntityType, Mutation, Payload, Resolution,
        ResolveRequest, ResolveResponse, StatusResponse,
    };
    use serde_json::Value;

    fn post(content: &str) -> Payload {
        Payload::from_value(EntityType::Post, json!({ "content": content })).unwrap()
    }

    fn push(server: &SyncServer, ops: Vec<Mutation>) -> BatchResponse {
        let request =
            HttpRequest::post_json("/sync/batch", &BatchRequest::new(EntityType::Post, ops))
                .unwrap();
        let response = server.handle(request);
        assert_eq!(response.status, 200, "{}", response.text());
        response.parse().unwrap()
    }

    #[test]
    fn server_lifecycle() {
        let server = SyncServer::new(ServerConfig::default());
        let response = server.handle(HttpRequest::get("/sync/status"));
        let status: StatusResponse = response.parse().unwrap();
        assert_eq!(status.status, "ok");
        assert_eq!(status.entity_counts["posts"], 0);
    }

    #[test]
    fn full_sync_flow() {
        let server = SyncServer::new(ServerConfig::default());

        let created = push(&server, vec![Mutation::create("L1", &post("hi")).unwrap()]);
        assert_eq!(created.created[0].version, 1);
        let server_id = created.created[0].server_id.clone();

        let updated = push(
            &server,
            vec![Mutation::update("L1", 1, &post("hi there")).unwrap()],
        );
        assert_eq!(updated.updated[0].version, 2);

        let stale = push(
            &server,
            vec![Mutation::update("L1", 1, &post("stale")).unwrap()],
        );
        assert_eq!(stale.conflicts.len(), 1);
        let record = stale.conflicts[0].conflict.clone();
        assert_eq!(record.server_version, 2);
        assert_eq!(record.server_id, server_id);

        let resolve = ResolveRequest::for_conflict(&record, Resolution::Client).unwrap();
        let response =
            server.handle(HttpRequest::post_json("/sync/resolve-conflict", &resolve).unwrap());
        let settled: ResolveResponse = response.parse().unwrap();
        assert_eq!(settled.entity.version, 3);
        assert_eq!(settled.entity.payload, post("stale"));

        let changes: ChangesResponse = server
            .handle(HttpRequest::get("/sync/changes?since=0&types=posts"))
            .parse()
            .unwrap();
        assert_eq!(changes.entities(EntityType::Post)[0].version, 3);
        assert!(changes.cursor >= settled.entity.updated_at);
    }

    #[test]
    fn unknown_route_is_404() {
        let server = SyncServer::new(ServerConfig::default());
        let response = server.handle(HttpRequest::get("/sync/nothing"));
        assert_eq!(response.status, 404);
        let body: Value = response.parse().unwrap();
        assert_eq!(body["code"], "not_found");

        // wrong method
        let response = server.handle(HttpRequest::get("/sync/batch"));
        assert_eq!(response.status, 404);
    }

    #[test]
    fn malformed_bodies_are_400() {
        let server = SyncServer::new(ServerConfig::default());
        let mut request = HttpRequest::post_json("/sync/batch", &json!({})).unwrap();
        request.body = b"not json".to_vec();
        assert_eq!(server.handle(request).status, 400);

        let response = server.handle(HttpRequest::get("/sync/changes?since=abc"));
        assert_eq!(response.status, 400);
        let body: Value = response.parse().unwrap();
        assert!(body["error"].as_str().unwrap().contains("since"));
    }

    #[test]
    fn auth_is_enforced_when_configured() {
        let secret = b"server-secret".to_vec();
        let server = SyncServer::new(ServerConfig::default().with_auth(secret.clone()));

        let response = server.handle(HttpRequest::get("/sync/status"));
        assert_eq!(response.status, 401);

        let token = TokenValidator::new(AuthConfig::new(secret))
            .create_token("alice")
            .unwrap();
        let response = server.handle(HttpRequest::get("/sync/status").with_bearer(Some(token)));
        assert_eq!(response.status, 200);
    }

    #[test]
    fn auth_without_secret_rejects_everything() {
        let server = SyncServer::new(ServerConfig {
            require_auth: true,
            ..ServerConfig::default()
        });

        let response = server.handle(HttpRequest::get("/sync/status"));
        assert_eq!(response.status, 401);

        let token = TokenValidator::new(AuthConfig::new(b"any-secret".to_vec()))
            .create_token("alice")
            .unwrap();
        let response = server.handle(HttpRequest::get("/sync/status").with_bearer(Some(token)));
        assert_eq!(response.status, 401);
    }

    #[test]
    fn resolving_unknown_entity_is_404() {
        let server = SyncServer::new(ServerConfig::default());
        let request = ResolveRequest {
            entity_type: EntityType::Post,
            local_id: "ghost".into(),
            server_id: None,
            resolution: Resolution::Server,
            data: None,
        };
        let response =
            server.handle(HttpRequest::post_json("/sync/resolve-conflict", &request).unwrap());
        assert_eq!(response.status, 404);
    }

    #[test]
    fn shared_repository() {
        let repository: Arc<dyn EntityRepository> = Arc::new(MemoryRepository::new());
        let a = SyncServer::with_repository(ServerConfig::default(), Arc::clone(&repository));
        let b = SyncServer::with_repository(ServerConfig::default(), Arc::clone(&repository));

        push(&a, vec![Mutation::create("L1", &post("x")).unwrap()]);
        let again = push(&b, vec![Mutation::create("L1", &post("x")).unwrap()]);
        assert_eq!(again.updated.len(), 1);
        assert!(!again.updated[0].applied);
        assert_eq!(b.repository().count(EntityType::Post).unwrap(), 1);
    }
}

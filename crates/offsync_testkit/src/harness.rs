//! In-process sync harness.
//!
//! One `SyncServer` shared by any number of simulated devices, each with
//! its own `LocalStore` and a loopback HTTP transport that can be taken
//! offline.

use offsync_client::{
    HttpTransport, LocalStore, LoopbackClient, LoopbackServer, RetryConfig, SyncClient,
    SyncConfig,
};
use offsync_protocol::{
    BatchRequest, BatchResponse, ChangesRequest, ChangesResponse, EntityType, HttpRequest,
    HttpResponse, Mutation, Timestamp,
};
use offsync_server::{EntityRepository, ServerConfig, StoredEntity, SyncServer};
use std::ops::Deref;
use std::sync::Arc;
use tempfile::TempDir;

/// Base URL the loopback transports are configured with.
pub const HARNESS_URL: &str = "http://offsync.test";

/// A shared server reachable through the loopback client.
#[derive(Clone)]
pub struct ServerHandle(Arc<SyncServer>);

impl LoopbackServer for ServerHandle {
    fn handle(&self, request: HttpRequest) -> HttpResponse {
        self.0.handle(request)
    }
}

/// Transport used by harness devices.
pub type DeviceTransport = HttpTransport<LoopbackClient<ServerHandle>>;

/// A simulated device: a sync client over its own store.
pub struct Device {
    client: SyncClient<DeviceTransport>,
    /// Kept alive for file-backed devices.
    _dir: Option<TempDir>,
}

impl Device {
    /// Takes the device off or back on the network.
    pub fn set_online(&self, online: bool) {
        self.client.transport().client().set_online(online);
    }
}

impl Deref for Device {
    type Target = SyncClient<DeviceTransport>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// Harness around one sync server.
pub struct SyncHarness {
    server: Arc<SyncServer>,
    device_config: SyncConfig,
}

impl SyncHarness {
    /// Creates a harness with a default in-memory server.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates a harness with the given server configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        Self::from_server(SyncServer::new(config))
    }

    /// Creates a harness over a caller-supplied repository.
    pub fn with_repository(config: ServerConfig, repository: Arc<dyn EntityRepository>) -> Self {
        Self::from_server(SyncServer::with_repository(config, repository))
    }

    fn from_server(server: SyncServer) -> Self {
        Self {
            server: Arc::new(server),
            device_config: SyncConfig::default()
                .with_retry(RetryConfig::no_retry())
                .with_auto_sync_interval(None),
        }
    }

    /// Overrides the client configuration used for new devices.
    pub fn with_device_config(mut self, config: SyncConfig) -> Self {
        self.device_config = config;
        self
    }

    /// The server.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    /// A device with an in-memory store.
    pub fn device(&self) -> Device {
        let store = LocalStore::open_in_memory().expect("Failed to open in-memory store");
        self.device_with_store(Arc::new(store))
    }

    /// A device with a file-backed store in a fresh temporary directory.
    pub fn file_device(&self) -> Device {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store = LocalStore::open(dir.path()).expect("Failed to open file store");
        let mut device = self.device_with_store(Arc::new(store));
        device._dir = Some(dir);
        device
    }

    /// A device over an existing store.
    pub fn device_with_store(&self, store: Arc<LocalStore>) -> Device {
        let loopback = LoopbackClient::new(ServerHandle(Arc::clone(&self.server)));
        let transport = HttpTransport::new(HARNESS_URL, loopback);
        Device {
            client: SyncClient::new(self.device_config.clone(), transport, store),
            _dir: None,
        }
    }

    /// Sends a raw batch straight to the server.
    pub fn push(&self, entity_type: EntityType, operations: Vec<Mutation>) -> BatchResponse {
        let request = HttpRequest::post_json(
            "/sync/batch",
            &BatchRequest::new(entity_type, operations),
        )
        .expect("encode batch");
        let response = self.server.handle(request);
        assert!(response.is_success(), "batch failed: {}", response.text());
        response.parse().expect("decode batch response")
    }

    /// Reads one page of the change feed straight from the server.
    pub fn pull(&self, since: Timestamp, limit: Option<usize>) -> ChangesResponse {
        let mut request = ChangesRequest::since(since);
        request.limit = limit;
        let response = self
            .server
            .handle(HttpRequest::get(&format!("/sync/changes?{}", request.to_query())));
        assert!(response.is_success(), "pull failed: {}", response.text());
        response.parse().expect("decode changes response")
    }

    /// The server's copy of an entity.
    pub fn server_entity(&self, entity_type: EntityType, local_id: &str) -> Option<StoredEntity> {
        self.server
            .repository()
            .get_by_local_id(entity_type, local_id)
            .expect("repository read")
    }
}

impl Default for SyncHarness {
    fn default() -> Self {
        Self::new()
    }
}

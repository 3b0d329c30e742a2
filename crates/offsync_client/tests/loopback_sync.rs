//! Sync client against an in-process server over the loopback HTTP client.

use offsync_client::{
    HttpTransport, LocalStore, LoopbackClient, RetryConfig, SkipReason, SyncClient, SyncConfig,
    SyncError, SyncTransport, JOURNAL_FILE,
};
use offsync_protocol::{
    BatchRequest, EntityType, HttpRequest, HttpResponse, ItemOutcome, Mutation, Payload,
    Resolution, SyncStatus,
};
use offsync_server::{AuthConfig, EntityRepository, ServerConfig, SyncServer, TokenValidator};
use serde_json::json;
use std::sync::{Arc, Once};

type Handler = Box<dyn Fn(HttpRequest) -> HttpResponse + Send + Sync>;
type Transport = HttpTransport<LoopbackClient<Handler>>;

fn post(content: &str) -> Payload {
    Payload::from_value(EntityType::Post, json!({ "content": content })).unwrap()
}

fn transport(server: &Arc<SyncServer>) -> Transport {
    let server = Arc::clone(server);
    let handler: Handler = Box::new(move |request| server.handle(request));
    HttpTransport::new("http://sync.test/", LoopbackClient::new(handler))
}

fn client(server: &Arc<SyncServer>) -> SyncClient<Transport> {
    client_with_store(server, Arc::new(LocalStore::open_in_memory().unwrap()))
}

fn client_with_store(server: &Arc<SyncServer>, store: Arc<LocalStore>) -> SyncClient<Transport> {
    let config = SyncConfig::default()
        .with_retry(RetryConfig::no_retry())
        .with_auto_sync_interval(None);
    SyncClient::new(config, transport(server), store)
}

fn content_of(payload: &Payload) -> Option<String> {
    match payload {
        Payload::Post(p) => p.content.clone(),
        _ => None,
    }
}

#[test]
fn create_update_and_stale_replay() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let alice = client(&server);
    let store = alice.store();

    let (entity, _) = store.write(EntityType::Post, Some("L1"), post("hi")).unwrap();
    assert_eq!(entity.sync_status, SyncStatus::Pending);

    let report = alice.sync_now().unwrap();
    assert_eq!(report.synced, 1);
    let synced = store.entities().get(EntityType::Post, "L1").unwrap();
    assert_eq!(synced.version, 1);
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert!(synced.server_id.is_some());
    assert_eq!(store.queue().len(), 0);

    store
        .write(EntityType::Post, Some("L1"), post("hi there"))
        .unwrap();
    let report = alice.sync_now().unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(store.entities().version_of(EntityType::Post, "L1"), Some(2));

    // a late replay of the version-1 update
    let stale = Mutation::update("L1", 1, &post("hi there")).unwrap();
    let response = alice
        .transport()
        .push_batch(&BatchRequest::new(EntityType::Post, vec![stale]))
        .unwrap();
    let outcomes = response.into_outcomes();
    let ItemOutcome::Conflict(item) = &outcomes[0] else {
        panic!("expected conflict, got {outcomes:?}");
    };
    assert_eq!(item.conflict.server_version, 2);
}

#[test]
fn edits_from_two_devices_conflict_and_merge() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let alice = client(&server);
    let bob = client(&server);

    alice
        .store()
        .write(EntityType::Post, Some("P1"), post("draft"))
        .unwrap();
    alice.sync_now().unwrap();

    assert!(bob.pull().unwrap() >= 1);
    let seen = bob.store().entities().get(EntityType::Post, "P1").unwrap();
    assert_eq!(seen.version, 1);
    assert_eq!(seen.sync_status, SyncStatus::Synced);

    bob.store()
        .write(EntityType::Post, Some("P1"), post("bob's edit"))
        .unwrap();
    assert_eq!(bob.sync_now().unwrap().synced, 1);

    alice
        .store()
        .write(EntityType::Post, Some("P1"), post("alice's edit"))
        .unwrap();
    let report = alice.sync_now().unwrap();
    assert_eq!(report.conflicts.len(), 1);
    let record = report.conflicts[0].clone();
    assert_eq!(record.client_version, 1);
    assert_eq!(record.server_version, 2);
    assert_eq!(
        alice
            .store()
            .entities()
            .get(EntityType::Post, "P1")
            .unwrap()
            .sync_status,
        SyncStatus::Conflict
    );
    assert_eq!(alice.unresolved_conflicts().len(), 1);

    let settled = alice.resolve_conflict(&record, Resolution::Merge).unwrap();
    assert_eq!(settled.version, 3);
    assert_eq!(content_of(&settled.payload).as_deref(), Some("alice's edit"));
    assert!(alice.unresolved_conflicts().is_empty());

    bob.pull().unwrap();
    let converged = bob.store().entities().get(EntityType::Post, "P1").unwrap();
    assert_eq!(converged.version, 3);
    assert_eq!(converged.payload, settled.payload);
}

#[test]
fn conflicts_can_be_resolved_from_the_local_copy() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let alice = client(&server);
    let bob = client(&server);

    alice
        .store()
        .write(EntityType::Post, Some("P1"), post("v1"))
        .unwrap();
    alice.sync_now().unwrap();
    bob.pull().unwrap();
    bob.store()
        .write(EntityType::Post, Some("P1"), post("bob"))
        .unwrap();
    bob.sync_now().unwrap();

    alice
        .store()
        .write(EntityType::Post, Some("P1"), post("alice"))
        .unwrap();
    alice.sync_now().unwrap();

    let settled = alice
        .resolve_entity(EntityType::Post, "P1", Resolution::Server)
        .unwrap();
    assert_eq!(settled.version, 2);
    assert_eq!(content_of(&settled.payload).as_deref(), Some("bob"));
    let local = alice.store().entities().get(EntityType::Post, "P1").unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
}

#[test]
fn offline_writes_wait_for_the_network() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let alice = client(&server);
    alice.transport().client().set_online(false);

    for i in 0..3 {
        alice
            .store()
            .write(EntityType::Post, None, post(&format!("note {i}")))
            .unwrap();
    }
    let report = alice.sync_now().unwrap();
    assert_eq!(report.skipped, Some(SkipReason::Offline));
    assert_eq!(alice.store().queue().len(), 3);

    alice.transport().client().set_online(true);
    let report = alice.sync_now().unwrap();
    assert_eq!(report.synced, 3);
    assert_eq!(alice.store().queue().len(), 0);
    assert_eq!(alice.store().entities().count_by_status().synced, 3);
}

#[test]
fn pushes_to_deleted_entities_get_stuck() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let alice = client(&server);

    alice
        .store()
        .write(EntityType::Post, Some("P1"), post("v1"))
        .unwrap();
    alice.sync_now().unwrap();
    server.repository().tombstone(EntityType::Post, "P1").unwrap();

    alice
        .store()
        .write(EntityType::Post, Some("P1"), post("v2"))
        .unwrap();
    let report = alice.sync_now().unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.newly_stuck.len(), 1);

    let stuck = alice.store().queue().stuck_entries();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].local_id, "P1");
    assert_eq!(alice.status().stuck, 1);
}

#[test]
fn store_survives_restart_before_first_sync() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(SyncServer::new(ServerConfig::default()));

    {
        let store = LocalStore::open(dir.path()).unwrap();
        store
            .write(EntityType::Post, Some("P1"), post("offline"))
            .unwrap();
        store.close().unwrap();
    }

    let store = Arc::new(LocalStore::open(dir.path()).unwrap());
    assert_eq!(store.queue().len(), 1);
    let alice = client_with_store(&server, Arc::clone(&store));
    assert_eq!(alice.sync_now().unwrap().synced, 1);
    assert_eq!(store.entities().version_of(EntityType::Post, "P1"), Some(1));
}

#[test]
fn edit_after_lost_create_response_reaches_the_server() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let live = tempfile::tempdir().unwrap();
    let crashed = tempfile::tempdir().unwrap();

    // the server applies the first batch; the device dies before reading
    // the reply, leaving its journal as it was at that moment
    let snapshot_from = live.path().join(JOURNAL_FILE);
    let snapshot_to = crashed.path().join(JOURNAL_FILE);
    let snapshot = Once::new();
    let inner = Arc::clone(&server);
    let handler: Handler = Box::new(move |request| {
        let is_batch = request.path.ends_with("/sync/batch");
        let response = inner.handle(request);
        if is_batch {
            snapshot.call_once(|| {
                std::fs::copy(&snapshot_from, &snapshot_to).unwrap();
            });
        }
        response
    });
    {
        let store = Arc::new(LocalStore::open(live.path()).unwrap());
        store.write(EntityType::Post, Some("L1"), post("a")).unwrap();
        let config = SyncConfig::default()
            .with_retry(RetryConfig::no_retry())
            .with_auto_sync_interval(None);
        let doomed = SyncClient::new(
            config,
            HttpTransport::new("http://sync.test/", LoopbackClient::new(handler)),
            store,
        );
        doomed.sync_now().unwrap();
    }

    let store = Arc::new(LocalStore::open(crashed.path()).unwrap());
    let entries = store.queue().entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].sent);
    assert_eq!(entries[0].retries, 0);

    // the edit must not ride on the create the server already holds
    store.write(EntityType::Post, Some("L1"), post("b")).unwrap();
    assert_eq!(store.queue().len(), 2);

    let phone = client_with_store(&server, Arc::clone(&store));
    let report = phone.sync_now().unwrap();
    assert_eq!(report.synced, 2);
    assert!(report.conflicts.is_empty());

    let local = store.entities().get(EntityType::Post, "L1").unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(local.version, 2);
    let remote = server
        .repository()
        .get_by_local_id(EntityType::Post, "L1")
        .unwrap()
        .unwrap();
    assert_eq!(remote.entity.version, 2);
    assert_eq!(content_of(&remote.entity.payload).as_deref(), Some("b"));
}

#[test]
fn bearer_tokens_are_required_when_auth_is_on() {
    let secret = b"integration-secret".to_vec();
    let server = Arc::new(SyncServer::new(
        ServerConfig::default().with_auth(secret.clone()),
    ));
    let alice = client(&server);
    alice
        .store()
        .write(EntityType::Post, Some("P1"), post("hi"))
        .unwrap();

    let err = alice.sync_now().unwrap_err();
    assert!(matches!(err, SyncError::AuthenticationFailed(_)));
    assert_eq!(alice.store().queue().len(), 1);

    let token = TokenValidator::new(AuthConfig::new(secret))
        .create_token("alice")
        .unwrap();
    alice.transport().set_token(Some(token));
    assert_eq!(alice.sync_now().unwrap().synced, 1);

    let stored = server
        .repository()
        .get_by_local_id(EntityType::Post, "P1")
        .unwrap()
        .unwrap();
    let Payload::Post(fields) = &stored.entity.payload else {
        panic!("not a post");
    };
    assert_eq!(fields.author_id.as_deref(), Some("alice"));
}

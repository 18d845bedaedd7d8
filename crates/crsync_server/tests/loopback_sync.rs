//! End-to-end sync between workers through the reference server.

use crsync_engine::{
    HttpTransportProvider, LoopbackClient, MemoryDatabase, MemoryHandleProvider, Providers,
    ReplicatedDb, SyncConfig, SyncWorker, WorkerHandle,
};
use crsync_protocol::{Checkpoint, ContentType, DbId, Endpoints, FromWorker, Scope, ToWorker};
use crsync_server::{ServerConfig, SyncServer};
use std::sync::Arc;
use std::time::Duration;

const PULL_INTERVAL: Duration = Duration::from_millis(500);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("crsync_engine=debug,crsync_server=debug")
        .try_init();
}

struct Replica {
    worker: WorkerHandle,
    handles: Arc<MemoryHandleProvider>,
}

impl Replica {
    fn spawn(server: &Arc<SyncServer>) -> Self {
        let handles = Arc::new(MemoryHandleProvider::new());
        let transports = HttpTransportProvider::new(LoopbackClient::new(Arc::clone(server)));
        let config = SyncConfig::new()
            .with_pull_interval(PULL_INTERVAL)
            .with_batch_size(4);
        let worker =
            SyncWorker::spawn(config, Providers::new(handles.clone(), Arc::new(transports)))
                .unwrap();
        Self { worker, handles }
    }

    fn db(&self, dbid: &DbId) -> Arc<MemoryDatabase> {
        self.handles.database(dbid)
    }

    async fn start(&self, dbid: DbId, scope: Scope, content_type: ContentType) {
        self.start_with(dbid, Endpoints::new("loopback://server"), scope, content_type)
            .await;
    }

    async fn start_with(
        &self,
        dbid: DbId,
        endpoints: Endpoints,
        scope: Scope,
        content_type: ContentType,
    ) {
        self.worker
            .send(ToWorker::StartSync {
                dbid,
                endpoints,
                scope,
                content_type,
            })
            .await
            .unwrap();
    }

    async fn changed(&self, dbid: DbId) {
        self.worker
            .send(ToWorker::LocalDbChanged { dbid })
            .await
            .unwrap();
    }

    /// Drains reports, failing on any sync failure.
    fn drain(&mut self) {
        while let Some(report) = self.worker.try_recv() {
            if let FromWorker::SyncFailed { message, .. } = report {
                panic!("sync failed: {message}");
            }
        }
    }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Lets every session run through a few pull intervals.
async fn run_for(replicas: &mut [&mut Replica], intervals: u32) {
    for _ in 0..intervals * 4 {
        tokio::time::advance(PULL_INTERVAL / 4).await;
        settle().await;
        for replica in replicas.iter_mut() {
            replica.drain();
        }
    }
}

#[tokio::test(start_paused = true)]
async fn insert_on_one_replica_reaches_the_other() {
    init_tracing();
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let mut alice = Replica::spawn(&server);
    let mut bob = Replica::spawn(&server);
    let dbid = DbId::new();

    alice.start(dbid, Scope::LocalWritesOnly, ContentType::Json).await;
    bob.start(dbid, Scope::LocalWritesOnly, ContentType::Binary).await;
    settle().await;

    alice
        .db(&dbid)
        .insert("todo", b"1".to_vec(), b"buy milk".to_vec())
        .unwrap();
    alice.changed(dbid).await;
    run_for(&mut [&mut alice, &mut bob], 3).await;

    assert_eq!(
        bob.db(&dbid).get("todo", b"1").as_deref(),
        Some(&b"buy milk"[..])
    );
    let server_db = server.database(&dbid).unwrap();
    assert_eq!(server_db.rows(), alice.db(&dbid).rows());
    // Bob told the server how far it has read.
    assert!(server.pulled_through(&dbid, &bob.db(&dbid).site_id()) > Checkpoint::ZERO);

    alice.worker.shutdown().await;
    bob.worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_writes_converge() {
    init_tracing();
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let mut alice = Replica::spawn(&server);
    let mut bob = Replica::spawn(&server);
    let dbid = DbId::new();

    // Both replicas write while offline, including the same row.
    for key in 0..6u8 {
        alice.db(&dbid).insert("todo", vec![key], vec![b'a', key]).unwrap();
    }
    bob.db(&dbid).insert("todo", vec![0], b"bob".to_vec()).unwrap();
    bob.db(&dbid).insert("notes", vec![9], b"hello".to_vec()).unwrap();
    bob.db(&dbid).delete("todo", vec![3]).unwrap();

    alice.start(dbid, Scope::AllWrites, ContentType::Binary).await;
    bob.start(dbid, Scope::AllWrites, ContentType::Binary).await;
    run_for(&mut [&mut alice, &mut bob], 6).await;

    let rows = alice.db(&dbid).rows();
    assert_eq!(rows, bob.db(&dbid).rows());
    assert_eq!(rows, server.database(&dbid).unwrap().rows());
    assert_eq!(
        rows.get(&("notes".to_string(), vec![9])).map(Vec::as_slice),
        Some(&b"hello"[..])
    );

    alice.worker.shutdown().await;
    bob.worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restarted_session_does_not_resend() {
    init_tracing();
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let mut alice = Replica::spawn(&server);
    let dbid = DbId::new();

    alice.start(dbid, Scope::LocalWritesOnly, ContentType::Json).await;
    settle().await;
    alice.db(&dbid).insert("todo", vec![1], vec![1]).unwrap();
    alice.changed(dbid).await;
    run_for(&mut [&mut alice], 1).await;
    let logged = server.database(&dbid).unwrap().change_count();
    assert_eq!(logged, 1);

    alice.worker.send(ToWorker::StopSync { dbid }).await.unwrap();
    settle().await;
    alice.start(dbid, Scope::LocalWritesOnly, ContentType::Json).await;
    for _ in 0..8 {
        tokio::time::advance(PULL_INTERVAL / 4).await;
        settle().await;
        // Already acknowledged, so nothing is pushed again.
        assert!(alice.worker.try_recv().is_none());
    }

    assert_eq!(server.database(&dbid).unwrap().change_count(), logged);
    alice.worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restart_without_last_seen_endpoint_catches_up() {
    init_tracing();
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let mut alice = Replica::spawn(&server);
    let dbid = DbId::new();

    // More writes than one batch holds.
    for key in 0..7u8 {
        alice.db(&dbid).insert("todo", vec![key], vec![key]).unwrap();
    }
    alice.start(dbid, Scope::LocalWritesOnly, ContentType::Binary).await;
    run_for(&mut [&mut alice], 2).await;
    assert_eq!(server.database(&dbid).unwrap().change_count(), 7);

    alice.worker.send(ToWorker::StopSync { dbid }).await.unwrap();
    settle().await;
    // The restarted session cannot ask where the server stands, so it
    // starts from the beginning of its stream.
    let endpoints = Endpoints::new("loopback://server").with_get_last_seen(None);
    alice
        .start_with(dbid, endpoints, Scope::LocalWritesOnly, ContentType::Binary)
        .await;
    settle().await;
    alice.db(&dbid).insert("todo", vec![7], vec![7]).unwrap();
    alice.changed(dbid).await;
    run_for(&mut [&mut alice], 3).await;

    let server_db = server.database(&dbid).unwrap();
    assert_eq!(server_db.rows(), alice.db(&dbid).rows());
    assert_eq!(server_db.rows().len(), 8);
    // Resent records merged as no-ops.
    assert_eq!(server_db.change_count(), 8);
    alice.worker.shutdown().await;
}

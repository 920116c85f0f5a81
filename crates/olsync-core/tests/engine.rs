//! Engine tests against in-memory fakes of the filesystem, session and API.
//!
//! Covers the reconciliation pass, both pipelines, echo suppression and the
//! per-path lock discipline.

use async_trait::async_trait;
use olsync_core::collaborators::Collaborator;
use olsync_core::entity::{EntityRef, FolderNode};
use olsync_core::index::{is_synthetic, synthetic_id};
use olsync_core::ot::{self, TextOp};
use olsync_core::protocol::{DocSnapshot, OtUpdate};
use olsync_core::transport::{self, Uploaded};
use olsync_core::{
    BaseContent, Conflict, ConflictAnswer, ConflictResolver, ContentHash, DocumentSession, EntityKind, FileSystem, FlatEntity, InMemoryFs,
    LocalOnlyAction, PolicyResolver, ProjectApi, ProjectSnapshot, RemoteDeletedAction, Resolution,
    ServerEvent, SyncConfig, SyncEngine, SyncStatus, TransportError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const MAIN: &str = "\\documentclass{article}\n\\begin{document}\n\\input{chapters/intro}\n\\end{document}";
const INTRO: &str = "\\section{Introduction}\nHello";
const FIGURE: &[u8] = &[0x89, b'P', b'N', b'G', 0, 1, 2, 3];

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeSession {
    docs: Mutex<HashMap<String, (String, u64)>>,
    joins: AtomicUsize,
    leaves: AtomicUsize,
    updates: Mutex<Vec<(String, Vec<TextOp>, u64)>>,
    fail_updates: AtomicBool,
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl FakeSession {
    fn with_docs(docs: &[(&str, &str)]) -> Arc<Self> {
        let session = Self::default();
        {
            let mut map = session.docs.lock().unwrap();
            for (id, text) in docs {
                map.insert(id.to_string(), (text.to_string(), 1));
            }
        }
        Arc::new(session)
    }

    fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

#[async_trait]
impl DocumentSession for FakeSession {
    async fn join_doc(&self, doc_id: &str) -> transport::Result<DocSnapshot> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        // Freshly created documents start out empty
        let mut docs = self.docs.lock().unwrap();
        let (text, version) = docs
            .entry(doc_id.to_string())
            .or_insert_with(|| (String::new(), 1));
        Ok(DocSnapshot {
            lines: text.split('\n').map(str::to_string).collect(),
            version: *version,
        })
    }

    async fn leave_doc(&self, _doc_id: &str) -> transport::Result<()> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_update(&self, doc_id: &str, ops: Vec<TextOp>, version: u64) -> transport::Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(TransportError::RequestTimeout("applyOtUpdate".into()));
        }
        let mut docs = self.docs.lock().unwrap();
        if let Some((text, v)) = docs.get_mut(doc_id) {
            *text = ot::apply(text, &ops).map_err(|e| TransportError::Remote(e.to_string()))?;
            *v += 1;
        }
        self.updates
            .lock()
            .unwrap()
            .push((doc_id.to_string(), ops, version));
        Ok(())
    }

    async fn connected_users(&self) -> transport::Result<Vec<Collaborator>> {
        Ok(vec![Collaborator {
            client_id: "c1".into(),
            name: "Ada".into(),
            email: None,
            doc_id: Some("d-main".into()),
            cursor: None,
        }])
    }

    async fn update_position(&self, _doc_id: &str, _row: u32, _column: u32) -> transport::Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

#[derive(Default)]
struct FakeApi {
    tree: Option<ProjectSnapshot>,
    flat: Vec<FlatEntity>,
    addressed: Mutex<Vec<String>>,
    docs: Mutex<HashMap<String, Vec<u8>>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<(String, String, Vec<u8>)>>,
    created_docs: Mutex<Vec<(String, String)>>,
    created_folders: Mutex<Vec<(String, String)>>,
    deleted: Mutex<Vec<(EntityKind, String)>>,
    renamed: Mutex<Vec<(String, String)>>,
    next_id: AtomicUsize,
}

impl FakeApi {
    fn fresh_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    /// Record a server identity used in a request; the server has never
    /// heard of path-derived ones.
    fn address(&self, id: &str) -> transport::Result<()> {
        self.addressed.lock().unwrap().push(id.to_string());
        if is_synthetic(id) {
            return Err(TransportError::Http {
                status: 404,
                message: id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectApi for FakeApi {
    async fn project_snapshot(&self) -> transport::Result<ProjectSnapshot> {
        self.tree.clone().ok_or(TransportError::Http {
            status: 404,
            message: "tree".into(),
        })
    }

    async fn list_entities(&self) -> transport::Result<Vec<FlatEntity>> {
        Ok(self.flat.clone())
    }

    async fn doc_content(&self, doc_id: &str) -> transport::Result<Vec<u8>> {
        self.address(doc_id)?;
        self.docs
            .lock()
            .unwrap()
            .get(doc_id)
            .cloned()
            .ok_or(TransportError::Http {
                status: 404,
                message: doc_id.to_string(),
            })
    }

    async fn file_content(&self, file_id: &str) -> transport::Result<Vec<u8>> {
        self.address(file_id)?;
        self.files
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or(TransportError::Http {
                status: 404,
                message: file_id.to_string(),
            })
    }

    async fn upload(&self, folder_id: &str, name: &str, content: Vec<u8>) -> transport::Result<Uploaded> {
        self.address(folder_id)?;
        self.uploads
            .lock()
            .unwrap()
            .push((folder_id.to_string(), name.to_string(), content));
        Ok(Uploaded {
            id: self.fresh_id("upload"),
            kind: EntityKind::File,
        })
    }

    async fn create_doc(&self, parent_id: &str, name: &str) -> transport::Result<String> {
        self.address(parent_id)?;
        self.created_docs
            .lock()
            .unwrap()
            .push((parent_id.to_string(), name.to_string()));
        Ok(self.fresh_id("doc"))
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> transport::Result<String> {
        self.address(parent_id)?;
        self.created_folders
            .lock()
            .unwrap()
            .push((parent_id.to_string(), name.to_string()));
        Ok(self.fresh_id("folder"))
    }

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> transport::Result<()> {
        self.address(id)?;
        self.deleted.lock().unwrap().push((kind, id.to_string()));
        Ok(())
    }

    async fn rename_entity(&self, _kind: EntityKind, id: &str, new_name: &str) -> transport::Result<()> {
        self.address(id)?;
        self.renamed
            .lock()
            .unwrap()
            .push((id.to_string(), new_name.to_string()));
        Ok(())
    }

    async fn move_entity(&self, _kind: EntityKind, id: &str, folder_id: &str) -> transport::Result<()> {
        self.address(id)?;
        self.address(folder_id)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// `/main.tex`, `/chapters/intro.tex`, `/figure.png`.
fn snapshot() -> ProjectSnapshot {
    ProjectSnapshot {
        id: "p1".into(),
        name: "Thesis".into(),
        root_folder: vec![FolderNode {
            id: "root".into(),
            name: "rootFolder".into(),
            docs: vec![EntityRef {
                id: "d-main".into(),
                name: "main.tex".into(),
            }],
            file_refs: vec![EntityRef {
                id: "f-figure".into(),
                name: "figure.png".into(),
            }],
            folders: vec![FolderNode {
                id: "f-chapters".into(),
                name: "chapters".into(),
                docs: vec![EntityRef {
                    id: "d-intro".into(),
                    name: "intro.tex".into(),
                }],
                ..Default::default()
            }],
        }],
        root_doc_id: Some("d-main".into()),
    }
}

fn test_config() -> SyncConfig {
    SyncConfig {
        debounce: Duration::ZERO,
        ..Default::default()
    }
}

struct Harness {
    fs: Arc<InMemoryFs>,
    api: Arc<FakeApi>,
    session: Arc<FakeSession>,
    engine: Arc<SyncEngine<InMemoryFs>>,
}

fn live(resolver: PolicyResolver, config: SyncConfig) -> Harness {
    let fs = Arc::new(InMemoryFs::new());
    let api = Arc::new(FakeApi::default());
    api.files
        .lock()
        .unwrap()
        .insert("f-figure".into(), FIGURE.to_vec());
    let session = FakeSession::with_docs(&[("d-main", MAIN), ("d-intro", INTRO)]);

    let engine = SyncEngine::new(fs.clone(), api.clone(), Arc::new(resolver), config);
    engine.attach(session.clone(), &snapshot());
    Harness {
        fs,
        api,
        session,
        engine: Arc::new(engine),
    }
}

/// Harness whose local tree already matches the remote.
async fn synced(resolver: PolicyResolver, config: SyncConfig) -> Harness {
    let h = live(resolver, config);
    h.engine.pull_all().await.unwrap();
    h
}

async fn read(fs: &InMemoryFs, path: &str) -> String {
    String::from_utf8(fs.read(path).await.unwrap()).unwrap()
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pull_all_downloads_missing_files() {
    let h = live(PolicyResolver::default(), test_config());

    let report = h.engine.pull_all().await.unwrap();

    assert_eq!(report.downloaded, 3);
    assert_eq!(report.conflicted, 0);
    assert_eq!(read(&h.fs, "main.tex").await, MAIN);
    assert_eq!(read(&h.fs, "chapters/intro.tex").await, INTRO);
    assert_eq!(h.fs.read("figure.png").await.unwrap(), FIGURE);
    assert!(h.engine.base_content().contains("chapters/intro.tex"));
    assert!(h.engine.last_synced().is_some());
    assert_eq!(h.engine.status().current(), SyncStatus::Idle);
    // Docs fetched through the session are left again
    assert!(!h.engine.is_joined("d-main"));
}

#[tokio::test]
async fn test_pull_all_is_idempotent() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    let writes = h.fs.write_count();

    let report = h.engine.pull_all().await.unwrap();

    assert_eq!(h.fs.write_count(), writes);
    assert_eq!(report.conflicted, 0);
    assert_eq!(report.unchanged, 3);
    assert!(report.is_noop());
}

#[tokio::test]
async fn test_conflict_use_local_pushes_once_without_writing() {
    let h = live(
        PolicyResolver {
            conflict: Resolution::UseLocal,
            ..Default::default()
        },
        test_config(),
    );
    h.fs.seed("main.tex", b"local edits");
    h.fs.seed("chapters/intro.tex", INTRO.as_bytes());
    h.fs.seed("figure.png", FIGURE);

    let report = h.engine.pull_all().await.unwrap();

    assert_eq!(report.conflicted, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(h.session.update_count(), 1);
    assert_eq!(h.api.upload_count(), 0);
    assert_eq!(h.fs.write_count(), 0);
    assert_eq!(read(&h.fs, "main.tex").await, "local edits");
    assert_eq!(
        h.engine.base_content().get("main.tex"),
        Some(&ContentHash::of(b"local edits"))
    );
}

#[tokio::test]
async fn test_conflict_use_local_without_session_uploads_once() {
    let fs = Arc::new(InMemoryFs::new());
    let api = Arc::new(FakeApi {
        tree: Some(snapshot()),
        ..Default::default()
    });
    {
        let mut docs = api.docs.lock().unwrap();
        docs.insert("d-main".into(), MAIN.as_bytes().to_vec());
        docs.insert("d-intro".into(), INTRO.as_bytes().to_vec());
    }
    api.files
        .lock()
        .unwrap()
        .insert("f-figure".into(), FIGURE.to_vec());
    let resolver = PolicyResolver {
        conflict: Resolution::UseLocal,
        ..Default::default()
    };
    let engine = SyncEngine::new(fs.clone(), api.clone(), Arc::new(resolver), test_config());
    engine.attach_offline().await.unwrap();
    fs.seed("main.tex", b"local edits");
    fs.seed("chapters/intro.tex", INTRO.as_bytes());
    fs.seed("figure.png", FIGURE);

    let report = engine.pull_all().await.unwrap();

    assert_eq!(report.conflicted, 1);
    assert_eq!(report.unchanged, 2);
    assert_eq!(api.upload_count(), 1);
    assert_eq!(fs.write_count(), 0);
    let uploads = api.uploads.lock().unwrap();
    assert_eq!(uploads[0].0, "root");
    assert_eq!(uploads[0].1, "main.tex");
    assert_eq!(uploads[0].2, b"local edits");
}

#[tokio::test]
async fn test_offline_attach_indexes_server_identities() {
    let api = Arc::new(FakeApi {
        tree: Some(snapshot()),
        ..Default::default()
    });
    api.files
        .lock()
        .unwrap()
        .insert("f-figure".into(), FIGURE.to_vec());
    let fs = Arc::new(InMemoryFs::new());
    let engine = SyncEngine::new(
        fs.clone(),
        api.clone(),
        Arc::new(PolicyResolver::default()),
        test_config(),
    );

    engine.attach_offline().await.unwrap();

    assert_eq!(engine.lookup("chapters/intro.tex").unwrap().id, "d-intro");
    assert_eq!(engine.lookup("chapters").unwrap().id, "f-chapters");
    assert!(engine.entities().iter().all(|e| !is_synthetic(&e.id)));

    // A binary created offline lands in the folder the server knows
    fs.seed("chapters/plot.pdf", b"%PDF-1.5");
    engine.on_created("chapters/plot.pdf").await;
    assert_eq!(api.uploads.lock().unwrap()[0].0, "f-chapters");
    assert!(api.addressed.lock().unwrap().iter().all(|id| !is_synthetic(id)));
}

#[tokio::test]
async fn test_flat_listing_never_addresses_path_identities() {
    let fs = Arc::new(InMemoryFs::new());
    let api = Arc::new(FakeApi {
        flat: vec![
            FlatEntity {
                path: "/main.tex".into(),
                kind: Some("doc".into()),
            },
            FlatEntity {
                path: "/chapters/intro.tex".into(),
                kind: Some("doc".into()),
            },
        ],
        ..Default::default()
    });
    {
        // Served under path identities, the engine must still not ask for them
        let mut docs = api.docs.lock().unwrap();
        docs.insert(synthetic_id("/main.tex"), MAIN.as_bytes().to_vec());
    }
    let engine = SyncEngine::new(
        fs.clone(),
        api.clone(),
        Arc::new(PolicyResolver {
            conflict: Resolution::UseLocal,
            ..Default::default()
        }),
        test_config(),
    );
    engine.attach_offline().await.unwrap();
    fs.seed("main.tex", b"local edits");

    let report = engine.pull_all().await.unwrap();
    assert_eq!(report.skipped, 2);
    assert_eq!(report.downloaded + report.uploaded + report.conflicted, 0);
    assert_eq!(fs.write_count(), 0);

    engine.on_modified("main.tex").await;
    let event = engine.status().last_event();
    assert_eq!(event.status, SyncStatus::Error);
    assert_eq!(event.path.as_deref(), Some("main.tex"));

    fs.delete("chapters/intro.tex").await.ok();
    engine.on_deleted("chapters/intro.tex").await;
    assert!(engine.rename_remote("main.tex", "thesis.tex").await.is_err());
    assert!(engine.move_remote("main.tex", "chapters").await.is_err());

    assert!(api.addressed.lock().unwrap().is_empty());
    assert_eq!(api.upload_count(), 0);
    assert!(api.deleted.lock().unwrap().is_empty());
    assert!(api.renamed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_conflict_skip_leaves_both_sides() {
    let h = live(PolicyResolver::default(), test_config());
    h.fs.seed("main.tex", b"local edits");

    let report = h.engine.pull_all().await.unwrap();

    assert_eq!(report.conflicted, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(read(&h.fs, "main.tex").await, "local edits");
    assert_eq!(h.session.update_count(), 0);
    assert!(!h.engine.base_content().contains("main.tex"));
}

#[tokio::test]
async fn test_conflict_use_remote_overwrites_local() {
    let h = live(
        PolicyResolver {
            conflict: Resolution::UseRemote,
            ..Default::default()
        },
        test_config(),
    );
    h.fs.seed("main.tex", b"local edits");

    let report = h.engine.pull_all().await.unwrap();

    assert_eq!(report.conflicted, 1);
    assert_eq!(read(&h.fs, "main.tex").await, MAIN);
    assert_eq!(h.session.update_count(), 0);
}

#[tokio::test]
async fn test_local_only_file_is_not_deleted() {
    let h = live(PolicyResolver::default(), test_config());
    h.fs.seed("notes.tex", b"scratch");

    let report = h.engine.pull_all().await.unwrap();

    assert_eq!(report.local_only, 1);
    assert_eq!(report.remote_deleted, 0);
    assert_eq!(read(&h.fs, "notes.tex").await, "scratch");
    assert!(h.api.created_docs.lock().unwrap().is_empty());
    assert!(!h.engine.base_content().contains("notes.tex"));
}

#[tokio::test]
async fn test_local_only_upload_creates_document() {
    let h = live(
        PolicyResolver {
            local_only: LocalOnlyAction::Upload,
            ..Default::default()
        },
        test_config(),
    );
    h.fs.seed("notes/todo.tex", b"todo");

    let report = h.engine.pull_all().await.unwrap();

    assert_eq!(report.local_only, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(
        *h.api.created_folders.lock().unwrap(),
        vec![("root".to_string(), "notes".to_string())]
    );
    assert_eq!(h.api.created_docs.lock().unwrap()[0].1, "todo.tex");
    assert!(h.engine.lookup("notes/todo.tex").is_some());
    assert!(h.engine.base_content().contains("notes/todo.tex"));
}

#[tokio::test]
async fn test_remote_deleted_keep_retracks_without_upload() {
    let h = live(
        PolicyResolver {
            remote_deleted: RemoteDeletedAction::Keep,
            ..Default::default()
        },
        test_config(),
    );
    let mut base = BaseContent::new();
    base.set("draft.tex", ContentHash::of(b"old draft"));
    h.engine.restore(base, None);
    h.fs.seed("draft.tex", b"draft, edited since");

    let report = h.engine.pull_all().await.unwrap();

    assert_eq!(report.remote_deleted, 1);
    assert_eq!(report.local_only, 0);
    assert_eq!(read(&h.fs, "draft.tex").await, "draft, edited since");
    assert_eq!(
        h.engine.base_content().get("draft.tex"),
        Some(&ContentHash::of(b"draft, edited since"))
    );
    assert_eq!(h.api.upload_count(), 0);
    assert!(h.api.created_docs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_deleted_delete_locally() {
    let h = live(
        PolicyResolver {
            remote_deleted: RemoteDeletedAction::DeleteLocal,
            ..Default::default()
        },
        test_config(),
    );
    let mut base = BaseContent::new();
    base.set("draft.tex", ContentHash::of(b"draft"));
    h.engine.restore(base, None);
    h.fs.seed("draft.tex", b"draft");

    let report = h.engine.pull_all().await.unwrap();

    assert_eq!(report.remote_deleted, 1);
    assert!(!h.fs.exists("draft.tex").await.unwrap());
    assert!(!h.engine.base_content().contains("draft.tex"));
}

/// Holds the first remote-deleted question until released.
#[derive(Default)]
struct HoldingResolver {
    held: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ConflictResolver for HoldingResolver {
    async fn ask(&self, _conflict: &Conflict<'_>) -> ConflictAnswer {
        ConflictAnswer::Skip
    }

    async fn show_diff(&self, _conflict: &Conflict<'_>) {}

    async fn ask_after_diff(&self, _conflict: &Conflict<'_>) -> Resolution {
        Resolution::Skip
    }

    async fn remote_deleted(&self, _path: &str) -> RemoteDeletedAction {
        if !self.held.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        RemoteDeletedAction::Keep
    }

    async fn local_only(&self, _path: &str) -> LocalOnlyAction {
        LocalOnlyAction::Ignore
    }
}

#[tokio::test]
async fn test_remote_deleted_busy_path_counts_as_skipped() {
    let fs = Arc::new(InMemoryFs::new());
    let api = Arc::new(FakeApi::default());
    api.files
        .lock()
        .unwrap()
        .insert("f-figure".into(), FIGURE.to_vec());
    let session = FakeSession::with_docs(&[("d-main", MAIN), ("d-intro", INTRO)]);
    let resolver = Arc::new(HoldingResolver::default());
    let engine = SyncEngine::new(fs.clone(), api.clone(), resolver.clone(), test_config());
    engine.attach(session, &snapshot());
    let engine = Arc::new(engine);
    let mut base = BaseContent::new();
    base.set("draft.tex", ContentHash::of(b"draft"));
    engine.restore(base, None);
    fs.seed("draft.tex", b"draft");

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.pull_all().await.unwrap() }
    });
    resolver.entered.notified().await;

    // draft.tex is held by the first pass
    let second = engine.pull_all().await.unwrap();
    assert_eq!(second.remote_deleted, 0);
    assert_eq!(second.skipped, 1);

    resolver.release.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.remote_deleted, 1);
    assert_eq!(first.skipped, 0);
}

// ---------------------------------------------------------------------------
// Local pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_local_modify_submits_update_against_remote_version() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    h.fs.seed("main.tex", b"rewritten");

    h.engine.on_modified("main.tex").await;

    let updates = h.session.updates.lock().unwrap().clone();
    assert_eq!(updates.len(), 1);
    let (doc, ops, version) = &updates[0];
    assert_eq!(doc, "d-main");
    assert_eq!(*version, 1);
    assert_eq!(ot::apply(MAIN, ops).unwrap(), "rewritten");
    assert!(h.engine.is_joined("d-main"));
    assert_eq!(h.engine.status().current(), SyncStatus::Idle);
}

#[tokio::test]
async fn test_echo_of_own_push_writes_nothing() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    h.fs.seed("main.tex", b"hello");
    h.engine.on_modified("main.tex").await;
    let writes = h.fs.write_count();

    // The server acks the submitter without ops
    h.engine
        .handle_remote(ServerEvent::OtUpdateApplied(OtUpdate {
            doc: "d-main".into(),
            op: None,
            v: 2,
        }))
        .await;
    // An update whose result equals the local content
    h.engine
        .handle_remote(ServerEvent::OtUpdateApplied(OtUpdate {
            doc: "d-main".into(),
            op: Some(vec![TextOp::delete(0, "hello"), TextOp::insert(0, "hello")]),
            v: 2,
        }))
        .await;
    // The watcher reports our own state again
    h.engine.on_modified("main.tex").await;

    assert_eq!(h.fs.write_count(), writes);
    assert_eq!(h.session.update_count(), 1);
}

#[tokio::test]
async fn test_unchanged_content_is_not_pushed() {
    let h = synced(PolicyResolver::default(), test_config()).await;

    h.engine.on_modified("main.tex").await;

    assert_eq!(h.session.update_count(), 0);
    assert_eq!(h.session.joins.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_change_within_debounce_window_is_suppressed() {
    let h = synced(PolicyResolver::default(), SyncConfig::default()).await;
    h.fs.seed("main.tex", b"typed right after the pull");

    h.engine.on_modified("main.tex").await;

    assert_eq!(h.session.update_count(), 0);
}

#[tokio::test]
async fn test_concurrent_event_for_same_path_is_dropped() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    h.fs.seed("main.tex", b"first");
    h.session.gated.store(true, Ordering::SeqCst);
    let joins_before = h.session.joins.load(Ordering::SeqCst);

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.on_modified("main.tex").await });
    h.session.entered.notified().await;

    // Second handler for the same path while the first is in flight
    h.engine.on_modified("main.tex").await;
    assert_eq!(h.session.joins.load(Ordering::SeqCst), joins_before + 1);

    h.session.gated.store(false, Ordering::SeqCst);
    h.session.release.notify_one();
    first.await.unwrap();

    assert_eq!(h.session.update_count(), 1);
}

#[tokio::test]
async fn test_unknown_path_is_reported_not_pushed() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    h.fs.seed("stray.tex", b"x");

    h.engine.on_modified("stray.tex").await;

    assert_eq!(h.session.update_count(), 0);
    assert_eq!(h.api.upload_count(), 0);
    let event = h.engine.status().last_event();
    assert_eq!(event.path.as_deref(), Some("stray.tex"));
}

#[tokio::test]
async fn test_failed_push_sets_error_and_releases_lock() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    h.fs.seed("main.tex", b"will fail");
    h.session.fail_updates.store(true, Ordering::SeqCst);

    h.engine.on_modified("main.tex").await;

    let event = h.engine.status().last_event();
    assert_eq!(event.status, SyncStatus::Error);
    assert_eq!(event.path.as_deref(), Some("main.tex"));

    // Lock released, the next attempt goes through
    h.session.fail_updates.store(false, Ordering::SeqCst);
    h.engine.on_modified("main.tex").await;
    assert_eq!(h.session.update_count(), 1);
}

#[tokio::test]
async fn test_vanished_file_is_not_an_error() {
    let h = synced(PolicyResolver::default(), test_config()).await;

    h.engine.on_modified("gone.tex").await;
    h.engine.on_created("gone.tex").await;

    assert_eq!(h.engine.status().current(), SyncStatus::Idle);
}

#[tokio::test]
async fn test_local_create_of_text_file() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    h.fs.seed("appendix/extra.tex", b"\\section{Extra}");

    h.engine.on_created("appendix/extra.tex").await;

    assert_eq!(
        *h.api.created_folders.lock().unwrap(),
        vec![("root".to_string(), "appendix".to_string())]
    );
    let entity = h.engine.lookup("appendix/extra.tex").unwrap();
    assert_eq!(entity.kind, EntityKind::Doc);
    assert!(h.engine.is_joined(&entity.id));
    // Content went out as an update, not an upload
    assert_eq!(h.session.update_count(), 1);
    assert_eq!(h.api.upload_count(), 0);
}

#[tokio::test]
async fn test_local_create_of_binary_uploads() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    h.fs.seed("chapters/plot.pdf", b"%PDF-1.5");

    h.engine.on_created("chapters/plot.pdf").await;

    let uploads = h.api.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "f-chapters");
    assert_eq!(uploads[0].1, "plot.pdf");
    assert!(h.engine.lookup("chapters/plot.pdf").is_some());
}

#[tokio::test]
async fn test_create_of_known_path_is_a_modify() {
    let h = synced(PolicyResolver::default(), test_config()).await;

    h.engine.on_created("chapters/intro.tex").await;

    assert!(h.api.created_docs.lock().unwrap().is_empty());
    assert_eq!(h.session.update_count(), 0);
}

#[tokio::test]
async fn test_events_on_known_folder_are_ignored() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    assert!(h.fs.stat("chapters").await.unwrap().is_dir);

    h.engine.on_created("chapters").await;
    h.engine.on_modified("chapters").await;

    assert_eq!(h.engine.status().current(), SyncStatus::Idle);
    assert!(h.api.created_folders.lock().unwrap().is_empty());
    assert_eq!(h.api.upload_count(), 0);
    assert_eq!(h.session.update_count(), 0);
}

#[tokio::test]
async fn test_local_delete_removes_remote_entity() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    h.fs.delete("chapters/intro.tex").await.unwrap();

    h.engine.on_deleted("chapters/intro.tex").await;

    assert_eq!(
        *h.api.deleted.lock().unwrap(),
        vec![(EntityKind::Doc, "d-intro".to_string())]
    );
    assert!(h.engine.lookup("chapters/intro.tex").is_none());
    assert!(!h.engine.base_content().contains("chapters/intro.tex"));

    // A second delete for the same path has nothing left to do
    h.engine.on_deleted("chapters/intro.tex").await;
    assert_eq!(h.api.deleted.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Remote pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_remote_create_materializes_document() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    h.session
        .docs
        .lock()
        .unwrap()
        .insert("d-new".into(), ("fresh".into(), 1));
    let event = ServerEvent::EntityCreated {
        parent_id: "f-chapters".into(),
        kind: EntityKind::Doc,
        entity: EntityRef {
            id: "d-new".into(),
            name: "outro.tex".into(),
        },
    };

    h.engine.handle_remote(event.clone()).await;
    let writes = h.fs.write_count();
    // Replaying the same notification is an echo
    h.engine.handle_remote(event).await;

    assert_eq!(read(&h.fs, "chapters/outro.tex").await, "fresh");
    assert!(h.engine.is_joined("d-new"));
    assert_eq!(h.fs.write_count(), writes);

    // The watcher notification for our own write is suppressed
    h.engine.on_created("chapters/outro.tex").await;
    assert_eq!(h.session.update_count(), 0);
    assert!(h.api.created_docs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_create_of_binary_and_folder() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    h.api
        .files
        .lock()
        .unwrap()
        .insert("f-logo".into(), b"logo".to_vec());

    h.engine
        .handle_remote(ServerEvent::EntityCreated {
            parent_id: "root".into(),
            kind: EntityKind::Folder,
            entity: EntityRef {
                id: "f-images".into(),
                name: "images".into(),
            },
        })
        .await;
    h.engine
        .handle_remote(ServerEvent::EntityCreated {
            parent_id: "f-images".into(),
            kind: EntityKind::File,
            entity: EntityRef {
                id: "f-logo".into(),
                name: "logo.png".into(),
            },
        })
        .await;

    assert!(h.fs.stat("images").await.unwrap().is_dir);
    assert_eq!(h.fs.read("images/logo.png").await.unwrap(), b"logo");

    // Watcher echoes of the materialized folder
    h.engine.on_created("images").await;
    h.engine.on_modified("images").await;
    assert_eq!(h.engine.status().current(), SyncStatus::Idle);
    assert!(h.api.created_folders.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_rename_of_folder_moves_children() {
    let h = synced(PolicyResolver::default(), test_config()).await;

    h.engine
        .handle_remote(ServerEvent::EntityRenamed {
            id: "f-chapters".into(),
            name: "parts".into(),
        })
        .await;

    assert_eq!(read(&h.fs, "parts/intro.tex").await, INTRO);
    assert!(!h.fs.exists("chapters/intro.tex").await.unwrap());
    assert_eq!(h.engine.lookup("parts/intro.tex").unwrap().id, "d-intro");
    assert!(h.engine.base_content().contains("parts/intro.tex"));
    assert!(!h.engine.base_content().contains("chapters/intro.tex"));
}

#[tokio::test]
async fn test_remote_move_and_remove() {
    let h = synced(PolicyResolver::default(), test_config()).await;

    h.engine
        .handle_remote(ServerEvent::EntityMoved {
            id: "d-main".into(),
            new_parent_id: "f-chapters".into(),
        })
        .await;
    assert_eq!(read(&h.fs, "chapters/main.tex").await, MAIN);
    assert!(h.engine.lookup("main.tex").is_none());

    h.engine
        .handle_remote(ServerEvent::EntityRemoved {
            id: "f-chapters".into(),
        })
        .await;
    assert!(!h.fs.exists("chapters").await.unwrap());
    assert!(h.engine.lookup("chapters/intro.tex").is_none());
    assert!(h.engine.base_content().paths().iter().all(|p| !p.starts_with("chapters")));
}

#[tokio::test]
async fn test_remote_update_applies_ops() {
    let h = synced(PolicyResolver::default(), test_config()).await;

    h.engine
        .handle_remote(ServerEvent::OtUpdateApplied(OtUpdate {
            doc: "d-intro".into(),
            op: Some(vec![TextOp::insert(INTRO.encode_utf16().count(), ", world")]),
            v: 2,
        }))
        .await;

    assert_eq!(read(&h.fs, "chapters/intro.tex").await, format!("{}, world", INTRO));
    // Not echoed back
    h.engine.on_modified("chapters/intro.tex").await;
    assert_eq!(h.session.update_count(), 0);
}

#[tokio::test]
async fn test_remote_update_for_unknown_doc_is_dropped() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    let writes = h.fs.write_count();

    h.engine
        .handle_remote(ServerEvent::OtUpdateApplied(OtUpdate {
            doc: "d-unknown".into(),
            op: Some(vec![TextOp::insert(0, "x")]),
            v: 1,
        }))
        .await;

    assert_eq!(h.fs.write_count(), writes);
}

#[tokio::test]
async fn test_force_disconnect_marks_engine_disconnected() {
    let h = synced(PolicyResolver::default(), test_config()).await;
    h.fs.seed("main.tex", b"edit");
    h.engine.on_modified("main.tex").await;
    assert!(h.engine.is_joined("d-main"));

    h.engine
        .handle_remote(ServerEvent::ForceDisconnect {
            reason: "maintenance".into(),
        })
        .await;

    assert_eq!(h.engine.status().current(), SyncStatus::Disconnected);
    assert!(!h.engine.is_live());
    assert!(!h.engine.is_joined("d-main"));
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rename_remote_mirrors_locally() {
    let h = synced(PolicyResolver::default(), test_config()).await;

    h.engine.rename_remote("figure.png", "diagram.png").await.unwrap();

    assert_eq!(
        *h.api.renamed.lock().unwrap(),
        vec![("f-figure".to_string(), "diagram.png".to_string())]
    );
    assert_eq!(h.fs.read("diagram.png").await.unwrap(), FIGURE);
    assert_eq!(h.engine.lookup("diagram.png").unwrap().id, "f-figure");
}

#[tokio::test]
async fn test_move_remote_into_folder() {
    let h = synced(PolicyResolver::default(), test_config()).await;

    h.engine.move_remote("figure.png", "chapters").await.unwrap();

    assert!(h.fs.exists("chapters/figure.png").await.unwrap());
    assert_eq!(h.engine.lookup("chapters/figure.png").unwrap().id, "f-figure");
    assert!(h.engine.move_remote("figure.png", "chapters").await.is_err());
}

#[tokio::test]
async fn test_collaborators_are_tracked() {
    let h = synced(PolicyResolver::default(), test_config()).await;

    let users = h.engine.refresh_collaborators().await.unwrap();
    assert_eq!(users.len(), 1);

    h.engine
        .handle_remote(ServerEvent::CollaboratorDisconnected {
            client_id: "c1".into(),
        })
        .await;
    assert!(h.engine.collaborators().is_empty());
}

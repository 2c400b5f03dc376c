//! End-to-end flow: ingestion through debounced rebuild to a published
//! repository tree, with the external indexing tool faked out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::Mutex;

use binary_archive::builder::{CommandRunner, RepositoryBuilder, ToolOutput};
use binary_archive::config::BuilderConfig;
use binary_archive::error::ArchiveResult;
use binary_archive::ingest::{BinarySource, IngestContext, IngestOutcome, Ingestor};
use binary_archive::models::RepoKey;
use binary_archive::scheduler::RebuildScheduler;
use binary_archive::store::{HierarchyStore, MemoryStore};

const QUIET: Duration = Duration::from_secs(30);
const POLL: Duration = Duration::from_secs(15);

/// Records invocations and always reports success.
struct RecordingRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingRunner {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    async fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> ArchiveResult<ToolOutput> {
        self.calls
            .lock()
            .await
            .push((program.to_string(), args.to_vec()));
        Ok(ToolOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    runner: Arc<RecordingRunner>,
    scheduler: RebuildScheduler,
    ingestor: Ingestor,
    binary_root: TempDir,
    repos_root: TempDir,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(RecordingRunner::new());
    let binary_root = TempDir::new().unwrap();
    let repos_root = TempDir::new().unwrap();

    let builder = Arc::new(RepositoryBuilder::new(
        store.clone(),
        runner.clone(),
        repos_root.path().to_path_buf(),
        BuilderConfig::default(),
    ));
    let scheduler = RebuildScheduler::start(store.clone(), builder, QUIET, POLL);
    let ingestor = Ingestor::new(
        store.clone(),
        binary_root.path().to_path_buf(),
        false,
        scheduler.handle(),
    );

    Fixture {
        store,
        runner,
        scheduler,
        ingestor,
        binary_root,
        repos_root,
    }
}

fn context(name: &str, distro: &str, version: &str, arch: &str) -> IngestContext {
    IngestContext {
        project: "p".to_string(),
        distro: distro.to_string(),
        distro_version: version.to_string(),
        arch: arch.to_string(),
        ref_name: "master".to_string(),
        name: name.to_string(),
    }
}

/// Let spawned build tasks run between time jumps.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_rpm_upload_is_published_after_quiet_time() {
    let fx = fixture();
    let key = RepoKey::new("p", "master", "centos", "7");

    let ctx = context("foo-1.0-x86_64.rpm", "centos", "7", "x86_64");
    let (binary, outcome) = fx
        .ingestor
        .ingest(&ctx, BinarySource::Payload(Bytes::from_static(b"rpm payload")), false)
        .await
        .unwrap();

    assert_eq!(outcome, IngestOutcome::Created);
    assert_eq!(binary.arch, "x86_64");
    assert!(fx
        .binary_root
        .path()
        .join("p/master/centos/7/x86_64/foo-1.0-x86_64.rpm")
        .is_file());

    // The upload flagged the repo; no build has run yet.
    let repo = fx.store.get_repo(&key).await.unwrap().unwrap();
    assert!(repo.needs_build);
    assert!(fx.runner.calls().await.is_empty());

    tokio::time::sleep(QUIET + Duration::from_secs(1)).await;
    settle().await;

    // Exactly one createrepo invocation against the x86_64 directory, and
    // the binary was copied into the published tree.
    let calls = fx.runner.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "createrepo_c");
    assert!(calls[0].1[1].ends_with("p/master/centos/7/x86_64"));
    assert!(fx
        .repos_root
        .path()
        .join("p/master/centos/7/x86_64/foo-1.0-x86_64.rpm")
        .is_file());

    let repo = fx.store.get_repo(&key).await.unwrap().unwrap();
    assert!(!repo.needs_build);
    assert!(!repo.is_building);

    fx.scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_deb_upload_runs_reprepro_for_distro_version() {
    let fx = fixture();

    let ctx = context("foo_1.0-1_amd64.deb", "ubuntu", "trusty", "amd64");
    let (binary, _) = fx
        .ingestor
        .ingest(&ctx, BinarySource::Payload(Bytes::from_static(b"deb payload")), false)
        .await
        .unwrap();

    // Debian uploads keep the client arch.
    assert_eq!(binary.arch, "amd64");

    tokio::time::sleep(QUIET + Duration::from_secs(1)).await;
    settle().await;

    let calls = fx.runner.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "reprepro");
    assert!(calls[0].1.contains(&"includedeb".to_string()));
    assert!(calls[0].1.contains(&"trusty".to_string()));
    let expected_path = binary.path.unwrap();
    assert!(calls[0].1.contains(&expected_path));

    fx.scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_upload_burst_triggers_single_rebuild() {
    let fx = fixture();

    for i in 0..4 {
        let ctx = context(
            &format!("pkg{}-1.0-x86_64.rpm", i),
            "centos",
            "7",
            "x86_64",
        );
        fx.ingestor
            .ingest(&ctx, BinarySource::Payload(Bytes::from_static(b"payload")), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    tokio::time::sleep(QUIET + Duration::from_secs(1)).await;
    settle().await;

    // Four uploads inside one quiet window, one indexing pass.
    let calls = fx.runner.calls().await;
    assert_eq!(calls.len(), 1);

    // All four binaries made it into the published tree regardless.
    for i in 0..4 {
        assert!(fx
            .repos_root
            .path()
            .join(format!("p/master/centos/7/x86_64/pkg{}-1.0-x86_64.rpm", i))
            .is_file());
    }

    fx.scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_force_reupload_republishes() {
    let fx = fixture();
    let ctx = context("foo-1.0-x86_64.rpm", "centos", "7", "x86_64");

    fx.ingestor
        .ingest(&ctx, BinarySource::Payload(Bytes::from_static(b"first")), false)
        .await
        .unwrap();
    tokio::time::sleep(QUIET + Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(fx.runner.calls().await.len(), 1);

    // Re-upload with force: metadata updated, repo rebuilt again.
    let (binary, outcome) = fx
        .ingestor
        .ingest(&ctx, BinarySource::Payload(Bytes::from_static(b"second")), true)
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Updated);
    assert_eq!(binary.size, 6);

    tokio::time::sleep(QUIET + Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(fx.runner.calls().await.len(), 2);

    let published = fx
        .repos_root
        .path()
        .join("p/master/centos/7/x86_64/foo-1.0-x86_64.rpm");
    assert_eq!(std::fs::read(&published).unwrap(), b"second");

    fx.scheduler.stop().await;
}

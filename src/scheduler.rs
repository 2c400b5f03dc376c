//! Debounced rebuild scheduling.
//!
//! Many rapid ingestion events for one repo collapse into a single rebuild:
//! each event (re)arms a quiet-time deadline for the repo key, and only a
//! deadline that expires with no newer event dispatches a build. The
//! store-level PENDING/BUILDING flags gate dispatch, so at most one build
//! runs per repo key at any instant, and a periodic sweep re-arms deadlines
//! for repos whose in-memory timer was lost (process restart, or work that
//! arrived mid-build).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use crate::builder::RepoBuilder;
use crate::models::RepoKey;
use crate::store::HierarchyStore;

/// How often due deadlines are checked.
const TICK: Duration = Duration::from_millis(250);

/// Cloneable handle for scheduling rebuilds from ingestion.
#[derive(Debug, Clone)]
pub struct RebuildHandle {
    tx: mpsc::UnboundedSender<RepoKey>,
}

impl RebuildHandle {
    /// Create a handle plus the receiving end of its event channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RepoKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Request a debounced rebuild of the repo for `key`.
    ///
    /// The repo must already be flagged pending in the store; the periodic
    /// sweep picks it up even when the scheduler task is not running.
    pub fn schedule_rebuild(&self, key: RepoKey) {
        if self.tx.send(key).is_err() {
            warn!("scheduler not running, rebuild left to the sweep");
        }
    }
}

/// The rebuild scheduler background service.
pub struct RebuildScheduler {
    handle: RebuildHandle,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl RebuildScheduler {
    /// Start the scheduler loop.
    pub fn start(
        store: Arc<dyn HierarchyStore>,
        builder: Arc<dyn RepoBuilder>,
        quiet_time: Duration,
        polling_cycle: Duration,
    ) -> Self {
        let (handle, rx) = RebuildHandle::channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        info!(
            "starting rebuild scheduler (quiet time {:?}, polling cycle {:?})",
            quiet_time, polling_cycle
        );
        let task = tokio::spawn(run_loop(
            store,
            builder,
            rx,
            shutdown_rx,
            quiet_time,
            polling_cycle,
        ));

        Self {
            handle,
            shutdown_tx,
            task,
        }
    }

    /// Handle for submitting rebuild events.
    pub fn handle(&self) -> RebuildHandle {
        self.handle.clone()
    }

    /// Stop the scheduler loop. Builds already dispatched run to
    /// completion; pending repos are recovered from the store on the next
    /// start.
    pub async fn stop(self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("scheduler loop already gone");
        }
        if let Err(e) = self.task.await {
            warn!("scheduler task ended with error: {}", e);
        }
    }
}

async fn run_loop(
    store: Arc<dyn HierarchyStore>,
    builder: Arc<dyn RepoBuilder>,
    mut events: mpsc::UnboundedReceiver<RepoKey>,
    mut shutdown_rx: broadcast::Receiver<()>,
    quiet_time: Duration,
    polling_cycle: Duration,
) {
    let mut deadlines: HashMap<RepoKey, Instant> = HashMap::new();
    let mut tick = interval(TICK);
    let mut sweep = interval(polling_cycle);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("rebuild scheduler received shutdown signal");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(key) => {
                        // Every event restarts the quiet window, coalescing
                        // bursts of uploads into a single rebuild.
                        debug!("rebuild of {} debounced for {:?}", key, quiet_time);
                        deadlines.insert(key, Instant::now() + quiet_time);
                    }
                    None => {
                        info!("all rebuild handles dropped, stopping scheduler");
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                // Recovery path: repos flagged pending with no in-memory
                // deadline (restart, or re-flagged mid-build).
                match store.pending_repos().await {
                    Ok(repos) => {
                        for repo in repos {
                            deadlines
                                .entry(repo.key)
                                .or_insert_with(|| Instant::now() + quiet_time);
                        }
                    }
                    Err(e) => warn!("pending repo sweep failed: {}", e),
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                let due: Vec<RepoKey> = deadlines
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect();

                for key in due {
                    deadlines.remove(&key);
                    match store.begin_build(&key).await {
                        Ok(true) => {
                            dispatch(Arc::clone(&store), Arc::clone(&builder), key);
                        }
                        Ok(false) => {
                            // Not pending anymore, or a build is running; a
                            // mid-build re-flag comes back via the sweep.
                            debug!("skipping dispatch for {}", key);
                        }
                        Err(e) => warn!("could not claim build of {}: {}", key, e),
                    }
                }
            }
        }
    }
}

/// Spawn one build task. Completion releases the building flag; failure
/// re-flags the repo pending so a later sweep retries. The failure is only
/// logged: the upload that triggered this rebuild finished long ago.
fn dispatch(store: Arc<dyn HierarchyStore>, builder: Arc<dyn RepoBuilder>, key: RepoKey) {
    tokio::spawn(async move {
        let repo = match store.get_repo(&key).await {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                error!("repo {} vanished before build", key);
                return;
            }
            Err(e) => {
                error!("could not load repo {}: {}", key, e);
                return;
            }
        };

        let result = builder.build(&repo).await;
        let success = result.is_ok();
        if let Err(e) = &result {
            error!("rebuild of {} failed, will retry: {}", key, e);
        } else {
            info!("rebuild of {} completed", key);
        }

        if let Err(e) = store.finish_build(&key, success).await {
            error!("could not release build flag for {}: {}", key, e);
        }
    });
}

//! Persisted instance registry shared across processes.
//!
//! The registry is a single JSON snapshot on disk (`instances.json`) holding
//! every tracked instance record, a capped lifecycle-event log, and the
//! gateway ownership record. Multiple OS processes mutate it: agent
//! processes register themselves and report project changes, while the
//! gateway's monitor and reaper loops drive liveness transitions.
//!
//! Consistency discipline:
//! - Every mutation is one atomic read-modify-write of the whole snapshot,
//!   serialized by an advisory file lock (`instances.lock`) shared by all
//!   callers, in-process and cross-process.
//! - Writes go to a temporary file and are atomically renamed into place, so
//!   a reader may see a stale snapshot during a concurrent write but never a
//!   torn one.
//! - A corrupt or unreadable snapshot is treated as an empty registry:
//!   logged, recovered, never fatal.

mod types;

pub use types::{
    GatewayOwnership, InstanceRecord, InstanceState, LifecycleEvent, LifecycleEventKind,
    RegistrySnapshot,
};

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs4::FileExt;

use crate::error::RegistryError;

/// Snapshot file name under the registry base directory.
pub const REGISTRY_FILENAME: &str = "instances.json";
/// Lock file name under the registry base directory.
pub const LOCK_FILENAME: &str = "instances.lock";
/// Maximum number of lifecycle events retained in the snapshot.
pub const MAX_LIFECYCLE_EVENTS: usize = 1000;
/// Default age after which a zombie record is pruned.
pub const DEFAULT_ZOMBIE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default bounded wait for the registry lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between lock acquisition attempts while waiting.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// File-locked registry of running instances.
///
/// Cheap to clone; every operation opens, locks, and releases the
/// underlying files itself, so clones across tasks and threads all see the
/// same serialized view.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    registry_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

/// Holds the advisory lock for the duration of one read-modify-write.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Released on close anyway; unlock explicitly so the release is not
        // deferred by a lingering descriptor.
        let _ = self.file.unlock();
    }
}

impl RegistryStore {
    /// Open (or create) the registry under the given base directory.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let base_dir = base_dir.as_ref();
        fs::create_dir_all(base_dir)?;
        Ok(Self {
            registry_path: base_dir.join(REGISTRY_FILENAME),
            lock_path: base_dir.join(LOCK_FILENAME),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Override the bounded wait for lock acquisition.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Path of the persisted snapshot file.
    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    // ==================== Locking & persistence ====================

    /// Acquire the shared advisory lock, waiting up to the configured
    /// timeout. Contention past the deadline surfaces as `LockTimeout`
    /// rather than blocking indefinitely.
    async fn acquire_lock(&self) -> Result<LockGuard, RegistryError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if started.elapsed() >= self.lock_timeout {
                        return Err(RegistryError::LockTimeout {
                            waited: started.elapsed(),
                        });
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Parse snapshot bytes, mapping any decode failure to `CorruptState`.
    fn parse_snapshot(bytes: &[u8]) -> Result<RegistrySnapshot, RegistryError> {
        serde_json::from_slice(bytes).map_err(|e| RegistryError::CorruptState {
            reason: e.to_string(),
        })
    }

    /// Load the snapshot (must hold the lock). Missing or corrupt files
    /// recover to an empty registry.
    fn load(&self) -> RegistrySnapshot {
        let bytes = match fs::read(&self.registry_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return RegistrySnapshot::default();
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.registry_path.display(),
                    error = %e,
                    "failed to read registry snapshot, starting empty"
                );
                return RegistrySnapshot::default();
            }
        };

        match Self::parse_snapshot(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    path = %self.registry_path.display(),
                    error = %e,
                    "corrupt registry snapshot, starting empty"
                );
                RegistrySnapshot::default()
            }
        }
    }

    /// Persist the snapshot atomically (must hold the lock): trim the event
    /// log, write a temporary file, rename it into place.
    fn save(&self, snapshot: &mut RegistrySnapshot) -> Result<(), RegistryError> {
        snapshot.trim_events(MAX_LIFECYCLE_EVENTS);

        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp_path = self.registry_path.with_extension("json.tmp");
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &self.registry_path)?;
        Ok(())
    }

    /// Run one atomic read-modify-write of the whole snapshot.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut RegistrySnapshot) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let _guard = self.acquire_lock().await?;
        let mut snapshot = self.load();
        let out = f(&mut snapshot)?;
        self.save(&mut snapshot)?;
        Ok(out)
    }

    /// Run a consistent read of the snapshot.
    async fn read<T>(
        &self,
        f: impl FnOnce(&RegistrySnapshot) -> T,
    ) -> Result<T, RegistryError> {
        let _guard = self.acquire_lock().await?;
        let snapshot = self.load();
        Ok(f(&snapshot))
    }

    // ==================== Instance operations ====================

    /// Register a new instance or update an existing one.
    ///
    /// A new pid creates a record in `LiveNoProject` and appends a
    /// `Started` event. An existing zombie is restored (per its stored
    /// project field) with a `HeartbeatRestored` event. Re-registering a
    /// live instance just refreshes its fields; no duplicate event.
    pub async fn register(
        &self,
        pid: u32,
        endpoint: impl Into<String>,
        context: Option<String>,
        modes: Vec<String>,
    ) -> Result<InstanceRecord, RegistryError> {
        let endpoint = endpoint.into();
        self.mutate(move |snapshot| {
            if let Some(record) = snapshot.instances.get_mut(&pid) {
                record.endpoint = endpoint.clone();
                record.last_heartbeat = chrono::Utc::now();
                record.context = context;
                record.modes = modes;
                if record.state == InstanceState::Zombie {
                    record.state = record.live_state();
                    record.zombie_detected_at = None;
                    let project = record.project_name.clone();
                    snapshot.push_event(
                        LifecycleEventKind::HeartbeatRestored,
                        pid,
                        endpoint,
                        project,
                        None,
                    );
                }
                Ok(snapshot.instances[&pid].clone())
            } else {
                let message = format!(
                    "context: {}, modes: {:?}",
                    snapshot_context(&context),
                    modes
                );
                let record = InstanceRecord::new(pid, endpoint.clone(), context, modes);
                snapshot.instances.insert(pid, record.clone());
                snapshot.push_event(
                    LifecycleEventKind::Started,
                    pid,
                    endpoint,
                    None,
                    Some(message),
                );
                Ok(record)
            }
        })
        .await
    }

    /// Update the active project for an instance.
    ///
    /// A set name transitions to `LiveWithProject` (appending
    /// `ProjectActivated` only when the name changed); a cleared name
    /// transitions to `LiveNoProject` (appending `ProjectDeactivated` if a
    /// project had been set). Unknown pids are an error.
    pub async fn update_project(
        &self,
        pid: u32,
        project_name: Option<String>,
        project_root: Option<String>,
    ) -> Result<(), RegistryError> {
        self.mutate(move |snapshot| {
            let record = snapshot
                .instances
                .get_mut(&pid)
                .ok_or(RegistryError::NotFound { pid })?;

            let old_project = record.project_name.take();
            record.project_name = project_name.clone();
            record.project_root = project_root;
            record.last_heartbeat = chrono::Utc::now();
            record.state = record.live_state();
            record.zombie_detected_at = None;
            let endpoint = record.endpoint.clone();

            match project_name {
                Some(name) if old_project.as_deref() != Some(name.as_str()) => {
                    snapshot.push_event(
                        LifecycleEventKind::ProjectActivated,
                        pid,
                        endpoint,
                        Some(name),
                        None,
                    );
                }
                Some(_) => {}
                None => {
                    if let Some(old) = old_project {
                        snapshot.push_event(
                            LifecycleEventKind::ProjectDeactivated,
                            pid,
                            endpoint,
                            Some(old),
                            None,
                        );
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Refresh the last-contact timestamp for an instance, restoring it
    /// from zombie state if a prior probe had failed.
    pub async fn touch(&self, pid: u32) -> Result<(), RegistryError> {
        self.mutate(move |snapshot| {
            let record = snapshot
                .instances
                .get_mut(&pid)
                .ok_or(RegistryError::NotFound { pid })?;

            record.last_heartbeat = chrono::Utc::now();
            if record.state == InstanceState::Zombie {
                record.state = record.live_state();
                record.zombie_detected_at = None;
                let endpoint = record.endpoint.clone();
                let project = record.project_name.clone();
                snapshot.push_event(
                    LifecycleEventKind::HeartbeatRestored,
                    pid,
                    endpoint,
                    project,
                    None,
                );
            }
            Ok(())
        })
        .await
    }

    /// Mark an instance as unreachable.
    ///
    /// Idempotent: only the first call records the detection timestamp and
    /// a `ZombieDetected` event. Unknown pids are ignored (the instance may
    /// have unregistered between listing and probing).
    pub async fn mark_zombie(&self, pid: u32) -> Result<(), RegistryError> {
        self.mutate(move |snapshot| {
            if let Some(record) = snapshot.instances.get_mut(&pid) {
                if record.state != InstanceState::Zombie {
                    record.state = InstanceState::Zombie;
                    record.zombie_detected_at = Some(chrono::Utc::now());
                    let endpoint = record.endpoint.clone();
                    let project = record.project_name.clone();
                    snapshot.push_event(
                        LifecycleEventKind::ZombieDetected,
                        pid,
                        endpoint,
                        project,
                        None,
                    );
                }
            }
            Ok(())
        })
        .await
    }

    /// Remove an instance record (clean shutdown). No-op if absent.
    pub async fn unregister(&self, pid: u32) -> Result<(), RegistryError> {
        self.mutate(move |snapshot| {
            if let Some(record) = snapshot.instances.remove(&pid) {
                snapshot.push_event(
                    LifecycleEventKind::Stopped,
                    pid,
                    record.endpoint,
                    record.project_name,
                    None,
                );
            }
            Ok(())
        })
        .await
    }

    /// Remove every zombie whose detection age is at least `timeout`,
    /// appending one `ZombiePruned` event per removal. Returns the pruned
    /// pids. Never touches non-zombie records.
    pub async fn prune_zombies(&self, timeout: Duration) -> Result<Vec<u32>, RegistryError> {
        self.mutate(move |snapshot| {
            let now = chrono::Utc::now();
            let to_remove: Vec<u32> = snapshot
                .instances
                .values()
                .filter(|record| {
                    record.state == InstanceState::Zombie
                        && record.zombie_detected_at.is_some_and(|detected| {
                            (now - detected).to_std().unwrap_or_default() >= timeout
                        })
                })
                .map(|record| record.pid)
                .collect();

            for pid in &to_remove {
                if let Some(record) = snapshot.instances.remove(pid) {
                    snapshot.push_event(
                        LifecycleEventKind::ZombiePruned,
                        *pid,
                        record.endpoint,
                        record.project_name,
                        Some(format!("auto-pruned after {}s", timeout.as_secs())),
                    );
                }
            }
            Ok(to_remove)
        })
        .await
    }

    /// Record the outcome of a force-kill attempt, removing the record if
    /// the kill succeeded. The event is appended on success and failure
    /// alike.
    pub async fn record_force_kill(&self, pid: u32, success: bool) -> Result<(), RegistryError> {
        self.mutate(move |snapshot| {
            let (endpoint, project) = snapshot
                .instances
                .get(&pid)
                .map(|r| (r.endpoint.clone(), r.project_name.clone()))
                .unwrap_or_default();

            snapshot.push_event(
                LifecycleEventKind::ForceKilled,
                pid,
                endpoint,
                project,
                Some(if success {
                    "force kill succeeded".to_string()
                } else {
                    "force kill failed".to_string()
                }),
            );

            if success {
                snapshot.instances.remove(&pid);
            }
            Ok(())
        })
        .await
    }

    // ==================== Reads ====================

    /// All registered instances, ordered by pid.
    pub async fn list(&self) -> Result<Vec<InstanceRecord>, RegistryError> {
        self.read(|snapshot| snapshot.instances.values().cloned().collect())
            .await
    }

    /// One instance by pid.
    pub async fn get(&self, pid: u32) -> Result<InstanceRecord, RegistryError> {
        self.read(move |snapshot| snapshot.instances.get(&pid).cloned())
            .await?
            .ok_or(RegistryError::NotFound { pid })
    }

    /// The most recent lifecycle events, in chronological order.
    pub async fn events(&self, limit: usize) -> Result<Vec<LifecycleEvent>, RegistryError> {
        self.read(move |snapshot| {
            let start = snapshot.events.len().saturating_sub(limit);
            snapshot.events[start..].to_vec()
        })
        .await
    }

    // ==================== Gateway ownership ====================

    /// The currently recorded gateway owner, if any.
    pub async fn gateway_ownership(&self) -> Result<Option<GatewayOwnership>, RegistryError> {
        self.read(|snapshot| snapshot.gateway.clone()).await
    }

    /// Record the given process as the bound gateway.
    pub async fn set_gateway_ownership(
        &self,
        pid: u32,
        endpoint: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let endpoint = endpoint.into();
        self.mutate(move |snapshot| {
            snapshot.gateway = Some(GatewayOwnership { pid, endpoint });
            Ok(())
        })
        .await
    }

    /// Clear the ownership record, but only if it still names `pid`.
    pub async fn clear_gateway_ownership(&self, pid: u32) -> Result<(), RegistryError> {
        self.mutate(move |snapshot| {
            if snapshot.gateway.as_ref().is_some_and(|own| own.pid == pid) {
                snapshot.gateway = None;
            }
            Ok(())
        })
        .await
    }
}

fn snapshot_context(context: &Option<String>) -> &str {
    context.as_deref().unwrap_or("none")
}

//! Registry data model: instance records, lifecycle events, and the
//! persisted snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Liveness state of a tracked instance.
///
/// The state is always derivable from the record's own fields: a zombie
/// carries its detection timestamp, and the live states differ only in
/// whether a project name is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Reachable, no active project.
    LiveNoProject,
    /// Reachable with an active project.
    LiveWithProject,
    /// Unreachable after a failed liveness contact, pending removal.
    Zombie,
}

impl InstanceState {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::LiveNoProject => "live_no_project",
            InstanceState::LiveWithProject => "live_with_project",
            InstanceState::Zombie => "zombie",
        }
    }

    /// Check whether the instance is considered reachable.
    pub fn is_live(&self) -> bool {
        !matches!(self, InstanceState::Zombie)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kinds of lifecycle events recorded in the registry log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    /// A new instance registered.
    Started,
    /// An instance unregistered cleanly.
    Stopped,
    /// An instance activated a project.
    ProjectActivated,
    /// An instance cleared its active project.
    ProjectDeactivated,
    /// A liveness contact failed and the instance was marked zombie.
    ZombieDetected,
    /// A zombie exceeded the prune timeout and its record was removed.
    ZombiePruned,
    /// A force-kill was attempted against a zombie (success or failure).
    ForceKilled,
    /// A zombie came back: some contact with the instance succeeded.
    HeartbeatRestored,
}

impl LifecycleEventKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEventKind::Started => "started",
            LifecycleEventKind::Stopped => "stopped",
            LifecycleEventKind::ProjectActivated => "project_activated",
            LifecycleEventKind::ProjectDeactivated => "project_deactivated",
            LifecycleEventKind::ZombieDetected => "zombie_detected",
            LifecycleEventKind::ZombiePruned => "zombie_pruned",
            LifecycleEventKind::ForceKilled => "force_killed",
            LifecycleEventKind::HeartbeatRestored => "heartbeat_restored",
        }
    }
}

impl std::fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable entry in the append-only lifecycle log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: LifecycleEventKind,
    /// Process identifier of the instance the event concerns.
    pub pid: u32,
    /// Endpoint of that instance at the time of the event.
    pub endpoint: String,
    /// Project name, where relevant to the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Free-text detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One tracked agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Process identifier (unique key).
    pub pid: u32,
    /// Local endpoint address, `host:port`.
    pub endpoint: String,
    /// When the record was created.
    pub started_at: DateTime<Utc>,
    /// Last successful contact of any kind.
    pub last_heartbeat: DateTime<Utc>,
    /// Free-form context tag (e.g. which client launched the instance).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Names of the instance's active modes.
    #[serde(default)]
    pub modes: Vec<String>,
    /// Active project name, if one is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Root directory of the active project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<String>,
    /// Current liveness state.
    pub state: InstanceState,
    /// When the instance was marked zombie, if it is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zombie_detected_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Create a fresh record in the initial state.
    pub fn new(
        pid: u32,
        endpoint: impl Into<String>,
        context: Option<String>,
        modes: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            pid,
            endpoint: endpoint.into(),
            started_at: now,
            last_heartbeat: now,
            context,
            modes,
            project_name: None,
            project_root: None,
            state: InstanceState::LiveNoProject,
            zombie_detected_at: None,
        }
    }

    /// Human label for display: `"<pid> - <project>"` or `"<pid> - NO PROJECT"`.
    pub fn label(&self) -> String {
        match self.project_name.as_deref() {
            Some(name) => format!("{} - {}", self.pid, name),
            None => format!("{} - NO PROJECT", self.pid),
        }
    }

    /// The live state this record belongs in, per its stored project field.
    ///
    /// Used when restoring a zombie after a successful contact.
    pub fn live_state(&self) -> InstanceState {
        if self.project_name.is_some() {
            InstanceState::LiveWithProject
        } else {
            InstanceState::LiveNoProject
        }
    }
}

/// The aggregator gateway currently bound, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOwnership {
    /// Process identifier of the owning gateway.
    pub pid: u32,
    /// Endpoint the gateway is serving on, `host:port`.
    pub endpoint: String,
}

/// The full persisted unit: instance table, event log, gateway ownership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Records keyed by process identifier.
    #[serde(default)]
    pub instances: BTreeMap<u32, InstanceRecord>,
    /// Capped, append-only lifecycle log, ordered by insertion time.
    #[serde(default)]
    pub events: Vec<LifecycleEvent>,
    /// The currently-bound gateway, if one has recorded itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayOwnership>,
}

impl RegistrySnapshot {
    /// Append an event for an instance, using the record's current endpoint
    /// and project where available.
    pub fn push_event(
        &mut self,
        kind: LifecycleEventKind,
        pid: u32,
        endpoint: impl Into<String>,
        project_name: Option<String>,
        message: Option<String>,
    ) {
        self.events.push(LifecycleEvent {
            timestamp: Utc::now(),
            kind,
            pid,
            endpoint: endpoint.into(),
            project_name,
            message,
        });
    }

    /// Drop the oldest events beyond `cap`.
    pub fn trim_events(&mut self, cap: usize) {
        if self.events.len() > cap {
            let excess = self.events.len() - cap;
            self.events.drain(0..excess);
        }
    }
}

//! Per-stage installation conditions.
//!
//! The install state machine is a fixed, ordered chain of stages. Each stage
//! owns exactly one [`Condition`] recording its status, fractional progress
//! and failure reason. A package starts with an empty set; the first
//! reconciliation pass initializes one `Waiting` condition per stage, after
//! which the set never grows, shrinks or reorders.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// One named phase of the install state machine, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Init,
    DownloadPackage,
    UnpackPackage,
    PushImage,
    Ready,
}

impl Stage {
    /// All stages, in the order they may run.
    pub const ALL: [Stage; 5] = [
        Stage::Init,
        Stage::DownloadPackage,
        Stage::UnpackPackage,
        Stage::PushImage,
        Stage::Ready,
    ];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Init => "Init",
            Stage::DownloadPackage => "DownloadPackage",
            Stage::UnpackPackage => "UnpackPackage",
            Stage::PushImage => "PushImage",
            Stage::Ready => "Ready",
        };
        f.write_str(name)
    }
}

/// Status of a single stage condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

/// Persisted status record for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub stage: Stage,
    pub status: ConditionStatus,
    /// Fractional progress, always within 0..=100.
    pub progress: u8,
    /// Short machine-readable failure code. Empty unless failed.
    pub reason: String,
    /// Human-readable detail. Empty unless failed.
    pub message: String,
    pub last_heartbeat: SystemTime,
    /// Updated only when `status` actually changes.
    pub last_transition: SystemTime,
}

impl Condition {
    fn new(stage: Stage) -> Self {
        let now = SystemTime::now();
        Self {
            stage,
            status: ConditionStatus::Waiting,
            progress: 0,
            reason: String::new(),
            message: String::new(),
            last_heartbeat: now,
            last_transition: now,
        }
    }
}

/// Fixed-size ordered set of conditions, one per stage.
///
/// The inner list is private: the only mutations are the operations below,
/// so an initialized set can never lose a stage, duplicate one, or change
/// order. Mutating a stage that is not present is a no-op.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionSet {
    conditions: Vec<Condition>,
}

impl ConditionSet {
    /// The state persisted before the first pass: no conditions at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// An initialized set: one condition per stage, all `Waiting`.
    pub fn initialized() -> Self {
        Self {
            conditions: Stage::ALL.iter().map(|s| Condition::new(*s)).collect(),
        }
    }

    pub fn get(&self, stage: Stage) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.stage == stage)
    }

    fn get_mut(&mut self, stage: Stage) -> Option<&mut Condition> {
        self.conditions.iter_mut().find(|c| c.stage == stage)
    }

    /// Set a stage's status. Bumps the heartbeat always and the transition
    /// time only on an actual change; completing a stage forces progress to
    /// 100 and clears any stale failure reason.
    pub fn set_status(&mut self, stage: Stage, status: ConditionStatus) {
        if let Some(cond) = self.get_mut(stage) {
            if cond.status != status {
                cond.last_transition = SystemTime::now();
            }
            cond.last_heartbeat = SystemTime::now();
            cond.status = status;
            if status == ConditionStatus::Completed {
                cond.progress = 100;
                cond.reason.clear();
                cond.message.clear();
            }
        }
    }

    pub fn set_reason(&mut self, stage: Stage, reason: &str, message: &str) {
        if let Some(cond) = self.get_mut(stage) {
            cond.last_heartbeat = SystemTime::now();
            cond.reason = reason.to_string();
            cond.message = message.to_string();
        }
    }

    /// Store a progress value, clamped to 0..=100. Returns whether the
    /// stored value changed, so callers can skip redundant persistence.
    pub fn set_progress(&mut self, stage: Stage, progress: u32) -> bool {
        let progress = progress.min(100) as u8;
        match self.get_mut(stage) {
            Some(cond) => {
                cond.last_heartbeat = SystemTime::now();
                if cond.progress != progress {
                    cond.progress = progress;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn is_completed(&self, stage: Stage) -> bool {
        matches!(
            self.get(stage),
            Some(c) if c.status == ConditionStatus::Completed
        )
    }

    pub fn any_running(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.status == ConditionStatus::Running)
    }

    pub fn any_failed(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.status == ConditionStatus::Failed)
    }

    pub fn all_completed(&self) -> bool {
        !self.conditions.is_empty()
            && self
                .conditions
                .iter()
                .all(|c| c.status == ConditionStatus::Completed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.conditions.iter()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

use std::fmt;
use std::str::FromStr;

use conclave_kernel_chain::{canonicalize, Digest, Envelope, HashAlgorithm};
use conclave_kernel_lifecycle::{Applied, Cursor, Fold, FoldError, LegitimacyBoard, TaskBoard};
use serde::{Deserialize, Serialize};

use crate::error::ProjectionError;

/// The derived views the engine maintains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionName {
    Tasks,
    Legitimacy,
}

impl ProjectionName {
    pub const ALL: [ProjectionName; 2] = [ProjectionName::Tasks, ProjectionName::Legitimacy];

    pub fn as_str(self) -> &'static str {
        match self {
            ProjectionName::Tasks => "tasks",
            ProjectionName::Legitimacy => "legitimacy",
        }
    }
}

impl fmt::Display for ProjectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectionName {
    type Err = ProjectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| ProjectionError::UnknownProjection(s.to_string()))
    }
}

/// A serialisable, comparable picture of one projection.
///
/// `digest` is BLAKE3 over the canonical JSON of `rows`, so two processes
/// folding the same ledger produce equal digests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectionState {
    pub name: ProjectionName,
    pub last_applied_sequence: Option<u64>,
    pub last_applied_hash: Option<Digest>,
    pub digest: Digest,
    pub rows: serde_json::Value,
}

impl ProjectionState {
    pub fn of<F: Fold>(name: ProjectionName, fold: &F) -> Result<Self, ProjectionError> {
        let rows = serde_json::to_value(fold.snapshot())?;
        let digest = HashAlgorithm::Blake3.digest(&canonicalize(&rows));
        let cursor = fold.cursor();
        Ok(Self {
            name,
            last_applied_sequence: cursor.map(|c| c.sequence),
            last_applied_hash: cursor.map(|c| c.hash),
            digest,
            rows,
        })
    }
}

/// Every projection, folded together.
#[derive(Clone, Debug, Default)]
pub struct Views {
    pub tasks: TaskBoard,
    pub legitimacy: LegitimacyBoard,
}

impl Views {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one envelope into every view. Views already past it treat it as
    /// a replay.
    pub fn apply(&mut self, envelope: &Envelope) -> Result<bool, FoldError> {
        let tasks = self.tasks.apply(envelope)?;
        let legitimacy = self.legitimacy.apply(envelope)?;
        Ok(tasks != Applied::AlreadyApplied || legitimacy != Applied::AlreadyApplied)
    }

    /// Fold one envelope into the named view only.
    pub fn apply_to(&mut self, name: ProjectionName, envelope: &Envelope) -> Result<Applied, FoldError> {
        match name {
            ProjectionName::Tasks => self.tasks.apply(envelope),
            ProjectionName::Legitimacy => self.legitimacy.apply(envelope),
        }
    }

    pub fn cursor(&self, name: ProjectionName) -> Option<Cursor> {
        match name {
            ProjectionName::Tasks => self.tasks.cursor(),
            ProjectionName::Legitimacy => self.legitimacy.cursor(),
        }
    }

    /// The lowest sequence some view still needs.
    pub fn next_sequence(&self) -> u64 {
        ProjectionName::ALL
            .into_iter()
            .map(|name| self.cursor(name).map_or(0, |c| c.sequence + 1))
            .min()
            .unwrap_or(0)
    }

    pub fn state(&self, name: ProjectionName) -> Result<ProjectionState, ProjectionError> {
        match name {
            ProjectionName::Tasks => ProjectionState::of(name, &self.tasks),
            ProjectionName::Legitimacy => ProjectionState::of(name, &self.legitimacy),
        }
    }

    pub fn replace(&mut self, name: ProjectionName, from: Views) {
        match name {
            ProjectionName::Tasks => self.tasks = from.tasks,
            ProjectionName::Legitimacy => self.legitimacy = from.legitimacy,
        }
    }
}

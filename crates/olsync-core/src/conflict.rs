//! Conflict resolution during reconciliation.
//!
//! The engine never talks to the user directly. It asks a [`ConflictResolver`]
//! and remembers "apply to all" answers for the rest of the current pass in a
//! [`ConflictState`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// How one conflicting path is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Overwrite the local file with the remote content
    UseRemote,
    /// Push the local bytes to the remote, leave the local file alone
    UseLocal,
    /// Touch neither side
    Skip,
}

/// Answer to the first conflict question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAnswer {
    UseRemote,
    UseLocal,
    Skip,
    /// Use remote for this and every remaining conflict of the pass
    AllRemote,
    /// Use local for this and every remaining conflict of the pass
    AllLocal,
    /// Show the differences, then ask the simplified question
    ShowDiff,
}

/// What to do with a previously synced file the remote no longer has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteDeletedAction {
    DeleteLocal,
    /// Keep the local file and keep tracking it, without uploading
    Keep,
    Reupload,
}

/// What to do with a file that only exists locally and was never synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LocalOnlyAction {
    Upload,
    Ignore,
}

/// A path whose local and remote bytes differ.
#[derive(Debug, Clone, Copy)]
pub struct Conflict<'a> {
    pub path: &'a str,
    pub local: &'a [u8],
    pub remote: &'a [u8],
}

/// User-facing questions asked during reconciliation.
///
/// Implementations may block for as long as the user needs to answer.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn ask(&self, conflict: &Conflict<'_>) -> ConflictAnswer;

    /// Present the differences between both versions.
    async fn show_diff(&self, conflict: &Conflict<'_>);

    /// Simplified question asked after the user looked at the diff.
    async fn ask_after_diff(&self, conflict: &Conflict<'_>) -> Resolution;

    async fn remote_deleted(&self, path: &str) -> RemoteDeletedAction;

    async fn local_only(&self, path: &str) -> LocalOnlyAction;
}

/// Resolver answering every question with a fixed policy.
#[derive(Debug, Clone, Copy)]
pub struct PolicyResolver {
    pub conflict: Resolution,
    pub remote_deleted: RemoteDeletedAction,
    pub local_only: LocalOnlyAction,
}

impl Default for PolicyResolver {
    /// Leaves both sides untouched whenever a question comes up.
    fn default() -> Self {
        Self {
            conflict: Resolution::Skip,
            remote_deleted: RemoteDeletedAction::Keep,
            local_only: LocalOnlyAction::Ignore,
        }
    }
}

#[async_trait]
impl ConflictResolver for PolicyResolver {
    async fn ask(&self, _conflict: &Conflict<'_>) -> ConflictAnswer {
        match self.conflict {
            Resolution::UseRemote => ConflictAnswer::UseRemote,
            Resolution::UseLocal => ConflictAnswer::UseLocal,
            Resolution::Skip => ConflictAnswer::Skip,
        }
    }

    async fn show_diff(&self, _conflict: &Conflict<'_>) {}

    async fn ask_after_diff(&self, _conflict: &Conflict<'_>) -> Resolution {
        self.conflict
    }

    async fn remote_deleted(&self, _path: &str) -> RemoteDeletedAction {
        self.remote_deleted
    }

    async fn local_only(&self, _path: &str) -> LocalOnlyAction {
        self.local_only
    }
}

/// Sticky choice for the current reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StickyChoice {
    #[default]
    Ask,
    UseRemote,
    UseLocal,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConflictState {
    pub choice: StickyChoice,
    pub apply_to_all: bool,
}

impl ConflictState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// The sticky resolution, if one is active.
    fn sticky(&self) -> Option<Resolution> {
        if !self.apply_to_all {
            return None;
        }
        match self.choice {
            StickyChoice::Ask => None,
            StickyChoice::UseRemote => Some(Resolution::UseRemote),
            StickyChoice::UseLocal => Some(Resolution::UseLocal),
            StickyChoice::Skip => Some(Resolution::Skip),
        }
    }
}

/// Settle one conflict, consulting the sticky state before asking.
///
/// The state lock is never held while the resolver is awaited.
pub async fn resolve(
    state: &Mutex<ConflictState>,
    resolver: &dyn ConflictResolver,
    conflict: &Conflict<'_>,
) -> Resolution {
    let sticky = state.lock().unwrap_or_else(|e| e.into_inner()).sticky();
    if let Some(resolution) = sticky {
        return resolution;
    }

    let answer = resolver.ask(conflict).await;
    let resolution = match answer {
        ConflictAnswer::UseRemote => Resolution::UseRemote,
        ConflictAnswer::UseLocal => Resolution::UseLocal,
        ConflictAnswer::Skip => Resolution::Skip,
        ConflictAnswer::AllRemote | ConflictAnswer::AllLocal => {
            let (choice, resolution) = if answer == ConflictAnswer::AllRemote {
                (StickyChoice::UseRemote, Resolution::UseRemote)
            } else {
                (StickyChoice::UseLocal, Resolution::UseLocal)
            };
            *state.lock().unwrap_or_else(|e| e.into_inner()) = ConflictState {
                choice,
                apply_to_all: true,
            };
            resolution
        }
        ConflictAnswer::ShowDiff => {
            resolver.show_diff(conflict).await;
            resolver.ask_after_diff(conflict).await
        }
    };
    resolution
}

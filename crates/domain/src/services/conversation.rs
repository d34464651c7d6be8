use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{CatalogKind, MediaRef, TaskKind, UserId};

/// Interactive flows where the user picks catalog elements before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionFlow {
    Scene,
    Pose,
}

impl SelectionFlow {
    pub fn catalog_kind(self) -> CatalogKind {
        match self {
            Self::Scene => CatalogKind::PhotoScene,
            Self::Pose => CatalogKind::Pose,
        }
    }

    pub fn task_kind(self) -> TaskKind {
        match self {
            Self::Scene => TaskKind::PhotoScene,
            Self::Pose => TaskKind::PhotoPose,
        }
    }
}

/// Identifies one running generation; only its owner may clear the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationRun(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationState {
    Selecting {
        flow: SelectionFlow,
        image: MediaRef,
        selected: BTreeSet<i64>,
    },
    Generating {
        kind: TaskKind,
        run: GenerationRun,
    },
}

/// Elements collected by a confirmed selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub flow: SelectionFlow,
    pub image: MediaRef,
    pub element_ids: Vec<i64>,
    pub run: GenerationRun,
}

/// Selections expire after `idle`; a running generation never does.
struct IdleSelections {
    idle: Duration,
}

impl IdleSelections {
    fn ttl(&self, state: &ConversationState) -> Option<Duration> {
        match state {
            ConversationState::Selecting { .. } => Some(self.idle),
            ConversationState::Generating { .. } => None,
        }
    }
}

impl Expiry<UserId, ConversationState> for IdleSelections {
    fn expire_after_create(
        &self,
        _user: &UserId,
        state: &ConversationState,
        _created_at: Instant,
    ) -> Option<Duration> {
        self.ttl(state)
    }

    fn expire_after_read(
        &self,
        _user: &UserId,
        state: &ConversationState,
        _read_at: Instant,
        _remaining: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        self.ttl(state)
    }

    fn expire_after_update(
        &self,
        _user: &UserId,
        state: &ConversationState,
        _updated_at: Instant,
        _remaining: Option<Duration>,
    ) -> Option<Duration> {
        self.ttl(state)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("a generation is already running for this user")]
    Busy,
    #[error("no selection in progress")]
    NoSelection,
    #[error("at most {0} elements can be selected")]
    TooMany(usize),
    #[error("nothing selected")]
    EmptySelection,
}

/// Per-user conversation state keyed by platform id. Selections idle past the
/// TTL are dropped; the busy marker of a running generation stays until that
/// generation finishes.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    states: Cache<UserId, ConversationState>,
    max_selected: usize,
    runs: Arc<AtomicU64>,
}

impl ConversationStore {
    pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(30 * 60);
    pub const DEFAULT_MAX_SELECTED: usize = 10;

    pub fn new(idle_ttl: Duration, max_selected: usize) -> Self {
        Self {
            states: Cache::builder()
                .expire_after(IdleSelections { idle: idle_ttl })
                .build(),
            max_selected: max_selected.max(1),
            runs: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_run(&self) -> GenerationRun {
        GenerationRun(self.runs.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self, user: UserId) -> Option<ConversationState> {
        self.states.get(&user)
    }

    pub fn start_selection(
        &self,
        user: UserId,
        flow: SelectionFlow,
        image: MediaRef,
    ) -> Result<(), ConversationError> {
        let result = self.states.entry(user).and_compute_with(|current| {
            match current.map(|entry| entry.into_value()) {
                Some(ConversationState::Generating { .. }) => Op::Nop,
                _ => Op::Put(ConversationState::Selecting {
                    flow,
                    image,
                    selected: BTreeSet::new(),
                }),
            }
        });
        match result {
            CompResult::Inserted(_) | CompResult::ReplacedWith(_) => Ok(()),
            _ => Err(ConversationError::Busy),
        }
    }

    /// Adds or removes an element; returns the selection after the toggle.
    pub fn toggle(&self, user: UserId, element_id: i64) -> Result<BTreeSet<i64>, ConversationError> {
        let max_selected = self.max_selected;
        let mut failure = ConversationError::NoSelection;
        let result = self.states.entry(user).and_compute_with(|current| {
            match current.map(|entry| entry.into_value()) {
                Some(ConversationState::Selecting {
                    flow,
                    image,
                    mut selected,
                }) => {
                    if !selected.remove(&element_id) {
                        if selected.len() >= max_selected {
                            failure = ConversationError::TooMany(max_selected);
                            return Op::Nop;
                        }
                        selected.insert(element_id);
                    }
                    Op::Put(ConversationState::Selecting {
                        flow,
                        image,
                        selected,
                    })
                }
                Some(ConversationState::Generating { .. }) => {
                    failure = ConversationError::Busy;
                    Op::Nop
                }
                None => Op::Nop,
            }
        });
        match result {
            CompResult::ReplacedWith(entry) => match entry.into_value() {
                ConversationState::Selecting { selected, .. } => Ok(selected),
                ConversationState::Generating { .. } => Err(ConversationError::Busy),
            },
            _ => Err(failure),
        }
    }

    /// Atomically turns a non-empty selection into a running generation.
    pub fn confirm_selection(&self, user: UserId) -> Result<Selection, ConversationError> {
        let run = self.next_run();
        let mut confirmed = None;
        let mut failure = ConversationError::NoSelection;
        self.states.entry(user).and_compute_with(|current| {
            match current.map(|entry| entry.into_value()) {
                Some(ConversationState::Selecting {
                    flow,
                    image,
                    selected,
                }) => {
                    if selected.is_empty() {
                        failure = ConversationError::EmptySelection;
                        return Op::Nop;
                    }
                    confirmed = Some(Selection {
                        flow,
                        image,
                        element_ids: selected.into_iter().collect(),
                        run,
                    });
                    Op::Put(ConversationState::Generating {
                        kind: flow.task_kind(),
                        run,
                    })
                }
                Some(ConversationState::Generating { .. }) => {
                    failure = ConversationError::Busy;
                    Op::Nop
                }
                None => Op::Nop,
            }
        });
        confirmed.ok_or(failure)
    }

    /// Marks a generation as running unless one already is.
    pub fn try_begin_generation(&self, user: UserId, kind: TaskKind) -> Option<GenerationRun> {
        let run = self.next_run();
        let result = self.states.entry(user).and_compute_with(|current| {
            match current.map(|entry| entry.into_value()) {
                Some(ConversationState::Generating { .. }) => Op::Nop,
                _ => Op::Put(ConversationState::Generating { kind, run }),
            }
        });
        matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_)).then_some(run)
    }

    /// Clears the busy marker if it still belongs to `run`.
    pub fn finish_generation(&self, user: UserId, run: GenerationRun) {
        self.states.entry(user).and_compute_with(|current| {
            match current.map(|entry| entry.into_value()) {
                Some(ConversationState::Generating { run: current, .. }) if current == run => {
                    Op::Remove
                }
                _ => Op::Nop,
            }
        });
    }

    pub fn cancel(&self, user: UserId) -> Option<ConversationState> {
        self.states.remove(&user)
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_IDLE_TTL, Self::DEFAULT_MAX_SELECTED)
    }
}

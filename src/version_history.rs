//! Branching event-version histories.
//!
//! A [`VersionHistory`] is one continuous run of `(event_id, version)` items
//! since some fork point. Consecutive events written under the same failover
//! version are collapsed into a single item carrying the highest event id, so
//! items are strictly increasing by event id and non-decreasing by version.
//!
//! Two branches of the same workflow always share a prefix. The latest point
//! where they still agree is their lowest common ancestor (LCA); everything
//! the reconciler decides about an incoming update starts from that item.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One `(event_id, version)` point: the last event id written at `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    pub event_id: i64,
    pub version: i64,
}

impl VersionHistoryItem {
    pub fn new(event_id: i64, version: i64) -> Self {
        Self { event_id, version }
    }
}

impl fmt::Display for VersionHistoryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(event_id={}, version={})", self.event_id, self.version)
    }
}

/// Failures of version-history operations.
///
/// All of these indicate corrupt or inconsistent replicated state rather than
/// an ordering race, so they are never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionHistoryError {
    /// The history has no items.
    EmptyHistory,
    /// Two histories never agreed on any version.
    NoCommonAncestor,
    /// An item would break the ordering invariants of the history.
    InvalidItem {
        item: VersionHistoryItem,
        last: VersionHistoryItem,
    },
    /// No item on this branch covers the event id.
    EventNotFound { event_id: i64 },
    /// A history index outside of the branch set.
    IndexOutOfBounds { index: usize, len: usize },
    /// No branch contains the item.
    ItemNotFound { item: VersionHistoryItem },
}

impl fmt::Display for VersionHistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionHistoryError::EmptyHistory => write!(f, "version history is empty"),
            VersionHistoryError::NoCommonAncestor => {
                write!(f, "version history is malformed: no joint point found")
            }
            VersionHistoryError::InvalidItem { item, last } => {
                write!(f, "cannot add version history item {item} after {last}")
            }
            VersionHistoryError::EventNotFound { event_id } => {
                write!(f, "event id {event_id} not found in version history")
            }
            VersionHistoryError::IndexOutOfBounds { index, len } => {
                write!(f, "version history index {index} out of bounds (len={len})")
            }
            VersionHistoryError::ItemNotFound { item } => {
                write!(f, "version history item {item} not found in any branch")
            }
        }
    }
}

impl std::error::Error for VersionHistoryError {}

/// One branch of a workflow's event-version timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    branch_token: Vec<u8>,
    items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// Build a branch from already-collapsed items.
    pub fn new(branch_token: impl Into<Vec<u8>>, items: Vec<VersionHistoryItem>) -> Self {
        Self {
            branch_token: branch_token.into(),
            items,
        }
    }

    pub fn branch_token(&self) -> &[u8] {
        &self.branch_token
    }

    pub fn set_branch_token(&mut self, branch_token: impl Into<Vec<u8>>) {
        self.branch_token = branch_token.into();
    }

    pub fn items(&self) -> &[VersionHistoryItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn first_item(&self) -> Result<VersionHistoryItem, VersionHistoryError> {
        self.items.first().copied().ok_or(VersionHistoryError::EmptyHistory)
    }

    pub fn last_item(&self) -> Result<VersionHistoryItem, VersionHistoryError> {
        self.items.last().copied().ok_or(VersionHistoryError::EmptyHistory)
    }

    /// Extend the branch with `item`.
    ///
    /// An item at the same version as the last one moves that item's event id
    /// forward; a higher version appends a new item. An item whose event id is
    /// not past the last item's, including the last item itself, fails with
    /// [`VersionHistoryError::InvalidItem`] and leaves the branch unchanged.
    pub fn add_or_update_item(&mut self, item: VersionHistoryItem) -> Result<(), VersionHistoryError> {
        let Some(last) = self.items.last_mut() else {
            self.items.push(item);
            return Ok(());
        };
        if item.version < last.version || item.event_id <= last.event_id {
            return Err(VersionHistoryError::InvalidItem { item, last: *last });
        }
        if item.version == last.version {
            last.event_id = item.event_id;
        } else {
            self.items.push(item);
        }
        Ok(())
    }

    /// Whether the event at `item.event_id` was written at `item.version` on
    /// this branch.
    pub fn contains_item(&self, item: &VersionHistoryItem) -> bool {
        let mut prev_event_id = crate::FIRST_EVENT_ID - 1;
        for current in &self.items {
            if item.version == current.version
                && prev_event_id < item.event_id
                && item.event_id <= current.event_id
            {
                return true;
            }
            prev_event_id = current.event_id;
        }
        false
    }

    /// Version under which `event_id` was written on this branch.
    pub fn event_version(&self, event_id: i64) -> Result<i64, VersionHistoryError> {
        let last = self.last_item()?;
        if event_id < crate::FIRST_EVENT_ID || event_id > last.event_id {
            return Err(VersionHistoryError::EventNotFound { event_id });
        }
        self.items
            .iter()
            .find(|item| event_id <= item.event_id)
            .map(|item| item.version)
            .ok_or(VersionHistoryError::EventNotFound { event_id })
    }

    /// Find the latest item both branches agree on.
    ///
    /// Walks both branches from their tails: the side with the higher version
    /// steps back until versions meet, then the smaller event id of the two
    /// matching items is the common point.
    pub fn find_lca_item(&self, remote: &VersionHistory) -> Result<VersionHistoryItem, VersionHistoryError> {
        let mut local_index = self.items.len();
        let mut remote_index = remote.items.len();
        while local_index > 0 && remote_index > 0 {
            let local_item = self.items[local_index - 1];
            let remote_item = remote.items[remote_index - 1];
            if local_item.version == remote_item.version {
                return Ok(if local_item.event_id > remote_item.event_id {
                    remote_item
                } else {
                    local_item
                });
            } else if local_item.version > remote_item.version {
                local_index -= 1;
            } else {
                remote_index -= 1;
            }
        }
        Err(VersionHistoryError::NoCommonAncestor)
    }

    /// True iff this branch can be extended directly after `lca` without
    /// forking, i.e. `lca` is exactly this branch's last item.
    pub fn is_lca_appendable(&self, lca: &VersionHistoryItem) -> Result<bool, VersionHistoryError> {
        Ok(self.last_item()? == *lca)
    }

    /// Copy of this branch cut off at `lca`, keeping the branch token.
    pub fn copy_until_lca(&self, lca: &VersionHistoryItem) -> Result<VersionHistory, VersionHistoryError> {
        let mut items = Vec::with_capacity(self.items.len());
        for item in &self.items {
            if item.version == lca.version {
                if lca.event_id > item.event_id {
                    break;
                }
                items.push(*lca);
                return Ok(VersionHistory::new(self.branch_token.clone(), items));
            }
            items.push(*item);
        }
        Err(VersionHistoryError::ItemNotFound { item: *lca })
    }
}

/// All known branches of one workflow plus the index of the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    current_index: usize,
    histories: Vec<VersionHistory>,
}

impl VersionHistories {
    pub fn new(history: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![history],
        }
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// The current branch. Fails if a persisted record points past its
    /// branches.
    pub fn current(&self) -> Result<&VersionHistory, VersionHistoryError> {
        self.get(self.current_index)
    }

    pub fn current_mut(&mut self) -> Result<&mut VersionHistory, VersionHistoryError> {
        let len = self.histories.len();
        self.histories
            .get_mut(self.current_index)
            .ok_or(VersionHistoryError::IndexOutOfBounds {
                index: self.current_index,
                len,
            })
    }

    pub fn get(&self, index: usize) -> Result<&VersionHistory, VersionHistoryError> {
        self.histories.get(index).ok_or(VersionHistoryError::IndexOutOfBounds {
            index,
            len: self.histories.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    pub fn set_current_index(&mut self, index: usize) -> Result<(), VersionHistoryError> {
        if index >= self.histories.len() {
            return Err(VersionHistoryError::IndexOutOfBounds {
                index,
                len: self.histories.len(),
            });
        }
        self.current_index = index;
        Ok(())
    }

    /// Add a branch. It becomes current iff its last version is strictly
    /// higher than the current branch's. Returns `(current_changed, index)`.
    pub fn add_version_history(&mut self, history: VersionHistory) -> Result<(bool, usize), VersionHistoryError> {
        let incoming_last = history.last_item()?;
        let current_last = self.current()?.last_item()?;
        self.histories.push(history);
        let index = self.histories.len() - 1;
        let current_changed = incoming_last.version > current_last.version;
        if current_changed {
            self.current_index = index;
        }
        Ok((current_changed, index))
    }

    /// Branch sharing the most history with `incoming`, with that LCA item.
    /// Ties go to the lowest index.
    pub fn find_lca_version_history_index_and_item(
        &self,
        incoming: &VersionHistory,
    ) -> Result<(usize, VersionHistoryItem), VersionHistoryError> {
        let mut best: Option<(usize, VersionHistoryItem)> = None;
        for (index, local) in self.histories.iter().enumerate() {
            let lca = local.find_lca_item(incoming)?;
            match best {
                Some((_, current)) if current.event_id >= lca.event_id => {}
                _ => best = Some((index, lca)),
            }
        }
        best.ok_or(VersionHistoryError::EmptyHistory)
    }

    pub fn find_first_version_history_index_by_item(
        &self,
        item: &VersionHistoryItem,
    ) -> Result<usize, VersionHistoryError> {
        self.histories
            .iter()
            .position(|history| history.contains_item(item))
            .ok_or(VersionHistoryError::ItemNotFound { item: *item })
    }
}

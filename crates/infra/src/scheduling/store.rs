//! Scheduled-command storage.
//!
//! Every scheduled command is recorded under its etag. Recording an etag that
//! is already stored keeps the stored command, so a `CommandScheduled` event
//! handled twice neither resets progress nor delivers again. A retry
//! `supersede`s the failed state with a new pending one; nothing is ever
//! removed.
//!
//! Deliveries `claim` a command first. A claimed command cannot be claimed
//! again until `complete` stores its outcome (or `release` gives it back), so
//! the poller and a precondition watcher racing for the same command deliver
//! it once.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use chronicle_core::ETag;
use chronicle_events::ScheduledCommand;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduledCommandStoreError {
    #[error("scheduled command not found: {0}")]
    NotFound(ETag),

    #[error("scheduled command store lock poisoned")]
    Poisoned,
}

pub trait ScheduledCommandStore<C>: Send + Sync {
    /// Insert the command unless one is already stored under its etag.
    ///
    /// Returns `false` when an existing entry was kept.
    fn record(&self, command: &ScheduledCommand<C>) -> Result<bool, ScheduledCommandStoreError>;

    /// Replace the command stored under its etag with a new pending attempt.
    fn supersede(&self, command: &ScheduledCommand<C>) -> Result<(), ScheduledCommandStoreError>;

    fn get(&self, etag: &ETag) -> Result<Option<ScheduledCommand<C>>, ScheduledCommandStoreError>;

    /// Claim a pending command for delivery.
    ///
    /// Returns `None` if the command is unknown, already has a result, or is
    /// claimed by another delivery.
    fn claim(&self, etag: &ETag) -> Result<Option<ScheduledCommand<C>>, ScheduledCommandStoreError>;

    /// Claim every pending, unclaimed command due at `now`, earliest first.
    fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledCommand<C>>, ScheduledCommandStoreError>;

    /// Store the outcome of a claimed command and release the claim.
    fn complete(&self, command: &ScheduledCommand<C>) -> Result<(), ScheduledCommandStoreError>;

    /// Give a claimed command back without changing it.
    fn release(&self, etag: &ETag) -> Result<(), ScheduledCommandStoreError>;

    /// Pending commands (claimed or not), earliest due first.
    fn pending(&self) -> Result<Vec<ScheduledCommand<C>>, ScheduledCommandStoreError>;
}

#[derive(Debug, Clone)]
struct Entry<C> {
    command: ScheduledCommand<C>,
    claimed: bool,
    recorded_at: DateTime<Utc>,
}

/// In-memory scheduled-command store for tests/dev.
#[derive(Debug)]
pub struct InMemoryScheduledCommandStore<C> {
    commands: RwLock<HashMap<ETag, Entry<C>>>,
}

impl<C> InMemoryScheduledCommandStore<C> {
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C> Default for InMemoryScheduledCommandStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn due_order<C>(a: &Entry<C>, b: &Entry<C>) -> std::cmp::Ordering {
    // Commands without a due time sort first.
    a.command
        .due_time()
        .cmp(&b.command.due_time())
        .then(a.recorded_at.cmp(&b.recorded_at))
}

impl<C> ScheduledCommandStore<C> for InMemoryScheduledCommandStore<C>
where
    C: Clone + Send + Sync,
{
    fn record(&self, command: &ScheduledCommand<C>) -> Result<bool, ScheduledCommandStoreError> {
        let mut commands = self
            .commands
            .write()
            .map_err(|_| ScheduledCommandStoreError::Poisoned)?;
        match commands.entry(command.etag().clone()) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(false),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Entry {
                    command: command.clone(),
                    claimed: false,
                    recorded_at: Utc::now(),
                });
                Ok(true)
            }
        }
    }

    fn supersede(&self, command: &ScheduledCommand<C>) -> Result<(), ScheduledCommandStoreError> {
        let mut commands = self
            .commands
            .write()
            .map_err(|_| ScheduledCommandStoreError::Poisoned)?;
        commands.insert(
            command.etag().clone(),
            Entry {
                command: command.clone(),
                claimed: false,
                recorded_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn get(&self, etag: &ETag) -> Result<Option<ScheduledCommand<C>>, ScheduledCommandStoreError> {
        let commands = self
            .commands
            .read()
            .map_err(|_| ScheduledCommandStoreError::Poisoned)?;
        Ok(commands.get(etag).map(|e| e.command.clone()))
    }

    fn claim(&self, etag: &ETag) -> Result<Option<ScheduledCommand<C>>, ScheduledCommandStoreError> {
        let mut commands = self
            .commands
            .write()
            .map_err(|_| ScheduledCommandStoreError::Poisoned)?;
        match commands.get_mut(etag) {
            Some(entry) if !entry.claimed && entry.command.is_pending() => {
                entry.claimed = true;
                Ok(Some(entry.command.clone()))
            }
            _ => Ok(None),
        }
    }

    fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledCommand<C>>, ScheduledCommandStoreError> {
        let mut commands = self
            .commands
            .write()
            .map_err(|_| ScheduledCommandStoreError::Poisoned)?;

        let mut due: Vec<&mut Entry<C>> = commands
            .values_mut()
            .filter(|e| !e.claimed && e.command.is_due_at(now))
            .collect();
        due.sort_by(|a, b| due_order(a, b));

        Ok(due
            .into_iter()
            .map(|entry| {
                entry.claimed = true;
                entry.command.clone()
            })
            .collect())
    }

    fn complete(&self, command: &ScheduledCommand<C>) -> Result<(), ScheduledCommandStoreError> {
        let mut commands = self
            .commands
            .write()
            .map_err(|_| ScheduledCommandStoreError::Poisoned)?;
        let entry = commands
            .get_mut(command.etag())
            .ok_or_else(|| ScheduledCommandStoreError::NotFound(command.etag().clone()))?;
        entry.command = command.clone();
        entry.claimed = false;
        Ok(())
    }

    fn release(&self, etag: &ETag) -> Result<(), ScheduledCommandStoreError> {
        let mut commands = self
            .commands
            .write()
            .map_err(|_| ScheduledCommandStoreError::Poisoned)?;
        if let Some(entry) = commands.get_mut(etag) {
            entry.claimed = false;
        }
        Ok(())
    }

    fn pending(&self) -> Result<Vec<ScheduledCommand<C>>, ScheduledCommandStoreError> {
        let commands = self
            .commands
            .read()
            .map_err(|_| ScheduledCommandStoreError::Poisoned)?;
        let mut pending: Vec<&Entry<C>> = commands.values().filter(|e| e.command.is_pending()).collect();
        pending.sort_by(|a, b| due_order(a, b));
        Ok(pending.into_iter().map(|e| e.command.clone()).collect())
    }
}

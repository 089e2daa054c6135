//! Implementation of the fair-share load monitor.
//!
//! The monitor keeps one accumulated load value per active user of a queue.
//! A user whose load runs too far ahead of the least loaded user is skipped
//! by the dispatch loop until the others catch up.
//!
//! Loads are caller-defined quantities; the dispatcher charges each submitted
//! pair's wallclock timeout (in seconds) to its owner.

use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::UserId;

/// The type of a user's load.
pub type Load = i64;

/// The default difference from the minimum load beyond which a user is
/// skipped.
pub const DEFAULT_LOAD_THRESHOLD: Load = 600;

/// Represents a per-queue ledger of user loads.
///
/// The minimum load is cached along with the user holding it. The cache is
/// invalidated when that user's load changes or the user is removed, and is
/// recomputed on the next read.
#[derive(Debug, Clone)]
pub struct FairShareLoadMonitor {
    /// The load of each active user.
    loads: HashMap<UserId, Load>,
    /// The cached minimum load and the user holding it.
    ///
    /// `None` means the minimum must be recomputed.
    min: Option<(UserId, Load)>,
    /// How far a user's load may exceed the minimum before they are skipped.
    threshold: Load,
}

impl Default for FairShareLoadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl FairShareLoadMonitor {
    /// Constructs a new, empty monitor with the default threshold.
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_LOAD_THRESHOLD)
    }

    /// Constructs a new, empty monitor with the given threshold.
    pub fn with_threshold(threshold: Load) -> Self {
        Self {
            loads: HashMap::new(),
            min: None,
            threshold,
        }
    }

    /// Gets the skip threshold of the monitor.
    pub fn threshold(&self) -> Load {
        self.threshold
    }

    /// Gets the number of active users.
    pub fn len(&self) -> usize {
        self.loads.len()
    }

    /// Determines if the monitor has no active users.
    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }

    /// Gets the load of a user, if the user is active.
    pub fn load(&self, user: UserId) -> Option<Load> {
        self.loads.get(&user).copied()
    }

    /// Gets the cached minimum without recomputing it.
    ///
    /// This is `None` after the minimum holding user changed or was removed,
    /// even if other users remain.
    pub fn cached_min(&self) -> Option<Load> {
        self.min.map(|(_, load)| load)
    }

    /// Gets the minimum load among active users.
    ///
    /// Returns `None` only when there are no active users.
    pub fn min(&mut self) -> Option<Load> {
        if self.min.is_none() {
            self.min = self
                .loads
                .iter()
                .min_by_key(|(_, load)| **load)
                .map(|(user, load)| (*user, *load));
        }

        self.cached_min()
    }

    /// Adds a user with the given default load.
    ///
    /// The user starts at the current minimum plus the default, so a newly
    /// active user cannot jump ahead of users already waiting. Adding a user
    /// that is already active does nothing.
    pub fn add_user(&mut self, user: UserId, default: Load) {
        if self.loads.contains_key(&user) {
            return;
        }

        let base = self.min().unwrap_or(0);
        self.insert(user, base + default);
    }

    /// Removes a user entirely; their accumulated load is forgotten.
    pub fn remove_user(&mut self, user: UserId) {
        if self.loads.remove(&user).is_some() && self.holds_min(user) {
            self.min = None;
        }
    }

    /// Reconciles the active users to exactly the given set.
    ///
    /// Users not in the set are removed. Users already active keep their
    /// load. New users start at the minimum (taken once, after removals) plus
    /// their default.
    pub fn set_users(&mut self, defaults: &HashMap<UserId, Load>) {
        let removed: Vec<UserId> = self
            .loads
            .keys()
            .filter(|user| !defaults.contains_key(user))
            .copied()
            .collect();
        for user in removed {
            self.remove_user(user);
        }

        let base = self.min().unwrap_or(0);
        for (user, default) in defaults {
            if !self.loads.contains_key(user) {
                self.insert(*user, base + default);
            }
        }
    }

    /// Adds a delta to a user's load.
    ///
    /// Unknown users are ignored. A load that would drop below zero is
    /// clamped to zero.
    pub fn change_load(&mut self, user: UserId, delta: Load) {
        let Some(load) = self.loads.get_mut(&user) else {
            return;
        };

        *load += delta;
        if *load < 0 {
            warn!(user, load = *load, "user load dropped below zero; clamping");
            *load = 0;
        }

        let load = *load;
        match self.min {
            Some((holder, _)) if holder == user => self.min = None,
            Some((_, min)) if load < min => self.min = Some((user, load)),
            _ => {}
        }
    }

    /// Credits several users at once, subtracting each delta from the user's
    /// load.
    pub fn credit(&mut self, deltas: &HashMap<UserId, Load>) {
        for (user, delta) in deltas {
            self.change_load(*user, -delta);
        }
    }

    /// Determines if a user's pairs should be deferred.
    ///
    /// A user is skipped when their load exceeds the minimum by more than the
    /// threshold. Unknown users are never skipped.
    pub fn skip_user(&mut self, user: UserId) -> bool {
        let Some(load) = self.load(user) else {
            return false;
        };

        match self.min() {
            Some(min) => load - min > self.threshold,
            None => false,
        }
    }

    /// Removes every user.
    pub fn reset(&mut self) {
        self.loads.clear();
        self.min = None;
    }

    /// Inserts a new user, keeping a valid cached minimum valid.
    fn insert(&mut self, user: UserId, load: Load) {
        self.loads.insert(user, load);
        if let Some((_, min)) = self.min
            && load < min
        {
            self.min = Some((user, load));
        }
    }

    /// Determines if the given user holds the cached minimum.
    fn holds_min(&self, user: UserId) -> bool {
        matches!(self.min, Some((holder, _)) if holder == user)
    }
}

impl fmt::Display for FairShareLoadMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min = self.loads.values().min();
        match min {
            Some(min) => writeln!(f, "minimum = {min}")?,
            None => writeln!(f, "minimum = none")?,
        }

        let mut users: Vec<_> = self.loads.iter().collect();
        users.sort_by_key(|(user, load)| (**load, **user));
        for (user, load) in users {
            writeln!(f, "user {user}: load = {load}")?;
        }

        Ok(())
    }
}

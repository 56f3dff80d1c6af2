//! Principal id → display name resolution.
//!
//! Names are attached only when a summary is produced; aggregates always
//! carry numeric ids. Resolution goes through an injected [`PrincipalNames`]
//! so tests can substitute a deterministic table.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::ruletree::overlay::DirSummary;
use crate::ruletree::stats::PrincipalId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrincipalKind {
    User,
    Group,
}

/// Resolves user and group ids to names. Unknown ids resolve to their
/// decimal form.
pub trait PrincipalNames: Send + Sync {
    fn name(&self, kind: PrincipalKind, id: PrincipalId) -> String;
}

/// Host account database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNames;

impl PrincipalNames for SystemNames {
    #[cfg(unix)]
    fn name(&self, kind: PrincipalKind, id: PrincipalId) -> String {
        use nix::unistd::{Gid, Group, Uid, User};

        let found = match kind {
            PrincipalKind::User => User::from_uid(Uid::from_raw(id)).map(|user| user.map(|u| u.name)),
            PrincipalKind::Group => {
                Group::from_gid(Gid::from_raw(id)).map(|group| group.map(|g| g.name))
            }
        };
        match found {
            Ok(Some(name)) => name,
            Ok(None) => id.to_string(),
            Err(err) => {
                eprintln!("[BRT-NAMES] lookup of {kind:?} {id} failed: {err}");
                id.to_string()
            }
        }
    }

    #[cfg(not(unix))]
    fn name(&self, _kind: PrincipalKind, id: PrincipalId) -> String {
        id.to_string()
    }
}

/// Fixed table, for tests and offline tooling.
#[derive(Debug, Clone, Default)]
pub struct StaticNames {
    names: HashMap<(PrincipalKind, PrincipalId), String>,
}

impl StaticNames {
    #[must_use]
    pub fn with(mut self, kind: PrincipalKind, id: PrincipalId, name: &str) -> Self {
        self.names.insert((kind, id), name.to_string());
        self
    }
}

impl PrincipalNames for StaticNames {
    fn name(&self, kind: PrincipalKind, id: PrincipalId) -> String {
        self.names
            .get(&(kind, id))
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }
}

/// Time-bounded memo in front of another resolver.
#[derive(Debug)]
pub struct NameCache<R> {
    resolver: R,
    ttl: Duration,
    entries: Mutex<HashMap<(PrincipalKind, PrincipalId), (String, SystemTime)>>,
}

impl<R: PrincipalNames> NameCache<R> {
    #[must_use]
    pub fn new(resolver: R, ttl: Duration) -> Self {
        Self {
            resolver,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Resolve as of `now`, refreshing entries older than the TTL.
    pub fn name_at(&self, kind: PrincipalKind, id: PrincipalId, now: SystemTime) -> String {
        if let Some((name, fetched)) = self.entries.lock().get(&(kind, id))
            && is_fresh(*fetched, now, self.ttl)
        {
            return name.clone();
        }
        let name = self.resolver.name(kind, id);
        self.entries.lock().insert((kind, id), (name.clone(), now));
        name
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<R: PrincipalNames> PrincipalNames for NameCache<R> {
    fn name(&self, kind: PrincipalKind, id: PrincipalId) -> String {
        self.name_at(kind, id, SystemTime::now())
    }
}

fn is_fresh(fetched: SystemTime, now: SystemTime, ttl: Duration) -> bool {
    now.duration_since(fetched).unwrap_or(Duration::ZERO) <= ttl
}

/// Fill owner and per-principal display names throughout a summary.
pub fn label_summary(summary: &mut DirSummary, names: &dyn PrincipalNames) {
    summary.user = names.name(PrincipalKind::User, summary.uid);
    summary.group = names.name(PrincipalKind::Group, summary.gid);
    for rule in &mut summary.rules {
        for stats in &mut rule.users {
            stats.name = names.name(PrincipalKind::User, stats.id);
        }
        for stats in &mut rule.groups {
            stats.name = names.name(PrincipalKind::Group, stats.id);
        }
    }
    for child in summary.children.values_mut() {
        label_summary(child, names);
    }
}

//! Transformer contract and change-set accounting.
//!
//! A transformer is an opaque unit of mutation. The engine runs it
//! against a state snapshot, collects its commit message and change-set,
//! and never looks inside. Change-sets compose by union and carry the
//! commit-id pair bracketing the change.

use crate::clock;
use crate::object::ObjectId;
use crate::state::State;
use chrono::{DateTime, Utc};

/// The identity a request acts as; recorded as the commit author.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub name: String,
    pub email: String,
}

impl Actor {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Per-element context handed to every transformer of that element.
#[derive(Debug, Clone)]
pub struct TransformContext {
    /// Injected "now", pinned for the whole element.
    pub now: DateTime<Utc>,
    pub author: Actor,
}

impl TransformContext {
    pub fn new(clock: &dyn clock::Clock, author: Actor) -> Self {
        Self {
            now: clock.now(),
            author,
        }
    }
}

/// An atomic unit of mutation against a state snapshot.
///
/// Implementations stage writes through `state.fs` and/or inspect the
/// state; they must be deterministic given the same input tree.
pub trait Transformer: Send + Sync {
    fn transform(
        &self,
        ctx: &TransformContext,
        state: &State,
    ) -> crate::Result<(String, ChangeSet)>;
}

/// An `(application, environment)` pair whose manifests changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEnv {
    pub app: String,
    pub env: String,
}

/// An environment whose Argo root application file was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootApp {
    pub env: String,
}

/// The commit ids bracketing an applied change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitIds {
    /// `None` when the change created the initial commit.
    pub previous: Option<ObjectId>,
    pub current: ObjectId,
}

/// What a transformer batch touched.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changed_apps: Vec<AppEnv>,
    pub deleted_root_apps: Vec<RootApp>,
    pub commits: Option<CommitIds>,
}

impl ChangeSet {
    pub fn add_app_env(&mut self, app: impl Into<String>, env: impl Into<String>) {
        self.changed_apps.push(AppEnv {
            app: app.into(),
            env: env.into(),
        });
    }

    pub fn add_root_app(&mut self, env: impl Into<String>) {
        self.deleted_root_apps.push(RootApp { env: env.into() });
    }

    /// Union with another change-set. The first commit-id pair wins so a
    /// combined set brackets the whole batch.
    pub fn combine(&mut self, other: ChangeSet) {
        self.changed_apps.extend(other.changed_apps);
        self.deleted_root_apps.extend(other.deleted_root_apps);
        if self.commits.is_none() {
            self.commits = other.commits;
        }
    }

    pub fn combine_all(sets: impl IntoIterator<Item = ChangeSet>) -> ChangeSet {
        let mut result = ChangeSet::default();
        for set in sets {
            result.combine(set);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_set_union() {
        let mut a = ChangeSet::default();
        a.add_app_env("app1", "dev");
        let mut b = ChangeSet::default();
        b.add_app_env("app2", "prod");
        b.add_root_app("prod");
        b.commits = Some(CommitIds {
            previous: None,
            current: ObjectId::from([1u8; 32]),
        });

        a.combine(b);
        assert_eq!(a.changed_apps.len(), 2);
        assert_eq!(a.deleted_root_apps, vec![RootApp { env: "prod".into() }]);
        assert!(a.commits.is_some());
    }

    #[test]
    fn test_combine_keeps_first_commit_pair() {
        let first = CommitIds {
            previous: None,
            current: ObjectId::from([1u8; 32]),
        };
        let mut a = ChangeSet {
            commits: Some(first),
            ..Default::default()
        };
        let b = ChangeSet {
            commits: Some(CommitIds {
                previous: Some(ObjectId::from([1u8; 32])),
                current: ObjectId::from([2u8; 32]),
            }),
            ..Default::default()
        };
        a.combine(b);
        assert_eq!(a.commits.unwrap(), first);
    }
}

//! Request-scoped identity of the user on whose behalf an operation runs.
//!
//! The identity is carried in a tokio task-local so that work handed to the
//! task pool is still attributed to the user who asked for it. Code that runs
//! outside any scope observes the anonymous subject.

use serde::{Deserialize, Serialize};
use std::future::Future;

tokio::task_local! {
    static CURRENT_SUBJECT: Subject;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub user_id: String,
    pub user_name: String,
    pub anonymous: bool,
}

impl Subject {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            anonymous: false,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            user_id: "0000-00-0000".to_string(),
            user_name: "Anonymous".to_string(),
            anonymous: true,
        }
    }

    /// The subject of the current task, or the anonymous subject.
    pub fn current() -> Subject {
        CURRENT_SUBJECT
            .try_with(Clone::clone)
            .unwrap_or_else(|_| Subject::anonymous())
    }

    /// User name for audit logs, `fallback` when nobody is signed in.
    pub fn current_name_or(fallback: &str) -> String {
        let subject = Subject::current();
        if subject.anonymous {
            fallback.to_string()
        } else {
            subject.user_name
        }
    }

    /// Runs `fut` with `self` as the current subject.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_SUBJECT.scope(self, fut).await
    }

    /// Runs a blocking closure with `self` as the current subject.
    pub fn sync_scope<F, R>(self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        CURRENT_SUBJECT.sync_scope(self, f)
    }
}

impl Default for Subject {
    fn default() -> Self {
        Subject::anonymous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_outside_scope_is_anonymous() {
        let subject = Subject::current();
        assert!(subject.anonymous);
        assert_eq!(Subject::current_name_or("undefined"), "undefined");
    }

    #[tokio::test]
    async fn test_scope_sets_current_subject() {
        let alice = Subject::new("u-1", "alice");
        let seen = alice
            .clone()
            .scope(async { Subject::current() })
            .await;
        assert_eq!(seen, alice);
        assert!(Subject::current().anonymous);
    }

    #[test]
    fn test_sync_scope() {
        let bob = Subject::new("u-2", "bob");
        let name = bob.sync_scope(|| Subject::current_name_or("undefined"));
        assert_eq!(name, "bob");
    }
}

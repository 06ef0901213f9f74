//! Find-or-create by natural key
//!
//! Git hooks fire on every commit and checkout, usually with a username and
//! project name the store has already seen. Resolution is a lookup followed,
//! only on a miss, by a guarded insert: the UNIQUE constraints on
//! `users.username` and `projects(name, owner)` reject a second row, and the
//! loser of a race refetches the winner's row.

use crate::db::{Database, DbError, NewProject, Project, Result, User};

impl Database {
    /// Return the user named `username`, creating it if absent
    pub fn resolve_user(&self, username: &str) -> Result<User> {
        if let Some(user) = self.find_user_by_username(username)? {
            return Ok(user);
        }

        match self.create_user(username) {
            Ok(user) => {
                tracing::debug!(id = user.id, username = %user.username, "created user");
                Ok(user)
            }
            Err(DbError::Conflict(_)) => {
                tracing::debug!(username, "lost user insert race, refetching");
                self.find_user_by_username(username)?.ok_or_else(|| {
                    DbError::Conflict(format!("user '{}' vanished after conflict", username.trim()))
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Return the project `name` owned by `owner_id`, creating it if absent
    ///
    /// Auto-created projects carry no description.
    pub fn resolve_project(&self, name: &str, owner_id: Option<i32>) -> Result<Project> {
        if let Some(project) = self.find_project(name, owner_id)? {
            return Ok(project);
        }

        let new_project = NewProject {
            name: name.to_string(),
            description: None,
            owner_id,
        };
        match self.create_project(&new_project) {
            Ok(project) => {
                tracing::debug!(id = project.id, name = %project.name, "created project");
                Ok(project)
            }
            Err(DbError::Conflict(_)) => {
                tracing::debug!(name, ?owner_id, "lost project insert race, refetching");
                self.find_project(name, owner_id)?.ok_or_else(|| {
                    DbError::Conflict(format!("project '{}' vanished after conflict", name.trim()))
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{Database, DbError, NewProject, ProjectFilter};
    use crate::types::Page;

    #[test]
    fn test_resolve_user_creates_once() {
        let db = Database::in_memory().unwrap();
        let first = db.resolve_user("alice").unwrap();
        let second = db.resolve_user("alice").unwrap();
        let padded = db.resolve_user("  alice ").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, padded);
        assert_eq!(db.list_users(Page::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_user_finds_existing() {
        let db = Database::in_memory().unwrap();
        let created = db.create_user("bob").unwrap();
        assert_eq!(db.resolve_user("bob").unwrap().id, created.id);
    }

    #[test]
    fn test_resolve_user_rejects_blank() {
        let db = Database::in_memory().unwrap();
        assert!(matches!(db.resolve_user(""), Err(DbError::Validation(_))));
    }

    #[test]
    fn test_resolve_project_keyed_on_name_and_owner() {
        let db = Database::in_memory().unwrap();
        let alice = db.resolve_user("alice").unwrap();
        let bob = db.resolve_user("bob").unwrap();

        let a1 = db.resolve_project("repo", Some(alice.id)).unwrap();
        let a2 = db.resolve_project("repo", Some(alice.id)).unwrap();
        let b1 = db.resolve_project("repo", Some(bob.id)).unwrap();
        let orphan1 = db.resolve_project("repo", None).unwrap();
        let orphan2 = db.resolve_project("repo", None).unwrap();

        assert_eq!(a1, a2);
        assert_eq!(orphan1, orphan2);
        assert_ne!(a1.id, b1.id);
        assert_ne!(a1.id, orphan1.id);
        assert_eq!(a1.description, None);
        assert_eq!(
            db.list_projects(&ProjectFilter::default(), Page::default()).unwrap().len(),
            3
        );
    }

    #[test]
    fn test_resolve_project_reuses_manual_project() {
        let db = Database::in_memory().unwrap();
        let owner = db.create_user("carol").unwrap();
        let manual = db
            .create_project(&NewProject {
                name: "site".into(),
                description: Some("hand made".into()),
                owner_id: Some(owner.id),
            })
            .unwrap();
        let resolved = db.resolve_project("site", Some(owner.id)).unwrap();
        assert_eq!(resolved, manual);
    }

    #[test]
    fn test_resolve_project_unknown_owner() {
        let db = Database::in_memory().unwrap();
        assert!(matches!(
            db.resolve_project("repo", Some(12)),
            Err(DbError::NotFound { entity: "User", id: 12 })
        ));
    }
}

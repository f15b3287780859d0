//! User repository
//!
//! Users are not registered here; they arrive as an identity context from
//! whatever authenticated the session and are upserted on first sight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::{Error, Result};

/// Identity of the person talking to the assistant
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Identity {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Identity {
    /// Identity with only an id
    #[must_use]
    pub fn anonymous(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            email: None,
        }
    }
}

/// A stored user
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Identity view of this user
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// User repository
#[derive(Clone)]
pub struct UserRepo {
    pool: DbPool,
}

impl UserRepo {
    /// Create a new user repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert the user or refresh its name and email
    ///
    /// Missing name/email in the identity keep the stored values.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert(&self, identity: &Identity) -> Result<User> {
        if identity.id.trim().is_empty() {
            return Err(Error::InvalidInput("user id is empty".to_string()));
        }

        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO users (id, name, email, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = COALESCE(excluded.name, users.name),
                email = COALESCE(excluded.email, users.email),
                updated_at = excluded.updated_at",
            rusqlite::params![identity.id, identity.name, identity.email, now],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        drop(conn);
        self.find(&identity.id)?
            .ok_or_else(|| Error::NotFound(format!("user {}", identity.id)))
    }

    /// Find a user by ID (returns None if not found)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: &str) -> Result<Option<User>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let user = conn
            .query_row(
                "SELECT id, name, email, created_at, updated_at FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        email: row.get(2)?,
                        created_at: parse_datetime(&row.get::<_, String>(3)?),
                        updated_at: parse_datetime(&row.get::<_, String>(4)?),
                    })
                },
            )
            .ok();

        Ok(user)
    }
}

pub(super) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[test]
    fn test_upsert_creates_user() {
        let repo = UserRepo::new(init_memory().unwrap());
        let user = repo
            .upsert(&Identity {
                id: "u1".to_string(),
                name: Some("Ayşe".to_string()),
                email: Some("ayse@example.com".to_string()),
            })
            .unwrap();

        assert_eq!(user.id, "u1");
        assert_eq!(user.name.as_deref(), Some("Ayşe"));
    }

    #[test]
    fn test_upsert_keeps_known_fields() {
        let repo = UserRepo::new(init_memory().unwrap());
        repo.upsert(&Identity {
            id: "u1".to_string(),
            name: Some("Ayşe".to_string()),
            email: None,
        })
        .unwrap();

        let user = repo
            .upsert(&Identity {
                id: "u1".to_string(),
                name: None,
                email: Some("ayse@example.com".to_string()),
            })
            .unwrap();

        assert_eq!(user.name.as_deref(), Some("Ayşe"));
        assert_eq!(user.email.as_deref(), Some("ayse@example.com"));
    }

    #[test]
    fn test_empty_id_rejected() {
        let repo = UserRepo::new(init_memory().unwrap());
        let err = repo.upsert(&Identity::anonymous("  ")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_find_missing_user() {
        let repo = UserRepo::new(init_memory().unwrap());
        assert!(repo.find("nobody").unwrap().is_none());
    }
}

//! Conversation history store
//!
//! Turns are append-only; a persisted turn is never rewritten. Every
//! operation is scoped to a user id, and a conversation id belonging to
//! another user behaves exactly like a missing one.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DbPool;
use super::user::parse_datetime;
use crate::{Error, Result};

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    /// Storage and API representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
        }
    }

    /// Parse either the stored (`USER`) or chat (`user`) spelling
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("user") {
            Some(Self::User)
        } else if s.eq_ignore_ascii_case("assistant") {
            Some(Self::Assistant)
        } else {
            None
        }
    }
}

/// One persisted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub id: String,
    pub role: TurnRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation with its turns, oldest first
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub turns: Vec<ConversationTurn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Narrow persistence interface consumed by the pipeline
pub trait ConversationStore: Send + Sync {
    /// Most recently updated conversation of the user, created if none exists
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    fn fetch_current(&self, user_id: &str) -> Result<Conversation>;

    /// Append a turn, creating a conversation when `conversation_id` is `None`
    ///
    /// Returns the id of the conversation the turn was written to.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an id the user does not own, `InvalidInput` for
    /// empty content
    fn append(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        role: TurnRole,
        content: &str,
    ) -> Result<String>;

    /// Delete one conversation, or every conversation of the user
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    fn clear(&self, user_id: &str, conversation_id: Option<&str>) -> Result<()>;
}

/// `SQLite`-backed conversation repository
#[derive(Clone)]
pub struct ConversationRepo {
    pool: DbPool,
}

impl ConversationRepo {
    /// Create a new conversation repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Load a specific conversation owned by the user
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the conversation does not exist for this user
    pub fn get(&self, user_id: &str, conversation_id: &str) -> Result<Conversation> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        load(&conn, user_id, conversation_id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))
    }

    /// Number of conversations stored for a user
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count(&self, user_id: &str) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversations WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }
}

impl ConversationStore for ConversationRepo {
    fn fetch_current(&self, user_id: &str) -> Result<Conversation> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let latest: Option<String> = conn
            .query_row(
                "SELECT id FROM conversations WHERE user_id = ?1
                 ORDER BY touched DESC, updated_at DESC LIMIT 1",
                [user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = match latest {
            Some(id) => id,
            None => create(&conn, user_id)?,
        };

        load(&conn, user_id, &id)?.ok_or_else(|| Error::NotFound(format!("conversation {id}")))
    }

    fn append(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        role: TurnRole,
        content: &str,
    ) -> Result<String> {
        if content.trim().is_empty() {
            return Err(Error::InvalidInput("message content is empty".to_string()));
        }

        let mut conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        let conversation_id = match conversation_id {
            Some(id) => {
                if !owns(&tx, user_id, id)? {
                    return Err(Error::NotFound(format!("conversation {id}")));
                }
                id.to_string()
            }
            None => create(&tx, user_id)?,
        };

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                conversation_id,
                role.as_str(),
                content,
                now
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        touch(&tx, &conversation_id, &now)?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        tracing::debug!(
            conversation_id = %conversation_id,
            role = role.as_str(),
            chars = content.chars().count(),
            "turn appended"
        );
        Ok(conversation_id)
    }

    fn clear(&self, user_id: &str, conversation_id: Option<&str>) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let deleted = match conversation_id {
            Some(id) => conn.execute(
                "DELETE FROM conversations WHERE id = ?1 AND user_id = ?2",
                [id, user_id],
            ),
            None => conn.execute("DELETE FROM conversations WHERE user_id = ?1", [user_id]),
        }
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::info!(user_id, deleted, "conversation history cleared");
        Ok(())
    }
}

fn ensure_user(conn: &Connection, user_id: &str) -> Result<()> {
    conn.execute("INSERT OR IGNORE INTO users (id) VALUES (?1)", [user_id])
        .map_err(|e| Error::Database(e.to_string()))?;
    Ok(())
}

fn create(conn: &Connection, user_id: &str) -> Result<String> {
    ensure_user(conn, user_id)?;

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO conversations (id, user_id, created_at, updated_at, touched)
         VALUES (?1, ?2, ?3, ?3, (SELECT COALESCE(MAX(touched), 0) + 1 FROM conversations))",
        [&id, user_id, &now],
    )
    .map_err(|e| Error::Database(e.to_string()))?;

    tracing::debug!(conversation_id = %id, user_id, "conversation created");
    Ok(id)
}

fn touch(conn: &Connection, conversation_id: &str, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations
         SET updated_at = ?1, touched = (SELECT COALESCE(MAX(touched), 0) + 1 FROM conversations)
         WHERE id = ?2",
        [now, conversation_id],
    )
    .map_err(|e| Error::Database(e.to_string()))?;
    Ok(())
}

fn owns(conn: &Connection, user_id: &str, conversation_id: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM conversations WHERE id = ?1 AND user_id = ?2",
        [conversation_id, user_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| Error::Database(e.to_string()))
}

fn load(conn: &Connection, user_id: &str, conversation_id: &str) -> Result<Option<Conversation>> {
    let header = conn
        .query_row(
            "SELECT id, user_id, created_at, updated_at FROM conversations
             WHERE id = ?1 AND user_id = ?2",
            [conversation_id, user_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|e| Error::Database(e.to_string()))?;

    let Some((id, user_id, created_at, updated_at)) = header else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, role, content, created_at FROM messages
             WHERE conversation_id = ?1 ORDER BY seq ASC",
        )
        .map_err(|e| Error::Database(e.to_string()))?;

    let turns = stmt
        .query_map([&id], |row| {
            Ok(ConversationTurn {
                id: row.get(0)?,
                role: TurnRole::parse(&row.get::<_, String>(1)?).unwrap_or(TurnRole::User),
                text: row.get(2)?,
                created_at: parse_datetime(&row.get::<_, String>(3)?),
            })
        })
        .map_err(|e| Error::Database(e.to_string()))?
        .filter_map(std::result::Result::ok)
        .collect();

    Ok(Some(Conversation {
        id,
        user_id,
        turns,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> ConversationRepo {
        ConversationRepo::new(init_memory().unwrap())
    }

    #[test]
    fn test_fetch_current_creates_empty_conversation() {
        let repo = setup();

        let conversation = repo.fetch_current("u1").unwrap();
        assert!(conversation.turns.is_empty());

        // Same conversation on the next fetch
        let again = repo.fetch_current("u1").unwrap();
        assert_eq!(conversation.id, again.id);
        assert_eq!(repo.count("u1").unwrap(), 1);
    }

    #[test]
    fn test_append_and_fetch_in_order() {
        let repo = setup();

        let id = repo
            .append("u1", None, TurnRole::User, "Merhaba")
            .unwrap();
        repo.append("u1", Some(&id), TurnRole::Assistant, "Merhaba! Size nasıl yardımcı olabilirim?")
            .unwrap();

        let conversation = repo.fetch_current("u1").unwrap();
        assert_eq!(conversation.id, id);
        assert_eq!(conversation.turns.len(), 2);
        assert_eq!(conversation.turns[0].role, TurnRole::User);
        assert_eq!(conversation.turns[0].text, "Merhaba");
        assert_eq!(conversation.turns[1].role, TurnRole::Assistant);
    }

    #[test]
    fn test_current_is_most_recently_updated() {
        let repo = setup();

        let first = repo.append("u1", None, TurnRole::User, "one").unwrap();
        let second = repo.append("u1", None, TurnRole::User, "two").unwrap();
        assert_eq!(repo.fetch_current("u1").unwrap().id, second);

        repo.append("u1", Some(&first), TurnRole::User, "three")
            .unwrap();
        assert_eq!(repo.fetch_current("u1").unwrap().id, first);
    }

    #[test]
    fn test_foreign_conversation_is_not_found() {
        let repo = setup();

        let id = repo.append("u1", None, TurnRole::User, "secret").unwrap();
        let err = repo
            .append("u2", Some(&id), TurnRole::User, "intrude")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(matches!(repo.get("u2", &id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_empty_content_rejected() {
        let repo = setup();
        let err = repo.append("u1", None, TurnRole::User, "   ").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_clear_single_and_all() {
        let repo = setup();

        let a = repo.append("u1", None, TurnRole::User, "a").unwrap();
        let b = repo.append("u1", None, TurnRole::User, "b").unwrap();
        repo.append("u2", None, TurnRole::User, "other user").unwrap();

        repo.clear("u1", Some(&a)).unwrap();
        assert!(repo.get("u1", &a).is_err());
        assert!(repo.get("u1", &b).is_ok());

        repo.clear("u1", None).unwrap();
        assert_eq!(repo.count("u1").unwrap(), 0);
        assert_eq!(repo.count("u2").unwrap(), 1);
    }

    #[test]
    fn test_clear_cascades_messages() {
        let repo = setup();
        let id = repo.append("u1", None, TurnRole::User, "a").unwrap();
        repo.clear("u1", Some(&id)).unwrap();

        let conn = repo.pool.get().unwrap();
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(TurnRole::parse("USER"), Some(TurnRole::User));
        assert_eq!(TurnRole::parse("assistant"), Some(TurnRole::Assistant));
        assert_eq!(TurnRole::parse("system"), None);
    }
}

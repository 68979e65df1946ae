use crate::Database;
use crate::models::{MessageRow, ReadRow, UserRow};
use anyhow::Result;
use rusqlite::Connection;
use uuid::Uuid;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    /// All users except the given one, for the conversation sidebar.
    pub fn list_users_excluding(&self, user_id: &str) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, password, created_at FROM users
                 WHERE id != ?1 ORDER BY username",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        sender_id: &str,
        receiver_id: &str,
        text: Option<&str>,
        image_url: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, text, image_url, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'sent', ?6)",
                rusqlite::params![id, sender_id, receiver_id, text, image_url, created_at],
            )?;
            Ok(())
        })
    }

    /// Both directions of the conversation between two users, oldest first.
    pub fn get_conversation(&self, user_a: &str, user_b: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, text, image_url, status, created_at
                 FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([user_a, user_b], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        sender_id: row.get(1)?,
                        receiver_id: row.get(2)?,
                        text: row.get(3)?,
                        image_url: row.get(4)?,
                        status: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Batch-fetch receipt rows for a set of message IDs.
    pub fn get_reads_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReadRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id, read_at FROM message_reads
                 WHERE message_id IN ({}) ORDER BY read_at",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReadRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        read_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Delivery state --

    /// Fine-grained mark-read: append a receipt for the viewer to every
    /// message from `sender_id` the viewer has not yet read, and flip those
    /// messages to 'read'. Returns the number of messages changed — zero on
    /// re-application, which makes the operation idempotent.
    pub fn mark_read(&self, sender_id: &str, viewer_id: &str, read_at: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let pending: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT m.id FROM messages m
                     WHERE m.sender_id = ?1 AND m.receiver_id = ?2
                       AND NOT EXISTS (
                           SELECT 1 FROM message_reads r
                           WHERE r.message_id = m.id AND r.user_id = ?2
                       )
                     ORDER BY m.created_at",
                )?;
                stmt.query_map([sender_id, viewer_id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            for message_id in &pending {
                tx.execute(
                    "INSERT INTO message_reads (id, message_id, user_id, read_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        Uuid::new_v4().to_string(),
                        message_id,
                        viewer_id,
                        read_at
                    ],
                )?;
                tx.execute(
                    "UPDATE messages SET status = 'read' WHERE id = ?1",
                    [message_id],
                )?;
            }

            tx.commit()?;
            Ok(pending.len())
        })
    }

    /// Coarse conversation-level read: flip every non-read message of the
    /// directional pair to 'read', ignoring per-reader receipt tracking.
    /// Returns the number of rows changed; reapplying is a no-op.
    pub fn mark_conversation_read(&self, sender_id: &str, receiver_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'read'
                 WHERE sender_id = ?1 AND receiver_id = ?2 AND status != 'read'",
                [sender_id, receiver_id],
            )?;
            Ok(changed)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    // `column` is one of two fixed names, never caller input.
    let sql = format!(
        "SELECT id, username, password, created_at FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

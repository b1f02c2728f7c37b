use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::models::{Message, MessageDetail, Profile, ReadReceipt};
use chrono::Utc;
use sqlx::Row;

#[derive(Clone)]
pub struct MessageStore {
    pool: DbPool,
}

impl MessageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Fails with `NotFound` when either username is unknown.
    pub async fn create(&self, from_username: &str, to_username: &str, body: &str) -> AppResult<Message> {
        let message = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (from_username, to_username, body, sent_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, from_username, to_username, body, sent_at, read_at
            "#,
        )
        .bind(from_username)
        .bind(to_username)
        .bind(body)
        .bind(Utc::now())
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(|e| {
            if e.as_database_error().is_some_and(|db| db.is_foreign_key_violation()) {
                AppError::NotFound("User".to_string())
            } else {
                AppError::Database(e)
            }
        })?;

        tracing::debug!(id = message.id, from_username, to_username, "message created");
        Ok(message)
    }

    pub async fn get(&self, id: i64) -> AppResult<MessageDetail> {
        let row = sqlx::query(
            r#"
            SELECT
                m.id,
                m.body,
                m.sent_at,
                m.read_at,
                f.username AS from_username,
                f.first_name AS from_first_name,
                f.last_name AS from_last_name,
                f.phone AS from_phone,
                t.username AS to_username,
                t.first_name AS to_first_name,
                t.last_name AS to_last_name,
                t.phone AS to_phone
            FROM messages m
            JOIN users f ON m.from_username = f.username
            JOIN users t ON m.to_username = t.username
            WHERE m.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?
        .ok_or_else(|| AppError::NotFound("Message".to_string()))?;

        Ok(MessageDetail {
            id: row.try_get("id")?,
            body: row.try_get("body")?,
            sent_at: row.try_get("sent_at")?,
            read_at: row.try_get("read_at")?,
            from_user: Profile {
                username: row.try_get("from_username")?,
                first_name: row.try_get("from_first_name")?,
                last_name: row.try_get("from_last_name")?,
                phone: row.try_get("from_phone")?,
            },
            to_user: Profile {
                username: row.try_get("to_username")?,
                first_name: row.try_get("to_first_name")?,
                last_name: row.try_get("to_last_name")?,
                phone: row.try_get("to_phone")?,
            },
        })
    }

    /// Stamps `read_at` the first time only; later calls return the
    /// original stamp.
    pub async fn mark_read(&self, id: i64) -> AppResult<ReadReceipt> {
        let receipt = sqlx::query_as::<_, ReadReceipt>(
            r#"
            UPDATE messages
            SET read_at = COALESCE(read_at, ?)
            WHERE id = ?
            RETURNING id, read_at
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?
        .ok_or_else(|| AppError::NotFound("Message".to_string()))?;

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;
    use crate::users::UserStore;

    async fn seeded() -> MessageStore {
        let pool = init_memory_db().await.unwrap();
        let users = UserStore::new(pool.clone(), 4);
        users.register("alice", "pw", "Alice", "Anders", "111").await.unwrap();
        users.register("bob", "pw", "Bob", "Berg", "222").await.unwrap();
        MessageStore::new(pool)
    }

    #[tokio::test]
    async fn create_starts_unread() {
        let messages = seeded().await;
        let before = Utc::now();
        let message = messages.create("alice", "bob", "hello").await.unwrap();

        assert_eq!(message.from_username, "alice");
        assert_eq!(message.to_username, "bob");
        assert_eq!(message.body, "hello");
        assert!(message.sent_at >= before);
        assert!(message.read_at.is_none());
    }

    #[tokio::test]
    async fn create_with_unknown_user_is_not_found() {
        let messages = seeded().await;
        assert!(matches!(
            messages.create("alice", "ghost", "hello").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            messages.create("ghost", "bob", "hello").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_embeds_both_profiles() {
        let messages = seeded().await;
        let created = messages.create("alice", "bob", "hello").await.unwrap();

        let detail = messages.get(created.id).await.unwrap();
        assert_eq!(detail.id, created.id);
        assert_eq!(detail.body, "hello");
        assert_eq!(detail.sent_at, created.sent_at);
        assert_eq!(detail.from_user.first_name, "Alice");
        assert_eq!(detail.to_user.last_name, "Berg");
    }

    #[tokio::test]
    async fn get_unknown_id_is_not_found() {
        let messages = seeded().await;
        assert!(matches!(messages.get(999).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn mark_read_keeps_first_stamp() {
        let messages = seeded().await;
        let created = messages.create("alice", "bob", "hello").await.unwrap();

        let first = messages.mark_read(created.id).await.unwrap();
        assert_eq!(first.id, created.id);
        assert!(first.read_at <= Utc::now());

        let detail = messages.get(created.id).await.unwrap();
        assert_eq!(detail.read_at, Some(first.read_at));

        let second = messages.mark_read(created.id).await.unwrap();
        assert_eq!(second.read_at, first.read_at);
    }

    #[tokio::test]
    async fn mark_read_unknown_id_is_not_found() {
        let messages = seeded().await;
        assert!(matches!(
            messages.mark_read(42).await,
            Err(AppError::NotFound(_))
        ));
    }
}

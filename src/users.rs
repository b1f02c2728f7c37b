use crate::auth::{hash_password, verify_password};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::models::{Profile, ReceivedMessage, SentMessage, User, UserDetail};
use chrono::Utc;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Data access for the `users` table.
#[derive(Clone)]
pub struct UserStore {
    pool: DbPool,
    work_factor: u32,
    // Verified against for unknown usernames so both paths cost one bcrypt check.
    dummy_hash: Arc<OnceCell<String>>,
}

impl UserStore {
    pub fn new(pool: DbPool, work_factor: u32) -> Self {
        Self {
            pool,
            work_factor,
            dummy_hash: Arc::new(OnceCell::new()),
        }
    }

    /// Hashes the password and inserts the user. `join_at` and
    /// `last_login_at` both start at creation time.
    ///
    /// The returned record holds the hash; callers must not expose it.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        first_name: &str,
        last_name: &str,
        phone: &str,
    ) -> AppResult<User> {
        let password_hash = hash_password(password, self.work_factor).await?;
        let now = Utc::now();

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, password, first_name, last_name, phone, join_at, last_login_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING username, password, first_name, last_name, phone, join_at, last_login_at
            "#,
        )
        .bind(username)
        .bind(&password_hash)
        .bind(first_name)
        .bind(last_name)
        .bind(phone)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(|e| {
            if e.as_database_error().is_some_and(|db| db.is_unique_violation()) {
                AppError::Conflict(format!("Could not register {}", username))
            } else {
                AppError::Database(e)
            }
        })?;

        tracing::info!(username, "registered user");
        Ok(user)
    }

    /// True only when the user exists and the password matches its hash.
    /// An unknown username is a plain `false`.
    pub async fn authenticate(&self, username: &str, password: &str) -> AppResult<bool> {
        let stored: Option<String> = sqlx::query_scalar("SELECT password FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(self.pool.as_ref())
            .await?;

        match stored {
            Some(hash) => verify_password(password, &hash).await,
            None => {
                let dummy = self
                    .dummy_hash
                    .get_or_try_init(|| hash_password("unknown-user", self.work_factor))
                    .await?;
                verify_password(password, dummy).await?;
                Ok(false)
            }
        }
    }

    pub async fn update_login_timestamp(&self, username: &str) -> AppResult<()> {
        let result = sqlx::query("UPDATE users SET last_login_at = ? WHERE username = ?")
            .bind(Utc::now())
            .bind(username)
            .execute(self.pool.as_ref())
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("User".to_string()));
        }
        Ok(())
    }

    /// All users, by username.
    pub async fn all(&self) -> AppResult<Vec<UserDetail>> {
        let users = sqlx::query_as::<_, UserDetail>(
            r#"
            SELECT username, first_name, last_name, phone, join_at, last_login_at
            FROM users
            ORDER BY username
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(users)
    }

    pub async fn get(&self, username: &str) -> AppResult<UserDetail> {
        sqlx::query_as::<_, UserDetail>(
            r#"
            SELECT username, first_name, last_name, phone, join_at, last_login_at
            FROM users
            WHERE username = ?
            "#,
        )
        .bind(username)
        .fetch_optional(self.pool.as_ref())
        .await?
        .ok_or_else(|| AppError::NotFound("User".to_string()))
    }

    /// Messages sent by `username`, oldest first, each with its recipient.
    pub async fn messages_from(&self, username: &str) -> AppResult<Vec<SentMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.body, m.sent_at, m.read_at,
                   u.username, u.first_name, u.last_name, u.phone
            FROM messages m
            JOIN users u ON m.to_username = u.username
            WHERE m.from_username = ?
            ORDER BY m.sent_at, m.id
            "#,
        )
        .bind(username)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.iter()
            .map(|row| -> AppResult<SentMessage> {
                Ok(SentMessage {
                    id: row.try_get("id")?,
                    body: row.try_get("body")?,
                    sent_at: row.try_get("sent_at")?,
                    read_at: row.try_get("read_at")?,
                    to_user: profile_from_row(row)?,
                })
            })
            .collect()
    }

    /// Messages received by `username`, oldest first, each with its sender.
    pub async fn messages_to(&self, username: &str) -> AppResult<Vec<ReceivedMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.body, m.sent_at, m.read_at,
                   u.username, u.first_name, u.last_name, u.phone
            FROM messages m
            JOIN users u ON m.from_username = u.username
            WHERE m.to_username = ?
            ORDER BY m.sent_at, m.id
            "#,
        )
        .bind(username)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.iter()
            .map(|row| -> AppResult<ReceivedMessage> {
                Ok(ReceivedMessage {
                    id: row.try_get("id")?,
                    body: row.try_get("body")?,
                    sent_at: row.try_get("sent_at")?,
                    read_at: row.try_get("read_at")?,
                    from_user: profile_from_row(row)?,
                })
            })
            .collect()
    }
}

fn profile_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Profile, sqlx::Error> {
    Ok(Profile {
        username: row.try_get("username")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        phone: row.try_get("phone")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;
    use crate::messages::MessageStore;

    async fn stores() -> (UserStore, MessageStore) {
        let pool = init_memory_db().await.unwrap();
        (UserStore::new(pool.clone(), 4), MessageStore::new(pool))
    }

    async fn register(users: &UserStore, username: &str) -> User {
        users
            .register(username, "secret", "First", "Last", "555-0100")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_hashes_password() {
        let (users, _) = stores().await;
        let user = register(&users, "alice").await;

        assert_eq!(user.username, "alice");
        assert_ne!(user.password, "secret");
        assert!(user.password.starts_with("$2"));
        assert_eq!(user.join_at, user.last_login_at);

        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password").is_none());
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let (users, _) = stores().await;
        register(&users, "alice").await;

        let err = users
            .register("alice", "other", "A", "B", "1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(!err.to_string().contains("UNIQUE"));
    }

    #[tokio::test]
    async fn authenticate_checks_password() {
        let (users, _) = stores().await;
        register(&users, "alice").await;

        assert!(users.authenticate("alice", "secret").await.unwrap());
        assert!(!users.authenticate("alice", "wrong").await.unwrap());
        assert!(!users.authenticate("nobody", "secret").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_user_still_costs_a_hash_check() {
        let (users, _) = stores().await;
        assert!(users.dummy_hash.get().is_none());

        assert!(!users.authenticate("nobody", "unknown-user").await.unwrap());
        let dummy = users.dummy_hash.get().cloned().unwrap();
        assert!(dummy.starts_with("$2"));

        // Reused across calls.
        assert!(!users.authenticate("someone", "pw").await.unwrap());
        assert_eq!(users.dummy_hash.get(), Some(&dummy));
    }

    #[tokio::test]
    async fn login_timestamp_moves_forward() {
        let (users, _) = stores().await;
        let created = register(&users, "alice").await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        users.update_login_timestamp("alice").await.unwrap();
        let after = users.get("alice").await.unwrap();
        assert!(after.last_login_at > created.last_login_at);
        assert_eq!(after.join_at, created.join_at);

        assert!(matches!(
            users.update_login_timestamp("nobody").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn all_is_sorted_by_username() {
        let (users, _) = stores().await;
        for name in ["carol", "alice", "bob"] {
            register(&users, name).await;
        }

        let names: Vec<String> = users
            .all()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);

        let json = serde_json::to_value(users.all().await.unwrap()).unwrap();
        assert!(json[0].get("password").is_none());
    }

    #[tokio::test]
    async fn get_unknown_user_is_not_found() {
        let (users, _) = stores().await;
        assert!(matches!(users.get("ghost").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn messages_from_and_to_are_split_by_direction() {
        let (users, messages) = stores().await;
        register(&users, "alice").await;
        register(&users, "bob").await;

        let first = messages.create("alice", "bob", "hi bob").await.unwrap();
        let second = messages.create("alice", "bob", "still there?").await.unwrap();
        let reply = messages.create("bob", "alice", "yes").await.unwrap();

        let sent = users.messages_from("alice").await.unwrap();
        assert_eq!(
            sent.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
        assert!(sent.iter().all(|m| m.to_user.username == "bob"));
        assert_eq!(sent[0].to_user.first_name, "First");

        let received = users.messages_to("alice").await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, reply.id);
        assert_eq!(received[0].from_user.username, "bob");

        assert!(received.iter().all(|r| sent.iter().all(|s| s.id != r.id)));
    }

    #[tokio::test]
    async fn user_without_messages_has_empty_lists() {
        let (users, _) = stores().await;
        register(&users, "alice").await;
        assert!(users.messages_from("alice").await.unwrap().is_empty());
        assert!(users.messages_to("alice").await.unwrap().is_empty());
    }
}

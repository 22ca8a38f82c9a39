/// PostgreSQL storage backed by a `sqlx` pool.
///
/// Schema lives in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::{Store, UnitOfWork};
use crate::domain::{NewUser, RefreshTokenRecord, User};
use crate::error::DatabaseError;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// A unit of work over one database transaction
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Store for PgStore {
    type UnitOfWork = PgUnitOfWork;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, name, email, username, password FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, name, email, username, password FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_refresh_token(
        &self,
        fingerprint: &str,
        user_id: i64,
    ) -> Result<Option<RefreshTokenRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, RefreshTokenRecord>(
            r#"
            SELECT id, user_id, token_hash AS fingerprint, expires_at
            FROM refresh_tokens
            WHERE token_hash = $1 AND user_id = $2
            "#,
        )
        .bind(fingerprint)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn begin(&self) -> Result<Self::UnitOfWork, DatabaseError> {
        let tx = self.pool.begin().await?;
        Ok(PgUnitOfWork { tx })
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn insert_user(&mut self, user: &NewUser) -> Result<i64, DatabaseError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO users (name, email, username, password)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.password)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn insert_refresh_token(
        &mut self,
        user_id: i64,
        fingerprint: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO refresh_tokens (user_id, token_hash, expires_at)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(fingerprint)
        .bind(expires_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id)
    }

    /// A concurrent transaction deleting the same row makes this one wait
    /// for it and then report zero rows.
    async fn delete_refresh_token_by_id(&mut self, id: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_refresh_token_by_fingerprint(
        &mut self,
        fingerprint: &str,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = $1")
            .bind(fingerprint)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn commit(self) -> Result<(), DatabaseError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), DatabaseError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Storage contracts consumed by the session protocol.
///
/// Reads go straight through the [`Store`]. Every mutation goes through a
/// [`UnitOfWork`] obtained from [`Store::begin`], which ends in exactly one of
/// `commit` or `rollback`. Dropping a unit of work without committing rolls
/// it back.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{NewUser, RefreshTokenRecord, User};
use crate::error::DatabaseError;

pub use memory::{InMemoryStore, InMemoryUnitOfWork};
pub use postgres::{PgStore, PgUnitOfWork};

#[async_trait]
pub trait Store: Send + Sync + 'static {
    type UnitOfWork: UnitOfWork;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError>;

    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>, DatabaseError>;

    async fn find_refresh_token(
        &self,
        fingerprint: &str,
        user_id: i64,
    ) -> Result<Option<RefreshTokenRecord>, DatabaseError>;

    async fn begin(&self) -> Result<Self::UnitOfWork, DatabaseError>;
}

#[async_trait]
pub trait UnitOfWork: Send {
    /// Returns the new user's id
    async fn insert_user(&mut self, user: &NewUser) -> Result<i64, DatabaseError>;

    /// Returns the new record's id
    async fn insert_refresh_token(
        &mut self,
        user_id: i64,
        fingerprint: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, DatabaseError>;

    /// Returns the number of records removed. Zero means another unit of
    /// work already removed the record; callers retiring a token must treat
    /// that as a lost race.
    async fn delete_refresh_token_by_id(&mut self, id: i64) -> Result<u64, DatabaseError>;

    /// Returns the number of records removed; zero is not an error
    async fn delete_refresh_token_by_fingerprint(
        &mut self,
        fingerprint: &str,
    ) -> Result<u64, DatabaseError>;

    async fn commit(self) -> Result<(), DatabaseError>;

    async fn rollback(self) -> Result<(), DatabaseError>;
}

/// In-process storage with the same transactional contract as `PgStore`.
///
/// A unit of work stages its mutations and applies them all at once on
/// commit, against a copy of the state that only replaces the live state if
/// every staged operation succeeds. Used by the test suites and for running
/// the service without a database.
///
/// A staged delete-by-id whose row is gone by commit time fails the commit
/// with `NotFound`, so two units of work cannot both retire the same record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Store, UnitOfWork};
use crate::domain::{NewUser, RefreshTokenRecord, User};
use crate::error::DatabaseError;

#[derive(Clone, Default)]
struct State {
    users: BTreeMap<i64, User>,
    refresh_tokens: BTreeMap<i64, RefreshTokenRecord>,
}

enum Staged {
    InsertUser(User),
    InsertRefreshToken(RefreshTokenRecord),
    DeleteRefreshTokenById(i64),
    DeleteRefreshTokensByFingerprint(String),
}

impl State {
    /// Apply one staged operation, returning the number of rows it touched
    fn apply(&mut self, op: &Staged) -> Result<u64, DatabaseError> {
        match op {
            Staged::InsertUser(user) => {
                if self.users.values().any(|u| u.username == user.username) {
                    return Err(DatabaseError::UniqueConstraintViolation(format!(
                        "username {} already exists",
                        user.username
                    )));
                }
                self.users.insert(user.id, user.clone());
                Ok(1)
            }
            Staged::InsertRefreshToken(record) => {
                if !self.users.contains_key(&record.user_id) {
                    return Err(DatabaseError::QueryExecution(format!(
                        "refresh token references unknown user {}",
                        record.user_id
                    )));
                }
                self.refresh_tokens.insert(record.id, record.clone());
                Ok(1)
            }
            Staged::DeleteRefreshTokenById(id) => {
                Ok(self.refresh_tokens.remove(id).map_or(0, |_| 1))
            }
            Staged::DeleteRefreshTokensByFingerprint(fingerprint) => {
                let before = self.refresh_tokens.len();
                self.refresh_tokens.retain(|_, r| &r.fingerprint != fingerprint);
                Ok((before - self.refresh_tokens.len()) as u64)
            }
        }
    }
}

#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    next_id: Arc<AtomicI64>,
    fail_commits: Arc<AtomicBool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            next_id: Arc::new(AtomicI64::new(1)),
            fail_commits: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following commit fail (and roll back) until reset
    pub fn set_commit_failure(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Committed refresh-token records owned by `user_id`
    pub fn refresh_tokens_for(&self, user_id: i64) -> Vec<RefreshTokenRecord> {
        self.lock()
            .map(|state| {
                state
                    .refresh_tokens
                    .values()
                    .filter(|r| r.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn user_count(&self) -> usize {
        self.lock().map(|state| state.users.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, DatabaseError> {
        self.state
            .lock()
            .map_err(|_| DatabaseError::UnexpectedError("in-memory store poisoned".to_string()))
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

pub struct InMemoryUnitOfWork {
    store: InMemoryStore,
    staged: Vec<Staged>,
}

impl InMemoryUnitOfWork {
    /// Rows the staged operations would touch on top of committed state
    fn preview(&self, op: &Staged) -> Result<u64, DatabaseError> {
        let mut snapshot = self.store.lock()?.clone();
        for staged in &self.staged {
            snapshot.apply(staged)?;
        }
        snapshot.apply(op)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type UnitOfWork = InMemoryUnitOfWork;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        let state = self.lock()?;
        Ok(state.users.values().find(|u| u.username == username).cloned())
    }

    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>, DatabaseError> {
        let state = self.lock()?;
        Ok(state.users.get(&id).cloned())
    }

    async fn find_refresh_token(
        &self,
        fingerprint: &str,
        user_id: i64,
    ) -> Result<Option<RefreshTokenRecord>, DatabaseError> {
        let state = self.lock()?;
        Ok(state
            .refresh_tokens
            .values()
            .find(|r| r.fingerprint == fingerprint && r.user_id == user_id)
            .cloned())
    }

    async fn begin(&self) -> Result<Self::UnitOfWork, DatabaseError> {
        Ok(InMemoryUnitOfWork {
            store: self.clone(),
            staged: Vec::new(),
        })
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn insert_user(&mut self, user: &NewUser) -> Result<i64, DatabaseError> {
        let id = self.store.allocate_id();
        self.staged.push(Staged::InsertUser(User {
            id,
            name: user.name.clone(),
            email: user.email.clone(),
            username: user.username.clone(),
            password: user.password.clone(),
        }));
        Ok(id)
    }

    async fn insert_refresh_token(
        &mut self,
        user_id: i64,
        fingerprint: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let id = self.store.allocate_id();
        self.staged.push(Staged::InsertRefreshToken(RefreshTokenRecord {
            id,
            user_id,
            fingerprint: fingerprint.to_string(),
            expires_at,
        }));
        Ok(id)
    }

    async fn delete_refresh_token_by_id(&mut self, id: i64) -> Result<u64, DatabaseError> {
        let op = Staged::DeleteRefreshTokenById(id);
        let removed = self.preview(&op)?;
        if removed > 0 {
            self.staged.push(op);
        }
        Ok(removed)
    }

    async fn delete_refresh_token_by_fingerprint(
        &mut self,
        fingerprint: &str,
    ) -> Result<u64, DatabaseError> {
        let op = Staged::DeleteRefreshTokensByFingerprint(fingerprint.to_string());
        let removed = self.preview(&op)?;
        self.staged.push(op);
        Ok(removed)
    }

    async fn commit(self) -> Result<(), DatabaseError> {
        if self.store.fail_commits.load(Ordering::SeqCst) {
            return Err(DatabaseError::QueryExecution("commit rejected".to_string()));
        }

        let mut state = self.store.lock()?;
        let mut next = state.clone();
        for op in &self.staged {
            let touched = next.apply(op)?;
            if let (Staged::DeleteRefreshTokenById(id), 0) = (op, touched) {
                return Err(DatabaseError::NotFound(format!(
                    "refresh token {} was removed concurrently",
                    id
                )));
            }
        }
        *state = next;
        Ok(())
    }

    async fn rollback(self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

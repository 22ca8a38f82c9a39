/// Session Rotation Protocol
///
/// Registration, login, refresh-token rotation and logout on top of the
/// storage contracts. Refresh tokens are only ever persisted by their keyed
/// fingerprint; a stored fingerprint is a live session, and rotation replaces
/// it inside a single unit of work.

use chrono::{Duration, Utc};

use crate::auth::{fingerprint, hash_password, verify_password, AccessClaims, TokenIssuer};
use crate::configuration::JwtSettings;
use crate::domain::{LoginInput, LoginOutcome, NewUser, RegisterInput, TokenPair, UserView};
use crate::error::{AppError, AuthError, DatabaseError, ErrorContext};
use crate::storage::{Store, UnitOfWork};

pub struct SessionService<S: Store> {
    store: S,
    tokens: TokenIssuer,
    fingerprint_secret: String,
    refresh_ttl: Duration,
}

impl<S: Store> SessionService<S> {
    pub fn new(store: S, config: &JwtSettings) -> Self {
        let tokens = TokenIssuer::new(config);
        Self {
            store,
            refresh_ttl: tokens.refresh_ttl(),
            tokens,
            fingerprint_secret: config.secret.clone(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    /// Create a user account
    ///
    /// # Errors
    /// - `DuplicateUser` if the username is taken, including when a concurrent
    ///   registration wins the unique constraint
    /// - `Internal` for hashing or storage failures
    #[tracing::instrument(name = "register", skip(self, input), fields(username = %input.username))]
    pub async fn register(&self, input: RegisterInput) -> Result<UserView, AppError> {
        let existing = self
            .store
            .find_user_by_username(&input.username)
            .await
            .map_err(|e| internal("register.lookup", e.into()))?;
        if existing.is_some() {
            return Err(AuthError::DuplicateUser.into());
        }

        let password = hash_password(&input.password).map_err(|e| internal("register.hash", e))?;
        let new_user = NewUser {
            name: input.name,
            email: input.email,
            username: input.username,
            password,
        };

        let mut uow = self
            .store
            .begin()
            .await
            .map_err(|e| internal("register.begin", e.into()))?;

        let user_id = match uow.insert_user(&new_user).await {
            Ok(id) => id,
            Err(e) => {
                rollback(uow, "register").await;
                return Err(registration_failure(e));
            }
        };
        uow.commit().await.map_err(registration_failure)?;

        tracing::info!(user_id = user_id, "User registered");
        Ok(new_user.view())
    }

    /// Authenticate with username and password and open a refresh session
    ///
    /// An unknown username and a wrong password are indistinguishable.
    #[tracing::instrument(name = "login", skip(self, input), fields(username = %input.username))]
    pub async fn login(&self, input: LoginInput) -> Result<LoginOutcome, AppError> {
        let user = self
            .store
            .find_user_by_username(&input.username)
            .await
            .map_err(|e| internal("login.lookup", e.into()))?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(&input.password, &user.password) {
            return Err(AuthError::InvalidCredentials.into());
        }

        let access_token = self
            .tokens
            .issue_access(user.id, &user.email, &user.username)
            .map_err(|e| internal("login.issue_access", e))?;
        let refresh_token = self
            .tokens
            .issue_refresh(user.id)
            .map_err(|e| internal("login.issue_refresh", e))?;

        let fp = fingerprint(&refresh_token, &self.fingerprint_secret);
        let expires_at = Utc::now() + self.refresh_ttl;

        let mut uow = self
            .store
            .begin()
            .await
            .map_err(|e| internal("login.begin", e.into()))?;
        if let Err(e) = uow.insert_refresh_token(user.id, &fp, expires_at).await {
            rollback(uow, "login").await;
            return Err(internal("login.insert_refresh_token", e.into()));
        }
        uow.commit()
            .await
            .map_err(|e| internal("login.commit", e.into()))?;

        tracing::info!(user_id = user.id, "User logged in");

        Ok(LoginOutcome {
            tokens: TokenPair {
                access_token,
                refresh_token,
            },
            expires_in: self.tokens.access_ttl().num_seconds(),
            user: user.view(),
        })
    }

    /// Exchange a live refresh token for a new access/refresh pair
    ///
    /// The presented token is retired in the same unit of work that stores
    /// its successor, so it can be used at most once. When two requests race
    /// with the same token, only the one whose delete removes the record gets
    /// a successor. If that unit of work fails the old token stays live.
    #[tracing::instrument(name = "refresh", skip_all)]
    pub async fn refresh(&self, raw: &str) -> Result<TokenPair, AppError> {
        let claims = self.tokens.verify_refresh(raw).map_err(|e| {
            tracing::info!(reason = %e, "Refresh token rejected");
            AuthError::Unauthorized
        })?;
        let user_id = claims.user_id().map_err(|_| AuthError::Unauthorized)?;

        let user = self
            .store
            .find_user_by_id(user_id)
            .await
            .map_err(|e| internal("refresh.find_user", e.into()))?
            .ok_or_else(|| {
                tracing::info!(user_id = user_id, "Refresh token for unknown user");
                AuthError::Unauthorized
            })?;

        let fp = fingerprint(raw, &self.fingerprint_secret);
        let record = self
            .store
            .find_refresh_token(&fp, user.id)
            .await
            .map_err(|e| internal("refresh.find_token", e.into()))?
            .ok_or_else(|| {
                tracing::warn!(user_id = user.id, "Refresh token revoked or already rotated");
                AuthError::Unauthorized
            })?;

        let access_token = self
            .tokens
            .issue_access(user.id, &user.email, &user.username)
            .map_err(|e| internal("refresh.issue_access", e))?;
        let refresh_token = self
            .tokens
            .issue_refresh(user.id)
            .map_err(|e| internal("refresh.issue_refresh", e))?;
        let new_fp = fingerprint(&refresh_token, &self.fingerprint_secret);
        let expires_at = Utc::now() + self.refresh_ttl;

        let mut uow = self
            .store
            .begin()
            .await
            .map_err(|e| internal("refresh.begin", e.into()))?;

        match uow.delete_refresh_token_by_id(record.id).await {
            Ok(0) => {
                rollback(uow, "refresh").await;
                return Err(lost_rotation(user.id));
            }
            Ok(_) => {}
            Err(e) => {
                rollback(uow, "refresh").await;
                return Err(internal("refresh.delete_old", e.into()));
            }
        }
        if let Err(e) = uow.insert_refresh_token(user.id, &new_fp, expires_at).await {
            rollback(uow, "refresh").await;
            return Err(internal("refresh.insert_new", e.into()));
        }
        uow.commit().await.map_err(|e| match e {
            DatabaseError::NotFound(_) => lost_rotation(user.id),
            other => internal("refresh.commit", other.into()),
        })?;

        tracing::info!(user_id = user.id, "Refresh token rotated");

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    /// Revoke the session identified by a refresh token
    ///
    /// Idempotent: an unknown, expired or garbage token is still a success.
    #[tracing::instrument(name = "logout", skip_all)]
    pub async fn logout(&self, raw: &str) -> Result<(), AppError> {
        let fp = fingerprint(raw, &self.fingerprint_secret);

        let mut uow = self
            .store
            .begin()
            .await
            .map_err(|e| internal("logout.begin", e.into()))?;
        let removed = match uow.delete_refresh_token_by_fingerprint(&fp).await {
            Ok(n) => n,
            Err(e) => {
                rollback(uow, "logout").await;
                return Err(internal("logout.delete", e.into()));
            }
        };
        uow.commit()
            .await
            .map_err(|e| internal("logout.commit", e.into()))?;

        tracing::info!(removed = removed, "Session revoked");
        Ok(())
    }

    /// Validate an access token presented to a protected route
    pub fn authenticate(&self, access_token: &str) -> Result<AccessClaims, AppError> {
        self.tokens.verify_access(access_token).map_err(|e| {
            tracing::debug!(reason = %e, "Access token rejected");
            AppError::Auth(AuthError::Unauthorized)
        })
    }
}

/// Log a failure with its operation and collapse it into `Internal`
fn internal(operation: &str, err: AppError) -> AppError {
    ErrorContext::new(operation).log_error(&err);
    AppError::Internal(format!("{} failed", operation))
}

/// Another request retired the same record first
fn lost_rotation(user_id: i64) -> AppError {
    tracing::warn!(user_id = user_id, "Refresh token rotated concurrently");
    AuthError::Unauthorized.into()
}

fn registration_failure(err: DatabaseError) -> AppError {
    match err {
        DatabaseError::UniqueConstraintViolation(_) => AuthError::DuplicateUser.into(),
        other => internal("register.insert", other.into()),
    }
}

async fn rollback<U: UnitOfWork>(uow: U, operation: &str) {
    if let Err(e) = uow.rollback().await {
        tracing::error!(operation = operation, error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RefreshTokenRecord, User};
    use crate::storage::{InMemoryStore, InMemoryUnitOfWork};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    fn jwt_settings() -> JwtSettings {
        JwtSettings {
            secret: "session-test-secret-at-least-32-characters".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
            issuer: "authkeeper-test".to_string(),
        }
    }

    fn service() -> SessionService<InMemoryStore> {
        SessionService::new(InMemoryStore::new(), &jwt_settings())
    }

    /// Store a user directly with a low-cost hash so tests stay fast
    async fn seed_user(store: &InMemoryStore, username: &str, password: &str) -> i64 {
        let mut uow = store.begin().await.unwrap();
        let id = uow
            .insert_user(&NewUser {
                name: "Ann".to_string(),
                email: format!("{}@x.com", username),
                username: username.to_string(),
                password: bcrypt::hash(password, 4).unwrap(),
            })
            .await
            .unwrap();
        uow.commit().await.unwrap();
        id
    }

    fn login_input(username: &str, password: &str) -> LoginInput {
        LoginInput {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_then_duplicate() {
        let service = service();
        let input = RegisterInput {
            name: "Ann".to_string(),
            username: "ann".to_string(),
            email: "a@x.com".to_string(),
            password: "secret123".to_string(),
        };

        let view = service.register(input.clone()).await.unwrap();
        assert_eq!(view.username, "ann");
        assert_eq!(view.email, "a@x.com");

        let stored = service.store().find_user_by_username("ann").await.unwrap().unwrap();
        assert_ne!(stored.password, "secret123");
        assert!(verify_password("secret123", &stored.password));

        let err = service.register(input).await.unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthError::DuplicateUser));
        assert_eq!(service.store().user_count(), 1);
    }

    #[tokio::test]
    async fn test_register_storage_failure_is_internal() {
        let service = service();
        service.store().set_commit_failure(true);

        let err = service
            .register(RegisterInput {
                name: "Ann".to_string(),
                username: "ann".to_string(),
                email: "a@x.com".to_string(),
                password: "secret123".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(service.store().user_count(), 0);
    }

    #[tokio::test]
    async fn test_login_wrong_password_then_right() {
        let service = service();
        let user_id = seed_user(service.store(), "ann", "secret123").await;

        let err = service.login(login_input("ann", "wrong")).await.unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthError::InvalidCredentials));
        assert!(service.store().refresh_tokens_for(user_id).is_empty());

        let outcome = service.login(login_input("ann", "secret123")).await.unwrap();
        assert_eq!(outcome.user.username, "ann");
        assert_eq!(outcome.expires_in, 15 * 60);

        let records = service.store().refresh_tokens_for(user_id);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].fingerprint,
            fingerprint(&outcome.tokens.refresh_token, &jwt_settings().secret)
        );
        assert_ne!(records[0].fingerprint, outcome.tokens.refresh_token);

        let claims = service.authenticate(&outcome.tokens.access_token).unwrap();
        assert_eq!(claims.user_id().unwrap(), user_id);
    }

    #[tokio::test]
    async fn test_login_unknown_user() {
        let service = service();

        let err = service.login(login_input("ghost", "secret123")).await.unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_rejects_old_token() {
        let service = service();
        let user_id = seed_user(service.store(), "ann", "secret123").await;
        let outcome = service.login(login_input("ann", "secret123")).await.unwrap();
        let r1 = outcome.tokens.refresh_token;

        let pair = service.refresh(&r1).await.unwrap();
        assert_ne!(pair.refresh_token, r1);
        assert!(service.authenticate(&pair.access_token).is_ok());

        let records = service.store().refresh_tokens_for(user_id);
        assert_eq!(records.len(), 1);

        let err = service.refresh(&r1).await.unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthError::Unauthorized));

        assert!(service.refresh(&pair.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_rejects_access_token_and_garbage() {
        let service = service();
        seed_user(service.store(), "ann", "secret123").await;
        let outcome = service.login(login_input("ann", "secret123")).await.unwrap();

        let err = service.refresh(&outcome.tokens.access_token).await.unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthError::Unauthorized));

        let err = service.refresh("not.a.token").await.unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthError::Unauthorized));
    }

    #[tokio::test]
    async fn test_failed_rotation_keeps_old_token_live() {
        let service = service();
        let user_id = seed_user(service.store(), "ann", "secret123").await;
        let outcome = service.login(login_input("ann", "secret123")).await.unwrap();
        let r1 = outcome.tokens.refresh_token;

        service.store().set_commit_failure(true);
        let err = service.refresh(&r1).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(service.store().refresh_tokens_for(user_id).len(), 1);

        service.store().set_commit_failure(false);
        assert!(service.refresh(&r1).await.is_ok());
    }

    #[tokio::test]
    async fn test_logout_then_refresh_is_rejected() {
        let service = service();
        let user_id = seed_user(service.store(), "ann", "secret123").await;
        let outcome = service.login(login_input("ann", "secret123")).await.unwrap();
        let r1 = outcome.tokens.refresh_token;

        service.logout(&r1).await.unwrap();
        assert!(service.store().refresh_tokens_for(user_id).is_empty());

        let err = service.refresh(&r1).await.unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthError::Unauthorized));

        // Second logout with the same token is still a success
        service.logout(&r1).await.unwrap();
        service.logout("garbage").await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticate_rejects_refresh_token() {
        let service = service();
        seed_user(service.store(), "ann", "secret123").await;
        let outcome = service.login(login_input("ann", "secret123")).await.unwrap();

        let err = service.authenticate(&outcome.tokens.refresh_token).unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthError::Unauthorized));
    }

    /// Where a competing request slips in while the service is mid-operation
    #[derive(Clone, Copy, PartialEq)]
    enum Interleave {
        /// Another registration commits the same username right after lookup
        AfterUserLookup,
        /// Another rotation retires the record right after it was found
        AfterTokenLookup,
        /// Another rotation retires the record just before our commit
        BeforeCommit,
    }

    /// Wraps the in-memory store and runs one competing request at a chosen
    /// point, the way a second server worker would
    #[derive(Clone)]
    struct InterleavedStore {
        inner: InMemoryStore,
        at: Interleave,
        armed: Arc<AtomicBool>,
        found: Arc<Mutex<Option<(i64, i64)>>>,
    }

    struct InterleavedUnitOfWork {
        inner: InMemoryUnitOfWork,
        store: InterleavedStore,
    }

    impl InterleavedStore {
        fn new(inner: InMemoryStore, at: Interleave) -> Self {
            Self {
                inner,
                at,
                armed: Arc::new(AtomicBool::new(true)),
                found: Arc::new(Mutex::new(None)),
            }
        }

        fn token_was_looked_up(&self) -> bool {
            self.found.lock().unwrap().is_some()
        }

        fn fire(&self, at: Interleave) -> bool {
            self.at == at && self.armed.swap(false, Ordering::SeqCst)
        }

        async fn competing_rotation(&self) {
            let found = *self.found.lock().unwrap();
            let (record_id, user_id) = found.expect("no record was looked up");
            let mut uow = self.inner.begin().await.unwrap();
            assert_eq!(uow.delete_refresh_token_by_id(record_id).await.unwrap(), 1);
            uow.insert_refresh_token(user_id, "competing-successor", Utc::now())
                .await
                .unwrap();
            uow.commit().await.unwrap();
        }
    }

    #[async_trait]
    impl Store for InterleavedStore {
        type UnitOfWork = InterleavedUnitOfWork;

        async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
            let user = self.inner.find_user_by_username(username).await?;
            if self.fire(Interleave::AfterUserLookup) {
                seed_user(&self.inner, username, "other-password").await;
            }
            Ok(user)
        }

        async fn find_user_by_id(&self, id: i64) -> Result<Option<User>, DatabaseError> {
            self.inner.find_user_by_id(id).await
        }

        async fn find_refresh_token(
            &self,
            fingerprint: &str,
            user_id: i64,
        ) -> Result<Option<RefreshTokenRecord>, DatabaseError> {
            let record = self.inner.find_refresh_token(fingerprint, user_id).await?;
            if let Some(r) = &record {
                *self.found.lock().unwrap() = Some((r.id, r.user_id));
            }
            if self.fire(Interleave::AfterTokenLookup) {
                self.competing_rotation().await;
            }
            Ok(record)
        }

        async fn begin(&self) -> Result<Self::UnitOfWork, DatabaseError> {
            Ok(InterleavedUnitOfWork {
                inner: self.inner.begin().await?,
                store: self.clone(),
            })
        }
    }

    #[async_trait]
    impl UnitOfWork for InterleavedUnitOfWork {
        async fn insert_user(&mut self, user: &NewUser) -> Result<i64, DatabaseError> {
            self.inner.insert_user(user).await
        }

        async fn insert_refresh_token(
            &mut self,
            user_id: i64,
            fingerprint: &str,
            expires_at: DateTime<Utc>,
        ) -> Result<i64, DatabaseError> {
            self.inner.insert_refresh_token(user_id, fingerprint, expires_at).await
        }

        async fn delete_refresh_token_by_id(&mut self, id: i64) -> Result<u64, DatabaseError> {
            self.inner.delete_refresh_token_by_id(id).await
        }

        async fn delete_refresh_token_by_fingerprint(
            &mut self,
            fingerprint: &str,
        ) -> Result<u64, DatabaseError> {
            self.inner.delete_refresh_token_by_fingerprint(fingerprint).await
        }

        async fn commit(self) -> Result<(), DatabaseError> {
            // Only the refresh commit; login commits before any token lookup
            if self.store.token_was_looked_up() && self.store.fire(Interleave::BeforeCommit) {
                self.store.competing_rotation().await;
            }
            self.inner.commit().await
        }

        async fn rollback(self) -> Result<(), DatabaseError> {
            self.inner.rollback().await
        }
    }

    async fn interleaved_login(at: Interleave) -> (SessionService<InterleavedStore>, i64, String) {
        let store = InterleavedStore::new(InMemoryStore::new(), at);
        let user_id = seed_user(&store.inner, "ann", "secret123").await;
        let service = SessionService::new(store, &jwt_settings());
        let outcome = service.login(login_input("ann", "secret123")).await.unwrap();
        (service, user_id, outcome.tokens.refresh_token)
    }

    #[tokio::test]
    async fn test_refresh_losing_race_after_lookup_is_rejected() {
        let (service, user_id, r1) = interleaved_login(Interleave::AfterTokenLookup).await;

        let err = service.refresh(&r1).await.unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthError::Unauthorized));

        let records = service.store().inner.refresh_tokens_for(user_id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fingerprint, "competing-successor");
    }

    #[tokio::test]
    async fn test_refresh_losing_race_at_commit_is_rejected() {
        let (service, user_id, r1) = interleaved_login(Interleave::BeforeCommit).await;

        let err = service.refresh(&r1).await.unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthError::Unauthorized));

        let records = service.store().inner.refresh_tokens_for(user_id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fingerprint, "competing-successor");
    }

    #[tokio::test]
    async fn test_register_losing_race_is_duplicate() {
        let store = InterleavedStore::new(InMemoryStore::new(), Interleave::AfterUserLookup);
        let service = SessionService::new(store, &jwt_settings());

        let err = service
            .register(RegisterInput {
                name: "Ann".to_string(),
                username: "ann".to_string(),
                email: "a@x.com".to_string(),
                password: "secret123".to_string(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.auth_kind(), Some(AuthError::DuplicateUser));
        assert_eq!(service.store().inner.user_count(), 1);
    }
}

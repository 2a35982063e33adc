//! Postgres backend.
//!
//! Status columns are read as `status::text` and written with an explicit
//! `::session_status` cast so the enum type stays out of the Rust mapping.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection, PgPool, Postgres, Row, Transaction, postgres::PgRow};
use tracing::{Instrument, Span};
use uuid::Uuid;

use super::{
    AuthMethods, ConnectToken, ConnectTokenStore, Redemption, SessionStore, SessionTransaction,
    UserDirectory, UserInsert, UserRecord,
};
use crate::auth::{
    identity::{ExternalIdentity, Provider},
    session::{DeviceMeta, Session, SessionSummary},
};

fn db_span(operation: &'static str, statement: &'static str) -> Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn session_from_row(row: &PgRow) -> Result<Session> {
    let status: String = row.try_get("status")?;
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        refresh_secret_hash: row.try_get("refresh_secret_hash")?,
        refresh_expires_at: row.try_get("refresh_expires_at")?,
        status: status.parse()?,
        replaced_by_session_id: row.try_get("replaced_by_session_id")?,
        device: DeviceMeta {
            user_agent: row.try_get("user_agent")?,
            ip: row.try_get("ip")?,
            device_name: row.try_get("device_name")?,
        },
        last_used_at: row.try_get("last_used_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<UserRecord> {
    Ok(UserRecord {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        role: row.try_get("role")?,
        avatar_url: row.try_get("avatar_url")?,
        password_hash: row.try_get("password_hash")?,
    })
}

const INSERT_SESSION: &str = r"
    INSERT INTO sessions
        (id, user_id, refresh_secret_hash, refresh_expires_at, status,
         replaced_by_session_id, user_agent, ip, device_name, last_used_at, created_at)
    VALUES ($1, $2, $3, $4, $5::session_status, $6, $7, $8, $9, $10, $11)
";

fn bind_session<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    session: &'q Session,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.refresh_secret_hash)
        .bind(session.refresh_expires_at)
        .bind(session.status.as_str())
        .bind(session.replaced_by_session_id)
        .bind(session.device.user_agent.as_deref())
        .bind(session.device.ip.as_deref())
        .bind(session.device.device_name.as_deref())
        .bind(session.last_used_at)
        .bind(session.created_at)
}

const REVOKE_ALL: &str = r"
    UPDATE sessions
    SET status = 'revoked'::session_status
    WHERE user_id = $1 AND status = 'active'::session_status
";

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert(&self, session: &Session) -> Result<()> {
        bind_session(sqlx::query(INSERT_SESSION), session)
            .execute(&self.pool)
            .instrument(db_span("INSERT", INSERT_SESSION))
            .await
            .context("failed to insert session")?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        let query = r"
            SELECT id, user_id, refresh_secret_hash, refresh_expires_at, status::text AS status,
                   replaced_by_session_id, user_agent, ip, device_name, last_used_at, created_at
            FROM sessions
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load session")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn slide(
        &self,
        id: Uuid,
        refresh_expires_at: DateTime<Utc>,
        last_used_at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = r"
            UPDATE sessions
            SET refresh_expires_at = $2, last_used_at = $3
            WHERE id = $1 AND status = 'active'::session_status
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(refresh_expires_at)
            .bind(last_used_at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to slide session")?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let query = r"
            UPDATE sessions
            SET status = 'revoked'::session_status
            WHERE id = $1 AND user_id = $2 AND status = 'active'::session_status
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to revoke session")?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_all(&self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query(REVOKE_ALL)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", REVOKE_ALL))
            .await
            .context("failed to revoke sessions")?;
        Ok(result.rows_affected())
    }

    async fn list_active(&self, user_id: Uuid) -> Result<Vec<SessionSummary>> {
        let query = r"
            SELECT id, user_id, refresh_secret_hash, refresh_expires_at, status::text AS status,
                   replaced_by_session_id, user_agent, ip, device_name, last_used_at, created_at
            FROM sessions
            WHERE user_id = $1 AND status = 'active'::session_status
            ORDER BY last_used_at DESC
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to list sessions")?;
        rows.iter()
            .map(|row| session_from_row(row).map(|session| SessionSummary::from(&session)))
            .collect()
    }

    async fn begin(&self) -> Result<Box<dyn SessionTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .context("begin rotation transaction")?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn ping(&self) -> Result<()> {
        let acquire_span = tracing::info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        let mut conn = self
            .pool
            .acquire()
            .instrument(acquire_span)
            .await
            .context("failed to acquire database connection")?;
        let ping_span = tracing::info_span!(
            "db.ping",
            db.system = "postgresql",
            db.operation = "PING"
        );
        conn.ping()
            .instrument(ping_span)
            .await
            .context("failed to ping database")
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SessionTransaction for PgTransaction {
    async fn lock_session(&mut self, id: Uuid) -> Result<Option<Session>> {
        let query = r"
            SELECT id, user_id, refresh_secret_hash, refresh_expires_at, status::text AS status,
                   replaced_by_session_id, user_agent, ip, device_name, last_used_at, created_at
            FROM sessions
            WHERE id = $1
            FOR UPDATE
        ";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lock session")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn insert(&mut self, session: &Session) -> Result<()> {
        bind_session(sqlx::query(INSERT_SESSION), session)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", INSERT_SESSION))
            .await
            .context("failed to insert successor session")?;
        Ok(())
    }

    async fn mark_rotated(&mut self, id: Uuid, successor: Uuid) -> Result<()> {
        let query = r"
            UPDATE sessions
            SET status = 'rotated'::session_status, replaced_by_session_id = $2
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(id)
            .bind(successor)
            .execute(&mut *self.tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to mark session rotated")?;
        Ok(())
    }

    async fn mark_revoked(&mut self, id: Uuid) -> Result<()> {
        let query = "UPDATE sessions SET status = 'revoked'::session_status WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .execute(&mut *self.tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to mark session revoked")?;
        Ok(())
    }

    async fn revoke_all(&mut self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query(REVOKE_ALL)
            .bind(user_id)
            .execute(&mut *self.tx)
            .instrument(db_span("UPDATE", REVOKE_ALL))
            .await
            .context("failed to revoke sessions")?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .context("commit rotation transaction")
    }
}

#[async_trait]
impl ConnectTokenStore for PgStore {
    async fn insert_connect_token(&self, token: &ConnectToken) -> Result<()> {
        let query = r"
            INSERT INTO oauth_connect_tokens (token_hash, user_id, provider, expires_at)
            VALUES ($1, $2, $3, $4)
        ";
        sqlx::query(query)
            .bind(&token.token_hash)
            .bind(token.user_id)
            .bind(token.provider.as_str())
            .bind(token.expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to insert connect token")?;
        Ok(())
    }

    async fn redeem_connect_token(
        &self,
        token_hash: &[u8],
        now: DateTime<Utc>,
        identity: &ExternalIdentity,
    ) -> Result<Redemption> {
        let mut tx = self.pool.begin().await.context("begin connect transaction")?;

        // The row lock taken by DELETE makes a concurrent redeemer wait for
        // this transaction and then find nothing.
        let query = r"
            DELETE FROM oauth_connect_tokens
            WHERE token_hash = $1 AND expires_at > $2 AND provider = $3
            RETURNING user_id
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .bind(now)
            .bind(identity.provider.as_str())
            .fetch_optional(&mut *tx)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to claim connect token")?;
        let Some(row) = row else {
            return Ok(Redemption::InvalidToken);
        };
        let user_id: Uuid = row.try_get("user_id")?;

        if !link_identity(&mut tx, user_id, identity).await? {
            tx.rollback()
                .await
                .context("failed to rollback connect transaction")?;
            return Ok(Redemption::AlreadyLinked);
        }

        tx.commit().await.context("commit connect transaction")?;
        Ok(Redemption::Linked(user_id))
    }
}

/// Returns `false` when the identity is linked anywhere or the user already
/// has this provider.
async fn link_identity(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    identity: &ExternalIdentity,
) -> Result<bool> {
    let query = r"
        INSERT INTO auth_providers (user_id, provider, provider_user_id)
        VALUES ($1, $2, $3)
        ON CONFLICT DO NOTHING
    ";
    let result = sqlx::query(query)
        .bind(user_id)
        .bind(identity.provider.as_str())
        .bind(&identity.provider_user_id)
        .execute(&mut **tx)
        .instrument(db_span("INSERT", query))
        .await
        .context("failed to link identity")?;
    if result.rows_affected() != 1 {
        return Ok(false);
    }

    let query = "UPDATE users SET avatar_url = COALESCE(avatar_url, $2) WHERE id = $1";
    sqlx::query(query)
        .bind(user_id)
        .bind(identity.avatar_url.as_deref())
        .execute(&mut **tx)
        .instrument(db_span("UPDATE", query))
        .await
        .context("failed to update avatar")?;
    Ok(true)
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>> {
        let query = r"
            SELECT id, email, name, role, avatar_url, password_hash
            FROM users
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup user")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let query = r"
            SELECT id, email, name, role, avatar_url, password_hash
            FROM users
            WHERE LOWER(email) = LOWER($1)
        ";
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup user by email")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn create_user_with_password(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserInsert> {
        let query = r"
            INSERT INTO users (id, email, name, password_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id, email, name, role, avatar_url, password_hash
        ";
        let row = sqlx::query(query)
            .bind(Uuid::now_v7())
            .bind(email)
            .bind(name)
            .bind(password_hash)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", query))
            .await;
        match row {
            Ok(row) => Ok(UserInsert::Created(user_from_row(&row)?)),
            Err(err) if is_unique_violation(&err) => Ok(UserInsert::Conflict),
            Err(err) => Err(err).context("failed to insert user"),
        }
    }

    async fn find_user_by_identity(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<Option<UserRecord>> {
        let query = r"
            SELECT u.id, u.email, u.name, u.role, u.avatar_url, u.password_hash
            FROM users u
            JOIN auth_providers p ON p.user_id = u.id
            WHERE p.provider = $1 AND p.provider_user_id = $2
        ";
        let row = sqlx::query(query)
            .bind(provider.as_str())
            .bind(provider_user_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup user by identity")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn create_user_from_identity(&self, identity: &ExternalIdentity) -> Result<UserInsert> {
        let mut tx = self.pool.begin().await.context("begin signup transaction")?;

        let query = r"
            INSERT INTO users (id, email, name, avatar_url)
            VALUES ($1, $2, $3, $4)
            RETURNING id, email, name, role, avatar_url, password_hash
        ";
        let row = sqlx::query(query)
            .bind(Uuid::now_v7())
            .bind(&identity.email)
            .bind(&identity.display_name)
            .bind(identity.avatar_url.as_deref())
            .fetch_one(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await;
        let user = match row {
            Ok(row) => user_from_row(&row)?,
            Err(err) if is_unique_violation(&err) => {
                tx.rollback()
                    .await
                    .context("failed to rollback signup transaction")?;
                return Ok(UserInsert::Conflict);
            }
            Err(err) => return Err(err).context("failed to insert user"),
        };

        let query = r"
            INSERT INTO auth_providers (user_id, provider, provider_user_id)
            VALUES ($1, $2, $3)
        ";
        let linked = sqlx::query(query)
            .bind(user.id)
            .bind(identity.provider.as_str())
            .bind(&identity.provider_user_id)
            .execute(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await;
        match linked {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                tx.rollback()
                    .await
                    .context("failed to rollback signup transaction")?;
                return Ok(UserInsert::Conflict);
            }
            Err(err) => return Err(err).context("failed to link identity"),
        }

        tx.commit().await.context("commit signup transaction")?;
        Ok(UserInsert::Created(user))
    }

    async fn auth_methods(&self, user_id: Uuid) -> Result<Option<AuthMethods>> {
        let query = "SELECT password_hash IS NOT NULL AS has_password FROM users WHERE id = $1";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup auth methods")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let has_password: bool = row.try_get("has_password")?;

        let query = "SELECT provider FROM auth_providers WHERE user_id = $1 ORDER BY provider";
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup providers")?;
        let providers = rows
            .iter()
            .map(|row| -> Result<Provider> {
                let name: String = row.try_get("provider")?;
                Ok(name.parse()?)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(AuthMethods {
            has_password,
            providers,
        }))
    }

    async fn clear_password(&self, user_id: Uuid) -> Result<()> {
        let query = "UPDATE users SET password_hash = NULL WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to clear password")?;
        Ok(())
    }

    async fn unlink_provider(&self, user_id: Uuid, provider: Provider) -> Result<bool> {
        let query = "DELETE FROM auth_providers WHERE user_id = $1 AND provider = $2";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(provider.as_str())
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to unlink provider")?;
        Ok(result.rows_affected() == 1)
    }
}

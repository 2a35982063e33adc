//! In-process backend used by tests and single-node development runs.
//!
//! Mutations are serialized through one async gate. A transaction holds the
//! gate from `begin` until it is committed or dropped, which is strictly
//! stronger than the row locks taken by the Postgres backend.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    AuthMethods, ConnectToken, ConnectTokenStore, Redemption, SessionStore, SessionTransaction,
    UserDirectory, UserInsert, UserRecord,
};
use crate::auth::{
    identity::{ExternalIdentity, Provider},
    session::{Session, SessionStatus, SessionSummary},
};

const DEFAULT_ROLE: &str = "user";

#[derive(Clone, Debug)]
struct UserRow {
    record: UserRecord,
    identities: Vec<(Provider, String)>,
}

#[derive(Default)]
struct Inner {
    gate: Arc<AsyncMutex<()>>,
    sessions: RwLock<HashMap<Uuid, Session>>,
    connect_tokens: Mutex<HashMap<Vec<u8>, ConnectToken>>,
    users: RwLock<HashMap<Uuid, UserRow>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Change a user's role. Roles are managed outside the auth surface.
    pub fn set_role(&self, user_id: Uuid, role: &str) -> bool {
        self.inner
            .users
            .write()
            .get_mut(&user_id)
            .map(|row| row.record.role = role.to_string())
            .is_some()
    }

    /// Overwrite a stored session. Test hook for simulating clock drift.
    pub fn put_session(&self, session: Session) {
        self.inner.sessions.write().insert(session.id, session);
    }

    /// Number of stored sessions in every status.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("sessions", &self.inner.sessions.read().len())
            .field("users", &self.inner.users.read().len())
            .finish_non_exhaustive()
    }
}

fn revoke_active(sessions: &mut HashMap<Uuid, Session>, user_id: Uuid) -> u64 {
    let mut changed = 0;
    for session in sessions.values_mut() {
        if session.user_id == user_id && session.status == SessionStatus::Active {
            session.status = SessionStatus::Revoked;
            changed += 1;
        }
    }
    changed
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, session: &Session) -> Result<()> {
        let _gate = self.inner.gate.lock().await;
        let mut sessions = self.inner.sessions.write();
        if sessions.contains_key(&session.id) {
            return Err(anyhow!("session {} already exists", session.id));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.inner.sessions.read().get(&id).cloned())
    }

    async fn slide(
        &self,
        id: Uuid,
        refresh_expires_at: DateTime<Utc>,
        last_used_at: DateTime<Utc>,
    ) -> Result<bool> {
        let _gate = self.inner.gate.lock().await;
        let mut sessions = self.inner.sessions.write();
        let Some(session) = sessions
            .get_mut(&id)
            .filter(|session| session.status == SessionStatus::Active)
        else {
            return Ok(false);
        };
        session.refresh_expires_at = refresh_expires_at;
        session.last_used_at = last_used_at;
        Ok(true)
    }

    async fn revoke(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let _gate = self.inner.gate.lock().await;
        let mut sessions = self.inner.sessions.write();
        match sessions.get_mut(&id) {
            Some(session)
                if session.user_id == user_id && session.status == SessionStatus::Active =>
            {
                session.status = SessionStatus::Revoked;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all(&self, user_id: Uuid) -> Result<u64> {
        let _gate = self.inner.gate.lock().await;
        Ok(revoke_active(&mut self.inner.sessions.write(), user_id))
    }

    async fn list_active(&self, user_id: Uuid) -> Result<Vec<SessionSummary>> {
        let sessions = self.inner.sessions.read();
        let mut active: Vec<SessionSummary> = sessions
            .values()
            .filter(|session| session.user_id == user_id && session.status == SessionStatus::Active)
            .map(SessionSummary::from)
            .collect();
        active.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(active)
    }

    async fn begin(&self) -> Result<Box<dyn SessionTransaction>> {
        let gate = Arc::clone(&self.inner.gate).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            staged: HashMap::new(),
            _gate: gate,
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    staged: HashMap<Uuid, Session>,
    _gate: OwnedMutexGuard<()>,
}

impl MemoryTransaction {
    fn current(&self, id: Uuid) -> Option<Session> {
        self.staged
            .get(&id)
            .cloned()
            .or_else(|| self.inner.sessions.read().get(&id).cloned())
    }

    fn stage_update(&mut self, id: Uuid, update: impl FnOnce(&mut Session)) -> Result<()> {
        let mut session = self
            .current(id)
            .ok_or_else(|| anyhow!("session {id} not found"))?;
        update(&mut session);
        self.staged.insert(id, session);
        Ok(())
    }
}

#[async_trait]
impl SessionTransaction for MemoryTransaction {
    async fn lock_session(&mut self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.current(id))
    }

    async fn insert(&mut self, session: &Session) -> Result<()> {
        if self.current(session.id).is_some() {
            return Err(anyhow!("session {} already exists", session.id));
        }
        self.staged.insert(session.id, session.clone());
        Ok(())
    }

    async fn mark_rotated(&mut self, id: Uuid, successor: Uuid) -> Result<()> {
        self.stage_update(id, |session| {
            session.status = SessionStatus::Rotated;
            session.replaced_by_session_id = Some(successor);
        })
    }

    async fn mark_revoked(&mut self, id: Uuid) -> Result<()> {
        self.stage_update(id, |session| session.status = SessionStatus::Revoked)
    }

    async fn revoke_all(&mut self, user_id: Uuid) -> Result<u64> {
        let mut candidates: HashMap<Uuid, Session> = self
            .inner
            .sessions
            .read()
            .iter()
            .filter(|(_, session)| session.user_id == user_id)
            .map(|(id, session)| (*id, session.clone()))
            .collect();
        for (id, session) in &self.staged {
            candidates.insert(*id, session.clone());
        }
        let changed = revoke_active(&mut candidates, user_id);
        for (id, session) in candidates {
            if session.user_id == user_id {
                self.staged.insert(id, session);
            }
        }
        Ok(changed)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut sessions = self.inner.sessions.write();
        for (id, session) in self.staged {
            sessions.insert(id, session);
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectTokenStore for MemoryStore {
    async fn insert_connect_token(&self, token: &ConnectToken) -> Result<()> {
        self.inner
            .connect_tokens
            .lock()
            .insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn redeem_connect_token(
        &self,
        token_hash: &[u8],
        now: DateTime<Utc>,
        identity: &ExternalIdentity,
    ) -> Result<Redemption> {
        let mut tokens = self.inner.connect_tokens.lock();
        let Some(user_id) = tokens
            .get(token_hash)
            .filter(|token| token.expires_at > now && token.provider == identity.provider)
            .map(|token| token.user_id)
        else {
            return Ok(Redemption::InvalidToken);
        };

        if !link_identity(&mut self.inner.users.write(), user_id, identity) {
            return Ok(Redemption::AlreadyLinked);
        }
        tokens.remove(token_hash);
        Ok(Redemption::Linked(user_id))
    }
}

fn email_taken(users: &HashMap<Uuid, UserRow>, email: &str) -> bool {
    users
        .values()
        .any(|row| row.record.email.eq_ignore_ascii_case(email))
}

fn identity_owner(
    users: &HashMap<Uuid, UserRow>,
    provider: Provider,
    provider_user_id: &str,
) -> Option<Uuid> {
    users.values().find_map(|row| {
        row.identities
            .iter()
            .any(|(p, id)| *p == provider && id == provider_user_id)
            .then_some(row.record.id)
    })
}

fn link_identity(
    users: &mut HashMap<Uuid, UserRow>,
    user_id: Uuid,
    identity: &ExternalIdentity,
) -> bool {
    if identity_owner(users, identity.provider, &identity.provider_user_id).is_some() {
        return false;
    }
    let Some(row) = users.get_mut(&user_id) else {
        return false;
    };
    if row.identities.iter().any(|(p, _)| *p == identity.provider) {
        return false;
    }
    row.identities
        .push((identity.provider, identity.provider_user_id.clone()));
    if row.record.avatar_url.is_none() {
        row.record.avatar_url.clone_from(&identity.avatar_url);
    }
    true
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>> {
        Ok(self.inner.users.read().get(&id).map(|row| row.record.clone()))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        Ok(self
            .inner
            .users
            .read()
            .values()
            .find(|row| row.record.email.eq_ignore_ascii_case(email))
            .map(|row| row.record.clone()))
    }

    async fn create_user_with_password(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserInsert> {
        let mut users = self.inner.users.write();
        if email_taken(&users, email) {
            return Ok(UserInsert::Conflict);
        }
        let record = UserRecord {
            id: Uuid::now_v7(),
            email: email.to_string(),
            name: name.to_string(),
            role: DEFAULT_ROLE.to_string(),
            avatar_url: None,
            password_hash: Some(password_hash.to_string()),
        };
        users.insert(
            record.id,
            UserRow {
                record: record.clone(),
                identities: Vec::new(),
            },
        );
        Ok(UserInsert::Created(record))
    }

    async fn find_user_by_identity(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<Option<UserRecord>> {
        let users = self.inner.users.read();
        Ok(identity_owner(&users, provider, provider_user_id)
            .and_then(|id| users.get(&id))
            .map(|row| row.record.clone()))
    }

    async fn create_user_from_identity(&self, identity: &ExternalIdentity) -> Result<UserInsert> {
        let mut users = self.inner.users.write();
        if email_taken(&users, &identity.email)
            || identity_owner(&users, identity.provider, &identity.provider_user_id).is_some()
        {
            return Ok(UserInsert::Conflict);
        }
        let record = UserRecord {
            id: Uuid::now_v7(),
            email: identity.email.clone(),
            name: identity.display_name.clone(),
            role: DEFAULT_ROLE.to_string(),
            avatar_url: identity.avatar_url.clone(),
            password_hash: None,
        };
        users.insert(
            record.id,
            UserRow {
                record: record.clone(),
                identities: vec![(identity.provider, identity.provider_user_id.clone())],
            },
        );
        Ok(UserInsert::Created(record))
    }

    async fn auth_methods(&self, user_id: Uuid) -> Result<Option<AuthMethods>> {
        Ok(self.inner.users.read().get(&user_id).map(|row| {
            let mut providers: Vec<Provider> = row.identities.iter().map(|(p, _)| *p).collect();
            providers.sort_by_key(|p| p.as_str());
            AuthMethods {
                has_password: row.record.password_hash.is_some(),
                providers,
            }
        }))
    }

    async fn clear_password(&self, user_id: Uuid) -> Result<()> {
        if let Some(row) = self.inner.users.write().get_mut(&user_id) {
            row.record.password_hash = None;
        }
        Ok(())
    }

    async fn unlink_provider(&self, user_id: Uuid, provider: Provider) -> Result<bool> {
        let mut users = self.inner.users.write();
        let Some(row) = users.get_mut(&user_id) else {
            return Ok(false);
        };
        let before = row.identities.len();
        row.identities.retain(|(p, _)| *p != provider);
        Ok(row.identities.len() != before)
    }
}

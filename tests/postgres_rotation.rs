//! Rotation against a real Postgres. Runs only when `SESSIONGATE_TEST_DSN`
//! points at a database the test may write to.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use secrecy::ExposeSecret;
use sessiongate::{
    auth::{
        AuthError, ConnectTokens, DeviceMeta, ExternalIdentity, Provider, Session,
        SessionRotationEngine, SessionStatus, TokenSigner, secret::hash_refresh_secret,
    },
    store::{PgStore, SessionStore, UserDirectory, UserInsert},
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../sql/schema.sql");
const SECRET: &[u8] = b"postgres-rotation-secret";

async fn store() -> Result<Option<PgStore>> {
    let Ok(dsn) = std::env::var("SESSIONGATE_TEST_DSN") else {
        eprintln!("Skipping integration test: SESSIONGATE_TEST_DSN is not set");
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&dsn)
        .await
        .context("Failed to connect to test database")?;
    sqlx::raw_sql(SCHEMA)
        .execute(&pool)
        .await
        .context("Failed to apply schema")?;
    Ok(Some(PgStore::new(pool)))
}

async fn user(store: &PgStore) -> Result<Uuid> {
    let email = format!("{}@sessiongate.test", Uuid::now_v7());
    match store
        .create_user_with_password("Rotation Test", &email, "not-a-real-hash")
        .await?
    {
        UserInsert::Created(user) => Ok(user.id),
        UserInsert::Conflict => anyhow::bail!("fresh email conflicted"),
    }
}

fn engine(store: &PgStore) -> SessionRotationEngine {
    SessionRotationEngine::new(
        Arc::new(store.clone()),
        TokenSigner::new(SECRET, 300),
        Duration::days(30),
    )
}

#[tokio::test]
async fn rotation_chains_sessions() -> Result<()> {
    let Some(store) = store().await? else {
        return Ok(());
    };
    let engine = engine(&store);
    let user_id = user(&store).await?;

    let issued = engine.login(user_id, "user", DeviceMeta::default()).await?;
    let rotation = engine
        .rotate(&issued.access_token, issued.refresh_secret.expose_secret())
        .await?;

    let old = store
        .get(issued.session_id)
        .await?
        .context("predecessor row")?;
    assert_eq!(old.status, SessionStatus::Rotated);
    assert_eq!(old.replaced_by_session_id, Some(rotation.session_id));

    let active = engine.list_active(user_id).await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, rotation.session_id);
    Ok(())
}

#[tokio::test]
async fn replay_revokes_every_session() -> Result<()> {
    let Some(store) = store().await? else {
        return Ok(());
    };
    let engine = engine(&store);
    let user_id = user(&store).await?;

    let issued = engine.login(user_id, "user", DeviceMeta::default()).await?;
    engine.login(user_id, "user", DeviceMeta::default()).await?;
    engine
        .rotate(&issued.access_token, issued.refresh_secret.expose_secret())
        .await?;

    let replay = engine
        .rotate(&issued.access_token, issued.refresh_secret.expose_secret())
        .await;
    assert!(matches!(replay, Err(AuthError::Unauthenticated)));
    assert!(engine.list_active(user_id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn concurrent_rotations_serialize_on_the_row_lock() -> Result<()> {
    let Some(store) = store().await? else {
        return Ok(());
    };
    let engine = engine(&store);
    let user_id = user(&store).await?;

    let issued = engine.login(user_id, "user", DeviceMeta::default()).await?;
    let secret = issued.refresh_secret.expose_secret();
    let (first, second) = tokio::join!(
        engine.rotate(&issued.access_token, secret),
        engine.rotate(&issued.access_token, secret),
    );

    assert_eq!(usize::from(first.is_ok()) + usize::from(second.is_ok()), 1);
    assert!(engine.list_active(user_id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn sessions_are_listed_most_recently_used_first() -> Result<()> {
    let Some(store) = store().await? else {
        return Ok(());
    };
    let engine = engine(&store);
    let user_id = user(&store).await?;

    let now = Utc::now();
    let mut ids = Vec::new();
    for hours_ago in [2, 0, 1] {
        let session = Session {
            id: Uuid::now_v7(),
            user_id,
            refresh_secret_hash: hash_refresh_secret("listing-secret")?,
            refresh_expires_at: now + Duration::days(30),
            status: SessionStatus::Active,
            replaced_by_session_id: None,
            device: DeviceMeta::default(),
            last_used_at: now - Duration::hours(hours_ago),
            created_at: now - Duration::hours(3),
        };
        store.insert(&session).await?;
        ids.push(session.id);
    }

    let listed: Vec<Uuid> = engine
        .list_active(user_id)
        .await?
        .iter()
        .map(|summary| summary.id)
        .collect();
    assert_eq!(listed, vec![ids[1], ids[2], ids[0]]);
    Ok(())
}

#[tokio::test]
async fn expired_window_is_revoked_inside_the_transaction() -> Result<()> {
    let Some(store) = store().await? else {
        return Ok(());
    };
    let engine = engine(&store);
    let user_id = user(&store).await?;

    let secret = "expired-refresh-secret";
    let now = Utc::now();
    let session = Session {
        id: Uuid::now_v7(),
        user_id,
        refresh_secret_hash: hash_refresh_secret(secret)?,
        refresh_expires_at: now - Duration::minutes(1),
        status: SessionStatus::Active,
        replaced_by_session_id: None,
        device: DeviceMeta::default(),
        last_used_at: now - Duration::days(31),
        created_at: now - Duration::days(31),
    };
    store.insert(&session).await?;
    let token = engine.signer().sign(user_id, session.id, "user")?;

    let result = engine.rotate(&token, secret).await;
    assert!(matches!(result, Err(AuthError::Unauthenticated)));

    let row = store.get(session.id).await?.context("expired row")?;
    assert_eq!(row.status, SessionStatus::Revoked);
    assert_eq!(row.replaced_by_session_id, None);
    Ok(())
}

#[tokio::test]
async fn connect_token_is_claimed_by_one_consumer() -> Result<()> {
    let Some(store) = store().await? else {
        return Ok(());
    };
    let user_id = user(&store).await?;
    let connect = ConnectTokens::new(Arc::new(store.clone()), 300);
    let token = connect.create(user_id, Provider::Google).await?;

    let identity = |id: &str| ExternalIdentity {
        provider: Provider::Google,
        provider_user_id: format!("{id}-{}", Uuid::now_v7()),
        email: "rotation@sessiongate.test".to_string(),
        display_name: "Rotation Test".to_string(),
        avatar_url: None,
    };
    let (first, second) = (identity("g-1"), identity("g-2"));
    let (a, b) = tokio::join!(
        connect.consume(&token, &first),
        connect.consume(&token, &second),
    );
    assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);

    let again = connect.consume(&token, &identity("g-3")).await;
    assert!(matches!(again, Err(AuthError::Unauthenticated)));
    Ok(())
}

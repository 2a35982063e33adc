//! Session records and the principal handed to downstream handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle of a session row. `Revoked` is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Rotated,
    Revoked,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rotated => "rotated",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "rotated" => Ok(Self::Rotated),
            "revoked" => Ok(Self::Revoked),
            other => Err(anyhow::anyhow!("unknown session status: {other}")),
        }
    }
}

/// Descriptive metadata; never used for authorization.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceMeta {
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub device_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_secret_hash: String,
    pub refresh_expires_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub replaced_by_session_id: Option<Uuid>,
    pub device: DeviceMeta,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.refresh_expires_at <= now
    }
}

/// Session listing entry for the account-management surface. Carries no secrets.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct SessionSummary {
    pub id: Uuid,
    pub device_name: Option<String>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            device_name: session.device.device_name.clone(),
            user_agent: session.device.user_agent.clone(),
            ip: session.device.ip.clone(),
            last_used_at: session.last_used_at,
            created_at: session.created_at,
        }
    }
}

/// Authenticated caller resolved by the guard.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub role: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Rotated,
            SessionStatus::Revoked,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().ok(), Some(status));
        }
        assert!("expired".parse::<SessionStatus>().is_err());
    }
}

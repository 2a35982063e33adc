//! Authentication core: credential signing, session rotation, and the request guard.

pub mod accounts;
pub mod config;
pub mod connect;
pub mod cookies;
pub mod device;
pub mod engine;
pub mod error;
pub mod guard;
pub mod identity;
pub mod oauth;
pub mod secret;
pub mod session;
pub mod state;
pub mod token;

pub use accounts::{Accounts, Registration};
pub use config::AuthConfig;
pub use connect::ConnectTokens;
pub use engine::{IssuedSession, Rotation, SessionRotationEngine};
pub use error::AuthError;
pub use guard::{AuthenticationGuard, GuardOutcome, PublicRoutes, current_principal, require_auth};
pub use identity::{ExternalIdentity, Provider};
pub use oauth::{OAuthFlow, OAuthOutcome};
pub use session::{DeviceMeta, Principal, Session, SessionStatus, SessionSummary};
pub use state::{OAuthMode, OAuthState, StateSigner};
pub use token::{AccessClaims, TokenError, TokenSigner};

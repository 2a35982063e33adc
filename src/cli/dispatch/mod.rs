use crate::{
    auth::AuthConfig,
    cli::actions::{Action, server},
};
use anyhow::{Context, Result};
use secrecy::SecretString;

fn required(matches: &clap::ArgMatches, name: &str) -> Result<String> {
    matches
        .get_one::<String>(name)
        .cloned()
        .with_context(|| format!("missing required argument: --{name}"))
}

fn seconds(matches: &clap::ArgMatches, name: &str) -> Result<i64> {
    matches
        .get_one::<i64>(name)
        .copied()
        .with_context(|| format!("missing argument: --{name}"))
}

/// Map parsed arguments to an [`Action`].
/// # Errors
/// Returns an error if a required argument is missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let config = AuthConfig::new(
        required(matches, "frontend-base-url")?,
        SecretString::from(required(matches, "access-secret")?),
        SecretString::from(required(matches, "state-secret")?),
    )
    .with_access_ttl_seconds(seconds(matches, "access-ttl-seconds")?)
    .with_refresh_ttl_days(seconds(matches, "refresh-ttl-days")?)
    .with_connect_token_ttl_seconds(seconds(matches, "connect-token-ttl-seconds")?)
    .with_oauth_state_ttl_seconds(seconds(matches, "oauth-state-ttl-seconds")?)
    .with_production(matches.get_flag("production"));

    Ok(Action::Server(server::Args {
        port: matches.get_one::<u16>("port").copied().unwrap_or(8080),
        dsn: required(matches, "dsn")?,
        config,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    #[test]
    fn builds_server_action() -> Result<()> {
        let matches = commands::new().try_get_matches_from([
            "sessiongate",
            "--port",
            "9090",
            "--dsn",
            "postgres://localhost/sessiongate",
            "--access-secret",
            "access",
            "--state-secret",
            "state",
            "--refresh-ttl-days",
            "14",
            "--production",
        ])?;

        let Action::Server(args) = handler(&matches)?;
        assert_eq!(args.port, 9090);
        assert_eq!(args.dsn, "postgres://localhost/sessiongate");
        assert_eq!(args.config.refresh_ttl_days(), 14);
        assert_eq!(args.config.access_secret(), b"access");
        assert!(args.config.production());
        Ok(())
    }
}

use crate::{api, auth::AuthConfig, cli::telemetry};
use anyhow::Result;
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub config: AuthConfig,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    info!(
        port = args.port,
        dsn = %redact_dsn(&args.dsn),
        frontend_base_url = args.config.frontend_base_url(),
        access_ttl_seconds = args.config.access_ttl_seconds(),
        refresh_ttl_days = args.config.refresh_ttl_days(),
        production = args.config.production(),
        "Startup configuration"
    );

    let result = api::new(args.port, args.dsn, args.config).await;
    telemetry::shutdown_tracer();
    result
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_dsn_hides_password() {
        let redacted = redact_dsn("postgres://gate:hunter2@db:5432/sessiongate");
        assert_eq!(redacted, "postgres://gate:REDACTED@db:5432/sessiongate");
    }

    #[test]
    fn redact_dsn_keeps_passwordless_dsn() {
        let dsn = "postgres://db:5432/sessiongate";
        assert_eq!(redact_dsn(dsn), dsn);
        assert_eq!(redact_dsn("::not a dsn::"), "invalid-dsn");
    }
}

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::auth::{Credentials, CredentialsError};

/// What to do when a collaborator service cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Proceed as if the check passed, and log a warning.
    FailOpen,
    /// Reject the request with `DependencyUnavailable`.
    FailClosed,
}

impl DependencyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyPolicy::FailOpen => "fail_open",
            DependencyPolicy::FailClosed => "fail_closed",
        }
    }
}

/// Engine-facing booking rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRules {
    pub cancel_lead_time_ms: i64,
    pub min_session_ms: i64,
    pub min_class_ms: i64,
    pub reoffer_cancelled_sessions: bool,
    pub require_availability: bool,
    pub identity_policy: DependencyPolicy,
    pub entitlement_policy: DependencyPolicy,
}

impl Default for BookingRules {
    fn default() -> Self {
        Self {
            cancel_lead_time_ms: 24 * 3_600_000,
            min_session_ms: 30 * 60_000,
            min_class_ms: 15 * 60_000,
            reoffer_cancelled_sessions: true,
            require_availability: false,
            identity_policy: DependencyPolicy::FailClosed,
            entitlement_policy: DependencyPolicy::FailClosed,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    pub bind: String,
    pub port: u16,
    pub data_dir: String,
    pub password: String,
    /// `name:password` pairs, comma separated. Listed logins must use their
    /// own password instead of `password`.
    pub logins: Option<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Unset means every user and trainer id is accepted.
    pub user_service_url: Option<String>,
    /// Unset means every member has unlimited sessions.
    pub subscription_service_url: Option<String>,
    pub identity_policy: DependencyPolicy,
    pub entitlement_policy: DependencyPolicy,
    pub collaborator_timeout_ms: u64,
    pub cancel_lead_time_hours: u32,
    pub min_session_minutes: u32,
    pub min_class_minutes: u32,
    pub reoffer_cancelled_sessions: bool,
    pub require_availability: bool,
}

impl Settings {
    /// Defaults, then `gymbook.toml` if present, then `GYMBOOK_*` variables
    /// (a `.env` file is loaded first).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Config::builder()
            .set_default("bind", "0.0.0.0")?
            .set_default("port", 5433)?
            .set_default("data_dir", "./data")?
            .set_default("password", "gymbook")?
            .set_default("max_connections", 256)?
            .set_default("compact_threshold", 1000)?
            .set_default("identity_policy", "fail_closed")?
            .set_default("entitlement_policy", "fail_closed")?
            .set_default("collaborator_timeout_ms", 2000)?
            .set_default("cancel_lead_time_hours", 24)?
            .set_default("min_session_minutes", 30)?
            .set_default("min_class_minutes", 15)?
            .set_default("reoffer_cancelled_sessions", true)?
            .set_default("require_availability", false)?
            .add_source(File::with_name("gymbook").required(false))
            .add_source(Environment::with_prefix("GYMBOOK").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn credentials(&self) -> Result<Credentials, CredentialsError> {
        Credentials::shared(self.password.clone()).with_logins(self.logins.as_deref().unwrap_or(""))
    }

    pub fn rules(&self) -> BookingRules {
        BookingRules {
            cancel_lead_time_ms: i64::from(self.cancel_lead_time_hours) * 3_600_000,
            min_session_ms: i64::from(self.min_session_minutes) * 60_000,
            min_class_ms: i64::from(self.min_class_minutes) * 60_000,
            reoffer_cancelled_sessions: self.reoffer_cancelled_sessions,
            require_availability: self.require_availability,
            identity_policy: self.identity_policy,
            entitlement_policy: self.entitlement_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "GYMBOOK_PORT",
        "GYMBOOK_IDENTITY_POLICY",
        "GYMBOOK_CANCEL_LEAD_TIME_HOURS",
        "GYMBOOK_REOFFER_CANCELLED_SESSIONS",
        "GYMBOOK_USER_SERVICE_URL",
        "GYMBOOK_LOGINS",
    ];

    fn clear() {
        for var in VARS {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn defaults_match_booking_rules() {
        clear();
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.port, 5433);
        assert_eq!(settings.identity_policy, DependencyPolicy::FailClosed);
        assert!(settings.user_service_url.is_none());
        assert_eq!(settings.rules(), BookingRules::default());
    }

    #[test]
    #[serial]
    fn environment_overrides() {
        clear();
        unsafe {
            std::env::set_var("GYMBOOK_PORT", "6543");
            std::env::set_var("GYMBOOK_IDENTITY_POLICY", "fail_open");
            std::env::set_var("GYMBOOK_CANCEL_LEAD_TIME_HOURS", "48");
            std::env::set_var("GYMBOOK_REOFFER_CANCELLED_SESSIONS", "false");
            std::env::set_var("GYMBOOK_USER_SERVICE_URL", "http://users:3001");
        }
        let settings = Settings::from_env().unwrap();
        clear();

        assert_eq!(settings.port, 6543);
        assert_eq!(settings.user_service_url.as_deref(), Some("http://users:3001"));
        let rules = settings.rules();
        assert_eq!(rules.identity_policy, DependencyPolicy::FailOpen);
        assert_eq!(rules.cancel_lead_time_ms, 48 * 3_600_000);
        assert!(!rules.reoffer_cancelled_sessions);
    }

    #[test]
    #[serial]
    fn named_logins_from_environment() {
        clear();
        unsafe { std::env::set_var("GYMBOOK_LOGINS", "kiosk:k1,trainer-app:t2") };
        let settings = Settings::from_env().unwrap();
        clear();

        let creds = settings.credentials().unwrap();
        assert_eq!(creds.named_logins(), 2);
        assert_eq!(creds.password_for(Some("kiosk")), "k1");
        assert_eq!(creds.password_for(Some("frontdesk")), settings.password);
    }
}

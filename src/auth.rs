use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialsError {
    #[error("login entry {0:?} is not of the form name:password")]
    Malformed(String),
    #[error("login {0:?} listed twice")]
    Duplicate(String),
}

/// Who may open a wire session. Named logins (a trainer app, a kiosk) carry
/// their own password; any other login name uses the shared one.
#[derive(Debug, Clone)]
pub struct Credentials {
    shared: String,
    logins: HashMap<String, String>,
}

impl Credentials {
    pub fn shared(password: impl Into<String>) -> Self {
        Self {
            shared: password.into(),
            logins: HashMap::new(),
        }
    }

    /// Add `name:password` entries separated by commas. Blank entries are
    /// skipped; the password may itself contain a colon.
    pub fn with_logins(mut self, list: &str) -> Result<Self, CredentialsError> {
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((name, password)) = entry.split_once(':') else {
                return Err(CredentialsError::Malformed(entry.to_string()));
            };
            let name = name.trim();
            if name.is_empty() || password.is_empty() {
                return Err(CredentialsError::Malformed(entry.to_string()));
            }
            if self.logins.insert(name.to_string(), password.to_string()).is_some() {
                return Err(CredentialsError::Duplicate(name.to_string()));
            }
        }
        Ok(self)
    }

    pub fn password_for(&self, user: Option<&str>) -> &str {
        user.and_then(|u| self.logins.get(u))
            .map_or(self.shared.as_str(), String::as_str)
    }

    pub fn named_logins(&self) -> usize {
        self.logins.len()
    }
}

/// Cleartext password lookup for the pgwire startup handler.
#[derive(Debug, Clone)]
pub struct GymbookAuthSource {
    credentials: Arc<Credentials>,
}

impl GymbookAuthSource {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for GymbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user();
        debug!(user = user.unwrap_or(""), host = login.host(), "password lookup");
        let password = self.credentials.password_for(user);
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_logins_override_the_shared_password() {
        let creds = Credentials::shared("gymbook")
            .with_logins("kiosk:k1, trainer-app:t:2,")
            .unwrap();
        assert_eq!(creds.named_logins(), 2);
        assert_eq!(creds.password_for(Some("kiosk")), "k1");
        assert_eq!(creds.password_for(Some("trainer-app")), "t:2");
        assert_eq!(creds.password_for(Some("frontdesk")), "gymbook");
        assert_eq!(creds.password_for(None), "gymbook");
    }

    #[test]
    fn bad_login_lists_are_rejected() {
        let base = || Credentials::shared("gymbook");
        assert_eq!(
            base().with_logins("kiosk").unwrap_err(),
            CredentialsError::Malformed("kiosk".into())
        );
        assert_eq!(
            base().with_logins(":secret").unwrap_err(),
            CredentialsError::Malformed(":secret".into())
        );
        assert_eq!(
            base().with_logins("kiosk:a,kiosk:b").unwrap_err(),
            CredentialsError::Duplicate("kiosk".into())
        );
        assert_eq!(base().with_logins("").unwrap().named_logins(), 0);
    }

    #[tokio::test]
    async fn auth_source_answers_per_login() {
        let creds = Credentials::shared("gymbook").with_logins("kiosk:k1").unwrap();
        let source = GymbookAuthSource::new(Arc::new(creds));

        let kiosk = LoginInfo::new(Some("kiosk"), Some("gym"), "127.0.0.1".to_string());
        let pass = source.get_password(&kiosk).await.unwrap();
        assert_eq!(pass.password(), b"k1");
        assert!(pass.salt().is_none());

        let desk = LoginInfo::new(Some("frontdesk"), Some("gym"), "127.0.0.1".to_string());
        assert_eq!(source.get_password(&desk).await.unwrap().password(), b"gymbook");
    }
}

//! Identity and entitlement lookups against the user and subscription services.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0} from {1}")]
    Status(u16, String),
}

/// Personal-training sessions a subscription grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allowance {
    Unlimited,
    PerMonth(u32),
    Inactive,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn user_exists(&self, id: Ulid) -> Result<bool, DirectoryError>;
    async fn trainer_exists(&self, id: Ulid) -> Result<bool, DirectoryError>;
}

#[async_trait]
pub trait Entitlements: Send + Sync {
    async fn session_allowance(&self, user_id: Ulid) -> Result<Allowance, DirectoryError>;
}

fn http_client(timeout: Duration) -> Result<Client, DirectoryError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

// ── HTTP ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExistsResponse {
    exists: bool,
}

/// Asks the user service `GET /users/{id}/exists`. Trainers are users, so the
/// same endpoint answers both questions.
#[derive(Clone)]
pub struct HttpDirectory {
    client: Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }

    async fn exists(&self, id: Ulid) -> Result<bool, DirectoryError> {
        let url = format!("{}/users/{id}/exists", self.base_url);
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(response.json::<ExistsResponse>().await?.exists),
            s => Err(DirectoryError::Status(s.as_u16(), url)),
        }
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn user_exists(&self, id: Ulid) -> Result<bool, DirectoryError> {
        self.exists(id).await
    }

    async fn trainer_exists(&self, id: Ulid) -> Result<bool, DirectoryError> {
        self.exists(id).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Plan {
    personal_training_sessions: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    status: String,
    plan: Option<Plan>,
}

/// Asks the subscription service `GET /subscriptions/user/{id}/active`.
#[derive(Clone)]
pub struct HttpEntitlements {
    client: Client,
    base_url: String,
}

impl HttpEntitlements {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl Entitlements for HttpEntitlements {
    async fn session_allowance(&self, user_id: Ulid) -> Result<Allowance, DirectoryError> {
        let url = format!("{}/subscriptions/user/{user_id}/active", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Allowance::Inactive);
        }
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16(), url));
        }
        let body: SubscriptionResponse = response.json().await?;
        if body.status != "active" {
            return Ok(Allowance::Inactive);
        }
        let sessions = body
            .plan
            .and_then(|p| p.personal_training_sessions)
            .unwrap_or(0);
        Ok(Allowance::PerMonth(sessions.clamp(0, u32::MAX as i64) as u32))
    }
}

// ── In-memory ────────────────────────────────────────────────────

/// Fixed set of known ids. `permissive()` knows everyone.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: DashSet<Ulid>,
    trainers: DashSet<Ulid>,
    permissive: bool,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::default()
        }
    }

    pub fn add_user(&self, id: Ulid) {
        self.users.insert(id);
    }

    pub fn add_trainer(&self, id: Ulid) {
        self.trainers.insert(id);
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn user_exists(&self, id: Ulid) -> Result<bool, DirectoryError> {
        Ok(self.permissive || self.users.contains(&id))
    }

    async fn trainer_exists(&self, id: Ulid) -> Result<bool, DirectoryError> {
        Ok(self.permissive || self.trainers.contains(&id))
    }
}

/// Per-user allowances; users without an entry get `fallback`.
#[derive(Debug)]
pub struct StaticEntitlements {
    allowances: DashMap<Ulid, Allowance>,
    fallback: Allowance,
}

impl StaticEntitlements {
    pub fn unlimited() -> Self {
        Self {
            allowances: DashMap::new(),
            fallback: Allowance::Unlimited,
        }
    }

    pub fn set(&self, user_id: Ulid, allowance: Allowance) {
        self.allowances.insert(user_id, allowance);
    }
}

impl Default for StaticEntitlements {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[async_trait]
impl Entitlements for StaticEntitlements {
    async fn session_allowance(&self, user_id: Ulid) -> Result<Allowance, DirectoryError> {
        Ok(self
            .allowances
            .get(&user_id)
            .map(|a| *a)
            .unwrap_or(self.fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn http_directory_reads_exists_flag() {
        let server = MockServer::start();
        let known = Ulid::new();
        let unknown = Ulid::new();
        server.mock(|when, then| {
            when.method(GET).path(format!("/users/{known}/exists"));
            then.status(200).json_body(serde_json::json!({ "exists": true }));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/users/{unknown}/exists"));
            then.status(404).json_body(serde_json::json!({ "exists": false }));
        });

        let dir = HttpDirectory::new(&server.base_url(), TIMEOUT).unwrap();
        assert!(dir.user_exists(known).await.unwrap());
        assert!(dir.trainer_exists(known).await.unwrap());
        assert!(!dir.user_exists(unknown).await.unwrap());
    }

    #[tokio::test]
    async fn http_directory_server_error_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path_matches("/users/");
            then.status(503);
        });
        let dir = HttpDirectory::new(&server.base_url(), TIMEOUT).unwrap();
        let err = dir.user_exists(Ulid::new()).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Status(503, _)));
    }

    #[tokio::test]
    async fn http_entitlements_active_plan() {
        let server = MockServer::start();
        let user = Ulid::new();
        server.mock(|when, then| {
            when.method(GET).path(format!("/subscriptions/user/{user}/active"));
            then.status(200).json_body(serde_json::json!({
                "status": "active",
                "plan": { "name": "Premium", "personalTrainingSessions": 4 }
            }));
        });
        let ent = HttpEntitlements::new(&format!("{}/", server.base_url()), TIMEOUT).unwrap();
        assert_eq!(ent.session_allowance(user).await.unwrap(), Allowance::PerMonth(4));
    }

    #[tokio::test]
    async fn http_entitlements_inactive_or_missing() {
        let server = MockServer::start();
        let expired = Ulid::new();
        let none = Ulid::new();
        server.mock(|when, then| {
            when.method(GET).path(format!("/subscriptions/user/{expired}/active"));
            then.status(200).json_body(serde_json::json!({ "status": "expired", "plan": null }));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/subscriptions/user/{none}/active"));
            then.status(404);
        });
        let ent = HttpEntitlements::new(&server.base_url(), TIMEOUT).unwrap();
        assert_eq!(ent.session_allowance(expired).await.unwrap(), Allowance::Inactive);
        assert_eq!(ent.session_allowance(none).await.unwrap(), Allowance::Inactive);
    }

    #[tokio::test]
    async fn http_entitlements_plan_without_sessions() {
        let server = MockServer::start();
        let user = Ulid::new();
        server.mock(|when, then| {
            when.method(GET).path(format!("/subscriptions/user/{user}/active"));
            then.status(200).json_body(serde_json::json!({ "status": "active", "plan": {} }));
        });
        let ent = HttpEntitlements::new(&server.base_url(), TIMEOUT).unwrap();
        assert_eq!(ent.session_allowance(user).await.unwrap(), Allowance::PerMonth(0));
    }

    #[tokio::test]
    async fn unreachable_service_is_an_http_error() {
        // Nothing listens on port 9 locally.
        let dir = HttpDirectory::new("http://127.0.0.1:9", Duration::from_millis(300)).unwrap();
        assert!(matches!(
            dir.user_exists(Ulid::new()).await,
            Err(DirectoryError::Http(_))
        ));
    }

    #[tokio::test]
    async fn static_directory_modes() {
        let dir = StaticDirectory::new();
        let user = Ulid::new();
        dir.add_user(user);
        assert!(dir.user_exists(user).await.unwrap());
        assert!(!dir.trainer_exists(user).await.unwrap());
        assert!(StaticDirectory::permissive().trainer_exists(Ulid::new()).await.unwrap());
    }

    #[tokio::test]
    async fn static_entitlements_fallback() {
        let ent = StaticEntitlements::unlimited();
        let capped = Ulid::new();
        ent.set(capped, Allowance::PerMonth(2));
        assert_eq!(ent.session_allowance(capped).await.unwrap(), Allowance::PerMonth(2));
        assert_eq!(ent.session_allowance(Ulid::new()).await.unwrap(), Allowance::Unlimited);
    }
}

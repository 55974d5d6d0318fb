use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GinError, Result};
use crate::token::TokenStore;

/// Account record as served by `/api/accounts/{login}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub url: Option<String>,
    pub uuid: String,
    pub login: String,
    #[serde(default)]
    pub title: Option<String>,
    pub first_name: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    pub last_name: String,
    #[serde(default)]
    pub affiliation: Option<Affiliation>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Institutional affiliation of an account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affiliation {
    pub institute: String,
    pub department: String,
    pub city: String,
    pub country: String,
    #[serde(default)]
    pub is_public: bool,
}

/// Public SSH key registered for an account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    #[serde(default)]
    pub url: Option<String>,
    pub fingerprint: String,
    pub key: String,
    pub description: String,
    pub login: String,
    #[serde(default)]
    pub account_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Request body for key registration
#[derive(Debug, Serialize)]
struct NewSshKey<'a> {
    key: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    public: bool,
}

/// Client for the account and key endpoints of the GIN web service
#[derive(Debug, Clone)]
pub struct AccountClient {
    http: Client,
    base_url: String,
    tokens: TokenStore,
}

impl AccountClient {
    /// Create a client for the service at `base_url`, authenticating with
    /// whatever session `tokens` holds
    pub fn new(base_url: impl Into<String>, tokens: TokenStore) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            tokens,
        }
    }

    /// Build `{base}/api/accounts/{login}[/suffix...]` with each segment escaped
    fn endpoint(&self, login: &str, suffix: &[&str]) -> Result<Url> {
        if self.base_url.trim().is_empty() {
            return Err(GinError::Connection("no server address configured".to_string()));
        }

        let mut url = Url::parse(&self.base_url).map_err(|e| {
            GinError::Connection(format!("invalid server address '{}': {}", self.base_url, e))
        })?;

        url.path_segments_mut()
            .map_err(|_| {
                GinError::Connection(format!("invalid server address '{}'", self.base_url))
            })?
            .pop_if_empty()
            .extend(["api", "accounts", login])
            .extend(suffix);

        Ok(url)
    }

    /// Look up an account; no authentication required
    pub async fn request_account(&self, login: &str) -> Result<Account> {
        let url = self.endpoint(login, &[])?;
        debug!("Requesting account info: {}", url);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| GinError::Connection(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(GinError::NotFound(format!("account '{}'", login)));
        }

        let response = ensure_success(response).await?;
        parse_body(response).await
    }

    /// List the SSH keys of the logged-in user
    pub async fn get_user_keys(&self) -> Result<Vec<SshKey>> {
        let session = self.tokens.load_token()?;
        let url = self.endpoint(&session.username, &["keys"])?;
        debug!("Requesting keys for {}: {}", session.username, url);

        let response = self
            .http
            .get(url)
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(|e| GinError::Connection(e.to_string()))?;

        let response = ensure_success(response).await?;
        let keys: Vec<SshKey> = parse_body(response).await?;

        debug!("Found {} keys for {}", keys.len(), session.username);
        Ok(keys)
    }

    /// Register a public key for the logged-in user.
    ///
    /// The server may process registration asynchronously, so any 2xx
    /// (typically 202 Accepted) counts as success.
    pub async fn add_key(&self, key: &str, description: &str, public: bool) -> Result<()> {
        let session = self.tokens.load_token()?;
        let url = self.endpoint(&session.username, &["keys"])?;
        debug!("Adding key '{}' for {}", description, session.username);

        let body = NewSshKey {
            key,
            description,
            public,
        };

        let response = self
            .http
            .post(url)
            .bearer_auth(&session.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GinError::Connection(e.to_string()))?;

        ensure_success(response).await?;
        info!("Registered key '{}' for {}", description, session.username);
        Ok(())
    }

}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    // Best effort; the status is what matters
    let message = response.text().await.unwrap_or_default();
    Err(GinError::RequestFailed {
        status: status.as_u16(),
        message: message.trim().to_string(),
    })
}

async fn parse_body<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response
        .bytes()
        .await
        .map_err(|e| GinError::Connection(format!("failed to read response body: {}", e)))?;

    serde_json::from_slice(&body).map_err(|e| GinError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_account_without_affiliation_parses_as_absent() {
        let json = r#"{"url":"test_server/api/accounts/alice","uuid":"alice_test_uuid","login":"alice","title":null,"first_name":"Alice","middle_name":null,"last_name":"Goodwill","created_at":"2016-11-10T12:26:04.57208Z","updated_at":"2016-11-10T12:26:04.57208+01:00"}"#;
        let account: Account = serde_json::from_str(json).unwrap();

        assert_eq!(account.login, "alice");
        assert_eq!(account.title, None);
        assert_eq!(account.middle_name, None);
        assert_eq!(account.affiliation, None);
        assert!(account.created_at.is_some());
    }

    #[test]
    fn test_empty_affiliation_is_distinct_from_absent() {
        let json = r#"{"uuid":"u","login":"l","first_name":"f","last_name":"l","affiliation":{"institute":"","department":"","city":"","country":""}}"#;
        let account: Account = serde_json::from_str(json).unwrap();
        assert_eq!(account.affiliation, Some(Affiliation::default()));
    }

    #[test]
    fn test_new_key_body() {
        let body = NewSshKey {
            key: "ssh-rsa AAA",
            description: "laptop",
            public: false,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"key": "ssh-rsa AAA", "description": "laptop"})
        );
    }

    #[test]
    fn test_endpoint_escapes_login() {
        let client = AccountClient::new("http://localhost:3000/", TokenStore::unresolved());
        let url = client.endpoint("I don't exist", &["keys"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:3000/api/accounts/I%20don't%20exist/keys"
        );
    }

    #[test]
    fn test_endpoint_rejects_empty_base() {
        let client = AccountClient::new("", TokenStore::unresolved());
        assert_matches!(client.endpoint("alice", &[]), Err(GinError::Connection(_)));
    }
}

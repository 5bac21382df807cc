//! reqwest adapter for the identity backend's REST API.

use crate::config::IdentityConfig;
use crate::error::IdentityError;
use crate::identity::{Credentials, IdentityProvider, LoginGrant, Registration};
use crate::session::TokenPair;
use async_trait::async_trait;
use gatekeeper_access::{Principal, Role};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    email: &'a str,
    password: &'a str,
    first_name: &'a str,
    last_name: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct ForgotPasswordRequest<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct ResetPasswordRequest<'a> {
    token: &'a str,
    new_password: &'a str,
}

/// Body of login and refresh responses.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Access token lifetime in seconds.
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    user: Option<WireUser>,
}

impl TokenResponse {
    fn token_pair(&self) -> TokenPair {
        TokenPair {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone().filter(|token| !token.is_empty()),
            expires_in: self
                .expires_in
                .filter(|secs| *secs > 0)
                .and_then(chrono::Duration::try_seconds),
        }
    }
}

/// User record as the backend sends it.
#[derive(Debug, Deserialize)]
struct WireUser {
    id: serde_json::Value,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    primary_role: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    custom_permissions: Vec<String>,
    #[serde(default)]
    status: Option<String>,
}

impl WireUser {
    fn into_principal(self) -> Result<Principal, IdentityError> {
        let id = match &self.id {
            serde_json::Value::String(id) if !id.trim().is_empty() => id.trim().to_string(),
            serde_json::Value::Number(id) => id.to_string(),
            _ => {
                return Err(IdentityError::InvalidResponse {
                    reason: "user record has no id".to_string(),
                });
            }
        };
        let primary = self
            .primary_role
            .as_deref()
            .or(self.role.as_deref())
            .filter(|tag| !tag.trim().is_empty())
            .ok_or_else(|| IdentityError::InvalidResponse {
                reason: format!("user {id} has no role"),
            })?;

        let name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or_default(),
            self.last_name.as_deref().unwrap_or_default()
        );
        let active = self
            .status
            .as_deref()
            .is_none_or(|status| status.eq_ignore_ascii_case("active"));

        let mut builder = Principal::builder(id, Role::parse(primary)).active(active);
        for tag in self.role.iter().chain(&self.roles) {
            if !tag.trim().is_empty() {
                builder = builder.role(Role::parse(tag));
            }
        }
        if let Some(tenant) = self.tenant_id.filter(|tenant| !tenant.trim().is_empty()) {
            builder = builder.tenant(tenant);
        }
        for grant in self.custom_permissions {
            builder = builder.grant(grant);
        }
        let display_name = match name.trim() {
            "" => self.email.clone(),
            name => Some(name.to_string()),
        };
        if let Some(display_name) = display_name {
            builder = builder.display_name(display_name);
        }
        if let Some(email) = self.email {
            builder = builder.email(email);
        }
        Ok(builder.build())
    }
}

/// Error body the backend sends with non-2xx responses.
#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn status_error(code: u16, body: &str) -> IdentityError {
    let parsed: ErrorResponse = serde_json::from_str(body).unwrap_or_default();
    IdentityError::Status {
        code,
        error: parsed.error,
        message: parsed.message,
    }
}

fn transport_error(e: &reqwest::Error) -> IdentityError {
    if e.is_timeout() {
        IdentityError::Timeout
    } else {
        IdentityError::Network {
            reason: e.to_string(),
        }
    }
}

/// Identity backend client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpIdentityClient {
    http: reqwest::Client,
    config: IdentityConfig,
}

impl HttpIdentityClient {
    /// Builds a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: IdentityConfig) -> gatekeeper_core::Result<Self, IdentityError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| IdentityError::Network {
                reason: e.to_string(),
            })?;
        Ok(Self { http, config })
    }

    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response, IdentityError> {
        let mut request = self.http.post(self.config.url(path)).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| transport_error(&e))?;
        Self::check(response).await
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, IdentityError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "Identity backend returned an error");
        Err(status_error(status.as_u16(), &body))
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, IdentityError> {
        response
            .json::<T>()
            .await
            .map_err(|e| IdentityError::InvalidResponse {
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityClient {
    #[instrument(skip_all)]
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, IdentityError> {
        let request = LoginRequest {
            email: &credentials.email,
            password: &credentials.password,
        };
        let response = self
            .post(&self.config.endpoints.login, &request, None)
            .await?;
        let body: TokenResponse = Self::read(response).await?;
        let tokens = body.token_pair();
        let user = body.user.ok_or_else(|| IdentityError::InvalidResponse {
            reason: "login response has no user".to_string(),
        })?;
        Ok(LoginGrant {
            tokens,
            principal: user.into_principal()?,
        })
    }

    #[instrument(skip_all)]
    async fn register(&self, registration: &Registration) -> Result<(), IdentityError> {
        let (first_name, last_name) = registration.name_parts();
        let request = RegisterRequest {
            email: registration.email.trim(),
            password: &registration.password,
            first_name,
            last_name,
        };
        self.post(&self.config.endpoints.register, &request, None)
            .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn validate(&self, access_token: &str) -> Result<Principal, IdentityError> {
        let response = self
            .http
            .get(self.config.url(&self.config.endpoints.profile))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let user: WireUser = Self::read(Self::check(response).await?).await?;
        user.into_principal()
    }

    #[instrument(skip_all)]
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, IdentityError> {
        let response = self
            .post(
                &self.config.endpoints.refresh,
                &RefreshRequest { refresh_token },
                None,
            )
            .await?;
        let body: TokenResponse = Self::read(response).await?;
        Ok(body.token_pair())
    }

    #[instrument(skip_all)]
    async fn logout(&self, access_token: &str) -> Result<(), IdentityError> {
        self.post(
            &self.config.endpoints.logout,
            &serde_json::json!({}),
            Some(access_token),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn forgot_password(&self, email: &str) -> Result<(), IdentityError> {
        self.post(
            &self.config.endpoints.forgot_password,
            &ForgotPasswordRequest { email },
            None,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn reset_password(
        &self,
        reset_token: &str,
        new_password: &str,
    ) -> Result<(), IdentityError> {
        let request = ResetPasswordRequest {
            token: reset_token,
            new_password,
        };
        self.post(&self.config.endpoints.reset_password, &request, None)
            .await?;
        Ok(())
    }
}

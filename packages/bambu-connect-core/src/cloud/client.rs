use super::{CloudAuth, CloudDevices};
use crate::auth::{jwt, LoginCredentials, TokenGrant};
use crate::error::CloudError;
use crate::registry::CloudDeviceReport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER, SET_COOKIE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.bambulab.com";

const LOGIN_PATH: &str = "/v1/user-service/user/login";
const REFRESH_PATH: &str = "/v1/user-service/user/refreshtoken";

/// Used when neither the body, the cookies nor the JWT say otherwise.
const DEFAULT_ACCESS_LIFETIME_SECS: i64 = 24 * 60 * 60;
const DEFAULT_REFRESH_LIFETIME_SECS: i64 = 90 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct BambuCloudClient {
    base_url: String,
    /// Absolute login endpoint. Defaults to the API's user-service login.
    login_url: String,
    client: reqwest::Client,
}

impl BambuCloudClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            login_url: format!("{}{}", base_url, LOGIN_PATH),
            base_url,
            client,
        })
    }

    /// Log in somewhere other than the API host, e.g. the web sign-in form
    /// (`https://bambulab.com/api/sign-in/form`), which answers with cookies.
    pub fn with_login_url(mut self, login_url: impl Into<String>) -> Self {
        self.login_url = login_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    async fn request_tokens<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<TokenGrant, CloudError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(network_error)?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            // Token endpoints answer a bad or revoked credential with 400.
            if status == StatusCode::BAD_REQUEST {
                return Err(CloudError::Rejected(format!("{}: {}", status, body)));
            }
            return Err(error_for_status(status, &headers, body));
        }

        let cookies: Vec<String> = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        let text = resp.text().await.map_err(network_error)?;

        grant_from_response(&cookies, &text, Utc::now())
    }
}

#[async_trait]
impl CloudAuth for BambuCloudClient {
    async fn login(&self, credentials: &LoginCredentials) -> Result<TokenGrant, CloudError> {
        tracing::debug!("Logging in to Bambu cloud");
        self.request_tokens(
            &self.login_url,
            &LoginRequest {
                account: &credentials.account,
                password: &credentials.password,
            },
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, CloudError> {
        tracing::debug!("Refreshing Bambu cloud access token");
        let url = format!("{}{}", self.base_url, REFRESH_PATH);
        self.request_tokens(&url, &RefreshRequest { refresh_token })
        .await
    }
}

#[async_trait]
impl CloudDevices for BambuCloudClient {
    async fn fetch_cloud_devices(
        &self,
        access_token: &str,
    ) -> Result<Vec<CloudDeviceReport>, CloudError> {
        let url = format!("{}/v1/iot-service/api/user/bind", self.base_url);

        let resp = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(network_error)?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            return Err(error_for_status(status, &headers, body));
        }

        let text = resp.text().await.map_err(network_error)?;
        let body: DeviceListResponse = serde_json::from_str(&text)
            .map_err(|e| CloudError::InvalidResponse(format!("device list: {}", e)))?;

        if let Some(error) = body.error.filter(|e| !e.is_empty()) {
            return Err(CloudError::InvalidResponse(format!("device list error: {}", error)));
        }

        tracing::debug!("Cloud returned {} device(s)", body.devices.len());
        Ok(body.devices)
    }
}

fn network_error(e: reqwest::Error) -> CloudError {
    if e.is_timeout() {
        CloudError::Transient(format!("request timed out: {}", e))
    } else {
        CloudError::Transient(e.to_string())
    }
}

fn error_for_status(status: StatusCode, headers: &HeaderMap, body: String) -> CloudError {
    tracing::debug!("Bambu cloud returned status {}", status);
    match status.as_u16() {
        401 | 403 => CloudError::Rejected(format!("{}: {}", status, body)),
        429 => CloudError::RateLimited {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        408 => CloudError::Transient(format!("server returned {}", status)),
        _ if status.is_server_error() => {
            CloudError::Transient(format!("server returned {}", status))
        }
        // The request itself is wrong; repeating it will not help.
        _ => CloudError::InvalidResponse(format!("unexpected status {}: {}", status, body)),
    }
}

/// Build a token pair from a login or refresh response. Tokens may come in the
/// JSON body or as `token` / `refreshToken` cookies.
fn grant_from_response(
    cookies: &[String],
    text: &str,
    now: DateTime<Utc>,
) -> Result<TokenGrant, CloudError> {
    let body: TokenResponse = if text.trim().is_empty() {
        TokenResponse::default()
    } else {
        serde_json::from_str(text)
            .map_err(|e| CloudError::InvalidResponse(format!("token response: {}", e)))?
    };

    let access_cookie = find_cookie(cookies, "token");
    let refresh_cookie = find_cookie(cookies, "refreshToken");

    let access_token = non_empty(body.access_token)
        .or_else(|| access_cookie.as_ref().map(|c| c.value.clone()))
        .ok_or_else(|| missing_token(body.login_type.as_deref(), "access"))?;
    let refresh_token = non_empty(body.refresh_token)
        .or_else(|| refresh_cookie.as_ref().map(|c| c.value.clone()))
        .ok_or_else(|| missing_token(body.login_type.as_deref(), "refresh"))?;

    let access_token_expires_at = lifetime(body.expires_in, access_cookie.as_ref())
        .map(|secs| now + ChronoDuration::seconds(secs))
        .or_else(|| jwt::expiry_from_jwt(&access_token))
        .unwrap_or(now + ChronoDuration::seconds(DEFAULT_ACCESS_LIFETIME_SECS));
    let refresh_token_expires_at = lifetime(body.refresh_expires_in, refresh_cookie.as_ref())
        .map(|secs| now + ChronoDuration::seconds(secs))
        .or_else(|| jwt::expiry_from_jwt(&refresh_token))
        .unwrap_or(now + ChronoDuration::seconds(DEFAULT_REFRESH_LIFETIME_SECS));

    Ok(TokenGrant {
        access_token,
        access_token_expires_at,
        refresh_token,
        refresh_token_expires_at,
    })
}

fn missing_token(login_type: Option<&str>, which: &str) -> CloudError {
    match login_type {
        // Accounts with email verification or 2FA get a challenge instead of tokens.
        Some(kind) if !kind.is_empty() => {
            CloudError::Rejected(format!("login requires interactive step: {}", kind))
        }
        _ => CloudError::InvalidResponse(format!("response carried no {} token", which)),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn lifetime(body_secs: Option<i64>, cookie: Option<&Cookie>) -> Option<i64> {
    body_secs
        .filter(|secs| *secs > 0)
        .or_else(|| cookie.and_then(|c| c.max_age).filter(|secs| *secs > 0))
}

#[derive(Debug, Clone, PartialEq)]
struct Cookie {
    value: String,
    max_age: Option<i64>,
}

fn find_cookie(cookies: &[String], name: &str) -> Option<Cookie> {
    cookies.iter().find_map(|header| {
        let mut parts = header.split(';').map(str::trim);
        let (key, value) = parts.next()?.split_once('=')?;
        if key != name || value.is_empty() {
            return None;
        }
        let max_age = parts
            .filter_map(|attr| attr.split_once('='))
            .find(|(k, _)| k.eq_ignore_ascii_case("max-age"))
            .and_then(|(_, v)| v.parse().ok());
        Some(Cookie {
            value: value.to_string(),
            max_age,
        })
    })
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    account: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_expires_in: Option<i64>,
    #[serde(default)]
    login_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceListResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    devices: Vec<CloudDeviceReport>,
}

//! WAL session login
//!
//! Exchanges a persona access token for a Blaze session ticket. The endpoint
//! answers 200 with a `userLoginInfo` object on success; anything else is a
//! failed mint. 401/403 mean the access token itself is no longer accepted.

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::constants::{APPLICATION_KEY, USER_AGENT};
use crate::error::{Error, Result};

/// Session ticket issued by the WAL login endpoint.
#[derive(Debug, Clone)]
pub struct SessionLogin {
    pub ticket: Secret<String>,
    pub blaze_id: u64,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    user_login_info: UserLoginInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserLoginInfo {
    session_key: String,
    blaze_id: u64,
    #[serde(default)]
    persona_details: Option<PersonaDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonaDetails {
    display_name: Option<String>,
}

/// POST the access token to `endpoint` and return the issued session ticket.
pub async fn login(
    client: &reqwest::Client,
    endpoint: &str,
    access_token: &str,
    product_name: &str,
    blaze_service: &str,
) -> Result<SessionLogin> {
    let response = client
        .post(endpoint)
        .header("Accept", "application/json")
        .header("Accept-Charset", "UTF-8")
        .header("X-BLAZE-ID", blaze_service)
        .header("X-BLAZE-VOID-RESP", "XML")
        .header("X-Application-Key", APPLICATION_KEY)
        .header("User-Agent", USER_AGENT)
        .json(&serde_json::json!({
            "accessToken": access_token,
            "productName": product_name,
        }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("session login request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "access token rejected ({status}): {body}"
            )));
        }

        return Err(Error::Login(format!("login endpoint returned {status}: {body}")));
    }

    let body = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading login response: {e}")))?;
    let parsed: LoginResponse = serde_json::from_str(&body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        Error::Login(format!("unexpected login response ({e}): {preview}"))
    })?;

    let info = parsed.user_login_info;
    if info.session_key.is_empty() {
        return Err(Error::Login("login response carried an empty sessionKey".into()));
    }

    debug!(blaze_id = info.blaze_id, "session login succeeded");
    Ok(SessionLogin {
        ticket: Secret::new(info.session_key),
        blaze_id: info.blaze_id,
        display_name: info.persona_details.and_then(|p| p.display_name),
    })
}

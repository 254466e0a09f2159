//! HTTP lookup of the realtime host for an application.
//!
//! The lookup endpoint resolves the websocket host serving realtime traffic
//! for the current application. Lookup failures are reported to the caller
//! once; retries only happen through the disconnect-driven reconnect path.

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use crate::error::RtError;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Production lookup base URL.
pub const LOOKUP_BASE_URL: &str = "https://api.signalhub.io";

/// Resolves the realtime host for `app_id`.
///
/// The response body is the bare host, either raw or JSON-quoted.
pub async fn lookup_host(
    http: &Client,
    base_url: &str,
    app_id: &str,
    token: Option<&SecretString>,
) -> Result<String, RtError> {
    let endpoint = format!("{base_url}/{app_id}/rt/lookup");
    let mut builder = http.get(&endpoint);
    if let Some(token) = token {
        builder = builder.bearer_auth(token.expose_secret());
    }

    let response = builder.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(RtError::LookupStatus {
            status,
            body: summarize_error_body(&body),
        });
    }

    let host = serde_json::from_str::<String>(&body).unwrap_or_else(|_| body.trim().to_string());
    if host.is_empty() {
        return Err(RtError::Protocol(
            "lookup returned an empty realtime host".to_string(),
        ));
    }
    Ok(host)
}

/// Builds the websocket endpoint for a resolved realtime host.
pub fn realtime_endpoint(host: &str) -> String {
    format!("wss://{host}/v1/rt")
}

fn summarize_error_body(body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::realtime_endpoint;

    #[test]
    fn endpoint_wraps_host_in_wss_url() {
        assert_eq!(
            realtime_endpoint("rt-eu.signalhub.io"),
            "wss://rt-eu.signalhub.io/v1/rt"
        );
    }
}

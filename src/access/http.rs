//! HTTP access-manager client.
//!
//! Talks to the central manager API:
//!
//! - `POST /configure` → [`ServerConfigData`]
//! - `POST /status` → [`ServerCommand`]
//! - `POST /sessions` → [`SessionResponseEx`]
//! - `GET  /sessions/{id}?hostEndPoint=…&clientIp=…` → [`SessionResponseEx`]
//! - `POST /sessions/{id}/usage?closeSession=bool` → [`SessionResponseBase`]
//! - `GET  /certificates/{endpoint}` → raw PFX bytes
//!
//! Non-success statuses carry a JSON [`ApiError`] body.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::access::{
    AccessManager, ApiError, ServerCommand, ServerConfigData, ServerInfo, ServerStatus,
    SessionRequestEx, SessionResponseBase, SessionResponseEx,
};
use crate::error::{Error, Result};
use crate::util::Traffic;

/// Client for the HTTP access-manager API.
pub struct HttpAccessManager {
    base_url: String,
    client: reqwest::Client,
    /// Bearer token authenticating this server to the manager
    authorization: Option<String>,
}

impl HttpAccessManager {
    /// Create a client for `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>, authorization: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::AccessManager(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            authorization,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{path}", self.base_url));
        if let Some(auth) = &self.authorization {
            builder = builder.bearer_auth(auth);
        }
        builder
    }

    /// Fetch the PFX for a host endpoint. The TLS terminator in front of
    /// this crate consumes it; the core never parses certificates.
    pub async fn certificate_get(&self, endpoint: SocketAddr) -> Result<Vec<u8>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/certificates/{endpoint}"))
            .send()
            .await
            .map_err(|e| Error::AccessManager(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::AccessManager(response.status().to_string()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::AccessManager(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn send<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::AccessManager(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| Error::AccessManager(format!("bad response body: {e}")));
        }

        let api_error = response.json::<ApiError>().await.ok();
        match (status, api_error) {
            (reqwest::StatusCode::NOT_FOUND, Some(e)) => Err(Error::NotFound(e.message)),
            (reqwest::StatusCode::NOT_FOUND, None) => {
                Err(Error::NotFound(format!("manager returned {status}")))
            }
            (_, Some(e)) => Err(Error::AccessManager(format!(
                "{status}: {} ({})",
                e.message, e.exception_type_name
            ))),
            (_, None) => Err(Error::AccessManager(status.to_string())),
        }
    }
}

#[async_trait]
impl AccessManager for HttpAccessManager {
    async fn configure(&self, server_info: ServerInfo) -> Result<ServerConfigData> {
        self.send(
            self.request(reqwest::Method::POST, "/configure")
                .json(&server_info),
        )
        .await
    }

    async fn status(&self, status: ServerStatus) -> Result<ServerCommand> {
        self.send(self.request(reqwest::Method::POST, "/status").json(&status))
            .await
    }

    async fn session_create(&self, request: SessionRequestEx) -> Result<SessionResponseEx> {
        self.send(
            self.request(reqwest::Method::POST, "/sessions")
                .json(&request),
        )
        .await
    }

    async fn session_get(
        &self,
        session_id: u64,
        host_endpoint: SocketAddr,
        client_ip: Option<IpAddr>,
    ) -> Result<SessionResponseEx> {
        let mut builder = self
            .request(reqwest::Method::GET, &format!("/sessions/{session_id}"))
            .query(&[("hostEndPoint", host_endpoint.to_string())]);
        if let Some(ip) = client_ip {
            builder = builder.query(&[("clientIp", ip.to_string())]);
        }
        self.send(builder).await
    }

    async fn add_usage(
        &self,
        session_id: u64,
        traffic: Traffic,
        close_session: bool,
    ) -> Result<SessionResponseBase> {
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/sessions/{session_id}/usage"),
            )
            .query(&[("closeSession", close_session.to_string())])
            .json(&traffic),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let manager = HttpAccessManager::new("https://manager.example.org/api/", None).unwrap();
        assert_eq!(manager.base_url, "https://manager.example.org/api");
    }

    #[test]
    fn test_api_error_parses() {
        let json = r#"{"exception_type_name":"SessionException","message":"expired"}"#;
        let error: ApiError = serde_json::from_str(json).unwrap();
        assert_eq!(error.exception_type_name, "SessionException");
        assert_eq!(error.message, "expired");
    }
}

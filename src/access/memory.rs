//! In-memory access manager.
//!
//! Holds tokens, sessions and usage in process memory. The file-backed
//! manager layers persistence on top of this; tests drive it directly to
//! script quota, suppression, redirect and maintenance behavior.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::access::{
    AccessManager, ServerCommand, ServerConfigData, ServerInfo, ServerStatus, SessionOptions,
    SessionRequestEx, SessionResponseBase, SessionResponseEx, TrackingOptions,
};
use crate::crypto::{decrypt_client_id, SecureRandom};
use crate::error::{Error, ErrorCode, Result};
use crate::token::Token;
use crate::util::Traffic;
use crate::wire::{AccessUsage, SuppressType};

/// Per-token limits.
#[derive(Debug, Clone, Default)]
pub struct TokenOptions {
    /// Traffic quota in bytes, 0 = unlimited
    pub max_traffic: u64,
    /// Simultaneous clients, 0 = suppression disabled
    pub max_clients: u32,
    /// Expiration as unix seconds
    pub expiration_unix: Option<i64>,
}

struct TokenState {
    token: Token,
    options: TokenOptions,
    usage: Traffic,
}

struct SessionState {
    token_id: Uuid,
    client_id: Uuid,
    session_key: [u8; 16],
    error_code: ErrorCode,
    suppressed_by: SuppressType,
    created_at: Instant,
}

/// RAM-only access manager.
pub struct InMemoryAccessManager {
    server_secret: [u8; 16],
    tokens: Mutex<HashMap<Uuid, TokenState>>,
    sessions: Mutex<HashMap<u64, SessionState>>,
    next_session_id: AtomicU64,
    maintenance: AtomicBool,
    /// When set, Hello against any other endpoint redirects here.
    redirect_endpoint: Mutex<Option<SocketAddr>>,
    config: Mutex<ServerConfigData>,
}

impl InMemoryAccessManager {
    /// Create an empty manager with a fresh server secret.
    pub fn new() -> Self {
        Self {
            server_secret: SecureRandom::bytes(),
            tokens: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            maintenance: AtomicBool::new(false),
            redirect_endpoint: Mutex::new(None),
            config: Mutex::new(ServerConfigData {
                tcp_endpoints: Vec::new(),
                udp_endpoints: Vec::new(),
                session_options: SessionOptions::default(),
                tracking_options: TrackingOptions::default(),
                server_secret: hex::encode(SecureRandom::bytes::<16>()),
                config_code: Uuid::new_v4().to_string(),
                configure_interval_secs: 30,
            }),
        }
    }

    /// Mint a token served by `host_endpoints`.
    pub fn create_token(&self, host_endpoints: Vec<SocketAddr>, options: TokenOptions) -> Token {
        let token = Token {
            token_id: Uuid::new_v4(),
            secret: SecureRandom::bytes::<16>().to_vec(),
            host_name: "slipgate".into(),
            host_endpoints,
            cert_hash: None,
            refresh_url: None,
            protocol_version: crate::PROTOCOL_VERSION,
        };
        self.add_token(token.clone(), options);
        token
    }

    /// Register an existing token.
    pub fn add_token(&self, token: Token, options: TokenOptions) {
        self.tokens.lock().insert(
            token.token_id,
            TokenState {
                token,
                options,
                usage: Traffic::default(),
            },
        );
    }

    /// Remove a token; live sessions die at their next sync.
    pub fn remove_token(&self, token_id: Uuid) -> bool {
        let removed = self.tokens.lock().remove(&token_id).is_some();
        if removed {
            self.sessions
                .lock()
                .retain(|_, session| session.token_id != token_id);
        }
        removed
    }

    /// All registered tokens with their recorded usage.
    pub fn list_tokens(&self) -> Vec<(Token, Traffic)> {
        self.tokens
            .lock()
            .values()
            .map(|state| (state.token.clone(), state.usage))
            .collect()
    }

    /// Recorded usage for one token.
    pub fn token_usage(&self, token_id: Uuid) -> Option<Traffic> {
        self.tokens.lock().get(&token_id).map(|state| state.usage)
    }

    /// Restore persisted usage (file-backed manager startup).
    pub fn set_token_usage(&self, token_id: Uuid, usage: Traffic) {
        if let Some(state) = self.tokens.lock().get_mut(&token_id) {
            state.usage = usage;
        }
    }

    /// Toggle maintenance mode: Hello fails, existing sessions keep serving.
    pub fn set_maintenance(&self, on: bool) {
        self.maintenance.store(on, Ordering::Release);
    }

    /// Redirect Hello calls that arrive on any other endpoint.
    pub fn set_redirect_endpoint(&self, endpoint: Option<SocketAddr>) {
        *self.redirect_endpoint.lock() = endpoint;
    }

    /// Replace the config handed to servers at configure time.
    pub fn set_config(&self, config: ServerConfigData) {
        *self.config.lock() = config;
    }

    /// Number of sessions that still count against their token.
    pub fn live_session_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.error_code == ErrorCode::Ok)
            .count()
    }

    fn usage_of(state: &TokenState) -> AccessUsage {
        AccessUsage {
            traffic: state.usage,
            max_traffic: state.options.max_traffic,
            expiration_unix: state.options.expiration_unix,
            max_clients: state.options.max_clients,
        }
    }

    fn quota_exhausted(state: &TokenState) -> bool {
        state.options.max_traffic > 0 && state.usage.total() >= state.options.max_traffic
    }
}

impl Default for InMemoryAccessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccessManager for InMemoryAccessManager {
    async fn configure(&self, server_info: ServerInfo) -> Result<ServerConfigData> {
        tracing::debug!(server = %server_info.server_id, "configure");
        Ok(self.config.lock().clone())
    }

    async fn status(&self, status: ServerStatus) -> Result<ServerCommand> {
        let config_code = self.config.lock().config_code.clone();
        tracing::trace!(sessions = status.session_count, "status heartbeat");
        Ok(ServerCommand { config_code })
    }

    async fn session_create(&self, request: SessionRequestEx) -> Result<SessionResponseEx> {
        if self.maintenance.load(Ordering::Acquire) {
            return Ok(error_response(ErrorCode::Maintenance, "manager in maintenance"));
        }

        let tokens = self.tokens.lock();
        let Some(state) = tokens.get(&request.token_id) else {
            return Ok(error_response(ErrorCode::AccessError, "unknown token"));
        };

        // The encrypted client id proves possession of the token secret.
        let proof = hex::decode(&request.encrypted_client_id)
            .ok()
            .and_then(|bytes| <[u8; 16]>::try_from(bytes).ok())
            .and_then(|block| decrypt_client_id(&block, &state.token.secret).ok());
        if proof != Some(request.client_info.client_id) {
            return Ok(error_response(ErrorCode::Unauthorized, "client id proof failed"));
        }

        if let Some(expiration) = state.options.expiration_unix {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(i64::MAX);
            if now >= expiration {
                let mut response = error_response(ErrorCode::AccessExpired, "token expired");
                response.base.access_usage = Self::usage_of(state);
                return Ok(response);
            }
        }

        if Self::quota_exhausted(state) {
            let mut response =
                error_response(ErrorCode::AccessTrafficOverflow, "traffic quota exhausted");
            response.base.access_usage = Self::usage_of(state);
            return Ok(response);
        }

        if let Some(redirect) = *self.redirect_endpoint.lock() {
            if request.host_endpoint != redirect {
                let mut response = error_response(ErrorCode::RedirectHost, "use redirect endpoint");
                response.redirect_host_endpoint = Some(redirect);
                return Ok(response);
            }
        }

        let usage = Self::usage_of(state);
        let max_clients = state.options.max_clients;
        let token_id = state.token.token_id;
        drop(tokens);

        let mut sessions = self.sessions.lock();

        // Suppression: newest wins. A session of the same client always
        // displaces its predecessor; beyond max_clients the oldest other
        // client goes. max_clients == 0 disables both.
        if max_clients > 0 {
            let mut live: Vec<(u64, Instant, Uuid)> = sessions
                .iter()
                .filter(|(_, s)| s.token_id == token_id && s.error_code == ErrorCode::Ok)
                .map(|(id, s)| (*id, s.created_at, s.client_id))
                .collect();
            live.sort_by_key(|(_, created_at, _)| *created_at);

            for (id, _, client_id) in &live {
                if *client_id == request.client_info.client_id {
                    if let Some(session) = sessions.get_mut(id) {
                        session.error_code = ErrorCode::SessionSuppressedBySelf;
                        session.suppressed_by = SuppressType::Self_;
                    }
                }
            }

            let mut remaining: Vec<u64> = live
                .iter()
                .filter(|(id, _, _)| {
                    sessions.get(id).map(|s| s.error_code) == Some(ErrorCode::Ok)
                })
                .map(|(id, _, _)| *id)
                .collect();
            while remaining.len() + 1 > max_clients as usize {
                let oldest = remaining.remove(0);
                if let Some(session) = sessions.get_mut(&oldest) {
                    session.error_code = ErrorCode::SessionSuppressedByOther;
                    session.suppressed_by = SuppressType::Other;
                }
            }
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session_key: [u8; 16] = SecureRandom::bytes();
        sessions.insert(
            session_id,
            SessionState {
                token_id,
                client_id: request.client_info.client_id,
                session_key,
                error_code: ErrorCode::Ok,
                suppressed_by: SuppressType::None,
                created_at: Instant::now(),
            },
        );

        Ok(SessionResponseEx {
            base: SessionResponseBase {
                error_code: ErrorCode::Ok,
                error_message: None,
                suppressed_by: SuppressType::None,
                access_usage: usage,
            },
            session_id,
            session_key: hex::encode(session_key),
            redirect_host_endpoint: None,
        })
    }

    async fn session_get(
        &self,
        session_id: u64,
        _host_endpoint: SocketAddr,
        _client_ip: Option<IpAddr>,
    ) -> Result<SessionResponseEx> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(&session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let usage = self
            .tokens
            .lock()
            .get(&session.token_id)
            .map(Self::usage_of)
            .unwrap_or_default();

        Ok(SessionResponseEx {
            base: SessionResponseBase {
                error_code: session.error_code,
                error_message: None,
                suppressed_by: session.suppressed_by,
                access_usage: usage,
            },
            session_id,
            session_key: hex::encode(session.session_key),
            redirect_host_endpoint: None,
        })
    }

    async fn add_usage(
        &self,
        session_id: u64,
        traffic: Traffic,
        close_session: bool,
    ) -> Result<SessionResponseBase> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let mut tokens = self.tokens.lock();
        let Some(state) = tokens.get_mut(&session.token_id) else {
            return Ok(SessionResponseBase {
                error_code: ErrorCode::AccessError,
                error_message: Some("token vanished".into()),
                ..SessionResponseBase::default()
            });
        };

        state.usage += traffic;

        if Self::quota_exhausted(state) && session.error_code == ErrorCode::Ok {
            session.error_code = ErrorCode::AccessTrafficOverflow;
        }
        if close_session && session.error_code == ErrorCode::Ok {
            session.error_code = ErrorCode::SessionClosed;
        }

        // A closed-by-request session still gets an Ok for its final delta.
        let reported = if close_session && session.error_code == ErrorCode::SessionClosed {
            ErrorCode::Ok
        } else {
            session.error_code
        };

        Ok(SessionResponseBase {
            error_code: reported,
            error_message: None,
            suppressed_by: session.suppressed_by,
            access_usage: Self::usage_of(state),
        })
    }
}

fn error_response(code: ErrorCode, message: &str) -> SessionResponseEx {
    SessionResponseEx {
        base: SessionResponseBase {
            error_code: code,
            error_message: Some(message.into()),
            ..SessionResponseBase::default()
        },
        ..SessionResponseEx::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_client_id;
    use crate::wire::ClientInfo;

    fn hello_request(token: &Token, client_id: Uuid, endpoint: &str) -> SessionRequestEx {
        SessionRequestEx {
            token_id: token.token_id,
            client_info: ClientInfo {
                client_id,
                protocol_version: crate::PROTOCOL_VERSION,
                client_version: "test".into(),
                user_agent: "test".into(),
            },
            encrypted_client_id: hex::encode(encrypt_client_id(client_id, &token.secret).unwrap()),
            client_ip: None,
            host_endpoint: endpoint.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_create_and_recover() {
        let manager = InMemoryAccessManager::new();
        let token =
            manager.create_token(vec!["127.0.0.1:443".parse().unwrap()], TokenOptions::default());

        let client_id = Uuid::new_v4();
        let created = manager
            .session_create(hello_request(&token, client_id, "127.0.0.1:443"))
            .await
            .unwrap();
        assert_eq!(created.base.error_code, ErrorCode::Ok);
        assert_ne!(created.session_id, 0);

        let recovered = manager
            .session_get(created.session_id, "127.0.0.1:443".parse().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(recovered.session_key, created.session_key);
    }

    #[tokio::test]
    async fn test_bad_proof_unauthorized() {
        let manager = InMemoryAccessManager::new();
        let token =
            manager.create_token(vec!["127.0.0.1:443".parse().unwrap()], TokenOptions::default());

        let mut request = hello_request(&token, Uuid::new_v4(), "127.0.0.1:443");
        request.encrypted_client_id = "00".repeat(16);
        let response = manager.session_create(request).await.unwrap();
        assert_eq!(response.base.error_code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_quota_trips_on_usage() {
        let manager = InMemoryAccessManager::new();
        let token = manager.create_token(
            vec!["127.0.0.1:443".parse().unwrap()],
            TokenOptions {
                max_traffic: 50,
                ..TokenOptions::default()
            },
        );

        let created = manager
            .session_create(hello_request(&token, Uuid::new_v4(), "127.0.0.1:443"))
            .await
            .unwrap();

        let response = manager
            .add_usage(created.session_id, Traffic::new(40, 20), false)
            .await
            .unwrap();
        assert_eq!(response.error_code, ErrorCode::AccessTrafficOverflow);

        // A later Hello with the same token fails the same way.
        let again = manager
            .session_create(hello_request(&token, Uuid::new_v4(), "127.0.0.1:443"))
            .await
            .unwrap();
        assert_eq!(again.base.error_code, ErrorCode::AccessTrafficOverflow);
    }

    #[tokio::test]
    async fn test_suppression_order() {
        let manager = InMemoryAccessManager::new();
        let token = manager.create_token(
            vec!["127.0.0.1:443".parse().unwrap()],
            TokenOptions {
                max_clients: 2,
                ..TokenOptions::default()
            },
        );

        let c1 = manager
            .session_create(hello_request(&token, Uuid::new_v4(), "127.0.0.1:443"))
            .await
            .unwrap();
        let _c2 = manager
            .session_create(hello_request(&token, Uuid::new_v4(), "127.0.0.1:443"))
            .await
            .unwrap();
        let c3 = manager
            .session_create(hello_request(&token, Uuid::new_v4(), "127.0.0.1:443"))
            .await
            .unwrap();
        assert_eq!(c3.base.error_code, ErrorCode::Ok);

        let c1_status = manager
            .add_usage(c1.session_id, Traffic::default(), false)
            .await
            .unwrap();
        assert_eq!(c1_status.suppressed_by, SuppressType::Other);
        assert_eq!(c1_status.error_code, ErrorCode::SessionSuppressedByOther);
    }

    #[tokio::test]
    async fn test_zero_max_clients_disables_suppression() {
        let manager = InMemoryAccessManager::new();
        let token =
            manager.create_token(vec!["127.0.0.1:443".parse().unwrap()], TokenOptions::default());

        for _ in 0..5 {
            let response = manager
                .session_create(hello_request(&token, Uuid::new_v4(), "127.0.0.1:443"))
                .await
                .unwrap();
            assert_eq!(response.base.error_code, ErrorCode::Ok);
        }
        assert_eq!(manager.live_session_count(), 5);
    }

    #[tokio::test]
    async fn test_redirect_only_foreign_endpoint() {
        let manager = InMemoryAccessManager::new();
        let token =
            manager.create_token(vec!["127.0.0.1:443".parse().unwrap()], TokenOptions::default());
        manager.set_redirect_endpoint(Some("127.0.0.2:443".parse().unwrap()));

        let client_id = Uuid::new_v4();
        let first = manager
            .session_create(hello_request(&token, client_id, "127.0.0.1:443"))
            .await
            .unwrap();
        assert_eq!(first.base.error_code, ErrorCode::RedirectHost);
        assert_eq!(
            first.redirect_host_endpoint,
            Some("127.0.0.2:443".parse().unwrap())
        );

        // Against the redirect target the Hello goes through.
        let second = manager
            .session_create(hello_request(&token, client_id, "127.0.0.2:443"))
            .await
            .unwrap();
        assert_eq!(second.base.error_code, ErrorCode::Ok);
    }

    #[tokio::test]
    async fn test_final_close_reports_ok_once() {
        let manager = InMemoryAccessManager::new();
        let token =
            manager.create_token(vec!["127.0.0.1:443".parse().unwrap()], TokenOptions::default());
        let created = manager
            .session_create(hello_request(&token, Uuid::new_v4(), "127.0.0.1:443"))
            .await
            .unwrap();

        let closed = manager
            .add_usage(created.session_id, Traffic::new(1, 1), true)
            .await
            .unwrap();
        assert_eq!(closed.error_code, ErrorCode::Ok);

        let after = manager
            .add_usage(created.session_id, Traffic::default(), false)
            .await
            .unwrap();
        assert_eq!(after.error_code, ErrorCode::SessionClosed);
    }
}

//! Session lifecycle: create, recover, clean up.
//!
//! The manager fronts every access-manager call the request path makes.
//! Recovery after a server restart is keyed by session id through a named
//! async lock, so a burst of requests for the same unknown session costs
//! exactly one `session_get`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::access::{
    AccessManager, SessionOptions, SessionRequestEx, SessionResponseEx, TrackingOptions,
};
use crate::error::{Error, ErrorCode, Result};
use crate::server::netfilter::NetFilter;
use crate::server::session::{Session, SessionParams};
use crate::server::UdpDispatcher;
use crate::util::NamedLockRegistry;

/// Creates, recovers and reaps sessions for one server.
pub struct SessionManager {
    access: Arc<dyn AccessManager>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    recovery_locks: NamedLockRegistry<u64>,
    options: Mutex<SessionOptions>,
    tracking: Mutex<TrackingOptions>,
    netfilter: Arc<NetFilter>,
    udp_dispatcher: Mutex<Option<Arc<UdpDispatcher>>>,
}

impl SessionManager {
    /// Create a manager backed by `access`.
    pub fn new(access: Arc<dyn AccessManager>, netfilter: Arc<NetFilter>) -> Arc<Self> {
        Arc::new(Self {
            access,
            sessions: Mutex::new(HashMap::new()),
            recovery_locks: NamedLockRegistry::new(),
            options: Mutex::new(SessionOptions::default()),
            tracking: Mutex::new(TrackingOptions::default()),
            netfilter,
            udp_dispatcher: Mutex::new(None),
        })
    }

    /// Apply configuration from the access manager.
    pub fn apply_options(&self, options: SessionOptions, tracking: TrackingOptions) {
        *self.options.lock() = options;
        *self.tracking.lock() = tracking;
    }

    /// Install the UDP dispatcher once the server's UDP listener is up.
    pub fn set_udp_dispatcher(&self, dispatcher: Option<Arc<UdpDispatcher>>) {
        *self.udp_dispatcher.lock() = dispatcher;
    }

    /// Live session count.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Look a live session up.
    pub fn get(&self, session_id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().get(&session_id).cloned()
    }

    /// Aggregate speed across sessions, for the status heartbeat.
    pub fn total_speed(&self) -> crate::util::Traffic {
        let sessions = self.sessions.lock();
        let mut total = crate::util::Traffic::default();
        for session in sessions.values() {
            total += session.tunnel().speed();
        }
        total
    }

    /// Create a session for a Hello request.
    ///
    /// A manager-side rejection (quota, redirect, maintenance) is not a
    /// transport error: it comes back as `(None, response)` so the
    /// dispatcher can relay the code and any redirect endpoint verbatim.
    pub async fn create_session(
        &self,
        request: SessionRequestEx,
    ) -> Result<(Option<Arc<Session>>, SessionResponseEx)> {
        let response = self.access.session_create(request.clone()).await?;
        if response.base.error_code != ErrorCode::Ok {
            return Ok((None, response));
        }

        let session = self.build_session(&response, request.host_endpoint, request.client_ip)?;
        Ok((Some(session), response))
    }

    /// Fetch a session, recovering it from the access manager if this server
    /// does not know the id (e.g. after a restart).
    ///
    /// The caller's key must match the recovered one, otherwise the request
    /// is unauthorized.
    pub async fn get_or_recover(
        &self,
        session_id: u64,
        session_key_hex: &str,
        host_endpoint: SocketAddr,
        client_ip: Option<IpAddr>,
    ) -> Result<Arc<Session>> {
        if let Some(session) = self.get(session_id) {
            session.verify_key(session_key_hex)?;
            return Self::serviceable(session);
        }

        // One recovery RPC per session id, however many channels race here.
        let _guard = self.recovery_locks.lock(session_id).await;
        if let Some(session) = self.get(session_id) {
            session.verify_key(session_key_hex)?;
            return Self::serviceable(session);
        }

        let response = match self
            .access
            .session_get(session_id, host_endpoint, client_ip)
            .await
        {
            Ok(response) => response,
            Err(Error::NotFound(_)) => {
                return Err(Error::session(
                    ErrorCode::Unauthorized,
                    format!("session {session_id} unknown"),
                ))
            }
            Err(e) => return Err(e),
        };

        if response.session_key != session_key_hex {
            return Err(Error::session(
                ErrorCode::Unauthorized,
                "session key mismatch on recovery",
            ));
        }
        if response.base.error_code != ErrorCode::Ok {
            return Err(Error::session(
                response.base.error_code,
                "recovered session is not serviceable",
            ));
        }

        tracing::info!(session_id, "session recovered from access manager");
        let session = self.build_session(&response, host_endpoint, client_ip)?;
        Ok(session)
    }

    /// A disposed session answers requests with its final status code.
    fn serviceable(session: Arc<Session>) -> Result<Arc<Session>> {
        if session.is_disposed() {
            let status = session.status();
            return Err(Error::session(
                status.error_code,
                status
                    .error_message
                    .unwrap_or_else(|| "session is closed".into()),
            ));
        }
        Ok(session)
    }

    fn build_session(
        &self,
        response: &SessionResponseEx,
        host_endpoint: SocketAddr,
        client_ip: Option<IpAddr>,
    ) -> Result<Arc<Session>> {
        let session_key: [u8; 16] = hex::decode(&response.session_key)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| Error::invalid("access manager issued a malformed session key"))?;

        let udp_transport = self
            .udp_dispatcher
            .lock()
            .as_ref()
            .map(|dispatcher| dispatcher.register(response.session_id));

        let tracking = self.tracking.lock().clone();
        let session = Session::new(SessionParams {
            session_id: response.session_id,
            session_key,
            access: Arc::clone(&self.access),
            options: self.options.lock().clone(),
            tracking: TrackingOptions {
                track_client_ip: tracking.track_client_ip,
                track_local_port: tracking.track_local_port,
            },
            netfilter: Arc::clone(&self.netfilter),
            host_endpoint,
            client_ip,
            udp_transport,
        });

        self.sessions
            .lock()
            .insert(response.session_id, Arc::clone(&session));
        Ok(session)
    }

    /// Close one session gracefully and forget it.
    pub async fn close_session(&self, session_id: u64, code: ErrorCode) {
        let session = self.sessions.lock().remove(&session_id);
        if let Some(session) = session {
            session.close(code).await;
        }
        if let Some(dispatcher) = self.udp_dispatcher.lock().as_ref() {
            dispatcher.unregister(session_id);
        }
    }

    /// Drop disposed sessions and close idle ones. Run from the server's
    /// maintenance tick.
    pub async fn cleanup(&self) {
        let idle_timeout = Duration::from_secs(self.options.lock().idle_timeout_secs);

        let (dead, idle): (Vec<u64>, Vec<u64>) = {
            let sessions = self.sessions.lock();
            let dead = sessions
                .iter()
                .filter(|(_, s)| s.is_disposed())
                .map(|(id, _)| *id)
                .collect();
            let idle = sessions
                .iter()
                .filter(|(_, s)| !s.is_disposed() && s.idle_for() > idle_timeout)
                .map(|(id, _)| *id)
                .collect();
            (dead, idle)
        };

        for session_id in dead {
            self.sessions.lock().remove(&session_id);
            if let Some(dispatcher) = self.udp_dispatcher.lock().as_ref() {
                dispatcher.unregister(session_id);
            }
            tracing::debug!(session_id, "disposed session reaped");
        }
        for session_id in idle {
            tracing::info!(session_id, "closing idle session");
            self.close_session(session_id, ErrorCode::SessionClosed).await;
        }
    }

    /// Dispose everything; the final deltas go out best-effort.
    pub async fn dispose_all(&self) {
        let ids: Vec<u64> = self.sessions.lock().keys().copied().collect();
        for session_id in ids {
            self.close_session(session_id, ErrorCode::SessionClosed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{InMemoryAccessManager, TokenOptions};
    use crate::crypto::encrypt_client_id;
    use crate::wire::ClientInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn request_for(token: &crate::token::Token, endpoint: SocketAddr) -> SessionRequestEx {
        let client_id = Uuid::new_v4();
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
            host_endpoint: endpoint,
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let access = Arc::new(InMemoryAccessManager::new());
        let endpoint: SocketAddr = "127.0.0.1:443".parse().unwrap();
        let token = access.create_token(vec![endpoint], TokenOptions::default());
        let manager = SessionManager::new(access, Arc::new(NetFilter::permissive()));

        let (session, response) = manager
            .create_session(request_for(&token, endpoint))
            .await
            .unwrap();
        let session = session.expect("session created");
        assert_eq!(manager.session_count(), 1);
        assert_eq!(
            manager.get(session.session_id()).unwrap().session_id(),
            response.session_id
        );
    }

    #[tokio::test]
    async fn test_recovery_single_rpc_across_races() {
        /// Access manager that counts session_get calls.
        struct CountingAccess {
            inner: InMemoryAccessManager,
            gets: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl AccessManager for CountingAccess {
            async fn configure(
                &self,
                i: crate::access::ServerInfo,
            ) -> Result<crate::access::ServerConfigData> {
                self.inner.configure(i).await
            }
            async fn status(
                &self,
                s: crate::access::ServerStatus,
            ) -> Result<crate::access::ServerCommand> {
                self.inner.status(s).await
            }
            async fn session_create(&self, r: SessionRequestEx) -> Result<SessionResponseEx> {
                self.inner.session_create(r).await
            }
            async fn session_get(
                &self,
                id: u64,
                host: SocketAddr,
                ip: Option<IpAddr>,
            ) -> Result<SessionResponseEx> {
                self.gets.fetch_add(1, Ordering::SeqCst);
                // Recovery is slow enough for every racer to pile up.
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.inner.session_get(id, host, ip).await
            }
            async fn add_usage(
                &self,
                id: u64,
                t: crate::util::Traffic,
                c: bool,
            ) -> Result<crate::access::SessionResponseBase> {
                self.inner.add_usage(id, t, c).await
            }
        }

        let endpoint: SocketAddr = "127.0.0.1:443".parse().unwrap();
        let counting = Arc::new(CountingAccess {
            inner: InMemoryAccessManager::new(),
            gets: AtomicUsize::new(0),
        });
        let token = counting.inner.create_token(vec![endpoint], TokenOptions::default());

        // A session exists at the access manager, but this "restarted"
        // server has never heard of it.
        let created = counting
            .inner
            .session_create(request_for(&token, endpoint))
            .await
            .unwrap();

        let manager = SessionManager::new(
            Arc::clone(&counting) as Arc<dyn AccessManager>,
            Arc::new(NetFilter::permissive()),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let key = created.session_key.clone();
            let session_id = created.session_id;
            handles.push(tokio::spawn(async move {
                manager
                    .get_or_recover(session_id, &key, endpoint, None)
                    .await
                    .map(|s| s.session_id())
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), created.session_id);
        }

        assert_eq!(counting.gets.load(Ordering::SeqCst), 1);
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn test_recovery_wrong_key_unauthorized() {
        let access = Arc::new(InMemoryAccessManager::new());
        let endpoint: SocketAddr = "127.0.0.1:443".parse().unwrap();
        let token = access.create_token(vec![endpoint], TokenOptions::default());
        let created = access
            .session_create(request_for(&token, endpoint))
            .await
            .unwrap();

        let manager = SessionManager::new(
            Arc::clone(&access) as Arc<dyn AccessManager>,
            Arc::new(NetFilter::permissive()),
        );
        let err = manager
            .get_or_recover(created.session_id, &"ff".repeat(16), endpoint, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_unknown_session_unauthorized() {
        let access = Arc::new(InMemoryAccessManager::new());
        let manager = SessionManager::new(
            access as Arc<dyn AccessManager>,
            Arc::new(NetFilter::permissive()),
        );

        let err = manager
            .get_or_recover(9999, &"00".repeat(16), "127.0.0.1:443".parse().unwrap(), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_cleanup_reaps_disposed() {
        let access = Arc::new(InMemoryAccessManager::new());
        let endpoint: SocketAddr = "127.0.0.1:443".parse().unwrap();
        let token = access.create_token(vec![endpoint], TokenOptions::default());
        let manager = SessionManager::new(
            Arc::clone(&access) as Arc<dyn AccessManager>,
            Arc::new(NetFilter::permissive()),
        );

        let (session, _) = manager
            .create_session(request_for(&token, endpoint))
            .await
            .unwrap();
        session.expect("session created").dispose();

        manager.cleanup().await;
        assert_eq!(manager.session_count(), 0);
    }
}

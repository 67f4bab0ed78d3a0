//! File-backed access manager.
//!
//! Self-hosted servers run without a central manager; tokens and usage live
//! under a `storage/` directory in the working directory:
//!
//! ```text
//! storage/
//!   <token-id>.token    full token JSON
//!   <token-id>.usage    sent/received bytes JSON
//!   server-id           GUID text
//!   server-key          base64 16 bytes
//!   last-config.json    last applied ServerConfigData
//!   server.lock         single-instance guard
//! ```
//!
//! Session logic is delegated to an [`InMemoryAccessManager`]; this layer
//! adds persistence and the CLI-facing token CRUD.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use uuid::Uuid;

use crate::access::{
    AccessManager, ServerCommand, ServerConfigData, ServerInfo, ServerStatus, SessionOptions,
    SessionRequestEx, SessionResponseBase, SessionResponseEx, TokenOptions, TrackingOptions,
};
use crate::access::memory::InMemoryAccessManager;
use crate::crypto::SecureRandom;
use crate::error::{Error, Result};
use crate::token::Token;
use crate::util::Traffic;

const TOKEN_EXT: &str = "token";
const USAGE_EXT: &str = "usage";

/// Access manager persisting to a storage directory.
pub struct FileAccessManager {
    storage_dir: PathBuf,
    inner: InMemoryAccessManager,
    server_id: Uuid,
    #[allow(dead_code)]
    lock_file: std::fs::File,
    tcp_endpoints: Vec<SocketAddr>,
    udp_endpoints: Vec<SocketAddr>,
}

impl FileAccessManager {
    /// Open (or initialize) the storage under `working_dir/storage`.
    ///
    /// Fails when another instance holds the lock file.
    pub fn open(
        working_dir: &Path,
        tcp_endpoints: Vec<SocketAddr>,
        udp_endpoints: Vec<SocketAddr>,
    ) -> Result<Self> {
        let storage_dir = working_dir.join("storage");
        std::fs::create_dir_all(&storage_dir)?;
        std::fs::create_dir_all(storage_dir.join("certificates"))?;

        let lock_file = acquire_lock(&storage_dir.join("server.lock"))?;

        let server_id = load_or_create_server_id(&storage_dir)?;
        let server_key = load_or_create_server_key(&storage_dir)?;

        let inner = InMemoryAccessManager::new();
        let mut loaded = 0usize;
        for entry in std::fs::read_dir(&storage_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TOKEN_EXT) {
                continue;
            }
            match load_token_file(&path) {
                Ok((token, options)) => {
                    let token_id = token.token_id;
                    inner.add_token(token, options);
                    if let Ok(usage) = load_usage_file(&storage_dir, token_id) {
                        inner.set_token_usage(token_id, usage);
                    }
                    loaded += 1;
                }
                Err(e) => tracing::warn!(path = %path.display(), "skipping bad token file: {e}"),
            }
        }
        tracing::info!(tokens = loaded, storage = %storage_dir.display(), "file access manager ready");

        let manager = Self {
            storage_dir,
            inner,
            server_id,
            lock_file,
            tcp_endpoints,
            udp_endpoints,
        };
        manager.apply_config(server_key)?;
        Ok(manager)
    }

    fn apply_config(&self, server_key: [u8; 16]) -> Result<()> {
        let config = match self.load_last_config() {
            Some(mut config) => {
                config.tcp_endpoints = self.tcp_endpoints.clone();
                config.udp_endpoints = self.udp_endpoints.clone();
                config
            }
            None => ServerConfigData {
                tcp_endpoints: self.tcp_endpoints.clone(),
                udp_endpoints: self.udp_endpoints.clone(),
                session_options: SessionOptions::default(),
                tracking_options: TrackingOptions::default(),
                server_secret: hex::encode(server_key),
                config_code: Uuid::new_v4().to_string(),
                configure_interval_secs: 30,
            },
        };

        let json = serde_json::to_vec_pretty(&config)?;
        std::fs::write(self.storage_dir.join("last-config.json"), json)?;
        self.inner.set_config(config);
        Ok(())
    }

    fn load_last_config(&self) -> Option<ServerConfigData> {
        let bytes = std::fs::read(self.storage_dir.join("last-config.json")).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// This server's stable id.
    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    /// Create and persist a token reachable at this server's endpoints.
    pub fn create_token(&self, options: TokenOptions) -> Result<Token> {
        let token = self
            .inner
            .create_token(self.tcp_endpoints.clone(), options.clone());
        self.save_token(&token, &options)?;
        Ok(token)
    }

    /// Tokens on disk with their recorded usage.
    pub fn list_tokens(&self) -> Vec<(Token, Traffic)> {
        self.inner.list_tokens()
    }

    /// Delete a token and its usage file.
    pub fn remove_token(&self, token_id: Uuid) -> Result<()> {
        if !self.inner.remove_token(token_id) {
            return Err(Error::NotFound(format!("token {token_id}")));
        }
        let _ = std::fs::remove_file(self.token_path(token_id));
        let _ = std::fs::remove_file(self.usage_path(token_id));
        Ok(())
    }

    fn token_path(&self, token_id: Uuid) -> PathBuf {
        self.storage_dir.join(format!("{token_id}.{TOKEN_EXT}"))
    }

    fn usage_path(&self, token_id: Uuid) -> PathBuf {
        self.storage_dir.join(format!("{token_id}.{USAGE_EXT}"))
    }

    fn save_token(&self, token: &Token, options: &TokenOptions) -> Result<()> {
        let record = TokenFile {
            token: token.clone(),
            max_traffic: options.max_traffic,
            max_clients: options.max_clients,
            expiration_unix: options.expiration_unix,
        };
        let json = serde_json::to_vec_pretty(&record)?;
        std::fs::write(self.token_path(token.token_id), json)?;
        Ok(())
    }

    fn persist_usage(&self, token_id: Uuid) {
        if let Some(usage) = self.inner.token_usage(token_id) {
            if let Ok(json) = serde_json::to_vec(&usage) {
                if let Err(e) = std::fs::write(self.usage_path(token_id), json) {
                    tracing::warn!(%token_id, "usage persist failed: {e}");
                }
            }
        }
    }
}

/// On-disk token record: the token plus its limits.
#[derive(serde::Serialize, serde::Deserialize)]
struct TokenFile {
    token: Token,
    #[serde(default)]
    max_traffic: u64,
    #[serde(default)]
    max_clients: u32,
    #[serde(default)]
    expiration_unix: Option<i64>,
}

fn load_token_file(path: &Path) -> Result<(Token, TokenOptions)> {
    let bytes = std::fs::read(path)?;
    let record: TokenFile = serde_json::from_slice(&bytes)?;
    Ok((
        record.token,
        TokenOptions {
            max_traffic: record.max_traffic,
            max_clients: record.max_clients,
            expiration_unix: record.expiration_unix,
        },
    ))
}

fn load_usage_file(storage_dir: &Path, token_id: Uuid) -> Result<Traffic> {
    let bytes = std::fs::read(storage_dir.join(format!("{token_id}.{USAGE_EXT}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn load_or_create_server_id(storage_dir: &Path) -> Result<Uuid> {
    let path = storage_dir.join("server-id");
    match std::fs::read_to_string(&path) {
        Ok(text) => Uuid::parse_str(text.trim())
            .map_err(|e| Error::config(format!("bad server-id file: {e}"))),
        Err(_) => {
            let id = Uuid::new_v4();
            std::fs::write(&path, id.to_string())?;
            Ok(id)
        }
    }
}

fn load_or_create_server_key(storage_dir: &Path) -> Result<[u8; 16]> {
    let path = storage_dir.join("server-key");
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let bytes = STANDARD
                .decode(text.trim())
                .map_err(|e| Error::config(format!("bad server-key file: {e}")))?;
            bytes
                .try_into()
                .map_err(|_| Error::config("server-key must be 16 bytes"))
        }
        Err(_) => {
            let key: [u8; 16] = SecureRandom::bytes();
            std::fs::write(&path, STANDARD.encode(key))?;
            Ok(key)
        }
    }
}

/// Take the single-instance lock, failing if a live process holds it.
fn acquire_lock(path: &Path) -> Result<std::fs::File> {
    use std::io::Write;

    // A stale lock from a dead process is overwritten; a fresh one (younger
    // than the heartbeat the owner rewrites) blocks the second instance.
    if let Ok(meta) = std::fs::metadata(path) {
        let age = meta
            .modified()
            .ok()
            .and_then(|t| t.elapsed().ok())
            .unwrap_or_default();
        if age < std::time::Duration::from_secs(60) {
            return Err(Error::config(format!(
                "another instance holds {}",
                path.display()
            )));
        }
    }

    let mut file = std::fs::File::create(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}

#[async_trait]
impl AccessManager for FileAccessManager {
    async fn configure(&self, server_info: ServerInfo) -> Result<ServerConfigData> {
        self.inner.configure(server_info).await
    }

    async fn status(&self, status: ServerStatus) -> Result<ServerCommand> {
        self.inner.status(status).await
    }

    async fn session_create(&self, request: SessionRequestEx) -> Result<SessionResponseEx> {
        self.inner.session_create(request).await
    }

    async fn session_get(
        &self,
        session_id: u64,
        host_endpoint: SocketAddr,
        client_ip: Option<IpAddr>,
    ) -> Result<SessionResponseEx> {
        self.inner.session_get(session_id, host_endpoint, client_ip).await
    }

    async fn add_usage(
        &self,
        session_id: u64,
        traffic: Traffic,
        close_session: bool,
    ) -> Result<SessionResponseBase> {
        let response = self.inner.add_usage(session_id, traffic, close_session).await?;
        // Usage changed; write through so a restart cannot forget it.
        for (token, _) in self.inner.list_tokens() {
            self.persist_usage(token.token_id);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "slipgate-test-{tag}-{}",
            SecureRandom::short_id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn endpoints() -> Vec<SocketAddr> {
        vec!["127.0.0.1:443".parse().unwrap()]
    }

    #[tokio::test]
    async fn test_storage_layout_created() {
        let dir = temp_dir("layout");
        let manager = FileAccessManager::open(&dir, endpoints(), Vec::new()).unwrap();

        let storage = dir.join("storage");
        assert!(storage.join("server-id").is_file());
        assert!(storage.join("server-key").is_file());
        assert!(storage.join("last-config.json").is_file());
        assert!(storage.join("server.lock").is_file());
        assert!(storage.join("certificates").is_dir());
        assert_ne!(manager.server_id(), Uuid::nil());
    }

    #[tokio::test]
    async fn test_tokens_survive_reopen() {
        let dir = temp_dir("reopen");
        let token_id;
        {
            let manager = FileAccessManager::open(&dir, endpoints(), Vec::new()).unwrap();
            let token = manager
                .create_token(TokenOptions {
                    max_traffic: 1000,
                    ..TokenOptions::default()
                })
                .unwrap();
            token_id = token.token_id;
        }

        // Lock files younger than the heartbeat window block a second
        // instance; backdate it the way a dead process would leave it.
        let lock = dir.join("storage").join("server.lock");
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(120);
        let file = std::fs::OpenOptions::new().write(true).open(&lock).unwrap();
        file.set_modified(old).unwrap();

        let manager = FileAccessManager::open(&dir, endpoints(), Vec::new()).unwrap();
        let tokens = manager.list_tokens();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].0.token_id, token_id);
    }

    #[tokio::test]
    async fn test_second_instance_blocked() {
        let dir = temp_dir("lock");
        let _first = FileAccessManager::open(&dir, endpoints(), Vec::new()).unwrap();
        assert!(FileAccessManager::open(&dir, endpoints(), Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_remove_token_deletes_files() {
        let dir = temp_dir("remove");
        let manager = FileAccessManager::open(&dir, endpoints(), Vec::new()).unwrap();
        let token = manager.create_token(TokenOptions::default()).unwrap();

        assert!(manager.token_path(token.token_id).is_file());
        manager.remove_token(token.token_id).unwrap();
        assert!(!manager.token_path(token.token_id).is_file());
        assert!(manager.remove_token(token.token_id).is_err());
    }
}

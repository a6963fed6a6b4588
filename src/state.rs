// src/state.rs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info};
use url::Url;

use crate::channel::ChannelRegistry;
use crate::config::settings::{SettingsManager, SystemSettings};
use crate::config::AppConfig;
use crate::crypto::EncryptionService;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::keypool::validator::KeyValidator;
use crate::keypool::KeyPool;
use crate::request_log::RequestLogger;
use crate::store::{MemoryStore, RedisStore, Store};
use crate::tasks::TaskManager;

/// The subset of effective config that shapes an HTTP client. One client is
/// built and cached per distinct profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientProfile {
    pub request_timeout_s: u64,
    pub connect_timeout_s: u64,
    pub idle_conn_timeout_s: u64,
    pub max_idle_conns_per_host: usize,
    pub proxy_url: Option<String>,
}

impl ClientProfile {
    pub fn from_settings(cfg: &SystemSettings) -> Self {
        Self {
            request_timeout_s: cfg.request_timeout_s,
            connect_timeout_s: cfg.connect_timeout_s,
            idle_conn_timeout_s: cfg.idle_conn_timeout_s,
            max_idle_conns_per_host: cfg.max_idle_conns_per_host,
            proxy_url: cfg.proxy_url.clone(),
        }
    }
}

/// Shared application state, accessible by all Axum handlers.
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub crypto: Arc<EncryptionService>,
    pub settings: Arc<SettingsManager>,
    pub channels: Arc<ChannelRegistry>,
    pub pool: KeyPool,
    pub validator: KeyValidator,
    pub tasks: TaskManager,
    pub request_logger: RequestLogger,
    clients: RwLock<HashMap<ClientProfile, Arc<reqwest::Client>>>,
    log_writer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Wires the full component graph: database, store, crypto, settings,
    /// channels, pool (with the projection loaded), validator, task slots and
    /// the request-log writer.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let db = Database::connect(&config.database_dsn).await?;

        let store: Arc<dyn Store> = match &config.redis_dsn {
            Some(dsn) => Arc::new(RedisStore::connect(dsn, "keypool:")?),
            None => {
                info!("No REDIS_DSN provided, using in-process store");
                Arc::new(MemoryStore::new())
            }
        };

        let crypto = Arc::new(EncryptionService::new(config.encryption_key.clone()));
        let settings = Arc::new(SettingsManager::load(db.clone()).await?);
        let channels = Arc::new(ChannelRegistry::new());

        let pool = KeyPool::new(
            db.clone(),
            store,
            crypto.clone(),
            Arc::new(crate::error::default_uncounted),
        );
        pool.load_from_db().await?;

        let validator = KeyValidator::new(
            db.clone(),
            pool.clone(),
            channels.clone(),
            settings.clone(),
            crypto.clone(),
        )?;

        let (request_logger, log_writer) = RequestLogger::start(db.clone());
        let tasks = TaskManager::with_db(db.clone());

        Ok(Self {
            config,
            db,
            crypto,
            settings,
            channels,
            pool,
            validator,
            tasks,
            request_logger,
            clients: RwLock::new(HashMap::new()),
            log_writer: std::sync::Mutex::new(Some(log_writer)),
        })
    }

    /// Returns the shared HTTP client for the given settings profile, building
    /// and caching it on first use.
    pub async fn get_client(&self, cfg: &SystemSettings) -> Result<Arc<reqwest::Client>> {
        let profile = ClientProfile::from_settings(cfg);
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(&profile) {
                return Ok(client.clone());
            }
        }

        let client = Arc::new(build_client(&profile)?);
        let mut clients = self.clients.write().await;
        Ok(clients.entry(profile).or_insert(client).clone())
    }

    /// Ordered shutdown: stop pool tickers, then drain the request-log writer.
    /// The HTTP server itself has already stopped accepting requests.
    pub async fn shutdown(&self) {
        self.pool.stop_maintenance();

        let handle = self
            .log_writer
            .lock()
            .expect("log writer lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        self.db.close().await;
        info!("application state shut down");
    }
}

fn build_client(profile: &ClientProfile) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(profile.connect_timeout_s))
        .timeout(Duration::from_secs(profile.request_timeout_s))
        .pool_idle_timeout(Duration::from_secs(profile.idle_conn_timeout_s))
        .pool_max_idle_per_host(profile.max_idle_conns_per_host)
        .tcp_keepalive(Some(Duration::from_secs(60)));

    if let Some(proxy_url) = &profile.proxy_url {
        let proxy = build_proxy(proxy_url)?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|e| {
        error!(error = %e, "failed to build HTTP client");
        AppError::HttpClient {
            message: format!("failed to build HTTP client: {e}"),
        }
    })
}

fn build_proxy(proxy_url: &str) -> Result<reqwest::Proxy> {
    let parsed = Url::parse(proxy_url)?;
    let proxy = match parsed.scheme() {
        "http" => reqwest::Proxy::http(proxy_url),
        "https" => reqwest::Proxy::https(proxy_url),
        "socks5" | "socks5h" => reqwest::Proxy::all(proxy_url),
        other => {
            return Err(AppError::Config {
                message: format!("unsupported proxy scheme '{other}' in '{proxy_url}'"),
            })
        }
    };
    proxy.map_err(|e| AppError::Config {
        message: format!("invalid proxy '{proxy_url}': {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_profile_derives_from_settings() {
        let mut cfg = SystemSettings::default();
        cfg.request_timeout_s = 30;
        cfg.proxy_url = Some("http://127.0.0.1:8888".to_string());
        let profile = ClientProfile::from_settings(&cfg);
        assert_eq!(profile.request_timeout_s, 30);
        assert_eq!(profile.proxy_url.as_deref(), Some("http://127.0.0.1:8888"));
    }

    #[test]
    fn proxy_scheme_validation() {
        assert!(build_proxy("http://127.0.0.1:8888").is_ok());
        assert!(build_proxy("socks5://127.0.0.1:1080").is_ok());
        assert!(build_proxy("ftp://127.0.0.1:21").is_err());
        assert!(build_proxy("::garbage::").is_err());
    }

    #[test]
    fn client_builds_for_plain_profile() {
        let profile = ClientProfile::from_settings(&SystemSettings::default());
        assert!(build_client(&profile).is_ok());
    }
}

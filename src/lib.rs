// SPDX-License-Identifier: MIT

pub mod audit;
pub mod bridge;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod files;
pub mod mailbox;
pub mod mcp;
pub mod recorder;
pub mod registry;
pub mod rest;
pub mod sessions;
pub mod storage;
pub mod webhooks;

pub use mailbox::MailboxStore;

use std::sync::Arc;

use audit::{archive::ThreadArchive, AuditLog};
use bridge::BridgeState;
use config::DaemonConfig;
use dispatcher::Dispatcher;
use files::FileStore;
use mcp::McpState;
use recorder::FlightRecorder;
use registry::AgentRegistry;
use rest::auth::ApiKeyStore;
use sessions::SessionRegistry;
use storage::Storage;
use webhooks::WebhookRegistry;

/// Shared application state handed to every handler and background loop.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub storage: Arc<Storage>,
    pub mailbox: Arc<MailboxStore>,
    pub registry: AgentRegistry,
    pub audit: AuditLog,
    pub archive: ThreadArchive,
    pub files: Arc<FileStore>,
    pub webhooks: WebhookRegistry,
    pub sessions: Arc<SessionRegistry>,
    pub recorder: FlightRecorder,
    pub keys: ApiKeyStore,
    pub dispatcher: Arc<Dispatcher>,
    pub bridge: Arc<BridgeState>,
    pub mcp: Arc<McpState>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Assemble the full context over a data directory. Loads snapshots,
    /// runs migrations, and seeds the agent registry on first start.
    pub async fn build(config: Arc<DaemonConfig>) -> anyhow::Result<Arc<AppContext>> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let storage = Arc::new(Storage::new(&config.data_dir).await?);

        let mailbox = Arc::new(MailboxStore::load(&config.data_dir)?);
        let registry = AgentRegistry::new(storage.pool());
        registry.seed_defaults().await?;
        let audit = AuditLog::new(storage.pool());
        let archive = ThreadArchive::new(storage.pool());
        let files = Arc::new(FileStore::load(&config.data_dir)?);
        let webhooks = WebhookRegistry::load(&config.data_dir)?;
        let sessions = Arc::new(SessionRegistry::load(&config.data_dir)?);
        let recorder = FlightRecorder::new(storage.pool());
        let keys = ApiKeyStore::new(storage.pool());
        let dispatcher = Arc::new(Dispatcher::new(
            mailbox.clone(),
            registry.clone(),
            audit.clone(),
            config.poll_interval_secs,
        )?);

        Ok(Arc::new(AppContext {
            config,
            storage,
            mailbox,
            registry,
            audit,
            archive,
            files,
            webhooks,
            sessions,
            recorder,
            keys,
            dispatcher,
            bridge: Arc::new(BridgeState::new()),
            mcp: Arc::new(McpState::new()),
            started_at: std::time::Instant::now(),
        }))
    }
}

use std::sync::Arc;

use palaver_chat::QuotaTracker;
use palaver_llm::ChatClient;
use palaver_persist::ThreadStore;

use crate::config::Config;
use crate::registry::SessionRegistry;

/// Shared application state passed to all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ThreadStore>,
    pub llm_client: Arc<dyn ChatClient>,
    pub quota: Arc<QuotaTracker>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn ThreadStore>, llm_client: Arc<dyn ChatClient>) -> Self {
        let quota = QuotaTracker::new(config.quota.guest_daily_limit)
            .with_sweep_probability(config.quota.sweep_probability);
        Self {
            config: Arc::new(config),
            store,
            llm_client,
            quota: Arc::new(quota),
            sessions: Arc::new(SessionRegistry::new()),
        }
    }
}

//! Client handler for backend server notifications.
//!
//! Implements RMCP's `ClientHandler` trait to handle:
//! - Tool/resource/prompt list change notifications (queue a re-discovery)
//! - Progress, cancellation and logging notifications

use std::sync::Arc;

use rmcp::{
    model::{
        CancelledNotificationParam, ClientInfo, LoggingLevel, LoggingMessageNotificationParam,
        ProgressNotificationParam, ResourceUpdatedNotificationParam,
    },
    service::NotificationContext,
    ClientHandler, RoleClient,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Request to re-discover a server's inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub server_id: String,
}

impl RefreshRequest {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }
}

#[derive(Clone)]
pub struct HostClientHandler {
    server_id: Arc<str>,
    client_info: ClientInfo,
    refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
}

impl HostClientHandler {
    pub fn new(server_id: impl AsRef<str>) -> Self {
        let mut client_info = ClientInfo::default();
        client_info.client_info.name = env!("CARGO_PKG_NAME").to_string();
        client_info.client_info.version = env!("CARGO_PKG_VERSION").to_string();

        Self {
            server_id: Arc::from(server_id.as_ref()),
            client_info,
            refresh_tx: None,
        }
    }

    #[must_use]
    pub fn with_refresh_channel(mut self, tx: Option<mpsc::Sender<RefreshRequest>>) -> Self {
        self.refresh_tx = tx;
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn send_refresh(&self) {
        if let Some(tx) = &self.refresh_tx {
            let _ = tx
                .try_send(RefreshRequest::new(self.server_id.as_ref()))
                .map_err(|e| {
                    warn!(
                        server_id = %self.server_id,
                        error = %e,
                        "Failed to queue refresh request"
                    );
                });
        }
    }
}

impl ClientHandler for HostClientHandler {
    async fn on_cancelled(
        &self,
        params: CancelledNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        info!(
            server_id = %self.server_id,
            request_id = %params.request_id,
            reason = ?params.reason,
            "Server cancelled request"
        );
    }

    async fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        debug!(
            server_id = %self.server_id,
            token = ?params.progress_token,
            progress = %params.progress,
            total = ?params.total,
            message = ?params.message,
            "Server progress"
        );
    }

    async fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        debug!(
            server_id = %self.server_id,
            uri = %params.uri,
            "Server resource updated"
        );
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(server_id = %self.server_id, "Server resource list changed");
        self.send_refresh();
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(server_id = %self.server_id, "Server tool list changed");
        self.send_refresh();
    }

    async fn on_prompt_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(server_id = %self.server_id, "Server prompt list changed");
        self.send_refresh();
    }

    fn get_info(&self) -> ClientInfo {
        self.client_info.clone()
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        let logger = params.logger.as_deref().unwrap_or("mcp");

        match params.level {
            LoggingLevel::Emergency | LoggingLevel::Alert | LoggingLevel::Critical => {
                error!(
                    server_id = %self.server_id,
                    logger = %logger,
                    level = ?params.level,
                    "{}",
                    params.data
                );
            }
            LoggingLevel::Error => {
                error!(server_id = %self.server_id, logger = %logger, "{}", params.data);
            }
            LoggingLevel::Warning => {
                warn!(server_id = %self.server_id, logger = %logger, "{}", params.data);
            }
            LoggingLevel::Notice | LoggingLevel::Info => {
                info!(server_id = %self.server_id, logger = %logger, "{}", params.data);
            }
            LoggingLevel::Debug => {
                debug!(server_id = %self.server_id, logger = %logger, "{}", params.data);
            }
        }
    }
}

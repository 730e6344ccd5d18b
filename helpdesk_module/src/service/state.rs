use std::fmt::Display;
use std::sync::Arc;

use tokio::task;
use tracing::error;

use crate::clients::ClientStore;

use super::config::ServiceConfig;
use super::errors::ApiError;
use super::pipeline::Pipeline;

#[derive(Clone)]
pub struct AppState {
    pub(super) config: Arc<ServiceConfig>,
    pub(super) pipeline: Arc<Pipeline>,
    pub(super) clients: Arc<ClientStore>,
}

impl AppState {
    pub fn new(config: Arc<ServiceConfig>, pipeline: Arc<Pipeline>, clients: Arc<ClientStore>) -> Self {
        Self {
            config,
            pipeline,
            clients,
        }
    }

    /// Logs `err` and turns it into a 500.
    pub(super) fn internal(&self, err: impl Display) -> ApiError {
        error!("admin request failed: {}", err);
        ApiError::Internal(self.config.app_debug.then(|| err.to_string()))
    }

    /// Runs store or pipeline work off the async executor.
    pub(super) async fn blocking<T, F>(&self, work: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        task::spawn_blocking(work)
            .await
            .map_err(|err| self.internal(err))
    }
}

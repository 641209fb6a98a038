use std::sync::Arc;

use crate::services::jobs::JobManager;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
}

impl AppState {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }
}

use crate::config::ViewConfig;
use crate::health::HealthTracker;
use crate::pool::Pool;
use std::sync::Arc;

/// État unique partagé par les handlers Axum
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub cfg: Arc<ViewConfig>,
    pub health_tracker: HealthTracker,
}

impl AppState {
    pub fn new(pool: Pool, cfg: ViewConfig) -> Self {
        Self {
            pool: Arc::new(pool),
            cfg: Arc::new(cfg),
            health_tracker: HealthTracker::new(),
        }
    }
}

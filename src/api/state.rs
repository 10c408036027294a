use std::sync::Arc;

use super::telemetry::Telemetry;
use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub pool: Pool,
    pub config: Arc<Config>,
    pub telemetry: Arc<Telemetry>,
}

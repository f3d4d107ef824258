use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Name stamped on outgoing frames.
    pub source: String,
    pub shutdown: CancellationToken,
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::queue::Broker;
use crate::scanner::{Heartbeat, ScanStatus};

#[derive(Clone)]
pub struct AppState {
    pub scanner: Heartbeat,
    pub workers: Heartbeat,
    pub status: Arc<RwLock<ScanStatus>>,
    pub broker: Arc<dyn Broker>,

    /// Heartbeat age past which a job counts as stalled
    pub stall_timeout: Duration,
}

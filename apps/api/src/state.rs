use std::sync::Arc;

use crate::queue::JobQueue;
use crate::store::ReceiptStore;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub receipts: Arc<dyn ReceiptStore>,
    /// Same queue the Queue Monitor claims from.
    pub queue: Arc<dyn JobQueue>,
}

//! Application state shared across request handlers.

use std::sync::Arc;

use crate::ops::CoordinatorOps;

/// Shared application state, passed to handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    ops: Arc<CoordinatorOps>,
}

impl AppState {
    pub fn new(ops: Arc<CoordinatorOps>) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &CoordinatorOps {
        &self.ops
    }
}

use std::sync::Arc;

use crate::sfu::Sfu;

#[derive(Clone)]
pub struct AppState {
    pub sfu: Arc<Sfu>,
}

impl AppState {
    pub fn new(sfu: Arc<Sfu>) -> Self {
        Self { sfu }
    }
}

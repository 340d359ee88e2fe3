use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::core::session::{Services, SessionContext};
use crate::web::error::ApiError;

pub type SharedSession = Arc<Mutex<SessionContext>>;

/// Shared state behind every handler: the catalog and backends, plus one
/// session context per browser session. Sessions live in memory only.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    sessions: Arc<RwLock<HashMap<Uuid, SharedSession>>>,
}

impl AppState {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn create_session(&self) -> Uuid {
        let id = Uuid::new_v4();
        let session = SessionContext::new(self.services.clone());
        self.sessions
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(session)));
        info!(session = %id, "session created");
        id
    }

    pub async fn session(&self, id: Uuid) -> Result<SharedSession, ApiError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("Unknown session '{id}'")))
    }
}

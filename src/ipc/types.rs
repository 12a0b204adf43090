use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::EnvConfig;
use crate::notify::MailSender;
use crate::watch::ChangeBus;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Signed-in user context. Always explicit, never ambient: handlers that
/// record an actor receive it through `AppState`.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_name: String,
    pub role: String,
    pub person_id: Option<String>,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub session: Option<Session>,
    pub config: EnvConfig,
    pub mailer: Option<Arc<dyn MailSender>>,
    pub bus: ChangeBus,
}

impl AppState {
    pub fn new(config: EnvConfig) -> Self {
        Self {
            workspace: None,
            db: None,
            session: None,
            config,
            mailer: None,
            bus: ChangeBus::default(),
        }
    }
}

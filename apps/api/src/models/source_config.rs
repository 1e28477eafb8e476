use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Per-team, per-platform credentials and routing.
/// Owned by the configuration store; the pipeline only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SourceConfig {
    pub id: Uuid,
    pub source_type: String,
    pub team_id: String,
    pub api_token: String,
    pub notion_token: Option<String>,
    pub notion_database_id: Option<String>,
    pub ai_enabled: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A partially filled config as submitted for validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfigDraft {
    pub team_id: Option<String>,
    pub api_token: Option<String>,
    pub notion_token: Option<String>,
    pub notion_database_id: Option<String>,
    pub ai_enabled: Option<bool>,
}

impl SourceConfigDraft {
    /// Promotes the draft to a config for a one-off connection test.
    pub fn into_config(self, source_type: &str) -> SourceConfig {
        SourceConfig {
            id: Uuid::nil(),
            source_type: source_type.to_string(),
            team_id: self.team_id.unwrap_or_default(),
            api_token: self.api_token.unwrap_or_default(),
            notion_token: self.notion_token,
            notion_database_id: self.notion_database_id,
            ai_enabled: self.ai_enabled.unwrap_or(true),
            active: true,
            created_at: Utc::now(),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix carried by app-switch sentinel records. Downstream filtering
/// matches on this exact string, so it must stay stable.
pub const APP_SWITCH_PREFIX: &str = "[switch] ";

/// One committed fragment of user activity. Immutable once constructed;
/// the history file is an append-only sequence of these (plus the explicit
/// bulk clear).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "appName")]
    pub app_name: String,
    pub text: String,
}

impl UsageRecord {
    pub fn new(app_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            app_name: app_name.into(),
            text: text.into(),
        }
    }

    /// Sentinel record marking a foreground-application switch.
    pub fn app_switch(old_app: &str, new_app: &str) -> Self {
        Self::new(new_app, format!("{APP_SWITCH_PREFIX}{old_app} \u{2192} {new_app}"))
    }

    /// True for app-switch sentinels, false for literal typed content.
    pub fn is_app_switch(&self) -> bool {
        self.text.starts_with(APP_SWITCH_PREFIX)
    }
}

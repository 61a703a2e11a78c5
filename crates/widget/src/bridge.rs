//! Messages exchanged with the page running inside the content surface.

use serde::Deserialize;
use serde_json::Value;

const OFFLINE_MODE_EVENT: &str = "sabycomOfflineMode";

#[derive(Debug, Deserialize)]
struct RawMessage {
    action: String,
    #[serde(default)]
    value: Value,
}

/// A `{"action": ..., "value": ...}` message posted by the widget page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeMessage {
    /// `toggleWindow` with `false`: the user closed the widget.
    CloseRequested,
    /// `unreadChange`: the page knows a fresher unread count.
    UnreadChanged(u32),
    /// `windowLoaded`: the page finished rendering its own content.
    WindowLoaded,
    Ignored,
}

impl BridgeMessage {
    pub fn parse(body: &str) -> Self {
        let Ok(raw) = serde_json::from_str::<RawMessage>(body) else {
            return Self::Ignored;
        };

        match raw.action.as_str() {
            "toggleWindow" if raw.value == Value::Bool(false) => Self::CloseRequested,
            "unreadChange" => raw
                .value
                .as_u64()
                .and_then(|count| u32::try_from(count).ok())
                .map_or(Self::Ignored, Self::UnreadChanged),
            "windowLoaded" => Self::WindowLoaded,
            _ => Self::Ignored,
        }
    }
}

/// Script that tells the page whether it should behave as offline.
pub fn offline_mode_script(offline: bool) -> String {
    format!(
        "window.dispatchEvent(new CustomEvent('{OFFLINE_MODE_EVENT}', {{ detail: {{ offline: {offline} }} }}));"
    )
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

/// A person talking to support through the widget.
///
/// Anonymous users carry only an `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            surname: None,
            email: None,
            phone: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_surname(mut self, surname: impl Into<String>) -> Self {
        self.surname = Some(surname.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_none() && self.surname.is_none() && self.email.is_none() && self.phone.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushTokenType {
    Prod,
    Sandbox,
}

impl PushTokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Sandbox => "sandbox",
        }
    }
}

/// Device token used by the backend to deliver pushes for the current user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushToken {
    pub token: String,
    pub token_type: PushTokenType,
}

impl PushToken {
    pub fn new(token: impl Into<String>, token_type: PushTokenType) -> Self {
        Self {
            token: token.into(),
            token_type,
        }
    }

    /// Hex-encode a raw device token the way the backend expects it.
    pub fn from_device_token(bytes: &[u8], token_type: PushTokenType) -> Self {
        let token = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
        Self { token, token_type }
    }
}

/// Backend environment the widget talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostType {
    #[default]
    Prod,
    Fix,
    Test,
    PreTest,
    Dev,
}

impl HostType {
    pub const ALL: [HostType; 5] = [
        HostType::Prod,
        HostType::Fix,
        HostType::Test,
        HostType::PreTest,
        HostType::Dev,
    ];

    /// Subdomain prefix prepended to the consultant domain.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Prod => "",
            Self::Fix => "fix-",
            Self::Test => "test-",
            Self::PreTest => "pre-test-",
            Self::Dev => "dev-",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Fix => "fix",
            Self::Test => "test",
            Self::PreTest => "pretest",
            Self::Dev => "dev",
        }
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown host type: {0}")]
pub struct UnknownHostType(pub String);

impl FromStr for HostType {
    type Err = UnknownHostType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|host| host.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| UnknownHostType(value.to_string()))
    }
}

/// Identifies the backend channel and environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub app_id: String,
    pub host: HostType,
}

impl SessionConfig {
    pub fn new(app_id: impl Into<String>, host: HostType) -> Self {
        Self {
            app_id: app_id.into(),
            host,
        }
    }

    /// The channel id must be a UUID; anything else is a host integration bug.
    pub fn has_valid_app_id(&self) -> bool {
        uuid::Uuid::parse_str(&self.app_id).is_ok()
    }
}

/// What the content surface is currently showing, as decided by the widget controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "url", rename_all = "camelCase")]
pub enum WidgetLoadState {
    Preparing,
    LoadingLive(Url),
    LoadingFromCache(Url),
    Loaded(Url),
    Error,
}

impl WidgetLoadState {
    pub fn url(&self) -> Option<&Url> {
        match self {
            Self::LoadingLive(url) | Self::LoadingFromCache(url) | Self::Loaded(url) => Some(url),
            Self::Preparing | Self::Error => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::LoadingLive(_) | Self::LoadingFromCache(_))
    }
}

impl fmt::Display for WidgetLoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => f.write_str("preparing"),
            Self::LoadingLive(url) => write!(f, "loading-live({url})"),
            Self::LoadingFromCache(url) => write!(f, "loading-from-cache({url})"),
            Self::Loaded(url) => write!(f, "loaded({url})"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Why the widget ended up in the error state or a push was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum LoadFailure {
    #[error("session configuration is missing an app id or user")]
    ConfigurationMissing,

    #[error("network unavailable and no offline archive")]
    NetworkUnavailable,

    #[error("remote call failed: {0}")]
    RemoteCallFailed(String),

    #[error("content failed to load: {0}")]
    ContentLoadFailed(String),

    #[error("push payload is malformed")]
    MalformedPushPayload,
}

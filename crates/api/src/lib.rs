//! Remote API for the consultant backend.
//!
//! Every call is a `POST {apiBase}{method}` with a JSON object body. Replies are wrapped in
//! `{"jsonrpc", "result", "error"}`; an `error` object or a missing `result` is a failure even
//! when the HTTP status is 2xx.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use sabycom_core::endpoint::api_base_url;
use sabycom_core::model::{HostType, PushToken, User};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("response carried no result")]
    EmptyResult,

    #[error("invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Everything the backend needs to (re)register a user against a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSync {
    pub user: User,
    pub channel_id: String,
    pub push_token: Option<PushToken>,
    pub unsubscribe: bool,
}

impl UserSync {
    pub fn new(user: User, channel_id: impl Into<String>) -> Self {
        Self {
            user,
            channel_id: channel_id.into(),
            push_token: None,
            unsubscribe: false,
        }
    }

    pub fn with_push_token(mut self, push_token: Option<PushToken>) -> Self {
        self.push_token = push_token;
        self
    }

    pub fn unsubscribing(mut self) -> Self {
        self.unsubscribe = true;
        self
    }
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Unread conversation count for `user_id` in `channel_id`.
    async fn unread_count(&self, user_id: &str, channel_id: &str) -> Result<u32, ApiError>;

    /// Register or update the user. Returns the id the backend stored.
    async fn register_user(&self, sync: &UserSync) -> Result<String, ApiError>;

    /// Point subsequent calls at another host environment.
    fn set_host(&self, _host: HostType) {}
}

#[derive(Debug, Deserialize)]
struct BaseResponse<T> {
    result: Option<T>,
    error: Option<ResponseError>,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    code: i64,
    message: String,
    #[serde(default)]
    details: String,
}

#[derive(Debug, Serialize)]
struct UnreadCountParams<'a> {
    #[serde(rename = "userUUID")]
    user_uuid: &'a str,
    #[serde(rename = "channelUUID")]
    channel_uuid: &'a str,
}

#[derive(Debug, Deserialize)]
struct UnreadCountResult {
    count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterUserParams<'a> {
    id: &'a str,
    name: &'a str,
    surname: &'a str,
    email: &'a str,
    phone: &'a str,
    #[serde(rename = "channelUUID")]
    channel_uuid: &'a str,
    push_token: &'a str,
    push_token_type: &'a str,
    unsubscribe: bool,
}

impl<'a> From<&'a UserSync> for RegisterUserParams<'a> {
    fn from(sync: &'a UserSync) -> Self {
        let user = &sync.user;
        Self {
            id: &user.id,
            name: user.name.as_deref().unwrap_or_default(),
            surname: user.surname.as_deref().unwrap_or_default(),
            email: user.email.as_deref().unwrap_or_default(),
            phone: user.phone.as_deref().unwrap_or_default(),
            channel_uuid: &sync.channel_id,
            push_token: sync
                .push_token
                .as_ref()
                .map(|t| t.token.as_str())
                .unwrap_or_default(),
            push_token_type: sync
                .push_token
                .as_ref()
                .map(|t| t.token_type.as_str())
                .unwrap_or_default(),
            unsubscribe: sync.unsubscribe,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterUserResult {
    id: String,
}

pub struct HttpRemoteApi {
    client: Client,
    base_url: RwLock<Url>,
}

impl HttpRemoteApi {
    pub fn new(host: HostType, timeout: Duration) -> Result<Self, ApiError> {
        Self::with_base_url(api_base_url(host)?, timeout)
    }

    /// Talk to an arbitrary base URL. Method names are joined onto it, so it should end in `/`.
    pub fn with_base_url(base_url: Url, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: RwLock::new(base_url),
        })
    }

    pub fn base_url(&self) -> Url {
        self.base_url.read().unwrap().clone()
    }

    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, ApiError>
    where
        P: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.base_url().join(method)?;
        debug!(%url, "calling remote method");

        let resp = self.client.post(url).json(params).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let response: BaseResponse<R> = resp.json().await?;
        if let Some(error) = response.error {
            warn!(
                method,
                code = error.code,
                details = %error.details,
                "remote method returned an error"
            );
            return Err(ApiError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        response.result.ok_or(ApiError::EmptyResult)
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn unread_count(&self, user_id: &str, channel_id: &str) -> Result<u32, ApiError> {
        let params = UnreadCountParams {
            user_uuid: user_id,
            channel_uuid: channel_id,
        };
        let result: UnreadCountResult = self.call("unreadConversationCount", &params).await?;
        Ok(u32::try_from(result.count.max(0)).unwrap_or(u32::MAX))
    }

    async fn register_user(&self, sync: &UserSync) -> Result<String, ApiError> {
        let params = RegisterUserParams::from(sync);
        let result: RegisterUserResult = self.call("registerUser", &params).await?;
        debug!(user_id = %result.id, unsubscribe = sync.unsubscribe, "user registered");
        Ok(result.id)
    }

    fn set_host(&self, host: HostType) {
        match api_base_url(host) {
            Ok(url) => *self.base_url.write().unwrap() = url,
            Err(error) => warn!(%error, %host, "failed to build API URL for host"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use sabycom_core::model::PushTokenType;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn make_api(server: &MockServer, timeout: Duration) -> HttpRemoteApi {
        let base = Url::parse(&format!("{}/service/restapi/", server.uri())).unwrap();
        HttpRemoteApi::with_base_url(base, timeout).unwrap()
    }

    fn ok(result: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "result": result,
            "error": null
        }))
    }

    #[tokio::test]
    async fn unread_count_posts_user_and_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/service/restapi/unreadConversationCount"))
            .and(body_json(json!({"userUUID": "u1", "channelUUID": "a1"})))
            .respond_with(ok(json!({"count": 4})))
            .expect(1)
            .mount(&server)
            .await;

        let api = make_api(&server, DEFAULT_REQUEST_TIMEOUT).await;
        assert_eq!(api.unread_count("u1", "a1").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn negative_count_is_clamped_to_zero() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok(json!({"count": -3})))
            .mount(&server)
            .await;

        let api = make_api(&server, DEFAULT_REQUEST_TIMEOUT).await;
        assert_eq!(api.unread_count("u1", "a1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn envelope_fields_beyond_result_and_error_are_optional() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"result": {"count": 2}})),
            )
            .mount(&server)
            .await;

        let api = make_api(&server, DEFAULT_REQUEST_TIMEOUT).await;
        assert_eq!(api.unread_count("u1", "a1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn error_object_fails_even_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "error": {"code": -32000, "message": "unknown channel", "details": "a1"}
            })))
            .mount(&server)
            .await;

        let api = make_api(&server, DEFAULT_REQUEST_TIMEOUT).await;
        let err = api.unread_count("u1", "a1").await.unwrap_err();
        assert_matches!(err, ApiError::Remote { code: -32000, ref message } if message == "unknown channel");
    }

    #[tokio::test]
    async fn missing_result_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0"})))
            .mount(&server)
            .await;

        let api = make_api(&server, DEFAULT_REQUEST_TIMEOUT).await;
        assert_matches!(api.unread_count("u1", "a1").await, Err(ApiError::EmptyResult));
    }

    #[tokio::test]
    async fn server_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let api = make_api(&server, DEFAULT_REQUEST_TIMEOUT).await;
        let err = api.unread_count("u1", "a1").await.unwrap_err();
        assert_matches!(err, ApiError::Status { status: 503, ref body } if body == "maintenance");
    }

    #[tokio::test]
    async fn slow_server_hits_request_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok(json!({"count": 1})).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let api = make_api(&server, Duration::from_millis(50)).await;
        assert_matches!(api.unread_count("u1", "a1").await, Err(ApiError::Http(_)));
    }

    #[tokio::test]
    async fn register_user_sends_empty_strings_for_missing_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/service/restapi/registerUser"))
            .and(body_json(json!({
                "id": "u1",
                "name": "Ivan",
                "surname": "",
                "email": "",
                "phone": "",
                "channelUUID": "a1",
                "pushToken": "",
                "pushTokenType": "",
                "unsubscribe": false
            })))
            .respond_with(ok(json!({"id": "u1"})))
            .expect(1)
            .mount(&server)
            .await;

        let api = make_api(&server, DEFAULT_REQUEST_TIMEOUT).await;
        let sync = UserSync::new(User::new("u1").with_name("Ivan"), "a1");
        assert_eq!(api.register_user(&sync).await.unwrap(), "u1");
    }

    #[tokio::test]
    async fn register_user_carries_push_token_and_unsubscribe() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/service/restapi/registerUser"))
            .and(body_json(json!({
                "id": "u1",
                "name": "",
                "surname": "",
                "email": "u1@example.com",
                "phone": "",
                "channelUUID": "a1",
                "pushToken": "0aff",
                "pushTokenType": "sandbox",
                "unsubscribe": true
            })))
            .respond_with(ok(json!({"id": "u1"})))
            .expect(1)
            .mount(&server)
            .await;

        let api = make_api(&server, DEFAULT_REQUEST_TIMEOUT).await;
        let sync = UserSync::new(User::new("u1").with_email("u1@example.com"), "a1")
            .with_push_token(Some(PushToken::new("0aff", PushTokenType::Sandbox)))
            .unsubscribing();
        assert!(api.register_user(&sync).await.is_ok());
    }

    #[test]
    fn set_host_switches_base_url() {
        let api = HttpRemoteApi::new(HostType::Prod, DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert_eq!(
            api.base_url().as_str(),
            "https://consultant.sbis.ru/service/restapi/"
        );

        api.set_host(HostType::Test);
        assert_eq!(
            api.base_url().as_str(),
            "https://test-consultant.sbis.ru/service/restapi/"
        );
    }
}

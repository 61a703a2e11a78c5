use chrono::{DateTime, Utc};
use serde_json::Value;
use url::Url;

use sabycom_core::model::LoadFailure;

/// A new-message push addressed to a widget user.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationModel {
    pub id: String,
    pub action: i64,
    pub addressee_id: String,
    pub kind: i64,
    pub channel_id: String,
    pub title: String,
    pub body: String,
    pub avatar_url: Option<Url>,
    pub message_date: DateTime<Utc>,
    pub unread_count: u32,
    pub raw: Value,
}

impl NotificationModel {
    /// Parse a raw push payload. Missing or mistyped required keys make it not ours.
    pub fn parse(payload: &Value) -> Result<Self, LoadFailure> {
        let malformed = || LoadFailure::MalformedPushPayload;

        let id = payload.get("id").and_then(Value::as_str).ok_or_else(malformed)?;
        let action = payload.get("action").and_then(Value::as_i64).ok_or_else(malformed)?;
        let addressee_id = payload
            .get("addresseeId")
            .and_then(Value::as_str)
            .ok_or_else(malformed)?;
        let kind = payload.get("type").and_then(Value::as_i64).ok_or_else(malformed)?;
        let timestamp_ms = payload
            .get("timestamp")
            .and_then(Value::as_f64)
            .ok_or_else(malformed)?;
        let data = payload
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(malformed)?;
        // Any number is a valid date; values past chrono's range pin to its bounds.
        let message_date = DateTime::from_timestamp_millis(timestamp_ms as i64).unwrap_or(
            if timestamp_ms < 0.0 {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            },
        );

        let alert = payload.pointer("/aps/alert");
        let alert_text = |key: &str| {
            alert
                .and_then(|alert| alert.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Ok(Self {
            id: id.to_string(),
            action,
            addressee_id: addressee_id.to_string(),
            kind,
            channel_id: data
                .get("channelUUID")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            title: alert_text("title"),
            body: alert_text("body"),
            avatar_url: data
                .get("operatorPhoto")
                .and_then(Value::as_str)
                .and_then(|photo| Url::parse(photo).ok()),
            message_date,
            unread_count: data
                .get("unreadCount")
                .and_then(Value::as_u64)
                .and_then(|count| u32::try_from(count).ok())
                .unwrap_or(0),
            raw: payload.clone(),
        })
    }

    pub fn is_addressed_to(&self, user_id: &str) -> bool {
        self.addressee_id.eq_ignore_ascii_case(user_id)
    }
}

/// Whether `payload` is a widget push meant for the current user.
pub fn is_sabycom_push(payload: &Value, current_user_id: Option<&str>) -> bool {
    let Some(user_id) = current_user_id else {
        return false;
    };
    NotificationModel::parse(payload).is_ok_and(|model| model.is_addressed_to(user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use sabycom_test_support::fixtures;
    use serde_json::json;

    #[test]
    fn parses_full_payload() {
        let model = NotificationModel::parse(&fixtures::push("new-message.json")).unwrap();

        assert_eq!(model.addressee_id, "u1");
        assert_eq!(model.action, 1);
        assert_eq!(model.kind, 0);
        assert_eq!(model.channel_id, "9b0a0a94-4e0c-4c39-8f34-6fcf8f1d1f6e");
        assert_eq!(model.title, "Support");
        assert_eq!(model.body, "Hello! How can we help?");
        assert_eq!(model.unread_count, 3);
        assert_eq!(model.message_date.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(
            model.avatar_url.unwrap().as_str(),
            "https://consultant.sbis.ru/static/operator.png"
        );
    }

    #[test]
    fn optional_keys_default() {
        let model = NotificationModel::parse(&fixtures::push("zero-unread.json")).unwrap();
        assert_eq!(model.unread_count, 0);
        assert!(model.title.is_empty());
        assert!(model.avatar_url.is_none());
    }

    #[test]
    fn missing_addressee_is_malformed() {
        let result = NotificationModel::parse(&fixtures::push("missing-addressee.json"));
        assert_matches!(result, Err(LoadFailure::MalformedPushPayload));
    }

    #[test]
    fn mistyped_required_key_is_malformed() {
        let mut payload = fixtures::push("new-message.json");
        payload["action"] = json!("1");
        assert!(NotificationModel::parse(&payload).is_err());

        let mut payload = fixtures::push("new-message.json");
        payload["data"] = json!([]);
        assert!(NotificationModel::parse(&payload).is_err());
    }

    #[test]
    fn out_of_range_timestamp_is_clamped() {
        let mut payload = fixtures::push("new-message.json");
        payload["timestamp"] = json!(1e300);
        let model = NotificationModel::parse(&payload).unwrap();
        assert_eq!(model.message_date, DateTime::<Utc>::MAX_UTC);

        payload["timestamp"] = json!(-1e300);
        let model = NotificationModel::parse(&payload).unwrap();
        assert_eq!(model.message_date, DateTime::<Utc>::MIN_UTC);
        assert!(is_sabycom_push(&payload, Some("u1")));
    }

    #[test]
    fn foreign_push_is_not_ours() {
        assert!(!is_sabycom_push(&fixtures::push("foreign.json"), Some("u1")));
    }

    #[test]
    fn push_must_match_current_user() {
        let payload = fixtures::push("new-message.json");
        assert!(is_sabycom_push(&payload, Some("u1")));
        assert!(is_sabycom_push(&payload, Some("U1")));
        assert!(!is_sabycom_push(&payload, Some("u2")));
        assert!(!is_sabycom_push(&payload, None));
    }
}

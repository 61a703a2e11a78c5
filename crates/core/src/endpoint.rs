//! URLs of the hosted widget and of the REST API behind it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::json;
use url::Url;

use crate::model::{HostType, SessionConfig};

const CONSULTANT_DOMAIN: &str = "consultant.sbis.ru";

/// Characters left untouched when encoding a query component.
const QUERY_ALLOWED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b'-')
    .remove(b'.')
    .remove(b'/')
    .remove(b':')
    .remove(b';')
    .remove(b'=')
    .remove(b'?')
    .remove(b'@')
    .remove(b'_')
    .remove(b'~');

pub fn widget_base_url(host: HostType, app_id: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "https://{}{CONSULTANT_DOMAIN}/consultant/{app_id}",
        host.prefix()
    ))
}

pub fn api_base_url(host: HostType) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "https://{}{CONSULTANT_DOMAIN}/service/restapi/",
        host.prefix()
    ))
}

/// Build the URL the content surface loads for `user_id` on the configured channel.
///
/// The endpoint descriptor travels in the `p` query parameter as base64 of the
/// percent-encoded JSON `{"ep":{"id":..,"service_id":..}}`.
pub fn session_url(config: &SessionConfig, user_id: &str) -> Result<Url, url::ParseError> {
    let mut url = widget_base_url(config.host, &config.app_id)?;
    url.query_pairs_mut()
        .append_pair("p", &endpoint_parameter(user_id, &config.app_id));
    Ok(url)
}

fn endpoint_parameter(user_id: &str, app_id: &str) -> String {
    // serde_json maps keep keys sorted
    let descriptor = json!({
        "ep": {
            "id": user_id,
            "service_id": app_id,
        }
    })
    .to_string();
    let encoded = utf8_percent_encode(&descriptor, QUERY_ALLOWED).to_string();
    STANDARD.encode(encoded)
}

/// Decode the endpoint descriptor back out of a session URL.
pub fn decode_endpoint_parameter(url: &Url) -> Option<serde_json::Value> {
    let (_, value) = url.query_pairs().find(|(key, _)| key == "p")?;
    let bytes = STANDARD.decode(value.as_bytes()).ok()?;
    let encoded = String::from_utf8(bytes).ok()?;
    let decoded = percent_encoding::percent_decode_str(&encoded)
        .decode_utf8()
        .ok()?;
    serde_json::from_str(&decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widget_url_uses_host_prefix() {
        let url = widget_base_url(HostType::PreTest, "a1").unwrap();
        assert_eq!(url.as_str(), "https://pre-test-consultant.sbis.ru/consultant/a1");
    }

    #[test]
    fn api_url_for_prod_has_no_prefix() {
        let url = api_base_url(HostType::Prod).unwrap();
        assert_eq!(url.as_str(), "https://consultant.sbis.ru/service/restapi/");
    }

    #[test]
    fn session_url_carries_user_and_app() {
        let config = SessionConfig::new("a1", HostType::Test);
        let url = session_url(&config, "u1").unwrap();

        assert_eq!(url.host_str(), Some("test-consultant.sbis.ru"));
        assert_eq!(url.path(), "/consultant/a1");

        let descriptor = decode_endpoint_parameter(&url).unwrap();
        assert_eq!(descriptor["ep"]["id"], "u1");
        assert_eq!(descriptor["ep"]["service_id"], "a1");
    }

    #[test]
    fn endpoint_parameter_is_stable_for_same_input() {
        assert_eq!(endpoint_parameter("u1", "a1"), endpoint_parameter("u1", "a1"));
        assert_ne!(endpoint_parameter("u1", "a1"), endpoint_parameter("u2", "a1"));
    }

    #[test]
    fn endpoint_descriptor_keys_are_sorted_and_encoded() {
        let encoded = endpoint_parameter("u1", "a1");
        let bytes = STANDARD.decode(encoded).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "%7B%22ep%22:%7B%22id%22:%22u1%22,%22service_id%22:%22a1%22%7D%7D"
        );
    }

    #[test]
    fn url_without_parameter_decodes_to_none() {
        let url = widget_base_url(HostType::Prod, "a1").unwrap();
        assert!(decode_endpoint_parameter(&url).is_none());
    }
}

//! Thrift layout of the CONNECT payload.

use bytes::Bytes;
use serde_json::json;

use super::{APP_ID, AuthSession, CLIENT_TYPE, ConnectDescriptor};
use crate::thrift::CompactWriter;

mod field {
    pub const CLIENT_IDENTIFIER: i16 = 1;
    pub const CLIENT_INFO: i16 = 4;
    pub const PASSWORD: i16 = 5;
    pub const APP_SPECIFIC_INFO: i16 = 10;
}

mod client_info {
    pub const USER_ID: i16 = 1;
    pub const USER_AGENT: i16 = 2;
    pub const CLIENT_CAPABILITIES: i16 = 3;
    pub const ENDPOINT_CAPABILITIES: i16 = 4;
    pub const PUBLISH_FORMAT: i16 = 5;
    pub const NO_AUTOMATIC_FOREGROUND: i16 = 6;
    pub const MAKE_USER_AVAILABLE_IN_FOREGROUND: i16 = 7;
    pub const DEVICE_ID: i16 = 8;
    pub const IS_INITIALLY_FOREGROUND: i16 = 9;
    pub const NETWORK_TYPE: i16 = 10;
    pub const NETWORK_SUBTYPE: i16 = 11;
    pub const CLIENT_MQTT_SESSION_ID: i16 = 12;
    pub const SUBSCRIBE_TOPICS: i16 = 14;
    pub const CLIENT_TYPE: i16 = 15;
    pub const APP_ID: i16 = 16;
    pub const DEVICE_SECRET: i16 = 20;
    pub const CLIENT_STACK: i16 = 21;
}

/// Everclear subscription ids requested alongside the connect.
const EVERCLEAR_SUBSCRIPTIONS: [(&str, &str); 4] = [
    ("inapp_notification_subscribe_comment", "17899377895239777"),
    (
        "inapp_notification_subscribe_comment_mention_and_reply",
        "17899377895239777",
    ),
    ("video_call_participant_state_delivery", "17977239895057311"),
    ("presence_subscribe", "17846944882223835"),
];

pub(super) fn app_specific_info(session: &AuthSession) -> Vec<(String, String)> {
    let everclear: serde_json::Map<String, serde_json::Value> = EVERCLEAR_SUBSCRIPTIONS
        .iter()
        .map(|(k, v)| ((*k).to_owned(), json!(v)))
        .collect();
    vec![
        ("app_version".into(), session.app_version.clone()),
        ("X-IG-Capabilities".into(), session.capabilities_header.clone()),
        (
            "everclear_subscriptions".into(),
            serde_json::Value::Object(everclear).to_string(),
        ),
        ("User-Agent".into(), session.user_agent.clone()),
        ("Accept-Language".into(), session.language.replace('_', "-")),
    ]
}

pub(super) fn to_thrift(descriptor: &ConnectDescriptor) -> Bytes {
    let mut writer = CompactWriter::new();
    writer.write_string(field::CLIENT_IDENTIFIER, &descriptor.client_identifier);

    writer.begin_struct(field::CLIENT_INFO);
    writer.write_i64(client_info::USER_ID, descriptor.user_id);
    writer.write_string(client_info::USER_AGENT, &descriptor.user_agent);
    writer.write_i64(client_info::CLIENT_CAPABILITIES, descriptor.capability_flags);
    writer.write_i64(client_info::ENDPOINT_CAPABILITIES, 0);
    writer.write_i32(client_info::PUBLISH_FORMAT, 1);
    writer.write_bool(client_info::NO_AUTOMATIC_FOREGROUND, false);
    writer.write_bool(client_info::MAKE_USER_AVAILABLE_IN_FOREGROUND, true);
    writer.write_string(client_info::DEVICE_ID, &descriptor.device_id);
    writer.write_bool(client_info::IS_INITIALLY_FOREGROUND, true);
    writer.write_i32(client_info::NETWORK_TYPE, 1);
    writer.write_i32(client_info::NETWORK_SUBTYPE, 0);
    writer.write_i64(client_info::CLIENT_MQTT_SESSION_ID, descriptor.mqtt_session_id);
    let topics: Vec<i32> = descriptor
        .subscribed_topic_ids
        .iter()
        .map(|id| i32::from(*id))
        .collect();
    writer.write_i32_list(client_info::SUBSCRIBE_TOPICS, &topics);
    writer.write_string(client_info::CLIENT_TYPE, CLIENT_TYPE);
    writer.write_i64(client_info::APP_ID, APP_ID);
    writer.write_string(client_info::DEVICE_SECRET, "");
    writer.write_byte(client_info::CLIENT_STACK, 3);
    writer.end_struct();

    writer.write_string(field::PASSWORD, &descriptor.password());
    writer.write_string_map(
        field::APP_SPECIFIC_INFO,
        descriptor
            .app_specific_info
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str())),
    );
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::ConnectionBuilder;

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn payload_carries_identity_and_password() {
        let mut session = AuthSession::new("42");
        session.device_id = "device-abcdefghijklmnopqrstuvwxyz".into();
        session.user_agent = "Instagram 1.0 Android".into();
        session.cookies.insert("sessionid".into(), "secret".into());
        let descriptor = ConnectionBuilder::new(&session).build_at(1).expect("build");

        let bytes = descriptor.to_thrift();
        assert_eq!(bytes[0], 0x18, "client identifier is field 1 binary");
        assert!(contains(&bytes, b"device-abcdefghijklm"));
        assert!(contains(&bytes, b"sessionid=secret"));
        assert!(contains(&bytes, CLIENT_TYPE.as_bytes()));
        assert!(contains(&bytes, b"presence_subscribe"));
        assert_eq!(bytes.last(), Some(&0x00));
    }

    #[test]
    fn accept_language_uses_hyphen() {
        let session = AuthSession::new("42");
        let info = app_specific_info(&session);
        assert!(info.contains(&("Accept-Language".to_owned(), "en-US".to_owned())));
    }

    #[test]
    fn compressed_payload_inflates_to_thrift() {
        let session = AuthSession::new("42");
        let descriptor = ConnectionBuilder::new(&session).build_at(1).expect("build");
        let payload = descriptor.to_payload().expect("compress");
        let inflated = crate::codec::decompress(payload);
        assert_eq!(inflated.bytes, descriptor.to_thrift());
    }
}

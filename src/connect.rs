//! Connection builder for the broker handshake.
//!
//! [`ConnectionBuilder`] turns an [`AuthSession`] into a [`ConnectDescriptor`]:
//! identity, capability flags, the resolved credential token and the topic
//! ids to subscribe to at connect time. It performs no I/O. The descriptor
//! serialises to the compressed thrift blob carried in the CONNECT payload.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use thiserror::Error;

use crate::topic::DEFAULT_SUBSCRIBE_TOPICS;

mod credentials;
mod payload;

pub use credentials::CredentialSource;

/// Client capability bitmask advertised to the broker.
pub const CLIENT_CAPABILITIES: i64 = 183;
/// Application identifier of the official client.
pub const APP_ID: i64 = 567_067_343_352_427;
/// Client type advertised when authenticating with a session cookie.
pub const CLIENT_TYPE: &str = "cookie_auth";
/// Length of the client identifier derived from the device id.
pub const CLIENT_IDENTIFIER_LEN: usize = 20;

/// Authenticated session data needed to open a realtime connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthSession {
    /// Numeric account id, as a decimal string.
    pub user_id: String,
    /// `Authorization` header value (`Bearer IGT:2:...`).
    pub authorization: Option<String>,
    /// Cookie values by name.
    pub cookies: BTreeMap<String, String>,
    /// Session id from previously parsed authorization metadata.
    pub parsed_session_id: Option<String>,
    /// Device (phone) id.
    pub device_id: String,
    /// Application user agent.
    pub user_agent: String,
    /// Application version string.
    pub app_version: String,
    /// Value of the capabilities header.
    pub capabilities_header: String,
    /// Locale such as `en_US`.
    pub language: String,
}

impl AuthSession {
    /// Create a session for `user_id` with empty credentials.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            language: "en_US".to_owned(),
            ..Self::default()
        }
    }
}

/// Errors raised while building a connect descriptor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// The session carries no user id.
    #[error("session has no user id")]
    MissingUserId,
    /// The user id is not a decimal integer.
    #[error("user id is not numeric: {0}")]
    InvalidUserId(String),
}

/// Everything required to serialise a CONNECT payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectDescriptor {
    /// First 20 characters of the device id.
    pub client_identifier: String,
    /// Numeric account id.
    pub user_id: i64,
    /// Application user agent.
    pub user_agent: String,
    /// Client capability bitmask.
    pub capability_flags: i64,
    /// Device id.
    pub device_id: String,
    /// Per-attempt session id, distinct for every descriptor built.
    pub mqtt_session_id: i64,
    /// Session token sent as `sessionid=<token>`.
    pub credential_token: String,
    /// Where the token came from.
    pub credential_source: CredentialSource,
    /// Topic ids requested at connect time.
    pub subscribed_topic_ids: Vec<u16>,
    /// Application-specific string map.
    pub app_specific_info: Vec<(String, String)>,
}

impl ConnectDescriptor {
    /// Connect password field.
    #[must_use]
    pub fn password(&self) -> String { format!("sessionid={}", self.credential_token) }

    /// Serialise to the thrift-compact connect struct (uncompressed).
    #[must_use]
    pub fn to_thrift(&self) -> Bytes { payload::to_thrift(self) }

    /// Serialise and zlib-compress the CONNECT payload.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if compression fails.
    pub fn to_payload(&self) -> std::io::Result<Bytes> {
        crate::codec::compress(&self.to_thrift()).map(Bytes::from)
    }
}

/// Builds [`ConnectDescriptor`] values from an [`AuthSession`].
///
/// # Examples
///
/// ```
/// use mqttot::connect::{AuthSession, ConnectionBuilder, CredentialSource};
///
/// let mut session = AuthSession::new("1234");
/// session.device_id = "android-0123456789abcdef0".into();
/// session.cookies.insert("sessionid".into(), "tok".into());
///
/// let descriptor = ConnectionBuilder::new(&session).build().expect("user id present");
/// assert_eq!(descriptor.client_identifier, "android-0123456789ab");
/// assert_eq!(descriptor.password(), "sessionid=tok");
/// assert_eq!(descriptor.credential_source, CredentialSource::Cookie);
/// ```
#[derive(Clone, Debug)]
pub struct ConnectionBuilder<'a> {
    session: &'a AuthSession,
    topics: Vec<u16>,
}

impl<'a> ConnectionBuilder<'a> {
    /// Start from `session` with the default connect-time topics.
    #[must_use]
    pub fn new(session: &'a AuthSession) -> Self {
        Self {
            session,
            topics: DEFAULT_SUBSCRIBE_TOPICS.to_vec(),
        }
    }

    /// Override the topic ids requested at connect time. An empty list keeps
    /// the defaults.
    #[must_use]
    pub fn topics(mut self, topics: impl IntoIterator<Item = u16>) -> Self {
        let topics: Vec<u16> = topics.into_iter().collect();
        if !topics.is_empty() {
            self.topics = topics;
        }
        self
    }

    /// Build a descriptor using the current wall clock.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if the user id is missing or not numeric.
    pub fn build(self) -> Result<ConnectDescriptor, BuildError> { self.build_at(now_ms()) }

    /// Build a descriptor as of `now_ms` (milliseconds since the epoch).
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if the user id is missing or not numeric.
    pub fn build_at(self, now_ms: u64) -> Result<ConnectDescriptor, BuildError> {
        let raw_id = self.session.user_id.trim();
        if raw_id.is_empty() {
            return Err(BuildError::MissingUserId);
        }
        let user_id: i64 = raw_id
            .parse()
            .map_err(|_| BuildError::InvalidUserId(raw_id.to_owned()))?;

        let (credential_token, credential_source) = credentials::resolve_token(self.session, user_id, now_ms);
        if credential_source == CredentialSource::Placeholder {
            tracing::warn!(user_id, "no session token found; using placeholder credential");
        } else {
            tracing::debug!(
                ?credential_source,
                token_prefix = %credential_token.chars().take(8).collect::<String>(),
                "resolved connect credential"
            );
        }

        let session = self.session;
        Ok(ConnectDescriptor {
            client_identifier: session.device_id.chars().take(CLIENT_IDENTIFIER_LEN).collect(),
            user_id,
            user_agent: session.user_agent.clone(),
            capability_flags: CLIENT_CAPABILITIES,
            device_id: session.device_id.clone(),
            mqtt_session_id: next_mqtt_session_id(now_ms),
            credential_token,
            credential_source,
            subscribed_topic_ids: self.topics,
            app_specific_info: payload::app_specific_info(session),
        })
    }
}

static LAST_MQTT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// Derive the per-attempt session id from the clock (low 32 bits), bumped
/// when needed so that no two descriptors in this process share one.
fn next_mqtt_session_id(now_ms: u64) -> i64 {
    let candidate = now_ms & 0xFFFF_FFFF;
    let mut previous = LAST_MQTT_SESSION_ID.load(Ordering::Relaxed);
    loop {
        let next = if candidate > previous {
            candidate
        } else {
            (previous + 1) & 0xFFFF_FFFF
        };
        match LAST_MQTT_SESSION_ID.compare_exchange_weak(previous, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return i64::try_from(next).unwrap_or_default(),
            Err(actual) => previous = actual,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("", BuildError::MissingUserId)]
    #[case("  ", BuildError::MissingUserId)]
    #[case("abc", BuildError::InvalidUserId("abc".into()))]
    fn user_id_is_required(#[case] user_id: &str, #[case] expected: BuildError) {
        let session = AuthSession::new(user_id);
        assert_eq!(ConnectionBuilder::new(&session).build_at(1), Err(expected));
    }

    #[test]
    fn session_ids_are_distinct_for_the_same_instant() {
        let session = AuthSession::new("42");
        let first = ConnectionBuilder::new(&session).build_at(5_000).expect("build");
        let second = ConnectionBuilder::new(&session).build_at(5_000).expect("build");
        assert_ne!(first.mqtt_session_id, second.mqtt_session_id);
    }

    #[test]
    fn empty_topic_override_keeps_defaults() {
        let session = AuthSession::new("42");
        let descriptor = ConnectionBuilder::new(&session).topics([]).build_at(1).expect("build");
        assert_eq!(descriptor.subscribed_topic_ids, DEFAULT_SUBSCRIBE_TOPICS.to_vec());

        let custom = ConnectionBuilder::new(&session).topics([146]).build_at(1).expect("build");
        assert_eq!(custom.subscribed_topic_ids, vec![146]);
    }

    #[test]
    fn placeholder_credentials_still_build() {
        let session = AuthSession::new("42");
        let descriptor = ConnectionBuilder::new(&session).build_at(99).expect("build");
        assert_eq!(descriptor.credential_source, CredentialSource::Placeholder);
        assert_eq!(descriptor.password(), "sessionid=42_99");
    }
}

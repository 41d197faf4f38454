//! Session-token extraction for the connect password.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE},
};
use serde::Deserialize;

use super::AuthSession;

/// Where the credential token used in the connect password came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    /// Decoded from the bearer authorization header.
    Bearer,
    /// Read from the `sessionid` cookie.
    Cookie,
    /// Taken from previously parsed authorization metadata.
    ParsedAuthorization,
    /// Synthesised from the user id and clock; the broker will reject it.
    Placeholder,
}

#[derive(Deserialize)]
struct BearerClaims {
    sessionid: Option<String>,
}

const BEARER_PREFIXES: [&str; 2] = ["Bearer IGT:2:", "Bearer "];

/// Decode the session id embedded in a `Bearer IGT:2:<base64 json>` header.
pub(crate) fn session_id_from_bearer(header: &str) -> Option<String> {
    let encoded = BEARER_PREFIXES
        .iter()
        .find_map(|prefix| header.strip_prefix(prefix))
        .unwrap_or(header)
        .trim();
    let raw = STANDARD
        .decode(encoded)
        .or_else(|_| URL_SAFE.decode(encoded))
        .ok()?;
    let claims: BearerClaims = serde_json::from_slice(&raw).ok()?;
    claims
        .sessionid
        .map(|id| percent_decode(&id))
        .filter(|id| !id.is_empty())
}

/// Resolve the credential token, trying each source in priority order.
pub(crate) fn resolve_token(session: &AuthSession, user_id: i64, now_ms: u64) -> (String, CredentialSource) {
    if let Some(token) = session
        .authorization
        .as_deref()
        .and_then(session_id_from_bearer)
    {
        return (token, CredentialSource::Bearer);
    }
    if let Some(token) = session.cookies.get("sessionid").filter(|v| !v.is_empty()) {
        return (token.clone(), CredentialSource::Cookie);
    }
    if let Some(token) = session
        .parsed_session_id
        .as_ref()
        .filter(|v| !v.is_empty())
    {
        return (token.clone(), CredentialSource::ParsedAuthorization);
    }
    (format!("{user_id}_{now_ms}"), CredentialSource::Placeholder)
}

/// Decode `%XX` escapes; malformed escapes are kept verbatim.
pub(crate) fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = bytes
                .get(idx + 1..idx + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok());
            if let Some(byte) = hex {
                out.push(byte);
                idx += 3;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn bearer(json: &str) -> String { format!("Bearer IGT:2:{}", STANDARD.encode(json)) }

    #[test]
    fn bearer_session_id_is_url_decoded() {
        let header = bearer(r#"{"ds_user_id":"42","sessionid":"42%3Aabc%3A1"}"#);
        assert_eq!(session_id_from_bearer(&header).as_deref(), Some("42:abc:1"));
    }

    #[rstest]
    #[case("Bearer IGT:2:!!!")]
    #[case("Bearer IGT:2:e30=")]
    #[case("")]
    fn unusable_bearer_yields_nothing(#[case] header: &str) {
        assert_eq!(session_id_from_bearer(header), None);
    }

    #[rstest]
    #[case("a%20b", "a b")]
    #[case("100%", "100%")]
    #[case("%zz", "%zz")]
    fn percent_decoding(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(percent_decode(input), expected);
    }

    #[test]
    fn sources_are_tried_in_order() {
        let mut session = AuthSession::new("42");
        session.parsed_session_id = Some("parsed".into());
        assert_eq!(
            resolve_token(&session, 42, 7),
            ("parsed".into(), CredentialSource::ParsedAuthorization)
        );

        session.cookies.insert("sessionid".into(), "cookie".into());
        assert_eq!(
            resolve_token(&session, 42, 7),
            ("cookie".into(), CredentialSource::Cookie)
        );

        session.authorization = Some(bearer(r#"{"sessionid":"jwt"}"#));
        assert_eq!(
            resolve_token(&session, 42, 7),
            ("jwt".into(), CredentialSource::Bearer)
        );
    }

    #[test]
    fn placeholder_is_last_resort() {
        let session = AuthSession::new("42");
        assert_eq!(
            resolve_token(&session, 42, 1_700_000_000_000),
            ("42_1700000000000".into(), CredentialSource::Placeholder)
        );
    }
}

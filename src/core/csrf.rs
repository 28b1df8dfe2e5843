use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use http::{HeaderMap, header};
use rand::RngCore;

/// Cookie carrying the CSRF token. HttpOnly, so scripts echo the copy they
/// received in the issuance response body instead.
pub const CSRF_COOKIE: &str = "vaultgate_csrf";

/// Request header the frontend sends the token back in.
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Issues and verifies CSRF tokens using a double-submit scheme: the signed
/// token travels both as a cookie and as a request header, and state-changing
/// requests must present a matching, authentic pair.
///
/// The signing key lives only in process memory and is drawn fresh at every
/// launch. Restarting the service therefore invalidates all outstanding
/// tokens, which the frontend handles by re-fetching one.
pub struct CsrfProtect {
    key: [u8; 32],
}

impl CsrfProtect {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Mint a fresh token: 32 random bytes plus their keyed MAC, base64url.
    pub fn issue(&self) -> String {
        let mut token = [0u8; 32];
        rand::rng().fill_bytes(&mut token);
        self.seal(&token)
    }

    /// Check that a presented value is an authentic token from this process.
    pub fn verify(&self, presented: &str) -> bool {
        self.open(presented).is_some()
    }

    /// Check a cookie/header pair: both must be authentic and carry the same
    /// token. Token equality is compared through keyed MACs, so the whole
    /// check stays constant-time.
    pub fn verify_pair(&self, cookie: &str, header: &str) -> bool {
        match (self.open(cookie), self.open(header)) {
            (Some(a), Some(b)) => {
                blake3::keyed_hash(&self.key, &a) == blake3::keyed_hash(&self.key, &b)
            }
            _ => false,
        }
    }

    fn seal(&self, token: &[u8; 32]) -> String {
        let mac = blake3::keyed_hash(&self.key, token);
        let mut blob = [0u8; 64];
        blob[..32].copy_from_slice(token);
        blob[32..].copy_from_slice(mac.as_bytes());
        URL_SAFE_NO_PAD.encode(blob)
    }

    fn open(&self, presented: &str) -> Option<[u8; 32]> {
        let blob = URL_SAFE_NO_PAD.decode(presented).ok()?;
        if blob.len() != 64 {
            return None;
        }
        let mut token = [0u8; 32];
        token.copy_from_slice(&blob[..32]);
        let mut mac = [0u8; 32];
        mac.copy_from_slice(&blob[32..]);
        // blake3::Hash equality is constant-time.
        if blake3::keyed_hash(&self.key, &token) == blake3::Hash::from(mac) {
            Some(token)
        } else {
            None
        }
    }
}

impl Default for CsrfProtect {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the Set-Cookie value for a freshly issued token.
pub fn build_cookie(value: &str, secure: bool) -> String {
    let mut cookie = format!("{CSRF_COOKIE}={value}; Path=/; HttpOnly; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Pull a named cookie out of the request headers.
pub fn cookie_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=') {
                if k == name {
                    return Some(v);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn test_issued_token_verifies() {
        let csrf = CsrfProtect::new();
        let token = csrf.issue();
        assert!(csrf.verify(&token));
        assert!(csrf.verify_pair(&token, &token));
    }

    #[test]
    fn test_tampered_token_fails() {
        let csrf = CsrfProtect::new();
        let token = csrf.issue();

        // Flip one character somewhere in the middle.
        let mut bytes = token.into_bytes();
        bytes[20] = if bytes[20] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert!(!csrf.verify(&tampered));
    }

    #[test]
    fn test_garbage_and_truncated_tokens_fail() {
        let csrf = CsrfProtect::new();
        assert!(!csrf.verify(""));
        assert!(!csrf.verify("not base64 ~~~"));
        assert!(!csrf.verify(&URL_SAFE_NO_PAD.encode([0u8; 16])));
    }

    #[test]
    fn test_restart_invalidates_outstanding_tokens() {
        let before = CsrfProtect::new();
        let token = before.issue();

        // A new instance stands in for the relaunched process.
        let after = CsrfProtect::new();
        assert!(!after.verify(&token));
    }

    #[test]
    fn test_two_distinct_tokens_do_not_pair() {
        let csrf = CsrfProtect::new();
        let a = csrf.issue();
        let b = csrf.issue();
        assert!(csrf.verify(&a));
        assert!(csrf.verify(&b));
        assert!(!csrf.verify_pair(&a, &b));
    }

    #[test]
    fn test_cookie_rendering_honours_secure_flag() {
        let plain = build_cookie("tok", false);
        assert_eq!(plain, "vaultgate_csrf=tok; Path=/; HttpOnly; SameSite=Lax");

        let secure = build_cookie("tok", true);
        assert!(secure.ends_with("; Secure"));
    }

    #[test]
    fn test_cookie_value_extraction() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; vaultgate_csrf=abc123; lang=en"),
        );
        assert_eq!(cookie_value(&headers, CSRF_COOKIE), Some("abc123"));
        assert_eq!(cookie_value(&headers, "theme"), Some("dark"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_cookie_value_across_multiple_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(
            header::COOKIE,
            HeaderValue::from_static("vaultgate_csrf=abc123"),
        );
        assert_eq!(cookie_value(&headers, CSRF_COOKIE), Some("abc123"));
    }
}

use constant_time_eq::constant_time_eq;
use std::fmt;

/// SASL mechanisms offered in the EHLO reply.
pub const ADVERTISED_MECHANISMS: &str = "PLAIN LOGIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
}

impl Mechanism {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Mechanism::Plain),
            "LOGIN" => Some(Mechanism::Login),
            _ => None,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::Plain => f.write_str("PLAIN"),
            Mechanism::Login => f.write_str("LOGIN"),
        }
    }
}

/// Outcome of one AUTH attempt. `handled` is always set: there is no
/// fallback policy behind the authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthResult {
    pub success: bool,
    pub handled: bool,
}

impl AuthResult {
    fn accepted() -> Self {
        AuthResult {
            success: true,
            handled: true,
        }
    }

    fn rejected() -> Self {
        AuthResult {
            success: false,
            handled: true,
        }
    }
}

/// Checks AUTH credentials against the configured pair.
#[derive(Clone)]
pub struct Authenticator {
    username: String,
    password: String,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Authenticator {
            username: username.into(),
            password: password.into(),
        }
    }

    /// True when a username and a password are both configured.
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// Validates a decoded credential payload.
    ///
    /// `PLAIN`: `authzid NUL authcid NUL passwd` (RFC 4616).
    /// `LOGIN`: `username NUL password`, as collected by the session.
    /// With no credentials configured every attempt is rejected.
    pub fn validate(&self, mechanism: Mechanism, payload: &[u8]) -> AuthResult {
        if !self.is_configured() {
            return AuthResult::rejected();
        }

        let fields: Vec<&[u8]> = payload.split(|b| *b == 0).collect();
        let (user, pass) = match (mechanism, fields.as_slice()) {
            (Mechanism::Plain, [_authzid, user, pass]) => (*user, *pass),
            (Mechanism::Login, [user, pass]) => (*user, *pass),
            _ => return AuthResult::rejected(),
        };

        let user_ok = constant_time_eq(user, self.username.as_bytes());
        let pass_ok = constant_time_eq(pass, self.password.as_bytes());
        if user_ok && pass_ok {
            AuthResult::accepted()
        } else {
            AuthResult::rejected()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_accepts_matching_credentials() {
        let auth = Authenticator::new("user", "secret");
        let result = auth.validate(Mechanism::Plain, b"\0user\0secret");
        assert_eq!(result, AuthResult { success: true, handled: true });
        assert!(auth.validate(Mechanism::Plain, b"admin\0user\0secret").success);
    }

    #[test]
    fn plain_rejects_wrong_credentials() {
        let auth = Authenticator::new("user", "secret");
        assert!(!auth.validate(Mechanism::Plain, b"\0user\0wrong").success);
        assert!(!auth.validate(Mechanism::Plain, b"\0other\0secret").success);
        assert!(!auth.validate(Mechanism::Plain, b"\0user\0secret\0").success);
    }

    #[test]
    fn malformed_payload_is_a_rejection() {
        let auth = Authenticator::new("user", "secret");
        for payload in [&b""[..], b"user", b"\0user", b"\xff\xfe"] {
            let result = auth.validate(Mechanism::Plain, payload);
            assert!(!result.success);
            assert!(result.handled);
        }
    }

    #[test]
    fn unconfigured_server_rejects_everything() {
        let auth = Authenticator::new("", "");
        assert!(!auth.is_configured());
        assert!(!auth.validate(Mechanism::Plain, b"\0\0").success);
        assert!(!auth.validate(Mechanism::Plain, b"\0user\0secret").success);
        assert!(!auth.validate(Mechanism::Login, b"\0").success);
        assert!(auth.validate(Mechanism::Login, b"\0").handled);
    }

    #[test]
    fn login_uses_collected_pair() {
        let auth = Authenticator::new("user", "secret");
        assert!(auth.validate(Mechanism::Login, b"user\0secret").success);
        assert!(!auth.validate(Mechanism::Login, b"user\0nope").success);
    }

    #[test]
    fn mechanism_names_are_case_insensitive() {
        assert_eq!(Mechanism::parse("plain"), Some(Mechanism::Plain));
        assert_eq!(Mechanism::parse("LOGIN"), Some(Mechanism::Login));
        assert_eq!(Mechanism::parse("CRAM-MD5"), None);
        assert_eq!(Mechanism::Plain.to_string(), "PLAIN");
    }
}

//! SASL mechanisms for the Bind operation.
//!
//! A mechanism only produces and consumes credential bytes. The bind exchange itself,
//! with its repeated `saslBindInProgress` round trips, is driven by the connection.

use crate::result::{LdapError, Result};

/// Credential exchange of a SASL mechanism.
pub trait SaslMechanism: Send + Sync {
    /// Mechanism name, as registered with IANA.
    fn name(&self) -> &str;

    /// Credentials sent with the first Bind request.
    fn initial_response(&self) -> Result<Option<Vec<u8>>>;

    /// Answer a server challenge. Called for every response with result code 14
    /// (`saslBindInProgress`); `challenge` is empty if the server sent no credentials.
    fn evaluate_challenge(&self, challenge: &[u8]) -> Result<Option<Vec<u8>>> {
        let _ = challenge;
        Err(LdapError::Sasl(format!(
            "{} doesn't expect a server challenge",
            self.name()
        )))
    }
}

/// The EXTERNAL mechanism ([RFC 4422, appendix A](https://tools.ietf.org/html/rfc4422#appendix-A)).
///
/// The identity of the client must already be established by the transport, e.g.
/// with a TLS client certificate. An empty authorization identity asks the server to
/// derive it from the transport credentials.
#[derive(Clone, Debug, Default)]
pub struct External {
    authzid: String,
}

impl External {
    pub fn new() -> Self {
        External::default()
    }

    pub fn with_authzid<S: Into<String>>(authzid: S) -> Self {
        External {
            authzid: authzid.into(),
        }
    }
}

impl SaslMechanism for External {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn initial_response(&self) -> Result<Option<Vec<u8>>> {
        Ok(Some(self.authzid.as_bytes().to_vec()))
    }
}

/// The ANONYMOUS mechanism ([RFC 4505](https://tools.ietf.org/html/rfc4505)), with
/// optional trace information.
#[derive(Clone, Debug, Default)]
pub struct Anonymous {
    trace: Option<String>,
}

impl Anonymous {
    pub fn new() -> Self {
        Anonymous::default()
    }

    pub fn with_trace<S: Into<String>>(trace: S) -> Self {
        Anonymous {
            trace: Some(trace.into()),
        }
    }
}

impl SaslMechanism for Anonymous {
    fn name(&self) -> &str {
        "ANONYMOUS"
    }

    fn initial_response(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.trace.as_ref().map(|t| t.as_bytes().to_vec()))
    }
}

/// The PLAIN mechanism ([RFC 4616](https://tools.ietf.org/html/rfc4616)).
///
/// The password is sent in the clear, so the mechanism should only be used over TLS.
#[derive(Clone)]
pub struct Plain {
    authzid: String,
    authcid: String,
    password: String,
}

impl Plain {
    pub fn new<S: Into<String>, P: Into<String>>(authcid: S, password: P) -> Self {
        Plain {
            authzid: String::new(),
            authcid: authcid.into(),
            password: password.into(),
        }
    }

    /// Act as `authzid` after authenticating.
    pub fn authorize_as<S: Into<String>>(mut self, authzid: S) -> Self {
        self.authzid = authzid.into();
        self
    }
}

impl std::fmt::Debug for Plain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plain")
            .field("authzid", &self.authzid)
            .field("authcid", &self.authcid)
            .finish_non_exhaustive()
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn initial_response(&self) -> Result<Option<Vec<u8>>> {
        if self.authcid.contains('\0') || self.password.contains('\0') {
            return Err(LdapError::Sasl(String::from("NUL in PLAIN credentials")));
        }
        let mut msg = Vec::with_capacity(self.authzid.len() + self.authcid.len() + self.password.len() + 2);
        msg.extend_from_slice(self.authzid.as_bytes());
        msg.push(0);
        msg.extend_from_slice(self.authcid.as_bytes());
        msg.push(0);
        msg.extend_from_slice(self.password.as_bytes());
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_message() {
        let mech = Plain::new("tim", "tanstaaftanstaaf");
        assert_eq!(
            mech.initial_response().unwrap(),
            Some(b"\0tim\0tanstaaftanstaaf".to_vec())
        );
        let mech = Plain::new("Kurt", "xipj3plmq").authorize_as("Ursel");
        assert_eq!(
            mech.initial_response().unwrap(),
            Some(b"Ursel\0Kurt\0xipj3plmq".to_vec())
        );
        assert!(Plain::new("a\0b", "x").initial_response().is_err());
    }

    #[test]
    fn no_challenges_expected() {
        assert!(External::new().evaluate_challenge(b"x").is_err());
        assert_eq!(External::new().initial_response().unwrap(), Some(vec![]));
        assert_eq!(Anonymous::new().initial_response().unwrap(), None);
    }
}

use super::Exop;

pub(crate) const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// StartTLS extended operation ([RFC 4511, section 4.14](https://tools.ietf.org/html/rfc4511#section-4.14)).
///
/// The operation is sent by the connection itself when StartTLS is requested in the
/// connection settings, or through [`Ldap::start_tls()`](../struct.Ldap.html#method.start_tls).
/// Sending it as an ordinary extended operation would leave the connection in an
/// unusable state, since the library wouldn't know to begin the TLS handshake.
#[derive(Clone, Debug)]
pub struct StartTLS;

impl From<StartTLS> for Exop {
    fn from(_s: StartTLS) -> Exop {
        Exop {
            name: Some(STARTTLS_OID.to_owned()),
            val: None,
        }
    }
}

use std::str;

use super::{Exop, ExopParser};
use crate::result::{LdapError, Result};

pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Who Am I extended operation ([RFC 4532](https://tools.ietf.org/html/rfc4532)).
///
/// The operation has no request value. Since it's cheap for every server which
/// implements it, it also serves as the round-trip probe of
/// [`WhoAmIHealthCheck`](../pool/struct.WhoAmIHealthCheck.html).
#[derive(Clone, Debug)]
pub struct WhoAmI;

/// Who Am I response.
#[derive(Clone, Debug)]
pub struct WhoAmIResp {
    /// Authorization identity, in one of the forms defined by RFC 4513. Empty
    /// for an anonymous connection.
    pub authzid: String,
}

impl From<WhoAmI> for Exop {
    fn from(_w: WhoAmI) -> Exop {
        Exop {
            name: Some(WHOAMI_OID.to_owned()),
            val: None,
        }
    }
}

impl ExopParser for WhoAmIResp {
    fn parse(val: &[u8]) -> Result<WhoAmIResp> {
        Ok(WhoAmIResp {
            authzid: str::from_utf8(val)
                .map_err(|_| LdapError::DecodingUTF8)?
                .to_owned(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_authzid() {
        let exop = Exop {
            name: None,
            val: Some(b"dn:cn=admin,dc=example,dc=org".to_vec()),
        };
        let resp: WhoAmIResp = exop.parse().expect("parsed");
        assert_eq!(resp.authzid, "dn:cn=admin,dc=example,dc=org");
        let anon: WhoAmIResp = Exop::default().parse().expect("parsed");
        assert_eq!(anon.authzid, "");
    }
}

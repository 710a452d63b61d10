use crate::controls::{MakeCritical, RawControl};

pub const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";

/// ManageDsaIT control ([RFC 3296](https://tools.ietf.org/html/rfc3296)).
///
/// With this control, the server treats referral objects as ordinary entries
/// instead of returning referrals for them. The control has no value.
#[derive(Clone, Debug)]
pub struct ManageDsaIt;

impl MakeCritical for ManageDsaIt {}

impl From<ManageDsaIt> for RawControl {
    fn from(_mdi: ManageDsaIt) -> RawControl {
        RawControl {
            ctype: MANAGE_DSA_IT_OID.to_owned(),
            crit: false,
            val: None,
        }
    }
}

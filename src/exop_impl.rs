use crate::result::Result;

use lber::common::TagClass;
use lber::structures::{OctetString, Tag};

mod starttls;
pub use self::starttls::StartTLS;

mod whoami;
pub use self::whoami::{WhoAmI, WhoAmIResp};

/// OID of the Notice of Disconnection unsolicited notification
/// ([RFC 4511, section 4.4.1](https://tools.ietf.org/html/rfc4511#section-4.4.1)).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Generic extended operation.
///
/// Since the same struct can be used both for requests and responses,
/// both fields must be declared as optional; when sending an extended
/// request, `name` must not be `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Exop {
    /// OID of the operation. It may be absent in the response.
    pub name: Option<String>,
    /// Request or response value. It may be absent in both cases.
    pub val: Option<Vec<u8>>,
}

impl Exop {
    /// Parse the generic exop into a exop-specific struct.
    ///
    /// A missing value is presented to the parser as an empty slice.
    pub fn parse<T: ExopParser>(&self) -> Result<T> {
        T::parse(self.val.as_deref().unwrap_or(&[]))
    }
}

/// Conversion trait for Extended response values.
pub trait ExopParser: Sized {
    /// Convert the raw BER value into an exop-specific struct.
    fn parse(val: &[u8]) -> Result<Self>;
}

pub(crate) fn construct_exop(exop: Exop) -> Vec<Tag> {
    let mut seq = vec![Tag::OctetString(OctetString {
        id: 0,
        class: TagClass::Context,
        inner: exop.name.unwrap_or_default().into_bytes(),
    })];
    if let Some(val) = exop.val {
        seq.push(Tag::OctetString(OctetString {
            id: 1,
            class: TagClass::Context,
            inner: val,
        }));
    }
    seq
}

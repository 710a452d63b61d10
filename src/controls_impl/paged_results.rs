use crate::controls::{ControlParser, MakeCritical, RawControl};
use crate::result::{LdapError, Result};

use bytes::BytesMut;

use lber::IResult;
use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structures::{ASNTag, Integer, OctetString, Sequence, Tag};
use lber::universal::Types;
use lber::write;

pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Paged Results control ([RFC 2696](https://tools.ietf.org/html/rfc2696)).
///
/// This struct can be used both for requests and responses, although `size`
/// means different things in each case.
#[derive(Clone, Debug, Default)]
pub struct PagedResults {
    /// For requests, desired page size. For responses, a server's estimate
    /// of the result set size, if non-zero.
    pub size: i32,
    /// Paging cookie.
    pub cookie: Vec<u8>,
}

impl MakeCritical for PagedResults {}

impl From<PagedResults> for RawControl {
    fn from(pr: PagedResults) -> RawControl {
        let cookie_len = pr.cookie.len();
        let cval = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: pr.size as i64,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: pr.cookie,
                    ..Default::default()
                }),
            ],
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::with_capacity(cookie_len + 16);
        // Encoding into a growable buffer can't fail.
        let _ = write::encode_into(&mut buf, cval);
        RawControl {
            ctype: PAGED_RESULTS_OID.to_owned(),
            crit: false,
            val: Some(Vec::from(&buf[..])),
        }
    }
}

impl ControlParser for PagedResults {
    fn parse(val: &[u8]) -> Result<PagedResults> {
        let bad = || LdapError::Decoding(String::from("malformed paged results value"));
        let mut pr_comps = match parse_tag(val) {
            IResult::Ok((_, tag)) => tag,
            _ => return Err(bad()),
        }
        .expect_constructed()
        .ok_or_else(bad)?
        .into_iter();
        let size = pr_comps
            .next()
            .and_then(|t| t.match_class(TagClass::Universal))
            .and_then(|t| t.match_id(Types::Integer as u64))
            .and_then(|t| t.expect_primitive())
            .and_then(|v| parse_uint(v.as_slice()).ok().map(|(_, size)| size))
            .and_then(|size| i32::try_from(size).ok())
            .ok_or_else(bad)?;
        let cookie = pr_comps
            .next()
            .and_then(|t| t.expect_primitive())
            .ok_or_else(bad)?;
        Ok(PagedResults { size, cookie })
    }
}

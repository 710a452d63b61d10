//! Search filters in their [RFC 4515](https://tools.ietf.org/html/rfc4515) string form.
//!
//! A filter string is first parsed into a [`Filter`](enum.Filter.html) tree, which is
//! then turned into the BER structure of a SearchRequest. Assertion values may contain
//! any byte written as `\NN`, where each `N` is a hex digit; parentheses, the asterisk,
//! the backslash and NUL must be written that way.

use std::str::FromStr;

use crate::result::{LdapError, Result};

use lber::common::TagClass;
use lber::structures::{Boolean, ExplicitTag, OctetString, Sequence, Tag};

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::combinator::{all_consuming, map, opt};
use nom::error::{Error as NomError, ErrorKind};
use nom::multi::many0;
use nom::sequence::{delimited, preceded};

/// Parsed search filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    Substrings {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        last: Option<Vec<u8>>,
    },
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Approx(String, Vec<u8>),
    Extensible {
        rule: Option<String>,
        attr: Option<String>,
        value: Vec<u8>,
        dn_attrs: bool,
    },
}

impl Filter {
    /// Parse a filter string. The outer parentheses may be omitted for a single item.
    pub fn parse(input: &str) -> Result<Filter> {
        match all_consuming(alt((filter, item)))(input) {
            Ok((_, filter)) => Ok(filter),
            Err(_) => Err(LdapError::FilterParsing),
        }
    }

    pub(crate) fn into_tag(self) -> Tag {
        match self {
            Filter::And(list) => constructed(0, list.into_iter().map(Filter::into_tag).collect()),
            Filter::Or(list) => constructed(1, list.into_iter().map(Filter::into_tag).collect()),
            Filter::Not(inner) => Tag::ExplicitTag(ExplicitTag {
                class: TagClass::Context,
                id: 2,
                inner: Box::new(inner.into_tag()),
            }),
            Filter::Equality(attr, value) => ava(3, attr, value),
            Filter::Substrings {
                attr,
                initial,
                any,
                last,
            } => {
                let mut subs = vec![];
                if let Some(initial) = initial {
                    subs.push(context_octets(0, initial));
                }
                subs.extend(any.into_iter().map(|s| context_octets(1, s)));
                if let Some(last) = last {
                    subs.push(context_octets(2, last));
                }
                constructed(
                    4,
                    vec![
                        octets(attr.into_bytes()),
                        Tag::Sequence(Sequence {
                            inner: subs,
                            ..Default::default()
                        }),
                    ],
                )
            }
            Filter::GreaterOrEqual(attr, value) => ava(5, attr, value),
            Filter::LessOrEqual(attr, value) => ava(6, attr, value),
            Filter::Present(attr) => context_octets(7, attr.into_bytes()),
            Filter::Approx(attr, value) => ava(8, attr, value),
            Filter::Extensible {
                rule,
                attr,
                value,
                dn_attrs,
            } => {
                let mut inner = vec![];
                if let Some(rule) = rule {
                    inner.push(context_octets(1, rule.into_bytes()));
                }
                if let Some(attr) = attr {
                    inner.push(context_octets(2, attr.into_bytes()));
                }
                inner.push(context_octets(3, value));
                if dn_attrs {
                    inner.push(Tag::Boolean(Boolean {
                        class: TagClass::Context,
                        id: 4,
                        inner: true,
                    }));
                }
                constructed(9, inner)
            }
        }
    }
}

impl FromStr for Filter {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Filter> {
        Filter::parse(s)
    }
}

/// Parse a filter string directly into the protocol structure.
pub fn parse_filter(input: &str) -> Result<Tag> {
    Filter::parse(input).map(Filter::into_tag)
}

fn octets(inner: Vec<u8>) -> Tag {
    Tag::OctetString(OctetString {
        inner,
        ..Default::default()
    })
}

fn context_octets(id: u64, inner: Vec<u8>) -> Tag {
    Tag::OctetString(OctetString {
        class: TagClass::Context,
        id,
        inner,
    })
}

fn constructed(id: u64, inner: Vec<Tag>) -> Tag {
    Tag::Sequence(Sequence {
        class: TagClass::Context,
        id,
        inner,
    })
}

fn ava(id: u64, attr: String, value: Vec<u8>) -> Tag {
    constructed(id, vec![octets(attr.into_bytes()), octets(value)])
}

fn filter(i: &str) -> IResult<&str, Filter> {
    delimited(tag("("), alt((and, or, not, item)), tag(")"))(i)
}

fn and(i: &str) -> IResult<&str, Filter> {
    map(preceded(tag("&"), many0(filter)), Filter::And)(i)
}

fn or(i: &str) -> IResult<&str, Filter> {
    map(preceded(tag("|"), many0(filter)), Filter::Or)(i)
}

fn not(i: &str) -> IResult<&str, Filter> {
    map(preceded(tag("!"), filter), |f| Filter::Not(Box::new(f)))(i)
}

fn item(i: &str) -> IResult<&str, Filter> {
    alt((extensible, comparison))(i)
}

fn is_descr_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ';'
}

fn descr(i: &str) -> IResult<&str, String> {
    map(take_while1(is_descr_char), String::from)(i)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

// Stops at the first unescaped special character, which is always ASCII, so
// slicing the input there is valid.
fn value(i: &str) -> IResult<&str, Vec<u8>> {
    let bytes = i.as_bytes();
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            b'(' | b')' | b'*' | 0 => break,
            b'\\' => {
                let hi = bytes.get(pos + 1).copied().and_then(hex_value);
                let lo = bytes.get(pos + 2).copied().and_then(hex_value);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                    _ => {
                        return Err(nom::Err::Failure(NomError::new(
                            &i[pos..],
                            ErrorKind::Escaped,
                        )));
                    }
                }
                pos += 3;
            }
            c => {
                out.push(c);
                pos += 1;
            }
        }
    }
    Ok((&i[pos..], out))
}

fn comparison(i: &str) -> IResult<&str, Filter> {
    let (i, attr) = descr(i)?;
    if let Ok((rest, op)) = alt((tag::<_, _, NomError<&str>>(">="), tag("<="), tag("~=")))(i) {
        let (rest, val) = value(rest)?;
        let filter = match op {
            ">=" => Filter::GreaterOrEqual(attr, val),
            "<=" => Filter::LessOrEqual(attr, val),
            _ => Filter::Approx(attr, val),
        };
        return Ok((rest, filter));
    }
    let (i, _) = tag("=")(i)?;
    let (i, initial) = value(i)?;
    let (rest, mut parts) = many0(preceded(tag("*"), value))(i)?;
    if parts.is_empty() {
        return Ok((rest, Filter::Equality(attr, initial)));
    }
    if initial.is_empty() && parts.len() == 1 && parts[0].is_empty() {
        return Ok((rest, Filter::Present(attr)));
    }
    let last = parts.pop().filter(|p| !p.is_empty());
    if parts.iter().any(Vec::is_empty) {
        return Err(nom::Err::Failure(NomError::new(i, ErrorKind::Verify)));
    }
    Ok((
        rest,
        Filter::Substrings {
            attr,
            initial: Some(initial).filter(|p| !p.is_empty()),
            any: parts,
            last,
        },
    ))
}

fn extensible(i: &str) -> IResult<&str, Filter> {
    let (i, attr) = opt(descr)(i)?;
    let (i, dn) = opt(tag(":dn"))(i)?;
    let (i, rule) = opt(preceded(tag(":"), descr))(i)?;
    if attr.is_none() && rule.is_none() {
        return Err(nom::Err::Error(NomError::new(i, ErrorKind::Verify)));
    }
    let (i, _) = tag(":=")(i)?;
    let (i, value) = value(i)?;
    Ok((
        i,
        Filter::Extensible {
            rule,
            attr,
            value,
            dn_attrs: dn.is_some(),
        },
    ))
}

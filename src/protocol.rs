use std::io;
use std::sync::Arc;

use crate::RequestId;
use crate::controls::{Control, ControlRegistry, RawControl};
use crate::controls_impl::{build_tag, parse_controls};

use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structure::{PL, StructureTag};
use lber::structures::{ASNTag, Integer, Sequence, Tag};
use lber::universal::Types;
use lber::write;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec for the LDAPMessage envelope.
///
/// Outgoing messages are `(message ID, protocol op, optional controls)` triples.
/// Incoming byte streams are cut into BER elements, and each element is classified
/// as a [`Frame`](enum.Frame.html). An element which can't be cut from the stream at
/// all is an I/O error, since the stream is unusable after it; an element which is
/// well-formed BER but not a valid LDAPMessage is reported as `Frame::Malformed`,
/// and the next element can still be read.
pub(crate) struct LdapCodec {
    registry: Arc<ControlRegistry>,
}

impl LdapCodec {
    pub(crate) fn new(registry: Arc<ControlRegistry>) -> Self {
        LdapCodec { registry }
    }
}

pub(crate) type MaybeControls = Option<Vec<RawControl>>;

/// Decoded LDAPMessage.
#[derive(Debug)]
pub(crate) enum Frame {
    Message {
        id: RequestId,
        op: StructureTag,
        ctrls: Vec<Control>,
    },
    Malformed {
        id: Option<RequestId>,
        reason: String,
    },
}

fn malformed<S: Into<String>>(id: Option<RequestId>, reason: S) -> Frame {
    Frame::Malformed {
        id,
        reason: reason.into(),
    }
}

fn classify(tag: StructureTag, registry: &ControlRegistry) -> Frame {
    let mut tags = match tag
        .match_class(TagClass::Universal)
        .and_then(|t| t.match_id(Types::Sequence as u64))
        .and_then(|t| t.expect_constructed())
    {
        Some(tags) => tags.into_iter(),
        None => return malformed(None, "envelope is not a sequence"),
    };
    let id = match tags
        .next()
        .and_then(|t| t.match_class(TagClass::Universal))
        .and_then(|t| t.match_id(Types::Integer as u64))
        .and_then(|t| t.expect_primitive())
        .and_then(|v| parse_uint(v.as_slice()).ok().map(|(_, id)| id))
        .and_then(|id| RequestId::try_from(id).ok())
    {
        Some(id) => id,
        None => return malformed(None, "missing or invalid message id"),
    };
    let mut op = match tags.next() {
        Some(op) if op.class == TagClass::Application => op,
        Some(_) => return malformed(Some(id), "protocol op is not an application tag"),
        None => return malformed(Some(id), "missing protocol op"),
    };
    let mut ctrls = vec![];
    for extra in tags {
        match extra {
            StructureTag {
                class: TagClass::Context,
                id: 0,
                payload: PL::C(_),
            } => match parse_controls(extra, registry) {
                Ok(parsed) => ctrls = parsed,
                Err(e) => return malformed(Some(id), e.to_string()),
            },
            StructureTag {
                class: TagClass::Context,
                id: 10,
                ..
            } if op.id == 24 => {
                // Active Directory places the responseName of a Notice of Disconnection
                // after the ExtendedResponse instead of inside it. Move it back.
                if let PL::C(ref mut inner) = op.payload {
                    inner.push(extra);
                }
            }
            _ => return malformed(Some(id), "unexpected element after protocol op"),
        }
    }
    Frame::Message { id, op, ctrls }
}

impl Decoder for LdapCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let (consumed, tag) = match parse_tag(&buf[..]) {
            Ok((rest, tag)) => (buf.len() - rest.len(), tag),
            Err(e) if e.is_incomplete() => return Ok(None),
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "input is not valid BER",
                ));
            }
        };
        buf.advance(consumed);
        Ok(Some(classify(tag, &self.registry)))
    }
}

impl Encoder<(RequestId, Tag, MaybeControls)> for LdapCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        msg: (RequestId, Tag, MaybeControls),
        into: &mut BytesMut,
    ) -> io::Result<()> {
        let (id, tag, controls) = msg;
        let outstruct = {
            let mut msg = vec![
                Tag::Integer(Integer {
                    inner: id as i64,
                    ..Default::default()
                }),
                tag,
            ];
            if let Some(controls) = controls {
                msg.push(Tag::StructureTag(StructureTag {
                    id: 0,
                    class: TagClass::Context,
                    payload: PL::C(controls.into_iter().map(build_tag).collect()),
                }));
            }
            Tag::Sequence(Sequence {
                inner: msg,
                ..Default::default()
            })
            .into_structure()
        };
        write::encode_into(into, outstruct)?;
        Ok(())
    }
}

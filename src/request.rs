use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::RequestId;
use crate::exop::Exop;
use crate::exop_impl::construct_exop;
use crate::filter::parse_filter;
use crate::result::{LdapError, Result};
use crate::sasl::SaslMechanism;
use crate::search::{Scope, SearchOptions};

use lber::common::TagClass;
use lber::structures::{Boolean, Enumerated, Integer, Null, OctetString, Sequence, Set, Tag};

/// Possible sub-operations for the Modify operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Mod<S: AsRef<[u8]> + Eq + Hash> {
    /// Add an attribute, with at least one value.
    Add(S, HashSet<S>),
    /// Delete the entire attribute, or the given values of an attribute.
    Delete(S, HashSet<S>),
    /// Replace an existing attribute, setting its values to those in the set, or delete it if no values are given.
    Replace(S, HashSet<S>),
    /// Increment the attribute by the given value.
    Increment(S, S),
}

impl<S: AsRef<[u8]> + Eq + Hash> Mod<S> {
    pub(crate) fn into_owned(self) -> Mod<Vec<u8>> {
        fn owned<S: AsRef<[u8]>>(set: HashSet<S>) -> HashSet<Vec<u8>> {
            set.iter().map(|v| v.as_ref().to_vec()).collect()
        }
        match self {
            Mod::Add(attr, set) => Mod::Add(attr.as_ref().to_vec(), owned(set)),
            Mod::Delete(attr, set) => Mod::Delete(attr.as_ref().to_vec(), owned(set)),
            Mod::Replace(attr, set) => Mod::Replace(attr.as_ref().to_vec(), owned(set)),
            Mod::Increment(attr, val) => Mod::Increment(attr.as_ref().to_vec(), val.as_ref().to_vec()),
        }
    }
}

#[derive(Clone)]
pub(crate) enum BindKind {
    Simple { dn: String, password: String },
    Sasl(Arc<dyn SaslMechanism>),
}

/// Credentials for the Bind operation.
///
/// A connection remembers the last successful bind, and repeats it when it has to
/// reconnect. A [pool](pool/struct.LdapConnectionPool.html) applies its bind template
/// to every connection it creates.
#[derive(Clone)]
pub struct BindRequest(pub(crate) BindKind);

impl BindRequest {
    /// Simple bind with a DN and a password.
    pub fn simple<D: Into<String>, P: Into<String>>(dn: D, password: P) -> Self {
        BindRequest(BindKind::Simple {
            dn: dn.into(),
            password: password.into(),
        })
    }

    /// Anonymous simple bind, which resets the authentication state of a connection.
    pub fn anonymous() -> Self {
        BindRequest::simple("", "")
    }

    /// SASL bind with the given mechanism.
    pub fn sasl<M: SaslMechanism + 'static>(mechanism: M) -> Self {
        BindRequest(BindKind::Sasl(Arc::new(mechanism)))
    }

    /// The bind DN, which is empty for SASL and anonymous binds.
    pub fn dn(&self) -> &str {
        match self.0 {
            BindKind::Simple { ref dn, .. } => dn,
            BindKind::Sasl(_) => "",
        }
    }
}

impl fmt::Debug for BindRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            BindKind::Simple { ref dn, .. } => f.debug_tuple("Simple").field(dn).finish(),
            BindKind::Sasl(ref mech) => f.debug_tuple("Sasl").field(&mech.name()).finish(),
        }
    }
}

/// Parameters of a Search operation.
#[derive(Clone, Debug)]
pub struct SearchRequest {
    pub(crate) base: String,
    pub(crate) scope: Scope,
    pub(crate) filter: String,
    pub(crate) attrs: Vec<String>,
    pub(crate) opts: SearchOptions,
}

/// Every protocol request the client can send.
///
/// Requests are usually built by the operation methods of [`Ldap`](struct.Ldap.html);
/// building them directly is needed only for [`send_async()`](struct.Ldap.html#method.send_async).
#[derive(Clone, Debug)]
pub enum Request {
    Bind(BindRequest),
    Search(SearchRequest),
    Add {
        dn: String,
        attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)>,
    },
    Delete {
        dn: String,
    },
    Modify {
        dn: String,
        mods: Vec<Mod<Vec<u8>>>,
    },
    ModifyDn {
        dn: String,
        rdn: String,
        delete_old: bool,
        new_sup: Option<String>,
    },
    Compare {
        dn: String,
        attr: String,
        value: Vec<u8>,
    },
    Extended(Exop),
    Unbind,
    Abandon(RequestId),
}

fn octets<B: AsRef<[u8]>>(b: B) -> Tag {
    Tag::OctetString(OctetString {
        inner: b.as_ref().to_vec(),
        ..Default::default()
    })
}

fn value_set<'a, I: IntoIterator<Item = &'a Vec<u8>>>(vals: I) -> Tag {
    Tag::Set(Set {
        inner: vals.into_iter().map(octets).collect(),
        ..Default::default()
    })
}

pub(crate) fn simple_bind_tag(dn: &str, password: &str) -> Tag {
    Tag::Sequence(Sequence {
        id: 0,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: 3,
                ..Default::default()
            }),
            octets(dn),
            Tag::OctetString(OctetString {
                id: 0,
                class: TagClass::Context,
                inner: Vec::from(password),
            }),
        ],
    })
}

pub(crate) fn sasl_bind_tag(mech: &str, creds: Option<&[u8]>) -> Tag {
    let mut inner = vec![octets(mech)];
    if let Some(creds) = creds {
        inner.push(octets(creds));
    }
    Tag::Sequence(Sequence {
        id: 0,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: 3,
                ..Default::default()
            }),
            octets(""),
            Tag::Sequence(Sequence {
                id: 3,
                class: TagClass::Context,
                inner,
            }),
        ],
    })
}

pub(crate) fn abandon_tag(msgid: RequestId) -> Tag {
    Tag::Integer(Integer {
        id: 16,
        class: TagClass::Application,
        inner: msgid as i64,
    })
}

pub(crate) fn unbind_tag() -> Tag {
    Tag::Null(Null {
        id: 2,
        class: TagClass::Application,
        inner: (),
    })
}

impl SearchRequest {
    pub fn new<S: AsRef<str>>(base: &str, scope: Scope, filter: &str, attrs: &[S]) -> Self {
        SearchRequest {
            base: String::from(base),
            scope,
            filter: String::from(filter),
            attrs: attrs.iter().map(|a| String::from(a.as_ref())).collect(),
            opts: SearchOptions::default(),
        }
    }

    pub fn with_options(mut self, opts: SearchOptions) -> Self {
        self.opts = opts;
        self
    }
}

impl Request {
    pub fn search<S: AsRef<str>>(base: &str, scope: Scope, filter: &str, attrs: &[S]) -> Request {
        Request::Search(SearchRequest::new(base, scope, filter, attrs))
    }

    pub fn add<S: AsRef<[u8]> + Eq + Hash>(dn: &str, attrs: Vec<(S, HashSet<S>)>) -> Request {
        Request::Add {
            dn: String::from(dn),
            attrs: attrs
                .into_iter()
                .map(|(name, vals)| {
                    (
                        name.as_ref().to_vec(),
                        vals.iter().map(|v| v.as_ref().to_vec()).collect(),
                    )
                })
                .collect(),
        }
    }

    pub fn delete(dn: &str) -> Request {
        Request::Delete {
            dn: String::from(dn),
        }
    }

    pub fn modify<S: AsRef<[u8]> + Eq + Hash>(dn: &str, mods: Vec<Mod<S>>) -> Request {
        Request::Modify {
            dn: String::from(dn),
            mods: mods.into_iter().map(Mod::into_owned).collect(),
        }
    }

    pub fn modifydn(dn: &str, rdn: &str, delete_old: bool, new_sup: Option<&str>) -> Request {
        Request::ModifyDn {
            dn: String::from(dn),
            rdn: String::from(rdn),
            delete_old,
            new_sup: new_sup.map(String::from),
        }
    }

    pub fn compare<B: AsRef<[u8]>>(dn: &str, attr: &str, value: B) -> Request {
        Request::Compare {
            dn: String::from(dn),
            attr: String::from(attr),
            value: value.as_ref().to_vec(),
        }
    }

    pub fn extended<E: Into<Exop>>(exop: E) -> Request {
        Request::Extended(exop.into())
    }

    pub(crate) fn op_name(&self) -> &'static str {
        match self {
            Request::Bind(_) => "bind",
            Request::Search(_) => "search",
            Request::Add { .. } => "add",
            Request::Delete { .. } => "delete",
            Request::Modify { .. } => "modify",
            Request::ModifyDn { .. } => "modifydn",
            Request::Compare { .. } => "compare",
            Request::Extended(_) => "extended",
            Request::Unbind => "unbind",
            Request::Abandon(_) => "abandon",
        }
    }

    /// Bind changes the identity of the connection it's sent on, and neither Unbind
    /// nor Abandon have a result, so none of them can be sent elsewhere.
    pub(crate) fn follows_referrals(&self) -> bool {
        !matches!(self, Request::Bind(_) | Request::Unbind | Request::Abandon(_))
    }

    pub(crate) fn expects_response(&self) -> bool {
        !matches!(self, Request::Unbind | Request::Abandon(_))
    }

    /// The same request, directed at `dn` instead of the original target.
    pub(crate) fn retarget(&self, dn: Option<&str>) -> Request {
        let mut req = self.clone();
        let new_dn = match dn {
            Some(dn) => dn,
            None => return req,
        };
        match req {
            Request::Search(ref mut search) => search.base = new_dn.to_owned(),
            Request::Add { ref mut dn, .. }
            | Request::Delete { ref mut dn }
            | Request::Modify { ref mut dn, .. }
            | Request::ModifyDn { ref mut dn, .. }
            | Request::Compare { ref mut dn, .. } => *dn = new_dn.to_owned(),
            Request::Bind(_) | Request::Extended(_) | Request::Unbind | Request::Abandon(_) => (),
        }
        req
    }

    /// Protocol op of the request. For a SASL bind, this is only the first step.
    pub(crate) fn tag(&self) -> Result<Tag> {
        let tag = match self {
            Request::Bind(BindRequest(BindKind::Simple { dn, password })) => simple_bind_tag(dn, password),
            Request::Bind(BindRequest(BindKind::Sasl(mech))) => {
                let creds = mech.initial_response()?;
                sasl_bind_tag(mech.name(), creds.as_deref())
            }
            Request::Search(search) => Tag::Sequence(Sequence {
                id: 3,
                class: TagClass::Application,
                inner: vec![
                    octets(&search.base),
                    Tag::Enumerated(Enumerated {
                        inner: search.scope as i64,
                        ..Default::default()
                    }),
                    Tag::Enumerated(Enumerated {
                        inner: search.opts.deref as i64,
                        ..Default::default()
                    }),
                    Tag::Integer(Integer {
                        inner: search.opts.sizelimit as i64,
                        ..Default::default()
                    }),
                    Tag::Integer(Integer {
                        inner: search.opts.timelimit as i64,
                        ..Default::default()
                    }),
                    Tag::Boolean(Boolean {
                        inner: search.opts.typesonly,
                        ..Default::default()
                    }),
                    parse_filter(&search.filter)?,
                    Tag::Sequence(Sequence {
                        inner: search.attrs.iter().map(octets).collect(),
                        ..Default::default()
                    }),
                ],
            }),
            Request::Add { attrs, .. } if attrs.iter().any(|(_, vals)| vals.is_empty()) => {
                return Err(LdapError::AddNoValues);
            }
            Request::Modify { mods, .. }
                if mods.iter().any(|m| matches!(m, Mod::Add(_, vals) if vals.is_empty())) =>
            {
                return Err(LdapError::AddNoValues);
            }
            Request::Add { dn, attrs } => Tag::Sequence(Sequence {
                id: 8,
                class: TagClass::Application,
                inner: vec![
                    octets(dn),
                    Tag::Sequence(Sequence {
                        inner: attrs
                            .iter()
                            .map(|(name, vals)| {
                                Tag::Sequence(Sequence {
                                    inner: vec![octets(name), value_set(vals)],
                                    ..Default::default()
                                })
                            })
                            .collect(),
                        ..Default::default()
                    }),
                ],
            }),
            Request::Delete { dn } => Tag::OctetString(OctetString {
                id: 10,
                class: TagClass::Application,
                inner: Vec::from(dn.as_bytes()),
            }),
            Request::Modify { dn, mods } => Tag::Sequence(Sequence {
                id: 6,
                class: TagClass::Application,
                inner: vec![
                    octets(dn),
                    Tag::Sequence(Sequence {
                        inner: mods.iter().map(modification).collect(),
                        ..Default::default()
                    }),
                ],
            }),
            Request::ModifyDn {
                dn,
                rdn,
                delete_old,
                new_sup,
            } => {
                let mut params = vec![
                    octets(dn),
                    octets(rdn),
                    Tag::Boolean(Boolean {
                        inner: *delete_old,
                        ..Default::default()
                    }),
                ];
                if let Some(new_sup) = new_sup {
                    params.push(Tag::OctetString(OctetString {
                        id: 0,
                        class: TagClass::Context,
                        inner: Vec::from(new_sup.as_bytes()),
                    }));
                }
                Tag::Sequence(Sequence {
                    id: 12,
                    class: TagClass::Application,
                    inner: params,
                })
            }
            Request::Compare { dn, attr, value } => Tag::Sequence(Sequence {
                id: 14,
                class: TagClass::Application,
                inner: vec![
                    octets(dn),
                    Tag::Sequence(Sequence {
                        inner: vec![octets(attr), octets(value)],
                        ..Default::default()
                    }),
                ],
            }),
            Request::Extended(exop) => Tag::Sequence(Sequence {
                id: 23,
                class: TagClass::Application,
                inner: construct_exop(exop.clone()),
            }),
            Request::Unbind => unbind_tag(),
            Request::Abandon(msgid) => abandon_tag(*msgid),
        };
        Ok(tag)
    }
}

fn modification(m: &Mod<Vec<u8>>) -> Tag {
    let single;
    let (num, attr, set): (i64, _, Vec<&Vec<u8>>) = match m {
        Mod::Add(attr, set) => (0, attr, set.iter().collect()),
        Mod::Delete(attr, set) => (1, attr, set.iter().collect()),
        Mod::Replace(attr, set) => (2, attr, set.iter().collect()),
        Mod::Increment(attr, val) => {
            single = val;
            (3, attr, vec![single])
        }
    };
    Tag::Sequence(Sequence {
        inner: vec![
            Tag::Enumerated(Enumerated {
                inner: num,
                ..Default::default()
            }),
            Tag::Sequence(Sequence {
                inner: vec![octets(attr), value_set(set)],
                ..Default::default()
            }),
        ],
        ..Default::default()
    })
}

use std::collections::HashMap;

use crate::result::{LdapError, Result};

use lber::structure::{PL, StructureTag};
use lber::structures::{ASNTag, Boolean, OctetString, Sequence, Tag};
use lber::universal::Types;

/// Recognized control types.
///
/// The variants can't be exhaustively matched, since the list of
/// recognized and internally implemented controls can change from one
/// release to the next. Controls implemented by applications can be made
/// recognizable by registering their OID as a `Custom` type in a
/// [`ControlRegistry`](struct.ControlRegistry.html).
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlType {
    PagedResults,
    ManageDsaIt,
    Custom(u32),
}

mod paged_results;
pub use self::paged_results::PagedResults;

mod manage_dsa_it;
pub use self::manage_dsa_it::ManageDsaIt;

/// Mapping of response control OIDs to control types.
///
/// Each connection's codec owns a registry, which it consults when it parses
/// the controls of a response. The registry is fixed once the connection is
/// established; a customized instance can be supplied through
/// [`LdapConnSettings::set_control_registry()`](../struct.LdapConnSettings.html#method.set_control_registry).
#[derive(Clone, Debug, Default)]
pub struct ControlRegistry {
    types: HashMap<String, ControlType>,
}

impl ControlRegistry {
    /// Create an empty registry, which recognizes no controls.
    pub fn new() -> Self {
        ControlRegistry::default()
    }

    /// Create a registry which recognizes the controls implemented by the library.
    pub fn with_defaults() -> Self {
        ControlRegistry::new()
            .register(paged_results::PAGED_RESULTS_OID, ControlType::PagedResults)
            .register(manage_dsa_it::MANAGE_DSA_IT_OID, ControlType::ManageDsaIt)
    }

    /// Recognize the control with the given `oid` as `ctype`. An earlier registration
    /// of the same OID is replaced.
    pub fn register<S: Into<String>>(mut self, oid: S, ctype: ControlType) -> Self {
        self.types.insert(oid.into(), ctype);
        self
    }

    /// Look up the type of the control with the given OID.
    pub fn lookup(&self, oid: &str) -> Option<ControlType> {
        self.types.get(oid).copied()
    }
}

/// Conversion trait for single control instances.
///
/// The [`Ldap::with_controls()`](crate::Ldap::with_controls) method and its sync counterpart
/// accept a vector of controls, as dictated by RFC 4511. However, it's expected
/// that most uses of controls involve a single instance, so constructing a vector at the call
/// site is noisy. If a control implements this trait, its single instance may be used
/// in the call, and a single-element vector is constructed internally.
pub trait IntoRawControlVec {
    /// Create a control vector.
    fn into(self) -> Vec<RawControl>;
}

/// Trivial implementation for a control vector, returning itself.
impl IntoRawControlVec for Vec<RawControl> {
    fn into(self) -> Vec<RawControl> {
        self
    }
}

/// Blanket implementation for any control. The vector is constructed by the conversion
/// method.
impl<R> IntoRawControlVec for R
where
    RawControl: From<R>,
{
    fn into(self) -> Vec<RawControl> {
        vec![std::convert::Into::into(self)]
    }
}

/// Mark a control as critical.
///
/// All controls provided by this library implement this trait, and are
/// instantiated as non-critical by default.
pub trait MakeCritical {
    /// Mark the control instance as critical. This operation consumes the control,
    /// and is irreversible.
    fn critical(self) -> CriticalControl<Self>
    where
        Self: Sized,
    {
        CriticalControl { control: self }
    }
}

/// Wrapper for a control marked as critical.
pub struct CriticalControl<T> {
    control: T,
}

impl<T> From<CriticalControl<T>> for RawControl
where
    T: Into<RawControl>,
{
    fn from(cc: CriticalControl<T>) -> RawControl {
        let mut rc = cc.control.into();
        rc.crit = true;
        rc
    }
}

/// Conversion trait for response controls.
pub trait ControlParser: Sized {
    /// Convert the raw BER value into a control-specific struct.
    fn parse(val: &[u8]) -> Result<Self>;
}

/// Response control.
///
/// If the OID is found in the connection's [`ControlRegistry`](struct.ControlRegistry.html)
/// while parsing the response, the first element will have a value, otherwise it will
/// be `None`.
#[derive(Clone, Debug)]
pub struct Control(pub Option<ControlType>, pub RawControl);

/// Generic control.
///
/// This struct can be used both for request and response controls. For requests, an
/// independently implemented control can produce an instance of this type and use it
/// to provide an element of the vector passed to
/// [`with_controls()`](../struct.Ldap.html#method.with_controls) by calling
/// `into()` on the instance.
///
/// For responses, an instance is packed into a [`Control`](struct.Control.html) and
/// can be parsed by calling type-qualified [`parse()`](#method.parse) on that instance,
/// if a [`ControlParser`](trait.ControlParser.html) implementation exists for the
/// specified type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawControl {
    /// OID of the control.
    pub ctype: String,
    /// Criticality, has no meaning on response.
    pub crit: bool,
    /// Raw value of the control, if any.
    pub val: Option<Vec<u8>>,
}

impl RawControl {
    /// Parse the generic control into a control-specific struct.
    pub fn parse<T: ControlParser>(&self) -> Result<T> {
        match self.val {
            Some(ref val) => T::parse(val),
            None => Err(LdapError::Decoding(format!(
                "control {} has no value",
                self.ctype
            ))),
        }
    }
}

pub(crate) fn build_tag(rc: RawControl) -> StructureTag {
    let mut seq = vec![Tag::OctetString(OctetString {
        inner: Vec::from(rc.ctype.as_bytes()),
        ..Default::default()
    })];
    if rc.crit {
        seq.push(Tag::Boolean(Boolean {
            inner: true,
            ..Default::default()
        }));
    }
    if let Some(val) = rc.val {
        seq.push(Tag::OctetString(OctetString {
            inner: val,
            ..Default::default()
        }));
    }
    Tag::Sequence(Sequence {
        inner: seq,
        ..Default::default()
    })
    .into_structure()
}

fn malformed(what: &str) -> LdapError {
    LdapError::Decoding(format!("malformed control: {}", what))
}

pub(crate) fn parse_controls(t: StructureTag, registry: &ControlRegistry) -> Result<Vec<Control>> {
    let tags = t
        .expect_constructed()
        .ok_or_else(|| malformed("not a sequence"))?;
    let mut ctrls = Vec::with_capacity(tags.len());
    for ctrl in tags {
        let mut components = ctrl
            .expect_constructed()
            .ok_or_else(|| malformed("no components"))?
            .into_iter();
        let ctype = components
            .next()
            .and_then(|t| t.expect_primitive())
            .and_then(|t| String::from_utf8(t).ok())
            .ok_or_else(|| malformed("control type"))?;
        let (crit, maybe_val) = match components.next() {
            None => (false, None),
            Some(StructureTag {
                id,
                payload: PL::P(v),
                ..
            }) if id == Types::Boolean as u64 => {
                (v.first().is_some_and(|b| *b != 0), components.next())
            }
            Some(c) if c.id == Types::OctetString as u64 => (false, Some(c)),
            Some(_) => return Err(malformed("criticality")),
        };
        let val = match maybe_val {
            Some(v) => Some(v.expect_primitive().ok_or_else(|| malformed("value"))?),
            None => None,
        };
        let known_type = registry.lookup(&ctype);
        ctrls.push(Control(known_type, RawControl { ctype, crit, val }));
    }
    Ok(ctrls)
}

//! Operation result structures and helpers.
//!
//! Most LDAP operations return an [`LdapResult`](struct.LdapResult.html). This module
//! contains its definition, as well as that of a number of wrapper structs and
//! helper methods, which adapt LDAP result and error handling to be a closer
//! match to Rust conventions.
//!
//! Failures which happen on the client side are reported as [`LdapError`](enum.LdapError.html)
//! variants. Every variant maps to an LDAP result code through
//! [`result_code()`](enum.LdapError.html#method.result_code), using the client-side codes
//! in the 80–97 range and 118 for cancellation where the protocol has no code of its own.

use std::error::Error;
use std::fmt;
use std::io;
use std::result::Result as StdResult;
use std::time::Duration;

use crate::RequestId;
use crate::controls::Control;
use crate::disconnect::DisconnectInfo;
use crate::exop::Exop;
use crate::search::ResultEntry;

use lber::common::TagClass;
use lber::parse::parse_uint;
use lber::structure::StructureTag;
use lber::universal::Types;

use thiserror::Error;

/// Type alias for the standard `Result` with the fixed `LdapError` error part.
pub type Result<T> = std::result::Result<T, LdapError>;

/// Numeric result codes used by the library.
///
/// Codes up to 80 are defined by RFC 4511 and returned by servers. The rest are
/// client-side codes, which a server never sends, but which the library uses to
/// report locally detected conditions in the same space as server results.
pub mod rc {
    pub const SUCCESS: u32 = 0;
    pub const OPERATIONS_ERROR: u32 = 1;
    pub const PROTOCOL_ERROR: u32 = 2;
    pub const COMPARE_FALSE: u32 = 5;
    pub const COMPARE_TRUE: u32 = 6;
    pub const REFERRAL: u32 = 10;
    pub const SASL_BIND_IN_PROGRESS: u32 = 14;
    pub const INVALID_CREDENTIALS: u32 = 49;
    pub const UNAVAILABLE: u32 = 52;
    pub const OTHER: u32 = 80;
    pub const SERVER_DOWN: u32 = 81;
    pub const LOCAL_ERROR: u32 = 82;
    pub const ENCODING_ERROR: u32 = 83;
    pub const DECODING_ERROR: u32 = 84;
    pub const TIMEOUT: u32 = 85;
    pub const FILTER_ERROR: u32 = 87;
    pub const USER_CANCELED: u32 = 88;
    pub const PARAM_ERROR: u32 = 89;
    pub const CONNECT_ERROR: u32 = 91;
    pub const REFERRAL_LIMIT_EXCEEDED: u32 = 97;
    pub const CANCELED: u32 = 118;
}

/// Error variants recognized by the library.
#[derive(Debug, Error)]
pub enum LdapError {
    /// The connection has no established transport.
    #[error("connection not established")]
    NotEstablished,

    /// The transport was torn down while the operation was pending, or before it started.
    #[error("server down: {0}")]
    ServerDown(DisconnectInfo),

    /// The connection may not be used, typically flagged by a pool health check.
    #[error("invalid connection: {0}")]
    InvalidConnection(String),

    /// Internal inconsistency in the client.
    #[error("local error: {0}")]
    Local(String),

    /// A message ID was registered twice.
    #[error("message id {0} is already in use")]
    IdInUse(RequestId),

    /// SASL mechanism failure.
    #[error("SASL error: {0}")]
    Sasl(String),

    /// Asynchronous operations were requested on a connection in synchronous mode.
    #[error("asynchronous operations are not supported in synchronous mode")]
    AsyncNotSupported,

    /// A request couldn't be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A response couldn't be decoded.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// No response was received within the response timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Error parsing the string representation of a search filter.
    #[error("filter parse error")]
    FilterParsing,

    /// The TCP connection to the server couldn't be established.
    #[error("connect error for {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: io::Error,
    },

    /// The TCP connection to the server wasn't established within the connect timeout.
    #[error("connect timeout for {host}:{port}")]
    ConnectTimeout { host: String, port: u16 },

    /// The connection pool is closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// No connection became available within the pool's maximum wait time.
    #[error("no connections available")]
    NoConnectionsAvailable,

    /// A referral chain was longer than the configured hop limit.
    #[error("referral hop limit of {0} exceeded")]
    ReferralLimitExceeded(usize),

    /// The operation was canceled by the client.
    #[error("operation canceled")]
    Canceled,

    /// Encapsulated I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Premature end of a search stream.
    #[error("premature end of search stream")]
    EndOfStream,

    /// URL parsing error.
    #[error("url parse error: {source}")]
    UrlParsing {
        #[from]
        source: url::ParseError,
    },

    /// Unknown LDAP URL scheme.
    #[error("unknown LDAP URL scheme: {0}")]
    UnknownScheme(String),

    /// A referral URL couldn't be used.
    #[error("invalid referral: {0}")]
    InvalidReferral(String),

    #[cfg(feature = "tls")]
    /// Rustls library error.
    #[error("rustls error: {source}")]
    Rustls {
        #[from]
        source: rustls::Error,
    },

    #[cfg(feature = "tls")]
    /// Rustls DNS name error.
    #[error("rustls DNS error: {source}")]
    DNSName {
        #[from]
        source: rustls::pki_types::InvalidDnsNameError,
    },

    /// LDAP operation result with an error return code.
    #[error("LDAP operation result: {result}")]
    LdapResult {
        #[from]
        result: LdapResult,
    },

    /// No values provided for the Add operation.
    #[error("empty value set for Add")]
    AddNoValues,

    /// Error converting an octet- or percent-decoded string to UTF-8.
    #[error("utf8 decoding error")]
    DecodingUTF8,
}

impl LdapError {
    /// The LDAP result code corresponding to this error.
    pub fn result_code(&self) -> u32 {
        match self {
            LdapError::NotEstablished
            | LdapError::ServerDown(_)
            | LdapError::InvalidConnection(_)
            | LdapError::Io { .. } => rc::SERVER_DOWN,
            LdapError::Local(_)
            | LdapError::IdInUse(_)
            | LdapError::Sasl(_)
            | LdapError::AsyncNotSupported
            | LdapError::EndOfStream
            | LdapError::UrlParsing { .. }
            | LdapError::UnknownScheme(_)
            | LdapError::InvalidReferral(_) => rc::LOCAL_ERROR,
            LdapError::Encoding(_) => rc::ENCODING_ERROR,
            LdapError::Decoding(_) | LdapError::DecodingUTF8 => rc::DECODING_ERROR,
            LdapError::Timeout(_) => rc::TIMEOUT,
            LdapError::FilterParsing => rc::FILTER_ERROR,
            LdapError::AddNoValues => rc::PARAM_ERROR,
            LdapError::Connect { .. }
            | LdapError::ConnectTimeout { .. }
            | LdapError::PoolClosed
            | LdapError::NoConnectionsAvailable => rc::CONNECT_ERROR,
            #[cfg(feature = "tls")]
            LdapError::Rustls { .. } | LdapError::DNSName { .. } => rc::CONNECT_ERROR,
            LdapError::ReferralLimitExceeded(_) => rc::REFERRAL_LIMIT_EXCEEDED,
            LdapError::Canceled => rc::CANCELED,
            LdapError::LdapResult { result } => result.rc,
        }
    }

    /// Whether the error means that the transport is unusable.
    ///
    /// Such errors trigger the reconnect-and-retry policy of a connection, and make a
    /// pooled connection defunct.
    pub fn is_connection_level(&self) -> bool {
        match self {
            LdapError::NotEstablished
            | LdapError::ServerDown(_)
            | LdapError::InvalidConnection(_)
            | LdapError::Decoding(_)
            | LdapError::Connect { .. }
            | LdapError::ConnectTimeout { .. }
            | LdapError::Io { .. } => true,
            LdapError::LdapResult { result } => matches!(
                result.rc,
                rc::SERVER_DOWN | rc::DECODING_ERROR | rc::CONNECT_ERROR
            ),
            _ => false,
        }
    }
}

impl From<LdapError> for io::Error {
    fn from(le: LdapError) -> io::Error {
        match le {
            LdapError::Io { source, .. } => source,
            _ => io::Error::other(format!("{}", le)),
        }
    }
}

/// Common components of an LDAP operation result.
///
/// This structure faithfully replicates the components dictated by the standard,
/// and is distinctly C-like with its reliance on numeric codes for the indication
/// of outcome. It would be tempting to hide it behind an automatic `Result`-like
/// interface, but there are scenarios where this would preclude intentional
/// incorporation of error conditions into query design. Instead, the struct
/// implements helper methods, [`success()`](#method.success) and
/// [`non_error()`](#method.non_error), which may be used for ergonomic error
/// handling when simple condition checking suffices.
#[derive(Clone, Debug, Default)]
pub struct LdapResult {
    /// Result code.
    ///
    /// Generally, the value of zero indicates successful completion, but there's
    /// a number of other non-error codes arising as a result of various operations.
    /// See [Section A.1 of RFC 4511](https://tools.ietf.org/html/rfc4511#appendix-A.1).
    /// Client-side codes are listed in the [`rc`](rc/index.html) module.
    pub rc: u32,
    /// Matched component DN, where applicable.
    pub matched: String,
    /// Additional diagnostic text.
    pub text: String,
    /// Referrals.
    ///
    /// Absence of referrals is represented by an empty vector.
    pub refs: Vec<String>,
    /// Response controls.
    ///
    /// Missing and empty controls are both represented by an empty vector.
    pub ctrls: Vec<Control>,
}

impl Error for LdapResult {}

fn description(rc: u32) -> &'static str {
    match rc {
        0 => "success",
        1 => "operationsError",
        2 => "protocolError",
        3 => "timeLimitExceeded",
        4 => "sizeLimitExceeded",
        5 => "compareFalse",
        6 => "compareTrue",
        7 => "authMethodNotSupported",
        8 => "strongerAuthRequired",
        10 => "referral",
        11 => "adminLimitExceeded",
        12 => "unavailableCriticalExtension",
        13 => "confidentialityRequired",
        14 => "saslBindInProgress",
        16 => "noSuchAttribute",
        17 => "undefinedAttributeType",
        18 => "inappropriateMatching",
        19 => "constraintViolation",
        20 => "attributeOrValueExists",
        21 => "invalidAttributeSyntax",
        32 => "noSuchObject",
        33 => "aliasProblem",
        34 => "invalidDNSyntax",
        36 => "aliasDereferencingProblem",
        48 => "inappropriateAuthentication",
        49 => "invalidCredentials",
        50 => "insufficientAccessRights",
        51 => "busy",
        52 => "unavailable",
        53 => "unwillingToPerform",
        54 => "loopDetect",
        64 => "namingViolation",
        65 => "objectClassViolation",
        66 => "notAllowedOnNonLeaf",
        67 => "notAllowedOnRDN",
        68 => "entryAlreadyExists",
        69 => "objectClassModsProhibited",
        71 => "affectsMultipleDSAs",
        80 => "other",
        81 => "serverDown",
        82 => "localError",
        83 => "encodingError",
        84 => "decodingError",
        85 => "timeout",
        87 => "filterError",
        88 => "userCanceled",
        89 => "paramError",
        91 => "connectError",
        97 => "referralLimitExceeded",
        118 => "canceled",
        122 => "assertionFailed",
        _ => "unknown",
    }
}

impl fmt::Display for LdapResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> StdResult<(), fmt::Error> {
        write!(
            f,
            "rc={} ({}), dn: \"{}\", text: \"{}\"",
            self.rc,
            description(self.rc),
            self.matched,
            self.text
        )
    }
}

impl LdapResult {
    /// If the result code is zero, return the instance itself wrapped
    /// in `Ok()`, otherwise wrap the instance in an `LdapError`.
    pub fn success(self) -> Result<Self> {
        if self.rc == rc::SUCCESS {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }

    /// If the result code is 0 or 10 (referral), return the instance
    /// itself wrapped in `Ok()`, otherwise wrap the instance in an
    /// `LdapError`.
    pub fn non_error(self) -> Result<Self> {
        if self.rc == rc::SUCCESS || self.rc == rc::REFERRAL {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }

    /// Render a client-side failure as a result structure.
    ///
    /// A server result wrapped in `LdapError::LdapResult` is returned as-is. For other
    /// errors, the result code is [`LdapError::result_code()`](enum.LdapError.html#method.result_code)
    /// and the diagnostic text is the error's message.
    pub fn from_error(err: &LdapError) -> LdapResult {
        match err {
            LdapError::LdapResult { result } => result.clone(),
            _ => LdapResult {
                rc: err.result_code(),
                text: err.to_string(),
                ..Default::default()
            },
        }
    }
}

/// Parsed LDAPResult with the optional parts carried by Bind and Extended responses.
#[derive(Clone, Debug)]
pub(crate) struct LdapResultExt(pub LdapResult, pub Exop, pub Option<Vec<u8>>);

fn octet_string(tag: Option<StructureTag>, what: &str) -> Result<Vec<u8>> {
    tag.and_then(|t| t.expect_primitive())
        .ok_or_else(|| LdapError::Decoding(format!("missing or malformed {}", what)))
}

fn utf8_string(tag: Option<StructureTag>, what: &str) -> Result<String> {
    String::from_utf8(octet_string(tag, what)?)
        .map_err(|_| LdapError::Decoding(format!("{} is not valid UTF-8", what)))
}

impl TryFrom<StructureTag> for LdapResultExt {
    type Error = LdapError;

    fn try_from(t: StructureTag) -> Result<LdapResultExt> {
        let mut tags = t
            .expect_constructed()
            .ok_or_else(|| LdapError::Decoding(String::from("result is not a sequence")))?
            .into_iter();
        let rc = tags
            .next()
            .and_then(|t| t.match_class(TagClass::Universal))
            .and_then(|t| t.match_id(Types::Enumerated as u64))
            .and_then(|t| t.expect_primitive())
            .and_then(|rc| parse_uint(rc.as_slice()).ok().map(|(_, rc)| rc))
            .and_then(|rc| u32::try_from(rc).ok())
            .ok_or_else(|| LdapError::Decoding(String::from("missing or malformed result code")))?;
        let matched = utf8_string(tags.next(), "matched DN")?;
        let text = utf8_string(tags.next(), "diagnostic message")?;
        let mut refs = Vec::new();
        let mut exop = Exop {
            name: None,
            val: None,
        };
        let mut sasl_creds = None;
        for comp in tags {
            match comp.id {
                3 => refs.extend(parse_refs(comp)),
                7 => sasl_creds = Some(octet_string(Some(comp), "SASL credentials")?),
                10 => exop.name = Some(utf8_string(Some(comp), "extended response name")?),
                11 => exop.val = Some(octet_string(Some(comp), "extended response value")?),
                _ => (),
            }
        }
        Ok(LdapResultExt(
            LdapResult {
                rc,
                matched,
                text,
                refs,
                ctrls: vec![],
            },
            exop,
            sasl_creds,
        ))
    }
}

/// Extract the URLs from a sequence of referral URIs.
///
/// Used for both the `referral` element of LDAPResult and for the payload of a
/// SearchResultReference message. Unparseable elements are skipped.
pub(crate) fn parse_refs(t: StructureTag) -> Vec<String> {
    t.expect_constructed()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|t| t.expect_primitive())
        .filter_map(|v| String::from_utf8(v).ok())
        .collect()
}

/// Wrapper for results of a Search operation which returns all entries at once.
///
/// The wrapper exists so that methods [`success()`](#method.success) and
/// [`non_error()`](#method.non_error) can be called on an instance. Those methods
/// destructure the wrapper and return its components as elements of an anonymous
/// tuple.
#[derive(Clone, Debug)]
pub struct SearchResult(pub Vec<ResultEntry>, pub LdapResult);

impl SearchResult {
    /// If the result code is zero, return an anonymous tuple of component structs
    /// wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn success(self) -> Result<(Vec<ResultEntry>, LdapResult)> {
        if self.1.rc == rc::SUCCESS {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }

    /// If the result code is 0 or 10 (referral), return an anonymous tuple of component
    /// structs wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn non_error(self) -> Result<(Vec<ResultEntry>, LdapResult)> {
        if self.1.rc == rc::SUCCESS || self.1.rc == rc::REFERRAL {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }
}

/// Wrapper for the result of a Compare operation.
///
/// Compare uniquely has two non-zero return codes to indicate the outcome of a successful
/// comparison, while other return codes indicate errors, as usual (except 10 for referral).
/// The [`equal()`](#method.equal) method optimizes for the expected case of ignoring
/// referrals; [`non_error()`](#method.non_error) can be used when that's not possible.
#[derive(Clone, Debug)]
pub struct CompareResult(pub LdapResult);

impl CompareResult {
    /// If the result code is 5 (compareFalse) or 6 (compareTrue), return the corresponding
    /// boolean value wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn equal(self) -> Result<bool> {
        match self.0.rc {
            rc::COMPARE_FALSE => Ok(false),
            rc::COMPARE_TRUE => Ok(true),
            _ => Err(LdapError::from(self.0)),
        }
    }

    /// If the result code is 5 (compareFalse), 6 (compareTrue),  or 10 (referral), return
    /// the inner `LdapResult`, otherwise rewrap `LdapResult` in an `LdapError`.
    pub fn non_error(self) -> Result<LdapResult> {
        if matches!(self.0.rc, rc::COMPARE_FALSE | rc::COMPARE_TRUE | rc::REFERRAL) {
            Ok(self.0)
        } else {
            Err(LdapError::from(self.0))
        }
    }
}

/// Wrapper for the result of an Extended operation.
///
/// Similarly to [`SearchResult`](struct.SearchResult.html), methods
/// [`success()`](#method.success) and [`non_error()`](#method.non_error) can be
/// called on an instance, and will destructure the wrapper into an anonymous
/// tuple of its components.
#[derive(Clone, Debug)]
pub struct ExopResult(pub Exop, pub LdapResult);

impl ExopResult {
    /// If the result code is zero, return an anonymous tuple of component structs
    /// wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn success(self) -> Result<(Exop, LdapResult)> {
        if self.1.rc == rc::SUCCESS {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }

    /// If the result code is 0 or 10 (referral), return an anonymous tuple of component
    /// structs wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn non_error(self) -> Result<(Exop, LdapResult)> {
        if self.1.rc == rc::SUCCESS || self.1.rc == rc::REFERRAL {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }
}

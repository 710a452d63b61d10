//! A pure-Rust LDAP client library using the Tokio stack, with request multiplexing,
//! automatic reconnection, referral following and a connection pool.
//!
//! ## Usage
//!
//! In `Cargo.toml`:
//!
//! ```toml
//! [dependencies.ldapconn]
//! version = "0.1.0"
//! ```
//!
//! ## Summary
//!
//! The library provides both synchronous and asynchronous interfaces. [`Ldap`](struct.Ldap.html)
//! is the asynchronous connection handle, which can be cloned to run any number of operations
//! concurrently over the same connection; their responses are told apart by message ID.
//! [`LdapConn`](struct.LdapConn.html) is the synchronous wrapper around it. Connections can
//! also be borrowed from an [`LdapConnectionPool`](pool/struct.LdapConnectionPool.html),
//! which keeps them bound, checks their health, and replaces those which fail.
//!
//! In the [struct list](#structs), async-related structs have an asterisk (__*__) after
//! the short description.
//!
//! The documentation is written for readers familiar with LDAP concepts and terminology,
//! which it won't attempt to explain.
//!
//! ## Connection modes
//!
//! By default, each connection has a background reader task which routes the responses
//! to the operations waiting for them. In _synchronous mode_, set through
//! [`LdapConnSettings`](struct.LdapConnSettings.html), there is no reader: the task which
//! sends a request also reads its responses, and operations on the connection are
//! serialized.
//!
//! ## Compile-time features
//!
//! The following features are available at compile time:
//!
//! * __sync__ (enabled by default): Synchronous API support.
//!
//! * __tls__ (enabled by default): TLS support for `ldaps://` URLs and StartTLS, backed
//!   by Rustls with the _ring_ crypto provider. Root certificates are loaded from the
//!   platform store unless a `ClientConfig` is supplied in the connection settings.
//!
//! Without any features, only plain TCP connections are available.
//!
//! ## Examples
//!
//! The following two examples perform exactly the same operation and should produce
//! identical results.
//!
//! ### Synchronous search
//!
//! ```rust,no_run
//! use ldapconn::{LdapConn, Scope, SearchEntry};
//! use ldapconn::result::Result;
//!
//! fn main() -> Result<()> {
//!     let mut ldap = LdapConn::new("ldap://localhost:2389")?;
//!     let (rs, _res) = ldap.search(
//!         "ou=Places,dc=example,dc=org",
//!         Scope::Subtree,
//!         "(&(objectClass=locality)(l=ma*))",
//!         vec!["l"]
//!     )?.success()?;
//!     for entry in rs {
//!         println!("{:?}", SearchEntry::construct(entry)?);
//!     }
//!     Ok(ldap.unbind()?)
//! }
//! ```
//!
//! ### Asynchronous search
//!
//! ```rust,no_run
//! use ldapconn::{Ldap, Scope, SearchEntry};
//! use ldapconn::result::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut ldap = Ldap::connect("ldap://localhost:2389").await?;
//!     let (rs, _res) = ldap.search(
//!         "ou=Places,dc=example,dc=org",
//!         Scope::Subtree,
//!         "(&(objectClass=locality)(l=ma*))",
//!         vec!["l"]
//!     ).await?.success()?;
//!     for entry in rs {
//!         println!("{:?}", SearchEntry::construct(entry)?);
//!     }
//!     Ok(ldap.unbind().await?)
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

#[doc(hidden)]
#[macro_use]
pub extern crate log;

/// Type alias for the LDAP message ID.
pub type RequestId = i32;

pub mod asn1 {
    //! ASN.1 structure construction and parsing.
    //!
    //! Re-exported from `lber` for implementing controls and extended operations
    //! outside of this library.
    pub use lber::common::TagClass;
    pub use lber::parse::{parse_tag, parse_uint};
    pub use lber::structure::{PL, StructureTag};
    pub use lber::structures::{
        ASNTag, Boolean, Enumerated, ExplicitTag, Integer, Null, OctetString, Sequence, Set, Tag,
    };
    pub use lber::universal::Types;
    pub use lber::write;
}
mod conn;
pub mod controls {
    //! Request and response controls.
    //!
    //! Every operation can carry request controls, attached with
    //! [`with_controls()`](../struct.Ldap.html#method.with_controls). Anything convertible
    //! into [`RawControl`](struct.RawControl.html), the generic (OID, criticality, value)
    //! form, is accepted; the controls implemented here, such as
    //! [`PagedResults`](struct.PagedResults.html), provide that conversion, and so must
    //! third-party ones. [`MakeCritical`](trait.MakeCritical.html) marks a control as critical.
    //!
    //! Response controls arrive in the `ctrls` vector of the result as instances of
    //! [`Control`](struct.Control.html). The first element is set when the OID is known
    //! to the [`ControlRegistry`](struct.ControlRegistry.html) of the connection; the
    //! default registry knows the controls of this module, and a custom one can be given
    //! in [`LdapConnSettings`](../struct.LdapConnSettings.html). The value is decoded by
    //! calling [`parse()`](struct.RawControl.html#method.parse) with a type implementing
    //! [`ControlParser`](trait.ControlParser.html).
    //!
    //! ### Example
    //!
    //! Picking the paged results response control out of a search result:
    //!
    //! ```rust,no_run
    //! # use ldapconn::controls::{Control, ControlType, PagedResults};
    //! # use ldapconn::result::Result;
    //! # use ldapconn::{LdapConn, Scope};
    //! # fn main() -> Result<()> {
    //! # let mut ldap = LdapConn::new("ldap://localhost")?;
    //! let (_entries, res) = ldap
    //!     .with_controls(PagedResults { size: 100, cookie: vec![] })
    //!     .search("dc=example,dc=org", Scope::Subtree, "(objectClass=*)", vec!["cn"])?
    //!     .success()?;
    //! for ctrl in res.ctrls {
    //!     if let Control(Some(ControlType::PagedResults), ref raw) = ctrl {
    //!         let paged: PagedResults = raw.parse()?;
    //!         println!("next cookie has {} bytes", paged.cookie.len());
    //!     }
    //! }
    //! # Ok(())
    //! # }
    //! ```
    pub use crate::controls_impl::{
        Control, ControlParser, ControlRegistry, ControlType, CriticalControl, IntoRawControlVec,
        MakeCritical, RawControl,
    };
    pub use crate::controls_impl::{ManageDsaIt, PagedResults};
}
mod controls_impl;
mod disconnect;
mod exop_impl;
pub mod exop {
    //! Extended operation construction and parsing.
    //!
    //! A generic exop is represented by [`Exop`](struct.Exop.html). If a particular
    //! exop is implemented by this library, it may have one or two associated structs;
    //! one for constructing requests, and another for parsing responses. If request and
    //! response are the same, there is only the request struct; if they are different,
    //! the response struct's name will consist of the request struct name with the
    //! `Resp` suffix.
    //!
    //! A request struct must implement the `From` conversion of itself into `Exop`.
    //! A response struct must implement the [`ExopParser`](trait.ExopParser.html)
    //! trait.
    pub use crate::exop_impl::{Exop, ExopParser, NOTICE_OF_DISCONNECTION_OID, StartTLS, WhoAmI, WhoAmIResp};
}
mod filter;
mod handle;
mod ldap;
mod link;
mod msgid;
mod notification;
pub mod pool;
mod protocol;
mod reader;
mod referral;
mod request;
pub mod result;
mod router;
pub mod sasl;
mod search;
#[cfg(feature = "sync")]
mod sync;

pub use conn::{LdapConnSettings, SocketFactory, TcpSocketFactory};
pub use disconnect::{DisconnectHandler, DisconnectInfo, DisconnectType};
pub use filter::Filter;
pub use handle::{AsyncRequestHandle, ResponseListener};
pub use ldap::Ldap;
pub use link::ReaderState;
pub use notification::UnsolicitedNotificationHandler;
pub use referral::{DefaultReferralConnector, ReferralConnector, ReferralUrl};
pub use request::{BindRequest, Mod, Request, SearchRequest};
pub use result::{LdapError, LdapResult, SearchResult};
pub use search::{
    DerefAliases, ResultEntry, Scope, SearchEntry, SearchOptions, SearchStream, StreamState,
};
#[cfg(feature = "sync")]
pub use sync::{EntryStream, LdapConn};

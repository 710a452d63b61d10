use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::controls::Control;
use crate::handle::ResponseListener;
use crate::ldap::Ldap;
use crate::link::Pending;
use crate::result::{LdapError, LdapResult, LdapResultExt, Result, parse_refs, rc};
use crate::router::Response;

use lber::structure::StructureTag;

/// Possible values for search scope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scope {
    /// Base object; search only the object named in the base DN.
    Base = 0,
    /// Search the objects immediately below the base DN.
    OneLevel = 1,
    /// Search the object named in the base DN and the whole subtree below it.
    Subtree = 2,
}

/// Possible values for alias dereferencing during search.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum DerefAliases {
    /// Never dereference.
    #[default]
    Never = 0,
    /// Dereference while retrieving objects according to search scope.
    Searching = 1,
    /// Dereference while finding the base object.
    Finding = 2,
    /// Always dereference.
    Always = 3,
}

/// Wrapper for the internal structure of a result entry.
///
/// Besides search result entries, this is also the form in which search
/// references and intermediate responses are handed out.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ResultEntry(pub StructureTag, pub Vec<Control>);

impl ResultEntry {
    #[doc(hidden)]
    pub fn new(st: StructureTag) -> ResultEntry {
        ResultEntry(st, vec![])
    }

    /// Returns true if the enclosed entry is a referral.
    pub fn is_ref(&self) -> bool {
        self.0.id == 19
    }

    /// Returns true if the enclosed entry is an intermediate message.
    pub fn is_intermediate(&self) -> bool {
        self.0.id == 25
    }

    /// URLs of a search reference. Empty for anything else.
    pub fn referrals(&self) -> Vec<String> {
        if self.is_ref() {
            parse_refs(self.0.clone())
        } else {
            vec![]
        }
    }
}

/// Additional parameters for the Search operation.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct SearchOptions {
    pub deref: DerefAliases,
    pub typesonly: bool,
    pub timelimit: i32,
    pub sizelimit: i32,
}

impl SearchOptions {
    /// Create an instance of the structure with default values.
    pub fn new() -> Self {
        SearchOptions {
            ..Default::default()
        }
    }

    /// Set the method for dereferencing aliases.
    pub fn deref(mut self, d: DerefAliases) -> Self {
        self.deref = d;
        self
    }

    /// Set the indicator of returning just attribute names (`true`) vs. names and values (`false`).
    pub fn typesonly(mut self, typesonly: bool) -> Self {
        self.typesonly = typesonly;
        self
    }

    /// Set the time limit, in seconds, for the whole search operation.
    ///
    /// This is a server-side limit of the elapsed time for performing the operation, _not_ a
    /// network timeout for retrieving result entries or the result of the whole operation.
    pub fn timelimit(mut self, timelimit: i32) -> Self {
        self.timelimit = timelimit;
        self
    }

    /// Set the size limit, in entries, for the whole search operation.
    pub fn sizelimit(mut self, sizelimit: i32) -> Self {
        self.sizelimit = sizelimit;
        self
    }
}

/// Parsed search result entry.
///
/// Every value is converted into a `String` if it's valid UTF-8. If any value of an
/// attribute isn't, the attribute and all its values are placed in `bin_attrs`
/// instead of `attrs`.
#[derive(Debug, Clone)]
pub struct SearchEntry {
    /// Entry DN.
    pub dn: String,
    /// Attributes.
    pub attrs: HashMap<String, Vec<String>>,
    /// Binary-valued attributes.
    pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

fn bad_entry(what: &str) -> LdapError {
    LdapError::Decoding(format!("malformed search entry: {}", what))
}

impl SearchEntry {
    /// Parse raw BER data and convert it into attribute map(s).
    pub fn construct(re: ResultEntry) -> Result<SearchEntry> {
        let mut tags = re
            .0
            .match_id(4)
            .and_then(|t| t.expect_constructed())
            .ok_or_else(|| bad_entry("not an entry"))?
            .into_iter();
        let dn = tags
            .next()
            .and_then(|t| t.expect_primitive())
            .and_then(|v| String::from_utf8(v).ok())
            .ok_or_else(|| bad_entry("dn"))?;
        let mut attrs = HashMap::new();
        let mut bin_attrs = HashMap::new();
        let parts = tags
            .next()
            .and_then(|t| t.expect_constructed())
            .ok_or_else(|| bad_entry("attribute list"))?;
        for part in parts {
            let mut part = part
                .expect_constructed()
                .ok_or_else(|| bad_entry("partial attribute"))?
                .into_iter();
            let name = part
                .next()
                .and_then(|t| t.expect_primitive())
                .and_then(|v| String::from_utf8(v).ok())
                .ok_or_else(|| bad_entry("attribute type"))?;
            let values = part
                .next()
                .and_then(|t| t.expect_constructed())
                .ok_or_else(|| bad_entry("attribute values"))?
                .into_iter()
                .map(|t| t.expect_primitive().ok_or_else(|| bad_entry("attribute value")))
                .collect::<Result<Vec<Vec<u8>>>>()?;
            if values.iter().all(|v| std::str::from_utf8(v).is_ok()) {
                let values = values
                    .into_iter()
                    .filter_map(|v| String::from_utf8(v).ok())
                    .collect();
                attrs.insert(name, values);
            } else {
                bin_attrs.insert(name, values);
            }
        }
        Ok(SearchEntry {
            dn,
            attrs,
            bin_attrs,
        })
    }
}

/// Possible states of a `SearchStream`.
///
/// A stream starts out `Active`. Reading the terminal result with [`next()`](struct.SearchStream.html#method.next)
/// moves it to `Done`, any failure to `Error`, and [`finish()`](struct.SearchStream.html#method.finish)
/// to `Closed`, regardless of the previous state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    /// Initialized stream which can be iterated through with `next()`.
    Active,
    /// Stream from which all entries have been retrieved.
    Done,
    /// Properly finalized stream on which `finish()` was called.
    Closed,
    /// Stream in an error state after some fallible operation.
    Error,
}

/// Handle for obtaining a stream of search results. __*__
///
/// Obtained with [`streaming_search()`](struct.Ldap.html#method.streaming_search). A streaming
/// search should be used when the size of the result set is unknown or can be large, since
/// entries are delivered one at a time instead of being collected in memory.
///
/// The stream is driven by repeatedly calling [`next()`](#method.next) until it returns
/// `Ok(None)` or an error, after which [`finish()`](#method.finish) returns the overall
/// result. Calling `finish()` earlier stops processing in the client; it's up to the
/// caller to abandon the operation on the server.
///
/// A streaming search is never retried after a reconnect, and referral results are
/// returned to the caller instead of being followed. On a connection in synchronous mode,
/// the stream holds the connection's transport until it's finished or dropped.
pub struct SearchStream {
    ldap: Ldap,
    pending: Option<Pending>,
    state: StreamState,
    timeout: Option<Duration>,
    listener: Option<Arc<dyn ResponseListener>>,
    /// Overall result, available once the stream is `Done`.
    pub res: Option<LdapResult>,
}

impl fmt::Debug for SearchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchStream")
            .field("state", &self.state)
            .field("timeout", &self.timeout)
            .field("res", &self.res)
            .finish_non_exhaustive()
    }
}

impl SearchStream {
    pub(crate) fn new(
        ldap: Ldap,
        pending: Pending,
        timeout: Option<Duration>,
        listener: Option<Arc<dyn ResponseListener>>,
    ) -> Self {
        SearchStream {
            ldap,
            pending: Some(pending),
            state: StreamState::Active,
            timeout,
            listener,
            res: None,
        }
    }

    /// Fetch the next item from the result stream.
    ///
    /// The response timeout, if any, applies to each item separately. Returns `Ok(None)`
    /// at the end of the stream.
    #[allow(clippy::should_implement_trait)]
    pub async fn next(&mut self) -> Result<Option<ResultEntry>> {
        if self.state != StreamState::Active {
            return Ok(None);
        }
        let res = self.next_inner().await;
        if res.is_err() {
            self.state = StreamState::Error;
            self.pending = None;
        }
        res
    }

    async fn next_inner(&mut self) -> Result<Option<ResultEntry>> {
        let pending = match self.pending.as_mut() {
            Some(pending) => pending,
            None => return Err(LdapError::EndOfStream),
        };
        let id = pending.id();
        let resp = pending.next(self.timeout).await;
        match resp {
            Response::Entry(op, ctrls) => {
                let entry = ResultEntry(op, ctrls);
                if let Some(ref listener) = self.listener {
                    listener.entry_returned(id, &entry);
                }
                Ok(Some(entry))
            }
            Response::Reference(op, ctrls) => {
                let reference = ResultEntry(op, ctrls);
                if let Some(ref listener) = self.listener {
                    listener.reference_returned(id, &reference);
                }
                Ok(Some(reference))
            }
            Response::Intermediate(op, ctrls) => {
                let response = ResultEntry(op, ctrls);
                if let Some(ref listener) = self.listener {
                    listener.intermediate_response(id, &response);
                }
                Ok(Some(response))
            }
            Response::Done(op, ctrls) => {
                self.pending = None;
                let LdapResultExt(mut result, _, _) = LdapResultExt::try_from(op)?;
                result.ctrls = ctrls;
                if let Some(ref listener) = self.listener {
                    listener.result_received(id, &result);
                }
                self.res = Some(result);
                self.state = StreamState::Done;
                Ok(None)
            }
            Response::Malformed(reason) => Err(LdapError::Decoding(reason)),
            Response::Closed(info) => Err(LdapError::ServerDown(info)),
            Response::TimedOut(t) => {
                if let Some(pending) = self.pending.take() {
                    let link = pending.link().clone();
                    drop(pending);
                    if self.ldap.conn.settings.abandon_on_timeout {
                        self.ldap.conn.send_abandon(&link, id).await;
                    }
                }
                Err(LdapError::Timeout(t))
            }
            Response::Canceled => Err(LdapError::Canceled),
        }
    }

    /// Return the overall result of the Search.
    ///
    /// If the stream has been read to the end, the result is the one returned by the
    /// server. Otherwise, a synthetic result with code 88 (`userCanceled`) is returned.
    /// Calling this method on a closed stream returns a synthetic result with code 80.
    pub async fn finish(&mut self) -> LdapResult {
        if self.state == StreamState::Closed {
            return LdapResult {
                rc: rc::OTHER,
                text: String::from("stream already finalized"),
                ..Default::default()
            };
        }
        self.state = StreamState::Closed;
        self.pending = None;
        self.res.take().unwrap_or_else(|| LdapResult {
            rc: rc::USER_CANCELED,
            text: String::from("user cancelled"),
            ..Default::default()
        })
    }

    /// Return the current state of the stream.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Message ID of the Search, if it's still in progress.
    pub fn msgid(&self) -> Option<crate::RequestId> {
        self.pending.as_ref().map(Pending::id)
    }

    /// Return the `Ldap` handle of the stream.
    pub fn ldap_handle(&mut self) -> &mut Ldap {
        &mut self.ldap
    }
}

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use crate::RequestId;
use crate::conn::LdapConnSettings;
use crate::controls_impl::IntoRawControlVec;
use crate::disconnect::{DisconnectInfo, DisconnectType};
use crate::exop::Exop;
use crate::ldap::Ldap;
use crate::request::{BindRequest, Mod};
use crate::result::{CompareResult, ExopResult, LdapResult, Result, SearchResult};
use crate::sasl::SaslMechanism;
use crate::search::{ResultEntry, Scope, SearchOptions, SearchStream};

use tokio::runtime::{self, Runtime};

/// Synchronous connection to an LDAP server.
///
/// The struct encapsulates a single-threaded Tokio runtime and an [`Ldap`](struct.Ldap.html)
/// handle. All operations are performed through that struct, synchronously: the thread will
/// wait until the result is available or the operation times out. The background reader
/// of the connection makes progress only while an operation is running.
///
/// The API is virtually identical to the asynchronous one. The chief difference is
/// that `LdapConn` is not cloneable: if you need another handle, you must open a
/// new connection.
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
#[derive(Debug)]
pub struct LdapConn {
    rt: Runtime,
    ldap: Ldap,
}

impl LdapConn {
    /// Open a connection to an LDAP server specified by `url`.
    ///
    /// See [Ldap::connect()](struct.Ldap.html#method.connect) for the
    /// details of the supported URL formats.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_settings(LdapConnSettings::new(), url)
    }

    /// Open a connection to an LDAP server specified by `url`, using
    /// `settings` to specify additional parameters.
    pub fn with_settings(settings: LdapConnSettings, url: &str) -> Result<Self> {
        let rt = runtime::Builder::new_current_thread().enable_all().build()?;
        let ldap = rt.block_on(Ldap::connect_with_settings(settings, url))?;
        Ok(LdapConn { rt, ldap })
    }

    /// See [`Ldap::with_search_options()`](struct.Ldap.html#method.with_search_options).
    pub fn with_search_options(&mut self, opts: SearchOptions) -> &mut Self {
        self.ldap.with_search_options(opts);
        self
    }

    /// See [`Ldap::with_controls()`](struct.Ldap.html#method.with_controls).
    pub fn with_controls<V: IntoRawControlVec>(&mut self, ctrls: V) -> &mut Self {
        self.ldap.with_controls(ctrls);
        self
    }

    /// See [`Ldap::with_timeout()`](struct.Ldap.html#method.with_timeout).
    pub fn with_timeout(&mut self, duration: Duration) -> &mut Self {
        self.ldap.with_timeout(duration);
        self
    }

    /// See [`Ldap::with_follow_referrals()`](struct.Ldap.html#method.with_follow_referrals).
    pub fn with_follow_referrals(&mut self, follow: bool) -> &mut Self {
        self.ldap.with_follow_referrals(follow);
        self
    }

    /// See [`Ldap::bind()`](struct.Ldap.html#method.bind).
    pub fn bind(&mut self, bind: BindRequest) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.bind(bind))
    }

    /// See [`Ldap::simple_bind()`](struct.Ldap.html#method.simple_bind).
    pub fn simple_bind(&mut self, bind_dn: &str, bind_pw: &str) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.simple_bind(bind_dn, bind_pw))
    }

    /// See [`Ldap::sasl_bind()`](struct.Ldap.html#method.sasl_bind).
    pub fn sasl_bind<M: SaslMechanism + 'static>(&mut self, mechanism: M) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.sasl_bind(mechanism))
    }

    /// See [`Ldap::sasl_external_bind()`](struct.Ldap.html#method.sasl_external_bind).
    pub fn sasl_external_bind(&mut self) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.sasl_external_bind())
    }

    /// See [`Ldap::start_tls()`](struct.Ldap.html#method.start_tls).
    #[cfg(feature = "tls")]
    pub fn start_tls(&mut self) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.start_tls())
    }

    /// See [`Ldap::search()`](struct.Ldap.html#method.search).
    pub fn search<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchResult> {
        self.rt.block_on(self.ldap.search(base, scope, filter, attrs))
    }

    /// Perform a Search, but unlike `search()`, which returns all results at once, return a handle which
    /// will be used for retrieving entries one by one. See [`EntryStream`](struct.EntryStream.html)
    /// for the explanation of the protocol which must be adhered to in this case.
    pub fn streaming_search<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<EntryStream<'_>> {
        let stream = self
            .rt
            .block_on(self.ldap.streaming_search(base, scope, filter, attrs))?;
        Ok(EntryStream { stream, conn: self })
    }

    /// See [`Ldap::add()`](struct.Ldap.html#method.add).
    pub fn add<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        attrs: Vec<(S, HashSet<S>)>,
    ) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.add(dn, attrs))
    }

    /// See [`Ldap::compare()`](struct.Ldap.html#method.compare).
    pub fn compare<B: AsRef<[u8]>>(
        &mut self,
        dn: &str,
        attr: &str,
        val: B,
    ) -> Result<CompareResult> {
        self.rt.block_on(self.ldap.compare(dn, attr, val))
    }

    /// See [`Ldap::delete()`](struct.Ldap.html#method.delete).
    pub fn delete(&mut self, dn: &str) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.delete(dn))
    }

    /// See [`Ldap::modify()`](struct.Ldap.html#method.modify).
    pub fn modify<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        mods: Vec<Mod<S>>,
    ) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.modify(dn, mods))
    }

    /// See [`Ldap::modifydn()`](struct.Ldap.html#method.modifydn).
    pub fn modifydn(
        &mut self,
        dn: &str,
        rdn: &str,
        delete_old: bool,
        new_sup: Option<&str>,
    ) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.modifydn(dn, rdn, delete_old, new_sup))
    }

    /// See [`Ldap::extended()`](struct.Ldap.html#method.extended).
    pub fn extended<E>(&mut self, exop: E) -> Result<ExopResult>
    where
        E: Into<Exop>,
    {
        self.rt.block_on(self.ldap.extended(exop))
    }

    /// See [`Ldap::unbind()`](struct.Ldap.html#method.unbind).
    pub fn unbind(&mut self) -> Result<()> {
        self.rt.block_on(self.ldap.unbind())
    }

    /// See [`Ldap::terminate()`](struct.Ldap.html#method.terminate).
    pub fn terminate(&mut self, kind: DisconnectType, message: Option<&str>) {
        self.rt.block_on(self.ldap.terminate(kind, message))
    }

    /// See [`Ldap::last_id()`](struct.Ldap.html#method.last_id).
    pub fn last_id(&mut self) -> RequestId {
        self.ldap.last_id()
    }

    /// See [`Ldap::abandon()`](struct.Ldap.html#method.abandon).
    pub fn abandon(&mut self, msgid: RequestId) -> Result<()> {
        self.rt.block_on(self.ldap.abandon(msgid))
    }

    /// See [`Ldap::is_connected()`](struct.Ldap.html#method.is_connected).
    pub fn is_connected(&self) -> bool {
        self.ldap.is_connected()
    }

    /// See [`Ldap::disconnect_info()`](struct.Ldap.html#method.disconnect_info).
    pub fn disconnect_info(&self) -> Option<DisconnectInfo> {
        self.ldap.disconnect_info()
    }

    /// The asynchronous handle wrapped by this struct.
    pub fn ldap_handle(&mut self) -> &mut Ldap {
        &mut self.ldap
    }
}

/// Handle for obtaining a stream of search results.
///
/// User code can't construct a stream directly, but only by using
/// [`streaming_search()`](struct.LdapConn.html#method.streaming_search) on
/// an `LdapConn` handle.
///
/// This is the synchronous counterpart of [`SearchStream`](struct.SearchStream.html),
/// with the same protocol and behavior. An `EntryStream` shares the
/// Tokio runtime with `LdapConn` from which it's obtained, but the two can't be
/// used in parallel, which is enforced by capturing the reference to `LdapConn`
/// during the lifetime of `EntryStream`.
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub struct EntryStream<'a> {
    stream: SearchStream,
    conn: &'a mut LdapConn,
}

impl EntryStream<'_> {
    /// See [`SearchStream::next()`](struct.SearchStream.html#method.next).
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<ResultEntry>> {
        self.conn.rt.block_on(self.stream.next())
    }

    /// See [`SearchStream::finish()`](struct.SearchStream.html#method.finish).
    pub fn result(mut self) -> LdapResult {
        self.conn.rt.block_on(self.stream.finish())
    }

    /// Returns the Message ID of the initial Search.
    pub fn msgid(&self) -> Option<RequestId> {
        self.stream.msgid()
    }
}

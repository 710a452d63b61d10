use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::RequestId;
use crate::conn::{LdapConnSettings, ServerAddr};
use crate::controls_impl::IntoRawControlVec;
use crate::disconnect::{DisconnectInfo, DisconnectType};
use crate::exop::Exop;
use crate::handle::{AsyncRequestHandle, ResponseListener};
use crate::link::{Link, ReaderState};
use crate::msgid::MessageIdAllocator;
use crate::protocol::MaybeControls;
#[cfg(feature = "tls")]
use crate::reader::StartTlsParams;
use crate::referral::{DefaultReferralConnector, ReferralConnector, ReferralUrl};
use crate::request::{
    BindKind, BindRequest, Mod, Request, SearchRequest, abandon_tag, sasl_bind_tag, simple_bind_tag,
    unbind_tag,
};
use crate::result::{
    CompareResult, ExopResult, LdapError, LdapResult, LdapResultExt, Result, SearchResult, rc,
};
use crate::router::Response;
use crate::sasl::{External, SaslMechanism};
use crate::search::{ResultEntry, Scope, SearchOptions, SearchStream};

use futures_util::future::{BoxFuture, FutureExt};
use lber::structures::Tag;
use tokio::sync::Mutex as AsyncMutex;
use url::Url;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Per-operation parameters, taken from the `Ldap` handle when the operation starts.
#[derive(Clone, Default)]
pub(crate) struct OpContext {
    pub(crate) controls: MaybeControls,
    pub(crate) timeout: Option<Duration>,
    pub(crate) follow: bool,
    pub(crate) listener: Option<Arc<dyn ResponseListener>>,
    pub(crate) last_id: Arc<AtomicI32>,
}

/// Everything a completed operation produced.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub(crate) result: LdapResult,
    pub(crate) exop: Exop,
    pub(crate) sasl_creds: Option<Vec<u8>>,
    pub(crate) entries: Vec<ResultEntry>,
}

fn retryable(res: &Result<Outcome>) -> bool {
    match res {
        Ok(outcome) => matches!(
            outcome.result.rc,
            rc::SERVER_DOWN | rc::DECODING_ERROR | rc::CONNECT_ERROR
        ),
        Err(e) => e.is_connection_level(),
    }
}

/// State shared by all clones of an `Ldap` handle.
///
/// The connection keeps its identity across reconnects and StartTLS; only the
/// link inside it is replaced.
pub(crate) struct ConnShared {
    pub(crate) id: u64,
    pub(crate) addr: ServerAddr,
    pub(crate) settings: LdapConnSettings,
    pub(crate) msgid: MessageIdAllocator,
    link: Mutex<Option<Arc<Link>>>,
    last_bind: Mutex<Option<BindRequest>>,
    pub(crate) pool_name: OnceLock<String>,
    closed: AtomicBool,
    #[cfg(feature = "tls")]
    upgraded: AtomicBool,
    reconnect_lock: AsyncMutex<()>,
}

impl ConnShared {
    pub(crate) async fn connect(settings: LdapConnSettings, url: &str) -> Result<Arc<ConnShared>> {
        let url = Url::parse(url)?;
        let addr = ServerAddr::from_url(&url)?;
        let shared = ConnShared {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            settings,
            msgid: MessageIdAllocator::new(),
            link: Mutex::new(None),
            last_bind: Mutex::new(None),
            pool_name: OnceLock::new(),
            closed: AtomicBool::new(false),
            #[cfg(feature = "tls")]
            upgraded: AtomicBool::new(false),
            reconnect_lock: AsyncMutex::new(()),
        };
        let link = Link::establish(&shared.addr, &shared.settings, &shared.msgid).await?;
        debug!("connection {} established to {}", shared.id, shared.addr.url);
        *shared.link_slot() = Some(Arc::new(link));
        Ok(Arc::new(shared))
    }

    fn link_slot(&self) -> MutexGuard<'_, Option<Arc<Link>>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn link(&self) -> Option<Arc<Link>> {
        self.link_slot().clone()
    }

    pub(crate) fn current_link(&self) -> Result<Arc<Link>> {
        if self.is_closed() {
            return Err(LdapError::NotEstablished);
        }
        self.link().ok_or(LdapError::NotEstablished)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn last_bind(&self) -> Option<BindRequest> {
        self.last_bind.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_last_bind(&self, bind: BindRequest) {
        *self.last_bind.lock().unwrap_or_else(|e| e.into_inner()) = Some(bind);
    }

    #[cfg(feature = "tls")]
    fn reconnect_settings(&self) -> LdapConnSettings {
        let settings = self.settings.clone();
        if self.upgraded.load(Ordering::Acquire) {
            settings.set_starttls(true)
        } else {
            settings
        }
    }

    #[cfg(not(feature = "tls"))]
    fn reconnect_settings(&self) -> LdapConnSettings {
        self.settings.clone()
    }

    /// Replace `failed` with a new link, unless another task already did.
    async fn reconnect_from(&self, failed: &Arc<Link>) -> Result<Arc<Link>> {
        let _guard = self.reconnect_lock.lock().await;
        if self.is_closed() {
            return Err(LdapError::NotEstablished);
        }
        if let Some(current) = self.link() {
            if !Arc::ptr_eq(&current, failed) && !current.core.is_closed() {
                return Ok(current);
            }
        }
        failed
            .terminate(DisconnectInfo::new(DisconnectType::Reconnect))
            .await;
        let settings = self.reconnect_settings();
        let link = Arc::new(Link::establish(&self.addr, &settings, &self.msgid).await?);
        *self.link_slot() = Some(link.clone());
        debug!("connection {} reconnected to {}", self.id, self.addr.url);
        if let Some(bind) = self.last_bind() {
            let rebound = self
                .bind_exchange(&link, &bind, &OpContext::default())
                .await
                .and_then(|outcome| outcome.result.success());
            if let Err(e) = rebound {
                warn!("re-bind after reconnect to {} failed: {}", self.addr.url, e);
                link.terminate(
                    DisconnectInfo::new(DisconnectType::LocalError)
                        .with_message("re-bind after reconnect failed")
                        .with_cause(&e),
                )
                .await;
                return Err(e);
            }
        }
        Ok(link)
    }

    /// Run `req`, reconnecting and retrying once on a connection-level failure, and
    /// following referrals if asked to.
    pub(crate) fn process<'a>(
        self: &'a Arc<Self>,
        req: &'a Request,
        ctx: &'a OpContext,
        depth: usize,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let link = self.current_link()?;
            let first = self.perform(&link, req, ctx).await;
            let outcome = if retryable(&first)
                && self.settings.auto_reconnect
                && !self.is_closed()
                && req.expects_response()
            {
                match first {
                    Err(ref e) => debug!("{} failed on {}: {}, reconnecting", req.op_name(), self.addr.url, e),
                    Ok(ref o) => debug!("{} failed on {}: {}, reconnecting", req.op_name(), self.addr.url, o.result),
                }
                let link = self.reconnect_from(&link).await?;
                self.perform(&link, req, ctx).await?
            } else {
                first?
            };
            if outcome.result.rc == rc::REFERRAL && ctx.follow && req.follows_referrals() {
                return self.follow_referrals(req, ctx, outcome, depth).await;
            }
            Ok(outcome)
        }
        .boxed()
    }

    async fn follow_referrals(
        self: &Arc<Self>,
        req: &Request,
        ctx: &OpContext,
        outcome: Outcome,
        depth: usize,
    ) -> Result<Outcome> {
        let limit = self.settings.referral_hop_limit;
        if depth >= limit {
            return Err(LdapError::ReferralLimitExceeded(limit));
        }
        let mut last_err = None;
        for url in &outcome.result.refs {
            match self.follow_referral(url, req, ctx, depth).await {
                Ok(outcome) => return Ok(outcome),
                Err(e @ LdapError::ReferralLimitExceeded(_)) => return Err(e),
                Err(e) => {
                    debug!("referral {} failed: {}", url, e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    async fn follow_referral(
        self: &Arc<Self>,
        url: &str,
        req: &Request,
        ctx: &OpContext,
        depth: usize,
    ) -> Result<Outcome> {
        let referral = ReferralUrl::parse(url)?;
        let origin = Ldap::from_shared(self.clone());
        let target = match self.settings.referral_connector {
            Some(ref connector) => connector.get_referral_connection(&referral, &origin).await?,
            None => {
                DefaultReferralConnector
                    .get_referral_connection(&referral, &origin)
                    .await?
            }
        };
        let retargeted = req.retarget(referral.dn());
        let res = target.conn.process(&retargeted, ctx, depth + 1).await;
        target
            .conn
            .terminate(DisconnectInfo::new(DisconnectType::Referral))
            .await;
        res
    }

    async fn perform(&self, link: &Arc<Link>, req: &Request, ctx: &OpContext) -> Result<Outcome> {
        match req {
            Request::Bind(bind) => self.bind_exchange(link, bind, ctx).await,
            Request::Unbind => {
                let id = self.next_id(ctx);
                link.unbind(id, unbind_tag(), ctx.controls.clone()).await;
                Ok(Outcome::default())
            }
            Request::Abandon(target) => {
                let id = self.next_id(ctx);
                link.send_only(id, abandon_tag(*target), ctx.controls.clone())
                    .await?;
                Ok(Outcome::default())
            }
            _ => self.exchange(link, req.tag()?, ctx).await,
        }
    }

    fn next_id(&self, ctx: &OpContext) -> RequestId {
        let id = self.msgid.next();
        ctx.last_id.store(id, Ordering::Relaxed);
        id
    }

    async fn bind_exchange(&self, link: &Arc<Link>, bind: &BindRequest, ctx: &OpContext) -> Result<Outcome> {
        let outcome = match bind.0 {
            BindKind::Simple {
                ref dn,
                ref password,
            } => self.exchange(link, simple_bind_tag(dn, password), ctx).await?,
            BindKind::Sasl(ref mech) => {
                let mut creds = mech.initial_response()?;
                loop {
                    let tag = sasl_bind_tag(mech.name(), creds.as_deref());
                    let outcome = self.exchange(link, tag, ctx).await?;
                    if outcome.result.rc != rc::SASL_BIND_IN_PROGRESS {
                        break outcome;
                    }
                    creds = mech.evaluate_challenge(outcome.sasl_creds.as_deref().unwrap_or(&[]))?;
                }
            }
        };
        if outcome.result.rc == rc::SUCCESS {
            self.set_last_bind(bind.clone());
        }
        Ok(outcome)
    }

    /// Send one request and collect its responses up to the terminal one.
    async fn exchange(&self, link: &Arc<Link>, tag: Tag, ctx: &OpContext) -> Result<Outcome> {
        let id = self.next_id(ctx);
        let mut pending = link.submit(id, tag, ctx.controls.clone()).await?;
        let timeout = ctx.timeout.or(self.settings.response_timeout);
        let mut entries = vec![];
        loop {
            let resp = pending.next(timeout).await;
            match resp {
                Response::Entry(op, ctrls) => {
                    let entry = ResultEntry(op, ctrls);
                    if let Some(ref listener) = ctx.listener {
                        listener.entry_returned(id, &entry);
                    }
                    entries.push(entry);
                }
                Response::Reference(op, ctrls) => {
                    let reference = ResultEntry(op, ctrls);
                    if let Some(ref listener) = ctx.listener {
                        listener.reference_returned(id, &reference);
                    }
                    entries.push(reference);
                }
                Response::Intermediate(op, ctrls) => {
                    if let Some(ref listener) = ctx.listener {
                        listener.intermediate_response(id, &ResultEntry(op, ctrls));
                    }
                }
                Response::Done(op, ctrls) => {
                    drop(pending);
                    let LdapResultExt(mut result, exop, sasl_creds) = LdapResultExt::try_from(op)?;
                    result.ctrls = ctrls;
                    if let Some(ref listener) = ctx.listener {
                        listener.result_received(id, &result);
                    }
                    return Ok(Outcome {
                        result,
                        exop,
                        sasl_creds,
                        entries,
                    });
                }
                Response::Malformed(reason) => return Err(LdapError::Decoding(reason)),
                Response::Closed(info) => return Err(LdapError::ServerDown(info)),
                Response::TimedOut(t) => {
                    drop(pending);
                    if self.settings.abandon_on_timeout {
                        self.send_abandon(link, id).await;
                    }
                    return Err(LdapError::Timeout(t));
                }
                Response::Canceled => return Err(LdapError::Canceled),
            }
        }
    }

    /// Best-effort Abandon of `target`.
    pub(crate) async fn send_abandon(&self, link: &Link, target: RequestId) {
        let id = self.msgid.next();
        match link.send_only(id, abandon_tag(target), None).await {
            Ok(()) => debug!("abandoned msgid {}", target),
            Err(e) => debug!("abandon of msgid {} not sent: {}", target, e),
        }
    }

    async fn send_async(self: &Arc<Self>, req: &Request, ctx: OpContext) -> Result<AsyncRequestHandle> {
        if self.settings.synchronous_mode {
            return Err(LdapError::AsyncNotSupported);
        }
        if matches!(req, Request::Bind(_)) || !req.expects_response() {
            return Err(LdapError::Local(format!(
                "{} can't be sent asynchronously",
                req.op_name()
            )));
        }
        let link = self.current_link()?;
        let tag = req.tag()?;
        let id = self.next_id(&ctx);
        let pending = link.submit(id, tag, ctx.controls.clone()).await?;
        let timeout = ctx.timeout.or(self.settings.response_timeout);
        Ok(AsyncRequestHandle::start(self.clone(), pending, timeout, ctx.listener))
    }

    async fn unbind(&self, ctx: &OpContext) -> Result<()> {
        let link = self.current_link()?;
        self.closed.store(true, Ordering::Release);
        let id = self.next_id(ctx);
        link.unbind(id, unbind_tag(), ctx.controls.clone()).await;
        Ok(())
    }

    pub(crate) async fn terminate(&self, info: DisconnectInfo) {
        self.closed.store(true, Ordering::Release);
        if let Some(link) = self.link() {
            link.terminate(info).await;
        }
    }
}

/// Asynchronous handle for LDAP operations. __*__
///
/// All LDAP operations allow attaching a series of request controls, which augment or modify
/// the operation. Controls are attached by calling [`with_controls()`](#method.with_controls)
/// on the handle, and using the result to call another modifier or the operation itself.
/// A timeout can be imposed on an operation by calling [`with_timeout()`](#method.with_timeout)
/// on the handle before invoking the operation. Modifiers apply only to the next operation.
///
/// The handle can be freely cloned. Each clone multiplexes its operations on the same
/// connection, with a fresh set of modifiers. Operations on a connection in synchronous
/// mode are serialized.
///
/// If the connection is lost, the next operation fails with a connection-level error,
/// unless automatic reconnection is enabled in [`LdapConnSettings`](struct.LdapConnSettings.html),
/// in which case the connection is re-established, the last successful bind is repeated,
/// and the operation is retried once.
///
/// Dropping the last handle closes the connection without sending Unbind.
pub struct Ldap {
    pub(crate) conn: Arc<ConnShared>,
    last_id: Arc<AtomicI32>,
    pub timeout: Option<Duration>,
    pub controls: MaybeControls,
    pub search_opts: Option<SearchOptions>,
    follow_referrals: Option<bool>,
    listener: Option<Arc<dyn ResponseListener>>,
}

impl Clone for Ldap {
    fn clone(&self) -> Self {
        Ldap::from_shared(self.conn.clone())
    }
}

impl fmt::Debug for Ldap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ldap")
            .field("id", &self.conn.id)
            .field("url", &self.conn.addr.url)
            .field("timeout", &self.timeout)
            .field("controls", &self.controls)
            .field("search_opts", &self.search_opts)
            .finish_non_exhaustive()
    }
}

impl Ldap {
    pub(crate) fn from_shared(conn: Arc<ConnShared>) -> Self {
        Ldap {
            conn,
            last_id: Arc::new(AtomicI32::new(0)),
            timeout: None,
            controls: None,
            search_opts: None,
            follow_referrals: None,
            listener: None,
        }
    }

    /// Open a connection to the server given by `url`, with default settings.
    ///
    /// The URL scheme must be __ldap__ or, with TLS support, __ldaps__. Everything after
    /// the port is ignored.
    pub async fn connect(url: &str) -> Result<Ldap> {
        Ldap::connect_with_settings(LdapConnSettings::new(), url).await
    }

    /// Open a connection to the server given by `url`, using the provided settings.
    pub async fn connect_with_settings(settings: LdapConnSettings, url: &str) -> Result<Ldap> {
        Ok(Ldap::from_shared(ConnShared::connect(settings, url).await?))
    }

    fn take_context(&mut self) -> OpContext {
        OpContext {
            controls: self.controls.take(),
            timeout: self.timeout.take(),
            follow: self
                .follow_referrals
                .take()
                .unwrap_or(self.conn.settings.follow_referrals),
            listener: self.listener.take(),
            last_id: self.last_id.clone(),
        }
    }

    async fn run(&mut self, req: Request) -> Result<Outcome> {
        let ctx = self.take_context();
        self.conn.process(&req, &ctx, 0).await
    }

    /// Use the provided `SearchOptions` with the next Search operation. If the next
    /// operation isn't a Search, the options are silently discarded.
    pub fn with_search_options(&mut self, opts: SearchOptions) -> &mut Self {
        self.search_opts = Some(opts);
        self
    }

    /// Pass the provided request control(s) to the next LDAP operation.
    ///
    /// This method accepts either a control vector or a single control, anything
    /// which can be converted into a `RawControl`.
    pub fn with_controls<V: IntoRawControlVec>(&mut self, ctrls: V) -> &mut Self {
        self.controls = Some(ctrls.into());
        self
    }

    /// Perform the next operation with the timeout specified in `duration`, instead of
    /// the response timeout from the settings. For a Search, the timer is reset for
    /// each response.
    ///
    /// If the timeout occurs, the operation returns an error. The connection remains
    /// usable for subsequent operations.
    pub fn with_timeout(&mut self, duration: Duration) -> &mut Self {
        self.timeout = Some(duration);
        self
    }

    /// Override the referral following setting of the connection for the next operation.
    pub fn with_follow_referrals(&mut self, follow: bool) -> &mut Self {
        self.follow_referrals = Some(follow);
        self
    }

    /// Report the individual responses of the next operation to `listener`.
    pub fn with_intermediate_listener<L: ResponseListener + 'static>(&mut self, listener: L) -> &mut Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Perform a Bind with the provided credentials.
    ///
    /// A successful bind is remembered, and repeated after an automatic reconnect.
    pub async fn bind(&mut self, bind: BindRequest) -> Result<LdapResult> {
        Ok(self.run(Request::Bind(bind)).await?.result)
    }

    /// Do a simple Bind with the provided DN (`bind_dn`) and password (`bind_pw`).
    pub async fn simple_bind(&mut self, bind_dn: &str, bind_pw: &str) -> Result<LdapResult> {
        self.bind(BindRequest::simple(bind_dn, bind_pw)).await
    }

    /// Do a SASL Bind with the provided mechanism, running as many round trips as
    /// the mechanism and the server need.
    pub async fn sasl_bind<M: SaslMechanism + 'static>(&mut self, mechanism: M) -> Result<LdapResult> {
        self.bind(BindRequest::sasl(mechanism)).await
    }

    /// Do an SASL EXTERNAL bind on the connection. The identity of the client must
    /// have already been established by the transport, e.g. with a TLS client
    /// certificate. The bind is made with an empty authzId value.
    pub async fn sasl_external_bind(&mut self) -> Result<LdapResult> {
        self.sasl_bind(External::new()).await
    }

    /// Perform a Search with the given base DN (`base`), scope, filter, and the list of
    /// attributes to be returned (`attrs`). If `attrs` is empty, or if it contains a
    /// special name `*` (asterisk), return all (user) attributes. Requesting a special
    /// name `+` (plus sign) will return all operational attributes. Include both `*` and
    /// `+` in order to return all attributes of an entry.
    ///
    /// The returned structure wraps the vector of result entries and the overall
    /// result of the operation. Entries are not directly usable, and must be parsed by
    /// [`SearchEntry::construct()`](struct.SearchEntry.html#method.construct). Search
    /// references are included in the vector, and can be told apart from entries with
    /// [`ResultEntry::is_ref()`](struct.ResultEntry.html#method.is_ref).
    pub async fn search<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchResult> {
        let req = self.search_request(base, scope, filter, attrs);
        let outcome = self.run(req).await?;
        Ok(SearchResult(outcome.entries, outcome.result))
    }

    fn search_request<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Request {
        let opts = self.search_opts.take().unwrap_or_default();
        Request::Search(SearchRequest::new(base, scope, filter, attrs.as_ref()).with_options(opts))
    }

    /// Perform a Search, but unlike [`search()`](#method.search) (q.v., also for
    /// the parameters), which returns all results at once, return a handle which
    /// will be used for retrieving entries one by one. See [`SearchStream`](struct.SearchStream.html)
    /// for the explanation of the protocol which must be adhered to in this case.
    pub async fn streaming_search<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchStream> {
        let req = self.search_request(base, scope, filter, attrs);
        let ctx = self.take_context();
        let tag = req.tag()?;
        let link = self.conn.current_link()?;
        let id = self.conn.next_id(&ctx);
        let pending = link.submit(id, tag, ctx.controls).await?;
        let timeout = ctx.timeout.or(self.conn.settings.response_timeout);
        let mut ldap = self.clone();
        ldap.last_id = self.last_id.clone();
        Ok(SearchStream::new(ldap, pending, timeout, ctx.listener))
    }

    /// Add an entry named by `dn`, with the list of attributes and their values
    /// given in `attrs`. None of the `HashSet`s of values for an attribute may
    /// be empty.
    pub async fn add<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        attrs: Vec<(S, HashSet<S>)>,
    ) -> Result<LdapResult> {
        let req = Request::add(dn, attrs);
        Ok(self.run(req).await?.result)
    }

    /// Compare the value(s) of the attribute `attr` within an entry named by `dn` with the
    /// value `val`. If any of the values is identical to the provided one, return result code 6
    /// (`compareTrue`), otherwise return result code 5 (`compareFalse`). If access control
    /// rules on the server disallow comparison, another result code will be used to indicate
    /// an error.
    pub async fn compare<B: AsRef<[u8]>>(
        &mut self,
        dn: &str,
        attr: &str,
        val: B,
    ) -> Result<CompareResult> {
        let req = Request::compare(dn, attr, val);
        Ok(CompareResult(self.run(req).await?.result))
    }

    /// Delete an entry named by `dn`.
    pub async fn delete(&mut self, dn: &str) -> Result<LdapResult> {
        let req = Request::delete(dn);
        Ok(self.run(req).await?.result)
    }

    /// Modify an entry named by `dn` by sequentially applying the modifications given by `mods`.
    /// See the [`Mod`](enum.Mod.html) documentation for the description of possible values.
    pub async fn modify<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        mods: Vec<Mod<S>>,
    ) -> Result<LdapResult> {
        let req = Request::modify(dn, mods);
        Ok(self.run(req).await?.result)
    }

    /// Rename and/or move an entry named by `dn`. The new name is given by `rdn`. If
    /// `delete_old` is `true`, delete the previous value of the naming attribute from
    /// the entry. If the entry is to be moved elsewhere in the DIT, `new_sup` gives
    /// the new superior entry where the moved entry will be anchored.
    pub async fn modifydn(
        &mut self,
        dn: &str,
        rdn: &str,
        delete_old: bool,
        new_sup: Option<&str>,
    ) -> Result<LdapResult> {
        let req = Request::modifydn(dn, rdn, delete_old, new_sup);
        Ok(self.run(req).await?.result)
    }

    /// Perform an Extended operation given by `exop`. Extended operations are defined in the
    /// [`exop`](exop/index.html) module.
    ///
    /// StartTLS must not be sent this way; use [`start_tls()`](#method.start_tls).
    pub async fn extended<E>(&mut self, exop: E) -> Result<ExopResult>
    where
        E: Into<Exop>,
    {
        let outcome = self.run(Request::Extended(exop.into())).await?;
        Ok(ExopResult(outcome.exop, outcome.result))
    }

    /// Upgrade the connection to TLS with the StartTLS extended operation.
    ///
    /// A refused or failed upgrade leaves the connection closed. After a successful
    /// upgrade, automatic reconnects also use StartTLS.
    #[cfg(feature = "tls")]
    pub async fn start_tls(&mut self) -> Result<LdapResult> {
        let ctx = self.take_context();
        let link = self.conn.current_link()?;
        if link.core.has_tls() {
            return Err(LdapError::Local(String::from("TLS is already active")));
        }
        let params = StartTlsParams {
            settings: self.conn.settings.clone(),
            host: self.conn.addr.host.clone(),
        };
        let id = self.conn.next_id(&ctx);
        let res = link.start_tls(id, params).await?;
        self.conn.upgraded.store(true, Ordering::Release);
        Ok(res)
    }

    /// Start an operation without waiting for its result, and return a handle for
    /// obtaining the result later.
    ///
    /// Bind, Unbind and Abandon can't be sent this way, and the connection must not
    /// be in synchronous mode. The operation isn't retried after a reconnect, and
    /// referrals aren't followed.
    pub async fn send_async(&mut self, req: Request) -> Result<AsyncRequestHandle> {
        let ctx = self.take_context();
        self.conn.send_async(&req, ctx).await
    }

    /// Like [`send_async()`](#method.send_async), reporting the individual responses
    /// to `listener`.
    pub async fn send_async_with_listener<L: ResponseListener + 'static>(
        &mut self,
        req: Request,
        listener: L,
    ) -> Result<AsyncRequestHandle> {
        self.with_intermediate_listener(listener);
        self.send_async(req).await
    }

    /// Terminate the connection to the server with an Unbind.
    pub async fn unbind(&mut self) -> Result<()> {
        let ctx = self.take_context();
        self.conn.unbind(&ctx).await
    }

    /// Unbind if the connection is still up, and close it. Calling this method more
    /// than once has no further effect.
    pub async fn close(&mut self) {
        if let Err(e) = self.unbind().await {
            trace!("close of connection {}: {}", self.conn.id, e);
        }
        self.conn
            .terminate(DisconnectInfo::new(DisconnectType::ClosedWithoutUnbind))
            .await;
    }

    /// Close the connection without Unbind, recording `kind` and `message` as the reason,
    /// unless a reason has already been recorded.
    pub async fn terminate(&mut self, kind: DisconnectType, message: Option<&str>) {
        let mut info = DisconnectInfo::new(kind);
        if let Some(message) = message {
            info = info.with_message(message);
        }
        self.conn.terminate(info).await;
    }

    /// Return the message ID of the last operation started through this handle. When the
    /// handle is initialized, this value is set to zero. The intended use is to obtain the
    /// ID of a timed out operation for passing it to an Abandon or Cancel operation.
    pub fn last_id(&self) -> RequestId {
        self.last_id.load(Ordering::Relaxed)
    }

    /// Ask the server to abandon an operation identified by `msgid`.
    pub async fn abandon(&mut self, msgid: RequestId) -> Result<()> {
        self.run(Request::Abandon(msgid)).await.map(|_| ())
    }

    /// Whether the connection is open and its transport is up.
    ///
    /// This is a local check; a round-trip operation (e.g., `WhoAmI`) is needed to
    /// find out whether the server is still answering.
    pub fn is_connected(&self) -> bool {
        match self.conn.current_link() {
            Ok(link) => !link.core.is_closed(),
            Err(_) => false,
        }
    }

    /// State of the background reader of the current transport.
    pub fn reader_state(&self) -> ReaderState {
        self.conn
            .link()
            .map(|link| link.core.reader_state())
            .unwrap_or(ReaderState::NotStarted)
    }

    /// When the current transport was established.
    pub fn connected_at(&self) -> Option<Instant> {
        self.conn.link().map(|link| link.core.connected_at)
    }

    /// Why the current transport was torn down, if it was.
    pub fn disconnect_info(&self) -> Option<DisconnectInfo> {
        self.conn
            .link()
            .and_then(|link| link.core.disconnect_info().cloned())
    }

    /// Whether the current transport uses TLS.
    pub fn has_tls(&self) -> bool {
        self.conn.link().map(|link| link.core.has_tls()).unwrap_or(false)
    }

    /// Process-unique identifier of the connection. It doesn't change on reconnect.
    pub fn connection_id(&self) -> u64 {
        self.conn.id
    }

    /// Server URL of the connection, without the path.
    pub fn url(&self) -> &str {
        &self.conn.addr.url
    }

    /// Name of the pool which created the connection, if any.
    pub fn pool_name(&self) -> Option<&str> {
        self.conn.pool_name.get().map(String::as_str)
    }

    /// Whether the connection is in synchronous mode.
    pub fn is_synchronous(&self) -> bool {
        self.conn.settings.synchronous_mode
    }

    /// Number of operations waiting for their results.
    pub fn outstanding_requests(&self) -> usize {
        self.conn
            .link()
            .map(|link| link.core.router.outstanding())
            .unwrap_or(0)
    }
}

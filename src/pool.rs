//! Connection pool.
//!
//! A pool holds up to `max_connections` established connections, all bound with the
//! same credentials, and hands them out one at a time. A connection which fails a
//! health check, or on which an operation failed at the connection level, is
//! _defunct_: the pool terminates it and tries to create a replacement. Replacements
//! which couldn't be created are counted, and the count is paid down by later
//! checkouts and by the periodic health check.
//!
//! ```rust,no_run
//! use ldapconn::{BindRequest, LdapConnSettings, Scope};
//! use ldapconn::pool::{LdapConnectionPool, PoolSettings, SingleServerSet};
//! use ldapconn::result::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let servers = SingleServerSet::with_settings("ldap://localhost:2389", LdapConnSettings::new());
//!     let bind = BindRequest::simple("cn=app,dc=example,dc=org", "secret");
//!     let pool = LdapConnectionPool::new(servers, Some(bind), PoolSettings::new().set_max_connections(4)).await?;
//!     let mut ldap = pool.get_connection().await?;
//!     match ldap.search("dc=example,dc=org", Scope::Subtree, "(uid=*)", vec!["cn"]).await {
//!         Ok(res) => {
//!             pool.release_connection(ldap).await;
//!             let (entries, _res) = res.success()?;
//!             println!("{} entries", entries.len());
//!         }
//!         Err(e) => {
//!             pool.release_connection_after_error(ldap, &e).await;
//!             return Err(e);
//!         }
//!     }
//!     pool.close(true, 1).await;
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::disconnect::DisconnectType;
use crate::ldap::Ldap;
use crate::request::BindRequest;
use crate::result::{LdapError, LdapResult, Result};

use flume::{Receiver, Sender, TrySendError};
use futures_util::stream::{self, StreamExt};
use tokio::time;
use tokio_util::sync::CancellationToken;

mod health;
mod server_set;

pub use health::{DefaultHealthCheck, HealthCheck, WhoAmIHealthCheck};
pub use server_set::{ServerSet, SingleServerSet};

/// Lifecycle state of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    Open,
    Closing,
    Closed,
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Pool configuration.
///
/// Like [`LdapConnSettings`](../struct.LdapConnSettings.html), the structure is opaque,
/// with a builder-like interface for changing the defaults.
#[derive(Clone)]
pub struct PoolSettings {
    initial_connections: usize,
    max_connections: usize,
    initial_connect_threads: usize,
    throw_on_connect_failure: bool,
    max_wait: Duration,
    max_connection_age: Option<Duration>,
    min_disconnect_interval: Duration,
    health_check_interval: Duration,
    create_if_necessary: bool,
    pool_name: Option<String>,
    health_check: Arc<dyn HealthCheck>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            initial_connections: 1,
            max_connections: 10,
            initial_connect_threads: 1,
            throw_on_connect_failure: true,
            max_wait: Duration::ZERO,
            max_connection_age: None,
            min_disconnect_interval: Duration::ZERO,
            health_check_interval: Duration::from_secs(60),
            create_if_necessary: true,
            pool_name: None,
            health_check: Arc::new(DefaultHealthCheck),
        }
    }
}

impl PoolSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections created with the pool. Defaults to 1, and is capped
    /// by the maximum.
    pub fn set_initial_connections(mut self, n: usize) -> Self {
        self.initial_connections = n;
        self
    }

    /// Capacity of the pool. Defaults to 10. Zero is treated as one.
    pub fn set_max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    /// How many initial connections are created concurrently. Defaults to 1.
    pub fn set_initial_connect_threads(mut self, n: usize) -> Self {
        self.initial_connect_threads = n;
        self
    }

    /// If `true`, the default, pool creation fails if any initial connection
    /// can't be created. Otherwise, missing connections are counted as replacement
    /// debt.
    pub fn set_throw_on_connect_failure(mut self, throw: bool) -> Self {
        self.throw_on_connect_failure = throw;
        self
    }

    /// How long a checkout waits for a connection to be released if none are
    /// available. Defaults to zero.
    pub fn set_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    /// Connections older than this are replaced when released or examined by the
    /// health check. No limit by default.
    pub fn set_max_connection_age(mut self, age: Duration) -> Self {
        self.max_connection_age = Some(age);
        self
    }

    /// Minimum time between two age-based replacements. Defaults to zero.
    pub fn set_min_disconnect_interval(mut self, interval: Duration) -> Self {
        self.min_disconnect_interval = interval;
        self
    }

    /// Period of the background health check. Defaults to 60 seconds.
    pub fn set_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// If `true`, the default, a checkout which finds no available connection creates
    /// a new one, even if that exceeds the capacity.
    pub fn set_create_if_necessary(mut self, create: bool) -> Self {
        self.create_if_necessary = create;
        self
    }

    /// Name of the pool, reported by [`Ldap::pool_name()`](../struct.Ldap.html#method.pool_name)
    /// of its connections.
    pub fn set_pool_name<S: Into<String>>(mut self, name: S) -> Self {
        self.pool_name = Some(name.into());
        self
    }

    pub fn set_health_check<H: HealthCheck + 'static>(mut self, health_check: H) -> Self {
        self.health_check = Arc::new(health_check);
        self
    }
}

/// Snapshot of pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    pub available: usize,
    pub max_connections: usize,
    pub replacement_debt: usize,
    pub connections_created: u64,
    pub failed_connects: u64,
    pub closed_defunct: u64,
    pub closed_expired: u64,
    pub closed_unneeded: u64,
    pub successful_checkouts: u64,
    pub failed_checkouts: u64,
    pub releases: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    failed_connects: AtomicU64,
    closed_defunct: AtomicU64,
    closed_expired: AtomicU64,
    closed_unneeded: AtomicU64,
    checkouts: AtomicU64,
    failed_checkouts: AtomicU64,
    releases: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct PoolInner {
    name: String,
    servers: Box<dyn ServerSet>,
    bind: Option<BindRequest>,
    settings: PoolSettings,
    max: usize,
    tx: Sender<Ldap>,
    rx: Receiver<Ldap>,
    debt: AtomicUsize,
    state: AtomicU8,
    last_expiry: Mutex<Option<Instant>>,
    counters: Counters,
    shutdown: CancellationToken,
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Pool of LDAP connections.
///
/// The pool handle can be cloned; all clones refer to the same pool. A connection
/// obtained from the pool must be given back through one of the release methods,
/// depending on how it was used. A connection which is simply dropped is closed when its
/// last clone goes away, and its slot isn't counted as debt: the pool refills it only
/// through a checkout which creates a connection, followed by its release.
#[derive(Clone)]
pub struct LdapConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for LdapConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapConnectionPool")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("available", &self.inner.rx.len())
            .field("max", &self.inner.max)
            .finish()
    }
}

impl LdapConnectionPool {
    /// Create a pool, establish its initial connections, and start the background
    /// health check. Must be called within a Tokio runtime.
    ///
    /// Every connection is bound with `bind`, if given, before entering the pool.
    pub async fn new<S: ServerSet + 'static>(
        servers: S,
        bind: Option<BindRequest>,
        settings: PoolSettings,
    ) -> Result<LdapConnectionPool> {
        let max = settings.max_connections.max(1);
        let (tx, rx) = flume::bounded(max);
        let name = settings
            .pool_name
            .clone()
            .unwrap_or_else(|| format!("pool-{}", NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)));
        let inner = Arc::new(PoolInner {
            name,
            servers: Box::new(servers),
            bind,
            settings,
            max,
            tx,
            rx,
            debt: AtomicUsize::new(0),
            state: AtomicU8::new(OPEN),
            last_expiry: Mutex::new(None),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
        });
        let initial = inner.settings.initial_connections.min(max);
        let threads = inner.settings.initial_connect_threads.max(1);
        let results: Vec<Result<Ldap>> = stream::iter(0..initial)
            .map(|_| inner.create_connection())
            .buffer_unordered(threads)
            .collect()
            .await;
        let mut created = Vec::with_capacity(initial);
        let mut first_err = None;
        for res in results {
            match res {
                Ok(conn) => created.push(conn),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            if inner.settings.throw_on_connect_failure {
                warn!("pool {}: initial connection failed: {}", inner.name, e);
                for mut conn in created {
                    conn.terminate(DisconnectType::PoolCreationFailure, None).await;
                }
                return Err(e);
            }
            debug!("pool {}: initial connection failed: {}", inner.name, e);
        }
        inner.debt.store(max - created.len(), Ordering::Release);
        for conn in created {
            inner.offer(conn).await;
        }
        spawn_health_check(Arc::downgrade(&inner), inner.settings.health_check_interval, inner.shutdown.clone());
        debug!(
            "pool {} open, {} of {} connections available",
            inner.name,
            inner.rx.len(),
            max
        );
        Ok(LdapConnectionPool { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> PoolState {
        match self.inner.state.load(Ordering::Acquire) {
            OPEN => PoolState::Open,
            CLOSING => PoolState::Closing,
            _ => PoolState::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != OPEN
    }

    pub fn available_connections(&self) -> usize {
        self.inner.rx.len()
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max
    }

    pub fn statistics(&self) -> PoolStatistics {
        let c = &self.inner.counters;
        PoolStatistics {
            available: self.inner.rx.len(),
            max_connections: self.inner.max,
            replacement_debt: self.inner.debt.load(Ordering::Acquire),
            connections_created: c.created.load(Ordering::Relaxed),
            failed_connects: c.failed_connects.load(Ordering::Relaxed),
            closed_defunct: c.closed_defunct.load(Ordering::Relaxed),
            closed_expired: c.closed_expired.load(Ordering::Relaxed),
            closed_unneeded: c.closed_unneeded.load(Ordering::Relaxed),
            successful_checkouts: c.checkouts.load(Ordering::Relaxed),
            failed_checkouts: c.failed_checkouts.load(Ordering::Relaxed),
            releases: c.releases.load(Ordering::Relaxed),
        }
    }

    /// Check out a connection.
    ///
    /// Available connections are tried first; one which isn't connected or fails the
    /// checkout health check is terminated, and a new connection is returned in its
    /// place. If that can't be created either, a connection is
    /// created if there is replacement debt. Otherwise, the checkout waits up to
    /// `max_wait` for a release, and finally creates a new connection if allowed to,
    /// or fails with `NoConnectionsAvailable`.
    pub async fn get_connection(&self) -> Result<Ldap> {
        let res = self.inner.checkout().await;
        match res {
            Ok(_) => bump(&self.inner.counters.checkouts),
            Err(_) => bump(&self.inner.counters.failed_checkouts),
        }
        res
    }

    /// Return a connection after successful use.
    ///
    /// An expired connection is replaced, a connection failing the release health check
    /// is treated as defunct, and a connection which doesn't fit into the pool is closed.
    pub async fn release_connection(&self, conn: Ldap) {
        bump(&self.inner.counters.releases);
        self.inner.release(conn).await;
    }

    /// Return a connection after an operation on it failed with `err`. The health check
    /// decides whether the connection is still usable.
    pub async fn release_connection_after_error(&self, conn: Ldap, err: &LdapError) {
        bump(&self.inner.counters.releases);
        match self.inner.settings.health_check.ensure_valid_after_error(&conn, err) {
            Ok(()) => self.inner.release(conn).await,
            Err(e) => {
                debug!("pool {}: connection {} defunct after error: {}", self.inner.name, conn.connection_id(), e);
                self.inner.defunct(conn).await;
            }
        }
    }

    /// Return a connection known to be unusable. It's terminated, and a replacement
    /// is created if there is room for it.
    pub async fn release_defunct_connection(&self, conn: Ldap) {
        bump(&self.inner.counters.releases);
        self.inner.defunct(conn).await;
    }

    /// Terminate an unusable connection, and check out a new one in its place.
    pub async fn replace_defunct_connection(&self, conn: Ldap) -> Result<Ldap> {
        let inner = &self.inner;
        inner.terminate_defunct(conn).await;
        if inner.is_closed() {
            return Err(LdapError::PoolClosed);
        }
        match inner.create_connection().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                inner.debt.fetch_add(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    /// Check out a connection, bind it with `bind`, and return it to the pool after
    /// restoring its identity. The result of the bind is returned.
    pub async fn bind_and_revert_authentication(&self, bind: BindRequest) -> Result<LdapResult> {
        let (res, _) = self
            .bind_and_revert_authentication_with(bind, |_| async { Ok::<(), LdapError>(()) })
            .await?;
        Ok(res)
    }

    /// Check out a connection, bind it with `bind`, and if the bind succeeds, run `work`
    /// with a handle to the connection. Afterwards, the connection is bound again with
    /// the pool's credentials, or anonymously if the pool has none, and released. If
    /// that bind fails, the connection is released as defunct.
    ///
    /// Returns the result of the first bind, and the output of `work` if it ran.
    pub async fn bind_and_revert_authentication_with<F, Fut, T>(
        &self,
        bind: BindRequest,
        work: F,
    ) -> Result<(LdapResult, Option<T>)>
    where
        F: FnOnce(Ldap) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut conn = self.get_connection().await?;
        let res = match conn.bind(bind).await {
            Ok(res) => res,
            Err(e) => {
                self.release_connection_after_error(conn, &e).await;
                return Err(e);
            }
        };
        let output = if res.rc == 0 {
            Some(work(conn.clone()).await)
        } else {
            None
        };
        let revert = self
            .inner
            .bind
            .clone()
            .unwrap_or_else(BindRequest::anonymous);
        match conn.bind(revert).await.and_then(|r| r.success()) {
            Ok(_) => self.release_connection(conn).await,
            Err(e) => {
                warn!("pool {}: restoring identity of connection {} failed: {}", self.inner.name, conn.connection_id(), e);
                self.release_defunct_connection(conn).await;
            }
        }
        Ok((res, output.transpose()?))
    }

    /// Close the pool and its available connections, with Unbind if `unbind` is `true`.
    /// Up to `num_threads` connections are closed concurrently. Connections released
    /// later are closed on release. Calling this method again has no effect.
    pub async fn close(&self, unbind: bool, num_threads: usize) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        inner.shutdown.cancel();
        let conns: Vec<Ldap> = inner.rx.drain().collect();
        debug!("pool {} closing {} connections", inner.name, conns.len());
        stream::iter(conns)
            .for_each_concurrent(num_threads.max(1), |mut conn| async move {
                if unbind {
                    conn.close().await;
                } else {
                    conn.terminate(DisconnectType::PoolClosed, None).await;
                }
            })
            .await;
        inner.state.store(CLOSED, Ordering::Release);
    }
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != OPEN
    }

    fn expired(&self, conn: &Ldap) -> bool {
        match (self.settings.max_connection_age, conn.connected_at()) {
            (Some(max_age), Some(at)) => at.elapsed() >= max_age,
            _ => false,
        }
    }

    /// Whether an age-based replacement is allowed now; if so, it's recorded.
    fn claim_expiry_slot(&self) -> bool {
        let mut last = self.last_expiry.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.settings.min_disconnect_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn take_debt(&self) -> bool {
        self.debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .is_ok()
    }

    async fn create_connection(&self) -> Result<Ldap> {
        let res = self.try_create().await;
        match res {
            Ok(ref conn) => {
                bump(&self.counters.created);
                trace!("pool {}: created connection {}", self.name, conn.connection_id());
            }
            Err(ref e) => {
                bump(&self.counters.failed_connects);
                debug!("pool {}: connection creation failed: {}", self.name, e);
            }
        }
        res
    }

    async fn try_create(&self) -> Result<Ldap> {
        let mut conn = self.servers.get_connection().await?;
        let _ = conn.conn.pool_name.set(self.name.clone());
        if let Some(ref bind) = self.bind {
            if let Err(e) = conn.bind(bind.clone()).await.and_then(|r| r.success()) {
                conn.terminate(DisconnectType::PoolCreationFailure, Some("pool bind failed"))
                    .await;
                return Err(e);
            }
        }
        if let Err(e) = self
            .settings
            .health_check
            .ensure_new_connection_valid(&mut conn)
            .await
        {
            conn.terminate(
                DisconnectType::PoolCreationFailure,
                Some("new connection failed the health check"),
            )
            .await;
            return Err(e);
        }
        Ok(conn)
    }

    async fn usable_for_checkout(&self, conn: &mut Ldap) -> bool {
        if !conn.is_connected() {
            return false;
        }
        match self.settings.health_check.ensure_valid_for_checkout(conn).await {
            Ok(()) => true,
            Err(e) => {
                debug!("pool {}: connection {} failed checkout check: {}", self.name, conn.connection_id(), e);
                false
            }
        }
    }

    async fn checkout(&self) -> Result<Ldap> {
        if self.is_closed() {
            return Err(LdapError::PoolClosed);
        }
        for _ in 0..self.max {
            let mut conn = match self.rx.try_recv() {
                Ok(conn) => conn,
                Err(_) => break,
            };
            if self.usable_for_checkout(&mut conn).await {
                return Ok(conn);
            }
            self.terminate_defunct(conn).await;
            if self.is_closed() {
                return Err(LdapError::PoolClosed);
            }
            match self.create_connection().await {
                Ok(conn) => return Ok(conn),
                Err(_) => {
                    self.debt.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
        if self.take_debt() {
            return match self.create_connection().await {
                Ok(conn) => Ok(conn),
                Err(e) => {
                    self.debt.fetch_add(1, Ordering::AcqRel);
                    Err(e)
                }
            };
        }
        if !self.settings.max_wait.is_zero() {
            let waited = tokio::select! {
                res = time::timeout(self.settings.max_wait, self.rx.recv_async()) => res.ok().and_then(|r| r.ok()),
                _ = self.shutdown.cancelled() => return Err(LdapError::PoolClosed),
            };
            if let Some(mut conn) = waited {
                if self.usable_for_checkout(&mut conn).await {
                    return Ok(conn);
                }
                self.terminate_defunct(conn).await;
                if self.is_closed() {
                    return Err(LdapError::PoolClosed);
                }
                return match self.create_connection().await {
                    Ok(conn) => Ok(conn),
                    Err(e) => {
                        self.debt.fetch_add(1, Ordering::AcqRel);
                        Err(e)
                    }
                };
            }
        }
        if self.is_closed() {
            return Err(LdapError::PoolClosed);
        }
        if self.settings.create_if_necessary {
            return self.create_connection().await;
        }
        Err(LdapError::NoConnectionsAvailable)
    }

    /// Put a connection into the available set, or close it if the set is full or
    /// the pool is closed.
    async fn offer(&self, conn: Ldap) {
        if self.is_closed() {
            let mut conn = conn;
            conn.terminate(DisconnectType::PoolClosed, None).await;
            return;
        }
        let mut conn = match self.tx.try_send(conn) {
            Ok(()) => return,
            Err(TrySendError::Full(conn)) | Err(TrySendError::Disconnected(conn)) => conn,
        };
        debug!("pool {} full, closing connection {}", self.name, conn.connection_id());
        bump(&self.counters.closed_unneeded);
        conn.close().await;
    }

    async fn release(&self, mut conn: Ldap) {
        if self.is_closed() {
            conn.close().await;
            return;
        }
        if self.expired(&conn) && self.claim_expiry_slot() {
            self.replace_expired(conn).await;
            return;
        }
        if !conn.is_connected() {
            self.defunct(conn).await;
            return;
        }
        if let Err(e) = self.settings.health_check.ensure_valid_for_release(&mut conn).await {
            debug!("pool {}: connection {} failed release check: {}", self.name, conn.connection_id(), e);
            self.defunct(conn).await;
            return;
        }
        self.offer(conn).await;
    }

    /// Swap an expired connection for a new one. If the new one can't be created, the
    /// old one is kept.
    async fn replace_expired(&self, mut old: Ldap) {
        match self.create_connection().await {
            Ok(new) => {
                debug!("pool {}: connection {} expired, replaced by {}", self.name, old.connection_id(), new.connection_id());
                bump(&self.counters.closed_expired);
                old.terminate(DisconnectType::PoolExpired, None).await;
                self.offer(new).await;
            }
            Err(_) => {
                if old.is_connected() {
                    self.offer(old).await;
                } else {
                    self.defunct(old).await;
                }
            }
        }
    }

    async fn terminate_defunct(&self, mut conn: Ldap) {
        bump(&self.counters.closed_defunct);
        debug!("pool {}: terminating defunct connection {}", self.name, conn.connection_id());
        conn.terminate(DisconnectType::PoolDefunct, None).await;
    }

    async fn defunct(&self, conn: Ldap) {
        self.terminate_defunct(conn).await;
        if self.is_closed() || self.rx.len() >= self.max {
            return;
        }
        match self.create_connection().await {
            Ok(conn) => self.offer(conn).await,
            Err(_) => {
                self.debt.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Examine each available connection once, then pay down the replacement debt.
    async fn health_pass(&self) {
        let mut seen = HashSet::new();
        for _ in 0..self.rx.len() {
            if self.is_closed() {
                return;
            }
            let mut conn = match self.rx.try_recv() {
                Ok(conn) => conn,
                Err(_) => break,
            };
            if !seen.insert(conn.connection_id()) {
                self.offer(conn).await;
                break;
            }
            if self.expired(&conn) && self.claim_expiry_slot() {
                self.replace_expired(conn).await;
                continue;
            }
            if !conn.is_connected() {
                self.defunct(conn).await;
                continue;
            }
            match self
                .settings
                .health_check
                .ensure_valid_for_continued_use(&mut conn)
                .await
            {
                Ok(()) => self.offer(conn).await,
                Err(e) => {
                    debug!("pool {}: connection {} failed health check: {}", self.name, conn.connection_id(), e);
                    self.defunct(conn).await;
                }
            }
        }
        while !self.is_closed() && self.rx.len() < self.max && self.take_debt() {
            match self.create_connection().await {
                Ok(conn) => self.offer(conn).await,
                Err(_) => {
                    self.debt.fetch_add(1, Ordering::AcqRel);
                    break;
                }
            }
        }
        trace!(
            "pool {} health pass done, {} available, debt {}",
            self.name,
            self.rx.len(),
            self.debt.load(Ordering::Acquire)
        );
    }
}

fn spawn_health_check(pool: Weak<PoolInner>, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = time::sleep(interval) => (),
                _ = shutdown.cancelled() => break,
            }
            let inner = match pool.upgrade() {
                Some(inner) => inner,
                None => break,
            };
            inner.health_pass().await;
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn settings_defaults() {
        let s = PoolSettings::new();
        assert_eq!(s.health_check_interval, Duration::from_secs(60));
        assert!(s.create_if_necessary);
        assert!(s.throw_on_connect_failure);
        assert_eq!(s.max_wait, Duration::ZERO);
        let s = s.set_max_connections(3).set_pool_name("p");
        assert_eq!(s.max_connections, 3);
        assert_eq!(s.pool_name.as_deref(), Some("p"));
    }

    #[test]
    fn statistics_default_is_empty() {
        let stats = PoolStatistics::default();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.replacement_debt, 0);
    }
}

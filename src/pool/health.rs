use std::time::Duration;

use crate::exop::{WhoAmI, WhoAmIResp};
use crate::ldap::Ldap;
use crate::result::{LdapError, Result};

use async_trait::async_trait;

/// Checks applied by a pool to its connections.
///
/// A failed check makes the pool treat the connection as defunct: it's terminated
/// and, capacity permitting, replaced. The pool itself checks that a connection is
/// still connected before calling any of the methods, so the default implementations
/// accept every connection.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Called for a newly created connection, after the pool's bind.
    async fn ensure_new_connection_valid(&self, conn: &mut Ldap) -> Result<()> {
        let _ = conn;
        Ok(())
    }

    /// Called before a connection is handed out.
    async fn ensure_valid_for_checkout(&self, conn: &mut Ldap) -> Result<()> {
        let _ = conn;
        Ok(())
    }

    /// Called when a connection is returned to the pool.
    async fn ensure_valid_for_release(&self, conn: &mut Ldap) -> Result<()> {
        let _ = conn;
        Ok(())
    }

    /// Called for an available connection during the periodic health check.
    async fn ensure_valid_for_continued_use(&self, conn: &mut Ldap) -> Result<()> {
        let _ = conn;
        Ok(())
    }

    /// Decide whether a connection is still usable after an operation on it failed
    /// with `err`. The default rejects the connection on connection-level errors.
    fn ensure_valid_after_error(&self, conn: &Ldap, err: &LdapError) -> Result<()> {
        let _ = conn;
        if err.is_connection_level() {
            Err(LdapError::InvalidConnection(format!(
                "connection-level failure: {}",
                err
            )))
        } else {
            Ok(())
        }
    }
}

/// Health check with only the default behavior.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHealthCheck;

impl HealthCheck for DefaultHealthCheck {}

/// Health check performing a Who Am I round trip.
///
/// Each phase can be turned on or off separately. By default, new connections and
/// connections examined by the periodic check are probed; checkout and release
/// are not, since they are on the application's path.
#[derive(Clone, Debug)]
pub struct WhoAmIHealthCheck {
    timeout: Duration,
    on_new: bool,
    on_checkout: bool,
    on_release: bool,
    on_continued_use: bool,
}

impl Default for WhoAmIHealthCheck {
    fn default() -> Self {
        WhoAmIHealthCheck {
            timeout: Duration::from_secs(5),
            on_new: true,
            on_checkout: false,
            on_release: false,
            on_continued_use: true,
        }
    }
}

impl WhoAmIHealthCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time allowed for the probe response. Defaults to five seconds.
    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_on_new(mut self, on: bool) -> Self {
        self.on_new = on;
        self
    }

    pub fn set_on_checkout(mut self, on: bool) -> Self {
        self.on_checkout = on;
        self
    }

    pub fn set_on_release(mut self, on: bool) -> Self {
        self.on_release = on;
        self
    }

    pub fn set_on_continued_use(mut self, on: bool) -> Self {
        self.on_continued_use = on;
        self
    }

    async fn probe(&self, conn: &mut Ldap) -> Result<()> {
        let (exop, _res) = conn
            .with_timeout(self.timeout)
            .extended(WhoAmI)
            .await?
            .success()?;
        let resp: WhoAmIResp = exop.parse()?;
        trace!("health probe on connection {}: authzid {:?}", conn.connection_id(), resp.authzid);
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for WhoAmIHealthCheck {
    async fn ensure_new_connection_valid(&self, conn: &mut Ldap) -> Result<()> {
        if self.on_new {
            self.probe(conn).await?;
        }
        Ok(())
    }

    async fn ensure_valid_for_checkout(&self, conn: &mut Ldap) -> Result<()> {
        if self.on_checkout {
            self.probe(conn).await?;
        }
        Ok(())
    }

    async fn ensure_valid_for_release(&self, conn: &mut Ldap) -> Result<()> {
        if self.on_release {
            self.probe(conn).await?;
        }
        Ok(())
    }

    async fn ensure_valid_for_continued_use(&self, conn: &mut Ldap) -> Result<()> {
        if self.on_continued_use {
            self.probe(conn).await?;
        }
        Ok(())
    }
}

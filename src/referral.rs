//! Referral URLs and the connections used for following them.

use std::fmt;

use crate::ldap::Ldap;
use crate::result::{LdapError, Result};

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use url::Url;

/// Parsed LDAP URL from a referral result or a search reference.
///
/// Only the parts needed for repeating an operation elsewhere are kept: the
/// server and the target DN. The attribute list, scope and filter of the URL, if
/// present, are ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferralUrl {
    url: String,
    server: Option<String>,
    dn: Option<String>,
}

impl ReferralUrl {
    pub fn parse(s: &str) -> Result<ReferralUrl> {
        let url = Url::parse(s)?;
        match url.scheme() {
            "ldap" | "ldaps" => (),
            scheme => return Err(LdapError::UnknownScheme(String::from(scheme))),
        }
        let server = match url.host_str() {
            Some("") | None => None,
            Some(host) => Some(match url.port() {
                Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                None => format!("{}://{}", url.scheme(), host),
            }),
        };
        let path = url.path().strip_prefix('/').unwrap_or(url.path());
        let dn = percent_decode_str(path)
            .decode_utf8()
            .map_err(|_| LdapError::DecodingUTF8)?;
        Ok(ReferralUrl {
            url: String::from(s),
            server,
            dn: if dn.is_empty() {
                None
            } else {
                Some(dn.into_owned())
            },
        })
    }

    /// URL of the referred server, without the path and query. `None` if the
    /// referral doesn't name a host, meaning that the originating server is meant.
    pub fn server_url(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Target DN, percent-decoded. `None` if the operation should target the
    /// same DN as the original request.
    pub fn dn(&self) -> Option<&str> {
        self.dn.as_deref()
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for ReferralUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Source of connections for following referrals.
///
/// The returned connection is used for a single operation and then terminated,
/// so it shouldn't be taken from a pool.
#[async_trait]
pub trait ReferralConnector: Send + Sync {
    async fn get_referral_connection(&self, referral: &ReferralUrl, origin: &Ldap) -> Result<Ldap>;
}

/// Default referral connector.
///
/// Connects to the referred server with the settings of the originating connection,
/// and repeats the last successful bind of the originating connection, if there was one.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultReferralConnector;

#[async_trait]
impl ReferralConnector for DefaultReferralConnector {
    async fn get_referral_connection(&self, referral: &ReferralUrl, origin: &Ldap) -> Result<Ldap> {
        let server = referral.server_url().unwrap_or(origin.url());
        debug!("following referral {} through {}", referral, server);
        let mut ldap = Ldap::connect_with_settings(origin.conn.settings.clone(), server).await?;
        if let Some(bind) = origin.conn.last_bind() {
            if let Err(e) = ldap.bind(bind).await.and_then(|res| res.success()) {
                ldap.terminate(
                    crate::DisconnectType::Referral,
                    Some("re-bind on referred server failed"),
                )
                .await;
                return Err(e);
            }
        }
        Ok(ldap)
    }
}

use crate::conn::LdapConnSettings;
use crate::ldap::Ldap;
use crate::result::Result;

use async_trait::async_trait;

/// Source of new connections for a pool.
///
/// The pool applies its bind and its new-connection health check to whatever the
/// set returns.
#[async_trait]
pub trait ServerSet: Send + Sync {
    async fn get_connection(&self) -> Result<Ldap>;
}

/// Every connection goes to the same server.
#[derive(Clone)]
pub struct SingleServerSet {
    url: String,
    settings: LdapConnSettings,
}

impl SingleServerSet {
    pub fn new(url: &str) -> Self {
        SingleServerSet::with_settings(url, LdapConnSettings::new())
    }

    pub fn with_settings(url: &str, settings: LdapConnSettings) -> Self {
        SingleServerSet {
            url: String::from(url),
            settings,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ServerSet for SingleServerSet {
    async fn get_connection(&self) -> Result<Ldap> {
        Ldap::connect_with_settings(self.settings.clone(), &self.url).await
    }
}

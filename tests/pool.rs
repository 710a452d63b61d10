mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{MockServer, eventually};
use ldapconn::exop::{WhoAmI, WhoAmIResp};
use ldapconn::pool::{
    HealthCheck, LdapConnectionPool, PoolSettings, PoolState, SingleServerSet, WhoAmIHealthCheck,
};
use ldapconn::result::{Result, rc};
use ldapconn::{BindRequest, Ldap, LdapError, Scope};

const ADMIN: &str = "cn=admin,dc=example,dc=org";

fn admin() -> Option<BindRequest> {
    Some(BindRequest::simple(ADMIN, "secret"))
}

async fn pool(server: &MockServer, settings: PoolSettings) -> LdapConnectionPool {
    LdapConnectionPool::new(SingleServerSet::new(&server.url()), admin(), settings)
        .await
        .expect("pool")
}

#[tokio::test]
async fn checkout_and_release() {
    let server = MockServer::directory().await;
    let settings = PoolSettings::new().set_max_connections(2).set_pool_name("directory");
    let pool = pool(&server, settings).await;
    assert_eq!(pool.name(), "directory");
    assert_eq!(pool.available_connections(), 1);
    assert_eq!(pool.statistics().replacement_debt, 1);

    let mut conn = pool.get_connection().await.expect("checkout");
    assert_eq!(conn.pool_name(), Some("directory"));
    assert_eq!(pool.available_connections(), 0);
    let (rs, _) = conn
        .search("dc=example,dc=org", Scope::OneLevel, "(objectClass=*)", vec!["cn"])
        .await
        .expect("search")
        .success()
        .expect("rc");
    assert_eq!(rs.len(), 2);
    pool.release_connection(conn).await;
    assert_eq!(pool.available_connections(), 1);

    let stats = pool.statistics();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.successful_checkouts, 1);
    assert_eq!(stats.releases, 1);
    let binds = server.received(0);
    assert_eq!(binds.len(), 1);
    assert_eq!(binds[0].dn(), ADMIN);
}

#[tokio::test]
async fn debt_and_overflow() {
    let server = MockServer::directory().await;
    let pool = pool(&server, PoolSettings::new().set_max_connections(2)).await;
    let a = pool.get_connection().await.expect("available");
    let b = pool.get_connection().await.expect("from debt");
    assert_eq!(pool.statistics().replacement_debt, 0);
    let c = pool.get_connection().await.expect("created beyond capacity");
    assert_eq!(server.accepted(), 3);
    for conn in [a, b, c] {
        pool.release_connection(conn).await;
    }
    let stats = pool.statistics();
    assert_eq!(stats.available, 2);
    assert_eq!(stats.closed_unneeded, 1);
    assert!(eventually(|| server.received(2).len() == 1).await);
}

#[tokio::test]
async fn bounded_wait() {
    let server = MockServer::directory().await;
    let settings = PoolSettings::new()
        .set_max_connections(1)
        .set_create_if_necessary(false)
        .set_max_wait(Duration::from_millis(200));
    let pool = pool(&server, settings).await;
    let conn = pool.get_connection().await.expect("checkout");
    let id = conn.connection_id();
    assert!(matches!(pool.get_connection().await, Err(LdapError::NoConnectionsAvailable)));
    assert_eq!(pool.statistics().failed_checkouts, 1);

    let releaser = pool.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        releaser.release_connection(conn).await;
    });
    let conn = pool.get_connection().await.expect("released while waiting");
    assert_eq!(conn.connection_id(), id);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn dead_connection_replaced_on_checkout() {
    let server = MockServer::directory().await;
    let pool = pool(&server, PoolSettings::new().set_max_connections(1)).await;
    server.kill_connections();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut conn = pool.get_connection().await.expect("replacement");
    assert!(conn.is_connected());
    conn.search("dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["*"])
        .await
        .expect("search");
    assert_eq!(server.accepted(), 2);
    assert_eq!(server.received(0).len(), 2);
    assert_eq!(pool.statistics().closed_defunct, 1);
}

/// Fails the second checkout check, passes all others.
struct SecondCheckoutFails(AtomicUsize);

#[async_trait]
impl HealthCheck for SecondCheckoutFails {
    async fn ensure_valid_for_checkout(&self, _conn: &mut Ldap) -> Result<()> {
        if self.0.fetch_add(1, Ordering::SeqCst) == 1 {
            return Err(LdapError::InvalidConnection(String::from("second checkout")));
        }
        Ok(())
    }
}

#[tokio::test]
async fn waited_connection_failing_checkout_is_replaced() {
    let server = MockServer::directory().await;
    let settings = PoolSettings::new()
        .set_max_connections(1)
        .set_create_if_necessary(false)
        .set_max_wait(Duration::from_millis(500))
        .set_health_check(SecondCheckoutFails(AtomicUsize::new(0)));
    let pool = pool(&server, settings).await;
    let conn = pool.get_connection().await.expect("checkout");
    let id = conn.connection_id();

    let releaser = pool.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        releaser.release_connection(conn).await;
    });
    let conn = pool.get_connection().await.expect("replacement");
    assert_ne!(conn.connection_id(), id);
    assert!(conn.is_connected());
    let stats = pool.statistics();
    assert_eq!(stats.closed_defunct, 1);
    assert_eq!(stats.available, 0);
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn dropped_connection_is_not_counted_as_debt() {
    let server = MockServer::directory().await;
    let pool = pool(&server, PoolSettings::new().set_max_connections(1)).await;
    let conn = pool.get_connection().await.expect("checkout");
    drop(conn);
    let stats = pool.statistics();
    assert_eq!(stats.available, 0);
    assert_eq!(stats.replacement_debt, 0);

    let conn = pool.get_connection().await.expect("created on demand");
    assert_eq!(server.accepted(), 2);
    pool.release_connection(conn).await;
    assert_eq!(pool.available_connections(), 1);
}

#[tokio::test]
async fn release_after_error() {
    let server = MockServer::directory().await;
    let pool = pool(&server, PoolSettings::new().set_max_connections(1)).await;

    let mut conn = pool.get_connection().await.expect("checkout");
    let id = conn.connection_id();
    let err = conn
        .simple_bind("cn=someone", "wrong")
        .await
        .expect("bind")
        .success()
        .expect_err("invalid credentials");
    pool.release_connection_after_error(conn, &err).await;
    let conn = pool.get_connection().await.expect("checkout");
    assert_eq!(conn.connection_id(), id);

    server.kill_connections();
    assert!(eventually(|| !conn.is_connected()).await);
    let mut conn = conn;
    let err = conn
        .search("dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["*"])
        .await
        .expect_err("connection is down");
    pool.release_connection_after_error(conn, &err).await;
    let stats = pool.statistics();
    assert_eq!(stats.closed_defunct, 1);
    assert_eq!(stats.available, 1);
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn replacement_debt_is_paid_later() {
    let server = MockServer::directory().await;
    let pool = pool(&server, PoolSettings::new().set_max_connections(1)).await;
    let conn = pool.get_connection().await.expect("checkout");

    server.set_refusing(true);
    pool.release_defunct_connection(conn).await;
    let stats = pool.statistics();
    assert_eq!(stats.replacement_debt, 1);
    assert_eq!(stats.failed_connects, 1);
    assert_eq!(stats.available, 0);
    let res = tokio::time::timeout(Duration::from_secs(2), pool.get_connection())
        .await
        .expect("no hang");
    assert!(res.expect_err("refused").is_connection_level());
    assert_eq!(pool.statistics().replacement_debt, 1);

    server.set_refusing(false);
    let conn = pool.get_connection().await.expect("checkout");
    assert!(conn.is_connected());
    assert_eq!(pool.statistics().replacement_debt, 0);
}

#[tokio::test]
async fn replace_defunct_hands_out_new_connection() {
    let server = MockServer::directory().await;
    let pool = pool(&server, PoolSettings::new().set_max_connections(1)).await;
    let conn = pool.get_connection().await.expect("checkout");
    let id = conn.connection_id();
    let conn = pool.replace_defunct_connection(conn).await.expect("replacement");
    assert_ne!(conn.connection_id(), id);
    assert!(conn.is_connected());
    assert_eq!(pool.statistics().closed_defunct, 1);
}

#[tokio::test]
async fn expired_connection_replaced_on_release() {
    let server = MockServer::directory().await;
    let settings = PoolSettings::new()
        .set_max_connections(1)
        .set_max_connection_age(Duration::from_millis(100));
    let pool = pool(&server, settings).await;
    let conn = pool.get_connection().await.expect("checkout");
    let id = conn.connection_id();
    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.release_connection(conn).await;
    let stats = pool.statistics();
    assert_eq!(stats.closed_expired, 1);
    assert_eq!(stats.available, 1);
    let conn = pool.get_connection().await.expect("checkout");
    assert_ne!(conn.connection_id(), id);
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn expiry_replacements_are_throttled() {
    let server = MockServer::directory().await;
    let settings = PoolSettings::new()
        .set_max_connections(2)
        .set_max_connection_age(Duration::from_millis(100))
        .set_min_disconnect_interval(Duration::from_secs(10));
    let pool = pool(&server, settings).await;
    let a = pool.get_connection().await.expect("available");
    let b = pool.get_connection().await.expect("from debt");
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (a_id, b_id) = (a.connection_id(), b.connection_id());
    pool.release_connection(a).await;
    pool.release_connection(b).await;
    let stats = pool.statistics();
    assert_eq!(stats.closed_expired, 1);
    assert_eq!(stats.available, 2);
    assert_eq!(server.accepted(), 3);

    let mut ids = vec![];
    for _ in 0..2 {
        ids.push(pool.get_connection().await.expect("checkout").connection_id());
    }
    assert!(!ids.contains(&a_id));
    assert!(ids.contains(&b_id));
}

#[tokio::test]
async fn close_is_final() {
    let server = MockServer::directory().await;
    let settings = PoolSettings::new()
        .set_max_connections(2)
        .set_initial_connections(2)
        .set_initial_connect_threads(2);
    let pool = pool(&server, settings).await;
    assert_eq!(pool.available_connections(), 2);
    let conn = pool.get_connection().await.expect("checkout");

    pool.close(true, 2).await;
    assert_eq!(pool.state(), PoolState::Closed);
    assert!(pool.is_closed());
    assert!(eventually(|| server.received(2).len() == 1).await);
    assert!(matches!(pool.get_connection().await, Err(LdapError::PoolClosed)));

    pool.release_connection(conn).await;
    assert!(eventually(|| server.received(2).len() == 2).await);
    assert_eq!(pool.available_connections(), 0);
    pool.close(true, 2).await;
    assert_eq!(server.received(2).len(), 2);
}

#[tokio::test]
async fn initial_connect_failure() {
    let server = MockServer::directory().await;
    server.set_refusing(true);
    let res = LdapConnectionPool::new(SingleServerSet::new(&server.url()), admin(), PoolSettings::new()).await;
    assert!(res.is_err());

    let settings = PoolSettings::new()
        .set_max_connections(3)
        .set_throw_on_connect_failure(false);
    let pool = pool(&server, settings).await;
    let stats = pool.statistics();
    assert_eq!(stats.available, 0);
    assert_eq!(stats.replacement_debt, 3);
}

#[tokio::test]
async fn bind_and_revert() {
    let server = MockServer::directory().await;
    let pool = pool(&server, PoolSettings::new().set_max_connections(1)).await;
    let res = pool
        .bind_and_revert_authentication(BindRequest::simple("cn=user,dc=example,dc=org", "pw"))
        .await
        .expect("bind");
    assert_eq!(res.rc, rc::SUCCESS);
    let dns: Vec<String> = server.received(0).iter().map(|r| r.dn()).collect();
    assert_eq!(dns, vec![ADMIN, "cn=user,dc=example,dc=org", ADMIN]);
    assert_eq!(pool.available_connections(), 1);

    let (res, authzid) = pool
        .bind_and_revert_authentication_with(BindRequest::simple("cn=user,dc=example,dc=org", "pw"), |mut conn| async move {
            let (exop, _) = conn.extended(WhoAmI).await?.success()?;
            Ok::<_, LdapError>(exop.parse::<WhoAmIResp>()?.authzid)
        })
        .await
        .expect("bind");
    assert_eq!(res.rc, rc::SUCCESS);
    assert_eq!(authzid.as_deref(), Some("dn:cn=test"));

    let (res, ran) = pool
        .bind_and_revert_authentication_with(BindRequest::simple("cn=user,dc=example,dc=org", "wrong"), |_| async {
            Ok::<_, LdapError>(())
        })
        .await
        .expect("bind");
    assert_eq!(res.rc, rc::INVALID_CREDENTIALS);
    assert!(ran.is_none());
    assert_eq!(server.received(0).len(), 7);
    assert_eq!(pool.available_connections(), 1);
}

#[tokio::test]
async fn periodic_health_check() {
    let server = MockServer::directory().await;
    let settings = PoolSettings::new()
        .set_max_connections(1)
        .set_health_check_interval(Duration::from_millis(100))
        .set_health_check(WhoAmIHealthCheck::new());
    let pool = pool(&server, settings).await;
    assert_eq!(server.received(23).len(), 1);
    assert!(eventually(|| server.received(23).len() >= 3).await);

    server.kill_connections();
    assert!(eventually(|| server.accepted() == 2 && pool.available_connections() == 1).await);
    assert_eq!(pool.statistics().closed_defunct, 1);
    pool.close(false, 1).await;
}

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{
    Action, MockServer, Received, directory, done, encode, eventually, extended_response, octets,
    referral,
};
use ldapconn::exop::{WhoAmI, WhoAmIResp};
use ldapconn::result::{ExopResult, rc};
use ldapconn::{
    DisconnectInfo, DisconnectType, Ldap, LdapConnSettings, LdapError, LdapResult, Mod, Request,
    ResponseListener, ResultEntry, Scope, SearchEntry, StreamState,
};

const BASE: &str = "dc=example,dc=org";

/// Directory which never answers searches under `ou=silent`, answers those under
/// `ou=slow` late, and drops the connection for `ou=drop`.
fn moody(req: &Received) -> Vec<Action> {
    if req.op_id() != 3 {
        return directory(req);
    }
    let base = req.dn();
    if base.starts_with("ou=silent") {
        vec![]
    } else if base.starts_with("ou=slow") {
        vec![Action::Delay(Duration::from_millis(300)), Action::Reply(done(3, 0))]
    } else if base.starts_with("ou=drop") {
        vec![Action::Close]
    } else if base.starts_with("ou=notice") {
        vec![common::notice_of_disconnection(), Action::Close]
    } else if base.starts_with("ou=garbage") {
        vec![Action::Raw(encode(req.id, octets("junk")))]
    } else {
        directory(req)
    }
}

async fn whoami(ldap: &mut Ldap) -> String {
    let (exop, _res) = ldap.extended(WhoAmI).await.expect("whoami").success().expect("rc");
    let resp: WhoAmIResp = exop.parse().expect("parsed");
    resp.authzid
}

#[tokio::test]
async fn bind_and_search() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    ldap.simple_bind("cn=admin,dc=example,dc=org", "secret")
        .await
        .expect("bind")
        .success()
        .expect("rc");
    let (rs, res) = ldap
        .search(BASE, Scope::Subtree, "(objectClass=*)", vec!["cn", "sn"])
        .await
        .expect("search")
        .success()
        .expect("rc");
    assert_eq!(res.rc, rc::SUCCESS);
    assert_eq!(rs.len(), 2);
    let first = SearchEntry::construct(rs[0].clone()).expect("entry");
    assert_eq!(first.dn, "cn=a,dc=example,dc=org");
    assert_eq!(first.attrs["sn"], vec!["Alpha"]);
    let binds = server.received(0);
    assert_eq!(binds.len(), 1);
    assert_eq!(binds[0].dn(), "cn=admin,dc=example,dc=org");
    assert_eq!(binds[0].password().as_deref(), Some("secret"));
    assert_eq!(server.received(3)[0].dn(), BASE);
}

#[tokio::test]
async fn failed_bind_is_a_result() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let res = ldap.simple_bind("cn=admin", "wrong").await.expect("bind");
    assert_eq!(res.rc, rc::INVALID_CREDENTIALS);
    assert!(matches!(res.success(), Err(LdapError::LdapResult { .. })));
    assert!(ldap.is_connected());
}

#[tokio::test]
async fn write_operations() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let dn = "cn=new,dc=example,dc=org";
    ldap.add(
        dn,
        vec![
            ("objectClass", HashSet::from(["person"])),
            ("sn", HashSet::from(["New"])),
        ],
    )
    .await
    .expect("add")
    .success()
    .expect("rc");
    ldap.modify(dn, vec![Mod::Replace("sn", HashSet::from(["Newer"]))])
        .await
        .expect("modify")
        .success()
        .expect("rc");
    ldap.modifydn(dn, "cn=renamed", true, None)
        .await
        .expect("modifydn")
        .success()
        .expect("rc");
    ldap.delete("cn=renamed,dc=example,dc=org")
        .await
        .expect("delete")
        .success()
        .expect("rc");
    assert!(ldap.compare(dn, "sn", "Newer").await.expect("compare").equal().expect("rc"));
    for (op, target) in [(8, dn), (6, dn), (12, dn), (10, "cn=renamed,dc=example,dc=org"), (14, dn)] {
        let seen = server.received(op);
        assert_eq!(seen.len(), 1, "op {}", op);
        assert_eq!(seen[0].dn(), target);
    }
}

#[tokio::test]
async fn empty_add_is_rejected_locally() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let res = ldap
        .add("cn=x,dc=example,dc=org", vec![("sn", HashSet::<&str>::new())])
        .await;
    assert!(matches!(res, Err(LdapError::AddNoValues)));
    assert!(whoami(&mut ldap).await.starts_with("dn:"));
    assert!(server.received(8).is_empty());
}

#[tokio::test]
async fn responses_out_of_order() {
    let server = MockServer::start(moody).await;
    let ldap = Ldap::connect(&server.url()).await.expect("connected");
    let order = Arc::new(Mutex::new(vec![]));
    let (mut slow, mut fast) = (ldap.clone(), ldap.clone());
    let (slow_order, fast_order) = (order.clone(), order.clone());
    let (slow_res, fast_res) = tokio::join!(
        async move {
            let res = slow
                .search("ou=slow,dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["*"])
                .await;
            slow_order.lock().unwrap().push("slow");
            res
        },
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let res = whoami(&mut fast).await;
            fast_order.lock().unwrap().push("fast");
            res
        },
    );
    let (rs, _) = slow_res.expect("slow search").success().expect("rc");
    assert!(rs.is_empty());
    assert_eq!(fast_res, "dn:cn=test");
    assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
    assert_eq!(ldap.outstanding_requests(), 0);
}

#[tokio::test]
async fn timeout_leaves_connection_usable() {
    let server = MockServer::start(moody).await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let res = ldap
        .with_timeout(Duration::from_millis(100))
        .search("ou=silent,dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["*"])
        .await;
    assert!(matches!(res, Err(LdapError::Timeout(_))));
    assert_eq!(ldap.outstanding_requests(), 0);
    assert!(ldap.is_connected());
    assert_eq!(whoami(&mut ldap).await, "dn:cn=test");
    assert!(server.received(16).is_empty());
}

#[tokio::test]
async fn timeout_abandons_when_asked() {
    let server = MockServer::start(moody).await;
    let settings = LdapConnSettings::new().set_abandon_on_timeout(true);
    let mut ldap = Ldap::connect_with_settings(settings, &server.url())
        .await
        .expect("connected");
    let res = ldap
        .with_timeout(Duration::from_millis(100))
        .search("ou=silent,dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["*"])
        .await;
    assert!(matches!(res, Err(LdapError::Timeout(_))));
    let timed_out = ldap.last_id();
    assert!(eventually(|| !server.received(16).is_empty()).await);
    assert_eq!(server.received(16)[0].abandon_target(), Some(timed_out));
}

#[tokio::test]
async fn modifiers_apply_once() {
    let server = MockServer::start(moody).await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    ldap.with_timeout(Duration::from_millis(100));
    assert_eq!(whoami(&mut ldap).await, "dn:cn=test");
    // The timeout was used up by the previous operation.
    let res = tokio::time::timeout(
        Duration::from_millis(300),
        ldap.search("ou=silent,dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["*"]),
    )
    .await;
    assert!(res.is_err());
}

#[tokio::test]
async fn server_close_fails_outstanding() {
    let server = MockServer::start(moody).await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let res = ldap
        .search("ou=drop,dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["*"])
        .await;
    match res {
        Err(LdapError::ServerDown(info)) => assert_eq!(info.kind, DisconnectType::ServerClosedWithoutNotice),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(!ldap.is_connected());
    assert_eq!(
        ldap.disconnect_info().map(|info| info.kind),
        Some(DisconnectType::ServerClosedWithoutNotice)
    );
    let res = ldap.delete("cn=a,dc=example,dc=org").await;
    assert!(res.expect_err("closed").is_connection_level());
}

#[tokio::test]
async fn notice_of_disconnection() {
    let server = MockServer::start(moody).await;
    let notices = Arc::new(Mutex::new(vec![]));
    let disconnects = Arc::new(Mutex::new(vec![]));
    let (notices_seen, disconnects_seen) = (notices.clone(), disconnects.clone());
    let settings = LdapConnSettings::new()
        .set_unsolicited_handler(move |_host: &str, _port: u16, notice: &ExopResult| {
            notices_seen.lock().unwrap().push(notice.1.rc);
        })
        .set_disconnect_handler(move |_host: &str, _port: u16, info: &DisconnectInfo| {
            disconnects_seen.lock().unwrap().push(info.kind);
        });
    let mut ldap = Ldap::connect_with_settings(settings, &server.url())
        .await
        .expect("connected");
    let res = ldap
        .search("ou=notice,dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["*"])
        .await;
    match res {
        Err(LdapError::ServerDown(info)) => assert_eq!(info.kind, DisconnectType::ServerClosedWithNotice),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(eventually(|| !notices.lock().unwrap().is_empty()).await);
    assert_eq!(*notices.lock().unwrap(), vec![rc::UNAVAILABLE]);
    assert_eq!(*disconnects.lock().unwrap(), vec![DisconnectType::ServerClosedWithNotice]);
}

#[tokio::test]
async fn malformed_response_fails_only_its_operation() {
    let server = MockServer::start(moody).await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let res = ldap
        .search("ou=garbage,dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["*"])
        .await;
    assert!(matches!(res, Err(LdapError::Decoding(_))));
    assert!(ldap.is_connected());
    assert_eq!(whoami(&mut ldap).await, "dn:cn=test");
}

#[tokio::test]
async fn unbind_closes() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let other = ldap.clone();
    ldap.unbind().await.expect("unbind");
    assert!(!ldap.is_connected());
    assert!(!other.is_connected());
    assert_eq!(
        ldap.disconnect_info().map(|info| info.kind),
        Some(DisconnectType::Unbind)
    );
    assert!(eventually(|| server.received(2).len() == 1).await);
    let res = ldap.delete("cn=a,dc=example,dc=org").await;
    assert!(matches!(res, Err(LdapError::NotEstablished)));
    ldap.close().await;
    assert_eq!(server.received(2).len(), 1);
}

#[tokio::test]
async fn reconnect_rebinds_and_retries() {
    let server = MockServer::directory().await;
    let settings = LdapConnSettings::new().set_auto_reconnect(true);
    let mut ldap = Ldap::connect_with_settings(settings, &server.url())
        .await
        .expect("connected");
    let id = ldap.connection_id();
    ldap.simple_bind("cn=admin,dc=example,dc=org", "secret")
        .await
        .expect("bind")
        .success()
        .expect("rc");
    server.kill_connections();
    assert!(eventually(|| !ldap.is_connected()).await);
    let (rs, _) = ldap
        .search(BASE, Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .expect("retried search")
        .success()
        .expect("rc");
    assert_eq!(rs.len(), 2);
    assert!(ldap.is_connected());
    assert_eq!(ldap.connection_id(), id);
    assert_eq!(server.accepted(), 2);
    let binds = server.received(0);
    assert_eq!(binds.len(), 2);
    assert_eq!(binds[1].conn, 2);
    assert_eq!(binds[1].dn(), "cn=admin,dc=example,dc=org");
    let searches = server.received(3);
    assert_eq!(searches.len(), 1);
    assert_eq!(searches[0].conn, 2);
}

#[tokio::test]
async fn no_reconnect_by_default() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    assert_eq!(whoami(&mut ldap).await, "dn:cn=test");
    server.kill_connections();
    assert!(eventually(|| !ldap.is_connected()).await);
    let res = ldap.search(BASE, Scope::Base, "(objectClass=*)", vec!["*"]).await;
    assert!(res.expect_err("down").is_connection_level());
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn referral_is_followed() {
    let target = MockServer::directory().await;
    let moved = format!("{}/ou=moved,dc=example,dc=org", target.url());
    let origin = MockServer::start(move |req: &Received| match req.op_id() {
        3 => vec![Action::Reply(referral(3, &[moved.as_str()]))],
        _ => directory(req),
    })
    .await;
    let settings = LdapConnSettings::new().set_follow_referrals(true);
    let mut ldap = Ldap::connect_with_settings(settings, &origin.url())
        .await
        .expect("connected");
    ldap.simple_bind("cn=admin,dc=example,dc=org", "secret")
        .await
        .expect("bind")
        .success()
        .expect("rc");
    let (rs, _) = ldap
        .search(BASE, Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .expect("search")
        .success()
        .expect("rc");
    let dns: Vec<String> = rs
        .into_iter()
        .map(|e| SearchEntry::construct(e).expect("entry").dn)
        .collect();
    assert_eq!(dns, vec!["cn=a,ou=moved,dc=example,dc=org", "cn=b,ou=moved,dc=example,dc=org"]);
    let binds = target.received(0);
    assert_eq!(binds.len(), 1);
    assert_eq!(binds[0].dn(), "cn=admin,dc=example,dc=org");

    let res = ldap
        .with_follow_referrals(false)
        .search(BASE, Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .expect("search");
    assert_eq!(res.1.rc, rc::REFERRAL);
    assert_eq!(res.1.refs.len(), 1);
    assert_eq!(target.received(3).len(), 1);
}

#[tokio::test]
async fn referral_loop_hits_hop_limit() {
    let url = Arc::new(Mutex::new(String::new()));
    let own_url = url.clone();
    let server = MockServer::start(move |req: &Received| match req.op_id() {
        3 => {
            let own = own_url.lock().unwrap().clone();
            vec![Action::Reply(referral(3, &[own.as_str()]))]
        }
        _ => directory(req),
    })
    .await;
    *url.lock().unwrap() = format!("{}/dc=example,dc=org", server.url());
    let settings = LdapConnSettings::new()
        .set_follow_referrals(true)
        .set_referral_hop_limit(2);
    let mut ldap = Ldap::connect_with_settings(settings, &server.url())
        .await
        .expect("connected");
    let res = ldap.search(BASE, Scope::Base, "(objectClass=*)", vec!["*"]).await;
    assert!(matches!(res, Err(LdapError::ReferralLimitExceeded(2))));
    assert_eq!(server.received(3).len(), 3);
}

#[tokio::test]
async fn async_handle_delivers_result() {
    let server = MockServer::start(moody).await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let handle = ldap
        .send_async(Request::compare("cn=a,dc=example,dc=org", "sn", "Alpha"))
        .await
        .expect("sent");
    assert!(handle.msgid() > 0);
    let res: LdapResult = handle.await.expect("outcome");
    assert_eq!(res.rc, rc::COMPARE_TRUE);

    let mut handle = ldap
        .send_async(Request::search(
            "ou=slow,dc=example,dc=org",
            Scope::Base,
            "(objectClass=*)",
            &["*"],
        ))
        .await
        .expect("sent");
    assert!(handle.get(Duration::from_millis(50)).await.is_none());
    let res = handle.get(Duration::from_secs(2)).await.expect("done").expect("outcome");
    assert_eq!(res.rc, rc::SUCCESS);
    assert!(handle.is_done());
}

#[tokio::test]
async fn async_handle_cancel_and_timeout() {
    let server = MockServer::start(moody).await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let silent = || Request::search("ou=silent,dc=example,dc=org", Scope::Base, "(objectClass=*)", &["*"]);

    let handle = ldap.send_async(silent()).await.expect("sent");
    let id = handle.msgid();
    handle.cancel().await;
    let res = handle.await.expect("outcome");
    assert_eq!(res.rc, rc::CANCELED);
    assert!(eventually(|| server.received(16).iter().any(|r| r.abandon_target() == Some(id))).await);

    let handle = ldap
        .with_timeout(Duration::from_millis(100))
        .send_async(silent())
        .await
        .expect("sent");
    let res = handle.await.expect("outcome");
    assert_eq!(res.rc, rc::TIMEOUT);
    assert_eq!(ldap.outstanding_requests(), 0);
}

#[tokio::test]
async fn async_handle_rejections() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    assert!(matches!(
        ldap.send_async(Request::Bind(ldapconn::BindRequest::anonymous())).await,
        Err(LdapError::Local(_))
    ));
    assert!(matches!(ldap.send_async(Request::Unbind).await, Err(LdapError::Local(_))));

    let settings = LdapConnSettings::new().set_synchronous_mode(true);
    let mut sync = Ldap::connect_with_settings(settings, &server.url())
        .await
        .expect("connected");
    assert!(matches!(
        sync.send_async(Request::delete("cn=a,dc=example,dc=org")).await,
        Err(LdapError::AsyncNotSupported)
    ));
}

#[tokio::test]
async fn synchronous_mode_operations() {
    let server = MockServer::start(moody).await;
    let settings = LdapConnSettings::new().set_synchronous_mode(true);
    let mut ldap = Ldap::connect_with_settings(settings, &server.url())
        .await
        .expect("connected");
    assert!(ldap.is_synchronous());
    ldap.simple_bind("cn=admin,dc=example,dc=org", "secret")
        .await
        .expect("bind")
        .success()
        .expect("rc");
    let (mut a, mut b) = (ldap.clone(), ldap.clone());
    let (slow, fast) = tokio::join!(
        a.search("ou=slow,dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["*"]),
        b.search(BASE, Scope::Subtree, "(objectClass=*)", vec!["*"]),
    );
    assert_eq!(slow.expect("slow").success().expect("rc").0.len(), 0);
    assert_eq!(fast.expect("fast").success().expect("rc").0.len(), 2);
    assert_eq!(whoami(&mut ldap).await, "dn:cn=test");
    let res = ldap
        .with_timeout(Duration::from_millis(100))
        .search("ou=silent,dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["*"])
        .await;
    assert!(matches!(res, Err(LdapError::Timeout(_))));
    ldap.unbind().await.expect("unbind");
    assert!(!ldap.is_connected());
}

#[tokio::test]
async fn streaming_search_yields_entries() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let mut stream = ldap
        .streaming_search(BASE, Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .expect("stream");
    assert_eq!(stream.msgid(), Some(ldap.last_id()));
    let mut dns = vec![];
    while let Some(entry) = stream.next().await.expect("entry") {
        dns.push(SearchEntry::construct(entry).expect("parsed").dn);
    }
    assert_eq!(stream.state(), StreamState::Done);
    assert_eq!(dns.len(), 2);
    let res = stream.finish().await;
    assert_eq!(res.rc, rc::SUCCESS);
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(stream.finish().await.rc, rc::OTHER);
    assert_eq!(stream.msgid(), None);
}

#[tokio::test]
async fn early_finish_reports_cancel() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let mut stream = ldap
        .streaming_search(BASE, Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .expect("stream");
    assert!(stream.next().await.expect("entry").is_some());
    assert_eq!(stream.finish().await.rc, rc::USER_CANCELED);
    assert_eq!(whoami(&mut ldap).await, "dn:cn=test");
}

#[derive(Default)]
struct Tally {
    entries: AtomicUsize,
    results: AtomicUsize,
}

struct Counting(Arc<Tally>);

impl ResponseListener for Counting {
    fn entry_returned(&self, _msgid: i32, _entry: &ResultEntry) {
        self.0.entries.fetch_add(1, Ordering::SeqCst);
    }

    fn result_received(&self, _msgid: i32, _result: &LdapResult) {
        self.0.results.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn listener_sees_each_response() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let tally = Arc::new(Tally::default());
    ldap.with_intermediate_listener(Counting(tally.clone()))
        .search(BASE, Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .expect("search");
    assert_eq!(tally.entries.load(Ordering::SeqCst), 2);
    assert_eq!(tally.results.load(Ordering::SeqCst), 1);
    ldap.search(BASE, Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .expect("search");
    assert_eq!(tally.entries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn async_listener_sees_entries() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    let tally = Arc::new(Tally::default());
    let handle = ldap
        .send_async_with_listener(
            Request::search(BASE, Scope::Subtree, "(objectClass=*)", &["cn"]),
            Counting(tally.clone()),
        )
        .await
        .expect("sent");
    assert_eq!(handle.await.expect("outcome").rc, rc::SUCCESS);
    assert_eq!(tally.entries.load(Ordering::SeqCst), 2);
    assert_eq!(tally.results.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sasl_external() {
    let server = MockServer::directory().await;
    let mut ldap = Ldap::connect(&server.url()).await.expect("connected");
    ldap.sasl_external_bind()
        .await
        .expect("bind")
        .success()
        .expect("rc");
    let binds = server.received(0);
    assert_eq!(binds[0].sasl_mechanism().as_deref(), Some("EXTERNAL"));
}

#[cfg(feature = "tls")]
#[tokio::test]
async fn refused_starttls_closes_connection() {
    let server = MockServer::start(|req: &Received| {
        match (req.op_id(), req.exop_name().as_deref()) {
            (23, Some("1.3.6.1.4.1.1466.20037")) => {
                vec![Action::Reply(extended_response(rc::UNAVAILABLE, None, None))]
            }
            _ => directory(req),
        }
    })
    .await;
    for sync in [false, true] {
        let settings = LdapConnSettings::new().set_synchronous_mode(sync);
        let mut ldap = Ldap::connect_with_settings(settings, &server.url())
            .await
            .expect("connected");
        assert_eq!(whoami(&mut ldap).await, "dn:cn=test");
        match ldap.start_tls().await {
            Err(LdapError::LdapResult { result }) => assert_eq!(result.rc, rc::UNAVAILABLE),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!ldap.is_connected());
        assert!(ldap.disconnect_info().is_some());
        let res = ldap.search(BASE, Scope::Base, "(objectClass=*)", vec!["*"]).await;
        assert!(res.expect_err("closed").is_connection_level());
    }
    assert_eq!(server.received(23).len(), 4);
}

#[cfg(feature = "sync")]
#[test]
fn blocking_connection() {
    use ldapconn::LdapConn;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("runtime");
    let server = rt.block_on(MockServer::directory());
    let mut ldap = LdapConn::new(&server.url()).expect("connected");
    ldap.simple_bind("cn=admin,dc=example,dc=org", "secret")
        .expect("bind")
        .success()
        .expect("rc");
    let (rs, _) = ldap
        .search(BASE, Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .expect("search")
        .success()
        .expect("rc");
    assert_eq!(rs.len(), 2);
    let mut stream = ldap
        .streaming_search(BASE, Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .expect("stream");
    let mut count = 0;
    while stream.next().expect("entry").is_some() {
        count += 1;
    }
    assert_eq!(count, 2);
    assert_eq!(stream.result().rc, rc::SUCCESS);
    assert!(ldap.compare("cn=a,dc=example,dc=org", "sn", "Alpha").expect("compare").equal().expect("rc"));
    ldap.unbind().expect("unbind");
    assert!(!ldap.is_connected());
}

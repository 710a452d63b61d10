#![allow(dead_code)]

//! In-process LDAP server for the integration tests.
//!
//! Every received request is logged and passed to a handler, which answers with a
//! list of actions. The actions for one request run in their own task, so a delayed
//! answer doesn't hold up the answers to other requests on the same connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structure::{PL, StructureTag};
use lber::structures::{ASNTag, Enumerated, Integer, OctetString, Sequence, Set, Tag};
use lber::write;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
pub const NOTICE_OID: &str = "1.3.6.1.4.1.1466.20036";

/// A request as seen by the server.
#[derive(Clone, Debug)]
pub struct Received {
    pub conn: usize,
    pub id: i32,
    pub op: StructureTag,
    pub has_controls: bool,
}

fn text(t: &StructureTag) -> Option<String> {
    match t.payload {
        PL::P(ref v) => Some(String::from_utf8_lossy(v).into_owned()),
        PL::C(_) => None,
    }
}

impl Received {
    fn from_tag(conn: usize, tag: StructureTag) -> Option<Received> {
        let mut parts = tag.expect_constructed()?.into_iter();
        let id = parts.next()?.expect_primitive()?;
        let (_, id) = parse_uint(id.as_slice()).ok()?;
        let op = parts.next()?;
        Some(Received {
            conn,
            id: id as i32,
            op,
            has_controls: parts.next().is_some(),
        })
    }

    pub fn op_id(&self) -> u64 {
        self.op.id
    }

    fn part(&self, idx: usize) -> Option<&StructureTag> {
        match self.op.payload {
            PL::C(ref inner) => inner.get(idx),
            PL::P(_) => None,
        }
    }

    /// Target DN of the request, or the bind DN.
    pub fn dn(&self) -> String {
        let dn = match self.op.id {
            0 => self.part(1).and_then(text),
            10 => text(&self.op),
            2 | 16 => None,
            _ => self.part(0).and_then(text),
        };
        dn.unwrap_or_default()
    }

    /// Password of a simple bind.
    pub fn password(&self) -> Option<String> {
        match self.part(2) {
            Some(t) if t.id == 0 && t.class == TagClass::Context => text(t),
            _ => None,
        }
    }

    /// Mechanism of a SASL bind.
    pub fn sasl_mechanism(&self) -> Option<String> {
        match self.part(2) {
            Some(t) if t.id == 3 && t.class == TagClass::Context => match t.payload {
                PL::C(ref inner) => inner.first().and_then(text),
                PL::P(_) => None,
            },
            _ => None,
        }
    }

    /// Name of an extended request.
    pub fn exop_name(&self) -> Option<String> {
        self.part(0).and_then(text)
    }

    /// Message ID named by an Abandon request.
    pub fn abandon_target(&self) -> Option<i32> {
        match self.op.payload {
            PL::P(ref v) if self.op.id == 16 => parse_uint(v.as_slice()).ok().map(|(_, id)| id as i32),
            _ => None,
        }
    }
}

/// What the server does in response to a request.
pub enum Action {
    /// Send a message with the request's ID.
    Reply(Tag),
    /// Send a message with an explicit ID.
    ReplyAs(i32, Tag),
    Raw(Vec<u8>),
    Delay(Duration),
    Close,
}

pub type Handler = Arc<dyn Fn(&Received) -> Vec<Action> + Send + Sync>;

struct State {
    handler: Handler,
    log: Mutex<Vec<Received>>,
    accepted: AtomicUsize,
    refusing: AtomicBool,
    kill: Mutex<CancellationToken>,
}

pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<State>,
    stop: CancellationToken,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> MockServer
    where
        F: Fn(&Received) -> Vec<Action> + Send + Sync + 'static,
    {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(State {
            handler: Arc::new(handler),
            log: Mutex::new(vec![]),
            accepted: AtomicUsize::new(0),
            refusing: AtomicBool::new(false),
            kill: Mutex::new(CancellationToken::new()),
        });
        let stop = CancellationToken::new();
        tokio::spawn(accept_loop(listener, state.clone(), stop.clone()));
        MockServer { addr, state, stop }
    }

    pub async fn directory() -> MockServer {
        MockServer::start(directory).await
    }

    pub fn url(&self) -> String {
        format!("ldap://{}", self.addr)
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<Received> {
        self.state.log.lock().expect("log").clone()
    }

    /// Requests with the given protocol op.
    pub fn received(&self, op_id: u64) -> Vec<Received> {
        self.log().into_iter().filter(|r| r.op_id() == op_id).collect()
    }

    /// Drop every open connection.
    pub fn kill_connections(&self) {
        let mut kill = self.state.kill.lock().expect("kill");
        kill.cancel();
        *kill = CancellationToken::new();
    }

    /// When set, new connections are accepted and immediately closed.
    pub fn set_refusing(&self, refusing: bool) {
        self.state.refusing.store(refusing, Ordering::SeqCst);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.cancel();
        self.state.kill.lock().expect("kill").cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<State>, stop: CancellationToken) {
    let mut conn_no = 0;
    loop {
        let sock = tokio::select! {
            _ = stop.cancelled() => return,
            res = listener.accept() => match res {
                Ok((sock, _)) => sock,
                Err(_) => return,
            },
        };
        if state.refusing.load(Ordering::SeqCst) {
            drop(sock);
            continue;
        }
        conn_no += 1;
        state.accepted.fetch_add(1, Ordering::SeqCst);
        let kill = state.kill.lock().expect("kill").child_token();
        tokio::spawn(serve(sock, conn_no, state.clone(), kill));
    }
}

type Writer = Arc<AsyncMutex<Option<OwnedWriteHalf>>>;

async fn serve(sock: TcpStream, conn_no: usize, state: Arc<State>, kill: CancellationToken) {
    let (mut rd, wr) = sock.into_split();
    let wr: Writer = Arc::new(AsyncMutex::new(Some(wr)));
    let mut buf = BytesMut::with_capacity(4096);
    'read: loop {
        let n = tokio::select! {
            _ = kill.cancelled() => break,
            n = rd.read_buf(&mut buf) => n,
        };
        match n {
            Ok(0) | Err(_) => break,
            Ok(_) => (),
        }
        loop {
            let (consumed, tag) = match parse_tag(&buf[..]) {
                Ok((rest, tag)) => (buf.len() - rest.len(), tag),
                Err(e) if e.is_incomplete() => break,
                Err(_) => break 'read,
            };
            buf.advance(consumed);
            let req = match Received::from_tag(conn_no, tag) {
                Some(req) => req,
                None => continue,
            };
            state.log.lock().expect("log").push(req.clone());
            let actions = (state.handler)(&req);
            tokio::spawn(run_actions(req.id, actions, wr.clone(), kill.clone()));
        }
    }
    let mut wr = wr.lock().await;
    if let Some(mut w) = wr.take() {
        let _ = w.shutdown().await;
    }
}

async fn run_actions(id: i32, actions: Vec<Action>, wr: Writer, kill: CancellationToken) {
    for action in actions {
        let bytes = match action {
            Action::Reply(op) => encode(id, op),
            Action::ReplyAs(id, op) => encode(id, op),
            Action::Raw(bytes) => bytes,
            Action::Delay(d) => {
                tokio::time::sleep(d).await;
                continue;
            }
            Action::Close => {
                kill.cancel();
                let mut wr = wr.lock().await;
                if let Some(mut w) = wr.take() {
                    let _ = w.shutdown().await;
                }
                return;
            }
        };
        let mut wr = wr.lock().await;
        match wr.as_mut() {
            Some(w) => {
                if w.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            None => return,
        }
    }
}

pub fn encode(id: i32, op: Tag) -> Vec<u8> {
    let msg = Tag::Sequence(Sequence {
        inner: vec![
            Tag::Integer(Integer {
                inner: id as i64,
                ..Default::default()
            }),
            op,
        ],
        ..Default::default()
    })
    .into_structure();
    let mut buf = BytesMut::new();
    write::encode_into(&mut buf, msg).expect("encoded");
    buf.to_vec()
}

pub fn octets<B: AsRef<[u8]>>(b: B) -> Tag {
    Tag::OctetString(OctetString {
        inner: b.as_ref().to_vec(),
        ..Default::default()
    })
}

fn context_octets<B: AsRef<[u8]>>(id: u64, b: B) -> Tag {
    Tag::OctetString(OctetString {
        id,
        class: TagClass::Context,
        inner: b.as_ref().to_vec(),
    })
}

pub fn op(app: u64, inner: Vec<Tag>) -> Tag {
    Tag::Sequence(Sequence {
        id: app,
        class: TagClass::Application,
        inner,
    })
}

pub fn result_parts(rc: u32, text: &str, refs: &[&str]) -> Vec<Tag> {
    let mut parts = vec![
        Tag::Enumerated(Enumerated {
            inner: rc as i64,
            ..Default::default()
        }),
        octets(""),
        octets(text),
    ];
    if !refs.is_empty() {
        parts.push(Tag::Sequence(Sequence {
            id: 3,
            class: TagClass::Context,
            inner: refs.iter().map(octets).collect(),
        }));
    }
    parts
}

/// The response op matching a request op.
pub fn done(req_op: u64, rc: u32) -> Tag {
    op(response_id(req_op), result_parts(rc, "", &[]))
}

pub fn referral(req_op: u64, refs: &[&str]) -> Tag {
    op(response_id(req_op), result_parts(10, "", refs))
}

fn response_id(req_op: u64) -> u64 {
    match req_op {
        3 => 5,
        23 => 24,
        other => other + 1,
    }
}

pub fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> Tag {
    op(
        4,
        vec![
            octets(dn),
            Tag::Sequence(Sequence {
                inner: attrs
                    .iter()
                    .map(|(name, vals)| {
                        Tag::Sequence(Sequence {
                            inner: vec![
                                octets(name),
                                Tag::Set(Set {
                                    inner: vals.iter().map(octets).collect(),
                                    ..Default::default()
                                }),
                            ],
                            ..Default::default()
                        })
                    })
                    .collect(),
                ..Default::default()
            }),
        ],
    )
}

pub fn search_ref(urls: &[&str]) -> Tag {
    op(19, urls.iter().map(octets).collect())
}

pub fn extended_response(rc: u32, name: Option<&str>, value: Option<&[u8]>) -> Tag {
    let mut inner = result_parts(rc, "", &[]);
    if let Some(name) = name {
        inner.push(context_octets(10, name));
    }
    if let Some(value) = value {
        inner.push(context_octets(11, value));
    }
    op(24, inner)
}

pub fn notice_of_disconnection() -> Action {
    Action::ReplyAs(0, extended_response(52, Some(NOTICE_OID), None))
}

/// A small directory: binds succeed unless the password is "wrong", searches return
/// two entries under the base, writes succeed, and Who Am I is answered.
pub fn directory(req: &Received) -> Vec<Action> {
    match req.op_id() {
        0 => {
            let rc = if req.password().as_deref() == Some("wrong") { 49 } else { 0 };
            vec![Action::Reply(done(0, rc))]
        }
        2 => vec![Action::Close],
        3 => {
            let base = req.dn();
            vec![
                Action::Reply(entry(&format!("cn=a,{}", base), &[("cn", &["a"]), ("sn", &["Alpha"])])),
                Action::Reply(entry(&format!("cn=b,{}", base), &[("cn", &["b"])])),
                Action::Reply(done(3, 0)),
            ]
        }
        14 => vec![Action::Reply(done(14, 6))],
        16 => vec![],
        23 => match req.exop_name().as_deref() {
            Some(WHOAMI_OID) => vec![Action::Reply(extended_response(0, None, Some(b"dn:cn=test")))],
            _ => vec![Action::Reply(extended_response(2, None, None))],
        },
        6 | 8 | 10 | 12 => vec![Action::Reply(done(req.op_id(), 0))],
        _ => vec![],
    }
}

/// Poll `cond` for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

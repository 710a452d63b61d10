//! A single transport of a connection.
//!
//! A connection owns one link at a time. Reconnecting replaces the link, and StartTLS
//! replaces the stream inside the link without replacing the link itself. Everything
//! which must be torn down exactly once lives in [`LinkCore`], which is shared by the
//! link's handles and its reader task.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::RequestId;
use crate::conn::{ConnType, LdapConnSettings, ServerAddr, open_transport};
use crate::disconnect::{DisconnectInfo, DisconnectType, SharedDisconnectHandler};
use crate::exop::NOTICE_OF_DISCONNECTION_OID;
use crate::msgid::MessageIdAllocator;
use crate::notification::spawn_notifier;
use crate::protocol::{Frame, LdapCodec, MaybeControls};
use crate::reader::{Reader, io_failure};
#[cfg(feature = "tls")]
use crate::reader::{StartTlsParams, negotiate_starttls};
use crate::result::{LdapError, LdapResult, LdapResultExt, Result};
use crate::router::{Response, ResponseReceiver, ResponseRouter};

use futures_util::sink::SinkExt;
use lber::structure::{PL, StructureTag};
use lber::structures::Tag;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc, oneshot};
use tokio::time;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, Framed};
use tokio_util::sync::CancellationToken;

pub(crate) type LdapFramed = Framed<ConnType, LdapCodec>;

/// State of a connection's background reader.
///
/// A connection in synchronous mode has no reader, and always reports `NotStarted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    NotStarted,
    Running,
    Closing,
    Closed,
}

impl ReaderState {
    fn from_u8(v: u8) -> ReaderState {
        match v {
            1 => ReaderState::Running,
            2 => ReaderState::Closing,
            3 => ReaderState::Closed,
            _ => ReaderState::NotStarted,
        }
    }
}

/// Requests for the reader task, which is the only writer of the socket in
/// asynchronous mode.
pub(crate) enum WriteOp {
    Message {
        id: RequestId,
        tag: Tag,
        controls: MaybeControls,
        ack: oneshot::Sender<Result<()>>,
    },
    Unbind {
        id: RequestId,
        tag: Tag,
        controls: MaybeControls,
        ack: oneshot::Sender<()>,
    },
    #[cfg(feature = "tls")]
    StartTls {
        id: RequestId,
        params: StartTlsParams,
        ack: oneshot::Sender<Result<LdapResult>>,
    },
}

pub(crate) struct LinkCore {
    pub(crate) router: ResponseRouter,
    disconnect: OnceLock<DisconnectInfo>,
    reader_state: AtomicU8,
    pub(crate) shutdown: CancellationToken,
    pub(crate) connected_at: Instant,
    has_tls: AtomicBool,
    host: String,
    port: u16,
    disconnect_handler: Option<SharedDisconnectHandler>,
}

impl LinkCore {
    /// Record why the link went down. Only the first call has an effect, and only
    /// that call reports an unexpected teardown to the disconnect handler.
    pub(crate) fn record_disconnect(&self, info: DisconnectInfo) -> bool {
        if self.disconnect.set(info).is_err() {
            return false;
        }
        self.shutdown.cancel();
        if let Some(info) = self.disconnect.get() {
            debug!("connection to {}:{} closed: {}", self.host, self.port, info);
            if !info.kind.is_expected() {
                if let Some(ref handler) = self.disconnect_handler {
                    handler.handle_disconnect(&self.host, self.port, info);
                }
            }
        }
        true
    }

    pub(crate) fn disconnect_info(&self) -> Option<&DisconnectInfo> {
        self.disconnect.get()
    }

    /// The recorded disconnect reason, or `fallback` if there is none yet.
    pub(crate) fn closed_info(&self, fallback: DisconnectType) -> DisconnectInfo {
        self.disconnect
            .get()
            .cloned()
            .unwrap_or_else(|| DisconnectInfo::new(fallback))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.disconnect.get().is_some()
    }

    pub(crate) fn reader_state(&self) -> ReaderState {
        ReaderState::from_u8(self.reader_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_reader_state(&self, state: ReaderState) {
        self.reader_state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn has_tls(&self) -> bool {
        self.has_tls.load(Ordering::Acquire)
    }

    pub(crate) fn set_tls(&self) {
        self.has_tls.store(true, Ordering::Release);
    }

    /// Deliver a frame which isn't awaited by its reader. In synchronous mode, this
    /// is every frame with a foreign or zero message ID, which makes it an orphan or
    /// a notification. Returns the disconnect reason if the frame ends the link.
    pub(crate) fn route(&self, frame: Frame) -> Option<DisconnectInfo> {
        match frame {
            Frame::Malformed {
                id: Some(id),
                reason,
            } if id != 0 => {
                warn!("malformed response for msgid {}: {}", id, reason);
                self.router.dispatch_malformed(id, reason);
                None
            }
            Frame::Malformed { reason, .. } => {
                warn!("malformed message skipped: {}", reason);
                None
            }
            Frame::Message { id: 0, op, ctrls } if is_notice_of_disconnection(&op) => {
                let message = match LdapResultExt::try_from(op.clone()) {
                    Ok(LdapResultExt(res, _, _)) => format!("rc={}, text: \"{}\"", res.rc, res.text),
                    Err(_) => String::from("unparseable notice"),
                };
                self.router.dispatch(0, op, ctrls);
                Some(DisconnectInfo::new(DisconnectType::ServerClosedWithNotice).with_message(message))
            }
            Frame::Message { id, op, ctrls } => {
                self.router.dispatch(id, op, ctrls);
                None
            }
        }
    }
}

fn is_notice_of_disconnection(op: &StructureTag) -> bool {
    if op.id != 24 {
        return false;
    }
    match op.payload {
        PL::C(ref inner) => inner.iter().any(|t| {
            t.id == 10
                && matches!(t.payload, PL::P(ref name) if name == NOTICE_OF_DISCONNECTION_OID.as_bytes())
        }),
        PL::P(_) => false,
    }
}

type SyncStream = Arc<AsyncMutex<Option<LdapFramed>>>;

enum LinkIo {
    Async(mpsc::UnboundedSender<WriteOp>),
    Sync(SyncStream),
}

/// One established transport, with its router and (in asynchronous mode) its reader.
pub(crate) struct Link {
    pub(crate) core: Arc<LinkCore>,
    io: LinkIo,
}

impl Link {
    /// Open the transport, negotiate StartTLS if configured, and start the reader.
    pub(crate) async fn establish(
        addr: &ServerAddr,
        settings: &LdapConnSettings,
        msgid: &MessageIdAllocator,
    ) -> Result<Link> {
        let stream = open_transport(addr, settings).await?;
        #[allow(unused_mut)]
        let mut has_tls = addr.ldaps;
        #[allow(unused_mut)]
        let mut framed = LdapCodec::new(settings.registry()).framed(stream);
        #[cfg(feature = "tls")]
        if settings.starttls() && !addr.ldaps {
            let params = StartTlsParams {
                settings: settings.clone(),
                host: addr.host.clone(),
            };
            let negotiation = negotiate_starttls(framed, msgid.next(), &params, |frame| {
                if let Frame::Message { id, .. } = frame {
                    warn!("unexpected message during StartTLS, msgid={}", id);
                }
                None
            });
            let negotiation = match settings.conn_timeout {
                Some(timeout) => time::timeout(timeout, negotiation).await.map_err(|_| {
                    LdapError::ConnectTimeout {
                        host: addr.host.clone(),
                        port: addr.port,
                    }
                })?,
                None => negotiation.await,
            };
            framed = match negotiation {
                Ok((framed, _res)) => framed,
                Err((_info, e)) => return Err(e),
            };
            has_tls = true;
        }
        #[cfg(not(feature = "tls"))]
        let _ = msgid;
        Ok(Link::start(framed, addr, settings, has_tls))
    }

    fn start(framed: LdapFramed, addr: &ServerAddr, settings: &LdapConnSettings, has_tls: bool) -> Link {
        let unsolicited = settings
            .unsolicited_handler
            .clone()
            .map(|handler| spawn_notifier(handler, addr.host.clone(), addr.port));
        let core = Arc::new(LinkCore {
            router: ResponseRouter::new(unsolicited),
            disconnect: OnceLock::new(),
            reader_state: AtomicU8::new(ReaderState::NotStarted as u8),
            shutdown: CancellationToken::new(),
            connected_at: Instant::now(),
            has_tls: AtomicBool::new(has_tls),
            host: addr.host.clone(),
            port: addr.port,
            disconnect_handler: settings.disconnect_handler.clone(),
        });
        let io = if settings.synchronous_mode {
            LinkIo::Sync(Arc::new(AsyncMutex::new(Some(framed))))
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            core.set_reader_state(ReaderState::Running);
            Reader::new(core.clone(), rx, framed).spawn();
            LinkIo::Async(tx)
        };
        Link { core, io }
    }

    fn down(&self) -> LdapError {
        LdapError::ServerDown(self.core.closed_info(DisconnectType::LocalError))
    }

    /// Send a request whose responses will be awaited through the returned `Pending`.
    pub(crate) async fn submit(
        self: &Arc<Self>,
        id: RequestId,
        tag: Tag,
        controls: MaybeControls,
    ) -> Result<Pending> {
        match self.io {
            LinkIo::Async(ref tx) => {
                let (resp_tx, rx) = mpsc::unbounded_channel();
                self.core.router.register(id, resp_tx)?;
                if let Err(e) = self.write_async(tx, id, tag, controls).await {
                    self.core.router.deregister(id);
                    return Err(e);
                }
                Ok(Pending::Routed {
                    id,
                    rx,
                    link: self.clone(),
                })
            }
            LinkIo::Sync(ref stream) => {
                let mut guard = stream.clone().lock_owned().await;
                self.write_sync(&mut guard, id, tag, controls).await?;
                Ok(Pending::Direct {
                    id,
                    guard,
                    link: self.clone(),
                })
            }
        }
    }

    /// Send a request which has no response, such as Abandon.
    pub(crate) async fn send_only(
        &self,
        id: RequestId,
        tag: Tag,
        controls: MaybeControls,
    ) -> Result<()> {
        match self.io {
            LinkIo::Async(ref tx) => self.write_async(tx, id, tag, controls).await,
            LinkIo::Sync(ref stream) => {
                let mut guard = stream.lock().await;
                self.write_sync(&mut guard, id, tag, controls).await
            }
        }
    }

    async fn write_async(
        &self,
        tx: &mpsc::UnboundedSender<WriteOp>,
        id: RequestId,
        tag: Tag,
        controls: MaybeControls,
    ) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        if tx
            .send(WriteOp::Message {
                id,
                tag,
                controls,
                ack,
            })
            .is_err()
        {
            return Err(self.down());
        }
        match ack_rx.await {
            Ok(res) => res,
            Err(_) => Err(self.down()),
        }
    }

    async fn write_sync(
        &self,
        guard: &mut Option<LdapFramed>,
        id: RequestId,
        tag: Tag,
        controls: MaybeControls,
    ) -> Result<()> {
        let framed = match guard.as_mut() {
            Some(framed) => framed,
            None => return Err(self.down()),
        };
        if let Err(e) = framed.send((id, tag, controls)).await {
            warn!("socket send error: {}", e);
            let info = io_failure(&e);
            *guard = None;
            self.fail(info);
            return Err(self.down());
        }
        Ok(())
    }

    /// Record the reason and fail the outstanding operations. The transport itself
    /// is closed by its owner: the reader, or the holder of the synchronous stream.
    fn fail(&self, info: DisconnectInfo) {
        self.core.record_disconnect(info);
        self.core
            .router
            .close_all(&self.core.closed_info(DisconnectType::Other));
    }

    /// Send Unbind and close the transport.
    pub(crate) async fn unbind(&self, id: RequestId, tag: Tag, controls: MaybeControls) {
        match self.io {
            LinkIo::Async(ref tx) => {
                let (ack, ack_rx) = oneshot::channel();
                if tx
                    .send(WriteOp::Unbind {
                        id,
                        tag,
                        controls,
                        ack,
                    })
                    .is_ok()
                {
                    let _ = ack_rx.await;
                }
            }
            LinkIo::Sync(ref stream) => {
                self.core
                    .record_disconnect(DisconnectInfo::new(DisconnectType::Unbind));
                let mut guard = stream.lock().await;
                if let Some(mut framed) = guard.take() {
                    if let Err(e) = framed.send((id, tag, controls)).await {
                        debug!("unbind send error: {}", e);
                    }
                    if let Err(e) = framed.close().await {
                        debug!("socket close error: {}", e);
                    }
                }
                self.fail(DisconnectInfo::new(DisconnectType::Unbind));
            }
        }
    }

    /// Close the transport without Unbind, recording `info` if no reason was recorded yet.
    pub(crate) async fn terminate(&self, info: DisconnectInfo) {
        self.core.record_disconnect(info);
        self.core.shutdown.cancel();
        if let LinkIo::Sync(ref stream) = self.io {
            let mut guard = stream.lock().await;
            if let Some(mut framed) = guard.take() {
                if let Err(e) = framed.close().await {
                    debug!("socket close error: {}", e);
                }
            }
            self.fail(DisconnectInfo::new(DisconnectType::Other));
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) async fn start_tls(&self, id: RequestId, params: StartTlsParams) -> Result<LdapResult> {
        match self.io {
            LinkIo::Async(ref tx) => {
                let (ack, ack_rx) = oneshot::channel();
                if tx.send(WriteOp::StartTls { id, params, ack }).is_err() {
                    return Err(self.down());
                }
                match ack_rx.await {
                    Ok(res) => res,
                    Err(_) => Err(self.down()),
                }
            }
            LinkIo::Sync(ref stream) => {
                let mut guard = stream.lock().await;
                let framed = match guard.take() {
                    Some(framed) => framed,
                    None => return Err(self.down()),
                };
                let core = self.core.clone();
                match negotiate_starttls(framed, id, &params, |frame| core.route(frame)).await {
                    Ok((framed, res)) => {
                        *guard = Some(framed);
                        self.core.set_tls();
                        Ok(res)
                    }
                    Err((info, e)) => {
                        drop(guard);
                        self.fail(info);
                        Err(e)
                    }
                }
            }
        }
    }
}

/// The receiving side of an operation in progress.
pub(crate) enum Pending {
    /// Responses are delivered by the reader through the router.
    Routed {
        id: RequestId,
        rx: ResponseReceiver,
        link: Arc<Link>,
    },
    /// The caller reads responses from the stream itself.
    Direct {
        id: RequestId,
        guard: OwnedMutexGuard<Option<LdapFramed>>,
        link: Arc<Link>,
    },
}

impl Pending {
    pub(crate) fn id(&self) -> RequestId {
        match self {
            Pending::Routed { id, .. } | Pending::Direct { id, .. } => *id,
        }
    }

    pub(crate) fn link(&self) -> &Arc<Link> {
        match self {
            Pending::Routed { link, .. } | Pending::Direct { link, .. } => link,
        }
    }

    /// Wait for the next response. The timeout applies to this response only.
    ///
    /// On timeout, the operation is removed from the router, unless its terminal
    /// response won the race, in which case that response is returned instead.
    pub(crate) async fn next(&mut self, timeout: Option<Duration>) -> Response {
        match self {
            Pending::Routed { id, rx, link } => {
                let received = link.core.router.receive(*id, rx, timeout).await;
                received.unwrap_or_else(|| {
                    Response::Closed(link.core.closed_info(DisconnectType::LocalError))
                })
            }
            Pending::Direct { id, guard, link } => loop {
                let framed = match guard.as_mut() {
                    Some(framed) => framed,
                    None => {
                        return Response::Closed(link.core.closed_info(DisconnectType::LocalError));
                    }
                };
                let shutdown = link.core.shutdown.clone();
                let read = async {
                    tokio::select! {
                        _ = shutdown.cancelled() => None,
                        frame = framed.next() => Some(frame),
                    }
                };
                let event = match timeout {
                    Some(t) => match time::timeout(t, read).await {
                        Ok(event) => event,
                        Err(_) => return Response::TimedOut(t),
                    },
                    None => read.await,
                };
                let info = match event {
                    None => link.core.closed_info(DisconnectType::ClosedWithoutUnbind),
                    Some(None) => DisconnectInfo::new(DisconnectType::ServerClosedWithoutNotice),
                    Some(Some(Err(e))) => {
                        warn!("socket receive error: {}", e);
                        io_failure(&e)
                    }
                    Some(Some(Ok(Frame::Message { id: rid, op, ctrls }))) if rid == *id => {
                        return Response::from_op(op, ctrls);
                    }
                    Some(Some(Ok(Frame::Malformed { id: Some(rid), reason }))) if rid == *id => {
                        return Response::Malformed(reason);
                    }
                    Some(Some(Ok(frame))) => match link.core.route(frame) {
                        Some(info) => info,
                        None => continue,
                    },
                };
                if let Some(mut framed) = guard.take() {
                    if let Err(e) = framed.close().await {
                        debug!("socket close error: {}", e);
                    }
                }
                link.fail(info);
                return Response::Closed(link.core.closed_info(DisconnectType::Other));
            },
        }
    }

    /// Remove the operation from the router without waiting for its result.
    pub(crate) fn abandon_wait(&self) {
        if let Pending::Routed { id, link, .. } = self {
            link.core.router.deregister(*id);
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.abandon_wait();
    }
}

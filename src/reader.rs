use std::io;
use std::sync::Arc;

use crate::RequestId;
#[cfg(feature = "tls")]
use crate::conn::{ConnType, LdapConnSettings, create_tls_stream};
use crate::disconnect::{DisconnectInfo, DisconnectType};
#[cfg(feature = "tls")]
use crate::exop::StartTLS;
#[cfg(feature = "tls")]
use crate::exop_impl::construct_exop;
use crate::link::{LdapFramed, LinkCore, ReaderState, WriteOp};
use crate::protocol::Frame;
use crate::result::LdapError;
#[cfg(feature = "tls")]
use crate::result::{LdapResult, LdapResultExt};

use futures_util::sink::SinkExt;
#[cfg(feature = "tls")]
use lber::common::TagClass;
#[cfg(feature = "tls")]
use lber::structures::{Sequence, Tag};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
#[cfg(feature = "tls")]
use tokio_util::codec::Decoder;

pub(crate) fn io_failure(e: &io::Error) -> DisconnectInfo {
    let kind = if e.kind() == io::ErrorKind::InvalidData {
        DisconnectType::DecodeError
    } else {
        DisconnectType::IoError
    };
    DisconnectInfo::new(kind).with_cause(e)
}

/// Parameters for upgrading an established link to TLS.
#[cfg(feature = "tls")]
pub(crate) struct StartTlsParams {
    pub(crate) settings: LdapConnSettings,
    pub(crate) host: String,
}

/// Send StartTLS on `stream` and, if the server accepts it, wrap the socket in TLS.
///
/// Frames for other message IDs which arrive in the meantime are passed to `route`.
/// Any failure leaves the stream unusable, so the error side carries the reason the
/// link should be closed with.
#[cfg(feature = "tls")]
pub(crate) async fn negotiate_starttls<F>(
    mut stream: LdapFramed,
    id: RequestId,
    params: &StartTlsParams,
    mut route: F,
) -> std::result::Result<(LdapFramed, LdapResult), (DisconnectInfo, LdapError)>
where
    F: FnMut(Frame) -> Option<DisconnectInfo>,
{
    let req = Tag::Sequence(Sequence {
        id: 23,
        class: TagClass::Application,
        inner: construct_exop(StartTLS.into()),
    });
    if let Err(e) = stream.send((id, req, None)).await {
        return Err((io_failure(&e), e.into()));
    }
    let op = loop {
        match stream.next().await {
            None => {
                let info = DisconnectInfo::new(DisconnectType::ServerClosedWithoutNotice)
                    .with_message("closed during StartTLS");
                return Err((info.clone(), LdapError::ServerDown(info)));
            }
            Some(Err(e)) => return Err((io_failure(&e), e.into())),
            Some(Ok(Frame::Message { id: rid, op, .. })) if rid == id => break op,
            Some(Ok(Frame::Malformed {
                id: Some(rid),
                reason,
            })) if rid == id => {
                let info = DisconnectInfo::new(DisconnectType::DecodeError).with_message(reason.clone());
                return Err((info, LdapError::Decoding(reason)));
            }
            Some(Ok(frame)) => {
                if let Some(info) = route(frame) {
                    return Err((info.clone(), LdapError::ServerDown(info)));
                }
            }
        }
    };
    let res = match LdapResultExt::try_from(op) {
        Ok(LdapResultExt(res, _, _)) => res,
        Err(e) => {
            let info = DisconnectInfo::new(DisconnectType::DecodeError).with_cause(&e);
            return Err((info, e));
        }
    };
    if res.rc != 0 {
        let info = DisconnectInfo::new(DisconnectType::LocalError)
            .with_message(format!("StartTLS refused, rc={}", res.rc));
        return Err((info, LdapError::LdapResult { result: res }));
    }
    let parts = stream.into_parts();
    let tcp = match parts.io {
        ConnType::Tcp(tcp) => tcp,
        ConnType::Tls(_) => {
            let info = DisconnectInfo::new(DisconnectType::LocalError)
                .with_message("StartTLS on a TLS connection");
            return Err((info, LdapError::Local(String::from("TLS is already active"))));
        }
    };
    match create_tls_stream(&params.settings, &params.host, tcp).await {
        Ok(tls) => Ok((parts.codec.framed(ConnType::Tls(Box::new(tls))), res)),
        Err(e) => {
            let info = DisconnectInfo::new(DisconnectType::LocalError)
                .with_message("TLS handshake failed")
                .with_cause(&e);
            Err((info, e))
        }
    }
}

enum Event {
    Shutdown,
    Write(Option<WriteOp>),
    Frame(Option<io::Result<Frame>>),
}

/// The task which owns the socket of an asynchronous link.
///
/// It writes requests in the order they were queued, and delivers every frame it
/// reads to the router. When it stops, for whatever reason, it closes the socket and
/// fails every operation still registered.
pub(crate) struct Reader {
    core: Arc<LinkCore>,
    rx: mpsc::UnboundedReceiver<WriteOp>,
    stream: LdapFramed,
}

impl Reader {
    pub(crate) fn new(
        core: Arc<LinkCore>,
        rx: mpsc::UnboundedReceiver<WriteOp>,
        stream: LdapFramed,
    ) -> Self {
        Reader { core, rx, stream }
    }

    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let Reader {
            core,
            mut rx,
            mut stream,
        } = self;
        let mut unbind_ack = None;
        let (info, stream) = loop {
            let event = tokio::select! {
                _ = core.shutdown.cancelled() => Event::Shutdown,
                op = rx.recv() => Event::Write(op),
                frame = stream.next() => Event::Frame(frame),
            };
            match event {
                Event::Shutdown => break (core.closed_info(DisconnectType::Other), Some(stream)),
                Event::Write(None) => {
                    let info = DisconnectInfo::new(DisconnectType::ClosedWithoutUnbind)
                        .with_message("all connection handles dropped");
                    break (info, Some(stream));
                }
                Event::Write(Some(WriteOp::Message {
                    id,
                    tag,
                    controls,
                    ack,
                })) => {
                    if let Err(e) = stream.send((id, tag, controls)).await {
                        warn!("socket send error: {}", e);
                        let info = io_failure(&e);
                        core.record_disconnect(info.clone());
                        let _ = ack.send(Err(LdapError::ServerDown(
                            core.closed_info(DisconnectType::IoError),
                        )));
                        break (info, Some(stream));
                    }
                    let _ = ack.send(Ok(()));
                }
                Event::Write(Some(WriteOp::Unbind {
                    id,
                    tag,
                    controls,
                    ack,
                })) => {
                    if let Err(e) = stream.send((id, tag, controls)).await {
                        debug!("unbind send error: {}", e);
                    }
                    unbind_ack = Some(ack);
                    break (DisconnectInfo::new(DisconnectType::Unbind), Some(stream));
                }
                #[cfg(feature = "tls")]
                Event::Write(Some(WriteOp::StartTls { id, params, ack })) => {
                    let route_core = core.clone();
                    match negotiate_starttls(stream, id, &params, |frame| route_core.route(frame))
                        .await
                    {
                        Ok((upgraded, res)) => {
                            stream = upgraded;
                            core.set_tls();
                            let _ = ack.send(Ok(res));
                        }
                        Err((info, e)) => {
                            core.record_disconnect(info.clone());
                            let _ = ack.send(Err(e));
                            break (info, None);
                        }
                    }
                }
                Event::Frame(None) => {
                    break (
                        DisconnectInfo::new(DisconnectType::ServerClosedWithoutNotice),
                        Some(stream),
                    );
                }
                Event::Frame(Some(Err(e))) => {
                    warn!("socket receive error: {}", e);
                    break (io_failure(&e), Some(stream));
                }
                Event::Frame(Some(Ok(frame))) => {
                    if let Some(info) = core.route(frame) {
                        break (info, Some(stream));
                    }
                }
            }
        };
        core.set_reader_state(ReaderState::Closing);
        core.record_disconnect(info);
        let info = core.closed_info(DisconnectType::Other);
        if let Some(mut stream) = stream {
            if let Err(e) = stream.close().await {
                debug!("socket close error: {}", e);
            }
        }
        core.router.close_all(&info);
        core.set_reader_state(ReaderState::Closed);
        if let Some(ack) = unbind_ack {
            let _ = ack.send(());
        }
    }
}

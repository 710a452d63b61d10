use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use crate::RequestId;
use crate::ldap::ConnShared;
use crate::link::{Link, Pending};
use crate::result::{LdapError, LdapResult, LdapResultExt, Result};
use crate::router::Response;
use crate::search::ResultEntry;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time;

/// Observer of the responses to a single operation.
///
/// All methods have empty default implementations. For an operation started with
/// [`send_async()`](struct.Ldap.html#method.send_async), the methods are called from
/// the task which collects the responses, never from the connection's reader; for
/// other operations, they are called from the task performing the operation.
pub trait ResponseListener: Send + Sync {
    fn entry_returned(&self, msgid: RequestId, entry: &ResultEntry) {
        let _ = (msgid, entry);
    }

    fn reference_returned(&self, msgid: RequestId, reference: &ResultEntry) {
        let _ = (msgid, reference);
    }

    fn intermediate_response(&self, msgid: RequestId, response: &ResultEntry) {
        let _ = (msgid, response);
    }

    fn result_received(&self, msgid: RequestId, result: &LdapResult) {
        let _ = (msgid, result);
    }
}

/// An operation in flight. __*__
///
/// The handle is obtained from [`Ldap::send_async()`](struct.Ldap.html#method.send_async),
/// and can be awaited directly, or polled for the result with [`get()`](#method.get).
///
/// The outcome is delivered exactly once, by whichever comes first: the server's result,
/// the expiry of the response timeout, or [`cancel()`](#method.cancel). Failures on the
/// client side are delivered as an `LdapResult` with a client-side result code: 85 for
/// a timeout, 118 for cancellation, 81 if the connection was lost.
pub struct AsyncRequestHandle {
    id: RequestId,
    conn: Arc<ConnShared>,
    link: Arc<Link>,
    outcome: watch::Receiver<Option<LdapResult>>,
}

impl fmt::Debug for AsyncRequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRequestHandle")
            .field("id", &self.id)
            .field("done", &self.is_done())
            .finish()
    }
}

fn client_result(err: LdapError) -> LdapResult {
    LdapResult::from_error(&err)
}

impl AsyncRequestHandle {
    pub(crate) fn start(
        conn: Arc<ConnShared>,
        pending: Pending,
        timeout: Option<Duration>,
        listener: Option<Arc<dyn ResponseListener>>,
    ) -> AsyncRequestHandle {
        let id = pending.id();
        let link = pending.link().clone();
        let (tx, outcome) = watch::channel(None);
        let timer = timeout.map(|t| spawn_timer(conn.clone(), link.clone(), id, t));
        tokio::spawn(pump(pending, tx, timer, listener));
        AsyncRequestHandle {
            id,
            conn,
            link,
            outcome,
        }
    }

    /// Message ID of the operation.
    pub fn msgid(&self) -> RequestId {
        self.id
    }

    /// Whether the outcome has been delivered.
    pub fn is_done(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Wait up to `timeout` for the outcome. Returns `None` if it isn't available
    /// by then; the operation itself continues.
    pub async fn get(&mut self, timeout: Duration) -> Option<Result<LdapResult>> {
        time::timeout(timeout, self.wait()).await.ok()
    }

    /// Stop waiting for the operation. If the outcome hasn't been delivered yet, it
    /// becomes a cancellation, and an Abandon is sent to the server.
    pub async fn cancel(&self) {
        if let Some(tx) = self.link.core.router.deregister(self.id) {
            debug!("canceling msgid {}", self.id);
            let _ = tx.send(Response::Canceled);
            self.conn.send_abandon(&self.link, self.id).await;
        }
    }

    async fn wait(&mut self) -> Result<LdapResult> {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .as_ref()
                .cloned()
                .ok_or_else(|| LdapError::Local(String::from("empty outcome"))),
            Err(_) => Err(LdapError::Local(String::from(
                "operation ended without an outcome",
            ))),
        }
    }
}

impl IntoFuture for AsyncRequestHandle {
    type Output = Result<LdapResult>;
    type IntoFuture = BoxFuture<'static, Result<LdapResult>>;

    fn into_future(mut self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}

fn spawn_timer(conn: Arc<ConnShared>, link: Arc<Link>, id: RequestId, t: Duration) -> AbortHandle {
    tokio::spawn(async move {
        time::sleep(t).await;
        if let Some(tx) = link.core.router.deregister(id) {
            debug!("msgid {} timed out after {:?}", id, t);
            let _ = tx.send(Response::TimedOut(t));
            if conn.settings.abandon_on_timeout {
                conn.send_abandon(&link, id).await;
            }
        }
    })
    .abort_handle()
}

async fn pump(
    mut pending: Pending,
    tx: watch::Sender<Option<LdapResult>>,
    timer: Option<AbortHandle>,
    listener: Option<Arc<dyn ResponseListener>>,
) {
    let id = pending.id();
    let result = loop {
        let resp = pending.next(None).await;
        match resp {
            Response::Entry(op, ctrls) => {
                if let Some(ref listener) = listener {
                    listener.entry_returned(id, &ResultEntry(op, ctrls));
                }
            }
            Response::Reference(op, ctrls) => {
                if let Some(ref listener) = listener {
                    listener.reference_returned(id, &ResultEntry(op, ctrls));
                }
            }
            Response::Intermediate(op, ctrls) => {
                if let Some(ref listener) = listener {
                    listener.intermediate_response(id, &ResultEntry(op, ctrls));
                }
            }
            Response::Done(op, ctrls) => {
                break match LdapResultExt::try_from(op) {
                    Ok(LdapResultExt(mut result, _, _)) => {
                        result.ctrls = ctrls;
                        result
                    }
                    Err(e) => client_result(e),
                };
            }
            Response::Malformed(reason) => break client_result(LdapError::Decoding(reason)),
            Response::Closed(info) => break client_result(LdapError::ServerDown(info)),
            Response::TimedOut(t) => break client_result(LdapError::Timeout(t)),
            Response::Canceled => break client_result(LdapError::Canceled),
        }
    };
    drop(pending);
    if let Some(timer) = timer {
        timer.abort();
    }
    if let Some(ref listener) = listener {
        listener.result_received(id, &result);
    }
    tx.send_replace(Some(result));
}

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::RequestId;
use crate::controls::Control;
use crate::disconnect::DisconnectInfo;
use crate::result::{LdapError, Result};

use lber::structure::StructureTag;
use tokio::sync::mpsc;

/// Everything a waiter can receive for its message ID.
#[derive(Debug)]
pub(crate) enum Response {
    /// SearchResultEntry.
    Entry(StructureTag, Vec<Control>),
    /// SearchResultReference.
    Reference(StructureTag, Vec<Control>),
    /// IntermediateResponse.
    Intermediate(StructureTag, Vec<Control>),
    /// Any response which completes the operation.
    Done(StructureTag, Vec<Control>),
    /// A response with the operation's ID which couldn't be decoded.
    Malformed(String),
    /// The transport was torn down before the operation completed.
    Closed(DisconnectInfo),
    /// The client gave up waiting.
    TimedOut(Duration),
    /// The client canceled the operation.
    Canceled,
}

impl Response {
    pub(crate) fn from_op(op: StructureTag, ctrls: Vec<Control>) -> Response {
        match op.id {
            4 => Response::Entry(op, ctrls),
            19 => Response::Reference(op, ctrls),
            25 => Response::Intermediate(op, ctrls),
            _ => Response::Done(op, ctrls),
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Response::Entry(..) | Response::Reference(..) | Response::Intermediate(..)
        )
    }
}

pub(crate) type ResponseSender = mpsc::UnboundedSender<Response>;
pub(crate) type ResponseReceiver = mpsc::UnboundedReceiver<Response>;
pub(crate) type UnsolicitedSender = mpsc::UnboundedSender<(StructureTag, Vec<Control>)>;

#[derive(Default)]
struct RouterState {
    pending: HashMap<RequestId, ResponseSender>,
    closed: Option<DisconnectInfo>,
}

/// Table of outstanding message IDs.
///
/// Removing an entry is what decides which party completes an operation: the
/// reader delivering a terminal response, a timer delivering a timeout, or a
/// canceler. Whoever gets the sender out of the table delivers; everyone else
/// finds nothing and does nothing.
///
/// The table lock is never held while a response is delivered.
pub(crate) struct ResponseRouter {
    state: Mutex<RouterState>,
    unsolicited: Option<UnsolicitedSender>,
}

impl ResponseRouter {
    pub(crate) fn new(unsolicited: Option<UnsolicitedSender>) -> Self {
        ResponseRouter {
            state: Mutex::new(RouterState::default()),
            unsolicited,
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register(&self, id: RequestId, tx: ResponseSender) -> Result<()> {
        let mut state = self.state();
        if let Some(ref info) = state.closed {
            return Err(LdapError::ServerDown(info.clone()));
        }
        if state.pending.contains_key(&id) {
            return Err(LdapError::IdInUse(id));
        }
        state.pending.insert(id, tx);
        Ok(())
    }

    pub(crate) fn deregister(&self, id: RequestId) -> Option<ResponseSender> {
        self.state().pending.remove(&id)
    }

    /// Wait on `rx` for the next response to `id`. If `timeout` expires and the entry
    /// is still in the table, it's removed and a timeout is reported. If it's no longer
    /// there, the party which took it out sends or drops it, so waiting is bounded.
    pub(crate) async fn receive(
        &self,
        id: RequestId,
        rx: &mut ResponseReceiver,
        timeout: Option<Duration>,
    ) -> Option<Response> {
        let t = match timeout {
            Some(t) => t,
            None => return rx.recv().await,
        };
        match tokio::time::timeout(t, rx.recv()).await {
            Ok(received) => received,
            Err(_) if self.deregister(id).is_some() => Some(Response::TimedOut(t)),
            Err(_) => rx.recv().await,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, id: RequestId) -> bool {
        self.state().pending.contains_key(&id)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.state().pending.len()
    }

    pub(crate) fn dispatch(&self, id: RequestId, op: StructureTag, ctrls: Vec<Control>) {
        if id == 0 {
            self.dispatch_unsolicited(op, ctrls);
            return;
        }
        let resp = Response::from_op(op, ctrls);
        let tx = {
            let mut state = self.state();
            if resp.is_terminal() {
                state.pending.remove(&id)
            } else {
                state.pending.get(&id).cloned()
            }
        };
        match tx {
            Some(tx) => {
                let terminal = resp.is_terminal();
                if tx.send(resp).is_err() {
                    debug!("waiter for msgid {} has gone away", id);
                    if !terminal {
                        self.deregister(id);
                    }
                }
            }
            None => warn!("unmatched id: {}", id),
        }
    }

    pub(crate) fn dispatch_malformed(&self, id: RequestId, reason: String) {
        match self.deregister(id) {
            Some(tx) => {
                if tx.send(Response::Malformed(reason)).is_err() {
                    debug!("waiter for msgid {} has gone away", id);
                }
            }
            None => warn!("unmatched id: {}", id),
        }
    }

    fn dispatch_unsolicited(&self, op: StructureTag, ctrls: Vec<Control>) {
        match self.unsolicited {
            Some(ref tx) => {
                if tx.send((op, ctrls)).is_err() {
                    warn!("unsolicited notification handler has gone away");
                }
            }
            None => warn!("unsolicited notification dropped, op={}", op.id),
        }
    }

    /// Fail every outstanding operation with `info` and refuse further registrations.
    pub(crate) fn close_all(&self, info: &DisconnectInfo) {
        let drained: Vec<_> = {
            let mut state = self.state();
            if state.closed.is_none() {
                state.closed = Some(info.clone());
            }
            state.pending.drain().collect()
        };
        for (id, tx) in drained {
            if tx.send(Response::Closed(info.clone())).is_err() {
                debug!("waiter for msgid {} has gone away", id);
            }
        }
    }
}

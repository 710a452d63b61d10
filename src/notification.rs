use std::sync::Arc;

use crate::controls::Control;
use crate::result::{ExopResult, LdapResultExt};
use crate::router::UnsolicitedSender;

use lber::structure::StructureTag;
use tokio::sync::mpsc;

/// Hook for server-initiated messages which aren't responses to any request.
///
/// Unsolicited notifications are Extended responses with message ID zero. The
/// handler is called from a task belonging to the connection, never from the
/// task reading the socket, so a slow handler delays only further notifications.
pub trait UnsolicitedNotificationHandler: Send + Sync {
    fn handle_notification(&self, host: &str, port: u16, notification: &ExopResult);
}

impl<F> UnsolicitedNotificationHandler for F
where
    F: Fn(&str, u16, &ExopResult) + Send + Sync,
{
    fn handle_notification(&self, host: &str, port: u16, notification: &ExopResult) {
        self(host, port, notification)
    }
}

pub(crate) type SharedNotificationHandler = Arc<dyn UnsolicitedNotificationHandler>;

pub(crate) fn parse_notification(op: StructureTag, ctrls: Vec<Control>) -> Option<ExopResult> {
    if op.id != 24 {
        warn!("unsolicited message is not an extended response, op={}", op.id);
        return None;
    }
    match LdapResultExt::try_from(op) {
        Ok(LdapResultExt(mut result, exop, _)) => {
            result.ctrls = ctrls;
            Some(ExopResult(exop, result))
        }
        Err(e) => {
            warn!("unparseable unsolicited notification: {}", e);
            None
        }
    }
}

/// Start the task which feeds unsolicited notifications to `handler`.
///
/// The task ends when the returned sender, owned by the connection's router, is dropped.
pub(crate) fn spawn_notifier(
    handler: SharedNotificationHandler,
    host: String,
    port: u16,
) -> UnsolicitedSender {
    let (tx, mut rx) = mpsc::unbounded_channel::<(StructureTag, Vec<Control>)>();
    tokio::spawn(async move {
        while let Some((op, ctrls)) = rx.recv().await {
            if let Some(notification) = parse_notification(op, ctrls) {
                handler.handle_notification(&host, port, &notification);
            }
        }
    });
    tx
}

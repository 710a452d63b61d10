//! Disconnect reasons and the disconnect notification hook.
//!
//! Every transport a connection uses is torn down exactly once, and the reason for
//! the teardown is recorded at that point. The first recorded reason wins; later
//! attempts to record another one are ignored. The reason is what waiters receive
//! when their outstanding requests are failed by the teardown.

use std::fmt;
use std::sync::Arc;

/// Classification of a connection teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DisconnectType {
    /// The client sent an Unbind request.
    Unbind,
    /// The client closed the connection without an Unbind, or all handles were dropped.
    ClosedWithoutUnbind,
    /// The server sent a Notice of Disconnection before closing.
    ServerClosedWithNotice,
    /// The server closed the socket without notice.
    ServerClosedWithoutNotice,
    /// Reading from or writing to the socket failed.
    IoError,
    /// The byte stream couldn't be framed as BER.
    DecodeError,
    /// Internal error in the client.
    LocalError,
    /// The transport was replaced by a reconnect.
    Reconnect,
    /// A temporary connection opened for following a referral was closed.
    Referral,
    /// The owning pool was closed.
    PoolClosed,
    /// The connection was created for a pool, but couldn't be prepared for use.
    PoolCreationFailure,
    /// The pool found the connection unusable.
    PoolDefunct,
    /// The pool retired the connection because it exceeded the maximum age.
    PoolExpired,
    /// Anything else.
    Other,
}

impl DisconnectType {
    /// Whether this kind of teardown is part of normal operation.
    ///
    /// Only unexpected teardowns are reported to the
    /// [`DisconnectHandler`](trait.DisconnectHandler.html).
    pub fn is_expected(self) -> bool {
        matches!(
            self,
            DisconnectType::Unbind
                | DisconnectType::ClosedWithoutUnbind
                | DisconnectType::Reconnect
                | DisconnectType::Referral
                | DisconnectType::PoolClosed
                | DisconnectType::PoolExpired
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            DisconnectType::Unbind => "unbind",
            DisconnectType::ClosedWithoutUnbind => "closed without unbind",
            DisconnectType::ServerClosedWithNotice => "server closed with notice",
            DisconnectType::ServerClosedWithoutNotice => "server closed without notice",
            DisconnectType::IoError => "I/O error",
            DisconnectType::DecodeError => "decode error",
            DisconnectType::LocalError => "local error",
            DisconnectType::Reconnect => "reconnect",
            DisconnectType::Referral => "referral",
            DisconnectType::PoolClosed => "pool closed",
            DisconnectType::PoolCreationFailure => "pool creation failure",
            DisconnectType::PoolDefunct => "defunct pooled connection",
            DisconnectType::PoolExpired => "expired pooled connection",
            DisconnectType::Other => "other",
        }
    }
}

impl fmt::Display for DisconnectType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded reason for a connection teardown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisconnectInfo {
    /// Kind of teardown.
    pub kind: DisconnectType,
    /// Human-readable detail, if any.
    pub message: Option<String>,
    /// Rendered underlying error, if any.
    pub cause: Option<String>,
}

impl DisconnectInfo {
    pub fn new(kind: DisconnectType) -> Self {
        DisconnectInfo {
            kind,
            message: None,
            cause: None,
        }
    }

    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_cause<E: fmt::Display>(mut self, cause: E) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

impl fmt::Display for DisconnectInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref message) = self.message {
            write!(f, ": {}", message)?;
        }
        if let Some(ref cause) = self.cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}

/// Hook invoked when a connection is torn down for an unexpected reason.
///
/// The hook runs once per transport, on whichever task records the teardown. It
/// must not block.
pub trait DisconnectHandler: Send + Sync {
    fn handle_disconnect(&self, host: &str, port: u16, info: &DisconnectInfo);
}

impl<F> DisconnectHandler for F
where
    F: Fn(&str, u16, &DisconnectInfo) + Send + Sync,
{
    fn handle_disconnect(&self, host: &str, port: u16, info: &DisconnectInfo) {
        self(host, port, info)
    }
}

pub(crate) type SharedDisconnectHandler = Arc<dyn DisconnectHandler>;

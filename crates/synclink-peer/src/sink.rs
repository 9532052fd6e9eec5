use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use synclink_proto::Message;

use crate::error::Result;

/// Boxed, `Send` future used at the object-safe trait seams of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Anything that can put a message on the link.
///
/// Components that answer the controller hold a sink rather than a concrete
/// connection, so they keep working across reconnects.
pub trait MessageSink: Send + Sync {
    fn send(&self, message: Message) -> BoxFuture<'_, Result<()>>;

    /// A sink bound to the connection that is current now, for exchanges
    /// that must not continue on a replacement connection. Sends through it
    /// fail once that connection closes.
    ///
    /// `None` means this sink already has a single destination.
    fn pinned(&self) -> Result<Option<Arc<dyn MessageSink>>> {
        Ok(None)
    }
}

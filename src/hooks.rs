//! Application callback surface
//!
//! The application plugs into the session by implementing [`SessionHooks`].
//! Every method has a safe default (reject new channels, ignore traffic), so
//! an implementation only overrides what it cares about.
//!
//! The session never trusts a hook: each invocation runs inside its own
//! task so a panicking callback is caught and logged instead of taking a
//! transport pump down with it.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::channel::{Channel, LaneIndex};

/// Application-owned per-channel state.
///
/// Returned from [`SessionHooks::on_accept`] and stored weakly by the
/// session. Dropping the last strong reference is how the application
/// abandons a channel: the session notices the failed upgrade on the next
/// receive and resets the peer.
pub type AppContext = Arc<dyn Any + Send + Sync>;

/// Callbacks driven by the session.
///
/// The implementing object doubles as the application's global state (the
/// hooks are shared by every channel of the session), while the
/// [`AppContext`] returned per accept carries channel-local state.
///
/// Delivery guarantees: calls for one lane of one channel never run
/// concurrently; different lanes and different channels may.
#[async_trait]
pub trait SessionHooks: Send + Sync + 'static {
    /// A peer completed the rendezvous and both transports are about to
    /// start. Return the per-channel context to accept, or `None` to
    /// reject and reset the slot.
    async fn on_accept(&self, channel: Channel) -> Option<AppContext> {
        let _ = channel;
        None
    }

    /// One application message arrived on a reliable lane, duplicates
    /// already suppressed.
    async fn on_reliable(
        &self,
        channel: Channel,
        lane: LaneIndex,
        data: Bytes,
        context: AppContext,
    ) {
        let _ = (channel, lane, data, context);
    }

    /// One datagram arrived in sequence on the unreliable lane.
    async fn on_unreliable(&self, channel: Channel, data: Bytes, context: AppContext) {
        let _ = (channel, data, context);
    }

    /// Both directions of the channel are gone, or the handshake failed
    /// after the peer had answered once. The context is `None` when the
    /// application already dropped it.
    async fn on_disconnect(&self, channel: Channel, context: Option<AppContext>) {
        let _ = (channel, context);
    }
}

/// Runs `on_accept` in its own task. A panic counts as a rejection.
pub(crate) async fn accept_guarded(
    hooks: Arc<dyn SessionHooks>,
    channel: Channel,
) -> Option<AppContext> {
    match tokio::spawn(async move { hooks.on_accept(channel).await }).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::warn!("accept callback panicked: {e}");
            None
        }
    }
}

/// Runs a fire-and-forget hook in its own task and waits for it, so lane
/// ordering is preserved while panics stay contained.
pub(crate) async fn deliver_guarded<F>(label: &str, hook: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(e) = tokio::spawn(hook).await {
        tracing::warn!("{label} callback panicked: {e}");
    }
}

use std::sync::Arc;

use haggle_protocol::{normalize, ChannelStatus, Role, RowEvent};
use tokio::sync::{mpsc, watch};

use crate::config::ChatConfig;
use crate::services::ServiceHandle;
use crate::state::ChatState;
use crate::store::MessageStoreApi;
use crate::sync::RefetchGate;

/// Everything a refetch needs, cloneable into the poll tasks.
#[derive(Clone)]
pub(crate) struct SyncContext {
    pub state: Arc<ChatState>,
    pub api: Arc<dyn MessageStoreApi>,
    pub conversation_id: String,
    pub actor_id: String,
    pub viewer_role: Role,
    pub gate: RefetchGate,
}

/// Run one full refetch, silently.
///
/// Coalesced by the single-flight gate; a request arriving while another is
/// outstanding is dropped, not queued. The result is discarded if the view
/// detached while the request was in flight. Errors are logged only; the
/// next tick (or the fallback poll) retries.
pub(crate) async fn run_refetch(ctx: &SyncContext) {
    let Some(_permit) = ctx.gate.try_acquire() else {
        tracing::trace!(conversation = %ctx.conversation_id, "refetch already in flight; coalescing");
        return;
    };
    let generation = ctx.state.generation();

    match ctx.api.fetch_messages(&ctx.conversation_id).await {
        Ok(batch) => {
            if !ctx.state.is_current(generation) {
                tracing::debug!(
                    conversation = %ctx.conversation_id,
                    "discarding refetch result for a detached view"
                );
                return;
            }
            let messages = batch
                .messages
                .iter()
                .map(|row| normalize(row, &ctx.actor_id, ctx.viewer_role))
                .collect();
            ctx.state.replace_messages(messages);
        }
        Err(e) => {
            tracing::debug!(
                conversation = %ctx.conversation_id,
                error = %e,
                "refetch failed; will retry on next tick"
            );
        }
    }
}

/// Start the three sync signal sources for one conversation.
///
/// 1. Push: row events from the conversation channel, applied with the
///    idempotent merge rules.
/// 2. Background poll: a fixed-interval silent full refetch that heals
///    missed push events without surfacing any loading state.
/// 3. Fallback poll: a slower refetch that runs only while the channel
///    reports itself unhealthy, and stops once it is `SUBSCRIBED` again.
pub(crate) fn start_sync_service(
    ctx: SyncContext,
    config: &ChatConfig,
    mut row_events: mpsc::Receiver<RowEvent>,
    status: watch::Receiver<ChannelStatus>,
) -> ServiceHandle {
    let mut handle = ServiceHandle::new();

    // Push loop
    {
        let ctx = ctx.clone();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            let generation = ctx.state.generation();
            loop {
                tokio::select! {
                    event = row_events.recv() => {
                        let Some(event) = event else { break };
                        if !ctx.state.is_current(generation) {
                            tracing::debug!("dropping push event for a detached view");
                            continue;
                        }
                        ctx.state.apply_event(&event, &ctx.actor_id, ctx.viewer_role);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!(conversation = %ctx.conversation_id, "push loop shut down");
        });
        handle.push(shutdown_tx, task);
    }

    // Background poll loop
    {
        let ctx = ctx.clone();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let poll_interval = config.poll_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; the caller already did the
            // initial load, so skip it.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => run_refetch(&ctx).await,
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!(conversation = %ctx.conversation_id, "background poll shut down");
        });
        handle.push(shutdown_tx, task);
    }

    // Fallback poll loop
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let fallback_interval = config.fallback_poll_interval;
        let mut status = status;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(fallback_interval);
            // Skip, not burst: while the channel is healthy the tick branch
            // is disabled and ticks pile up otherwise.
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                // Only transport trouble activates the fallback; a CLOSED
                // channel means the view is going away, not that push is lost.
                let degraded = matches!(
                    *status.borrow(),
                    ChannelStatus::ChannelError | ChannelStatus::TimedOut
                );
                tokio::select! {
                    changed = status.changed() => {
                        if changed.is_err() {
                            break; // transport dropped the channel
                        }
                        let current = *status.borrow();
                        if current.is_healthy() {
                            tracing::debug!(conversation = %ctx.conversation_id, "channel recovered; fallback poll stops");
                        } else {
                            tracing::warn!(
                                conversation = %ctx.conversation_id,
                                status = ?current,
                                "channel degraded; fallback poll active"
                            );
                        }
                    }
                    _ = interval.tick(), if degraded => run_refetch(&ctx).await,
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!(conversation = %ctx.conversation_id, "fallback poll shut down");
        });
        handle.push(shutdown_tx, task);
    }

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use std::time::Duration;

    fn test_config() -> ChatConfig {
        ChatConfig::default()
    }

    fn make_ctx(store: &Arc<MemoryStore>) -> SyncContext {
        SyncContext {
            state: ChatState::new(),
            api: store.clone(),
            conversation_id: "c1".to_string(),
            actor_id: "buyer-1".to_string(),
            viewer_role: Role::Buyer,
            gate: RefetchGate::new(),
        }
    }

    fn start(
        ctx: SyncContext,
    ) -> (
        ServiceHandle,
        mpsc::Sender<RowEvent>,
        Arc<watch::Sender<ChannelStatus>>,
    ) {
        let (row_tx, row_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Subscribed);
        let handle = start_sync_service(ctx, &test_config(), row_rx, status_rx);
        (handle, row_tx, Arc::new(status_tx))
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_events_apply_immediately() {
        let store = Arc::new(MemoryStore::new("buyer-1"));
        let ctx = make_ctx(&store);
        let (handle, row_tx, _status) = start(ctx.clone());

        let row = store.seed_row("c1", "vendor-9", "hello");
        row_tx.send(RowEvent::Inserted(row)).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(ctx.state.messages().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_poll_heals_missed_push() {
        let store = Arc::new(MemoryStore::new("buyer-1"));
        let ctx = make_ctx(&store);
        let (handle, _row_tx, _status) = start(ctx.clone());

        // A row appears in the store without any push event.
        store.seed_row("c1", "vendor-9", "missed");
        assert!(ctx.state.messages().is_empty());

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(ctx.state.messages().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_poll_tracks_channel_health() {
        let store = Arc::new(MemoryStore::new("buyer-1"));
        let ctx = make_ctx(&store);
        let (handle, _row_tx, status) = start(ctx.clone());

        let fetches_while_healthy = store.fetch_calls();
        status.send(ChannelStatus::TimedOut).unwrap();
        // Within one fallback tick the poll must have fired (the background
        // poll also runs; both hit the same store).
        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert!(store.fetch_calls() > fetches_while_healthy);

        status.send(ChannelStatus::Subscribed).unwrap();
        tokio::task::yield_now().await;
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_result_discarded_after_detach() {
        let store = Arc::new(MemoryStore::new("buyer-1"));
        store.seed_row("c1", "vendor-9", "stale");
        store.set_fetch_delay(Duration::from_millis(100));
        let ctx = make_ctx(&store);

        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { run_refetch(&ctx).await }
        });
        // Let the fetch get issued, then detach while it is in flight.
        tokio::task::yield_now().await;
        ctx.state.bump_generation();
        task.await.unwrap();
        assert!(ctx.state.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_errors_are_silent() {
        let store = Arc::new(MemoryStore::new("buyer-1"));
        store.fail_fetches(true);
        let ctx = make_ctx(&store);
        run_refetch(&ctx).await;
        assert!(ctx.state.messages().is_empty());
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use haggle_protocol::{ChannelEvent, PresencePayload};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::ChatConfig;
use crate::presence;
use crate::services::ServiceHandle;
use crate::state::ChatState;
use crate::transport::PresenceChannel;
use crate::typing::TypingTracker;

/// Shared pieces of the presence loops.
#[derive(Clone)]
pub(crate) struct PresenceContext {
    pub state: Arc<ChatState>,
    pub channel: Arc<dyn PresenceChannel>,
    /// Template payload for this client; every track stamps a fresh `at`.
    pub payload: PresencePayload,
    /// Last typing flag sent on the channel. The heartbeat re-tracks this
    /// value so a mid-compose heartbeat does not retract `typing:true`.
    pub typing: Arc<AtomicBool>,
    pub conversation_id: String,
}

impl PresenceContext {
    fn stamped(&self, typing: bool) -> PresencePayload {
        let mut payload = self.payload.clone();
        payload.online = true;
        payload.typing = typing;
        payload.at = Utc::now();
        payload
    }

    /// Track a payload, logging failures instead of surfacing them. A missed
    /// heartbeat or typing update is corrected by the next one.
    async fn track(&self, typing: bool) {
        self.typing.store(typing, Ordering::Relaxed);
        if let Err(e) = self.channel.track(self.stamped(typing)).await {
            tracing::warn!(
                conversation = %self.conversation_id,
                error = %e,
                "presence track failed; next heartbeat retries"
            );
        }
    }
}

/// Start the presence loops for one conversation.
///
/// 1. Heartbeat: tracks `online:true` immediately and re-tracks on a fixed
///    interval so a silently dropped channel re-registers us.
/// 2. Snapshot consumer: every `sync` event replaces the whole presence map
///    with a rebuild from the channel's current snapshot.
/// 3. Typing driver: feeds local input changes through the debounce state
///    machine and owns its idle timer.
pub(crate) fn start_presence_service(
    ctx: PresenceContext,
    config: &ChatConfig,
    mut presence_events: mpsc::Receiver<ChannelEvent>,
    mut input_rx: mpsc::Receiver<String>,
) -> ServiceHandle {
    let mut handle = ServiceHandle::new();

    // Heartbeat loop
    {
        let ctx = ctx.clone();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let heartbeat_interval = config.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    // First tick fires immediately: that is the initial track.
                    // Re-tracks carry the current typing flag unchanged.
                    _ = interval.tick() => {
                        let typing = ctx.typing.load(Ordering::Relaxed);
                        ctx.track(typing).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!(conversation = %ctx.conversation_id, "heartbeat shut down");
        });
        handle.push(shutdown_tx, task);
    }

    // Snapshot consumer loop
    {
        let ctx = ctx.clone();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = presence_events.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            ChannelEvent::Sync => rebuild_from_snapshot(&ctx).await,
                            ChannelEvent::Join | ChannelEvent::Leave => {
                                // Join/leave deltas are ignored; the sync
                                // event that follows carries the full truth.
                                tracing::trace!(conversation = %ctx.conversation_id, ?event, "presence delta");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!(conversation = %ctx.conversation_id, "snapshot consumer shut down");
        });
        handle.push(shutdown_tx, task);
    }

    // Typing driver loop
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let mut tracker = TypingTracker::new(config.typing_debounce);
        let task = tokio::spawn(async move {
            loop {
                let deadline = tracker.deadline();
                tokio::select! {
                    text = input_rx.recv() => {
                        let Some(text) = text else { break };
                        if let Some(flag) = tracker.input_changed(!text.is_empty(), Instant::now()) {
                            ctx.track(flag).await;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                        if deadline.is_some() =>
                    {
                        if let Some(flag) = tracker.deadline_elapsed(Instant::now()) {
                            ctx.track(flag).await;
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!(conversation = %ctx.conversation_id, "typing driver shut down");
        });
        handle.push(shutdown_tx, task);
    }

    handle
}

/// Pull the channel's full snapshot and swap the presence map.
async fn rebuild_from_snapshot(ctx: &PresenceContext) {
    match ctx.channel.presence_state().await {
        Ok(snapshot) => {
            ctx.state.replace_presence(presence::rebuild_map(&snapshot));
        }
        Err(e) => {
            tracing::warn!(
                conversation = %ctx.conversation_id,
                error = %e,
                "presence snapshot read failed; keeping the previous map"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;
    use haggle_protocol::{Role, SnapshotEntry};
    use std::time::Duration;

    fn make_ctx(channel: &Arc<MemoryChannel>) -> PresenceContext {
        PresenceContext {
            state: ChatState::new(),
            channel: channel.clone(),
            payload: PresencePayload {
                user_id: "buyer-1".to_string(),
                role: Role::Buyer,
                online: true,
                typing: false,
                email: Some("buyer@x.com".to_string()),
                alias_user_ids: Vec::new(),
                alias_emails: Vec::new(),
                at: Utc::now(),
            },
            typing: Arc::new(AtomicBool::new(false)),
            conversation_id: "c1".to_string(),
        }
    }

    fn start(
        ctx: PresenceContext,
    ) -> (
        ServiceHandle,
        mpsc::Sender<ChannelEvent>,
        mpsc::Sender<String>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (input_tx, input_rx) = mpsc::channel(16);
        let handle = start_presence_service(ctx, &ChatConfig::default(), event_rx, input_rx);
        (handle, event_tx, input_tx)
    }

    fn vendor_snapshot(online: bool, typing: bool) -> Vec<SnapshotEntry> {
        vec![SnapshotEntry {
            key: "vendor-9".to_string(),
            payload: PresencePayload {
                user_id: "vendor-9".to_string(),
                role: Role::Vendor,
                online,
                typing,
                email: None,
                alias_user_ids: Vec::new(),
                alias_emails: Vec::new(),
                at: Utc::now(),
            },
        }]
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_track_and_heartbeat_retrack() {
        let channel = Arc::new(MemoryChannel::new());
        let ctx = make_ctx(&channel);
        let (handle, _event_tx, _input_tx) = start(ctx);

        tokio::task::yield_now().await;
        assert_eq!(channel.tracked().len(), 1);
        assert!(channel.tracked()[0].online);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(channel.tracked().len() >= 2);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_event_rebuilds_presence_map() {
        let channel = Arc::new(MemoryChannel::new());
        channel.set_snapshot(vendor_snapshot(true, false));
        let ctx = make_ctx(&channel);
        let state = ctx.state.clone();
        let (handle, event_tx, _input_tx) = start(ctx);

        event_tx.send(ChannelEvent::Sync).await.unwrap();
        tokio::task::yield_now().await;

        let entry = state
            .presence_of(&["vendor-9".to_string()], &[])
            .expect("vendor present after sync");
        assert!(entry.online);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_read_failure_keeps_previous_map() {
        let channel = Arc::new(MemoryChannel::new());
        channel.set_snapshot(vendor_snapshot(true, false));
        let ctx = make_ctx(&channel);
        let state = ctx.state.clone();
        let (handle, event_tx, _input_tx) = start(ctx);

        event_tx.send(ChannelEvent::Sync).await.unwrap();
        tokio::task::yield_now().await;
        assert!(state.presence_of(&["vendor-9".to_string()], &[]).is_some());

        channel.fail_presence_state(true);
        event_tx.send(ChannelEvent::Sync).await.unwrap();
        tokio::task::yield_now().await;
        // The failed read must not wipe what we had.
        assert!(state.presence_of(&["vendor-9".to_string()], &[]).is_some());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_tracked_once_per_burst() {
        let channel = Arc::new(MemoryChannel::new());
        let ctx = make_ctx(&channel);
        let (handle, _event_tx, input_tx) = start(ctx);
        tokio::task::yield_now().await;
        let after_heartbeat = channel.tracked().len();

        for text in ["h", "he", "hey"] {
            input_tx.send(text.to_string()).await.unwrap();
        }
        tokio::task::yield_now().await;
        let tracked = channel.tracked();
        assert_eq!(tracked.len(), after_heartbeat + 1);
        assert!(tracked.last().is_some_and(|p| p.typing));

        // Idle past the debounce: exactly one `typing:false`.
        tokio::time::sleep(Duration::from_millis(1300)).await;
        let tracked = channel.tracked();
        assert_eq!(tracked.len(), after_heartbeat + 2);
        assert!(tracked.last().is_some_and(|p| !p.typing));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_preserves_active_typing() {
        let channel = Arc::new(MemoryChannel::new());
        let ctx = make_ctx(&channel);
        let (handle, _event_tx, input_tx) = start(ctx);
        tokio::task::yield_now().await;

        // Keep composing across the heartbeat boundary: one keystroke per
        // second holds the debounce armed, so the 20s heartbeat re-track
        // must carry typing:true, not retract it.
        for i in 0..25 {
            input_tx.send(format!("draft {i}")).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let tracked = channel.tracked();
        let first_typing = tracked
            .iter()
            .position(|p| p.typing)
            .expect("typing started");
        assert!(
            tracked.len() > first_typing + 1,
            "heartbeat tracked during the burst"
        );
        assert!(
            tracked[first_typing..].iter().all(|p| p.typing),
            "typing never retracted while composing"
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_input_retracts_typing() {
        let channel = Arc::new(MemoryChannel::new());
        let ctx = make_ctx(&channel);
        let (handle, _event_tx, input_tx) = start(ctx);
        tokio::task::yield_now().await;

        input_tx.send("draft".to_string()).await.unwrap();
        input_tx.send(String::new()).await.unwrap();
        tokio::task::yield_now().await;

        let tracked = channel.tracked();
        assert!(tracked.last().is_some_and(|p| !p.typing));
        handle.shutdown().await;
    }
}

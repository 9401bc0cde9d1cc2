use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use haggle_protocol::{normalize, Message, Role, RowEvent};

/// Apply one row event to the local message list.
///
/// The rules make events from push, background poll and fallback poll
/// commute regardless of arrival order:
/// - INSERT appends only if the id is not already present.
/// - UPDATE replaces by id, or appends if the id is not yet known (a
///   create-then-update pair delivered out of order still converges).
/// - DELETE removes by id, else is a no-op.
///
/// Content is last-write-wins: whatever row version was applied last sticks.
/// Returns whether the list changed.
pub fn apply_event(
    messages: &mut Vec<Message>,
    event: &RowEvent,
    actor_id: &str,
    viewer_role: Role,
) -> bool {
    match event {
        RowEvent::Inserted(row) => {
            if messages.iter().any(|m| m.id == row.id) {
                return false;
            }
            messages.push(normalize(row, actor_id, viewer_role));
            true
        }
        RowEvent::Updated(row) => {
            let mut message = normalize(row, actor_id, viewer_role);
            if let Some(existing) = messages.iter_mut().find(|m| m.id == row.id) {
                clamp_receipts(existing, &mut message);
                *existing = message;
            } else {
                messages.push(message);
            }
            true
        }
        RowEvent::Deleted { id } => {
            let before = messages.len();
            messages.retain(|m| m.id != *id);
            messages.len() != before
        }
    }
}

/// Carry receipt knowledge forward when a row version replaces another.
///
/// Last-write-wins covers textual content only. Delivery facts are
/// monotone: once a message is known delivered or read, a stale row
/// version arriving out of order must not downgrade it.
pub(crate) fn clamp_receipts(existing: &Message, incoming: &mut Message) {
    incoming.delivered_at = match (existing.delivered_at, incoming.delivered_at) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    incoming.read_at = match (existing.read_at, incoming.read_at) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    incoming.delivery_state = existing.delivery_state.max(incoming.delivery_state);
    incoming.is_edited = existing.is_edited || incoming.is_edited;
}

/// Single-flight guard for full refetches.
///
/// At most one refetch per conversation may be outstanding; a request
/// arriving while one is in flight is dropped (coalesced), not queued.
#[derive(Clone, Default)]
pub struct RefetchGate(Arc<AtomicBool>);

impl RefetchGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate. `None` means a refetch is already in flight.
    pub fn try_acquire(&self) -> Option<RefetchPermit> {
        if self
            .0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(RefetchPermit(self.0.clone()))
        } else {
            None
        }
    }
}

/// Releases the gate on drop, including on cancellation.
pub struct RefetchPermit(Arc<AtomicBool>);

impl Drop for RefetchPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use haggle_protocol::{DeliveryState, MessageRow};

    fn make_row(id: &str, body: &str) -> MessageRow {
        MessageRow {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "buyer-1".to_string(),
            body: body.to_string(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            updated_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            is_edited: false,
            delivered_at: None,
            read_at: None,
        }
    }

    fn apply_all(events: &[RowEvent]) -> Vec<Message> {
        let mut messages = Vec::new();
        for event in events {
            apply_event(&mut messages, event, "buyer-1", Role::Buyer);
        }
        messages
    }

    #[test]
    fn test_insert_is_idempotent() {
        let insert = RowEvent::Inserted(make_row("m1", "hi"));
        let messages = apply_all(&[insert.clone(), insert]);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_insert_update_orders_converge() {
        let insert = RowEvent::Inserted(make_row("m1", "hi"));
        let update = RowEvent::Updated(make_row("m1", "hi there"));

        let a = apply_all(&[insert.clone(), update.clone()]);
        let b = apply_all(&[update, insert]);
        assert_eq!(a, b);
        assert_eq!(a[0].text, "hi there");
    }

    #[test]
    fn test_insert_delete_orders_converge() {
        let insert = RowEvent::Inserted(make_row("m1", "hi"));
        let delete = RowEvent::Deleted {
            id: "m1".to_string(),
        };
        // Delete-before-insert: the delete no-ops, the insert lands, and the
        // next full refetch reconciles. Delete-after-insert empties directly.
        assert!(apply_all(&[insert.clone(), delete.clone()]).is_empty());
        let reversed = apply_all(&[delete, insert]);
        assert_eq!(reversed.len(), 1);
    }

    #[test]
    fn test_delete_absent_is_noop() {
        let mut messages = Vec::new();
        let changed = apply_event(
            &mut messages,
            &RowEvent::Deleted {
                id: "ghost".to_string(),
            },
            "buyer-1",
            Role::Buyer,
        );
        assert!(!changed);
        assert!(messages.is_empty());
    }

    #[test]
    fn test_stale_update_cannot_regress_delivery_state() {
        let mut read_row = make_row("m1", "hi");
        read_row.read_at = Some(Utc.timestamp_opt(1_700_000_100, 0).unwrap());
        // A row version without the read column arrives after the one that
        // carried it. Text follows the late version; the receipt does not.
        let messages = apply_all(&[
            RowEvent::Updated(read_row),
            RowEvent::Updated(make_row("m1", "hi again")),
        ]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hi again");
        assert_eq!(messages[0].delivery_state, DeliveryState::Read);
        assert!(messages[0].read_at.is_some());
    }

    #[test]
    fn test_update_content_is_last_write_wins() {
        let messages = apply_all(&[
            RowEvent::Updated(make_row("m1", "v1")),
            RowEvent::Updated(make_row("m1", "v2")),
        ]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "v2");
    }

    #[test]
    fn test_refetch_gate_coalesces() {
        let gate = RefetchGate::new();
        let permit = gate.try_acquire().expect("first claim succeeds");
        assert!(gate.try_acquire().is_none(), "second claim is dropped");
        drop(permit);
        assert!(gate.try_acquire().is_some(), "released after drop");
    }
}

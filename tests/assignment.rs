mod common;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use common::{BusCall, Harness, ScriptedQueue, UnreachableDirectory};
use handoff_server::{
    bus::CUSTOMER_SERVICE_CHANNEL_TYPE,
    error::HandoffError,
    store::MemoryStore,
    types::{
        ConversationOwner, ManualServiceEventType, QueueStatus, ServiceStatus, Staff,
        TransferRequest, WaitingQueueEntry,
    },
};
use uuid::Uuid;

fn channel(visitor: Uuid) -> String {
    format!("cs_{visitor}")
}

#[tokio::test]
async fn no_staff_puts_visitor_in_queue() {
    let h = Harness::new();
    let v = h.add_visitor().await;

    let result = h
        .engine
        .transfer_to_staff(TransferRequest::new(h.project, v.id))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.queue_position, Some(1));
    assert!(result.assigned_staff_id.is_none());
    let entry = result.waiting_queue.unwrap();
    assert_eq!(entry.channel_id, channel(v.id));
    assert_eq!(entry.status, QueueStatus::Waiting);
    assert_eq!(entry.priority, 0);
    assert_eq!(entry.source, "transfer");

    let stored = h.visitor(v.id).await;
    assert_eq!(stored.service_status, ServiceStatus::Queued);
    assert!(!stored.ai_enabled);
    h.assert_invariants().await;
}

#[tokio::test]
async fn available_staff_is_assigned_and_subscribed() {
    let h = Harness::new();
    let s1 = h.add_staff("Jo").await;
    let v = h.add_visitor().await;

    let result = h
        .engine
        .transfer_to_staff(TransferRequest::new(h.project, v.id))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.assigned_staff_id, Some(s1.id));
    let stored = h.visitor(v.id).await;
    assert_eq!(stored.service_status, ServiceStatus::Active);
    assert_eq!(stored.assigned_staff_id, Some(s1.id));
    assert!(!stored.ai_enabled);

    assert!(h.bus.calls().contains(&BusCall::AddSubscribers {
        channel_id: channel(v.id),
        channel_type: CUSTOMER_SERVICE_CHANNEL_TYPE,
        subscribers: vec![format!("{}-staff", s1.id)],
    }));
    assert!(h.sessions.is_live(v.id).await.unwrap());
    assert_eq!(h.sessions.staff_for(v.id).await.unwrap(), Some(s1.id));
    h.assert_invariants().await;
}

#[tokio::test]
async fn first_available_staff_in_directory_order_wins() {
    let h = Harness::new();
    let paused = Staff {
        service_paused: true,
        ..h.add_staff("Paused").await
    };
    h.store.insert_staff(paused).await;
    let first = h.add_staff("First").await;
    h.add_staff("Second").await;
    let v = h.add_visitor().await;

    let result = h
        .engine
        .transfer_to_staff(TransferRequest::new(h.project, v.id))
        .await
        .unwrap();
    assert_eq!(result.assigned_staff_id, Some(first.id));
}

#[tokio::test]
async fn unavailable_target_means_no_candidate() {
    let h = Harness::new();
    let paused = Staff {
        service_paused: true,
        ..h.add_staff("Paused").await
    };
    h.store.insert_staff(paused.clone()).await;
    h.add_staff("Free").await;
    let v = h.add_visitor().await;

    let req = TransferRequest {
        target_staff_id: Some(paused.id),
        add_to_queue_if_no_staff: false,
        ..TransferRequest::new(h.project, v.id)
    };
    let result = h.engine.transfer_to_staff(req).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.message, "No available staff");
    assert_eq!(h.visitor(v.id).await, v);
    assert!(h.bus.calls().is_empty());
    assert!(h.store.entries_for_visitor(v.id).await.is_empty());
}

#[tokio::test]
async fn directory_failure_is_treated_as_no_staff() {
    let store = Arc::new(MemoryStore::new());
    let h = Harness::with_directory(store, Arc::new(UnreachableDirectory));
    let v = h.add_visitor().await;

    let result = h
        .engine
        .transfer_to_staff(TransferRequest::new(h.project, v.id))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.queue_position, Some(1));
    assert_eq!(h.visitor(v.id).await.service_status, ServiceStatus::Queued);
}

#[tokio::test]
async fn unknown_visitor_is_not_found() {
    let h = Harness::new();
    let err = h
        .engine
        .transfer_to_staff(TransferRequest::new(h.project, Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::NotFound { entity: "visitor", .. }));
}

#[tokio::test]
async fn enqueue_twice_returns_same_entry_and_position() {
    let h = Harness::new();
    let v = h.add_visitor().await;

    let (first, first_pos) = h.engine.enqueue(h.project, v.id, "transfer").await.unwrap();
    let (second, second_pos) = h.engine.enqueue(h.project, v.id, "transfer").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first_pos, second_pos);
    assert_eq!(h.store.entries_for_visitor(v.id).await.len(), 1);
    h.assert_invariants().await;
}

#[tokio::test]
async fn enqueue_then_assign_reuses_the_entry() {
    let h = Harness::new();
    let v = h.add_visitor().await;
    let queued = h
        .engine
        .transfer_to_staff(TransferRequest::new(h.project, v.id))
        .await
        .unwrap();
    let entry_id = queued.waiting_queue.unwrap().id;

    let staff = h.add_staff("Jo").await;
    let assigned = h
        .engine
        .transfer_to_staff(TransferRequest::new(h.project, v.id))
        .await
        .unwrap();
    assert_eq!(assigned.assigned_staff_id, Some(staff.id));

    let entries = h.store.entries_for_visitor(v.id).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, entry_id);
    assert_eq!(entries[0].status, QueueStatus::Assigned);
    assert_eq!(entries[0].assigned_to, Some(staff.id));
    assert!(entries[0].assigned_at.is_some());
    h.assert_invariants().await;
}

#[tokio::test]
async fn queue_position_respects_priority() {
    let h = Harness::new();
    let t0 = Utc::now();
    let early = WaitingQueueEntry::waiting(h.project, Uuid::new_v4(), "transfer", t0);
    let mut urgent = WaitingQueueEntry::waiting(
        h.project,
        Uuid::new_v4(),
        "transfer",
        t0 + chrono::Duration::seconds(90),
    );
    urgent.priority = 5;
    h.store.insert_entry(early.clone()).await;
    h.store.insert_entry(urgent.clone()).await;

    assert_eq!(h.engine.queue_position(h.project, urgent.id).await.unwrap(), 1);
    assert_eq!(h.engine.queue_position(h.project, early.id).await.unwrap(), 2);

    let (items, total) = h.engine.list_queue(h.project, 20, 0).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(items[0].id, urgent.id);

    let err = h
        .engine
        .queue_position(h.project, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::NotFound { .. }));
}

#[tokio::test]
async fn accept_from_queue_assigns_named_staff() {
    let h = Harness::new();
    let v = h.add_visitor().await;
    let (entry, _) = h.engine.enqueue(h.project, v.id, "transfer").await.unwrap();
    h.add_staff("Other").await;
    let staff = h.add_staff("Picker").await;

    let result = h
        .engine
        .accept_from_queue(h.project, entry.id, staff.id)
        .await
        .unwrap();
    assert_eq!(result.assigned_staff_id, Some(staff.id));
    assert_eq!(h.visitor(v.id).await.assigned_staff_id, Some(staff.id));

    let again = h
        .engine
        .accept_from_queue(h.project, entry.id, staff.id)
        .await
        .unwrap_err();
    assert!(matches!(again, HandoffError::InvalidState(_)));

    let missing = h
        .engine
        .accept_from_queue(h.project, Uuid::new_v4(), staff.id)
        .await
        .unwrap_err();
    assert!(matches!(missing, HandoffError::NotFound { .. }));
    h.assert_invariants().await;
}

#[tokio::test]
async fn accept_by_paused_staff_leaves_visitor_waiting() {
    let h = Harness::new();
    let v = h.add_visitor().await;
    let (entry, _) = h.engine.enqueue(h.project, v.id, "transfer").await.unwrap();
    let paused = Staff {
        service_paused: true,
        ..h.add_staff("Paused").await
    };
    h.store.insert_staff(paused.clone()).await;

    let result = h
        .engine
        .accept_from_queue(h.project, entry.id, paused.id)
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(h.visitor(v.id).await.service_status, ServiceStatus::Queued);
    assert_eq!(
        h.store.entries_for_visitor(v.id).await[0].status,
        QueueStatus::Waiting
    );
}

#[tokio::test]
async fn leaving_the_queue_returns_visitor_to_ai() {
    let h = Harness::new();
    let v = h.add_visitor().await;
    let (entry, _) = h.engine.enqueue(h.project, v.id, "transfer").await.unwrap();

    let left = h.engine.leave_queue(h.project, entry.id).await.unwrap();
    assert_eq!(left.status, QueueStatus::Left);

    let stored = h.visitor(v.id).await;
    assert_eq!(stored.service_status, ServiceStatus::New);
    assert!(stored.ai_enabled);

    let err = h.engine.leave_queue(h.project, entry.id).await.unwrap_err();
    assert!(matches!(err, HandoffError::InvalidState(_)));

    let stats = h.engine.queue_stats(h.project).await.unwrap();
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.assigned, 0);
}

#[tokio::test]
async fn queue_bookkeeping_failure_does_not_undo_handoff() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(ScriptedQueue::new(store.clone()));
    let h = Harness::with_queue(store, queue.clone());
    let v = h.add_visitor().await;
    h.engine.enqueue(h.project, v.id, "transfer").await.unwrap();
    let staff = h.add_staff("Jo").await;
    queue.fail_assign();

    let result = h
        .engine
        .transfer_to_staff(TransferRequest::new(h.project, v.id))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.assigned_staff_id, Some(staff.id));

    let stored = h.visitor(v.id).await;
    assert_eq!(stored.service_status, ServiceStatus::Active);
    assert_eq!(stored.assigned_staff_id, Some(staff.id));
    assert!(h.sessions.is_live(v.id).await.unwrap());
    assert!(h.bus.calls().contains(&BusCall::AddSubscribers {
        channel_id: channel(v.id),
        channel_type: CUSTOMER_SERVICE_CHANNEL_TYPE,
        subscribers: vec![format!("{}-staff", staff.id)],
    }));
}

#[tokio::test]
async fn close_requires_an_active_session() {
    let h = Harness::new();
    let v = h.add_visitor().await;

    let err = h.engine.close_session(h.project, v.id, None).await.unwrap_err();
    assert!(matches!(err, HandoffError::InvalidState(_)));

    let err = h
        .engine
        .close_session(h.project, Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::NotFound { .. }));
}

#[tokio::test]
async fn close_unsubscribes_staff_and_notifies() {
    let h = Harness::new();
    let staff = h.add_staff("Jo").await;
    let v = h.add_visitor().await;
    h.engine
        .transfer_to_staff(TransferRequest::new(h.project, v.id))
        .await
        .unwrap();

    let closed = h
        .engine
        .close_session(h.project, v.id, Some(staff.id))
        .await
        .unwrap();
    assert_eq!(closed.service_status, ServiceStatus::Closed);
    assert!(closed.assigned_staff_id.is_none());
    assert!(closed.ai_enabled);
    assert_eq!(h.visitor(v.id).await, closed);
    assert!(!h.sessions.is_live(v.id).await.unwrap());

    assert!(h.bus.calls().contains(&BusCall::RemoveSubscribers {
        channel_id: channel(v.id),
        channel_type: CUSTOMER_SERVICE_CHANNEL_TYPE,
        subscribers: vec![format!("{}-staff", staff.id)],
    }));
    let sent = h.bus.sent();
    assert_eq!(sent.len(), 1);
    let BusCall::Send {
        channel_id,
        content,
        ..
    } = &sent[0]
    else {
        unreachable!()
    };
    assert_eq!(channel_id, &channel(v.id));
    assert!(content.starts_with("Jo has closed"), "{content}");
    h.assert_invariants().await;
}

#[tokio::test]
async fn bus_failure_does_not_undo_assignment() {
    let h = Harness::new();
    let staff = h.add_staff("Jo").await;
    let v = h.add_visitor().await;
    h.bus.set_failing(true);

    let result = h
        .engine
        .transfer_to_staff(TransferRequest::new(h.project, v.id))
        .await
        .unwrap();
    assert_eq!(result.assigned_staff_id, Some(staff.id));
    assert_eq!(h.visitor(v.id).await.service_status, ServiceStatus::Active);

    let closed = h.engine.close_session(h.project, v.id, None).await.unwrap();
    assert_eq!(closed.service_status, ServiceStatus::Closed);
}

#[tokio::test]
async fn explicit_ai_override_keeps_ai_on() {
    let h = Harness::new();
    h.add_staff("Jo").await;
    let v = h.add_visitor().await;

    let req = TransferRequest {
        ai_disabled: Some(false),
        ..TransferRequest::new(h.project, v.id)
    };
    h.engine.transfer_to_staff(req).await.unwrap();

    let stored = h.visitor(v.id).await;
    assert_eq!(stored.service_status, ServiceStatus::Active);
    assert!(stored.ai_enabled);
}

#[tokio::test]
async fn manual_request_short_circuits_when_already_served() {
    let h = Harness::new();
    let staff = h.add_staff("Jo").await;
    let active = h.add_visitor().await;
    h.engine
        .transfer_to_staff(TransferRequest::new(h.project, active.id))
        .await
        .unwrap();
    let calls_before = h.bus.calls().len();

    let outcome = h
        .engine
        .request_manual_service(active.id, None)
        .await
        .unwrap();
    assert_eq!(outcome.event_type, ManualServiceEventType::AlreadyTransferred);
    assert_eq!(outcome.assigned_staff_id, Some(staff.id));
    assert_eq!(h.bus.calls().len(), calls_before);

    let h = Harness::new();
    let queued = h.add_visitor().await;
    h.engine.enqueue(h.project, queued.id, "transfer").await.unwrap();
    let outcome = h
        .engine
        .request_manual_service(queued.id, None)
        .await
        .unwrap();
    assert_eq!(outcome.event_type, ManualServiceEventType::AlreadyQueued);
    assert_eq!(outcome.queue_position, Some(1));
    assert_eq!(h.store.entries_for_visitor(queued.id).await.len(), 1);
}

#[tokio::test]
async fn manual_request_transfers_and_greets() {
    let h = Harness::new();
    let staff = h.add_staff("Jo").await;
    let v = h.add_visitor().await;

    let outcome = h
        .engine
        .request_manual_service(v.id, Some("billing question".into()))
        .await
        .unwrap();
    assert_eq!(outcome.event_type, ManualServiceEventType::TransferSuccess);
    assert_eq!(outcome.assigned_staff_id, Some(staff.id));
    assert_eq!(outcome.channel_id, channel(v.id));

    let calls = h.bus.calls();
    assert_eq!(
        calls[0],
        BusCall::CreateChannel {
            channel_id: channel(v.id),
            channel_type: CUSTOMER_SERVICE_CHANNEL_TYPE,
            subscribers: vec![format!("{}-vtr", v.id)],
        }
    );
    let sent = h.bus.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], BusCall::Send { content, .. } if content.contains("Jo")));
}

#[tokio::test]
async fn manual_request_without_staff_queues_with_reason() {
    let h = Harness::new();
    let v = h.add_visitor().await;

    let outcome = h
        .engine
        .request_manual_service(v.id, Some("billing question".into()))
        .await
        .unwrap();
    assert_eq!(outcome.event_type, ManualServiceEventType::Queued);
    assert_eq!(outcome.queue_position, Some(1));
    assert!(outcome.message.contains("position 1"), "{}", outcome.message);

    let entries = h.store.entries_for_visitor(v.id).await;
    assert_eq!(entries[0].source, "billing question");
    assert_eq!(h.bus.sent().len(), 1);

    let err = h
        .engine
        .request_manual_service(Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::NotFound { .. }));
}

#[tokio::test]
async fn plain_message_stays_with_ai() {
    let h = Harness::new();
    h.add_staff("Jo").await;
    let v = h.add_visitor().await;

    let outcome = h
        .engine
        .on_visitor_message(h.project, v.id, "what are your opening hours?")
        .await
        .unwrap();
    assert_eq!(outcome.handled_by, ConversationOwner::Ai);
    assert!(outcome.manual_service.is_none());
    assert_eq!(h.visitor(v.id).await.service_status, ServiceStatus::New);
}

#[tokio::test]
async fn handover_keyword_triggers_manual_request() {
    let h = Harness::new();
    let staff = h.add_staff("Jo").await;
    let v = h.add_visitor().await;

    let outcome = h
        .engine
        .on_visitor_message(h.project, v.id, "Let me talk to a human")
        .await
        .unwrap();
    assert_eq!(outcome.handled_by, ConversationOwner::Staff);
    let manual = outcome.manual_service.unwrap();
    assert_eq!(manual.event_type, ManualServiceEventType::TransferSuccess);
    assert_eq!(h.visitor(v.id).await.assigned_staff_id, Some(staff.id));
}

#[tokio::test(start_paused = true)]
async fn visitor_messages_keep_human_session_alive() {
    let h = Harness::new();
    h.add_staff("Jo").await;
    let v = h.add_visitor().await;
    h.engine
        .transfer_to_staff(TransferRequest::new(h.project, v.id))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(4 * 60)).await;
    let outcome = h
        .engine
        .on_visitor_message(h.project, v.id, "thanks, still there?")
        .await
        .unwrap();
    assert_eq!(outcome.handled_by, ConversationOwner::Staff);

    tokio::time::advance(Duration::from_secs(3 * 60)).await;
    assert!(h.sessions.is_live(v.id).await.unwrap());

    tokio::time::advance(Duration::from_secs(3 * 60)).await;
    assert!(!h.sessions.is_live(v.id).await.unwrap());
}

#[tokio::test]
async fn concurrent_transfers_for_one_visitor_create_one_entry() {
    let h = Harness::new();
    let v = h.add_visitor().await;

    let visitor_id = v.id;
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let project = h.project;
        tasks.push(tokio::spawn(async move {
            engine
                .transfer_to_staff(TransferRequest::new(project, visitor_id))
                .await
        }));
    }
    let mut positions = Vec::new();
    for task in tasks {
        positions.push(task.await.unwrap().unwrap().queue_position);
    }

    assert!(positions.iter().all(|p| *p == Some(1)));
    assert_eq!(h.store.entries_for_visitor(v.id).await.len(), 1);
    h.assert_invariants().await;
}

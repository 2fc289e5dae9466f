use super::*;
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
const DAY: Ms = 1_767_225_600_000; // 2026-01-01T00:00Z

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roombook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn alice() -> CallerId {
    CallerId::from("alice")
}

fn bob() -> CallerId {
    CallerId::from("bob")
}

/// Engine with one office and one room in it.
async fn engine_with_room(name: &str) -> (Engine, Ulid) {
    let engine = Engine::new(test_wal_path(name)).unwrap();
    let office = engine.create_office("HQ".into(), "Berlin".into()).await.unwrap();
    let room = engine.create_room(office.id, "Everest".into(), Some(8)).await.unwrap();
    (engine, room.id)
}

async fn rooms(engine: &Engine, filter: RoomFilter) -> Vec<RoomInfo> {
    engine.list_rooms(&filter, PageRequest::default()).await.unwrap().items
}

fn offices(engine: &Engine) -> Vec<OfficeInfo> {
    engine
        .list_offices(&OfficeFilter::default(), PageRequest::default())
        .unwrap()
        .items
}

fn at(room_id: Ulid, start: Ms, end: Ms) -> BookingRequest {
    BookingRequest::new(room_id, DAY + start, DAY + end)
}

// ── Scenarios ────────────────────────────────────────────

#[tokio::test]
async fn overlapping_create_is_rejected() {
    let (engine, room) = engine_with_room("scenario_overlap.wal").await;

    let first = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();
    let result = engine.create_booking(&bob(), at(room, 10 * H + 30 * M, 11 * H + 30 * M)).await;
    match result {
        Err(EngineError::SchedulingConflict(id)) => assert_eq!(id, first.id),
        other => panic!("expected SchedulingConflict, got {other:?}"),
    }
}

#[tokio::test]
async fn adjacent_create_is_admitted() {
    let (engine, room) = engine_with_room("scenario_adjacent.wal").await;

    engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();
    engine.create_booking(&bob(), at(room, 11 * H, 12 * H)).await.unwrap();
    engine.create_booking(&bob(), at(room, 9 * H, 10 * H)).await.unwrap();
}

#[tokio::test]
async fn candidate_swallowing_existing_is_rejected() {
    let (engine, room) = engine_with_room("scenario_swallow.wal").await;

    engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();
    let result = engine.create_booking(&bob(), at(room, 9 * H, 12 * H)).await;
    assert!(matches!(result, Err(EngineError::SchedulingConflict(_))));
}

#[tokio::test]
async fn inverted_interval_is_rejected() {
    let (engine, room) = engine_with_room("scenario_inverted.wal").await;

    let result = engine.create_booking(&alice(), at(room, 11 * H, 10 * H)).await;
    assert!(matches!(result, Err(EngineError::InvalidInterval { .. })));

    let result = engine.create_booking(&alice(), at(room, 10 * H, 10 * H)).await;
    assert!(matches!(result, Err(EngineError::InvalidInterval { .. })));
}

#[tokio::test]
async fn other_caller_is_forbidden() {
    let (engine, room) = engine_with_room("scenario_forbidden.wal").await;
    let booking = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();

    assert!(matches!(
        engine.get_booking(&bob(), booking.id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.update_booking(&bob(), booking.id, at(room, 12 * H, 13 * H)).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.delete_booking(&bob(), booking.id).await,
        Err(EngineError::Forbidden(_))
    ));

    // Nothing changed.
    let still = engine.get_booking(&alice(), booking.id).await.unwrap();
    assert_eq!(still, booking);
}

#[tokio::test]
async fn update_to_missing_room_is_resource_not_found() {
    let (engine, room) = engine_with_room("scenario_missing_room.wal").await;
    let booking = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();

    let missing = Ulid::new();
    let result = engine.update_booking(&alice(), booking.id, at(missing, 10 * H, 11 * H)).await;
    match result {
        Err(EngineError::ResourceNotFound(id)) => assert_eq!(id, missing),
        other => panic!("expected ResourceNotFound, got {other:?}"),
    }
}

// ── Create ───────────────────────────────────────────────

#[tokio::test]
async fn create_in_missing_room_is_resource_not_found() {
    let engine = Engine::new(test_wal_path("create_missing_room.wal")).unwrap();
    let result = engine.create_booking(&alice(), at(Ulid::new(), 10 * H, 11 * H)).await;
    assert!(matches!(result, Err(EngineError::ResourceNotFound(_))));
}

#[tokio::test]
async fn create_checks_existence_before_ordering() {
    let engine = Engine::new(test_wal_path("create_order.wal")).unwrap();
    let result = engine.create_booking(&alice(), at(Ulid::new(), 11 * H, 10 * H)).await;
    assert!(matches!(result, Err(EngineError::ResourceNotFound(_))));
}

#[tokio::test]
async fn create_checks_ordering_before_conflict() {
    let (engine, room) = engine_with_room("create_order_conflict.wal").await;
    engine.create_booking(&alice(), at(room, 9 * H, 12 * H)).await.unwrap();

    let result = engine.create_booking(&alice(), at(room, 11 * H, 10 * H)).await;
    assert!(matches!(result, Err(EngineError::InvalidInterval { .. })));
}

#[tokio::test]
async fn create_enforces_limits() {
    let (engine, room) = engine_with_room("create_limits.wal").await;

    let too_wide = BookingRequest::new(room, DAY, DAY + MAX_SPAN_DURATION_MS + 1);
    assert!(matches!(
        engine.create_booking(&alice(), too_wide).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let too_late = BookingRequest::new(room, MAX_VALID_TIMESTAMP_MS - H, MAX_VALID_TIMESTAMP_MS + H);
    assert!(matches!(
        engine.create_booking(&alice(), too_late).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn create_returns_owner_and_ascending_ids() {
    let (engine, room) = engine_with_room("create_ids.wal").await;

    let a = engine.create_booking(&alice(), at(room, 0, H)).await.unwrap();
    let b = engine.create_booking(&bob(), at(room, H, 2 * H)).await.unwrap();
    assert_eq!(a.owner, alice());
    assert_eq!(b.owner, bob());
    assert_eq!(a.room_id, room);
    assert_eq!(a.span, Span::new(DAY, DAY + H));
    assert!(a.id < b.id);
}

#[tokio::test]
async fn rooms_do_not_conflict_with_each_other() {
    let (engine, room) = engine_with_room("two_rooms.wal").await;
    let office = engine.get_room(room).await.unwrap().office_id;
    let other = engine.create_room(office, "K2".into(), None).await.unwrap();

    engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();
    engine.create_booking(&alice(), at(other.id, 10 * H, 11 * H)).await.unwrap();
}

// ── Read / update / delete ───────────────────────────────

#[tokio::test]
async fn get_missing_booking_is_not_found() {
    let engine = Engine::new(test_wal_path("get_missing.wal")).unwrap();
    let id = Ulid::new();
    match engine.get_booking(&alice(), id).await {
        Err(EngineError::NotFound(missing)) => assert_eq!(missing, id),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn update_to_same_interval_does_not_self_conflict() {
    let (engine, room) = engine_with_room("update_same.wal").await;
    let booking = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();

    let updated = engine.update_booking(&alice(), booking.id, at(room, 10 * H, 11 * H)).await.unwrap();
    assert_eq!(updated, booking);
}

#[tokio::test]
async fn update_can_shift_over_its_own_interval() {
    let (engine, room) = engine_with_room("update_shift.wal").await;
    let booking = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();

    let updated = engine
        .update_booking(&alice(), booking.id, at(room, 10 * H + 30 * M, 11 * H + 30 * M))
        .await
        .unwrap();
    assert_eq!(updated.span, Span::new(DAY + 10 * H + 30 * M, DAY + 11 * H + 30 * M));
    assert_eq!(updated.owner, alice());

    let stored = engine.get_booking(&alice(), booking.id).await.unwrap();
    assert_eq!(stored.span, updated.span);
}

#[tokio::test]
async fn update_conflicting_with_other_booking_is_rejected() {
    let (engine, room) = engine_with_room("update_conflict.wal").await;
    let mine = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();
    let theirs = engine.create_booking(&bob(), at(room, 12 * H, 13 * H)).await.unwrap();

    let result = engine.update_booking(&alice(), mine.id, at(room, 12 * H, 14 * H)).await;
    match result {
        Err(EngineError::SchedulingConflict(id)) => assert_eq!(id, theirs.id),
        other => panic!("expected SchedulingConflict, got {other:?}"),
    }
    // Rejected update leaves the original interval in place.
    let stored = engine.get_booking(&alice(), mine.id).await.unwrap();
    assert_eq!(stored.span, mine.span);
}

#[tokio::test]
async fn update_checks_ordering_before_conflict() {
    let (engine, room) = engine_with_room("update_order.wal").await;
    let mine = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();
    engine.create_booking(&bob(), at(room, 12 * H, 13 * H)).await.unwrap();

    let result = engine.update_booking(&alice(), mine.id, at(room, 13 * H, 12 * H)).await;
    assert!(matches!(result, Err(EngineError::InvalidInterval { .. })));
}

#[tokio::test]
async fn update_missing_booking_is_not_found() {
    let (engine, room) = engine_with_room("update_missing.wal").await;
    let result = engine.update_booking(&alice(), Ulid::new(), at(room, 0, H)).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn update_moves_booking_between_rooms() {
    let (engine, room) = engine_with_room("update_move.wal").await;
    let office = engine.get_room(room).await.unwrap().office_id;
    let other = engine.create_room(office, "K2".into(), None).await.unwrap().id;

    let booking = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();
    let moved = engine.update_booking(&alice(), booking.id, at(other, 10 * H, 11 * H)).await.unwrap();
    assert_eq!(moved.room_id, other);

    // The old slot is free, the new one is taken.
    assert!(!engine.has_conflict(room, Span::new(DAY + 10 * H, DAY + 11 * H), None).await.unwrap());
    assert!(engine.has_conflict(other, Span::new(DAY + 10 * H, DAY + 11 * H), None).await.unwrap());
    assert_eq!(engine.get_booking(&alice(), booking.id).await.unwrap().room_id, other);
}

#[tokio::test]
async fn move_into_conflict_is_rejected() {
    let (engine, room) = engine_with_room("update_move_conflict.wal").await;
    let office = engine.get_room(room).await.unwrap().office_id;
    let other = engine.create_room(office, "K2".into(), None).await.unwrap().id;

    let mine = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();
    engine.create_booking(&bob(), at(other, 10 * H, 11 * H)).await.unwrap();

    let result = engine.update_booking(&alice(), mine.id, at(other, 10 * H + 30 * M, 12 * H)).await;
    assert!(matches!(result, Err(EngineError::SchedulingConflict(_))));
    assert_eq!(engine.get_booking(&alice(), mine.id).await.unwrap().room_id, room);
}

#[tokio::test]
async fn non_owner_cannot_discover_missing_rooms() {
    let (engine, room) = engine_with_room("update_forbidden_first.wal").await;
    let booking = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();

    let result = engine.update_booking(&bob(), booking.id, at(Ulid::new(), 10 * H, 11 * H)).await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));
}

#[tokio::test]
async fn delete_frees_the_slot_permanently() {
    let (engine, room) = engine_with_room("delete.wal").await;
    let booking = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();

    engine.delete_booking(&alice(), booking.id).await.unwrap();
    assert!(matches!(
        engine.get_booking(&alice(), booking.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.delete_booking(&alice(), booking.id).await,
        Err(EngineError::NotFound(_))
    ));
    engine.create_booking(&bob(), at(room, 10 * H, 11 * H)).await.unwrap();
}

#[tokio::test]
async fn has_conflict_honours_exclusion() {
    let (engine, room) = engine_with_room("has_conflict.wal").await;
    let booking = engine.create_booking(&alice(), at(room, 10 * H, 11 * H)).await.unwrap();
    let span = Span::new(DAY + 10 * H, DAY + 11 * H);

    assert!(engine.has_conflict(room, span, None).await.unwrap());
    assert!(!engine.has_conflict(room, span, Some(booking.id)).await.unwrap());
    assert!(!engine.has_conflict(room, Span::new(DAY + 11 * H, DAY + 12 * H), None).await.unwrap());
    assert!(matches!(
        engine.has_conflict(Ulid::new(), span, None).await,
        Err(EngineError::ResourceNotFound(_))
    ));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_admit_exactly_one() {
    let (engine, room) = engine_with_room("concurrent_creates.wal").await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let eng = engine.clone();
        let caller = CallerId::new(format!("user{i}"));
        handles.push(tokio::spawn(async move {
            eng.create_booking(&caller, at(room, 10 * H + i * M, 11 * H + i * M)).await
        }));
    }

    let mut admitted = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(EngineError::SchedulingConflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(conflicts, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_swaps_between_rooms_do_not_deadlock() {
    let (engine, a) = engine_with_room("concurrent_swaps.wal").await;
    let office = engine.get_room(a).await.unwrap().office_id;
    let b = engine.create_room(office, "K2".into(), None).await.unwrap().id;
    let engine = Arc::new(engine);

    let in_a = engine.create_booking(&alice(), at(a, 0, H)).await.unwrap();
    let in_b = engine.create_booking(&bob(), at(b, 2 * H, 3 * H)).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let eng = engine.clone();
        let (caller, id, target) = if i % 2 == 0 {
            (alice(), in_a.id, if i % 4 == 0 { b } else { a })
        } else {
            (bob(), in_b.id, if i % 4 == 1 { a } else { b })
        };
        let start = if i % 2 == 0 { 0 } else { 2 * H };
        handles.push(tokio::spawn(async move {
            eng.update_booking(&caller, id, at(target, start, start + H)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.index.len(), 2);
}

// ── Listing ──────────────────────────────────────────────

#[tokio::test]
async fn list_is_scoped_to_caller_and_ordered() {
    let (engine, room) = engine_with_room("list_scope.wal").await;

    let a1 = engine.create_booking(&alice(), at(room, 5 * H, 6 * H)).await.unwrap();
    engine.create_booking(&bob(), at(room, 0, H)).await.unwrap();
    let a2 = engine.create_booking(&alice(), at(room, 2 * H, 3 * H)).await.unwrap();

    let page = engine
        .list_bookings(&alice(), &BookingFilter::default(), PageRequest::default())
        .await
        .unwrap();
    let ids: Vec<Ulid> = page.items.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![a1.id, a2.id]);
    assert_eq!(page.total, 2);
    assert!(page.items.iter().all(|b| b.owner == alice()));
}

#[tokio::test]
async fn list_user_filter_never_widens_scope() {
    let (engine, room) = engine_with_room("list_user_filter.wal").await;
    engine.create_booking(&alice(), at(room, 0, H)).await.unwrap();
    engine.create_booking(&bob(), at(room, H, 2 * H)).await.unwrap();

    let filter = BookingFilter {
        user_id: Some(bob()),
        ..Default::default()
    };
    let page = engine.list_bookings(&alice(), &filter, PageRequest::default()).await.unwrap();
    assert!(page.items.is_empty());
    assert_eq!(page.total, 0);

    let filter = BookingFilter {
        user_id: Some(alice()),
        ..Default::default()
    };
    let page = engine.list_bookings(&alice(), &filter, PageRequest::default()).await.unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn list_filters_by_room_and_window() {
    let (engine, room) = engine_with_room("list_filters.wal").await;
    let office = engine.get_room(room).await.unwrap().office_id;
    let other = engine.create_room(office, "K2".into(), None).await.unwrap().id;

    let early = engine.create_booking(&alice(), at(room, 8 * H, 9 * H)).await.unwrap();
    let late = engine.create_booking(&alice(), at(room, 15 * H, 16 * H)).await.unwrap();
    let elsewhere = engine.create_booking(&alice(), at(other, 8 * H, 9 * H)).await.unwrap();

    let by_room = BookingFilter {
        room_id: Some(other),
        ..Default::default()
    };
    let page = engine.list_bookings(&alice(), &by_room, PageRequest::default()).await.unwrap();
    assert_eq!(page.items.iter().map(|b| b.id).collect::<Vec<_>>(), vec![elsewhere.id]);

    let afternoon = BookingFilter {
        start_from: Some(DAY + 12 * H),
        ..Default::default()
    };
    let page = engine.list_bookings(&alice(), &afternoon, PageRequest::default()).await.unwrap();
    assert_eq!(page.items.iter().map(|b| b.id).collect::<Vec<_>>(), vec![late.id]);

    // end_until is inclusive.
    let morning = BookingFilter {
        room_id: Some(room),
        end_until: Some(DAY + 9 * H),
        ..Default::default()
    };
    let page = engine.list_bookings(&alice(), &morning, PageRequest::default()).await.unwrap();
    assert_eq!(page.items.iter().map(|b| b.id).collect::<Vec<_>>(), vec![early.id]);
}

#[tokio::test]
async fn list_paginates_with_stable_order() {
    let (engine, room) = engine_with_room("list_pages.wal").await;
    let mut ids = Vec::new();
    for i in 0..7 {
        ids.push(engine.create_booking(&alice(), at(room, i * H, i * H + 30 * M)).await.unwrap().id);
    }

    let mut seen = Vec::new();
    for offset in (0..7).step_by(3) {
        let page = engine
            .list_bookings(&alice(), &BookingFilter::default(), PageRequest { limit: 3, offset })
            .await
            .unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.limit, 3);
        assert_eq!(page.offset, offset);
        seen.extend(page.items.into_iter().map(|b| b.id));
    }
    assert_eq!(seen, ids);

    let past_end = engine
        .list_bookings(&alice(), &BookingFilter::default(), PageRequest { limit: 3, offset: 10 })
        .await
        .unwrap();
    assert!(past_end.items.is_empty());
    assert_eq!(past_end.total, 7);
}

#[tokio::test]
async fn list_rejects_oversized_page() {
    let engine = Engine::new(test_wal_path("list_page_limit.wal")).unwrap();
    let result = engine
        .list_bookings(
            &alice(),
            &BookingFilter::default(),
            PageRequest {
                limit: MAX_PAGE_SIZE + 1,
                offset: 0,
            },
        )
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

// ── Registry ─────────────────────────────────────────────

#[tokio::test]
async fn room_requires_existing_office() {
    let engine = Engine::new(test_wal_path("room_office.wal")).unwrap();
    let result = engine.create_room(Ulid::new(), "Orphan".into(), None).await;
    assert!(matches!(result, Err(EngineError::ResourceNotFound(_))));
    assert!(rooms(&engine, RoomFilter::default()).await.is_empty());
}

#[tokio::test]
async fn rooms_listed_with_filters() {
    let engine = Engine::new(test_wal_path("room_filters.wal")).unwrap();
    let hq = engine.create_office("HQ".into(), "Berlin".into()).await.unwrap();
    let branch = engine.create_office("Branch".into(), "Lisbon".into()).await.unwrap();
    let r1 = engine.create_room(hq.id, "Everest".into(), Some(8)).await.unwrap();
    let r2 = engine.create_room(hq.id, "K2".into(), Some(4)).await.unwrap();
    let r3 = engine.create_room(branch.id, "Tejo".into(), Some(8)).await.unwrap();

    let all = rooms(&engine, RoomFilter::default()).await;
    assert_eq!(all, vec![r1.clone(), r2.clone(), r3.clone()]);

    let in_hq = rooms(
        &engine,
        RoomFilter {
            office_id: Some(hq.id),
            capacity: None,
        },
    )
    .await;
    assert_eq!(in_hq, vec![r1.clone(), r2]);

    let eight_seats = rooms(
        &engine,
        RoomFilter {
            office_id: None,
            capacity: Some(8),
        },
    )
    .await;
    assert_eq!(eight_seats, vec![r1, r3]);

    assert_eq!(offices(&engine), vec![hq, branch]);
}

#[tokio::test]
async fn offices_filtered_by_location() {
    let engine = Engine::new(test_wal_path("office_filter.wal")).unwrap();
    let mitte = engine.create_office("HQ".into(), "Berlin Mitte".into()).await.unwrap();
    engine.create_office("Branch".into(), "Lisbon".into()).await.unwrap();
    let kreuzberg = engine.create_office("Lab".into(), "berlin-Kreuzberg".into()).await.unwrap();

    let filter = OfficeFilter { location: Some("BERLIN".into()) };
    let page = engine.list_offices(&filter, PageRequest::default()).unwrap();
    assert_eq!(page.items, vec![mitte, kreuzberg]);
    assert_eq!(page.total, 2);
}

#[tokio::test]
async fn registry_listings_are_paged() {
    let engine = Engine::new(test_wal_path("registry_pages.wal")).unwrap();
    let mut all_offices = Vec::new();
    for i in 0..5 {
        all_offices.push(engine.create_office(format!("O{i}"), "Berlin".into()).await.unwrap());
    }
    let office = all_offices[0].id;
    let mut all_rooms = Vec::new();
    for i in 0..5 {
        all_rooms.push(engine.create_room(office, format!("R{i}"), None).await.unwrap());
    }

    let page = engine
        .list_offices(&OfficeFilter::default(), PageRequest { limit: 2, offset: 1 })
        .unwrap();
    assert_eq!(page.items, all_offices[1..3].to_vec());
    assert_eq!(page.total, 5);

    let page = engine
        .list_rooms(&RoomFilter::default(), PageRequest { limit: 2, offset: 4 })
        .await
        .unwrap();
    assert_eq!(page.items, all_rooms[4..].to_vec());
    assert_eq!(page.total, 5);

    let oversized = PageRequest { limit: MAX_PAGE_SIZE + 1, offset: 0 };
    assert!(matches!(
        engine.list_offices(&OfficeFilter::default(), oversized),
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.list_rooms(&RoomFilter::default(), oversized).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn update_office_replaces_fields_and_keeps_rooms() {
    let (engine, room) = engine_with_room("office_update.wal").await;
    let office = engine.get_room(room).await.unwrap().office_id;

    let updated = engine
        .update_office(office, "Headquarters".into(), "Berlin Mitte".into())
        .await
        .unwrap();
    assert_eq!(updated.name, "Headquarters");
    assert_eq!(updated.location, "Berlin Mitte");
    assert_eq!(engine.get_office(office).unwrap(), updated);
    assert_eq!(engine.get_room(room).await.unwrap().office_id, office);

    assert!(matches!(
        engine.update_office(Ulid::new(), "X".into(), "Y".into()).await,
        Err(EngineError::ResourceNotFound(_))
    ));
    assert!(matches!(
        engine.update_office(office, "X".into(), "y".repeat(MAX_LOCATION_LEN + 1)).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert_eq!(engine.get_office(office).unwrap(), updated);
}

#[tokio::test]
async fn has_conflict_on_room_retired_while_waiting() {
    let (engine, room) = engine_with_room("conflict_retired.wal").await;
    let engine = Arc::new(engine);
    let mut guard = engine.room_state(&room).unwrap().write_owned().await;

    let reader = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.has_conflict(room, Span::new(DAY, DAY + H), None).await })
    };
    // Let the reader resolve the room and park on its lock.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    engine.detach_room(&mut guard);
    drop(guard);

    assert!(matches!(reader.await.unwrap(), Err(EngineError::ResourceNotFound(_))));
}

#[tokio::test]
async fn update_room_moves_it_between_offices() {
    let engine = Engine::new(test_wal_path("room_update.wal")).unwrap();
    let hq = engine.create_office("HQ".into(), "Berlin".into()).await.unwrap();
    let branch = engine.create_office("Branch".into(), "Lisbon".into()).await.unwrap();
    let room = engine.create_room(hq.id, "Everest".into(), Some(8)).await.unwrap();

    let updated = engine.update_room(room.id, branch.id, "Tejo".into(), None).await.unwrap();
    assert_eq!(updated.office_id, branch.id);
    assert_eq!(updated.name, "Tejo");
    assert_eq!(updated.capacity, None);
    assert_eq!(engine.get_room(room.id).await.unwrap(), updated);

    // Deleting the old office no longer touches the room.
    engine.delete_office(hq.id).await.unwrap();
    assert!(engine.room_exists(&room.id));

    assert!(matches!(
        engine.update_room(room.id, Ulid::new(), "X".into(), None).await,
        Err(EngineError::ResourceNotFound(_))
    ));
}

#[tokio::test]
async fn delete_room_cascades_bookings() {
    let (engine, room) = engine_with_room("room_cascade.wal").await;
    let a = engine.create_booking(&alice(), at(room, 0, H)).await.unwrap();
    let b = engine.create_booking(&bob(), at(room, H, 2 * H)).await.unwrap();

    engine.delete_room(room).await.unwrap();
    assert!(!engine.room_exists(&room));
    assert!(matches!(engine.get_room(room).await, Err(EngineError::ResourceNotFound(_))));
    assert!(matches!(engine.get_booking(&alice(), a.id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.get_booking(&bob(), b.id).await, Err(EngineError::NotFound(_))));
    assert_eq!(engine.index.len(), 0);

    let page = engine
        .list_bookings(&alice(), &BookingFilter::default(), PageRequest::default())
        .await
        .unwrap();
    assert!(page.items.is_empty());

    assert!(matches!(
        engine.create_booking(&alice(), at(room, 0, H)).await,
        Err(EngineError::ResourceNotFound(_))
    ));
}

#[tokio::test]
async fn delete_office_cascades_rooms_and_bookings() {
    let (engine, room) = engine_with_room("office_cascade.wal").await;
    let office = engine.get_room(room).await.unwrap().office_id;
    let second = engine.create_room(office, "K2".into(), None).await.unwrap().id;
    engine.create_booking(&alice(), at(room, 0, H)).await.unwrap();
    engine.create_booking(&alice(), at(second, 0, H)).await.unwrap();

    engine.delete_office(office).await.unwrap();
    assert!(offices(&engine).is_empty());
    assert!(rooms(&engine, RoomFilter::default()).await.is_empty());
    assert_eq!(engine.index.len(), 0);
    assert!(matches!(
        engine.delete_office(office).await,
        Err(EngineError::ResourceNotFound(_))
    ));
}

#[tokio::test]
async fn registry_enforces_name_limits() {
    let engine = Engine::new(test_wal_path("registry_limits.wal")).unwrap();
    let long = "x".repeat(MAX_NAME_LEN + 1);
    assert!(matches!(
        engine.create_office(long.clone(), "Berlin".into()).await,
        Err(EngineError::LimitExceeded(_))
    ));
    let hq = engine.create_office("HQ".into(), "Berlin".into()).await.unwrap();
    assert!(matches!(
        engine.create_room(hq.id, long, None).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── WAL replay ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");

    let (office, kept_room, moved, kept);
    {
        let engine = Engine::new(path.clone()).unwrap();
        let created = engine.create_office("HQ".into(), "Berlin".into()).await.unwrap();
        office = engine
            .update_office(created.id, "Headquarters".into(), "Berlin Mitte".into())
            .await
            .unwrap();
        let doomed_office = engine.create_office("Old".into(), "Bonn".into()).await.unwrap();
        let doomed_room = engine.create_room(doomed_office.id, "Attic".into(), None).await.unwrap();
        kept_room = engine.create_room(office.id, "Everest".into(), Some(8)).await.unwrap();
        let other = engine.create_room(office.id, "K2".into(), None).await.unwrap();

        kept = engine.create_booking(&alice(), at(kept_room.id, 0, H)).await.unwrap();
        let cancelled = engine.create_booking(&alice(), at(kept_room.id, H, 2 * H)).await.unwrap();
        engine.delete_booking(&alice(), cancelled.id).await.unwrap();

        let m = engine.create_booking(&bob(), at(other.id, 3 * H, 4 * H)).await.unwrap();
        moved = engine.update_booking(&bob(), m.id, at(kept_room.id, 5 * H, 6 * H)).await.unwrap();

        engine.create_booking(&bob(), at(doomed_room.id, 0, H)).await.unwrap();
        engine.delete_room(other.id).await.unwrap();
        engine.delete_office(doomed_office.id).await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    assert_eq!(offices(&engine), vec![office]);
    assert_eq!(rooms(&engine, RoomFilter::default()).await, vec![kept_room.clone()]);
    assert_eq!(engine.get_booking(&alice(), kept.id).await.unwrap(), kept);
    assert_eq!(engine.get_booking(&bob(), moved.id).await.unwrap(), moved);
    assert_eq!(engine.index.len(), 2);

    // Replayed reservations still block their slots.
    assert!(matches!(
        engine.create_booking(&alice(), at(kept_room.id, 5 * H + 30 * M, 7 * H)).await,
        Err(EngineError::SchedulingConflict(_))
    ));
}

// ── WAL compaction ───────────────────────────────────────

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let (engine, room) = {
        let engine = Engine::new(path.clone()).unwrap();
        let office = engine.create_office("HQ".into(), "Berlin".into()).await.unwrap();
        let room = engine.create_room(office.id, "Everest".into(), Some(8)).await.unwrap();
        (engine, room.id)
    };

    // Churn.
    for i in 0..20 {
        let b = engine.create_booking(&alice(), at(room, i * H, i * H + M)).await.unwrap();
        engine.delete_booking(&alice(), b.id).await.unwrap();
    }
    let kept = engine.create_booking(&alice(), at(room, 9 * H, 10 * H)).await.unwrap();

    let size_before = std::fs::metadata(&path).unwrap().len();
    engine.compact_wal().await.unwrap();
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before, "compacted WAL ({size_after}) should be smaller than original ({size_before})");
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    assert_eq!(engine.get_booking(&alice(), kept.id).await.unwrap(), kept);
    engine.create_booking(&bob(), at(room, 10 * H, 11 * H)).await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 1);
}

#[tokio::test]
async fn compact_wal_survives_restart() {
    let path = test_wal_path("compact_restart.wal");
    let (room, kept, after);
    {
        let engine = Engine::new(path.clone()).unwrap();
        let office = engine.create_office("HQ".into(), "Berlin".into()).await.unwrap();
        engine.update_office(office.id, "HQ".into(), "Bonn".into()).await.unwrap();
        room = engine.create_room(office.id, "Everest".into(), Some(8)).await.unwrap();
        kept = engine.create_booking(&alice(), at(room.id, 9 * H, 10 * H)).await.unwrap();
        for _ in 0..10 {
            let b = engine.create_booking(&bob(), at(room.id, 0, H)).await.unwrap();
            engine.delete_booking(&bob(), b.id).await.unwrap();
        }

        engine.compact_wal().await.unwrap();
        after = engine.create_booking(&bob(), at(room.id, 12 * H, 13 * H)).await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.get_room(room.id).await.unwrap(), room);
    assert_eq!(engine.get_office(room.office_id).unwrap().location, "Bonn");
    assert_eq!(engine.get_booking(&alice(), kept.id).await.unwrap(), kept);
    assert_eq!(engine.get_booking(&bob(), after.id).await.unwrap(), after);
    assert_eq!(engine.index.len(), 2);
}

// ── Group-commit WAL ─────────────────────────────────────

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());
    let office = engine.create_office("HQ".into(), "Berlin".into()).await.unwrap();

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        let office_id = office.id;
        handles.push(tokio::spawn(async move {
            eng.create_room(office_id, format!("R{i}"), None).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(rooms(&engine, RoomFilter::default()).await.len(), n);

    drop(engine);
    let engine = Engine::new(path).unwrap();
    assert_eq!(rooms(&engine, RoomFilter::default()).await.len(), n);
}

#[tokio::test]
async fn wal_writer_gone_surfaces_error() {
    let (engine, room) = engine_with_room("writer_gone.wal").await;
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let engine = Engine { wal_tx: tx, ..engine };

    let result = engine.create_booking(&alice(), at(room, 0, H)).await;
    assert!(matches!(result, Err(EngineError::WalError(_))));
    // A failed append never becomes visible.
    assert!(!engine.has_conflict(room, Span::new(DAY, DAY + H), None).await.unwrap());
}

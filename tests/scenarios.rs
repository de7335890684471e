use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;
use ulid::Ulid;

use allot::admission::{AdmissionController, BatchOutcome, LimiterConfig};
use allot::config::CoordinatorSettings;
use allot::coordinator::{Coordinator, CoordinatorError, PremiumPricing, StandardPricing};
use allot::gate::ReservationGate;
use allot::locker::{LockerBank, LockerError};
use allot::model::{Event, Resource, ResourceStatus, SizeClass};
use allot::registry::ResourceRegistry;

// ── Test infrastructure ──────────────────────────────────────

fn start_coordinator() -> (Arc<ResourceRegistry>, Arc<Coordinator>) {
    let registry = Arc::new(ResourceRegistry::default());
    let settings = CoordinatorSettings {
        reaper_idle: Duration::from_millis(50),
        ..CoordinatorSettings::default()
    };
    let coordinator = Coordinator::start(registry.clone(), settings);
    (registry, coordinator)
}

fn admission() -> AdmissionController {
    let c = AdmissionController::from_config(&LimiterConfig::TokenBucket {
        capacity: 5,
        refill_per_sec: 2.0,
    })
    .unwrap();
    c.register_endpoint(
        "/api/login",
        &LimiterConfig::FixedWindow {
            max_requests: 3,
            window_ms: 1000,
        },
    )
    .unwrap();
    c.register_endpoint(
        "/api/search",
        &LimiterConfig::SlidingWindowLog {
            max_requests: 5,
            window_ms: 2000,
        },
    )
    .unwrap();
    c
}

/// Seats A1..A{n} of a new show.
fn show(registry: &ResourceRegistry, name: &str, n: usize) -> (Ulid, Vec<Ulid>) {
    let gid = registry.add_group(Some(name.into()));
    let seats = (1..=n)
        .map(|i| registry.add(Resource::new(100.0).named(format!("A{i}")).in_group(gid)).unwrap())
        .collect();
    (gid, seats)
}

async fn status(registry: &ResourceRegistry, id: Ulid) -> ResourceStatus {
    registry.get(&id).await.unwrap().status
}

/// Wait for an event with timeout.
async fn recv_event(rx: &mut broadcast::Receiver<Event>, timeout: Duration) -> Option<Event> {
    tokio::time::timeout(timeout, rx.recv()).await.ok()?.ok()
}

// ── Coordinator ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_group_bookings_have_one_winner() {
    let (registry, coordinator) = start_coordinator();
    let (gid, seats) = show(&registry, "Avengers", 10);
    let wanted = [seats[0], seats[1]];

    let attempts = (0..5).map(|i| {
        let coordinator = coordinator.clone();
        async move {
            coordinator
                .book_group(gid, &format!("user-{i}"), &wanted, &StandardPricing)
                .await
                .unwrap()
        }
    });
    let results: Vec<_> = join_all(attempts.map(tokio::spawn))
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let winners: Vec<_> = results.iter().filter(|r| r.is_granted()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(results.len() - winners.len(), 4);
    for id in wanted {
        assert_eq!(status(&registry, id).await, ResourceStatus::Booked);
    }
    assert_eq!(registry.available_in_group(&gid).await.len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_groups_book_in_parallel() {
    let (registry, coordinator) = start_coordinator();
    let (g1, s1) = show(&registry, "Avengers", 4);
    let (g2, s2) = show(&registry, "Dune", 4);

    let (a, b) = tokio::join!(
        coordinator.book_group(g1, "alice", &s1[..2], &StandardPricing),
        coordinator.book_group(g2, "bob", &s2[..2], &PremiumPricing),
    );
    let a = a.unwrap().granted().unwrap();
    let b = b.unwrap().granted().unwrap();
    assert_eq!(a.total, 200.0);
    assert_eq!(b.total, 400.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn held_locks_block_only_their_own_resources() {
    let registry = Arc::new(ResourceRegistry::default());
    let settings = CoordinatorSettings {
        lock_wait: Duration::from_millis(500),
        reaper_idle: Duration::from_millis(50),
        ..CoordinatorSettings::default()
    };
    let coordinator = Coordinator::start(registry.clone(), settings);
    let (g1, _s1) = show(&registry, "Avengers", 4);
    let (g2, s2) = show(&registry, "Dune", 4);
    let a = registry.add(Resource::new(10.0)).unwrap();
    let b = registry.add(Resource::new(10.0)).unwrap();

    // Show 1 is mid-booking: its group lock is taken and stays taken.
    let _show1 = registry.group_lock(&g1).unwrap().lock_owned().await;
    let started = Instant::now();
    let booked = coordinator
        .book_group(g2, "bob", &s2[..2], &StandardPricing)
        .await
        .unwrap();
    let waited = started.elapsed();
    assert!(booked.is_granted(), "{booked:?}");
    assert!(waited < Duration::from_millis(50), "show 2 waited {waited:?}");

    // Resource A is locked; B is not affected.
    let _a = registry.handle(&a).unwrap().write_owned().await;
    let started = Instant::now();
    let held = coordinator
        .reserve(b, "carol", Duration::from_secs(60), &StandardPricing)
        .await
        .unwrap();
    let waited = started.elapsed();
    assert!(held.is_granted(), "{held:?}");
    assert!(waited < Duration::from_millis(50), "B waited {waited:?}");

    // A itself does wait out the full lock wait.
    let started = Instant::now();
    let denied = coordinator
        .reserve(a, "dave", Duration::from_secs(60), &StandardPricing)
        .await
        .unwrap();
    assert!(!denied.is_granted());
    assert!(started.elapsed() >= Duration::from_millis(450));
}

#[tokio::test]
async fn release_without_reservation_is_rejected() {
    let (registry, coordinator) = start_coordinator();
    let rid = registry.add(Resource::new(50.0)).unwrap();

    let err = coordinator.cancel(rid, "alice").await.unwrap_err();
    assert!(err.is_invalid_state(), "{err}");
    assert_eq!(status(&registry, rid).await, ResourceStatus::Available);

    assert!(matches!(
        coordinator.cancel(Ulid::new(), "alice").await,
        Err(CoordinatorError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_hold_frees_resource_for_next_holder() {
    let (registry, coordinator) = start_coordinator();
    let rid = registry.add(Resource::new(50.0)).unwrap();
    let mut rx = coordinator.notify().subscribe(rid);

    let hold = coordinator
        .reserve(rid, "alice", Duration::from_millis(80), &StandardPricing)
        .await
        .unwrap()
        .granted()
        .unwrap();
    assert!(matches!(
        recv_event(&mut rx, Duration::from_secs(1)).await,
        Some(Event::HoldPlaced { .. })
    ));

    // The reaper reverts the hold without any further calls.
    match recv_event(&mut rx, Duration::from_secs(2)).await {
        Some(Event::HoldExpired {
            holder, generation, ..
        }) => {
            assert_eq!(holder, "alice");
            assert_eq!(generation, hold.generation);
        }
        other => panic!("expected HoldExpired, got {other:?}"),
    }
    assert_eq!(status(&registry, rid).await, ResourceStatus::Available);

    let next = coordinator
        .reserve(rid, "bob", Duration::from_secs(60), &StandardPricing)
        .await
        .unwrap()
        .granted()
        .unwrap();
    assert_eq!(next.holder, "bob");
    assert!(next.generation > hold.generation);

    // Too late to confirm the lapsed hold.
    assert!(coordinator.confirm(rid, "alice").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn confirmed_hold_outlives_its_deadline() {
    let (registry, coordinator) = start_coordinator();
    let rid = registry.add(Resource::new(50.0)).unwrap();

    coordinator
        .reserve(rid, "alice", Duration::from_millis(50), &StandardPricing)
        .await
        .unwrap();
    coordinator.confirm(rid, "alice").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(status(&registry, rid).await, ResourceStatus::Booked);
    assert_eq!(coordinator.sweep_expired().await, 0);
}

// ── Admission ────────────────────────────────────────────────

#[tokio::test]
async fn fixed_window_resets_after_window() {
    let c = admission();
    assert_eq!(
        c.batch_allow("/api/login", "client-B", 6),
        BatchOutcome { allowed: 3, denied: 3 }
    );
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(c.batch_allow("/api/login", "client-B", 4).allowed, 3);
}

#[tokio::test]
async fn token_bucket_refills_over_time() {
    let c = admission();
    assert_eq!(
        c.batch_allow("/api/default", "client-A", 8),
        BatchOutcome { allowed: 5, denied: 3 }
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    let refilled = c.batch_allow("/api/default", "client-A", 3).allowed;
    assert!((1..=3).contains(&refilled), "refilled {refilled}");
}

#[tokio::test]
async fn sliding_log_caps_burst() {
    let c = admission();
    assert_eq!(c.batch_allow("/api/search", "client-C", 7).allowed, 5);
    assert_eq!(c.stats("/api/search", "client-C"), "entries=5/5");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clients_are_limited_independently() {
    let c = Arc::new(admission());
    c.register_endpoint(
        "/api/isolated",
        &LimiterConfig::FixedWindow {
            max_requests: 3,
            window_ms: 5000,
        },
    )
    .unwrap();

    let tasks = (0..5).map(|client| {
        let c = c.clone();
        tokio::spawn(async move {
            c.batch_allow("/api/isolated", &format!("isolated-{client}"), 4)
                .allowed
        })
    });
    let allowed: u32 = join_all(tasks).await.into_iter().map(|r| r.unwrap()).sum();
    assert_eq!(allowed, 15);
}

// ── Gate ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gate_throttles_a_hammering_holder() {
    let (registry, coordinator) = start_coordinator();
    let (_gid, seats) = show(&registry, "Matinee", 10);
    let gate = ReservationGate::new(Arc::new(admission()), coordinator);

    let mut granted = 0;
    let mut throttled = 0;
    for seat in &seats {
        let r = gate
            .reserve("/api/login", *seat, "greedy", Duration::from_secs(60), &StandardPricing)
            .await
            .unwrap();
        if r.is_granted() {
            granted += 1;
        } else {
            throttled += 1;
        }
    }
    assert_eq!((granted, throttled), (3, 7));
    assert_eq!(
        registry.list_by_status(ResourceStatus::Reserved).await.len(),
        3
    );
}

// ── Locker ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unclaimed_parcel_frees_its_compartment() {
    let (registry, coordinator) = start_coordinator();
    let bank = LockerBank::with_code_ttl(coordinator, "LOCKER-7", Duration::from_millis(80));
    let small = bank.add_compartment(SizeClass::Small).unwrap();
    let mut rx = registry.notify().subscribe(small);

    let first = bank.deposit("parcel-1", SizeClass::Small).await.unwrap();
    assert_eq!(first.compartment_id, small);
    assert!(matches!(
        recv_event(&mut rx, Duration::from_secs(1)).await,
        Some(Event::HoldPlaced { .. })
    ));

    match recv_event(&mut rx, Duration::from_secs(2)).await {
        Some(Event::HoldExpired { holder, .. }) => assert_eq!(holder, "parcel-1"),
        other => panic!("expected HoldExpired, got {other:?}"),
    }
    assert_eq!(bank.pickup(&first.code).await, Err(LockerError::CodeExpired));

    let second = bank.deposit("parcel-2", SizeClass::Small).await.unwrap();
    assert_eq!(second.compartment_id, small);
    assert_eq!(bank.pickup(&second.code).await.unwrap().parcel_id, "parcel-2");
}

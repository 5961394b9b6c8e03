use super::*;
use super::schedule::{check_window_fits, find_open_window};
use super::time::{normalize, parse_clock, parse_zone, validate_instant, LocalStamp};
use crate::limits::*;

use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, TimeZone};

fn clock(s: &str) -> NaiveTime {
    parse_clock(s).unwrap()
}

/// UTC instant (ms) for a wall-clock time in the given zone.
fn at(zone: &str, y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
    let tz = parse_zone(zone).unwrap();
    tz.with_ymd_and_hms(y, mo, d, h, mi, 0)
        .unwrap()
        .timestamp_millis()
}

/// Madrid wall-clock in the first week of June 2025. Day 2 is a Monday,
/// day 7 a Saturday, day 8 a Sunday. No DST transition anywhere near.
fn madrid(day: u32, h: u32, mi: u32) -> Ms {
    at("Europe/Madrid", 2025, 6, day, h, mi)
}

fn window(weekday: u8, from: &str, to: &str) -> ScheduleWindow {
    ScheduleWindow {
        id: Ulid::new(),
        weekday,
        from: clock(from),
        to: clock(to),
    }
}

fn stamp(weekday: u8, day: u32, time: &str) -> LocalStamp {
    LocalStamp {
        weekday,
        date: NaiveDate::from_ymd_opt(2025, 6, day).unwrap(),
        time: clock(time),
    }
}

// ── Async engine fixtures ────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("turnos_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Salon {
    business: Ulid,
    owner: Ulid,
    service: Ulid,
    employee: Ulid,
    client: Ulid,
}

/// One business in Europe/Madrid, open Monday-Friday 09:00-17:00, with a
/// 60-minute service at 15.00 EUR, one employee and one client.
async fn seed_salon(engine: &Engine) -> Salon {
    let owner = Ulid::new();
    engine
        .register_user(owner, "Marta".into(), Role::Admin, None)
        .await
        .unwrap();
    let business = Ulid::new();
    engine
        .create_business(business, Some(owner), "Corte y Cañas".into(), "Europe/Madrid")
        .await
        .unwrap();
    for weekday in 1..=5 {
        engine
            .add_schedule(Ulid::new(), business, weekday, "09:00", "17:00")
            .await
            .unwrap();
    }
    let service = Ulid::new();
    engine
        .create_service(service, business, "Corte".into(), 60, 1_500)
        .await
        .unwrap();
    let employee = Ulid::new();
    engine
        .register_user(employee, "Iker".into(), Role::Employee, Some(business))
        .await
        .unwrap();
    let client = Ulid::new();
    engine
        .register_user(client, "Nuria".into(), Role::Client, None)
        .await
        .unwrap();
    Salon { business, owner, service, employee, client }
}

async fn hire(engine: &Engine, business: Ulid, name: &str) -> Ulid {
    let id = Ulid::new();
    engine
        .register_user(id, name.into(), Role::Employee, Some(business))
        .await
        .unwrap();
    id
}

async fn new_client(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    engine
        .register_user(id, name.into(), Role::Client, None)
        .await
        .unwrap();
    id
}

fn request(salon: &Salon, start: Ms) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        service_id: salon.service,
        business_id: salon.business,
        start,
        employee_id: None,
        client_id: Some(salon.client),
        timezone: None,
        price: None,
    }
}

fn as_client(salon: &Salon) -> Actor {
    Actor { id: salon.client, role: Role::Client }
}

fn as_employee(salon: &Salon) -> Actor {
    Actor { id: salon.employee, role: Role::Employee }
}

fn as_owner(salon: &Salon) -> Actor {
    Actor { id: salon.owner, role: Role::Admin }
}

// ══════════════════════════════════════════════════════════════
// Time normalization
// ══════════════════════════════════════════════════════════════

#[test]
fn normalize_reports_local_weekday_and_time() {
    let tz = parse_zone("Europe/Madrid").unwrap();
    let local = normalize(madrid(2, 10, 30), tz).unwrap();
    assert_eq!(local.weekday, 1); // Monday
    assert_eq!(local.date, NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
    assert_eq!(local.time, clock("10:30"));
}

#[test]
fn same_instant_lands_on_different_weekdays_per_zone() {
    // Monday 08:30 in Tokyo is still Sunday afternoon in Los Angeles.
    let instant = at("Asia/Tokyo", 2025, 6, 2, 8, 30);
    let tokyo = normalize(instant, parse_zone("Asia/Tokyo").unwrap()).unwrap();
    let la = normalize(instant, parse_zone("America/Los_Angeles").unwrap()).unwrap();
    assert_eq!(tokyo.weekday, 1);
    assert_eq!(la.weekday, 0);
    assert_eq!(la.time, clock("16:30"));
}

#[test]
fn instants_outside_supported_range_rejected() {
    assert!(validate_instant(madrid(2, 10, 0)).is_ok());
    assert!(matches!(
        validate_instant(MIN_VALID_TIMESTAMP_MS - 1),
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        validate_instant(MAX_VALID_TIMESTAMP_MS + 1),
        Err(EngineError::InvalidInput(_))
    ));
}

#[test]
fn zone_and_clock_parsing() {
    assert!(parse_zone("Europe/Madrid").is_ok());
    assert!(matches!(
        parse_zone("Mars/Olympus_Mons"),
        Err(EngineError::InvalidInput(_))
    ));
    let long = "A".repeat(MAX_TIMEZONE_LEN + 1);
    assert!(matches!(
        parse_zone(&long),
        Err(EngineError::LimitExceeded(_))
    ));

    assert_eq!(clock("09:05"), NaiveTime::from_hms_opt(9, 5, 0).unwrap());
    assert!(matches!(parse_clock("9am"), Err(EngineError::InvalidInput(_))));
    assert!(matches!(parse_clock("25:00"), Err(EngineError::InvalidInput(_))));
}

// ══════════════════════════════════════════════════════════════
// Schedule windows
// ══════════════════════════════════════════════════════════════

#[test]
fn no_window_on_weekday_means_closed() {
    let windows = vec![window(1, "09:00", "17:00")];
    let result = find_open_window(&windows, &stamp(6, 7, "10:00"), &stamp(6, 7, "11:00"));
    assert!(matches!(
        result,
        Err(EngineError::BusinessClosed { weekday: 6, .. })
    ));
}

#[test]
fn start_outside_every_window_means_closed() {
    let windows = vec![window(1, "09:00", "17:00")];
    let result = find_open_window(&windows, &stamp(1, 2, "08:00"), &stamp(1, 2, "09:00"));
    assert!(matches!(
        result,
        Err(EngineError::BusinessClosed { weekday: 1, .. })
    ));
}

#[test]
fn earliest_opening_window_wins() {
    // Inserted out of order; the match must be the 09:00 window.
    let windows = vec![window(1, "13:00", "17:00"), window(1, "09:00", "12:00")];
    let w = find_open_window(&windows, &stamp(1, 2, "09:30"), &stamp(1, 2, "10:30")).unwrap();
    assert_eq!(w.from, clock("09:00"));
}

#[test]
fn overlapping_windows_fall_through_to_one_that_fits_end() {
    // Both windows contain 11:30, but only the longer one can hold a
    // booking ending at 12:30.
    let windows = vec![window(1, "09:00", "12:00"), window(1, "10:00", "18:00")];
    let w = find_open_window(&windows, &stamp(1, 2, "11:30"), &stamp(1, 2, "12:30")).unwrap();
    assert_eq!(w.to, clock("18:00"));
}

#[test]
fn split_shift_rejects_booking_spilling_past_morning_close() {
    let windows = vec![window(1, "09:00", "12:00"), window(1, "13:00", "17:00")];

    // Afternoon shift works fine.
    assert!(find_open_window(&windows, &stamp(1, 2, "13:30"), &stamp(1, 2, "15:30")).is_ok());

    // 11:30 + 1h spills past the morning close; the afternoon window does
    // not contain the start, so the booking is refused naming 12:00.
    let result = find_open_window(&windows, &stamp(1, 2, "11:30"), &stamp(1, 2, "12:30"));
    match result {
        Err(EngineError::ClosesBeforeServiceEnds { end, closes }) => {
            assert_eq!(end, clock("12:30"));
            assert_eq!(closes, clock("12:00"));
        }
        other => panic!("expected ClosesBeforeServiceEnds, got {other:?}"),
    }
}

#[test]
fn start_at_closing_time_cannot_fit_any_service() {
    // 17:00 is still "inside" the window per the inclusive upper bound, but
    // no positive-length service can end by 17:00.
    let windows = vec![window(1, "09:00", "17:00")];
    let result = find_open_window(&windows, &stamp(1, 2, "17:00"), &stamp(1, 2, "18:00"));
    assert!(matches!(
        result,
        Err(EngineError::ClosesBeforeServiceEnds { .. })
    ));
}

#[test]
fn service_ending_exactly_at_close_fits() {
    let windows = vec![window(1, "09:00", "17:00")];
    assert!(find_open_window(&windows, &stamp(1, 2, "16:00"), &stamp(1, 2, "17:00")).is_ok());
}

#[test]
fn crossing_local_midnight_rejected() {
    let windows = vec![window(0, "20:00", "23:59")];
    let start = stamp(0, 8, "23:00");
    let end = LocalStamp {
        weekday: 1,
        date: NaiveDate::from_ymd_opt(2025, 6, 9).unwrap(),
        time: clock("00:00"),
    };
    let result = find_open_window(&windows, &start, &end);
    assert!(matches!(
        result,
        Err(EngineError::ClosesBeforeServiceEnds { .. })
    ));
}

#[test]
fn window_overlap_rules() {
    let existing = vec![window(1, "09:00", "12:00")];

    // Backwards range.
    assert!(matches!(
        check_window_fits(&existing, 1, clock("15:00"), clock("14:00"), None),
        Err(EngineError::InvalidInput(_))
    ));
    // Overlap on the same weekday.
    assert!(matches!(
        check_window_fits(&existing, 1, clock("11:00"), clock("14:00"), None),
        Err(EngineError::InvalidInput(_))
    ));
    // Touching endpoints are fine.
    assert!(check_window_fits(&existing, 1, clock("12:00"), clock("17:00"), None).is_ok());
    // Same range on another weekday is fine.
    assert!(check_window_fits(&existing, 2, clock("09:00"), clock("12:00"), None).is_ok());
    // A window never collides with itself when excluded.
    assert!(
        check_window_fits(&existing, 1, clock("09:30"), clock("11:30"), Some(existing[0].id))
            .is_ok()
    );
}

// ══════════════════════════════════════════════════════════════
// Catalog mutations
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn engine_business_validation() {
    let path = test_wal_path("business_validation.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();

    let result = engine
        .create_business(Ulid::new(), None, "Náutica".into(), "Atlantis/Sunken")
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));

    let id = Ulid::new();
    engine
        .create_business(id, None, "Náutica".into(), "Europe/Madrid")
        .await
        .unwrap();
    let result = engine
        .create_business(id, None, "Náutica".into(), "Europe/Madrid")
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));

    // Owner must exist and be an admin.
    let client = new_client(&engine, "Paco").await;
    let result = engine
        .create_business(Ulid::new(), Some(client), "Otra".into(), "Europe/Madrid")
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    let result = engine
        .create_business(Ulid::new(), Some(Ulid::new()), "Otra".into(), "Europe/Madrid")
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn engine_user_registration_rules() {
    let path = test_wal_path("user_registration.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    // Employees need a business; nobody else may carry one.
    let result = engine
        .register_user(Ulid::new(), "Luis".into(), Role::Employee, None)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    let result = engine
        .register_user(Ulid::new(), "Luis".into(), Role::Employee, Some(Ulid::new()))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
    let result = engine
        .register_user(Ulid::new(), "Luis".into(), Role::Client, Some(salon.business))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));

    let result = engine
        .register_user(salon.client, "Nuria".into(), Role::Client, None)
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn engine_service_validation() {
    let path = test_wal_path("service_validation.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let result = engine
        .create_service(Ulid::new(), salon.business, "Gratis".into(), 0, 100)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    let result = engine
        .create_service(
            Ulid::new(),
            salon.business,
            "Eterno".into(),
            MAX_SERVICE_DURATION_MIN + 1,
            100,
        )
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
    let result = engine
        .create_service(Ulid::new(), salon.business, "Deuda".into(), 30, -1)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    let result = engine
        .create_service(Ulid::new(), Ulid::new(), "Perdido".into(), 30, 100)
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn engine_schedule_crud() {
    let path = test_wal_path("schedule_crud.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    // A Saturday morning window opens the salon on a sixth day.
    let saturday = Ulid::new();
    engine
        .add_schedule(saturday, salon.business, 6, "10:00", "14:00")
        .await
        .unwrap();
    let mut req = request(&salon, madrid(7, 10, 0));
    req.employee_id = Some(salon.employee);
    engine.create_booking(req).await.unwrap();

    // Overlapping window on the same day is refused.
    let result = engine
        .add_schedule(Ulid::new(), salon.business, 6, "13:00", "18:00")
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));

    // Updating the window may shrink it without tripping over itself.
    engine.update_schedule(saturday, "10:00", "13:00").await.unwrap();

    // Removing it closes Saturday again.
    engine.remove_schedule(saturday).await.unwrap();
    let result = engine.create_booking(request(&salon, madrid(7, 11, 0))).await;
    assert!(matches!(
        result,
        Err(EngineError::BusinessClosed { weekday: 6, .. })
    ));

    assert!(matches!(
        engine.update_schedule(saturday, "10:00", "12:00").await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine
            .add_schedule(Ulid::new(), salon.business, 7, "10:00", "12:00")
            .await,
        Err(EngineError::InvalidInput(_))
    ));
}

// ══════════════════════════════════════════════════════════════
// Booking creation
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn engine_booking_happy_path_auto_assigns_in_registration_order() {
    let path = test_wal_path("booking_happy.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;
    let second = hire(&engine, salon.business, "Vera").await;

    let start = madrid(2, 10, 0);
    let booking = engine.create_booking(request(&salon, start)).await.unwrap();

    assert_eq!(booking.employee_id, salon.employee); // registered before Vera
    assert_ne!(booking.employee_id, second);
    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.price, 1_500);
    assert_eq!(booking.span, Span::new(start, start + 3_600_000));

    let mine = engine.bookings_for_client(as_client(&salon)).unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, booking.id);
}

#[tokio::test]
async fn engine_booking_requested_employee_honored() {
    let path = test_wal_path("booking_requested.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;
    let second = hire(&engine, salon.business, "Vera").await;

    let mut req = request(&salon, madrid(2, 10, 0));
    req.employee_id = Some(second);
    let booking = engine.create_booking(req).await.unwrap();
    assert_eq!(booking.employee_id, second);
}

#[tokio::test]
async fn engine_booking_on_closed_day_rejected() {
    let path = test_wal_path("booking_closed_day.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let result = engine.create_booking(request(&salon, madrid(7, 10, 0))).await;
    assert!(matches!(
        result,
        Err(EngineError::BusinessClosed { weekday: 6, .. })
    ));
}

#[tokio::test]
async fn engine_booking_overrunning_close_names_closing_time() {
    let path = test_wal_path("booking_overrun.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let result = engine.create_booking(request(&salon, madrid(2, 16, 30))).await;
    match result {
        Err(EngineError::ClosesBeforeServiceEnds { end, closes }) => {
            assert_eq!(end, clock("17:30"));
            assert_eq!(closes, clock("17:00"));
        }
        other => panic!("expected ClosesBeforeServiceEnds, got {other:?}"),
    }
}

#[tokio::test]
async fn engine_adjacent_bookings_both_succeed() {
    let path = test_wal_path("booking_adjacent.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let mut first = request(&salon, madrid(2, 10, 0));
    first.employee_id = Some(salon.employee);
    engine.create_booking(first).await.unwrap();

    // [10:00, 11:00) and [11:00, 12:00) share only the boundary instant.
    let mut second = request(&salon, madrid(2, 11, 0));
    second.employee_id = Some(salon.employee);
    engine.create_booking(second).await.unwrap();
}

#[tokio::test]
async fn engine_busy_requested_employee_unavailable() {
    let path = test_wal_path("booking_busy_requested.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();

    let mut overlapping = request(&salon, madrid(2, 10, 30));
    overlapping.employee_id = Some(salon.employee);
    let result = engine.create_booking(overlapping).await;
    assert!(matches!(result, Err(EngineError::EmployeeUnavailable(_))));
}

#[tokio::test]
async fn engine_auto_assignment_skips_busy_then_exhausts() {
    let path = test_wal_path("booking_auto_exhaust.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;
    let second = hire(&engine, salon.business, "Vera").await;

    let start = madrid(2, 10, 0);
    let first = engine.create_booking(request(&salon, start)).await.unwrap();
    assert_eq!(first.employee_id, salon.employee);

    let overflow = engine.create_booking(request(&salon, start)).await.unwrap();
    assert_eq!(overflow.employee_id, second);

    let result = engine.create_booking(request(&salon, start)).await;
    assert!(matches!(result, Err(EngineError::NoAvailableEmployee)));
}

#[tokio::test]
async fn engine_repeated_failing_request_leaves_no_trace() {
    let path = test_wal_path("booking_repeat_reject.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let start = madrid(2, 10, 0);
    let taken = engine.create_booking(request(&salon, start)).await.unwrap();

    // The salon's only chair is occupied: the identical request must fail
    // the same way every time and write nothing.
    let req = request(&salon, start);
    assert!(matches!(
        engine.create_booking(req.clone()).await,
        Err(EngineError::NoAvailableEmployee)
    ));
    assert!(matches!(
        engine.create_booking(req.clone()).await,
        Err(EngineError::NoAvailableEmployee)
    ));

    assert!(matches!(engine.booking(&req.id), Err(EngineError::NotFound(_))));
    let cal = engine.store.calendar(&salon.employee).unwrap();
    assert_eq!(cal.read().await.slots.len(), 1);
    let mine = engine.bookings_for_client(as_client(&salon)).unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, taken.id);
}

#[tokio::test]
async fn engine_booking_reference_validation() {
    let path = test_wal_path("booking_refs.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let mut req = request(&salon, madrid(2, 10, 0));
    req.business_id = Ulid::new();
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::NotFound(_))
    ));

    let mut req = request(&salon, madrid(2, 10, 0));
    req.service_id = Ulid::new();
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::NotFound(_))
    ));

    // A service from another business cannot be booked here.
    let rival = Ulid::new();
    engine
        .create_business(rival, None, "Rival".into(), "Europe/Madrid")
        .await
        .unwrap();
    let foreign_service = Ulid::new();
    engine
        .create_service(foreign_service, rival, "Tinte".into(), 30, 900)
        .await
        .unwrap();
    let mut req = request(&salon, madrid(2, 10, 0));
    req.service_id = foreign_service;
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::InvalidInput(_))
    ));

    // Requesting someone who is not an employee of this business.
    let foreign_employee = hire(&engine, rival, "Ana").await;
    let mut req = request(&salon, madrid(2, 10, 0));
    req.employee_id = Some(foreign_employee);
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::EmployeeNotInBusiness(_))
    ));
    let mut req = request(&salon, madrid(2, 10, 0));
    req.employee_id = Some(salon.client);
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::EmployeeNotInBusiness(_))
    ));
}

#[tokio::test]
async fn engine_zero_duration_service_fails_validation_not_availability() {
    let path = test_wal_path("booking_zero_duration.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    // create_service refuses a zero duration outright...
    assert!(matches!(
        engine
            .create_service(Ulid::new(), salon.business, "Instante".into(), 0, 100)
            .await,
        Err(EngineError::InvalidInput(_))
    ));

    // ...and even a service row smuggled past it is caught before any
    // schedule or availability lookup.
    let rogue = Ulid::new();
    engine.store.services.insert(
        rogue,
        Service {
            id: rogue,
            business_id: salon.business,
            name: "Instante".into(),
            duration_min: 0,
            price: 100,
        },
    );
    let mut req = request(&salon, madrid(7, 3, 0)); // closed Saturday, 03:00
    req.service_id = rogue;
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn engine_request_timezone_reinterprets_schedule() {
    let path = test_wal_path("booking_tz_override.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    // Monday 15:00 in New York is Monday 21:00 in Madrid.
    let start = at("America/New_York", 2025, 6, 2, 15, 0);

    // Interpreted in the business's zone this is after closing.
    let result = engine.create_booking(request(&salon, start)).await;
    assert!(matches!(
        result,
        Err(EngineError::BusinessClosed { weekday: 1, .. })
    ));

    // With the client's zone attached the same instant is mid-afternoon.
    let mut req = request(&salon, start);
    req.timezone = Some("America/New_York".into());
    let booking = engine.create_booking(req).await.unwrap();
    assert_eq!(booking.timezone, parse_zone("America/New_York").unwrap());
}

#[tokio::test]
async fn engine_dst_jump_keeps_utc_duration() {
    let path = test_wal_path("booking_dst.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();

    // Night shop open in the Sunday small hours; Madrid clocks jump
    // 02:00 -> 03:00 on 2025-03-30.
    let owner = Ulid::new();
    engine
        .register_user(owner, "Rosa".into(), Role::Admin, None)
        .await
        .unwrap();
    let business = Ulid::new();
    engine
        .create_business(business, Some(owner), "Churrería 24h".into(), "Europe/Madrid")
        .await
        .unwrap();
    engine
        .add_schedule(Ulid::new(), business, 0, "00:00", "04:00")
        .await
        .unwrap();
    let service = Ulid::new();
    engine
        .create_service(service, business, "Desayuno".into(), 60, 800)
        .await
        .unwrap();
    let employee = Ulid::new();
    engine
        .register_user(employee, "Chef".into(), Role::Employee, Some(business))
        .await
        .unwrap();

    let start = at("Europe/Madrid", 2025, 3, 30, 1, 30);
    let booking = engine
        .create_booking(BookingRequest {
            id: Ulid::new(),
            service_id: service,
            business_id: business,
            start,
            employee_id: None,
            client_id: None,
            timezone: None,
            price: None,
        })
        .await
        .unwrap();

    // One hour of real time, but the local clock says 03:30: 02:30 never
    // happened that night.
    assert_eq!(booking.span.duration_ms(), 3_600_000);
    let end_local = normalize(booking.span.end, booking.timezone).unwrap();
    assert_eq!(end_local.time, clock("03:30"));
    assert_eq!(end_local.weekday, 0);
}

#[tokio::test]
async fn engine_walk_in_booking_without_client() {
    let path = test_wal_path("booking_walk_in.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let mut req = request(&salon, madrid(2, 12, 0));
    req.client_id = None;
    let booking = engine.create_booking(req).await.unwrap();
    assert_eq!(booking.client_id, None);

    // The walk-in never shows up in the client's history.
    assert!(engine.bookings_for_client(as_client(&salon)).unwrap().is_empty());
}

#[tokio::test]
async fn engine_price_override_and_snapshot() {
    let path = test_wal_path("booking_price.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let mut req = request(&salon, madrid(2, 10, 0));
    req.price = Some(999);
    let discounted = engine.create_booking(req).await.unwrap();
    assert_eq!(discounted.price, 999);

    let mut req = request(&salon, madrid(2, 12, 0));
    req.price = Some(-1);
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::InvalidInput(_))
    ));

    // Deleting the service does not disturb the snapshot.
    engine.delete_service(salon.service).await.unwrap();
    let kept = engine.bookings_for_client(as_client(&salon)).unwrap();
    assert_eq!(kept[0].price, 999);
}

#[tokio::test]
async fn engine_booking_events_reach_subscribers() {
    let path = test_wal_path("booking_notify.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify.clone()).unwrap();
    let salon = seed_salon(&engine).await;

    let mut rx = notify.subscribe(salon.business);
    let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();

    let event = rx.recv().await.unwrap();
    assert!(matches!(event, Event::BookingCreated { id, .. } if id == booking.id));

    engine
        .change_status(as_client(&salon), booking.id, BookingStatus::Cancelled, None)
        .await
        .unwrap();
    let event = rx.recv().await.unwrap();
    assert!(matches!(
        event,
        Event::BookingStatusChanged { status: BookingStatus::Cancelled, .. }
    ));
}

// ══════════════════════════════════════════════════════════════
// Status lifecycle
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn engine_lifecycle_pending_confirmed_completed() {
    let path = test_wal_path("lifecycle_happy.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();

    let confirmed = engine
        .change_status(as_employee(&salon), booking.id, BookingStatus::Confirmed, None)
        .await
        .unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);

    let done = engine
        .change_status(as_employee(&salon), booking.id, BookingStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(done.status, BookingStatus::Completed);

    // COMPLETED is terminal.
    let result = engine
        .change_status(as_owner(&salon), booking.id, BookingStatus::Cancelled, None)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn engine_lifecycle_no_skipping_or_reviving() {
    let path = test_wal_path("lifecycle_graph.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();

    // PENDING cannot jump straight to COMPLETED.
    let result = engine
        .change_status(as_owner(&salon), booking.id, BookingStatus::Completed, None)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));

    engine
        .change_status(as_client(&salon), booking.id, BookingStatus::Cancelled, None)
        .await
        .unwrap();

    // CANCELLED stays cancelled.
    let result = engine
        .change_status(as_owner(&salon), booking.id, BookingStatus::Confirmed, None)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn engine_cancellation_frees_the_slot() {
    let path = test_wal_path("lifecycle_cancel_frees.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let start = madrid(2, 10, 0);
    let booking = engine.create_booking(request(&salon, start)).await.unwrap();

    // Slot taken.
    assert!(matches!(
        engine.create_booking(request(&salon, start)).await,
        Err(EngineError::NoAvailableEmployee)
    ));

    engine
        .change_status(as_client(&salon), booking.id, BookingStatus::Cancelled, None)
        .await
        .unwrap();

    // Slot free again; the cancelled row remains visible in history.
    engine.create_booking(request(&salon, start)).await.unwrap();
    let mine = engine.bookings_for_client(as_client(&salon)).unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().any(|b| b.status == BookingStatus::Cancelled));
}

#[tokio::test]
async fn engine_clients_may_only_cancel_their_own() {
    let path = test_wal_path("lifecycle_client_scope.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();

    // Clients cannot confirm, not even their own.
    let result = engine
        .change_status(as_client(&salon), booking.id, BookingStatus::Confirmed, None)
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));

    // Another client cannot touch this booking at all.
    let stranger = new_client(&engine, "Leo").await;
    let result = engine
        .change_status(
            Actor { id: stranger, role: Role::Client },
            booking.id,
            BookingStatus::Cancelled,
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));
}

#[tokio::test]
async fn engine_employee_cannot_touch_other_assignments() {
    let path = test_wal_path("lifecycle_employee_scope.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;
    let second = hire(&engine, salon.business, "Vera").await;

    let mut req = request(&salon, madrid(2, 10, 0));
    req.employee_id = Some(salon.employee);
    let booking = engine.create_booking(req).await.unwrap();

    // A valid transition, refused because it is not Vera's assignment.
    let result = engine
        .change_status(
            Actor { id: second, role: Role::Employee },
            booking.id,
            BookingStatus::Confirmed,
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));

    // The assigned employee may.
    engine
        .change_status(as_employee(&salon), booking.id, BookingStatus::Confirmed, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn engine_admin_scope_is_owned_businesses() {
    let path = test_wal_path("lifecycle_admin_scope.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();

    let outsider = Ulid::new();
    engine
        .register_user(outsider, "Sergio".into(), Role::Admin, None)
        .await
        .unwrap();
    let result = engine
        .change_status(
            Actor { id: outsider, role: Role::Admin },
            booking.id,
            BookingStatus::Confirmed,
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));

    engine
        .change_status(as_owner(&salon), booking.id, BookingStatus::Confirmed, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn engine_expected_status_precondition() {
    let path = test_wal_path("lifecycle_expected.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();
    engine
        .change_status(as_employee(&salon), booking.id, BookingStatus::Confirmed, None)
        .await
        .unwrap();

    // A stale caller still thinks the booking is PENDING.
    let result = engine
        .change_status(
            as_owner(&salon),
            booking.id,
            BookingStatus::Cancelled,
            Some(BookingStatus::Pending),
        )
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));

    engine
        .change_status(
            as_owner(&salon),
            booking.id,
            BookingStatus::Cancelled,
            Some(BookingStatus::Confirmed),
        )
        .await
        .unwrap();
}

// ══════════════════════════════════════════════════════════════
// Rescheduling
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn engine_reschedule_may_overlap_itself() {
    let path = test_wal_path("resched_self_overlap.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();

    // [10:30, 11:30) overlaps the old [10:00, 11:00) slot; only this
    // booking occupies it, so the move succeeds.
    let moved = engine
        .reschedule_booking(as_client(&salon), booking.id, madrid(2, 10, 30), None)
        .await
        .unwrap();
    assert_eq!(moved.span.start, madrid(2, 10, 30));
    assert_eq!(moved.employee_id, salon.employee);
}

#[tokio::test]
async fn engine_reschedule_validates_schedule_again() {
    let path = test_wal_path("resched_schedule.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();

    let result = engine
        .reschedule_booking(as_client(&salon), booking.id, madrid(7, 10, 0), None)
        .await;
    assert!(matches!(result, Err(EngineError::BusinessClosed { .. })));

    let result = engine
        .reschedule_booking(as_client(&salon), booking.id, madrid(2, 16, 30), None)
        .await;
    assert!(matches!(result, Err(EngineError::ClosesBeforeServiceEnds { .. })));
}

#[tokio::test]
async fn engine_reschedule_moves_between_calendars() {
    let path = test_wal_path("resched_move.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;
    let second = hire(&engine, salon.business, "Vera").await;

    let start = madrid(2, 10, 0);
    let mut req = request(&salon, start);
    req.employee_id = Some(salon.employee);
    let booking = engine.create_booking(req).await.unwrap();

    let moved = engine
        .reschedule_booking(
            as_client(&salon),
            booking.id,
            madrid(2, 14, 0),
            Some(Some(second)),
        )
        .await
        .unwrap();
    assert_eq!(moved.employee_id, second);

    // The old slot on the old calendar is free again.
    let mut req = request(&salon, start);
    req.employee_id = Some(salon.employee);
    engine.create_booking(req).await.unwrap();

    // The assignment lists reflect the move.
    assert!(engine
        .assignments_for_employee(as_employee(&salon))
        .unwrap()
        .iter()
        .all(|b| b.id != booking.id));
    assert!(engine
        .assignments_for_employee(Actor { id: second, role: Role::Employee })
        .unwrap()
        .iter()
        .any(|b| b.id == booking.id));
}

#[tokio::test]
async fn engine_reschedule_auto_picks_free_employee() {
    let path = test_wal_path("resched_auto.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;
    let second = hire(&engine, salon.business, "Vera").await;

    // Block the first employee's afternoon.
    let mut blocker = request(&salon, madrid(2, 14, 0));
    blocker.employee_id = Some(salon.employee);
    engine.create_booking(blocker).await.unwrap();

    let mut req = request(&salon, madrid(2, 10, 0));
    req.employee_id = Some(salon.employee);
    let booking = engine.create_booking(req).await.unwrap();

    // Auto re-assignment must skip the busy first employee.
    let moved = engine
        .reschedule_booking(as_client(&salon), booking.id, madrid(2, 14, 0), Some(None))
        .await
        .unwrap();
    assert_eq!(moved.employee_id, second);

    // Busy target named explicitly is refused.
    let result = engine
        .reschedule_booking(
            as_client(&salon),
            booking.id,
            madrid(2, 14, 0),
            Some(Some(salon.employee)),
        )
        .await;
    assert!(matches!(result, Err(EngineError::EmployeeUnavailable(_))));
}

#[tokio::test]
async fn engine_reschedule_authorization_and_terminal_states() {
    let path = test_wal_path("resched_auth.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();

    let stranger = new_client(&engine, "Leo").await;
    assert!(matches!(
        engine
            .reschedule_booking(
                Actor { id: stranger, role: Role::Client },
                booking.id,
                madrid(2, 12, 0),
                None,
            )
            .await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine
            .reschedule_booking(as_employee(&salon), booking.id, madrid(2, 12, 0), None)
            .await,
        Err(EngineError::Forbidden(_))
    ));

    // The owner may move it.
    engine
        .reschedule_booking(as_owner(&salon), booking.id, madrid(2, 12, 0), None)
        .await
        .unwrap();

    // Once cancelled it stays where it died.
    engine
        .change_status(as_client(&salon), booking.id, BookingStatus::Cancelled, None)
        .await
        .unwrap();
    assert!(matches!(
        engine
            .reschedule_booking(as_owner(&salon), booking.id, madrid(2, 13, 0), None)
            .await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn engine_reschedule_survives_service_deletion() {
    let path = test_wal_path("resched_no_service.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();
    engine.delete_service(salon.service).await.unwrap();

    // Duration is taken from the booking span, so the move still works.
    let moved = engine
        .reschedule_booking(as_client(&salon), booking.id, madrid(2, 15, 0), None)
        .await
        .unwrap();
    assert_eq!(moved.span.duration_ms(), 3_600_000);
}

// ══════════════════════════════════════════════════════════════
// Queries
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn engine_client_history_newest_first() {
    let path = test_wal_path("query_client_order.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let monday = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();
    let friday = engine.create_booking(request(&salon, madrid(6, 10, 0))).await.unwrap();
    let wednesday = engine.create_booking(request(&salon, madrid(4, 10, 0))).await.unwrap();

    let mine = engine.bookings_for_client(as_client(&salon)).unwrap();
    let ids: Vec<Ulid> = mine.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![friday.id, wednesday.id, monday.id]);

    // Employees have no client history.
    assert!(matches!(
        engine.bookings_for_client(as_employee(&salon)),
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn engine_employee_assignments_oldest_first() {
    let path = test_wal_path("query_employee_order.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;

    let friday = engine.create_booking(request(&salon, madrid(6, 10, 0))).await.unwrap();
    let monday = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();

    let work = engine.assignments_for_employee(as_employee(&salon)).unwrap();
    let ids: Vec<Ulid> = work.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![monday.id, friday.id]);
}

#[tokio::test]
async fn engine_admin_listing_filters() {
    let path = test_wal_path("query_admin_filters.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;
    let other_client = new_client(&engine, "Leo").await;

    let b1 = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();
    let mut req = request(&salon, madrid(3, 10, 0));
    req.client_id = Some(other_client);
    let b2 = engine.create_booking(req).await.unwrap();
    engine
        .change_status(as_employee(&salon), b1.id, BookingStatus::Confirmed, None)
        .await
        .unwrap();

    let admin = as_owner(&salon);

    let confirmed = engine
        .list_bookings(admin, BookingFilter {
            status: Some(BookingStatus::Confirmed),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].id, b1.id);

    let tuesday_only = engine
        .list_bookings(admin, BookingFilter {
            from: Some(madrid(3, 0, 0)),
            to: Some(madrid(4, 0, 0)),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(tuesday_only.len(), 1);
    assert_eq!(tuesday_only[0].id, b2.id);

    let leos = engine
        .list_bookings(admin, BookingFilter {
            client_id: Some(other_client),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(leos.len(), 1);
    assert_eq!(leos[0].id, b2.id);

    let everything = engine.list_bookings(admin, BookingFilter::default()).unwrap();
    assert_eq!(everything.len(), 2);
    // Newest start first.
    assert_eq!(everything[0].id, b2.id);

    assert!(matches!(
        engine.list_bookings(admin, BookingFilter {
            from: Some(0),
            to: Some(MAX_QUERY_WINDOW_MS + 1),
            ..Default::default()
        }),
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.list_bookings(as_client(&salon), BookingFilter::default()),
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn engine_available_employees_listing() {
    let path = test_wal_path("query_available.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;
    let second = hire(&engine, salon.business, "Vera").await;

    let start = madrid(2, 10, 0);
    let span = Span::new(start, start + 3_600_000);
    assert_eq!(
        engine.available_employees(&salon.business, &span).await.unwrap(),
        vec![salon.employee, second]
    );

    let mut req = request(&salon, start);
    req.employee_id = Some(salon.employee);
    engine.create_booking(req).await.unwrap();
    assert_eq!(
        engine.available_employees(&salon.business, &span).await.unwrap(),
        vec![second]
    );

    assert!(matches!(
        engine
            .available_employees(&salon.business, &Span { start: start + 10, end: start })
            .await,
        Err(EngineError::InvalidInput(_))
    ));
}

// ══════════════════════════════════════════════════════════════
// Concurrency
// ══════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread")]
async fn engine_concurrent_auto_assign_single_winner() {
    let path = test_wal_path("concurrent_auto.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(path, notify).unwrap());
    let salon = seed_salon(&engine).await;

    let start = madrid(2, 10, 0);
    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        let req = request(&salon, start);
        handles.push(tokio::spawn(async move { engine.create_booking(req).await }));
    }

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::NoAvailableEmployee)
            | Err(EngineError::EmployeeUnavailable(_))
            | Err(EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);

    let cal = engine.store.calendar(&salon.employee).unwrap();
    assert_eq!(cal.read().await.slots.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_concurrent_requested_single_winner() {
    let path = test_wal_path("concurrent_requested.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(path, notify).unwrap());
    let salon = seed_salon(&engine).await;

    let start = madrid(2, 10, 0);
    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        let mut req = request(&salon, start);
        req.employee_id = Some(salon.employee);
        handles.push(tokio::spawn(async move { engine.create_booking(req).await }));
    }

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::EmployeeUnavailable(_)) | Err(EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_reschedule_observes_cancellation_racing_it() {
    let path = test_wal_path("concurrent_resched_cancel.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(path, notify).unwrap());
    let salon = seed_salon(&engine).await;

    let start = madrid(2, 10, 0);
    let booking = engine.create_booking(request(&salon, start)).await.unwrap();
    let id = booking.id;

    // Park both writers behind the calendar lock, cancellation first. The
    // reschedule's screening read still sees PENDING; only its re-read
    // under the lock can see the cancellation.
    let cal = engine.store.calendar(&salon.employee).unwrap();
    let blocker = cal.write_owned().await;

    let cancel = {
        let engine = engine.clone();
        let actor = as_client(&salon);
        tokio::spawn(async move {
            engine
                .change_status(actor, id, BookingStatus::Cancelled, None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let reschedule = {
        let engine = engine.clone();
        let actor = as_client(&salon);
        tokio::spawn(async move {
            engine
                .reschedule_booking(actor, id, madrid(2, 14, 0), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(blocker);

    cancel.await.unwrap().unwrap();
    assert!(matches!(
        reschedule.await.unwrap(),
        Err(EngineError::InvalidTransition { .. })
    ));
    assert_eq!(engine.booking(&id).unwrap().status, BookingStatus::Cancelled);

    // The cancellation freed the morning, and no phantom slot occupies the
    // afternoon.
    engine.create_booking(request(&salon, start)).await.unwrap();
    engine.create_booking(request(&salon, madrid(2, 14, 0))).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_concurrent_duplicate_id_admitted_once() {
    let path = test_wal_path("concurrent_dup_id.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(path, notify).unwrap());
    let salon = seed_salon(&engine).await;
    let second = hire(&engine, salon.business, "Vera").await;

    let start = madrid(2, 10, 0);
    let id = Ulid::new();

    // The first writer passes the duplicate screen, then parks on Iker's
    // calendar while the same id commits against Vera's.
    let cal = engine.store.calendar(&salon.employee).unwrap();
    let blocker = cal.clone().write_owned().await;

    let parked = {
        let engine = engine.clone();
        let mut req = request(&salon, start);
        req.id = id;
        req.employee_id = Some(salon.employee);
        tokio::spawn(async move { engine.create_booking(req).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut req = request(&salon, start);
    req.id = id;
    req.employee_id = Some(second);
    let winner = engine.create_booking(req).await.unwrap();
    assert_eq!(winner.employee_id, second);

    drop(blocker);
    assert!(matches!(
        parked.await.unwrap(),
        Err(EngineError::AlreadyExists(_))
    ));

    // One row, one slot: the surviving booking is Vera's, and nothing on
    // Iker's calendar blocks the chair.
    assert_eq!(engine.booking(&id).unwrap().employee_id, second);
    assert!(cal.read().await.slots.is_empty());
    let mut retry = request(&salon, start);
    retry.employee_id = Some(salon.employee);
    engine.create_booking(retry).await.unwrap();
}

// ══════════════════════════════════════════════════════════════
// Persistence
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn engine_wal_replay_restores_state() {
    let path = test_wal_path("replay_state.wal");
    let notify = Arc::new(NotifyHub::new());

    let (salon, booking_id) = {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        let salon = seed_salon(&engine).await;
        let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();
        engine
            .change_status(as_employee(&salon), booking.id, BookingStatus::Confirmed, None)
            .await
            .unwrap();
        (salon, booking.id)
    };

    let engine2 = Engine::new(path, notify).unwrap();
    let restored = engine2.booking(&booking_id).unwrap();
    assert_eq!(restored.status, BookingStatus::Confirmed);
    assert_eq!(restored.price, 1_500);

    // The rebuilt calendar still defends the slot.
    let mut req = request(&salon, madrid(2, 10, 30));
    req.employee_id = Some(salon.employee);
    assert!(matches!(
        engine2.create_booking(req).await,
        Err(EngineError::EmployeeUnavailable(_))
    ));
}

#[tokio::test]
async fn engine_compaction_preserves_assignment_order() {
    let path = test_wal_path("compact_order.wal");
    let notify = Arc::new(NotifyHub::new());

    let (salon, second) = {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        let salon = seed_salon(&engine).await;
        let second = hire(&engine, salon.business, "Vera").await;
        engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (salon, second)
    };

    let engine2 = Engine::new(path, notify).unwrap();

    // Registration order survived the rewrite: a free slot still goes to
    // the first-registered employee.
    let span = Span::new(madrid(2, 12, 0), madrid(2, 13, 0));
    assert_eq!(
        engine2.available_employees(&salon.business, &span).await.unwrap(),
        vec![salon.employee, second]
    );
    let booking = engine2.create_booking(request(&salon, madrid(2, 12, 0))).await.unwrap();
    assert_eq!(booking.employee_id, salon.employee);

    // And the compacted calendar still holds the original 10:00 slot.
    let mut req = request(&salon, madrid(2, 10, 0));
    req.employee_id = Some(salon.employee);
    assert!(matches!(
        engine2.create_booking(req).await,
        Err(EngineError::EmployeeUnavailable(_))
    ));
}

#[tokio::test]
async fn engine_cancelled_booking_survives_replay_without_blocking() {
    let path = test_wal_path("replay_cancelled.wal");
    let notify = Arc::new(NotifyHub::new());

    let (salon, cancelled_id) = {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        let salon = seed_salon(&engine).await;
        let booking = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();
        engine
            .change_status(as_client(&salon), booking.id, BookingStatus::Cancelled, None)
            .await
            .unwrap();
        (salon, booking.id)
    };

    let engine2 = Engine::new(path, notify).unwrap();
    assert_eq!(
        engine2.booking(&cancelled_id).unwrap().status,
        BookingStatus::Cancelled
    );
    // The freed slot stayed free across the restart.
    engine2.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();
}

// ══════════════════════════════════════════════════════════════
// Integration vertical: a salon's Monday
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn vertical_salon_monday() {
    let path = test_wal_path("vertical_salon.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, notify).unwrap();
    let salon = seed_salon(&engine).await;
    let vera = hire(&engine, salon.business, "Vera").await;
    let leo = new_client(&engine, "Leo").await;

    // Nuria books 10:00 with whoever is free; Leo insists on Vera at 10:30.
    let nuria_cut = engine.create_booking(request(&salon, madrid(2, 10, 0))).await.unwrap();
    assert_eq!(nuria_cut.employee_id, salon.employee);

    let mut req = request(&salon, madrid(2, 10, 30));
    req.client_id = Some(leo);
    req.employee_id = Some(vera);
    let leo_cut = engine.create_booking(req).await.unwrap();
    assert_eq!(leo_cut.employee_id, vera);

    // Both staff confirm their morning.
    engine
        .change_status(as_employee(&salon), nuria_cut.id, BookingStatus::Confirmed, None)
        .await
        .unwrap();
    engine
        .change_status(
            Actor { id: vera, role: Role::Employee },
            leo_cut.id,
            BookingStatus::Confirmed,
            None,
        )
        .await
        .unwrap();

    // Nuria's plans change: her cut moves to the afternoon, any chair.
    let moved = engine
        .reschedule_booking(as_client(&salon), nuria_cut.id, madrid(2, 15, 0), Some(None))
        .await
        .unwrap();
    assert_eq!(moved.span.start, madrid(2, 15, 0));

    // A walk-in takes the freed 10:00 chair.
    let mut walk_in = request(&salon, madrid(2, 10, 0));
    walk_in.client_id = None;
    engine.create_booking(walk_in).await.unwrap();

    // Leo is served; Vera closes out the job.
    engine
        .change_status(
            Actor { id: vera, role: Role::Employee },
            leo_cut.id,
            BookingStatus::Completed,
            None,
        )
        .await
        .unwrap();

    // The owner reviews the day.
    let day = engine
        .list_bookings(as_owner(&salon), BookingFilter {
            from: Some(madrid(2, 0, 0)),
            to: Some(madrid(3, 0, 0)),
            business_id: Some(salon.business),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(day.len(), 3);
    assert_eq!(
        day.iter().filter(|b| b.status == BookingStatus::Completed).count(),
        1
    );

    // And the books balance: every booking carries the snapshot price.
    assert!(day.iter().all(|b| b.price == 1_500));
}

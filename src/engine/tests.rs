use super::*;
use crate::clock::ManualClock;
use crate::config::AutopilotConfig;
use crate::sinks::{MemoryAuditSink, MemoryMessageSink};

// 2026-01-05T00:00:00Z, a Monday.
const MONDAY: Ms = 1_767_571_200_000;
const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("shiftline_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Fixture {
    engine: Engine,
    path: PathBuf,
    clock: Arc<ManualClock>,
    messages: Arc<MemoryMessageSink>,
    audit: Arc<MemoryAuditSink>,
    business: Business,
}

/// A business with one admin contact. The clock starts on Sunday evening so
/// Monday bookings are not subject to the lead time.
async fn fixture(name: &str) -> Fixture {
    let path = test_wal_path(name);
    let clock = Arc::new(ManualClock::new(MONDAY - H));
    let messages = Arc::new(MemoryMessageSink::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()))
        .unwrap()
        .with_sinks(messages.clone(), audit.clone())
        .with_clock(clock.clone());

    let mut business = Business::new(Ulid::new(), "Studio", 0);
    business.admin_contacts = vec!["admin@studio".into()];
    engine.upsert_business(business.clone()).await.unwrap();

    Fixture { engine, path, clock, messages, audit, business }
}

impl Fixture {
    /// Provider working 09:00–17:00 Monday to Friday.
    async fn provider(&self, name: &str, buffer_minutes: u16, skills: &[&str]) -> Ulid {
        let id = Ulid::new();
        self.engine
            .upsert_provider(ProviderProfile {
                id,
                business_id: self.business.id,
                name: name.into(),
                contact: Some(format!("{name}@staff")),
                buffer_minutes,
            })
            .await
            .unwrap();
        for weekday in 1..=5 {
            self.engine
                .set_working_hours(id, WorkingHours { weekday, start_minute: 9 * 60, end_minute: 17 * 60, active: true })
                .await
                .unwrap();
        }
        for code in skills {
            self.engine
                .upsert_skill(id, Skill { code: code.to_string(), duration_minutes: None, price_cents: None })
                .await
                .unwrap();
        }
        id
    }

    async fn client(&self, name: &str, opted_in: bool) -> Ulid {
        let id = Ulid::new();
        self.engine
            .upsert_client(Client {
                id,
                business_id: self.business.id,
                name: name.into(),
                contact: Some(format!("{name}@mail")),
                opted_in,
            })
            .await
            .unwrap();
        id
    }

    async fn book(&self, provider_id: Ulid, client_id: Ulid, start: Ms, minutes: u32) -> Ulid {
        self.book_with_skills(provider_id, client_id, start, minutes, &[]).await
    }

    async fn book_with_skills(
        &self,
        provider_id: Ulid,
        client_id: Ulid,
        start: Ms,
        minutes: u32,
        skills: &[&str],
    ) -> Ulid {
        let apt = self
            .engine
            .book_appointment(NewAppointment {
                id: Ulid::new(),
                client_id,
                provider_id,
                scheduled_start: start,
                duration_minutes: Some(minutes),
                treatment: None,
                required_skills: skills.iter().map(|s| s.to_string()).collect(),
            })
            .await
            .unwrap();
        apt.id
    }

    async fn apt(&self, id: Ulid) -> Appointment {
        self.engine.get_appointment(&id).await.unwrap()
    }

    fn at(&self, instant: Ms) {
        self.clock.set(instant);
    }
}

fn report(t: Transition) -> DelayReport {
    match t {
        Transition::Applied(r) => r,
        Transition::AlreadyApplied => panic!("expected an applied transition"),
    }
}

// ── Booking & availability ───────────────────────────────

#[tokio::test]
async fn booking_respects_buffer() {
    let fx = fixture("booking_buffer.wal").await;
    let p = fx.provider("ana", 15, &[]).await;
    let c = fx.client("cy", true).await;
    fx.book(p, c, MONDAY + 9 * H, 30).await;

    let err = fx
        .engine
        .book_appointment(NewAppointment {
            id: Ulid::new(),
            client_id: c,
            provider_id: p,
            scheduled_start: MONDAY + 9 * H + 30 * M,
            duration_minutes: Some(30),
            treatment: None,
            required_skills: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Unavailable(Availability::Busy { suggested: Some(t) }) if t == MONDAY + 9 * H + 45 * M
    ));

    let verdict = fx
        .engine
        .check_availability(p, MONDAY + 9 * H + 30 * M, 30)
        .await
        .unwrap();
    assert_eq!(verdict, Availability::Busy { suggested: Some(MONDAY + 9 * H + 45 * M) });
    assert_eq!(
        fx.engine.check_availability(p, MONDAY + 9 * H + 45 * M, 30).await.unwrap(),
        Availability::Available
    );
    assert_eq!(
        fx.engine
            .find_next_slot(p, MONDAY + 9 * H, 30, SearchHorizon::SameDay)
            .await
            .unwrap(),
        Some(MONDAY + 9 * H + 45 * M)
    );
}

#[tokio::test]
async fn booking_outside_hours_is_closed_with_suggestion() {
    let fx = fixture("booking_closed.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let verdict = fx.engine.check_availability(p, MONDAY + 8 * H, 30).await.unwrap();
    assert_eq!(verdict, Availability::Closed { suggested: Some(MONDAY + 9 * H) });
}

#[tokio::test]
async fn booking_resolves_duration_from_skill() {
    let fx = fixture("booking_skill_duration.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    fx.engine
        .upsert_skill(p, Skill { code: "cut".into(), duration_minutes: Some(45), price_cents: Some(3_000) })
        .await
        .unwrap();
    let c = fx.client("cy", true).await;

    let with_skill = fx
        .engine
        .book_appointment(NewAppointment {
            id: Ulid::new(),
            client_id: c,
            provider_id: p,
            scheduled_start: MONDAY + 9 * H,
            duration_minutes: None,
            treatment: Some("CUT".into()),
            required_skills: vec![],
        })
        .await
        .unwrap();
    assert_eq!(with_skill.duration_minutes, 45);

    let plain = fx
        .engine
        .book_appointment(NewAppointment {
            id: Ulid::new(),
            client_id: c,
            provider_id: p,
            scheduled_start: MONDAY + 10 * H,
            duration_minutes: None,
            treatment: Some("massage".into()),
            required_skills: vec![],
        })
        .await
        .unwrap();
    assert_eq!(plain.duration_minutes, DEFAULT_DURATION_MINUTES);
}

#[tokio::test]
async fn booking_requires_skills_and_active_provider() {
    let fx = fixture("booking_gates.wal").await;
    let p = fx.provider("ana", 0, &["color"]).await;
    let c = fx.client("cy", true).await;

    let mut req = NewAppointment {
        id: Ulid::new(),
        client_id: c,
        provider_id: p,
        scheduled_start: MONDAY + 9 * H,
        duration_minutes: Some(30),
        treatment: None,
        required_skills: vec!["perm".into()],
    };
    let err = fx.engine.book_appointment(req.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    req.required_skills = vec!["COLOR".into()];
    fx.engine.deactivate_provider(p).await.unwrap();
    let err = fx.engine.book_appointment(req).await.unwrap_err();
    assert!(matches!(err, EngineError::Inactive(id) if id == p));
}

#[tokio::test]
async fn rejected_booking_suggests_a_free_slot_days_ahead() {
    let fx = fixture("booking_far_suggestion.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    for weekday in [1, 2, 4, 5] {
        fx.engine
            .set_working_hours(p, WorkingHours { weekday, start_minute: 9 * 60, end_minute: 17 * 60, active: false })
            .await
            .unwrap();
    }
    let c = fx.client("cy", true).await;
    let wednesday = MONDAY + 48 * H;
    fx.book(p, c, wednesday + 9 * H, 180).await;

    let err = fx
        .engine
        .book_appointment(NewAppointment {
            id: Ulid::new(),
            client_id: c,
            provider_id: p,
            scheduled_start: MONDAY + 9 * H,
            duration_minutes: Some(30),
            treatment: None,
            required_skills: vec![],
        })
        .await
        .unwrap_err();
    let EngineError::Unavailable(Availability::Closed { suggested }) = err else {
        panic!("expected a closed verdict, got {err:?}");
    };
    assert_eq!(suggested, Some(wednesday + 12 * H));
    let searched = fx
        .engine
        .find_next_slot(p, MONDAY + 9 * H, 30, SearchHorizon::Days(7))
        .await
        .unwrap();
    assert_eq!(suggested, searched);
}

#[tokio::test]
async fn reads_reject_degenerate_input() {
    let fx = fixture("read_validation.wal").await;
    let p = fx.provider("ana", 0, &[]).await;

    let err = fx
        .engine
        .find_next_slot(p, MONDAY + 9 * H, 30, SearchHorizon::Days(0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let requests = [SlotRequest { provider_id: p, after: MONDAY, duration_minutes: 30, horizon: SearchHorizon::Days(0) }];
    assert!(matches!(fx.engine.batch_find_slots(&requests).await, Err(EngineError::InvalidInput(_))));

    let err = fx.engine.check_availability(p, i64::MAX / 2, 30).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    let err = fx.engine.check_availability(p, -1, 30).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn skill_upsert_replaces_by_code() {
    let fx = fixture("skill_upsert.wal").await;
    let p = fx.provider("ana", 0, &["cut"]).await;
    fx.engine
        .upsert_skill(p, Skill { code: "CUT".into(), duration_minutes: Some(40), price_cents: None })
        .await
        .unwrap();
    let provider = fx.engine.get_provider(&p).await.unwrap();
    assert_eq!(provider.skills.len(), 1);
    assert_eq!(provider.skill("cut").and_then(|s| s.duration_minutes), Some(40));
}

#[tokio::test]
async fn lead_time_applies_today_only() {
    let fx = fixture("lead_time.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    fx.at(MONDAY + 10 * H);
    let soon = fx.engine.check_availability(p, MONDAY + 10 * H + 10 * M, 30).await.unwrap();
    assert_eq!(soon, Availability::Busy { suggested: Some(MONDAY + 10 * H + 15 * M) });
    let tomorrow = fx.engine.check_availability(p, MONDAY + 33 * H, 30).await.unwrap();
    assert_eq!(tomorrow, Availability::Available);
}

#[tokio::test]
async fn batch_matches_single_searches() {
    let fx = fixture("batch_slots.wal").await;
    let a = fx.provider("ana", 10, &[]).await;
    let b = fx.provider("ben", 0, &[]).await;
    let c = fx.client("cy", true).await;
    fx.book(a, c, MONDAY + 9 * H, 60).await;
    fx.book(b, c, MONDAY + 9 * H, 120).await;

    let requests = vec![
        SlotRequest { provider_id: a, after: MONDAY + 9 * H, duration_minutes: 30, horizon: SearchHorizon::SameDay },
        SlotRequest { provider_id: b, after: MONDAY + 9 * H, duration_minutes: 45, horizon: SearchHorizon::Days(3) },
        SlotRequest { provider_id: Ulid::new(), after: MONDAY, duration_minutes: 30, horizon: SearchHorizon::SameDay },
    ];
    let batch = fx.engine.batch_find_slots(&requests).await.unwrap();
    for (r, got) in requests.iter().zip(&batch).take(2) {
        let single = fx
            .engine
            .find_next_slot(r.provider_id, r.after, r.duration_minutes, r.horizon)
            .await
            .unwrap();
        assert_eq!(*got, single);
    }
    assert_eq!(batch[0], Some(MONDAY + 10 * H + 10 * M));
    assert_eq!(batch[1], Some(MONDAY + 11 * H));
    assert_eq!(batch[2], None);
}

// ── Delay propagation ────────────────────────────────────

#[tokio::test]
async fn late_start_ripples_downstream() {
    let fx = fixture("late_start.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c1 = fx.client("cy", true).await;
    let c2 = fx.client("dee", true).await;
    let a = fx.book(p, c1, MONDAY + 9 * H, 30).await;
    let b = fx.book(p, c2, MONDAY + 9 * H + 30 * M, 30).await;
    let later = fx.book(p, c1, MONDAY + 10 * H + 30 * M, 30).await;

    fx.at(MONDAY + 9 * H + 25 * M);
    let r = report(fx.engine.start_appointment(a, ActionSource::Manual).await.unwrap());
    assert_eq!(r.delay_minutes, 25);
    assert_eq!(r.assessment, Assessment::Significant);
    assert_eq!(r.rippled, 1);

    assert_eq!(fx.apt(a).await.delay_minutes, 25);
    assert_eq!(fx.apt(a).await.status, AppointmentStatus::Active);
    let b_now = fx.apt(b).await;
    assert_eq!(b_now.delay_minutes, 25);
    assert_eq!(b_now.notifications_sent, 1);
    // B ends 10:25, so the 10:30 appointment is untouched.
    assert_eq!(fx.apt(later).await.delay_minutes, 0);

    let to_client = fx.messages.sent_to("dee@mail");
    assert_eq!(to_client.len(), 1);
    assert!(to_client[0].contains("25 mins late"));
    assert!(to_client[0].contains("09:55"));
    assert_eq!(fx.messages.sent_to("admin@studio").len(), 1);
    assert_eq!(fx.audit.named("CRISIS_ALERT").len(), 1);
    assert_eq!(fx.audit.named("APPOINTMENT_STARTED").len(), 1);
}

#[tokio::test]
async fn minor_lateness_records_but_does_not_ripple() {
    let fx = fixture("minor_lateness.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    let a = fx.book(p, c, MONDAY + 9 * H, 60).await;
    let b = fx.book(p, c, MONDAY + 10 * H, 60).await;

    fx.at(MONDAY + 9 * H + 5 * M);
    let r = report(fx.engine.start_appointment(a, ActionSource::Manual).await.unwrap());
    assert_eq!(r.assessment, Assessment::Minor);
    assert_eq!(r.rippled, 0);
    assert_eq!(fx.apt(a).await.delay_minutes, 5);
    assert_eq!(fx.apt(b).await.delay_minutes, 0);
    assert!(fx.messages.sent().is_empty());
}

#[tokio::test]
async fn catching_up_propagates_below_threshold() {
    let fx = fixture("catch_up.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    let a = fx.book(p, c, MONDAY + 9 * H, 60).await;
    let b = fx.book(p, c, MONDAY + 10 * H, 60).await;

    fx.at(MONDAY + 9 * H + 25 * M);
    fx.engine.start_appointment(a, ActionSource::Manual).await.unwrap();
    assert_eq!(fx.apt(b).await.delay_minutes, 25);

    fx.at(MONDAY + 10 * H + 8 * M);
    let r = report(fx.engine.end_appointment(a, ActionSource::Manual).await.unwrap());
    assert_eq!(r.delay_minutes, 8);
    assert_eq!(r.assessment, Assessment::CatchingUp);
    assert_eq!(fx.apt(b).await.delay_minutes, 8);
    assert_eq!(fx.apt(a).await.status, AppointmentStatus::Completed);
}

#[tokio::test]
async fn notices_are_capped_at_two() {
    let fx = fixture("notice_cap.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    let watched = fx.client("dee", true).await;
    let a1 = fx.book(p, c, MONDAY + 9 * H, 30).await;
    let a2 = fx.book(p, c, MONDAY + 9 * H + 30 * M, 30).await;
    let b = fx.book(p, watched, MONDAY + 10 * H, 30).await;

    fx.at(MONDAY + 9 * H + 20 * M);
    fx.engine.start_appointment(a1, ActionSource::Manual).await.unwrap();
    assert_eq!(fx.apt(b).await.delay_minutes, 20);

    fx.at(MONDAY + 9 * H + 30 * M);
    fx.engine.end_appointment(a1, ActionSource::Manual).await.unwrap();
    assert_eq!(fx.apt(b).await.delay_minutes, 0);

    fx.at(MONDAY + 9 * H + 55 * M);
    fx.engine.start_appointment(a2, ActionSource::Manual).await.unwrap();
    let b_now = fx.apt(b).await;
    assert_eq!(b_now.delay_minutes, 25);
    assert_eq!(b_now.notifications_sent, 2);

    let texts = fx.messages.sent_to("dee@mail");
    assert_eq!(texts.len(), 2);
    assert!(texts[1].contains("back on schedule"));
}

#[tokio::test]
async fn opted_out_client_falls_back_to_provider() {
    let fx = fixture("notice_fallback.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", false).await;
    let a = fx.book(p, c, MONDAY + 9 * H, 30).await;
    fx.book(p, c, MONDAY + 9 * H + 30 * M, 30).await;

    fx.at(MONDAY + 9 * H + 20 * M);
    fx.engine.start_appointment(a, ActionSource::Manual).await.unwrap();
    assert!(fx.messages.sent_to("cy@mail").is_empty());
    let to_provider = fx.messages.sent_to("ana@staff");
    assert_eq!(to_provider.len(), 1);
    assert!(to_provider[0].contains("Could not reach cy"));
}

#[tokio::test]
async fn failed_delivery_still_counts_as_attempt() {
    let fx = fixture("notice_failure.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    let a = fx.book(p, c, MONDAY + 9 * H, 30).await;
    let b = fx.book(p, c, MONDAY + 9 * H + 30 * M, 30).await;
    fx.messages.set_failing(true);

    fx.at(MONDAY + 9 * H + 20 * M);
    let r = report(fx.engine.start_appointment(a, ActionSource::Manual).await.unwrap());
    assert_eq!(r.notices, 1);
    assert_eq!(fx.apt(b).await.notifications_sent, 1);
}

#[tokio::test]
async fn crisis_alerts_are_throttled() {
    let fx = fixture("crisis_throttle.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    let a1 = fx.book(p, c, MONDAY + 9 * H, 30).await;
    let a2 = fx.book(p, c, MONDAY + 9 * H + 30 * M, 30).await;
    fx.book(p, c, MONDAY + 10 * H, 30).await;

    fx.at(MONDAY + 9 * H + 20 * M);
    fx.engine.start_appointment(a1, ActionSource::Manual).await.unwrap();
    assert_eq!(fx.audit.named("CRISIS_ALERT").len(), 1);

    // 18 late and catching up: ripples, but within the cooldown and not 15 worse.
    fx.at(MONDAY + 9 * H + 48 * M);
    let r = report(fx.engine.start_appointment(a2, ActionSource::Manual).await.unwrap());
    assert_eq!(r.assessment, Assessment::CatchingUp);
    assert_eq!(fx.audit.named("CRISIS_ALERT").len(), 1);
    assert_eq!(fx.messages.sent_to("admin@studio").len(), 1);
}

#[tokio::test]
async fn overrun_scan_pushes_delay_forward() {
    let fx = fixture("overrun.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    let a = fx.book(p, c, MONDAY + 9 * H, 60).await;
    let b = fx.book(p, c, MONDAY + 10 * H, 30).await;

    fx.at(MONDAY + 9 * H);
    fx.engine.start_appointment(a, ActionSource::Manual).await.unwrap();

    fx.at(MONDAY + 10 * H + 10 * M);
    assert_eq!(fx.engine.scan_overruns(fx.business.id).await.unwrap(), 0);

    fx.at(MONDAY + 10 * H + 20 * M);
    assert_eq!(fx.engine.scan_overruns(fx.business.id).await.unwrap(), 1);
    assert_eq!(fx.apt(a).await.delay_minutes, 20);
    assert_eq!(fx.apt(b).await.delay_minutes, 20);

    fx.at(MONDAY + 10 * H + 25 * M);
    assert_eq!(fx.engine.scan_overruns(fx.business.id).await.unwrap(), 0);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn repeated_start_and_end_are_noops() {
    let fx = fixture("idempotent.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    let a = fx.book(p, c, MONDAY + 9 * H, 30).await;

    let err = fx.engine.end_appointment(a, ActionSource::Manual).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { from: AppointmentStatus::Pending, .. }));

    fx.at(MONDAY + 9 * H + 25 * M);
    fx.engine.start_appointment(a, ActionSource::Autopilot).await.unwrap();
    fx.at(MONDAY + 9 * H + 40 * M);
    assert_eq!(
        fx.engine.start_appointment(a, ActionSource::Manual).await.unwrap(),
        Transition::AlreadyApplied
    );
    assert_eq!(fx.apt(a).await.actual_start, Some(MONDAY + 9 * H + 25 * M));

    fx.engine.end_appointment(a, ActionSource::Manual).await.unwrap();
    fx.at(MONDAY + 10 * H);
    assert_eq!(
        fx.engine.end_appointment(a, ActionSource::Autopilot).await.unwrap(),
        Transition::AlreadyApplied
    );
    assert_eq!(fx.apt(a).await.actual_end, Some(MONDAY + 9 * H + 40 * M));
}

#[tokio::test]
async fn close_only_from_pending() {
    let fx = fixture("close.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    let a = fx.book(p, c, MONDAY + 9 * H, 30).await;

    fx.engine.close_appointment(a, CloseReason::Cancelled, ActionSource::Manual).await.unwrap();
    fx.engine.close_appointment(a, CloseReason::Cancelled, ActionSource::Manual).await.unwrap();
    let err = fx
        .engine
        .close_appointment(a, CloseReason::NoShow, ActionSource::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { from: AppointmentStatus::Cancelled, .. }));

    // The slot is free again.
    fx.book(p, c, MONDAY + 9 * H, 30).await;
}

// ── Rebalancing ──────────────────────────────────────────

#[tokio::test]
async fn smart_reassignment_respects_skills() {
    let fx = fixture("smart_reassign.wal").await;
    let a = fx.provider("ana", 0, &["color"]).await;
    let b = fx.provider("ben", 0, &[]).await;
    let c = fx.provider("cat", 0, &["color"]).await;
    let cl = fx.client("cy", true).await;
    let first = fx.book(a, cl, MONDAY + 9 * H, 60).await;
    let delayed = fx.book_with_skills(a, cl, MONDAY + 10 * H, 60, &["color"]).await;

    fx.at(MONDAY + 9 * H + 40 * M);
    fx.engine.start_appointment(first, ActionSource::Manual).await.unwrap();
    assert_eq!(fx.apt(delayed).await.delay_minutes, 40);

    let proposals = fx.engine.smart_reassignments(fx.business.id).await.unwrap();
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].to_provider, c);
    assert_ne!(proposals[0].to_provider, b);

    let applied = fx
        .engine
        .apply_reassignments(fx.business.id, Some([delayed].as_slice()), ActionSource::Manual)
        .await
        .unwrap();
    assert_eq!(applied.len(), 1);
    let moved = fx.apt(delayed).await;
    assert_eq!(moved.provider_id, c);
    assert_eq!(moved.shifted_from_id, Some(a));
    assert_eq!(moved.delay_minutes, 0);
}

#[tokio::test]
async fn unplaceable_delay_is_escalated_once() {
    let fx = fixture("escalate.wal").await;
    let a = fx.provider("ana", 0, &[]).await;
    let cl = fx.client("cy", true).await;
    let first = fx.book(a, cl, MONDAY + 9 * H, 60).await;
    fx.book(a, cl, MONDAY + 10 * H, 60).await;

    fx.at(MONDAY + 9 * H + 40 * M);
    fx.engine.start_appointment(first, ActionSource::Manual).await.unwrap();
    let before = fx.messages.sent_to("admin@studio").len();

    assert!(fx.engine.smart_reassignments(fx.business.id).await.unwrap().is_empty());
    assert!(fx.engine.smart_reassignments(fx.business.id).await.unwrap().is_empty());
    assert_eq!(fx.messages.sent_to("admin@studio").len(), before + 1);
    assert_eq!(fx.audit.named("DELAY_ESCALATED").len(), 1);
}

#[tokio::test]
async fn escalations_are_forgotten_once_resolved() {
    let fx = fixture("escalate_prune.wal").await;
    let a = fx.provider("ana", 0, &[]).await;
    let cl = fx.client("cy", true).await;
    let first = fx.book(a, cl, MONDAY + 9 * H, 60).await;
    let second = fx.book(a, cl, MONDAY + 10 * H, 60).await;
    let tuesday = fx.book(a, cl, MONDAY + 33 * H, 60).await;

    fx.at(MONDAY + 9 * H + 40 * M);
    fx.engine.start_appointment(first, ActionSource::Manual).await.unwrap();
    fx.engine.smart_reassignments(fx.business.id).await.unwrap();
    assert!(fx.engine.escalated.contains_key(&second));

    fx.engine.close_appointment(second, CloseReason::Cancelled, ActionSource::Manual).await.unwrap();
    fx.engine.smart_reassignments(fx.business.id).await.unwrap();
    assert!(fx.engine.escalated.is_empty());

    // A stale entry from an earlier day goes on the next pass.
    fx.engine.escalated.insert(tuesday, MONDAY + 9 * H);
    fx.at(MONDAY + 33 * H + 30 * M);
    fx.engine.smart_reassignments(fx.business.id).await.unwrap();
    assert!(fx.engine.escalated.is_empty());
}

#[tokio::test]
async fn manual_shift_recomputes_target_timeline() {
    let fx = fixture("manual_shift.wal").await;
    let a = fx.provider("ana", 0, &[]).await;
    let b = fx.provider("ben", 0, &[]).await;
    let cl = fx.client("cy", true).await;
    let first = fx.book(a, cl, MONDAY + 9 * H, 60).await;
    let second = fx.book(a, cl, MONDAY + 10 * H, 30).await;

    fx.at(MONDAY + 9 * H + 30 * M);
    fx.engine.start_appointment(first, ActionSource::Manual).await.unwrap();
    assert_eq!(fx.apt(second).await.delay_minutes, 30);

    fx.engine.shift_appointment(second, b, ActionSource::Manual).await.unwrap();
    let moved = fx.apt(second).await;
    assert_eq!(moved.provider_id, b);
    assert_eq!(moved.shifted_from_id, Some(a));
    assert_eq!(moved.status, AppointmentStatus::Pending);
    assert_eq!(moved.delay_minutes, 0);
    assert!(fx.messages.sent_to("cy@mail").iter().any(|t| t.contains("now be with ben")));
    assert!(!fx.messages.sent_to("ben@staff").is_empty());

    let err = fx.engine.shift_appointment(first, b, ActionSource::Manual).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn transfer_accept_moves_and_rejects_siblings() {
    let fx = fixture("transfer.wal").await;
    let a = fx.provider("ana", 0, &[]).await;
    let b = fx.provider("ben", 0, &[]).await;
    let c = fx.provider("cat", 0, &[]).await;
    let cl = fx.client("cy", true).await;
    let apt = fx.book(a, cl, MONDAY + 10 * H, 30).await;
    fx.book(c, cl, MONDAY + 10 * H, 30).await;

    let to_b = fx.engine.request_transfer(Ulid::new(), apt, b).await.unwrap();
    let to_c = fx.engine.request_transfer(Ulid::new(), apt, c).await.unwrap();

    let err = fx
        .engine
        .resolve_transfer(to_c.id, true, ActionSource::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unavailable(Availability::Busy { .. })));

    fx.engine.resolve_transfer(to_b.id, true, ActionSource::Manual).await.unwrap();
    assert_eq!(fx.apt(apt).await.provider_id, b);
    let statuses: Vec<TransferStatus> = fx.engine.list_transfers(&apt).iter().map(|t| t.status).collect();
    assert!(statuses.contains(&TransferStatus::Accepted));
    assert!(statuses.contains(&TransferStatus::Rejected));
    assert!(!statuses.contains(&TransferStatus::Pending));
}

#[tokio::test]
async fn concurrent_accepts_move_the_appointment_once() {
    let fx = fixture("transfer_race.wal").await;
    let a = fx.provider("ana", 0, &[]).await;
    let b = fx.provider("ben", 0, &[]).await;
    let c = fx.provider("cat", 0, &[]).await;
    let cl = fx.client("cy", true).await;
    let apt = fx.book(a, cl, MONDAY + 10 * H, 30).await;

    let to_b = fx.engine.request_transfer(Ulid::new(), apt, b).await.unwrap();
    let to_c = fx.engine.request_transfer(Ulid::new(), apt, c).await.unwrap();

    let (first, second) = tokio::join!(
        fx.engine.resolve_transfer(to_b.id, true, ActionSource::Manual),
        fx.engine.resolve_transfer(to_c.id, true, ActionSource::Manual),
    );
    assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);

    let owner = fx.apt(apt).await.provider_id;
    assert!(owner == b || owner == c);
    for other in [a, b, c].into_iter().filter(|p| *p != owner) {
        let day = fx.engine.list_appointments(&other, None).await.unwrap();
        assert!(day.iter().all(|x| x.id != apt));
    }
    let mut statuses: Vec<TransferStatus> = fx.engine.list_transfers(&apt).iter().map(|t| t.status).collect();
    statuses.sort_by_key(|s| *s != TransferStatus::Accepted);
    assert_eq!(statuses, vec![TransferStatus::Accepted, TransferStatus::Rejected]);
}

#[tokio::test]
async fn health_reflects_remaining_capacity() {
    let fx = fixture("health.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    fx.at(MONDAY + 15 * H);
    fx.book(p, c, MONDAY + 15 * H + 30 * M, 90).await;

    let health = fx.engine.system_health(fx.business.id).await.unwrap();
    assert_eq!(health.online_providers, 1);
    assert_eq!(health.capacity_minutes, 120);
    assert_eq!(health.load_minutes, 90);
    assert_eq!(health.status, HealthStatus::Healthy);

    fx.engine.set_presence(p, false).await.unwrap();
    let health = fx.engine.system_health(fx.business.id).await.unwrap();
    assert_eq!(health.status, HealthStatus::Critical);
}

// ── Autopilot & lease ────────────────────────────────────

#[tokio::test]
async fn lease_has_a_single_holder() {
    let fx = fixture("lease.wal").await;
    let bid = fx.business.id;
    assert!(fx.engine.try_acquire_lease(bid, "one").await.unwrap());
    assert!(fx.engine.is_leader(bid, "one"));
    assert!(!fx.engine.is_leader(bid, "two"));
    assert!(!fx.engine.try_acquire_lease(bid, "two").await.unwrap());

    fx.clock.advance(LEASE_STALE_MS + 1);
    assert!(fx.engine.is_leader(bid, "two"));
    assert!(fx.engine.try_acquire_lease(bid, "two").await.unwrap());
    assert!(!fx.engine.is_leader(bid, "one"));
    assert_eq!(fx.engine.lease_holder(&bid).unwrap().holder, "two");

    let err = fx.engine.try_acquire_lease(Ulid::new(), "one").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn lease_survives_restart() {
    let fx = fixture("lease_replay.wal").await;
    let bid = fx.business.id;
    fx.engine.renew_lease(bid, "node-a").await.unwrap();
    let renewed_at = fx.engine.lease_holder(&bid).unwrap().renewed_at;

    let path = fx.path.clone();
    drop(fx);
    let engine = Engine::new(path, Arc::new(NotifyHub::new()))
        .unwrap()
        .with_clock(Arc::new(ManualClock::new(renewed_at + 1_000)));
    assert_eq!(engine.lease_holder(&bid).unwrap().holder, "node-a");
    assert!(!engine.is_leader(bid, "node-b"));

    let config = AutopilotConfig { pacing: std::time::Duration::ZERO, ..AutopilotConfig::default() };
    let outcome = engine.run_autopilot_cycle(bid, "node-b", &config).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Standby);
}

#[tokio::test]
async fn autopilot_starts_and_ends_sessions() {
    let fx = fixture("autopilot.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    let a = fx.book(p, c, MONDAY + 9 * H, 30).await;
    let config = AutopilotConfig { pacing: std::time::Duration::ZERO, ..AutopilotConfig::default() };

    fx.at(MONDAY + 9 * H + 2 * M);
    let outcome = fx.engine.run_autopilot_cycle(fx.business.id, "one", &config).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Ran { started: 1, ended: 0, .. }));
    assert_eq!(fx.apt(a).await.status, AppointmentStatus::Active);

    let standby = fx.engine.run_autopilot_cycle(fx.business.id, "two", &config).await.unwrap();
    assert_eq!(standby, CycleOutcome::Standby);

    fx.at(MONDAY + 9 * H + 45 * M);
    let outcome = fx.engine.run_autopilot_cycle(fx.business.id, "one", &config).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Ran { ended: 1, .. }));
    assert_eq!(fx.apt(a).await.status, AppointmentStatus::Completed);
    let started = fx.audit.named("APPOINTMENT_STARTED");
    assert_eq!(started[0].metadata["source"], "autopilot");
}

#[tokio::test]
async fn autopilot_applies_reassignments_in_apply_mode() {
    let fx = fixture("autopilot_apply.wal").await;
    let mut business = fx.business.clone();
    business.rebalance_mode = RebalanceMode::Apply;
    fx.engine.upsert_business(business).await.unwrap();
    let a = fx.provider("ana", 0, &[]).await;
    let b = fx.provider("ben", 0, &[]).await;
    let cl = fx.client("cy", true).await;
    let first = fx.book(a, cl, MONDAY + 9 * H, 60).await;
    let second = fx.book(a, cl, MONDAY + 10 * H, 60).await;

    fx.at(MONDAY + 9 * H + 40 * M);
    fx.engine.start_appointment(first, ActionSource::Manual).await.unwrap();
    let config = AutopilotConfig { pacing: std::time::Duration::ZERO, ..AutopilotConfig::default() };
    let outcome = fx.engine.run_autopilot_cycle(fx.business.id, "one", &config).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Ran { reassigned: 1, .. }));
    assert_eq!(fx.apt(second).await.provider_id, b);
}

#[tokio::test]
async fn autopilot_reminds_opted_in_clients_once() {
    let fx = fixture("reminders.wal").await;
    let a = fx.provider("ana", 0, &[]).await;
    let b = fx.provider("ben", 0, &[]).await;
    let cy = fx.client("cy", true).await;
    let dee = fx.client("dee", false).await;
    let soon = fx.book(a, cy, MONDAY + 10 * H, 30).await;
    let quiet = fx.book(b, dee, MONDAY + 10 * H, 30).await;
    let later = fx.book(a, cy, MONDAY + 11 * H, 30).await;
    let config = AutopilotConfig { pacing: std::time::Duration::ZERO, ..AutopilotConfig::default() };

    fx.at(MONDAY + 9 * H + 30 * M);
    let outcome = fx.engine.run_autopilot_cycle(fx.business.id, "one", &config).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Ran { reminded: 1, .. }));
    let texts = fx.messages.sent_to("cy@mail");
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("ana"));
    assert!(texts[0].contains("10:00"));
    assert!(fx.messages.sent_to("dee@mail").is_empty());
    assert!(fx.apt(soon).await.reminder_sent);
    assert!(!fx.apt(quiet).await.reminder_sent);
    assert!(!fx.apt(later).await.reminder_sent);

    fx.at(MONDAY + 9 * H + 32 * M);
    let outcome = fx.engine.run_autopilot_cycle(fx.business.id, "one", &config).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Ran { reminded: 0, .. }));
    assert_eq!(fx.messages.sent_to("cy@mail").len(), 1);

    let path = fx.path.clone();
    drop(fx);
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert!(engine.get_appointment(&soon).await.unwrap().reminder_sent);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_lifecycle_and_delays() {
    let fx = fixture("replay.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    let a = fx.book(p, c, MONDAY + 9 * H, 30).await;
    let b = fx.book(p, c, MONDAY + 9 * H + 30 * M, 30).await;
    fx.at(MONDAY + 9 * H + 25 * M);
    fx.engine.start_appointment(a, ActionSource::Manual).await.unwrap();

    let path = fx.path.clone();
    drop(fx);
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let a_back = engine.get_appointment(&a).await.unwrap();
    assert_eq!(a_back.status, AppointmentStatus::Active);
    assert_eq!(a_back.delay_minutes, 25);
    assert_eq!(engine.get_appointment(&b).await.unwrap().delay_minutes, 25);
    assert_eq!(engine.get_provider(&p).await.unwrap().hours.len(), 5);
}

#[tokio::test]
async fn compaction_keeps_live_state() {
    let fx = fixture("compact.wal").await;
    let p = fx.provider("ana", 0, &["cut"]).await;
    let c = fx.client("cy", true).await;
    let a = fx.book(p, c, MONDAY + 9 * H, 30).await;
    fx.engine.close_appointment(a, CloseReason::NoShow, ActionSource::Manual).await.unwrap();
    assert!(fx.engine.wal_appends_since_compact().await > 0);

    let written = fx.engine.compact_wal().await.unwrap();
    assert!(written.is_some());
    assert_eq!(fx.engine.wal_appends_since_compact().await, 0);

    let path = fx.path.clone();
    drop(fx);
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(engine.get_appointment(&a).await.unwrap().status, AppointmentStatus::NoShow);
    assert!(engine.get_client(&c).is_some());
    assert_eq!(engine.get_provider(&p).await.unwrap().skills.len(), 1);
}

#[tokio::test]
async fn booking_notifies_provider_channel() {
    let fx = fixture("notify_booking.wal").await;
    let p = fx.provider("ana", 0, &[]).await;
    let c = fx.client("cy", true).await;
    let mut rx = fx.engine.notify.subscribe(p);
    let a = fx.book(p, c, MONDAY + 9 * H, 30).await;
    match rx.recv().await.unwrap() {
        Event::AppointmentBooked(apt) => assert_eq!(apt.id, a),
        other => panic!("unexpected event {}", other.name()),
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use arbiter::engine::{Engine, EngineError, ReservationFilter};
use arbiter::model::{Ms, Reservation, ReservationStatus, Span};
use arbiter::notify::NotifyHub;
use arbiter::oracle::{Judgment, Oracle, OracleAdapter, OracleError, ParsedIntent};

const T0: Ms = 1_800_000_000_000;
const HOUR: Ms = 3_600_000;

/// Reads requests of the form `"<purpose> <start_hour> <end_hour> <score>"`.
/// Judgments always fail, so conflicts are decided by priority.
struct Scripted;

fn fields(text: &str) -> Result<(&str, Ms, Ms, i64), OracleError> {
    let bad = || OracleError::InvalidResponse(text.to_string());
    let mut parts = text.split_whitespace();
    let purpose = parts.next().ok_or_else(bad)?;
    let start = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let end = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let score = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    Ok((purpose, start, end, score))
}

#[async_trait]
impl Oracle for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn parse_intent(&self, text: &str, reference: Ms) -> Result<ParsedIntent, OracleError> {
        let (_, start, end, _) = fields(text)?;
        Ok(ParsedIntent {
            // Keep the whole text so the score can be recovered from the purpose.
            purpose: text.to_string(),
            span: Span::new(reference + start * HOUR, reference + end * HOUR),
            preference: None,
        })
    }

    async fn score_priority(&self, purpose: &str, _hours: f64) -> Result<i64, OracleError> {
        fields(purpose).map(|(_, _, _, score)| score)
    }

    async fn judge_conflict(
        &self,
        _candidate: &Reservation,
        _incumbent: &Reservation,
    ) -> Result<Judgment, OracleError> {
        Err(OracleError::NotConfigured)
    }
}

fn start_engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("arbiter_int_{name}_{}", ulid::Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let adapter = OracleAdapter::new(Arc::new(Scripted), Duration::from_secs(5));
    Arc::new(Engine::new(dir.join("arbiter.wal"), Arc::new(NotifyHub::new()), adapter).unwrap())
}

async fn all_reservations(engine: &Engine) -> Vec<Reservation> {
    engine.list_reservations(&ReservationFilter::default()).await
}

async fn assert_confirmed_disjoint(engine: &Engine) {
    let confirmed: Vec<_> = all_reservations(engine)
        .await
        .into_iter()
        .filter(|r| r.status == ReservationStatus::Confirmed)
        .collect();
    for (i, a) in confirmed.iter().enumerate() {
        for b in &confirmed[i + 1..] {
            assert!(
                a.server_id != b.server_id || !a.span.overlaps(&b.span),
                "confirmed {} {:?} and {} {:?} overlap",
                a.id,
                a.span,
                b.id,
                b.span
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn disjoint_windows_all_confirm() {
    let engine = start_engine("disjoint");
    engine.create_server("gpu-a", None, None, 8).await.unwrap();

    let tasks = (0..32).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let text = format!("job-{i} {} {} 50", i * 2, i * 2 + 2);
            engine.create_reservation_at(&format!("u{i}"), &text, T0).await
        })
    });
    for result in join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap().status, ReservationStatus::Confirmed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn identical_windows_confirm_exactly_one() {
    let engine = start_engine("identical");
    engine.create_server("gpu-a", None, None, 8).await.unwrap();

    let tasks = (0..32).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .create_reservation_at(&format!("u{i}"), "same 1 3 50", T0)
                .await
        })
    });
    let statuses: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap().status)
        .collect();
    let confirmed = statuses
        .iter()
        .filter(|s| **s == ReservationStatus::Confirmed)
        .count();
    assert_eq!(confirmed, 1);
    // Equal priority never displaces, so everyone else lost outright.
    assert!(
        statuses
            .iter()
            .all(|s| matches!(s, ReservationStatus::Confirmed | ReservationStatus::Rejected))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn mixed_load_across_servers_keeps_confirmed_disjoint() {
    let engine = start_engine("mixed");
    for name in ["gpu-a", "gpu-b", "gpu-c"] {
        engine.create_server(name, None, None, 8).await.unwrap();
    }

    let tasks = (0..90i64).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let start = (i * 7) % 24;
            let len = 1 + (i % 4);
            let score = (i * 37) % 101;
            let text = format!("job-{i} {start} {} {score}", start + len);
            engine.create_reservation_at(&format!("u{}", i % 10), &text, T0).await
        })
    });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }
    assert_confirmed_disjoint(&engine).await;

    // Answer every outstanding notice concurrently, alternating accept and contest.
    let notices = engine
        .list_reservations(&ReservationFilter {
            pending_rejection: true,
            ..Default::default()
        })
        .await;
    let answers = notices.into_iter().enumerate().map(|(i, r)| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .resolve_confirmation(r.id, &r.requester_id, i % 2 == 0, None)
                .await
        })
    });
    for result in join_all(answers).await {
        match result.unwrap() {
            // An earlier contest may have rejected this displacer's sibling,
            // or a restore may be blocked; both leave state untouched.
            Ok(_) | Err(EngineError::NotFound(_)) | Err(EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_confirmed_disjoint(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_answers_to_one_notice_have_one_winner() {
    let engine = start_engine("race");
    engine.create_server("gpu-a", None, None, 8).await.unwrap();
    let demo = engine
        .create_reservation_at("alice", "demo 1 3 20", T0)
        .await
        .unwrap();
    let deadline = engine
        .create_reservation_at("bob", "deadline 2 4 90", T0)
        .await
        .unwrap();
    assert_eq!(deadline.status, ReservationStatus::Pending);

    let tasks = (0..16).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .resolve_confirmation(demo.id, "alice", i % 2 == 0, None)
                .await
        })
    });
    let successes = join_all(tasks)
        .await
        .into_iter()
        .filter(|r| r.as_ref().unwrap().is_ok())
        .count();
    assert_eq!(successes, 1);
    assert_confirmed_disjoint(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn state_after_concurrent_load_survives_restart() {
    let dir = std::env::temp_dir().join(format!("arbiter_int_restart_{}", ulid::Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let wal = dir.join("arbiter.wal");
    let open = || {
        let adapter = OracleAdapter::new(Arc::new(Scripted), Duration::from_secs(5));
        Engine::new(wal.clone(), Arc::new(NotifyHub::new()), adapter).unwrap()
    };

    let before = {
        let engine = Arc::new(open());
        engine.create_server("gpu-a", None, None, 8).await.unwrap();
        engine.create_server("gpu-b", None, None, 8).await.unwrap();
        let tasks = (0..40i64).map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let text = format!("job-{i} {} {} {}", i % 12, i % 12 + 2, (i * 13) % 100);
                engine.create_reservation_at("u", &text, T0).await
            })
        });
        for result in join_all(tasks).await {
            result.unwrap().unwrap();
        }
        all_reservations(&engine).await
    };

    let engine = open();
    assert_eq!(all_reservations(&engine).await, before);
    assert_confirmed_disjoint(&engine).await;
}

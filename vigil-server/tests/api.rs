mod common;

use std::{future::IntoFuture, time::Duration};

use axum::http::{HeaderName, HeaderValue, StatusCode};
use serde_json::Value;
use vigil_model::{JobId, JobPage, JobRecord, JobStatistics, JobStatus};

use common::{
    FAILS_WITH_SIGNATURE, HANGS_AFTER_FIRST_UNIT, TWO_UNITS, TestApp, job_body,
    job_path,
};

const UNITS: [&str; 2] = ["dan.Dan_11_0", "encoding.InjectHex"];

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(str::trim)
}

/// Data payloads of every `snapshot` event in an SSE body.
fn snapshot_payloads(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter(|block| {
            block.lines().any(|line| field(line, "event") == Some("snapshot"))
        })
        .filter_map(|block| {
            block
                .lines()
                .find_map(|line| field(line, "data"))
                .map(|data| serde_json::from_str(data).unwrap())
        })
        .collect()
}

#[tokio::test]
async fn health_reports_capacity() {
    let app = TestApp::with_limit(TWO_UNITS, 3);
    let response = app.server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["capacity"], 3);
    assert_eq!(body["active_jobs"], 0);
}

#[tokio::test]
async fn completed_job_is_observable_end_to_end() {
    let app = TestApp::spawn(TWO_UNITS);
    let id = JobId::generate();

    let response = app.server.post(&job_path(id)).json(&job_body(&UNITS)).await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);
    let accepted: JobRecord = response.json();
    assert_eq!(accepted.id, id);
    assert_eq!(accepted.status, JobStatus::Pending);
    assert_eq!(accepted.total_units, 2);

    // The live stream closes by itself once the job is terminal.
    let progress = app.server.get(&format!("{}/progress", job_path(id))).await;
    assert_eq!(progress.status_code(), StatusCode::OK);
    assert!(
        progress
            .header("content-type")
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    let text = progress.text();
    assert!(text.lines().any(|line| field(line, "retry") == Some("1500")));
    let snapshots = snapshot_payloads(&text);
    let last = snapshots.last().expect("at least one snapshot");
    assert_eq!(last["status"], "completed");
    assert_eq!(last["completed_units"], 2);
    assert!(last.get("error_message").is_some());
    let terminal = snapshots
        .iter()
        .filter(|s| s["status"] == "completed")
        .count();
    assert_eq!(terminal, 1);

    let status: JobRecord = app.server.get(&job_path(id)).await.json();
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.completed_units, 2);
    assert_eq!((status.pass_count, status.fail_count), (1, 1));
    assert_eq!(status.artifact_keys, vec![format!("jobs/{id}/report.jsonl")]);

    let stats = app
        .server
        .get(&format!("{}/statistics", job_path(id)))
        .await;
    assert_eq!(stats.status_code(), StatusCode::OK);
    let stats: JobStatistics = stats.json();
    assert_eq!((stats.totals.passed, stats.totals.total), (8, 10));
    assert_eq!(stats.eval_entries, 2);

    let artifact = app
        .server
        .get(&format!("{}/artifacts/report.jsonl", job_path(id)))
        .await;
    assert_eq!(artifact.status_code(), StatusCode::OK);
    assert_eq!(artifact.text().lines().count(), 2);
    assert!(artifact.text().contains("\"entry_type\":\"eval\""));

    let missing = app
        .server
        .get(&format!("{}/artifacts/report.html", job_path(id)))
        .await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

    let aggregate: Value = app.server.get("/api/v1/statistics").await.json();
    assert_eq!(aggregate["job_count"], 1);
    assert_eq!(aggregate["totals"]["passed"], 8);
}

#[tokio::test]
async fn cancel_keeps_results_gathered_so_far() {
    let app = TestApp::spawn(HANGS_AFTER_FIRST_UNIT);
    let id = JobId::generate();
    app.server.post(&job_path(id)).json(&job_body(&UNITS)).await;

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let record: JobRecord = app.server.get(&job_path(id)).await.json();
            if record.completed_units == 1 && record.status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("first unit reported");

    let cancel = app
        .server
        .post(&format!("{}/cancel", job_path(id)))
        .await;
    assert_eq!(cancel.status_code(), StatusCode::ACCEPTED);
    assert_eq!(cancel.json::<Value>()["status"], "cancelling");

    let progress = app.server.get(&format!("{}/progress", job_path(id))).await;
    let snapshots = snapshot_payloads(&progress.text());
    assert_eq!(snapshots.last().unwrap()["status"], "cancelled");

    let record: JobRecord = app.server.get(&job_path(id)).await.json();
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.completed_units, 1);

    let again = app
        .server
        .post(&format!("{}/cancel", job_path(id)))
        .await;
    assert_eq!(again.status_code(), StatusCode::OK);
    assert_eq!(again.json::<Value>()["status"], "cancelled");
}

#[tokio::test]
async fn admission_ceiling_answers_429() {
    let app = TestApp::with_limit(HANGS_AFTER_FIRST_UNIT, 1);
    let ids = [JobId::generate(), JobId::generate()];

    // Both requests are in flight together; exactly one gets the slot.
    let body = job_body(&UNITS);
    let requests = ids
        .iter()
        .map(|id| app.server.post(&job_path(*id)).json(&body).into_future());
    let responses = futures::future::join_all(requests).await;

    let statuses: Vec<StatusCode> =
        responses.iter().map(|r| r.status_code()).collect();
    assert_eq!(
        statuses.iter().filter(|s| **s == StatusCode::ACCEPTED).count(),
        1,
        "{statuses:?}"
    );
    let busy = responses
        .iter()
        .find(|r| r.status_code() == StatusCode::TOO_MANY_REQUESTS)
        .expect("one request over the ceiling");
    let body: Value = busy.json();
    assert_eq!(body["error"]["status"], 429);

    let admitted = if statuses[0] == StatusCode::ACCEPTED {
        ids[0]
    } else {
        ids[1]
    };
    let duplicate = app
        .server
        .post(&job_path(admitted))
        .json(&job_body(&UNITS))
        .await;
    assert_eq!(duplicate.status_code(), StatusCode::CONFLICT);

    // Active jobs cannot be deleted.
    let delete = app.server.delete(&job_path(admitted)).await;
    assert_eq!(delete.status_code(), StatusCode::CONFLICT);

    app.state.registry.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn failed_scan_reports_reason_on_every_channel() {
    let app = TestApp::spawn(FAILS_WITH_SIGNATURE);
    let id = JobId::generate();
    app.server.post(&job_path(id)).json(&job_body(&UNITS)).await;

    let progress = app.server.get(&format!("{}/progress", job_path(id))).await;
    let snapshots = snapshot_payloads(&progress.text());
    let last = snapshots.last().unwrap();
    assert_eq!(last["status"], "failed");
    assert_eq!(
        last["error_message"],
        "BadGeneratorException: model gpt-x not found"
    );

    // A late subscriber still learns why.
    app.settle(id).await;
    let late = app.server.get(&format!("{}/progress", job_path(id))).await;
    let snapshots = snapshot_payloads(&late.text());
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0]["status"], "failed");
    assert!(snapshots[0]["error_message"].is_string());

    let stats = app
        .server
        .get(&format!("{}/statistics", job_path(id)))
        .await;
    assert_eq!(stats.status_code(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn last_event_id_skips_seen_snapshots() {
    let app = TestApp::spawn(TWO_UNITS);
    let id = JobId::generate();
    app.server.post(&job_path(id)).json(&job_body(&UNITS)).await;
    let first = app.server.get(&format!("{}/progress", job_path(id))).await;
    let seen = snapshot_payloads(&first.text());
    let final_sequence = seen.last().unwrap()["sequence"].as_u64().unwrap();

    let resumed = app
        .server
        .get(&format!("{}/progress", job_path(id)))
        .add_header(
            HeaderName::from_static("last-event-id"),
            HeaderValue::from_str(&final_sequence.to_string()).unwrap(),
        )
        .await;
    let snapshots = snapshot_payloads(&resumed.text());
    // Only the terminal snapshot is repeated, never older progress.
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0]["status"], "completed");
}

#[tokio::test]
async fn buffered_events_honour_since() {
    let app = TestApp::spawn(HANGS_AFTER_FIRST_UNIT);
    let id = JobId::generate();
    app.server.post(&job_path(id)).json(&job_body(&UNITS)).await;

    let events = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let body: Value = app
                .server
                .get(&format!("{}/events", job_path(id)))
                .await
                .json();
            let events = body["events"].as_array().cloned().unwrap_or_default();
            if events
                .iter()
                .any(|frame| frame["payload"]["kind"] == "unit_result")
            {
                break events;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("unit result buffered");

    let last = events.last().unwrap()["sequence"].as_u64().unwrap();
    let body: Value = app
        .server
        .get(&format!("{}/events", job_path(id)))
        .add_query_param("since", last)
        .await
        .json();
    assert!(
        body["events"]
            .as_array()
            .unwrap()
            .iter()
            .all(|frame| frame["sequence"].as_u64().unwrap() > last)
    );

    app.state.registry.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn listing_filters_and_validates() {
    let app = TestApp::spawn(TWO_UNITS);
    let ids = [JobId::generate(), JobId::generate()];
    for id in ids {
        app.server.post(&job_path(id)).json(&job_body(&UNITS)).await;
    }
    for id in ids {
        app.server.get(&format!("{}/progress", job_path(id))).await;
        app.settle(id).await;
    }

    let page: JobPage = app
        .server
        .get("/api/v1/jobs")
        .add_query_param("status", "completed")
        .add_query_param("per_page", 1)
        .await
        .json();
    assert_eq!(page.total, 2);
    assert_eq!(page.jobs.len(), 1);
    assert_eq!(page.per_page, 1);

    let none: JobPage = app
        .server
        .get("/api/v1/jobs")
        .add_query_param("target_kind", "openai")
        .await
        .json();
    assert_eq!(none.total, 0);

    let bad = app
        .server
        .get("/api/v1/jobs")
        .add_query_param("sort", "name")
        .await;
    assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(bad.json::<Value>()["error"]["status"], 400);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let app = TestApp::spawn(TWO_UNITS);
    let id = JobId::generate();
    app.server.post(&job_path(id)).json(&job_body(&UNITS)).await;
    app.server.get(&format!("{}/progress", job_path(id))).await;
    app.settle(id).await;

    let first = app.server.delete(&job_path(id)).await;
    assert_eq!(first.status_code(), StatusCode::NO_CONTENT);
    let gone = app.server.get(&job_path(id)).await;
    assert_eq!(gone.status_code(), StatusCode::NOT_FOUND);
    let second = app.server.delete(&job_path(id)).await;
    assert_eq!(second.status_code(), StatusCode::NO_CONTENT);

    let artifact = app
        .server
        .get(&format!("{}/artifacts/report.jsonl", job_path(id)))
        .await;
    assert_eq!(artifact.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_jobs_are_404_everywhere() {
    let app = TestApp::spawn(TWO_UNITS);
    let path = job_path(JobId::generate());
    for suffix in ["", "/progress", "/events", "/statistics"] {
        let response = app.server.get(&format!("{path}{suffix}")).await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND, "GET {suffix}");
    }
    let cancel = app.server.post(&format!("{path}/cancel")).await;
    assert_eq!(cancel.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_unit_list_is_a_bad_request() {
    let app = TestApp::spawn(TWO_UNITS);
    let response = app
        .server
        .post(&job_path(JobId::generate()))
        .json(&job_body(&[]))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

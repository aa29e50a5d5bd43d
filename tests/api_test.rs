/// HTTP API tests
///
/// Drives the router in-process with synthetic frame sources.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use clap_detector::{
    router, AppState, AudioSample, CaptureConfig, CaptureError, DetectorConfig, FrameSource,
    SourceOpener,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tower::ServiceExt;

/// Endless source that emits two claps a few frames apart, then silence
struct DoubleClapSource {
    frames_read: usize,
}

impl FrameSource for DoubleClapSource {
    fn read_frame(&mut self, frame: &mut [AudioSample]) -> Result<(), CaptureError> {
        thread::sleep(Duration::from_millis(2));
        self.frames_read += 1;

        if self.frames_read == 1 || self.frames_read == 3 {
            for (i, sample) in frame.iter_mut().enumerate() {
                let t = i as f64 / 44_100.0;
                *sample = (20_000.0 * (2.0 * std::f64::consts::PI * 1900.0 * t).sin()) as AudioSample;
            }
        } else {
            frame.fill(0);
        }

        Ok(())
    }
}

/// Silent source with a scripted read failure and a fixed overrun count
struct ScriptedSource {
    reads: usize,
    fail_on: Option<(usize, CaptureError)>,
    close_after: Option<usize>,
    dropped: u64,
}

impl ScriptedSource {
    fn silent() -> Self {
        Self {
            reads: 0,
            fail_on: None,
            close_after: None,
            dropped: 0,
        }
    }
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self, frame: &mut [AudioSample]) -> Result<(), CaptureError> {
        thread::sleep(Duration::from_millis(2));
        self.reads += 1;

        if self.fail_on.as_ref().is_some_and(|(read, _)| *read == self.reads) {
            if let Some((_, error)) = self.fail_on.take() {
                return Err(error);
            }
        }
        if self.close_after.is_some_and(|last| self.reads > last) {
            return Err(CaptureError::Closed);
        }

        frame.fill(0);
        Ok(())
    }

    fn dropped_samples(&self) -> u64 {
        self.dropped
    }
}

fn scripted_state(
    make: impl Fn() -> ScriptedSource + Send + Sync + 'static,
) -> (AppState, Arc<AtomicUsize>) {
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = opened.clone();
    let opener = move |_: &CaptureConfig| -> Result<Box<dyn FrameSource>, CaptureError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(make()))
    };
    let opener: Arc<dyn SourceOpener> = Arc::new(opener);
    (AppState::new(test_config(), opener), opened)
}

fn test_config() -> DetectorConfig {
    DetectorConfig {
        loop_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

fn clapping_state() -> (AppState, Arc<AtomicUsize>) {
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = opened.clone();
    let opener = move |_: &CaptureConfig| -> Result<Box<dyn FrameSource>, CaptureError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(DoubleClapSource { frames_read: 0 }))
    };
    let opener: Arc<dyn SourceOpener> = Arc::new(opener);
    (AppState::new(test_config(), opener), opened)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("Failed to build request");

    let response = app.clone().oneshot(request).await.expect("Request failed");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    let body = serde_json::from_slice(&bytes).expect("Body is not JSON");

    (status, body)
}

#[tokio::test]
async fn test_start_check_stop_cycle() {
    let (state, opened) = clapping_state();
    let app = router(state.clone());

    let (status, body) = get(&app, "/start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "started"}));
    assert!(state.is_active().await);

    let mut detected = false;
    for _ in 0..200 {
        let (_, body) = get(&app, "/check").await;
        if body == json!({"clap_detected": true}) {
            detected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(detected, "double clap never reported");

    let (_, body) = get(&app, "/check").await;
    assert_eq!(body, json!({"clap_detected": false}));

    let (status, body) = get(&app, "/stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "stopped"}));
    assert!(!state.is_active().await);
    assert_eq!(opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_start_twice_reports_already_running() {
    let (state, opened) = clapping_state();
    let app = router(state);

    get(&app, "/start").await;
    let (status, body) = get(&app, "/start").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "already_running"}));
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    get(&app, "/stop").await;
}

#[tokio::test]
async fn test_stop_without_detector() {
    let (state, _) = clapping_state();
    let app = router(state);

    let (status, body) = get(&app, "/stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "not_running"}));
}

#[tokio::test]
async fn test_check_without_detector() {
    let (state, _) = clapping_state();
    let app = router(state);

    let (status, body) = get(&app, "/check").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"clap_detected": false}));
}

#[tokio::test]
async fn test_restart_after_stop() {
    let (state, opened) = clapping_state();
    let app = router(state);

    get(&app, "/start").await;
    get(&app, "/stop").await;
    let (_, body) = get(&app, "/start").await;

    assert_eq!(body, json!({"status": "started"}));
    assert_eq!(opened.load(Ordering::SeqCst), 2);

    get(&app, "/stop").await;
}

#[tokio::test]
async fn test_device_failure_leaves_no_session() {
    let opener = |_: &CaptureConfig| -> Result<Box<dyn FrameSource>, CaptureError> {
        Err(CaptureError::NoInputDevice)
    };
    let state = AppState::new(test_config(), Arc::new(opener));
    let app = router(state.clone());

    let (status, body) = get(&app, "/start").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("No default input device"));
    assert!(!state.is_active().await);

    let (_, body) = get(&app, "/stop").await;
    assert_eq!(body, json!({"status": "not_running"}));
}

#[tokio::test]
async fn test_stats_reflect_session() {
    let (state, _) = clapping_state();
    let app = router(state);

    let (_, body) = get(&app, "/stats").await;
    assert_eq!(body["running"], false);
    assert_eq!(body["frames_processed"], 0);

    get(&app, "/start").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_, body) = get(&app, "/stats").await;
    assert_eq!(body["running"], true);
    assert!(body["frames_processed"].as_u64().unwrap() > 0);

    get(&app, "/stop").await;
}

#[tokio::test]
async fn test_health() {
    let (state, _) = clapping_state();
    let app = router(state);

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], clap_detector::VERSION);
}

#[tokio::test]
async fn test_cors_allows_any_origin() {
    let (state, _) = clapping_state();
    let app = router(state);

    let request = Request::builder()
        .uri("/check")
        .header(header::ORIGIN, "http://localhost:3000")
        .body(Body::empty())
        .expect("Failed to build request");

    let response = app.oneshot(request).await.expect("Request failed");
    let allow_origin = response
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .expect("Missing CORS header");

    assert_eq!(allow_origin, "*");
}

#[tokio::test]
async fn test_backend_error_does_not_end_detection() {
    let (state, opened) = scripted_state(|| ScriptedSource {
        fail_on: Some((3, CaptureError::Stream("transient backend error".to_string()))),
        ..ScriptedSource::silent()
    });
    let app = router(state);

    get(&app, "/start").await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (_, body) = get(&app, "/stats").await;
    assert_eq!(body["running"], true);
    assert!(body["frames_processed"].as_u64().unwrap() > 2);

    let (_, body) = get(&app, "/start").await;
    assert_eq!(body, json!({"status": "already_running"}));
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    get(&app, "/stop").await;
}

#[tokio::test]
async fn test_start_replaces_detector_after_disconnect() {
    let (state, opened) = scripted_state(|| ScriptedSource {
        fail_on: Some((3, CaptureError::Disconnected("device unplugged".to_string()))),
        ..ScriptedSource::silent()
    });
    let app = router(state.clone());

    get(&app, "/start").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_, body) = get(&app, "/stats").await;
    assert_eq!(body["running"], false);
    assert_eq!(body["frames_processed"], 2);
    assert!(state.is_active().await);

    let (status, body) = get(&app, "/start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "started"}));
    assert_eq!(opened.load(Ordering::SeqCst), 2);

    let (_, body) = get(&app, "/stop").await;
    assert_eq!(body, json!({"status": "stopped"}));
}

#[tokio::test]
async fn test_start_after_source_closed() {
    let (state, opened) = scripted_state(|| ScriptedSource {
        close_after: Some(1),
        ..ScriptedSource::silent()
    });
    let app = router(state);

    get(&app, "/start").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_, body) = get(&app, "/start").await;
    assert_eq!(body, json!({"status": "started"}));
    assert_eq!(opened.load(Ordering::SeqCst), 2);

    let (_, body) = get(&app, "/stop").await;
    assert_eq!(body, json!({"status": "stopped"}));
}

#[tokio::test]
async fn test_stats_report_dropped_samples() {
    let (state, _) = scripted_state(|| ScriptedSource {
        dropped: 4096,
        ..ScriptedSource::silent()
    });
    let app = router(state);

    get(&app, "/start").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_, body) = get(&app, "/stats").await;
    assert_eq!(body["dropped_samples"], 4096);

    get(&app, "/stop").await;
}

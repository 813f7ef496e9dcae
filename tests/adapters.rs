//! Adapters against in-process fake collaborators.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

use common::{invoice_document, s3_event, test_limits, Fixture};
use docflow::adapters::{
    http_client, ExtractionAdapter, ModelPlanner, NotificationAdapter, PostingAdapter, Tool,
    ToolContext, ToolRegistry, ValidationAdapter,
};
use docflow::config::{Config, ConfigFile};
use docflow::core::{Decision, FailReason, Orchestrator, Planner, RetryPolicy};
use docflow::domain::capability::{EXTRACT_DOCUMENT, POST_INVOICE, VALIDATE_INVOICE_DATA};
use docflow::domain::{PipelineState, ProcessId, RunStatus};
use docflow::error::ToolErrorKind;
use docflow::DocumentHandler;

const FUNCTION: &str = "InvoiceExtraction-test";

type Seen = Arc<Mutex<Vec<(HeaderMap, Value)>>>;

/// A route answering every POST with a fixed status, headers and JSON body
fn fake_route(
    path: &str,
    status: u16,
    headers: Vec<(&'static str, &'static str)>,
    reply: Value,
) -> (Router, Seen) {
    let seen: Seen = Arc::default();
    let recorder = seen.clone();

    let handler = move |request_headers: HeaderMap, Json(body): Json<Value>| {
        let recorder = recorder.clone();
        let headers = headers.clone();
        let reply = reply.clone();
        async move {
            recorder.lock().unwrap().push((request_headers, body));
            let mut response = (StatusCode::from_u16(status).unwrap(), Json(reply)).into_response();
            for (name, value) in headers {
                response
                    .headers_mut()
                    .insert(name, HeaderValue::from_static(value));
            }
            response
        }
    };

    (Router::new().route(path, post(handler)), seen)
}

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn invocations_path() -> String {
    format!("/2015-03-31/functions/{}/invocations", FUNCTION)
}

fn extraction_reply() -> Value {
    json!({
        "extracted_table": {
            "invoice_number": "INV-42",
            "date": "2024-03-01",
            "total_amount": "1200.00"
        },
        "kv": { "vendor_name": "ACME GmbH" }
    })
}

fn ctx(tool: &str) -> ToolContext {
    ToolContext::new(
        ProcessId::external("proc-adapters"),
        format!("proc-adapters:{}:0123456789abcdef", tool),
    )
}

fn client() -> reqwest::Client {
    http_client(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_extraction_round_trip() {
    let (router, seen) = fake_route(&invocations_path(), 200, vec![], extraction_reply());
    let base = serve(router).await;

    let adapter = ExtractionAdapter::new(client(), &base, FUNCTION, "imageOutput");
    let payload = adapter
        .invoke(
            json!({ "bucket": "docs-bucket", "key": "invoice-42.pdf" }),
            &ctx(EXTRACT_DOCUMENT),
        )
        .await
        .unwrap();

    assert_eq!(payload["source"], "docs-bucket/invoice-42.pdf");
    assert_eq!(payload["document"]["invoice_number"], "INV-42");
    assert_eq!(payload["kv"]["vendor_name"], "ACME GmbH");

    let requests = seen.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let body = &requests[0].1;
    assert_eq!(body["processId"], "proc-adapters");
    assert_eq!(body["tool"], "extract_document");
    assert_eq!(body["parameters"]["key"], "invoice-42.pdf");
    assert_eq!(body["parameters"]["imageOutputPath"], "imageOutput");
}

#[tokio::test]
async fn test_extraction_unwraps_proxy_envelope() {
    let inner = json!({ "output": { "invoice_number": "INV-9" } }).to_string();
    let (router, _) = fake_route(
        &invocations_path(),
        200,
        vec![],
        json!({ "statusCode": 200, "body": inner }),
    );
    let base = serve(router).await;

    let payload = ExtractionAdapter::new(client(), &base, FUNCTION, "imageOutput")
        .invoke(json!({ "bucket": "b", "key": "k.pdf" }), &ctx(EXTRACT_DOCUMENT))
        .await
        .unwrap();

    assert_eq!(payload["document"]["invoice_number"], "INV-9");
    assert_eq!(payload["kv"], json!({}));
}

#[tokio::test]
async fn test_extraction_function_error() {
    let (router, _) = fake_route(
        &invocations_path(),
        200,
        vec![("x-amz-function-error", "Unhandled")],
        json!({ "errorMessage": "Textract throttled" }),
    );
    let base = serve(router).await;

    let err = ExtractionAdapter::new(client(), &base, FUNCTION, "imageOutput")
        .invoke(json!({ "bucket": "b", "key": "k.pdf" }), &ctx(EXTRACT_DOCUMENT))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ToolErrorKind::Remote);
    assert!(err.detail.contains("Textract throttled"));
}

#[tokio::test]
async fn test_extraction_rejects_bad_arguments_without_calling() {
    let (router, seen) = fake_route(&invocations_path(), 200, vec![], extraction_reply());
    let base = serve(router).await;

    let err = ExtractionAdapter::new(client(), &base, FUNCTION, "imageOutput")
        .invoke(json!({ "bucket": "b" }), &ctx(EXTRACT_DOCUMENT))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ToolErrorKind::InvalidArguments);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_collaborator_times_out() {
    let router = Router::new().route(
        &invocations_path(),
        post(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({}))
        }),
    );
    let base = serve(router).await;

    let quick = http_client(Duration::from_millis(100)).unwrap();
    let err = ExtractionAdapter::new(quick, &base, FUNCTION, "imageOutput")
        .invoke(json!({ "bucket": "b", "key": "k.pdf" }), &ctx(EXTRACT_DOCUMENT))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ToolErrorKind::Timeout);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_posting_forwards_idempotency_key() {
    let (router, seen) = fake_route(
        "/invoices",
        201,
        vec![],
        json!({ "document_id": "5100000042" }),
    );
    let base = serve(router).await;

    let adapter = PostingAdapter::new(client(), Some(format!("{}/invoices", base)));
    assert!(!adapter.is_dry_run());

    let payload = adapter
        .invoke(json!({ "extracted_data": invoice_document() }), &ctx(POST_INVOICE))
        .await
        .unwrap();
    assert_eq!(payload["accepted"], true);
    assert_eq!(payload["acknowledgement"]["document_id"], "5100000042");

    let requests = seen.lock().unwrap();
    let (headers, body) = &requests[0];
    assert_eq!(
        headers.get("idempotency-key").unwrap(),
        "proc-adapters:post_invoice:0123456789abcdef"
    );
    assert_eq!(body["processId"], "proc-adapters");
    assert_eq!(body["extracted_data"], invoice_document());
}

#[tokio::test]
async fn test_posting_rejection_and_server_error() {
    let (rejecting, _) = fake_route("/invoices", 422, vec![], json!("vendor unknown"));
    let (failing, _) = fake_route("/broken", 502, vec![], json!({}));
    let base = serve(rejecting.merge(failing)).await;

    let rejected = PostingAdapter::new(client(), Some(format!("{}/invoices", base)))
        .invoke(json!({ "extracted_data": invoice_document() }), &ctx(POST_INVOICE))
        .await
        .unwrap();
    assert_eq!(rejected["accepted"], false);
    assert_eq!(rejected["status"], 422);
    assert_eq!(rejected["reason"], "vendor unknown");

    let err = PostingAdapter::new(client(), Some(format!("{}/broken", base)))
        .invoke(json!({ "extracted_data": invoice_document() }), &ctx(POST_INVOICE))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Status);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_posting_dry_run_without_endpoint() {
    let adapter = PostingAdapter::new(client(), None);
    assert!(adapter.is_dry_run());

    let payload = adapter
        .invoke(json!({ "extracted_data": invoice_document() }), &ctx(POST_INVOICE))
        .await
        .unwrap();
    assert_eq!(payload["accepted"], true);
    assert_eq!(payload["dry_run"], true);
}

#[tokio::test]
async fn test_unreachable_collaborator_is_transport_error() {
    // Grab a free port, then release it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = PostingAdapter::new(client(), Some(format!("http://{}/invoices", addr)))
        .invoke(json!({ "extracted_data": invoice_document() }), &ctx(POST_INVOICE))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Transport);
}

#[tokio::test]
async fn test_notification_payload() {
    let (router, seen) = fake_route("/notify", 200, vec![], json!({ "ok": true }));
    let base = serve(router).await;

    let adapter = NotificationAdapter::new(client(), Some(format!("{}/notify", base)));
    adapter
        .invoke(
            json!({
                "message": "Processing completed for invoice-42.pdf",
                "status": "completed",
                "invoice_id": "INV-42"
            }),
            &ctx("send_notification"),
        )
        .await
        .unwrap();

    let requests = seen.lock().unwrap();
    let body = &requests[0].1;
    assert_eq!(body["processId"], "proc-adapters");
    assert_eq!(body["invoice_id"], "INV-42");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["message"], "Processing completed for invoice-42.pdf");
}

#[tokio::test]
async fn test_notification_error_status() {
    let (router, _) = fake_route("/notify", 500, vec![], json!({ "error": "down" }));
    let base = serve(router).await;

    let err = NotificationAdapter::new(client(), Some(format!("{}/notify", base)))
        .invoke(json!({ "message": "hello" }), &ctx("send_notification"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Status);
}

fn registry(base: &str) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ExtractionAdapter::new(client(), base, FUNCTION, "imageOutput"));
    registry.register(ValidationAdapter::new());
    registry.register(PostingAdapter::new(client(), Some(format!("{}/invoices", base))));
    registry.register(NotificationAdapter::new(client(), Some(format!("{}/notify", base))));
    registry
}

#[tokio::test]
async fn test_model_planner_request_and_decision() {
    let (router, seen) = fake_route(
        "/plan",
        200,
        vec![],
        json!({
            "action": "invoke",
            "tool": "extract_document",
            "args": { "bucket": "docs-bucket", "key": "invoice-42.pdf" }
        }),
    );
    let base = serve(router).await;

    let planner = ModelPlanner::new(
        client(),
        format!("{}/plan", base),
        "planner-model-v1",
        "eu-central-1",
        Some("s3://prompts/planner.txt".to_string()),
    );
    let capabilities = registry(&base).capabilities();
    let state = PipelineState::new("docs-bucket", "invoice-42.pdf");

    let decision = planner.next(&state, &capabilities, &[]).await;
    assert_eq!(
        decision,
        Decision::invoke(
            EXTRACT_DOCUMENT,
            json!({ "bucket": "docs-bucket", "key": "invoice-42.pdf" })
        )
    );

    let requests = seen.lock().unwrap();
    let body = &requests[0].1;
    assert_eq!(body["modelId"], "planner-model-v1");
    assert_eq!(body["region"], "eu-central-1");
    assert_eq!(body["promptRef"], "s3://prompts/planner.txt");
    assert_eq!(body["bucket"], "docs-bucket");
    let names: Vec<&str> = body["capabilities"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert_eq!(
        names,
        vec![EXTRACT_DOCUMENT, VALIDATE_INVOICE_DATA, POST_INVOICE, "send_notification"]
    );
}

#[tokio::test]
async fn test_model_planner_endpoint_error() {
    let (router, _) = fake_route("/plan", 500, vec![], json!({ "message": "throttled" }));
    let base = serve(router).await;

    let planner = ModelPlanner::new(client(), format!("{}/plan", base), "m", "r", None);
    let decision = planner
        .next(
            &PipelineState::new("b", "k"),
            &registry(&base).capabilities(),
            &[],
        )
        .await;

    assert!(matches!(decision, Decision::Fail(FailReason::PlannerError(_))));
}

/// Planning endpoint that walks the state like a well-behaved model
async fn scripted_planner_endpoint(Json(request): Json<Value>) -> Json<Value> {
    let state = &request["state"];
    let decision = if state.get("extracted_data").is_none() {
        json!({
            "action": "invoke",
            "tool": "extract_document",
            "args": { "bucket": request["bucket"], "key": request["key"] }
        })
    } else if state.get("validation_result").is_none() {
        json!({
            "action": "invoke",
            "tool": "validate_invoice_data",
            "args": { "extracted_data": state["extracted_data"] }
        })
    } else if state.get("posting_result").is_none() {
        // Model output usually arrives wrapped in prose
        let inner = json!({
            "action": "invoke",
            "tool": "post_invoice",
            "args": { "extracted_data": state["extracted_data"] }
        });
        Value::String(format!("Posting now.\n{}", inner))
    } else {
        json!({ "action": "complete" })
    };
    Json(decision)
}

#[tokio::test]
async fn test_model_planned_run_completes() {
    let base = serve(Router::new().route("/plan", post(scripted_planner_endpoint))).await;

    let fixture = Fixture::new();
    let planner = ModelPlanner::new(client(), format!("{}/plan", base), "m", "r", None);
    let orchestrator = Orchestrator::new(
        fixture.registry(),
        Arc::new(planner),
        test_limits(),
        RetryPolicy::immediate(2),
    );
    assert_eq!(orchestrator.planner_name(), "model");

    let result = orchestrator
        .run("docs-bucket", "invoice-42.pdf", ProcessId::external("proc-model"))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(fixture.extract.call_count(), 1);
    assert_eq!(fixture.post.call_count(), 1);
}

#[tokio::test]
async fn test_configured_handler_end_to_end() {
    let (extraction, _) = fake_route(&invocations_path(), 200, vec![], extraction_reply());
    let (posting, posted) = fake_route("/invoices", 201, vec![], json!({ "document_id": "1" }));
    let (notifier, notified) = fake_route("/notify", 200, vec![], json!({ "ok": true }));
    let base = serve(extraction.merge(posting).merge(notifier)).await;

    let home = TempDir::new().unwrap();
    let env: HashMap<&str, String> = HashMap::from([
        ("AWS_REGION", "eu-central-1".to_string()),
        ("DOCFLOW_HOME", home.path().display().to_string()),
        ("EXTRACTION_ENDPOINT", base.clone()),
        ("EXTRACTION_AGENT_LAMBDA", FUNCTION.to_string()),
        ("POSTING_ENDPOINT", format!("{}/invoices", base)),
        ("NOTIFICATION_ENDPOINT", format!("{}/notify", base)),
    ]);
    let config = Config::from_sources(|key| env.get(key).cloned(), &ConfigFile::default()).unwrap();

    let handler = DocumentHandler::from_config(&config).unwrap();
    let response = handler.handle(&s3_event("docs-bucket", "invoice-42.pdf")).await;

    assert_eq!(response.status_code, 200);
    let body = response.body_json().unwrap();
    assert_eq!(body["status"], "completed");

    assert_eq!(posted.lock().unwrap().len(), 1);
    let statuses: Vec<Value> = notified
        .lock()
        .unwrap()
        .iter()
        .map(|(_, body)| body["status"].clone())
        .collect();
    assert_eq!(statuses, vec![json!("started"), json!("completed")]);

    // Journal and lock file live under the configured home
    let process_id = body["processId"].as_str().unwrap();
    assert!(home
        .path()
        .join("runs")
        .join(process_id)
        .join("events.jsonl")
        .exists());
    assert!(home.path().join("docflow.lock").exists());
}

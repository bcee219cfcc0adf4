//! HTTP-level tests for the reconciliation routes, with a canned registry
//! standing in for VIAF.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http_body_util::BodyExt;
use hyper::{header, Request, StatusCode};
use refine_viaf_core::{ReconcileConfig, Reconciler, RegistryClient, RegistryError};
use refine_viaf_server::router::build_router;
use tower::ServiceExt;

const REGISTRY_XML: &str = r#"<searchRetrieveResponse><records>
<record><recordData><ns2:VIAFCluster xmlns:ns2="http://viaf.org/viaf/terms#">
  <ns2:viafID>86064294</ns2:viafID><ns2:nameType>Personal</ns2:nameType>
  <ns2:mainHeadings>
    <ns2:data><ns2:text>Silver, Nate</ns2:text>
      <ns2:sources><ns2:s>LC</ns2:s><ns2:sid>LC|n  2008032484</ns2:sid></ns2:sources></ns2:data>
    <ns2:data><ns2:text>Nate Silver</ns2:text><ns2:sources><ns2:s>NDL</ns2:s></ns2:sources></ns2:data>
  </ns2:mainHeadings>
</ns2:VIAFCluster></recordData></record>
</records></searchRetrieveResponse>"#;

const UNKNOWN_TYPE_XML: &str = r#"<searchRetrieveResponse><records>
<record><VIAFCluster><viafID>1</viafID><nameType>Meeting</nameType></VIAFCluster></record>
</records></searchRetrieveResponse>"#;

struct CannedRegistry;

#[async_trait]
impl RegistryClient for CannedRegistry {
    async fn search(&self, query: &str, _limit: u32) -> Result<String, RegistryError> {
        if query.contains("Meeting") {
            Ok(UNKNOWN_TYPE_XML.to_string())
        } else {
            Ok(REGISTRY_XML.to_string())
        }
    }
}

fn app() -> axum::Router {
    let engine =
        Reconciler::with_client(ReconcileConfig::default(), Arc::new(CannedRegistry)).unwrap();
    build_router(engine)
}

fn encode(params: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
}

async fn get(uri: &str) -> (StatusCode, Option<String>, String) {
    let response = app()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    read(response).await
}

async fn read(response: axum::response::Response) -> (StatusCode, Option<String>, String) {
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
}

fn json(body: &str) -> serde_json::Value {
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let (status, _, body) = get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body), serde_json::json!({"status": "ok"}));
}

#[tokio::test]
async fn bare_request_returns_metadata() {
    let (status, content_type, body) = get("/reconcile").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/json"));

    let value = json(&body);
    assert_eq!(value["name"], "VIAF Reconciliation Service");
    assert_eq!(value["defaultTypes"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn single_query_via_get() {
    let uri = format!("/reconcile?{}", encode(&[("query", "Nate Silver")]));
    let (status, _, body) = get(&uri).await;
    assert_eq!(status, StatusCode::OK);

    let value = json(&body);
    assert_eq!(value["result"][0]["id"], "86064294");
    assert_eq!(value["result"][0]["name"], "Silver, Nate");
    assert_eq!(value["result"][0]["match"], false);
}

#[tokio::test]
async fn batch_via_form_post() {
    let body = encode(&[(
        "queries",
        r#"{"q0": {"query": "Nate Silver"}, "q1": {"query": "Silver, Nate", "type": "/people/person"}}"#,
    )]);
    let request = Request::post("/reconcile")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();

    let (status, _, body) = read(app().oneshot(request).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);

    let value = json(&body);
    assert_eq!(value.as_object().unwrap().len(), 2);
    assert_eq!(value["q0"]["result"][0]["match"], false);
    assert_eq!(value["q1"]["result"][0]["match"], true);
    assert_eq!(value["q1"]["result"][0]["type"][0]["id"], "/people/person");
}

#[tokio::test]
async fn source_route_prefers_that_source() {
    let uri = format!("/reconcile/ndl?{}", encode(&[("query", "Nate Silver")]));
    let (status, _, body) = get(&uri).await;
    assert_eq!(status, StatusCode::OK);

    let value = json(&body);
    assert_eq!(value["result"][0]["name"], "Nate Silver");
    assert_eq!(value["result"][0]["match"], true);

    let (_, _, body) = get("/reconcile/ndl").await;
    assert_eq!(json(&body)["name"], "VIAF Reconciliation Service - NDL");
}

#[tokio::test]
async fn proxy_route_reports_source_ids() {
    let uri = format!(
        "/reconcile/viafproxy/LC?{}",
        encode(&[("query", "Silver, Nate")])
    );
    let (status, _, body) = get(&uri).await;
    assert_eq!(status, StatusCode::OK);

    let value = json(&body);
    assert_eq!(value["result"][0]["id"], "n2008032484");
    assert_eq!(value["result"][0]["name"], "Silver, Nate");
    assert_eq!(value["result"][0]["match"], true);

    let (_, _, body) = get("/reconcile/viafproxy/lc").await;
    let value = json(&body);
    assert_eq!(
        value["name"],
        "VIAF Reconciliation Service - LC (by way of VIAF)"
    );
    assert_eq!(
        value["view"]["url"],
        "http://id.loc.gov/authorities/names/{{id}}"
    );
}

#[tokio::test]
async fn blank_query_is_bad_request() {
    let uri = format!("/reconcile?{}", encode(&[("query", "   ")]));
    let (status, _, body) = get(&uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json(&body)["error"].as_str().unwrap().contains("blank"));

    // an empty parameter is still absent
    let (status, _, body) = get("/reconcile?query=").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["name"], "VIAF Reconciliation Service");
}

#[tokio::test]
async fn jsonp_callback_wraps_body() {
    let uri = format!(
        "/reconcile?{}",
        encode(&[("query", "Nate Silver"), ("callback", "jsonp123")])
    );
    let (status, _, body) = get(&uri).await;
    assert_eq!(status, StatusCode::OK);

    let inner = body
        .strip_prefix("jsonp123(")
        .and_then(|b| b.strip_suffix(')'))
        .unwrap();
    assert_eq!(json(inner)["result"][0]["id"], "86064294");
}

#[tokio::test]
async fn malformed_batch_is_bad_request() {
    let uri = format!("/reconcile?{}", encode(&[("queries", "{not json")]));
    let (status, content_type, body) = get(&uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(content_type.as_deref(), Some("application/json"));
    assert!(json(&body)["error"].as_str().unwrap().contains("Invalid queries batch"));

    let uri = format!(
        "/reconcile?{}",
        encode(&[("queries", "{not json"), ("callback", "cb")])
    );
    let (status, _, body) = get(&uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.starts_with("cb({\"error\":"));
}

#[tokio::test]
async fn unsafe_callback_is_rejected_unwrapped() {
    let uri = format!(
        "/reconcile?{}",
        encode(&[("query", "Nate Silver"), ("callback", "alert(1)")])
    );
    let (status, _, body) = get(&uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json(&body)["error"].as_str().unwrap().contains("callback"));
}

#[tokio::test]
async fn unknown_record_type_is_internal_error() {
    let uri = format!("/reconcile?{}", encode(&[("query", "Meeting")]));
    let (status, _, body) = get(&uri).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json(&body)["error"].as_str().unwrap().contains("Meeting"));
}

//! Remote proxy behavior against a mock upstream.

#![allow(clippy::unwrap_used)]

mod common;

use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dso_core::remote::{validate_remote_response, RemoteClient, RemoteRequestContext};
use dso_error::ApiError;

fn ctx() -> RemoteRequestContext {
    RemoteRequestContext {
        client_ip: "10.0.0.9".to_string(),
        x_forwarded_for: None,
        x_correlation_id: Some("corr-123".to_string()),
        x_unique_id: None,
        authorization: Some("Bearer secret-token".to_string()),
    }
}

#[tokio::test]
async fn successful_response_with_content_crs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/panden/0363100012345678"))
        .and(header("Accept", "application/json"))
        .and(header("X-Correlation-ID", "corr-123"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Crs", "EPSG:28992")
                .set_body_json(serde_json::json!({
                    "identificatie": "0363100012345678",
                    "bouwjaar": 1906,
                })),
        )
        .mount(&server)
        .await;

    let client =
        RemoteClient::new(&format!("{}/api/{{table_id}}", server.uri()), "panden", false)
            .unwrap();
    let response = client.call(&ctx(), "0363100012345678", &[]).await.unwrap();

    assert_eq!(response.data["bouwjaar"], 1906);
    assert_eq!(
        response.content_crs.map(|c| c.srid()),
        Some(28992)
    );
}

#[tokio::test]
async fn query_parameters_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/adressen"))
        .and(query_param("postcode", "1011PN"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;

    let client =
        RemoteClient::new(&format!("{}/api/adressen", server.uri()), "adressen", false)
            .unwrap();
    let result = client
        .call(
            &ctx(),
            "",
            &[("postcode".to_string(), "1011PN".to_string())],
        )
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn problem_json_400_becomes_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(400)
                .insert_header("content-type", "application/problem+json")
                .set_body_json(serde_json::json!({
                    "title": "Malformed postcode",
                    "invalid-params": [{"name": "postcode"}],
                })),
        )
        .mount(&server)
        .await;

    let client = RemoteClient::new(&server.uri(), "x", false).unwrap();
    let err = client.call(&ctx(), "", &[]).await.unwrap_err();
    match err {
        ApiError::Remote { status, code, detail, .. } => {
            assert_eq!(status, 400);
            assert_eq!(code, "parse_error");
            assert_eq!(detail["title"], "Malformed postcode");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn remote_401_and_403_surface_as_403() {
    for upstream_status in [401_u16, 403] {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(upstream_status))
            .mount(&server)
            .await;

        let client = RemoteClient::new(&server.uri(), "x", false).unwrap();
        let err = client.call(&ctx(), "", &[]).await.unwrap_err();
        assert_eq!(err.status(), 403, "upstream {upstream_status} must map to 403");
    }
}

#[tokio::test]
async fn remote_404_passes_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(404)
                .insert_header("content-type", "application/problem+json")
                .set_body_json(serde_json::json!({"title": "Pand niet gevonden"})),
        )
        .mount(&server)
        .await;

    let client = RemoteClient::new(&server.uri(), "x", false).unwrap();
    let err = client.call(&ctx(), "", &[]).await.unwrap_err();
    assert_eq!(err.status(), 404);
}

#[tokio::test]
async fn unexpected_status_is_bad_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = RemoteClient::new(&server.uri(), "x", false).unwrap();
    let err = client.call(&ctx(), "", &[]).await.unwrap_err();
    assert_eq!(err.status(), 502);
}

#[tokio::test]
async fn oauth_redirect_maps_to_invalid_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "https://idp.test/oauth/authorize?client=x"),
        )
        .mount(&server)
        .await;

    // Only the auth-forwarding variant inspects redirects.
    let client = RemoteClient::new(&server.uri(), "x", true).unwrap();
    let err = client.call(&ctx(), "", &[]).await.unwrap_err();
    match err {
        ApiError::AccessDenied { message } => assert_eq!(message, "Invalid token"),
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn authorization_header_forwarded_only_when_enabled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let forwarding = RemoteClient::new(&server.uri(), "x", true).unwrap();
    assert!(forwarding.call(&ctx(), "", &[]).await.is_ok());
}

#[test]
fn invalid_remote_payload_is_rejected() {
    let snapshot = common::snapshot();
    let table = snapshot.table("afvalwegingen", "containers").unwrap();

    // Identifier missing entirely.
    let err =
        validate_remote_response(table, &serde_json::json!({"serienummer": "S1"})).unwrap_err();
    assert_eq!(err.status(), 502);

    let ok = validate_remote_response(
        table,
        &serde_json::json!({"id": 1, "serienummer": "S1"}),
    );
    assert!(ok.is_ok());
}

use crate::common::{find_free_port, ErrorResponse, GatewayHarness, ServiceResponse, ServicesList};
use reqwest::StatusCode;

#[tokio::test]
async fn test_service_route_lifecycle() {
    let gateway = GatewayHarness::new().await;
    let client = reqwest::Client::new();
    let backend_port = find_free_port();

    let resp = client
        .post(gateway.url("/api/v1.0/caddy"))
        .json(&serde_json::json!({
            "name": "grafana",
            "ipAddress": "10.9.0.5",
            "port": backend_port.to_string()
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = resp.json::<ServiceResponse>().await.unwrap();
    assert_eq!(created.service.domain, "grafana.node.test");
    assert_eq!(created.service.port, backend_port.to_string());

    // Both copies of the registry and the site file are written
    let state = gateway.state_dir();
    let primary = std::fs::read_to_string(state.join("caddy/caddy.json")).unwrap();
    let mirror = std::fs::read_to_string(state.join("mirror/caddy.json")).unwrap();
    assert_eq!(primary, mirror);
    let site = std::fs::read_to_string(state.join("caddy/erebrus.caddy")).unwrap();
    assert!(site.contains("grafana.node.test"));
    assert!(site.contains(&format!("10.9.0.5:{}", backend_port)));

    // Duplicate name is rejected with the reason
    let resp = client
        .post(gateway.url("/api/v1.0/caddy"))
        .json(&serde_json::json!({
            "name": "grafana",
            "ipAddress": "10.9.0.6",
            "port": "3001"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let err = resp.json::<ErrorResponse>().await.unwrap();
    assert_eq!(err.error_code, "validation_error");
    assert_eq!(err.details, vec!["Service Already exists".to_string()]);

    // Nothing listens on the backend port, so the probe reports inactive
    let service = reqwest::get(gateway.url("/api/v1.0/caddy/grafana"))
        .await
        .unwrap()
        .json::<ServiceResponse>()
        .await
        .unwrap();
    assert_eq!(service.service.ip_address, "10.9.0.5");
    assert_eq!(service.service.status, "inactive");

    let resp = client
        .delete(gateway.url("/api/v1.0/caddy/grafana"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let list = reqwest::get(gateway.url("/api/v1.0/caddy"))
        .await
        .unwrap()
        .json::<ServicesList>()
        .await
        .unwrap();
    assert!(list.services.is_empty());

    let site = std::fs::read_to_string(state.join("caddy/erebrus.caddy")).unwrap();
    assert!(!site.contains("grafana.node.test"));

    // Deleting again is not an error
    let resp = client
        .delete(gateway.url("/api/v1.0/caddy/grafana"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

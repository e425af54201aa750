use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use fibre_exporter::export::auth::Credentials;
use fibre_exporter::export::{ExpositionServer, ServerSettings, TlsFiles};
use fibre_exporter::metrics::FibreMetrics;
use reqwest::StatusCode;

fn settings(auth: Option<Credentials>, tls: Option<TlsFiles>) -> ServerSettings {
    ServerSettings {
        listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        metrics_port: 0,
        health_port: 0,
        auth,
        tls,
        shutdown_grace: Duration::from_secs(1),
    }
}

async fn start(
    auth: Option<Credentials>,
    tls: Option<TlsFiles>,
) -> (Arc<FibreMetrics>, ExpositionServer, SocketAddr, SocketAddr) {
    let metrics = Arc::new(FibreMetrics::new("fibre", "test-node").unwrap());
    metrics.set_up(true);
    let server = ExpositionServer::new(settings(auth, tls), Arc::clone(&metrics));
    server.start().await.unwrap();
    let metrics_addr = server.metrics_addr().unwrap();
    let health_addr = server.health_addr().unwrap();
    (metrics, server, metrics_addr, health_addr)
}

async fn get(url: String) -> (StatusCode, String) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status();
    (status, resp.text().await.unwrap())
}

#[tokio::test]
async fn metrics_served_without_auth() {
    let (_metrics, server, m, _) = start(None, None).await;

    let resp = reqwest::get(format!("http://{m}/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
    let body = resp.text().await.unwrap();
    assert!(body.contains("fibre_exporter_up 1"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn health_paths_and_not_found() {
    let (_metrics, server, m, h) = start(None, None).await;

    for addr in [m, h] {
        for path in ["health", "ready"] {
            let (status, body) = get(format!("http://{addr}/{path}")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "OK");
        }
        let (status, body) = get(format!("http://{addr}/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Not Found");
    }

    // The health listener never serves metrics.
    let (status, _) = get(format!("http://{h}/metrics")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn basic_auth_gates_metrics_only() {
    let (metrics, server, m, h) = start(Some(Credentials::new("prom", "s3cret")), None).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("http://{m}/metrics")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        resp.headers()["www-authenticate"],
        "Basic realm=\"FIBRE Metrics\""
    );

    let resp = client
        .get(format!("http://{m}/metrics"))
        .basic_auth("prom", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!("http://{m}/metrics"))
        .header("authorization", "Basic %%%")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!("http://{m}/metrics"))
        .basic_auth("prom", Some("s3cret"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.text().await.unwrap();
    assert!(body.contains("fibre_exporter_errors_total{error_type=\"auth_missing\"} 1"));
    assert!(body.contains("fibre_exporter_errors_total{error_type=\"auth_invalid\"} 1"));
    assert!(body.contains("fibre_exporter_errors_total{error_type=\"auth_malformed\"} 1"));

    // Health stays open on both listeners.
    for addr in [m, h] {
        let (status, _) = get(format!("http://{addr}/health")).await;
        assert_eq!(status, StatusCode::OK);
    }

    assert_eq!(
        metrics
            .errors
            .with_label_values(&["auth_invalid"])
            .get(),
        1.0
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn tls_metrics_listener() {
    let dir = tempfile::tempdir().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    std::fs::write(&cert, certified.cert.pem()).unwrap();
    std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();

    let (_metrics, server, m, h) = start(None, Some(TlsFiles { cert, key })).await;

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let resp = client
        .get(format!("https://localhost:{}/metrics", m.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.text().await.unwrap().contains("fibre_exporter_up 1"));

    // Health stays plaintext.
    let (status, body) = get(format!("http://{h}/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_tls_material_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    std::fs::write(&cert, "not a certificate").unwrap();
    std::fs::write(&key, "not a key").unwrap();

    let metrics = Arc::new(FibreMetrics::new("fibre", "test-node").unwrap());
    let server = ExpositionServer::new(
        settings(None, Some(TlsFiles { cert, key })),
        metrics,
    );
    let err = server.start().await.unwrap_err();
    assert!(format!("{err:#}").contains("loading TLS certificate"));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn port_in_use_fails_start() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let metrics = Arc::new(FibreMetrics::new("fibre", "test-node").unwrap());
    let server = ExpositionServer::new(
        ServerSettings {
            metrics_port: port,
            ..settings(None, None)
        },
        metrics,
    );
    let err = server.start().await.unwrap_err();
    assert!(format!("{err:#}").contains("listening on"));
    server.stop().await.unwrap();
}

//! Delivery Client Integration Tests
//!
//! Tests the HTTP client against a throwaway local listener that records
//! the raw request and answers with a canned status line.

use std::time::Duration;

use intake_relay::core::{EhrClient, PayloadFormat, Transport, TransportError};
use intake_relay::domain::{FieldMap, Participant, Submission};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A request as seen on the wire
struct Captured {
    head: String,
    body: Value,
}

impl Captured {
    fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().find_map(|line| {
            line.to_ascii_lowercase()
                .starts_with(&prefix)
                .then(|| line[prefix.len()..].trim().to_string())
        })
    }
}

async fn read_request(socket: &mut TcpStream) -> Captured {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).into_owned();
            let length = head
                .lines()
                .find_map(|l| {
                    l.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);

            if buf.len() >= end + 4 + length {
                let body = serde_json::from_slice(&buf[end + 4..end + 4 + length]).unwrap();
                return Captured { head, body };
            }
        }
    }

    panic!("connection closed before a full request arrived");
}

/// Accept one connection, record it, reply with `status` and `body`
async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/intake", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let captured = read_request(&mut socket).await;

        let response = format!(
            "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
        captured
    });

    (url, handle)
}

fn client(url: String, token: Option<&str>, format: PayloadFormat) -> EhrClient {
    EhrClient::new(
        Some(url),
        token.map(str::to_string),
        format,
        Duration::from_secs(5),
    )
}

fn submission() -> Submission {
    let mut fields = FieldMap::new();
    fields.insert("name".to_string(), json!("Jane Doe"));
    fields.insert("dob".to_string(), json!("1990-01-01"));
    fields.insert("symptom".to_string(), json!("cough"));
    Submission::captured_at(1_700_000_000.0, fields)
        .with_participant(&Participant::new("PA_1", "jane"))
}

#[tokio::test]
async fn test_fhir_delivery_sends_headers_and_bundle() {
    let (url, server) = serve_once("200 OK", "").await;
    let client = client(url, Some("secret-token"), PayloadFormat::Fhir);

    client.deliver(&submission()).await.unwrap();
    let request = server.await.unwrap();

    assert!(request.head.starts_with("POST /intake HTTP/1.1"));
    assert_eq!(
        request.header("authorization").as_deref(),
        Some("Bearer secret-token")
    );
    assert_eq!(
        request.header("content-type").as_deref(),
        Some("application/json")
    );
    assert_eq!(
        request.header("idempotency-key"),
        Some(submission().idempotency_key())
    );

    assert_eq!(request.body["resourceType"], "Bundle");
    assert_eq!(request.body["entry"][0]["resource"]["id"], "PA_1");
}

#[tokio::test]
async fn test_raw_delivery_without_token() {
    let (url, server) = serve_once("201 Created", "").await;
    let client = client(url, None, PayloadFormat::Raw);

    client.deliver(&submission()).await.unwrap();
    let request = server.await.unwrap();

    assert!(request.header("authorization").is_none());
    assert_eq!(request.body, serde_json::to_value(submission()).unwrap());
}

#[tokio::test]
async fn test_error_status_is_reported_with_body() {
    let (url, server) = serve_once("500 Internal Server Error", "ehr down").await;
    let client = client(url, None, PayloadFormat::Fhir);

    let err = client.deliver(&submission()).await.unwrap_err();
    server.await.unwrap();

    match err {
        TransportError::Status { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "ehr down");
        }
        other => panic!("expected status error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_connection_refused_is_request_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/intake", listener.local_addr().unwrap());
    drop(listener);

    let err = client(url, None, PayloadFormat::Fhir)
        .deliver(&submission())
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Request(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_unresponsive_endpoint_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/intake", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        // Hold the connection open without answering
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = EhrClient::new(
        Some(url),
        None,
        PayloadFormat::Fhir,
        Duration::from_millis(200),
    );
    let err = client.deliver(&submission()).await.unwrap_err();

    assert!(matches!(err, TransportError::Timeout(d) if d == Duration::from_millis(200)));
    server.abort();
}

#[tokio::test]
async fn test_offline_client_makes_no_request() {
    let client = EhrClient::new(None, Some("unused".to_string()), PayloadFormat::Fhir, Duration::from_secs(1));

    assert!(!client.is_configured());
    assert!(client.deliver(&submission()).await.is_ok());
}

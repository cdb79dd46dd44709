//! SCGI scheme: the same handlers behind a fronting web server.

mod common;

use common::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use server_gateway::config::GatewayConfig;
use server_gateway::http::Protocol;
use server_gateway::net::{MockTransport, TcpTransport};
use server_gateway::{Server, TransportRegistry};

fn scgi_registry() -> TransportRegistry {
    let mut registry = TransportRegistry::new();
    registry.register("scgi", TcpTransport::new(Vec::new()), Protocol::Scgi);
    registry
}

#[tokio::test]
async fn scgi_round_trip_over_tcp() {
    let server = Server::with_config("scgi", EchoBody, ephemeral_config(), &scgi_registry()).unwrap();
    server.listen().await.unwrap();
    assert!(server.get_uris()[0].as_str().starts_with("scgi://127.0.0.1:"));

    let raw = scgi_request(
        &[
            ("CONTENT_LENGTH", "5"),
            ("SCGI", "1"),
            ("REQUEST_METHOD", "POST"),
            ("REQUEST_URI", "/form?a=b"),
            ("SERVER_PROTOCOL", "HTTP/1.1"),
            ("HTTP_HOST", "example.test"),
        ],
        b"hello",
    );
    let out = roundtrip(&authority(&server), &raw).await;

    assert!(out.starts_with("Status: 200 OK\r\n"));
    assert!(out.contains("Content-Length: 39\r\n"));
    assert!(!out.contains("Connection:"));
    assert_eq!(body_of(&out), "POST http://example.test/form?a=b\nhello");
    server.stop().await;
}

#[tokio::test]
async fn scgi_streamed_body_is_not_framed() {
    let mut config = ephemeral_config();
    config.framing = server_gateway::config::BodyFraming::Chunked;
    let server = Server::with_config("scgi", PathStream, config, &scgi_registry()).unwrap();
    server.listen().await.unwrap();

    let raw = scgi_request(
        &[
            ("CONTENT_LENGTH", "0"),
            ("REQUEST_METHOD", "GET"),
            ("SCRIPT_NAME", "/app"),
            ("PATH_INFO", "/page"),
        ],
        b"",
    );
    let out = roundtrip(&authority(&server), &raw).await;
    assert!(!out.contains("Transfer-Encoding"));
    assert_eq!(body_of(&out), "path=/app/page");
    server.stop().await;
}

#[tokio::test]
async fn scgi_failure_uses_status_line() {
    let server = Server::with_config("scgi", Failing, ephemeral_config(), &scgi_registry()).unwrap();
    server.listen().await.unwrap();

    let raw = scgi_request(&[("CONTENT_LENGTH", "0"), ("REQUEST_METHOD", "GET")], b"");
    let out = roundtrip(&authority(&server), &raw).await;
    assert!(out.starts_with("Status: 500 Internal Server Error\r\n"));

    let out = roundtrip(&authority(&server), b"7:garbage").await;
    assert!(out.starts_with("Status: 400 Bad Request\r\n"));
    server.stop().await;
}

#[tokio::test]
async fn scgi_over_mock_transport() {
    let transport = MockTransport::new();
    let mut registry = TransportRegistry::new();
    registry.register("scgi", transport.clone(), Protocol::Scgi);

    let server = Server::with_config("scgi", HelloWorld, GatewayConfig::default(), &registry).unwrap();
    server.listen().await.unwrap();
    assert_eq!(server.get_uris()[0].as_str(), "scgi://localhost/");

    let mut client = transport.connect().unwrap();
    client
        .write_all(&scgi_request(
            &[("CONTENT_LENGTH", "0"), ("REQUEST_METHOD", "GET")],
            b"",
        ))
        .await
        .unwrap();
    let mut out = String::new();
    client.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "Status: 200 OK\r\nContent-Length: 12\r\n\r\nHello world!");
    server.stop().await;
}

//! Plain-HTTP forwarding end to end.

use connect_proxy::proxy::protocol::HOP_BY_HOP_HEADERS;
use connect_proxy::utils::{METHOD_NOT_ALLOWED, PROXY_AUTH_REQUIRED};
use connect_proxy::Config;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

mod common;

const ORIGIN_RESPONSE: &str = "HTTP/1.1 201 Made It\r\n\
Content-Length: 5\r\n\
Connection: close\r\n\
Keep-Alive: timeout=5\r\n\
Proxy-Authenticate: Basic\r\n\
Upgrade: h2c\r\n\
X-Custom: yes\r\n\
X-Custom: again\r\n\
\r\n\
hello";

fn response_header_names(response: &str) -> Vec<String> {
    let head = response.split("\r\n\r\n").next().unwrap_or_default();
    head.lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .map(|(name, _)| name.to_ascii_lowercase())
        .collect()
}

#[tokio::test]
async fn forwards_request_and_strips_hop_by_hop_headers() {
    let (origin, mut captured) = common::start_http_upstream(ORIGIN_RESPONSE).await;
    let config = Config {
        username: Some("bob".into()),
        password: Some("correct".into()),
        overrides: vec![("origin.test:80".into(), origin)],
        ..Config::default()
    };
    let proxy = common::start_proxy(config).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "POST http://origin.test/submit?x=1 HTTP/1.1\r\n\
Host: origin.test\r\n\
Connection: keep-alive\r\n\
Keep-Alive: timeout=5\r\n\
Proxy-Authorization: {}\r\n\
Te: trailers\r\n\
Trailers: X-Sum\r\n\
Upgrade: websocket\r\n\
X-Keep: 1\r\n\
X-Keep: 2\r\n\
Content-Length: 4\r\n\
\r\n\
ping",
        common::basic("bob:correct")
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = String::from_utf8(common::read_to_close(&mut client).await).unwrap();
    assert!(
        response.starts_with("HTTP/1.1 201 Made It\r\n"),
        "unexpected response: {response}"
    );
    assert!(response.ends_with("\r\n\r\nhello"));
    let names = response_header_names(&response);
    for hop in HOP_BY_HOP_HEADERS {
        assert!(!names.iter().any(|n| n == hop), "{hop} reflected to client");
    }
    assert_eq!(names.iter().filter(|n| *n == "x-custom").count(), 2);

    let seen = captured.recv().await.unwrap();
    assert_eq!(seen.request_line(), "POST /submit?x=1 HTTP/1.1");
    assert_eq!(seen.body, b"ping");
    assert_eq!(seen.header("host").as_deref(), Some("origin.test"));
    let forwarded = seen.header_names();
    for hop in HOP_BY_HOP_HEADERS {
        assert!(!forwarded.iter().any(|n| n == hop), "{hop} forwarded upstream");
    }
    assert_eq!(forwarded.iter().filter(|n| *n == "x-keep").count(), 2);
}

#[tokio::test]
async fn body_sent_after_head_is_forwarded() {
    let (origin, mut captured) = common::start_http_upstream(ORIGIN_RESPONSE).await;
    let config = Config {
        overrides: vec![("origin.test:80".into(), origin)],
        ..Config::default()
    };
    let proxy = common::start_proxy(config).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"PUT http://origin.test/item HTTP/1.1\r\nContent-Length: 11\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    client.write_all(b"hello world").await.unwrap();

    let response = common::read_to_close(&mut client).await;
    assert!(response.starts_with(b"HTTP/1.1 201"));

    let seen = captured.recv().await.unwrap();
    assert_eq!(seen.request_line(), "PUT /item HTTP/1.1");
    assert_eq!(seen.body, b"hello world");
}

#[tokio::test]
async fn canonical_reason_is_used_when_origin_sends_the_standard_one() {
    let (origin, _captured) = common::start_http_upstream(
        "HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\nnope",
    )
    .await;
    let config = Config {
        overrides: vec![("origin.test:80".into(), origin)],
        ..Config::default()
    };
    let proxy = common::start_proxy(config).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET http://origin.test/missing HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let response = String::from_utf8(common::read_to_close(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.ends_with("nope"));
}

#[tokio::test]
async fn unreachable_origin_gets_503() {
    let port = common::closed_port().await;
    let proxy = common::start_proxy(Config::default()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", port).as_bytes())
        .await
        .unwrap();

    let response = String::from_utf8(common::read_to_close(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    assert!(response.contains(&format!("127.0.0.1:{}", port)));
}

#[tokio::test]
async fn wrong_credentials_get_407_before_forwarding() {
    let (origin, mut captured) = common::start_http_upstream(ORIGIN_RESPONSE).await;
    let config = Config {
        username: Some("bob".into()),
        password: Some("correct".into()),
        overrides: vec![("origin.test:80".into(), origin)],
        ..Config::default()
    };
    let proxy = common::start_proxy(config).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://origin.test/ HTTP/1.1\r\nProxy-Authorization: {}\r\n\r\n",
        common::basic("bob:wrong")
    );
    client.write_all(request.as_bytes()).await.unwrap();

    assert_eq!(common::read_to_close(&mut client).await, PROXY_AUTH_REQUIRED);
    assert!(captured.try_recv().is_err());
}

#[tokio::test]
async fn forwarding_can_be_disabled() {
    let config = Config {
        no_forward: true,
        ..Config::default()
    };
    let proxy = common::start_proxy(config).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET http://origin.test/ HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(common::read_to_close(&mut client).await, METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn chunked_request_body_is_refused() {
    let proxy = common::start_proxy(Config::default()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"POST http://origin.test/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await
        .unwrap();
    let response = common::read_to_close(&mut client).await;
    assert!(response.starts_with(b"HTTP/1.1 411 Length Required"));
}

#[tokio::test]
async fn header_order_and_case_survive_both_directions() {
    let (origin, mut captured) = common::start_http_upstream(
        "HTTP/1.1 200 OK\r\nX-A: 1\r\nx-b: 2\r\nConnection: close\r\nX-A: 3\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;
    let config = Config {
        overrides: vec![("origin.test:80".into(), origin)],
        ..Config::default()
    };
    let proxy = common::start_proxy(config).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            b"GET http://origin.test/ HTTP/1.1\r\nHost: origin.test\r\nX-First: 1\r\nKeep-Alive: 5\r\nx-second: 2\r\nX-First: 3\r\n\r\n",
        )
        .await
        .unwrap();

    let response = String::from_utf8(common::read_to_close(&mut client).await).unwrap();
    assert_eq!(
        response,
        "HTTP/1.1 200 OK\r\nX-A: 1\r\nx-b: 2\r\nX-A: 3\r\nContent-Length: 2\r\n\r\nok"
    );

    let seen = captured.recv().await.unwrap();
    assert_eq!(
        seen.head,
        "GET / HTTP/1.1\r\nHost: origin.test\r\nX-First: 1\r\nx-second: 2\r\nX-First: 3\r\n\r\n"
    );
}

#[tokio::test]
async fn chunked_response_is_decoded_for_the_client() {
    let (origin, _captured) = common::start_http_upstream(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nX-Kind: chunks\r\n\r\n4\r\nping\r\n5\r\n pong\r\n0\r\n\r\n",
    )
    .await;
    let config = Config {
        overrides: vec![("origin.test:80".into(), origin)],
        ..Config::default()
    };
    let proxy = common::start_proxy(config).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET http://origin.test/stream HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let response = String::from_utf8(common::read_to_close(&mut client).await).unwrap();
    assert_eq!(response, "HTTP/1.1 200 OK\r\nX-Kind: chunks\r\n\r\nping pong");
}

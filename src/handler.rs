use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use crate::blocklist::BlockList;
use crate::cache::ResponseCache;
use crate::stats::Stats;

const MAX_HEAD_BYTES: usize = 32 * 1024;
const READ_CHUNK: usize = 4096;
const MAX_HEADERS: usize = 64;

/// Shared state handed to every connection worker.
#[derive(Clone)]
pub struct ProxyContext {
    pub cache: Arc<ResponseCache>,
    pub blocklist: Arc<BlockList>,
    pub stats: Arc<Stats>,
    pub connect_timeout: Option<Duration>,
}

#[derive(Debug)]
struct RequestHead {
    method: String,
    /// Request target exactly as received; for GET this is the absolute URL
    /// and doubles as the cache key.
    target: String,
    /// Minor HTTP version from the request line.
    version: u8,
    headers: Vec<(String, String)>,
    /// Offset of the first byte past the header terminator.
    head_len: usize,
}

/// Serves one accepted client connection to completion. The caller owns the
/// socket; it is closed on every exit path when the stream drops.
pub async fn handle_connection(mut client: TcpStream, ctx: ProxyContext) -> Result<()> {
    let _ = client.set_nodelay(true);

    let mut buf = Vec::with_capacity(READ_CHUNK);
    let Some(head) = read_request_head(&mut client, &mut buf).await? else {
        return Ok(());
    };

    if head.method == "CONNECT" {
        handle_connect(client, &head, &buf[head.head_len..], &ctx).await
    } else {
        handle_http(client, &head, &buf[head.head_len..], &ctx).await
    }
}

/// Accumulates the request head until `httparse` reports completion, capped
/// at `MAX_HEAD_BYTES`. EOF, overflow, or a parse error all terminate the
/// job with no response.
async fn read_request_head(
    client: &mut TcpStream,
    buf: &mut Vec<u8>,
) -> Result<Option<RequestHead>> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            debug!("client closed before completing the request head");
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        match parse_head(buf) {
            Ok(Some(head)) => return Ok(Some(head)),
            Ok(None) if buf.len() >= MAX_HEAD_BYTES => {
                debug!("request head exceeded {} bytes, dropping", MAX_HEAD_BYTES);
                return Ok(None);
            }
            Ok(None) => {}
            Err(e) => {
                debug!("unparseable request head: {}", e);
                return Ok(None);
            }
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf)? {
        httparse::Status::Complete(head_len) => Ok(Some(RequestHead {
            method: req.method.unwrap_or("").to_owned(),
            target: req.path.unwrap_or("").to_owned(),
            version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .filter(|h| !h.name.is_empty())
                .map(|h| {
                    (
                        h.name.to_owned(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
            head_len,
        })),
        httparse::Status::Partial => Ok(None),
    }
}

/// Plaintext GET path: block check, cache lookup, origin fetch, cache fill.
async fn handle_http(
    mut client: TcpStream,
    head: &RequestHead,
    body: &[u8],
    ctx: &ProxyContext,
) -> Result<()> {
    if !head.method.eq_ignore_ascii_case("GET") {
        warn!("unsupported HTTP method: {}", head.method);
        return Ok(());
    }

    let Ok(url) = Url::parse(&head.target) else {
        debug!("request target is not an absolute URL: {}", head.target);
        return Ok(());
    };
    let Some(host) = url.host_str().map(|h| h.to_ascii_lowercase()) else {
        debug!("request URL has no host: {}", head.target);
        return Ok(());
    };

    if ctx.blocklist.is_blocked(&host) {
        ctx.stats.blocked.fetch_add(1, Ordering::Relaxed);
        debug!("blocked GET for {}", host);
        return write_block_page(&mut client, &host).await;
    }

    if let Some(cached) = ctx.cache.get(&head.target) {
        ctx.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        debug!("cache hit for {}", head.target);
        client.write_all(&cached).await?;
        client.flush().await?;
        return Ok(());
    }
    ctx.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
    debug!("cache miss for {}", head.target);

    let port = url.port().unwrap_or(80);
    let mut origin = match connect_origin(&host, port, ctx.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("failed to connect to origin {}:{}: {}", host, port, e);
            return Ok(());
        }
    };
    let _ = origin.set_nodelay(true);

    let request = build_origin_request(head, &origin_form(&url), body);
    origin.write_all(&request).await?;
    origin.flush().await?;

    // Only fully buffered responses reach the client or the cache.
    let mut response = Vec::new();
    origin.read_to_end(&mut response).await?;
    ctx.stats
        .bytes_in
        .fetch_add(response.len() as u64, Ordering::Relaxed);

    // Cache first: the entry stays valid even if the client has gone away.
    let response = Bytes::from(response);
    ctx.cache.put(head.target.clone(), response.clone());

    client.write_all(&response).await?;
    client.flush().await?;
    ctx.stats
        .bytes_out
        .fetch_add(response.len() as u64, Ordering::Relaxed);
    Ok(())
}

/// CONNECT path: block check, origin connect, 200 acknowledgement, then an
/// opaque byte relay until both directions finish.
async fn handle_connect(
    mut client: TcpStream,
    head: &RequestHead,
    body: &[u8],
    ctx: &ProxyContext,
) -> Result<()> {
    let (host, port) = split_authority(&head.target);
    let host = host.to_ascii_lowercase();

    if ctx.blocklist.is_blocked(&host) {
        ctx.stats.blocked.fetch_add(1, Ordering::Relaxed);
        debug!("blocked CONNECT for {}", host);
        return write_block_page(&mut client, &host).await;
    }

    let mut origin = match connect_origin(&host, port, ctx.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("failed to connect to {}:{}: {}", host, port, e);
            return write_error_page(
                &mut client,
                "502 Bad Gateway",
                &format!("Failed to connect to {host}:{port}"),
            )
            .await;
        }
    };
    let _ = origin.set_nodelay(true);

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    client.flush().await?;

    // Bytes the client pipelined behind the CONNECT head belong to the
    // tunnel payload.
    if !body.is_empty() {
        origin.write_all(body).await?;
    }

    ctx.stats.tunnels.fetch_add(1, Ordering::Relaxed);
    debug!("tunnel established to {}:{}", host, port);

    let (up, down) = relay(client, origin).await;
    ctx.stats.bytes_out.fetch_add(up, Ordering::Relaxed);
    ctx.stats.bytes_in.fetch_add(down, Ordering::Relaxed);
    Ok(())
}

/// Two independent unidirectional copy tasks. Each shuts down the write
/// half of its destination when its source reaches EOF, so one closing peer
/// half-closes the tunnel while the opposite direction drains. Both tasks
/// are joined before the sockets drop.
async fn relay(client: TcpStream, origin: TcpStream) -> (u64, u64) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut origin_read, mut origin_write) = origin.into_split();

    let upstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut origin_write)
            .await
            .unwrap_or(0);
        origin_write.shutdown().await.ok();
        copied
    });
    let downstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut origin_read, &mut client_write)
            .await
            .unwrap_or(0);
        client_write.shutdown().await.ok();
        copied
    });

    (upstream.await.unwrap_or(0), downstream.await.unwrap_or(0))
}

async fn connect_origin(
    host: &str,
    port: u16,
    connect_timeout: Option<Duration>,
) -> std::io::Result<TcpStream> {
    match connect_timeout {
        Some(limit) => match timeout(limit, TcpStream::connect((host, port))).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        },
        None => TcpStream::connect((host, port)).await,
    }
}

/// Splits a CONNECT authority into host and port, defaulting to 443.
fn split_authority(target: &str) -> (&str, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(443)),
        None => (target, 443),
    }
}

/// Path plus query of an absolute URL, in the origin-form servers expect.
fn origin_form(url: &Url) -> String {
    let mut path = url.path().to_owned();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    path
}

/// Rewrites the client's request for the origin: origin-form request line,
/// the client's headers minus any `Proxy-Connection*`, and whatever body
/// bytes were already buffered behind the head.
fn build_origin_request(head: &RequestHead, origin_path: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(READ_CHUNK);
    out.extend_from_slice(
        format!("{} {} HTTP/1.{}\r\n", head.method, origin_path, head.version).as_bytes(),
    );
    for (name, value) in &head.headers {
        if name.to_ascii_lowercase().starts_with("proxy-connection") {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

async fn write_block_page(client: &mut TcpStream, host: &str) -> Result<()> {
    let body = format!(
        "<html><body><h1>403 Forbidden</h1><p>Access to the host '{host}' is blocked.</p></body></html>"
    );
    write_html(client, "403 Forbidden", &body).await
}

async fn write_error_page(client: &mut TcpStream, status: &str, message: &str) -> Result<()> {
    let body = format!("<html><body><h1>{status}</h1><p>{message}</p></body></html>");
    write_html(client, status, &body).await
}

async fn write_html(client: &mut TcpStream, status: &str, body: &str) -> Result<()> {
    let response =
        format!("HTTP/1.1 {status}\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n{body}");
    client.write_all(response.as_bytes()).await?;
    client.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_head_extracts_request_line_and_headers() {
        let raw = b"GET http://example.com/a?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\ntrailing";
        let head = parse_head(raw).unwrap().unwrap();

        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com/a?q=1");
        assert_eq!(head.version, 1);
        assert_eq!(head.headers.len(), 2);
        assert_eq!(&raw[head.head_len..], b"trailing");
    }

    #[test]
    fn parse_head_reports_incomplete_input() {
        assert!(parse_head(b"GET http://example.com/ HTTP/1.1\r\nHost: ex")
            .unwrap()
            .is_none());
    }

    #[test]
    fn parse_head_rejects_garbage() {
        assert!(parse_head(b"\x00\x01\x02\r\n\r\n").is_err());
    }

    #[test]
    fn origin_form_keeps_path_and_query() {
        let url = Url::parse("http://example.com/a/b?q=1&r=2").unwrap();
        assert_eq!(origin_form(&url), "/a/b?q=1&r=2");

        let url = Url::parse("http://example.com").unwrap();
        assert_eq!(origin_form(&url), "/");

        let url = Url::parse("http://example.com/plain").unwrap();
        assert_eq!(origin_form(&url), "/plain");
    }

    #[test]
    fn split_authority_defaults_to_443() {
        assert_eq!(split_authority("example.com:8443"), ("example.com", 8443));
        assert_eq!(split_authority("example.com"), ("example.com", 443));
        assert_eq!(split_authority("example.com:x"), ("example.com", 443));
    }

    #[test]
    fn origin_request_strips_proxy_connection_headers() {
        let head = RequestHead {
            method: "GET".to_owned(),
            target: "http://example.com/x".to_owned(),
            version: 1,
            headers: vec![
                ("Host".to_owned(), "example.com".to_owned()),
                ("Proxy-Connection".to_owned(), "keep-alive".to_owned()),
                ("PROXY-CONNECTION-HINT".to_owned(), "1".to_owned()),
                ("User-Agent".to_owned(), "test".to_owned()),
            ],
            head_len: 0,
        };

        let request = build_origin_request(&head, "/x", b"");
        let text = String::from_utf8(request).unwrap();

        assert!(text.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(!text.to_ascii_lowercase().contains("proxy-connection"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("User-Agent: test\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn origin_request_appends_buffered_body() {
        let head = RequestHead {
            method: "GET".to_owned(),
            target: "http://example.com/x".to_owned(),
            version: 0,
            headers: vec![("Host".to_owned(), "example.com".to_owned())],
            head_len: 0,
        };

        let request = build_origin_request(&head, "/x", b"early-body");
        let text = String::from_utf8(request).unwrap();

        assert!(text.starts_with("GET /x HTTP/1.0\r\n"));
        assert!(text.ends_with("\r\n\r\nearly-body"));
    }
}

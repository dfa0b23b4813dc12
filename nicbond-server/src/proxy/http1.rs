use anyhow::{bail, Context, Result};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const MAX_HEADER_BYTES: usize = 32 * 1024;
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers that must not travel past one hop (RFC 7230 §6.1), stripped
/// before any request is replayed upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// One parsed inbound request.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Re-serialize the request head for replay to an origin.
    pub fn serialize_head(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.target).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// HTTP/1.1 framing over one raw connection. Keeps the read buffer across
/// requests so keep-alive works, and hands back any over-read bytes when the
/// connection is re-purposed (TLS accept after CONNECT, raw splice).
pub struct H1Conn<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> H1Conn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Surrender the connection plus whatever was read past the last parsed
    /// request.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.buf)
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Read and parse the next request. `Ok(None)` on clean end-of-stream
    /// before any byte of a new request.
    pub async fn read_request(&mut self) -> Result<Option<ParsedRequest>> {
        let mut tmp = [0u8; 4096];
        let head_end = loop {
            if let Some(pos) = find_head_end(&self.buf) {
                break pos;
            }
            if self.buf.len() > MAX_HEADER_BYTES {
                bail!("request head exceeds {MAX_HEADER_BYTES} bytes");
            }
            let n = self
                .stream
                .read(&mut tmp)
                .await
                .context("failed to read request head")?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!("connection closed mid request head");
            }
            self.buf.extend_from_slice(&tmp[..n]);
        };

        let mut parsed_headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut parsed_headers);
        match req.parse(&self.buf[..head_end]) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => bail!("incomplete request head"),
            Err(e) => bail!("malformed request head: {e}"),
        }

        let method = req.method.context("request missing method")?.to_string();
        let target = req.path.context("request missing target")?.to_string();

        let mut headers = HeaderMap::new();
        for h in req.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .with_context(|| format!("bad header name {:?}", h.name))?;
            let value =
                HeaderValue::from_bytes(h.value).context("bad header value")?;
            headers.append(name, value);
        }

        self.buf.drain(..head_end);

        // CONNECT has no body; anything already buffered belongs to the
        // tunnel that follows.
        if method.eq_ignore_ascii_case("CONNECT") {
            return Ok(Some(ParsedRequest {
                method,
                target,
                headers,
                body: Bytes::new(),
            }));
        }

        if headers
            .get("transfer-encoding")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            bail!("chunked request bodies are not supported");
        }

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if content_length > MAX_BODY_BYTES {
            bail!("request body too large: {content_length} bytes");
        }

        while self.buf.len() < content_length {
            let n = self
                .stream
                .read(&mut tmp)
                .await
                .context("failed to read request body")?;
            if n == 0 {
                bail!("connection closed mid request body");
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
        let body = Bytes::from(self.buf.drain(..content_length).collect::<Vec<u8>>());

        Ok(Some(ParsedRequest {
            method,
            target,
            headers,
            body,
        }))
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Drop hop-by-hop headers and force identity encoding so ranged math works
/// on raw bytes.
pub fn sanitize_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out.insert("accept-encoding", HeaderValue::from_static("identity"));
    out
}

/// Serialize a response head.
pub async fn write_response_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: u16,
    reason: &str,
    headers: &HeaderMap,
) -> std::io::Result<()> {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n").into_bytes();
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    w.write_all(&out).await?;
    w.flush().await
}

/// The response head sent to the client once a download has been taken over
/// for range-splitting.
pub async fn write_accel_preamble<W: AsyncWrite + Unpin>(
    w: &mut W,
    total: u64,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/octet-stream\r\n\
         Transfer-Encoding: chunked\r\n\
         Accept-Ranges: bytes\r\n\
         Connection: close\r\n\
         Cache-Control: no-cache\r\n\
         X-Proxy-Chunked: true\r\n\
         Content-Length: {total}\r\n\
         \r\n"
    );
    w.write_all(head.as_bytes()).await?;
    w.flush().await
}

/// `hex(len)\r\n` — opens one chunked-transfer frame.
pub async fn write_frame_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    len: u64,
) -> std::io::Result<()> {
    w.write_all(format!("{len:x}\r\n").as_bytes()).await
}

/// Closes one chunked-transfer frame.
pub async fn write_frame_end<W: AsyncWrite + Unpin>(w: &mut W) -> std::io::Result<()> {
    w.write_all(b"\r\n").await
}

/// The terminating zero-length frame.
pub async fn write_final_frame<W: AsyncWrite + Unpin>(w: &mut W) -> std::io::Result<()> {
    w.write_all(b"0\r\n\r\n").await?;
    w.flush().await
}

/// Replays a prefix before handing reads through to the inner stream.
/// Needed when bytes past a request head were already pulled off the socket
/// and the connection is being re-purposed.
pub struct Rewind<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

//! Local dispatcher (C2): given a tunnel descriptor and a decoded request,
//! open and drive the corresponding local request/response or upgraded
//! stream, translating the result back into outbound frames.

use std::sync::Arc;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use tunnel_protocol::{
    frame_type, Frame, HeaderMap as WireHeaderMap, HeaderValue as WireHeaderValue,
    HttpRequestDescriptor, HttpResponseHead, RequestId,
};

use crate::config::{SessionConfig, TunnelDescriptor};

/// Inbound channel capacity used to stream a request body into the local
/// HTTP client while frames keep arriving from the relay.
const BODY_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error("unknown tunnel {0:?}")]
    UnknownTunnel(String),
    #[error("malformed request descriptor: {0}")]
    MalformedDescriptor(#[from] serde_json::Error),
    #[error("local connect failed: {0}")]
    Connect(std::io::Error),
    #[error("local I/O error: {0}")]
    Io(std::io::Error),
    #[error("TLS handshake failed: {0}")]
    Tls(std::io::Error),
    #[error("local request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
}

/// Spawn a task that owns one PerRequest: consumes `inbox` for subsequent
/// frames, drives the local call, and writes outbound frames through
/// `outbound`. Always reports completion on `completions` so the registry
/// can forget this request id.
pub fn spawn(
    frame: Frame,
    inbox: mpsc::Receiver<Frame>,
    config: Arc<SessionConfig>,
    http_client: Arc<reqwest::Client>,
    outbound: mpsc::UnboundedSender<Frame>,
    completions: mpsc::UnboundedSender<RequestId>,
) {
    let request_id = frame.request_id;
    tokio::spawn(async move {
        run(frame, inbox, config, http_client, outbound).await;
        let _ = completions.send(request_id);
    });
}

async fn run(
    frame: Frame,
    inbox: mpsc::Receiver<Frame>,
    config: Arc<SessionConfig>,
    http_client: Arc<reqwest::Client>,
    outbound: mpsc::UnboundedSender<Frame>,
) {
    let request_id = frame.request_id;
    let is_upgrade = frame.is_type(frame_type::WS);

    let result = dispatch(&frame, inbox, &config, &http_client, &outbound, is_upgrade).await;

    if let Err(err) = result {
        warn!(request_id = %hex(&request_id), error = %err, "dispatch failed, reporting bad gateway");
        let _ = outbound.send(Frame::empty(request_id, frame_type::BAD_GATEWAY));
    }
}

async fn dispatch(
    frame: &Frame,
    inbox: mpsc::Receiver<Frame>,
    config: &SessionConfig,
    http_client: &reqwest::Client,
    outbound: &mpsc::UnboundedSender<Frame>,
    is_upgrade: bool,
) -> Result<(), DispatchError> {
    let request_id = frame.request_id;
    let descriptor: HttpRequestDescriptor = serde_json::from_slice(&frame.payload)?;

    let tunnel = config
        .tunnel_by_remote_name(&descriptor.subdomain)
        .ok_or_else(|| DispatchError::UnknownTunnel(descriptor.subdomain.clone()))?;

    let mut headers = descriptor.headers;
    if tunnel.strip_host_header {
        strip_host_header(&mut headers);
    }

    let path = compose_path(tunnel, &descriptor.url);

    if is_upgrade {
        dispatch_upgrade(request_id, tunnel, &descriptor.method, &path, &headers, inbox, outbound).await
    } else {
        dispatch_http(request_id, tunnel, &descriptor.method, &path, &headers, inbox, http_client, outbound).await
    }
}

/// `local_target`'s path is `/`: use the request's own path. Otherwise
/// concatenate `local_target.path + url`.
fn compose_path(tunnel: &TunnelDescriptor, url: &str) -> String {
    if tunnel.local_target.path == "/" {
        url.to_string()
    } else {
        format!("{}{}", tunnel.local_target.path, url)
    }
}

fn strip_host_header(headers: &mut WireHeaderMap) {
    let key = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case("host"))
        .cloned();
    if let Some(key) = key {
        headers.remove(&key);
    }
}

// ---- HTTP kind --------------------------------------------------------

async fn dispatch_http(
    request_id: RequestId,
    tunnel: &TunnelDescriptor,
    method: &str,
    path: &str,
    headers: &WireHeaderMap,
    mut inbox: mpsc::Receiver<Frame>,
    http_client: &reqwest::Client,
    outbound: &mpsc::UnboundedSender<Frame>,
) -> Result<(), DispatchError> {
    let url = format!("{}{}", tunnel.local_target.origin(), path);
    let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);

    // Stream the request body from inbound `data`/`end` frames into the
    // outbound local call without buffering it all in memory.
    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(BODY_CHANNEL_CAPACITY);
    let body_feeder = tokio::spawn(async move {
        while let Some(frame) = inbox.recv().await {
            if frame.is_type(frame_type::DATA) {
                if body_tx.send(Ok(Bytes::from(frame.payload))).await.is_err() {
                    break;
                }
            } else if frame.is_type(frame_type::END) {
                break;
            }
        }
    });
    let body_stream = tokio_stream::wrappers::ReceiverStream::new(body_rx);

    let mut builder = http_client
        .request(method, &url)
        .body(reqwest::Body::wrap_stream(body_stream));
    for (name, value) in headers {
        for v in value.values() {
            builder = builder.header(name.as_str(), v);
        }
    }

    let response = builder.send().await?;
    let _ = body_feeder.await;

    let head = HttpResponseHead {
        status_code: response.status().as_u16(),
        headers: to_wire_headers(response.headers()),
    };
    outbound
        .send(Frame::json(request_id, frame_type::HEAD, &head).map_err(|_| {
            DispatchError::Io(std::io::Error::other("failed to encode response head"))
        })?)
        .ok();

    let mut body = response.bytes_stream();
    use futures_util::StreamExt;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if outbound
            .send(Frame::new(request_id, frame_type::DATA, chunk.to_vec()))
            .is_err()
        {
            return Ok(());
        }
    }
    let _ = outbound.send(Frame::empty(request_id, frame_type::END));
    Ok(())
}

fn to_wire_headers(headers: &reqwest::header::HeaderMap) -> WireHeaderMap {
    let mut out = WireHeaderMap::new();
    for (name, value) in headers {
        let value = value.to_str().unwrap_or("").to_string();
        match out.get_mut(name.as_str()) {
            Some(existing) => {
                let prev = std::mem::replace(existing, WireHeaderValue::One(String::new()));
                *existing = match prev {
                    WireHeaderValue::One(v) => WireHeaderValue::Many(vec![v, value]),
                    WireHeaderValue::Many(mut vs) => {
                        vs.push(value);
                        WireHeaderValue::Many(vs)
                    }
                };
            }
            None => {
                out.insert(name.as_str().to_string(), WireHeaderValue::One(value));
            }
        }
    }
    out
}

// ---- Upgraded-stream kind ----------------------------------------------

async fn dispatch_upgrade(
    request_id: RequestId,
    tunnel: &TunnelDescriptor,
    method: &str,
    path: &str,
    headers: &WireHeaderMap,
    inbox: mpsc::Receiver<Frame>,
    outbound: &mpsc::UnboundedSender<Frame>,
) -> Result<(), DispatchError> {
    let authority = tunnel.local_target.authority();
    let tcp = TcpStream::connect(&authority)
        .await
        .map_err(DispatchError::Connect)?;

    if tunnel.local_target.is_tls() {
        let connector = tls_connector();
        let server_name = ServerName::try_from(tunnel.local_target.host.clone())
            .map_err(|e| DispatchError::Tls(std::io::Error::other(e)))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(DispatchError::Tls)?;
        run_upgrade(request_id, method, path, headers, tunnel, tls, inbox, outbound).await
    } else {
        run_upgrade(request_id, method, path, headers, tunnel, tcp, inbox, outbound).await
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn run_upgrade<S>(
    request_id: RequestId,
    method: &str,
    path: &str,
    headers: &WireHeaderMap,
    tunnel: &TunnelDescriptor,
    mut stream: S,
    mut inbox: mpsc::Receiver<Frame>,
    outbound: &mpsc::UnboundedSender<Frame>,
) -> Result<(), DispatchError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut request = format!("{} {} HTTP/1.1\r\n", method, path);
    request.push_str(&format!("Host: {}\r\n", tunnel.local_target.authority()));
    for (name, value) in headers {
        for v in value.values() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(DispatchError::Io)?;

    let head_bytes = read_upgrade_head(&mut stream).await?;
    debug!(request_id = %hex(&request_id), "upgrade response received");
    outbound
        .send(Frame::new(request_id, frame_type::DATA, head_bytes))
        .ok();

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let request_id_for_read = request_id;
    let outbound_clone = outbound.clone();
    let mut upstream_to_tunnel = tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if outbound_clone
                        .send(Frame::new(request_id_for_read, frame_type::DATA, buf[..n].to_vec()))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = outbound_clone.send(Frame::empty(request_id_for_read, frame_type::END));
    });

    let tunnel_to_upstream = async {
        while let Some(frame) = inbox.recv().await {
            if frame.is_type(frame_type::DATA) {
                if write_half.write_all(&frame.payload).await.is_err() {
                    break;
                }
            } else if frame.is_type(frame_type::END) {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    };

    tokio::select! {
        _ = &mut upstream_to_tunnel => {}
        _ = tunnel_to_upstream => { upstream_to_tunnel.abort(); }
    }

    Ok(())
}

/// Read the upstream's raw HTTP response head (status line + headers,
/// through the blank line) without buffering any body bytes past it.
async fn read_upgrade_head<S>(stream: &mut S) -> Result<Vec<u8>, DispatchError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.map_err(DispatchError::Io)?;
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return Err(DispatchError::Io(std::io::Error::other("upgrade response head too large")));
        }
    }
    Ok(buf)
}

fn hex(id: &RequestId) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_forward_spec;
    use tunnel_protocol::HeaderValue;

    #[test]
    fn test_compose_path_uses_request_url_when_base_path_is_root() {
        let tunnel = parse_forward_spec("app|http://127.0.0.1:8080").unwrap();
        assert_eq!(compose_path(&tunnel, "/ping"), "/ping");
    }

    #[test]
    fn test_compose_path_prefixes_base_path() {
        let tunnel = parse_forward_spec("app|http://127.0.0.1:8080/base").unwrap();
        assert_eq!(compose_path(&tunnel, "/ping"), "/base/ping");
    }

    #[test]
    fn test_strip_host_header_is_case_insensitive() {
        let mut headers = WireHeaderMap::new();
        headers.insert("Host".to_string(), HeaderValue::One("app.example".to_string()));
        headers.insert("x-other".to_string(), HeaderValue::One("v".to_string()));
        strip_host_header(&mut headers);
        assert!(!headers.keys().any(|k| k.eq_ignore_ascii_case("host")));
        assert_eq!(headers.len(), 1);
    }
}

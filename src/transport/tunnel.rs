//! Raw TCP dialing, direct or through an upstream proxy
//!
//! Produces a plain byte stream to `host:port`; TLS is layered on top by the connector.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::error::{AutobidError, Result};
use crate::models::{format_authority, ProxyEndpoint, ProxyScheme};

/// Upper bound on a CONNECT response header section
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Open a TCP stream to `host:port`, tunneling through `proxy` when one is given
pub async fn dial(proxy: Option<&ProxyEndpoint>, host: &str, port: u16) -> Result<TcpStream> {
    let direct_addr = format_authority(host, port);

    let Some(proxy) = proxy else {
        debug!("Dialing {} directly", direct_addr);
        return TcpStream::connect(&direct_addr)
            .await
            .map_err(|e| AutobidError::Connect(format!("TCP connect failed: {}", e)));
    };

    let proxy_addr = proxy.addr();
    debug!("Dialing {} through {}", direct_addr, proxy);

    match proxy.scheme {
        ProxyScheme::Http | ProxyScheme::Https => {
            connect_via_http_proxy(proxy, &proxy_addr, host, port)
                .await
                .map_err(|e| {
                    AutobidError::Connect(format!(
                        "HTTP proxy connect failed ({} -> {}): {}",
                        proxy_addr, direct_addr, e
                    ))
                })
        }
        ProxyScheme::Socks5 | ProxyScheme::Socks5h => {
            connect_via_socks5_proxy(proxy, &proxy_addr, host, port)
                .await
                .map_err(|e| {
                    AutobidError::Connect(format!(
                        "SOCKS5 proxy connect failed ({} -> {}): {}",
                        proxy_addr, direct_addr, e
                    ))
                })
        }
    }
}

async fn connect_via_http_proxy(
    proxy: &ProxyEndpoint,
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let mut stream = TcpStream::connect(proxy_addr).await?;

    let request = build_connect_request(proxy, target_host, target_port);
    stream.write_all(request.as_bytes()).await?;

    // Read the reply line by line so no tunneled bytes are consumed past the
    // blank line that ends the proxy's header section.
    let mut reader = BufReader::with_capacity(1, &mut stream);
    let mut status_line = String::new();
    if reader.read_line(&mut status_line).await? == 0 {
        anyhow::bail!("empty CONNECT response");
    }

    if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
        anyhow::bail!("CONNECT failed: {}", status_line.trim_end());
    }

    let mut consumed = status_line.len();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            anyhow::bail!("CONNECT response ended before headers completed");
        }
        consumed += n;
        if consumed > MAX_CONNECT_RESPONSE {
            anyhow::bail!("CONNECT response headers too large");
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    Ok(stream)
}

/// Build the HTTP CONNECT request for a tunnel to `target_host:target_port`
fn build_connect_request(proxy: &ProxyEndpoint, target_host: &str, target_port: u16) -> String {
    let authority = format_authority(target_host, target_port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

    if let Some(username) = &proxy.username {
        let password = proxy.password.as_deref().unwrap_or("");
        let credentials = format!("{}:{}", username, password);
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials.as_bytes())
        ));
    }

    request.push_str("\r\n");
    request
}

/// SOCKS5 handshake. Both `socks5` and `socks5h` hand the target name to the
/// proxy, so resolution always happens proxy-side.
async fn connect_via_socks5_proxy(
    proxy: &ProxyEndpoint,
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect(proxy_addr).await?;
    let target = (target_host, target_port);

    let credentials = proxy.username.as_deref().zip(proxy.password.as_deref());
    let tunnel = match credentials {
        Some((user, pass)) => {
            Socks5Stream::connect_with_password_and_socket(socket, target, user, pass).await?
        }
        None => Socks5Stream::connect_with_socket(socket, target).await?,
    };

    Ok(tunnel.into_inner())
}

//! HTTP CONNECT front end

use super::ProxyError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Run the CONNECT exchange on a local connection. Returns the `host:port`
/// target after the `200 Connection established` line has been written; any
/// other method gets a 405 and an error.
pub async fn http_handshake(stream: &mut TcpStream) -> Result<String, ProxyError> {
    let mut reader = BufReader::new(&mut *stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    // drain headers up to the blank line
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
    }
    drop(reader);

    if method != "CONNECT" {
        stream
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
            .await?;
        return Err(ProxyError::UnsupportedMethod(method));
    }
    if target.is_empty() || !target.contains(':') {
        stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        return Err(ProxyError::GeneralFailure(format!(
            "missing port in target {target:?}"
        )));
    }

    let banner = format!(
        "HTTP/1.1 200 Connection established\r\nProxy-Agent: d5tun/{}\r\n\r\n",
        crate::version_string(crate::version_word())
    );
    stream.write_all(banner.as_bytes()).await?;
    debug!(%target, "http connect");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpStream::connect(addr).await.unwrap();
        (client, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_connect_established() {
        let (mut client, mut server) = pair().await;
        let task = tokio::spawn(async move { http_handshake(&mut server).await });

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]);
        assert!(reply.starts_with("HTTP/1.1 200 Connection established\r\n"));

        assert_eq!(task.await.unwrap().unwrap(), "example.com:443");
    }

    #[tokio::test]
    async fn test_get_rejected() {
        let (mut client, mut server) = pair().await;
        let task = tokio::spawn(async move { http_handshake(&mut server).await });

        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 128];
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 405"));

        assert!(matches!(
            task.await.unwrap(),
            Err(ProxyError::UnsupportedMethod(_))
        ));
    }
}

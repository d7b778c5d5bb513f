//! SOCKS5 front end (RFC 1928)
//!
//! Only CONNECT is served; the reply to the request is sent here, after
//! which the connection's bytes belong to the tunnel.

use super::ProxyError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const SOCKS5_VER: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Run the SOCKS5 greeting and request on a local connection. Returns the
/// `host:port` target; on failure the matching reply byte has already been
/// written.
pub async fn socks5_handshake(stream: &mut TcpStream) -> Result<String, ProxyError> {
    match greeting(stream).await {
        Ok(()) => {}
        Err(e) => {
            // method-selection stage: reply carries only version + code
            let _ = stream.write_all(&[SOCKS5_VER, e.socks5_code()]).await;
            return Err(e);
        }
    }
    stream.write_all(&[SOCKS5_VER, 0x00]).await?;

    match request(stream).await {
        Ok(target) => {
            stream
                .write_all(&[SOCKS5_VER, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await?;
            debug!(%target, "socks5 connect");
            Ok(target)
        }
        Err(e) => {
            let _ = stream
                .write_all(&[SOCKS5_VER, e.socks5_code(), 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await;
            Err(e)
        }
    }
}

async fn greeting(stream: &mut TcpStream) -> Result<(), ProxyError> {
    let mut head = [0u8; 2];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|_| ProxyError::InvalidSocks5Header)?;
    let (ver, nmethods) = (head[0], head[1] as usize);
    if ver != SOCKS5_VER || nmethods < 1 {
        warn!("invalid socks5 header: [{:02x} {:02x}]", head[0], head[1]);
        return Err(ProxyError::InvalidSocks5Header);
    }
    let mut methods = vec![0u8; nmethods];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|_| ProxyError::InvalidSocks5Header)?;
    Ok(())
}

async fn request(stream: &mut TcpStream) -> Result<String, ProxyError> {
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|_| ProxyError::InvalidSocks5Request)?;
    let (ver, cmd, atyp) = (head[0], head[1], head[3]);
    if ver != SOCKS5_VER || cmd != CMD_CONNECT {
        return Err(ProxyError::InvalidSocks5Request);
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            format!("[{}]", std::net::Ipv6Addr::from(ip))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| ProxyError::InvalidSocks5Request)?
        }
        _ => return Err(ProxyError::InvalidSocks5Request),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(format!("{host}:{}", u16::from_be_bytes(port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpStream::connect(addr).await.unwrap();
        (client, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_domain_connect() {
        let (mut client, mut server) = pair().await;
        let task = tokio::spawn(async move { socks5_handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut ack = [0u8; 10];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], 0x05);
        assert_eq!(ack[1], 0x00);

        assert_eq!(task.await.unwrap().unwrap(), "example.com:443");
    }

    #[tokio::test]
    async fn test_ipv4_connect() {
        let (mut client, mut server) = pair().await;
        let task = tokio::spawn(async move { socks5_handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x09])
            .await
            .unwrap();
        let mut ack = [0u8; 10];
        client.read_exact(&mut ack).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), "127.0.0.1:9");
    }

    #[tokio::test]
    async fn test_socks4_header_rejected() {
        let (mut client, mut server) = pair().await;
        let task = tokio::spawn(async move { socks5_handshake(&mut server).await });

        client.write_all(&[0x04, 0x01]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xff]);

        assert!(matches!(
            task.await.unwrap(),
            Err(ProxyError::InvalidSocks5Header)
        ));
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let (mut client, mut server) = pair().await;
        let task = tokio::spawn(async move { socks5_handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        // BIND command
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();
        let mut ack = [0u8; 10];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[1], 0x07);

        assert!(matches!(
            task.await.unwrap(),
            Err(ProxyError::InvalidSocks5Request)
        ));
    }
}

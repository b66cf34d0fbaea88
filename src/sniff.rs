use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::{http, tls};

/// 嗅探阶段最多缓存的字节数
pub const MAX_SNIFF_BUFFER: usize = 32 * 1024;

/// 单次读取的大小
const READ_CHUNK: usize = 4096;

/// 嗅探失败的原因；任何一种都会导致连接被拒绝
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("客户端在发出目标主机名之前关闭了连接")]
    Closed,

    #[error("嗅探超时")]
    Timeout,

    #[error("嗅探缓冲区超过 {0} 字节")]
    BufferExceeded(usize),

    #[error("不是 TLS 握手")]
    NotTls,

    #[error("不是 Client Hello")]
    NotClientHello,

    #[error("格式错误: {0}")]
    Malformed(&'static str),

    #[error("Client Hello 中没有 SNI")]
    NoServerName,

    #[error("HTTP 请求中没有 Host 头")]
    NoHostHeader,

    #[error("读取失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 监听器类型，决定用哪种方式嗅探
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// 明文 HTTP，解析 Host 头
    Http,
    /// TLS，解析 Client Hello 的 SNI
    Tls,
}

impl ListenerKind {
    /// 连接目标时使用的端口
    pub fn default_port(&self) -> u16 {
        match self {
            ListenerKind::Http => 80,
            ListenerKind::Tls => 443,
        }
    }

    /// `Ok(None)` 表示需要更多数据
    pub fn inspect(&self, buf: &[u8]) -> Result<Option<String>, SniffError> {
        match self {
            ListenerKind::Http => http::inspect_request(buf),
            ListenerKind::Tls => tls::inspect_client_hello(buf),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ListenerKind::Http => "HTTP",
            ListenerKind::Tls => "TLS",
        }
    }
}

/// 嗅探结果
#[derive(Debug, Clone)]
pub struct Sniffed {
    /// 目标主机名
    pub hostname: String,
    /// 嗅探期间读到的全部字节，连接上游后原样重放
    pub prefix: Vec<u8>,
}

/// 读取连接开头的数据直到能确定目标主机名
///
/// 读到的字节全部保留在 `prefix` 中，不会丢失也不会改动。
pub async fn sniff<R>(
    stream: &mut R,
    kind: ListenerKind,
    limit: usize,
    deadline: Duration,
) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin,
{
    match timeout(deadline, read_until_host(stream, kind, limit)).await {
        Ok(result) => result,
        Err(_) => Err(SniffError::Timeout),
    }
}

async fn read_until_host<R>(stream: &mut R, kind: ListenerKind, limit: usize) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(SniffError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(hostname) = kind.inspect(&buf)? {
            return Ok(Sniffed { hostname, prefix: buf });
        }
        if buf.len() >= limit {
            return Err(SniffError::BufferExceeded(limit));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_sniff_tls_across_reads() {
        let hello = tls::split_into_records(&tls::build_client_hello(Some("www.example.com")), 50);
        let (mut client, mut server) = tokio::io::duplex(64);

        let payload = hello.clone();
        let writer = tokio::spawn(async move {
            for piece in payload.chunks(13) {
                client.write_all(piece).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let sniffed = sniff(&mut server, ListenerKind::Tls, MAX_SNIFF_BUFFER, Duration::from_secs(5))
            .await
            .unwrap();
        let _client = writer.await.unwrap();

        assert_eq!(sniffed.hostname, "www.example.com");
        assert_eq!(sniffed.prefix, hello);
    }

    #[tokio::test]
    async fn test_sniff_http_keeps_body_bytes() {
        let request = b"POST /upload HTTP/1.1\r\nHost: upload.test\r\nContent-Length: 4\r\n\r\nDATA".to_vec();
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&request).await.unwrap();

        let sniffed = sniff(&mut server, ListenerKind::Http, MAX_SNIFF_BUFFER, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(sniffed.hostname, "upload.test");
        assert_eq!(sniffed.prefix, request);
    }

    #[tokio::test]
    async fn test_sniff_closed_early() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\nHo").await.unwrap();
        drop(client);

        let err = sniff(&mut server, ListenerKind::Http, MAX_SNIFF_BUFFER, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SniffError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sniff_timeout() {
        let (_client, mut server) = tokio::io::duplex(1024);
        let err = sniff(&mut server, ListenerKind::Tls, MAX_SNIFF_BUFFER, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SniffError::Timeout));
    }

    #[tokio::test]
    async fn test_sniff_buffer_limit() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        // 请求行合法但头部永远不结束
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        while request.len() < 2048 {
            request.extend_from_slice(b"X-Padding: aaaaaaaaaaaaaaaa\r\n");
        }
        client.write_all(&request).await.unwrap();

        let err = sniff(&mut server, ListenerKind::Http, 1024, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SniffError::BufferExceeded(1024)));
    }

    #[tokio::test]
    async fn test_sniff_wrong_protocol() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n").await.unwrap();

        let err = sniff(&mut server, ListenerKind::Tls, MAX_SNIFF_BUFFER, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SniffError::NotTls));
    }

    #[test]
    fn test_listener_kind() {
        assert_eq!(ListenerKind::Http.default_port(), 80);
        assert_eq!(ListenerKind::Tls.default_port(), 443);
        assert_eq!(ListenerKind::Tls.name(), "TLS");
    }
}

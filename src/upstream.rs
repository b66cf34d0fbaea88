use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use log::debug;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use url::Url;

use crate::config::ConfigError;
use crate::socks5;

/// 读取 CONNECT 响应头的上限
const MAX_CONNECT_RESPONSE: usize = 8192;

/// 上游代理返回的连接：普通 TCP 或 TLS 包装后的 TCP
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// 代理认证信息
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 代理服务器地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

/// 上游代理，按 URL 协议区分
#[derive(Clone)]
pub enum ForwardProxy {
    /// `socks5://`、`socks5h://`、`socks://`
    Socks5(ProxyEndpoint),
    /// `http://`，使用 CONNECT
    Http(ProxyEndpoint),
    /// `https://`，先和代理建立 TLS，再使用 CONNECT
    Https {
        endpoint: ProxyEndpoint,
        connector: TlsConnector,
    },
}

impl ForwardProxy {
    /// 解析 `scheme://[user:pass@]host[:port]`
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidForwardProxy {
            value: raw.to_string(),
            reason,
        };

        let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("缺少主机名".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let credentials = (!url.username().is_empty()).then(|| Credentials {
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
        });

        let scheme = url.scheme().to_ascii_lowercase();
        let port = match scheme.as_str() {
            "socks" | "socks5" | "socks5h" => url.port().unwrap_or(1080),
            "http" | "https" => url.port_or_known_default().unwrap_or(80),
            other => return Err(invalid(format!("不支持的协议 {}", other))),
        };

        let endpoint = ProxyEndpoint {
            host,
            port,
            credentials,
        };

        Ok(match scheme.as_str() {
            "http" => ForwardProxy::Http(endpoint),
            "https" => ForwardProxy::Https {
                endpoint,
                connector: tls_connector().map_err(|e| invalid(e.to_string()))?,
            },
            _ => ForwardProxy::Socks5(endpoint),
        })
    }

    pub fn endpoint(&self) -> &ProxyEndpoint {
        match self {
            ForwardProxy::Socks5(endpoint) | ForwardProxy::Http(endpoint) => endpoint,
            ForwardProxy::Https { endpoint, .. } => endpoint,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ForwardProxy::Socks5(_) => "socks5",
            ForwardProxy::Http(_) => "http",
            ForwardProxy::Https { .. } => "https",
        }
    }

    /// 经代理连接到 `target_host:target_port`，目标以主机名交给代理
    pub async fn connect(&self, target_host: &str, target_port: u16, dial_timeout: Duration) -> Result<BoxedStream> {
        timeout(dial_timeout, self.connect_inner(target_host, target_port))
            .await
            .map_err(|_| anyhow!("经 {} 连接 {}:{} 超时", self, target_host, target_port))?
    }

    async fn connect_inner(&self, target_host: &str, target_port: u16) -> Result<BoxedStream> {
        let endpoint = self.endpoint();
        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .with_context(|| format!("无法连接到上游代理 {}", self))?;
        let _ = stream.set_nodelay(true);
        debug!("已连接到上游代理: {}", self);

        let credentials = endpoint.credentials.as_ref();
        match self {
            ForwardProxy::Socks5(_) => {
                socks5::handshake(&mut stream, target_host, target_port, credentials).await?;
                Ok(Box::new(stream))
            }
            ForwardProxy::Http(_) => {
                http_connect(&mut stream, target_host, target_port, credentials).await?;
                Ok(Box::new(stream))
            }
            ForwardProxy::Https { connector, .. } => {
                let server_name = ServerName::try_from(endpoint.host.clone())
                    .with_context(|| format!("无效的代理主机名 {}", endpoint.host))?;
                let mut tls = connector
                    .connect(server_name, stream)
                    .await
                    .with_context(|| format!("与上游代理 {} 的 TLS 握手失败", self))?;
                http_connect(&mut tls, target_host, target_port, credentials).await?;
                Ok(Box::new(tls))
            }
        }
    }
}

impl fmt::Display for ForwardProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoint = self.endpoint();
        write!(f, "{}://", self.scheme())?;
        if let Some(creds) = &endpoint.credentials {
            write!(f, "{}@", creds.username)?;
        }
        if endpoint.host.contains(':') {
            write!(f, "[{}]:{}", endpoint.host, endpoint.port)
        } else {
            write!(f, "{}:{}", endpoint.host, endpoint.port)
        }
    }
}

impl fmt::Debug for ForwardProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardProxy")
            .field("scheme", &self.scheme())
            .field("endpoint", self.endpoint())
            .finish()
    }
}

/// 使用 webpki 内置根证书的 TLS 客户端
fn tls_connector() -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(tokio_rustls::rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// 发送 HTTP CONNECT 并确认代理返回 2xx
async fn http_connect<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    credentials: Option<&Credentials>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = authority(target_host, target_port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(creds) = credentials {
        let token = general_purpose::STANDARD.encode(format!("{}:{}", creds.username, creds.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.context("发送 CONNECT 请求失败")?;

    // 逐字节读到空行为止，不能多读：之后的字节属于隧道
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_CONNECT_RESPONSE {
            bail!("CONNECT 响应头过长");
        }
        let n = stream.read(&mut byte).await.context("读取 CONNECT 响应失败")?;
        if n == 0 {
            bail!("上游代理在 CONNECT 响应完成前关闭了连接");
        }
        response.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let status: u16 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    if !version.starts_with("HTTP/") || !(200..300).contains(&status) {
        bail!("上游代理拒绝了 CONNECT: {}", status_line);
    }

    debug!("CONNECT {} 成功", target);
    Ok(())
}

/// 测试用的 HTTP CONNECT 服务端：返回请求目标和 Proxy-Authorization 头
#[cfg(test)]
pub(crate) async fn accept_connect<S>(stream: &mut S, status: u16) -> std::io::Result<(String, Option<String>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        head.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&head).into_owned();
    let mut lines = text.split("\r\n");
    let target = lines
        .next()
        .and_then(|l| l.split(' ').nth(1))
        .unwrap_or_default()
        .to_string();
    let auth = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("proxy-authorization"))
        .map(|(_, value)| value.trim().to_string());

    stream
        .write_all(format!("HTTP/1.1 {} Test\r\nX-Proxy: fake\r\n\r\n", status).as_bytes())
        .await?;
    Ok((target, auth))
}

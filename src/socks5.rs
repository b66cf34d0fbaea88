use anyhow::{bail, Context, Result};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::upstream::Credentials;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// 在已经连上 SOCKS5 服务器的流上完成握手和 CONNECT
///
/// 目标以域名形式交给代理服务器解析（ATYP = DOMAINNAME）。
/// 超时由调用方统一控制。
pub async fn handshake<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    credentials: Option<&Credentials>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if target_host.is_empty() || target_host.len() > 255 {
        bail!("域名长度无效: {}", target_host);
    }

    // ============ 步骤 1: 版本识别 ============
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    let greeting: &[u8] = match credentials {
        Some(_) => &[VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS],
        None => &[VERSION, 1, METHOD_NO_AUTH],
    };
    stream.write_all(greeting).await.context("写入 SOCKS5 握手请求失败")?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await.context("读取 SOCKS5 握手响应失败")?;
    if response[0] != VERSION {
        bail!("无效的 SOCKS5 响应: 版本错误 ({})", response[0]);
    }
    debug!("SOCKS5 握手成功，选择的认证方法: {}", response[1]);

    // ============ 步骤 2: 可选的用户名/密码认证 (RFC 1929) ============
    match (response[1], credentials) {
        (METHOD_NO_AUTH, _) => {}
        (METHOD_USER_PASS, Some(creds)) => authenticate(stream, creds).await?,
        (METHOD_USER_PASS, None) => bail!("SOCKS5 服务器要求认证，但未配置用户名密码"),
        (METHOD_NONE_ACCEPTABLE, _) => bail!("SOCKS5 服务器不接受任何认证方法"),
        (method, _) => bail!("不支持的认证方法: {}", method),
    }

    // ============ 步骤 3: CONNECT ============
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    let mut request = Vec::with_capacity(7 + target_host.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(target_host.len() as u8);
    request.extend_from_slice(target_host.as_bytes());
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await.context("发送 SOCKS5 连接请求失败")?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.context("读取 SOCKS5 连接响应失败")?;
    if reply[0] != VERSION {
        bail!("无效的 SOCKS5 响应: 版本错误 ({})", reply[0]);
    }

    match reply[1] {
        0 => {}
        1 => bail!("SOCKS5: 一般 SOCKS 服务器故障"),
        2 => bail!("SOCKS5: 连接规则集不允许的连接"),
        3 => bail!("SOCKS5: 网络无法访问"),
        4 => bail!("SOCKS5: 主机无法访问"),
        5 => bail!("SOCKS5: 连接被拒绝"),
        6 => bail!("SOCKS5: TTL 过期"),
        7 => bail!("SOCKS5: 不支持的命令"),
        8 => bail!("SOCKS5: 不支持的地址类型"),
        code => bail!("SOCKS5: 未知错误代码 {}", code),
    }

    // ============ 步骤 4: 读掉 BND.ADDR / BND.PORT ============
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.context("读取域名长度失败")?;
            len[0] as usize
        }
        atyp => bail!("不支持的地址类型: {}", atyp),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await.context("读取地址数据失败")?;

    debug!("通过 SOCKS5 连接到 {}:{}", target_host, target_port);
    Ok(())
}

async fn authenticate<S>(stream: &mut S, creds: &Credentials) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if creds.username.len() > 255 || creds.password.len() > 255 {
        bail!("SOCKS5 用户名或密码过长");
    }

    let mut request = Vec::with_capacity(3 + creds.username.len() + creds.password.len());
    request.push(0x01);
    request.push(creds.username.len() as u8);
    request.extend_from_slice(creds.username.as_bytes());
    request.push(creds.password.len() as u8);
    request.extend_from_slice(creds.password.as_bytes());
    stream.write_all(&request).await.context("发送认证请求失败")?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await.context("读取认证响应失败")?;
    if response[1] != 0 {
        bail!("SOCKS5 认证失败");
    }
    debug!("SOCKS5 认证成功");
    Ok(())
}

/// 测试用的 SOCKS5 服务端握手，返回客户端请求的目标
#[cfg(test)]
pub(crate) async fn accept_handshake<S>(
    stream: &mut S,
    expected: Option<&Credentials>,
) -> std::io::Result<(String, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    match expected {
        Some(creds) => {
            stream.write_all(&[VERSION, METHOD_USER_PASS]).await?;
            let mut ver_ulen = [0u8; 2];
            stream.read_exact(&mut ver_ulen).await?;
            let mut user = vec![0u8; ver_ulen[1] as usize];
            stream.read_exact(&mut user).await?;
            let mut plen = [0u8; 1];
            stream.read_exact(&mut plen).await?;
            let mut pass = vec![0u8; plen[0] as usize];
            stream.read_exact(&mut pass).await?;

            let ok = user == creds.username.as_bytes() && pass == creds.password.as_bytes();
            stream.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
            if !ok {
                return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "bad credentials"));
            }
        }
        None => stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?,
    }

    let mut req = [0u8; 5];
    stream.read_exact(&mut req).await?;
    let mut host = vec![0u8; req[4] as usize];
    stream.read_exact(&mut host).await?;
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    stream
        .write_all(&[VERSION, 0x00, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0x04, 0x38])
        .await?;

    Ok((String::from_utf8_lossy(&host).into_owned(), u16::from_be_bytes(port)))
}

use anyhow::{Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use log::{debug, error, info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::resolver::{udp_exchange, MAX_UDP_PACKET};
use crate::rules::{DnsAction, DnsRules};

/// 重写的应答使用的 TTL（秒）
pub const REWRITE_TTL: u32 = 60;
/// 等待上游 DNS 的时间
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
/// TCP DNS 连接空闲多久后关闭
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// 探测本机公网 IPv6 时"连接"的地址，不会真正发出数据
const IPV6_PROBE_TARGET: &str = "[2001:4860:4860::8888]:53";

/// DNS 重写代理
///
/// 命中重定向规则的 A / AAAA 查询直接返回本代理的地址，
/// 命中丢弃规则的查询不作应答，其余查询原样转发到上游。
#[derive(Debug)]
pub struct DnsProxy {
    rules: DnsRules,
    upstream: SocketAddr,
    redirect_ipv4: Option<Ipv4Addr>,
    redirect_ipv6: Option<Ipv6Addr>,
    upstream_timeout: Duration,
    metrics: Metrics,
}

impl DnsProxy {
    pub fn new(
        rules: DnsRules,
        upstream: SocketAddr,
        redirect_ipv4: Option<Ipv4Addr>,
        redirect_ipv6: Option<Ipv6Addr>,
        metrics: Metrics,
    ) -> Self {
        Self {
            rules,
            upstream,
            redirect_ipv4,
            redirect_ipv6,
            upstream_timeout: UPSTREAM_TIMEOUT,
            metrics,
        }
    }

    /// 从配置构建；未配置 IPv6 重定向目标时探测本机公网 IPv6
    pub fn from_config(config: &Config, metrics: Metrics) -> Self {
        let redirect_ipv6 = config.dns_redirect_ipv6.or_else(|| {
            let detected = detect_public_ipv6(config.dns_listen);
            match detected {
                Some(ip) => info!("AAAA 记录重定向到自动探测的公网 IPv6: {}", ip),
                None => info!("未探测到公网 IPv6，AAAA 查询将转发到上游"),
            }
            detected
        });

        Self::new(
            config.dns_rules.clone(),
            config.dns_upstream,
            config.dns_redirect_ipv4,
            redirect_ipv6,
            metrics,
        )
    }

    pub fn with_upstream_timeout(mut self, upstream_timeout: Duration) -> Self {
        self.upstream_timeout = upstream_timeout;
        self
    }

    /// 处理一个 DNS 报文，返回 `None` 表示不作应答
    pub async fn handle_query(&self, packet: &[u8]) -> Option<Vec<u8>> {
        self.metrics.inc_dns_queries();

        let request = match Message::from_vec(packet) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("丢弃无法解析的 DNS 报文: {}", e);
                return None;
            }
        };
        if request.message_type() != MessageType::Query {
            debug!("丢弃非查询 DNS 报文 (id {})", request.id());
            return None;
        }
        let query = match request.queries().first() {
            Some(q) => q.clone(),
            None => {
                debug!("丢弃没有问题的 DNS 报文 (id {})", request.id());
                return None;
            }
        };

        let name = query.name().to_ascii();
        match self.rules.classify(&name) {
            DnsAction::Drop => {
                self.metrics.inc_dns_dropped();
                debug!("DNS 丢弃: {} {}", name, query.query_type());
                None
            }
            DnsAction::Redirect => match self.redirect_target(query.query_type()) {
                Some(rdata) => {
                    debug!("DNS 重写: {} {} -> {:?}", name, query.query_type(), rdata);
                    let response = rewritten_response(&request, &query, rdata);
                    if response.is_some() {
                        self.metrics.inc_dns_rewritten();
                    }
                    response
                }
                None => self.forward(packet, &request, &name).await,
            },
            DnsAction::Pass => self.forward(packet, &request, &name).await,
        }
    }

    fn redirect_target(&self, record_type: RecordType) -> Option<RData> {
        match record_type {
            RecordType::A => self.redirect_ipv4.map(|ip| RData::A(A(ip))),
            RecordType::AAAA => self.redirect_ipv6.map(|ip| RData::AAAA(AAAA(ip))),
            _ => None,
        }
    }

    /// 原样转发到上游；上游失败时回复 SERVFAIL
    async fn forward(&self, packet: &[u8], request: &Message, name: &str) -> Option<Vec<u8>> {
        match udp_exchange(self.upstream, packet, self.upstream_timeout).await {
            Ok(response) => {
                self.metrics.inc_dns_forwarded();
                debug!("DNS 转发: {} ({} 字节)", name, response.len());
                Some(response)
            }
            Err(e) => {
                self.metrics.inc_dns_errors();
                warn!("上游 DNS 查询 {} 失败: {:#}", name, e);
                server_failure(request)
            }
        }
    }

    /// 同时监听 UDP 和 TCP，直到收到关闭信号
    pub async fn run_with_shutdown(self: Arc<Self>, listen: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("DNS 无法绑定 UDP {}", listen))?;
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("DNS 无法绑定 TCP {}", listen))?;
        info!("DNS 代理监听: {} (UDP + TCP)，上游: {}", listen, self.upstream);

        tokio::try_join!(
            self.clone().serve_udp(Arc::new(socket), shutdown.clone()),
            self.serve_tcp(listener, shutdown),
        )?;
        Ok(())
    }

    /// UDP 接收循环：每个查询一个任务，循环本身不等待查询完成
    pub async fn serve_udp(self: Arc<Self>, socket: Arc<UdpSocket>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("DNS UDP 服务收到关闭信号");
                    return Ok(());
                }
                result = socket.recv_from(&mut buf) => {
                    let (n, peer) = match result {
                        Ok(received) => received,
                        Err(e) => {
                            // 上一次回复触发的 ICMP 不可达等，不影响后续查询
                            debug!("DNS UDP 接收失败: {}", e);
                            continue;
                        }
                    };

                    let packet = buf[..n].to_vec();
                    let proxy = self.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        if let Some(response) = proxy.handle_query(&packet).await {
                            if let Err(e) = socket.send_to(&response, peer).await {
                                debug!("DNS 回复 {} 失败: {}", peer, e);
                            }
                        }
                    });
                }
            }
        }
    }

    /// TCP 接收循环，报文带 2 字节长度前缀
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("DNS TCP 服务收到关闭信号");
                    return Ok(());
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let proxy = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = proxy.handle_tcp_client(stream).await {
                                    debug!("DNS TCP 连接 {} 结束: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("DNS TCP 接受连接失败: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }

    /// 同一连接上的查询按顺序处理
    async fn handle_tcp_client(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let mut len = [0u8; 2];
            match timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut len)).await {
                Ok(Ok(_)) => {}
                // 对端关闭或空闲超时
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(()),
            }

            let mut packet = vec![0u8; u16::from_be_bytes(len) as usize];
            timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut packet))
                .await
                .context("读取 DNS 报文超时")??;

            if let Some(response) = self.handle_query(&packet).await {
                let Ok(response_len) = u16::try_from(response.len()) else {
                    warn!("DNS 响应过长 ({} 字节)，丢弃", response.len());
                    continue;
                };
                let mut framed = Vec::with_capacity(response.len() + 2);
                framed.extend_from_slice(&response_len.to_be_bytes());
                framed.extend_from_slice(&response);
                stream.write_all(&framed).await?;
            }
        }
    }
}

/// 合成的应答：同一 ID、复制 RD、设置 RA、回显问题、只有一条答案
fn rewritten_response(request: &Message, query: &Query, rdata: RData) -> Option<Vec<u8>> {
    let mut response = response_header(request, ResponseCode::NoError);
    response.add_query(query.clone());
    response.add_answer(Record::from_rdata(query.name().clone(), REWRITE_TTL, rdata));
    encode(&response)
}

fn server_failure(request: &Message) -> Option<Vec<u8>> {
    let mut response = response_header(request, ResponseCode::ServFail);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    encode(&response)
}

fn response_header(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    response
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!("DNS 响应编码失败: {}", e);
            None
        }
    }
}

/// 探测本机的公网 IPv6
///
/// 监听地址本身是公网 IPv6 时直接使用；否则让系统为到公网 IPv6 解析器的路由选一个源地址。
/// UDP `connect` 不会发出任何数据。
pub fn detect_public_ipv6(listen: SocketAddr) -> Option<Ipv6Addr> {
    if let IpAddr::V6(ip) = listen.ip() {
        if is_global_ipv6(&ip) {
            return Some(ip);
        }
    }

    let socket = std::net::UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(IPV6_PROBE_TARGET).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V6(ip) if is_global_ipv6(&ip) => Some(ip),
        _ => None,
    }
}

/// 全局单播地址（2000::/3），排除文档地址段 2001:db8::/32
fn is_global_ipv6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    (segments[0] & 0xe000) == 0x2000 && !(segments[0] == 0x2001 && segments[1] == 0x0db8)
}

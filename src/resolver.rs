use anyhow::{anyhow, bail, Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use log::debug;
use lru::LruCache;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};

/// 缓存条目数上限
const CACHE_CAPACITY: usize = 1000;
/// 缓存时间的上下限（秒）
const MIN_CACHE_TTL: u32 = 5;
const MAX_CACHE_TTL: u32 = 3600;
/// UDP DNS 报文的最大长度
pub const MAX_UDP_PACKET: usize = 4096;

#[derive(Debug, Clone)]
struct CachedAnswer {
    addrs: Vec<IpAddr>,
    expires: Instant,
}

/// 直连目标时使用的解析器
///
/// 只向配置的上游 DNS 查询，不走系统解析器（系统解析器可能就指向本代理）。
/// 结果按 TTL 缓存在 LRU 中。
#[derive(Debug)]
pub struct Resolver {
    upstream: SocketAddr,
    timeout: Duration,
    cache: Mutex<LruCache<String, CachedAnswer>>,
}

impl Resolver {
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            upstream,
            timeout,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// 解析主机名，IPv4 在前；IP 字面量直接返回
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let key = host.trim_end_matches('.').to_ascii_lowercase();

        // 1. 检查缓存
        {
            let mut cache = self.cache.lock().await;
            match cache.get(&key) {
                Some(entry) if entry.expires > Instant::now() => {
                    debug!("DNS 缓存命中: {} -> {:?}", key, entry.addrs);
                    return Ok(entry.addrs.clone());
                }
                Some(_) => {
                    cache.pop(&key);
                }
                None => {}
            }
        }

        // 2. 同时查询 A 和 AAAA
        debug!("DNS 查询: {} (上游 {})", key, self.upstream);
        let (v4, v6) = tokio::join!(
            self.lookup(&key, RecordType::A),
            self.lookup(&key, RecordType::AAAA)
        );

        let mut addrs = Vec::new();
        let mut ttl = MAX_CACHE_TTL;
        let mut last_err = None;
        for result in [v4, v6] {
            match result {
                Ok((found, min_ttl)) => {
                    if !found.is_empty() {
                        ttl = ttl.min(min_ttl);
                    }
                    addrs.extend(found);
                }
                Err(e) => last_err = Some(e),
            }
        }

        if addrs.is_empty() {
            return Err(match last_err {
                Some(e) => e.context(format!("解析 {} 失败", key)),
                None => anyhow!("DNS 查询返回空列表: {}", key),
            });
        }

        // 3. 缓存结果
        let ttl = ttl.clamp(MIN_CACHE_TTL, MAX_CACHE_TTL);
        {
            let mut cache = self.cache.lock().await;
            cache.put(
                key.clone(),
                CachedAnswer {
                    addrs: addrs.clone(),
                    expires: Instant::now() + Duration::from_secs(ttl as u64),
                },
            );
            debug!("DNS 缓存写入: {} -> {:?} (ttl {}s)", key, addrs, ttl);
        }

        Ok(addrs)
    }

    /// 单个记录类型的查询，返回地址和最小 TTL
    async fn lookup(&self, host: &str, record_type: RecordType) -> Result<(Vec<IpAddr>, u32)> {
        let name = Name::from_ascii(host).with_context(|| format!("无效的域名 {}", host))?;

        let mut request = Message::new();
        request
            .set_id(next_query_id())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        request.add_query(Query::query(name, record_type));

        let packet = request.to_vec().context("编码 DNS 查询失败")?;
        let response = udp_exchange(self.upstream, &packet, self.timeout).await?;
        let response = Message::from_vec(&response).context("解析 DNS 响应失败")?;

        let mut addrs = Vec::new();
        let mut min_ttl = MAX_CACHE_TTL;
        for record in response.answers() {
            let addr = match record.data() {
                Some(RData::A(a)) => IpAddr::V4(a.0),
                Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
                _ => continue,
            };
            min_ttl = min_ttl.min(record.ttl());
            addrs.push(addr);
        }
        Ok((addrs, min_ttl))
    }

    /// 已缓存的条目数
    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

/// 查询 ID：时间种子 + 递增计数
fn next_query_id() -> u16 {
    static COUNTER: AtomicU16 = AtomicU16::new(0);
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u16)
        .unwrap_or_default();
    seed ^ COUNTER.fetch_add(0x9e37, Ordering::Relaxed)
}

/// 通过 UDP 向上游发送一个 DNS 报文并等待 ID 相同的响应
///
/// ID 不匹配的报文直接丢弃，继续等待，直到超时。
pub async fn udp_exchange(upstream: SocketAddr, packet: &[u8], deadline: Duration) -> Result<Vec<u8>> {
    if packet.len() < 2 {
        bail!("DNS 报文过短");
    }
    let id = [packet[0], packet[1]];

    let bind_addr: SocketAddr = match upstream {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind_addr).await.context("绑定 UDP 端口失败")?;
    socket
        .connect(upstream)
        .await
        .with_context(|| format!("无法连接上游 DNS {}", upstream))?;
    socket.send(packet).await.context("发送 DNS 查询失败")?;

    let exchange = async {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            let n = socket.recv(&mut buf).await.context("接收 DNS 响应失败")?;
            if n >= 2 && buf[..2] == id {
                buf.truncate(n);
                return Ok::<_, anyhow::Error>(buf);
            }
            debug!("丢弃 ID 不匹配的 DNS 响应 ({} 字节)", n);
        }
    };

    timeout(deadline, exchange)
        .await
        .map_err(|_| anyhow!("上游 DNS {} 响应超时", upstream))?
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Record;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// 测试用的上游 DNS：对 A 查询回答 `v4`，对 AAAA 回答 `v6`，统计收到的查询数
    pub(crate) async fn spawn_fake_upstream(
        v4: Option<Ipv4Addr>,
        v6: Option<Ipv6Addr>,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = queries.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_PACKET];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let Ok(request) = Message::from_vec(&buf[..n]) else {
                    continue;
                };

                let mut response = Message::new();
                response
                    .set_id(request.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query)
                    .set_recursion_desired(request.recursion_desired())
                    .set_recursion_available(true)
                    .set_response_code(ResponseCode::NoError);
                for query in request.queries() {
                    response.add_query(query.clone());
                    let rdata = match (query.query_type(), v4, v6) {
                        (RecordType::A, Some(ip), _) => RData::A(A(ip)),
                        (RecordType::AAAA, _, Some(ip)) => RData::AAAA(AAAA(ip)),
                        _ => continue,
                    };
                    response.add_answer(Record::from_rdata(query.name().clone(), 120, rdata));
                }
                let _ = socket.send_to(&response.to_vec().unwrap(), peer).await;
            }
        });

        (addr, queries)
    }

    #[tokio::test]
    async fn test_ip_literal_passthrough() {
        let resolver = Resolver::new("127.0.0.1:9".parse().unwrap(), Duration::from_secs(1));
        assert_eq!(resolver.resolve("10.1.2.3").await.unwrap(), vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
        assert_eq!(resolver.resolve("[::1]").await.unwrap(), vec!["::1".parse::<IpAddr>().unwrap()]);
        assert_eq!(resolver.cache_len().await, 0);
    }

    #[tokio::test]
    async fn test_resolve_and_cache() {
        let v4 = Ipv4Addr::new(192, 0, 2, 7);
        let v6: Ipv6Addr = "2001:db8::7".parse().unwrap();
        let (upstream, queries) = spawn_fake_upstream(Some(v4), Some(v6)).await;
        let resolver = Resolver::new(upstream, Duration::from_secs(2));

        let addrs = resolver.resolve("www.Example.test").await.unwrap();
        assert_eq!(addrs, vec![IpAddr::V4(v4), IpAddr::V6(v6)]);
        assert_eq!(queries.load(Ordering::SeqCst), 2);

        // 第二次命中缓存，不再查询上游
        let again = resolver.resolve("www.example.test.").await.unwrap();
        assert_eq!(again, addrs);
        assert_eq!(queries.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.cache_len().await, 1);
    }

    #[tokio::test]
    async fn test_resolve_empty_answer() {
        let (upstream, _) = spawn_fake_upstream(None, None).await;
        let resolver = Resolver::new(upstream, Duration::from_secs(2));
        assert!(resolver.resolve("nothing.test").await.is_err());
    }

    #[tokio::test]
    async fn test_udp_exchange_timeout() {
        // 一个只收不回的上游
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let err = udp_exchange(addr, &[0x12, 0x34, 0, 0], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("超时"), "{}", err);
        drop(silent);
    }
}

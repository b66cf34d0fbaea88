use anyhow::{anyhow, Context, Result};
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::config::Config;
use crate::metrics::{ConnectionGuard, Metrics};
use crate::proxy::{relay, TransferStats};
use crate::ratelimit::BandwidthLimiter;
use crate::resolver::Resolver;
use crate::rules::ConnectionAction;
use crate::sniff::{sniff, ListenerKind, MAX_SNIFF_BUFFER};
use crate::upstream::BoxedStream;

/// 监听队列长度
const LISTEN_BACKLOG: i32 = 4096;
/// 关闭时等待活跃连接的最长秒数
const SHUTDOWN_GRACE_SECS: u64 = 30;

/// 嗅探转发服务器
///
/// 每个监听地址一个实例，HTTP 和 TLS 只在嗅探方式和默认目标端口上不同。
pub struct RelayServer {
    kind: ListenerKind,
    listen_addr: SocketAddr,
    config: Arc<Config>,
    limiter: Arc<BandwidthLimiter>,
    resolver: Arc<Resolver>,
    metrics: Metrics,
    /// 最大并发连接数
    max_connections: usize,
    /// 连接目标使用的端口，默认取决于监听器类型
    target_port: u16,
}

impl RelayServer {
    pub fn new(
        kind: ListenerKind,
        listen_addr: SocketAddr,
        config: Arc<Config>,
        limiter: Arc<BandwidthLimiter>,
        resolver: Arc<Resolver>,
        metrics: Metrics,
    ) -> Self {
        // 🚀 自适应最大连接数：根据 CPU 核心数动态调整
        let num_cpus = num_cpus::get();
        let max_connections = std::cmp::min(10000, num_cpus * 500);

        Self {
            kind,
            listen_addr,
            config,
            limiter,
            resolver,
            metrics,
            max_connections,
            target_port: kind.default_port(),
        }
    }

    /// 设置最大并发连接数
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// 覆盖目标端口
    pub fn with_target_port(mut self, port: u16) -> Self {
        self.target_port = port;
        self
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// 绑定监听地址并开始服务，直到收到关闭信号
    pub async fn run_with_shutdown(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = bind_listener(self.listen_addr)
            .with_context(|| format!("{} 监听 {} 失败", self.kind.name(), self.listen_addr))?;
        info!("{} 转发启动在 {}", self.kind.name(), self.listen_addr);
        self.serve(listener, shutdown).await
    }

    /// 在已绑定的监听器上接受连接
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "{} 最大并发连接数: {} | 目标端口: {}",
            self.kind.name(),
            self.max_connections,
            self.target_port
        );

        // 使用信号量限制并发连接数
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("🛑 {} 停止接受新连接", self.kind.name());
                        break;
                    }
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((client_stream, client_addr)) => {
                            self.spawn_connection(client_stream, client_addr, &semaphore);
                        }
                        Err(e) => {
                            error!("接受连接失败: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        self.wait_for_active().await;
        Ok(())
    }

    /// 等待活跃连接完成（最多 30 秒）
    async fn wait_for_active(&self) {
        let wait_start = Instant::now();
        for _ in 0..SHUTDOWN_GRACE_SECS {
            let active = self.metrics.get_active_connections();
            if active == 0 {
                break;
            }
            info!("⏳ 等待 {} 个活跃连接关闭...", active);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let final_active = self.metrics.get_active_connections();
        if final_active > 0 {
            warn!("⚠️  超时：仍有 {} 个连接未关闭", final_active);
        }
        debug!("{} 关闭耗时: {:?}", self.kind.name(), wait_start.elapsed());
    }

    /// 每个连接一个任务；许可在任务内获取，接受循环不会因并发上限而停顿
    fn spawn_connection(self: &Arc<Self>, client_stream: TcpStream, client_addr: SocketAddr, semaphore: &Arc<Semaphore>) {
        let server = Arc::clone(self);
        let semaphore = Arc::clone(semaphore);
        tokio::spawn(async move {
            let permit_start = Instant::now();
            let permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(e) => {
                    error!("获取连接许可失败: {}", e);
                    return;
                }
            };
            let permit_elapsed = permit_start.elapsed();
            if permit_elapsed.as_millis() > 10 {
                debug!("⏱️  等待许可: {}ms", permit_elapsed.as_millis());
            }

            // 捕获 panic 以防止任务崩溃
            let result = std::panic::AssertUnwindSafe(server.handle_connection(client_stream, client_addr, permit))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("连接 {} 结束: {:#}", client_addr, e),
                Err(_) => error!("处理 {} 的连接时发生 panic", client_addr),
            }
        });
    }

    /// 处理单个客户端连接，`permit` 持有到转发结束
    async fn handle_connection(&self, mut client: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) -> Result<()> {
        let _guard = ConnectionGuard::new(self.metrics.clone());
        let _ = client.set_nodelay(true);

        // 1. 嗅探主机名
        let sniffed = match sniff(&mut client, self.kind, MAX_SNIFF_BUFFER, self.config.sniff_timeout).await {
            Ok(s) => s,
            Err(e) => {
                self.metrics.inc_sniff_errors();
                warn!("{} 嗅探失败 (来自 {}): {}", self.kind.name(), peer, e);
                return Ok(());
            }
        };
        let hostname = sniffed.hostname;

        // 2. 规则判定
        let rules = &self.config.connection_rules;
        let classification = rules.classify(&hostname);
        let action = rules.decide(&classification, self.config.forward_proxy.is_some());
        self.metrics.record_action(action);
        info!(
            "{} {} -> {}:{} [{}]",
            self.kind.name(),
            peer,
            hostname,
            self.target_port,
            action.as_str()
        );

        // 3. 建立到目标的连接
        let upstream: BoxedStream = match action {
            ConnectionAction::Drop => {
                // 挂住连接，不回应也不转发；挂起期间不占用并发名额
                drop(permit);
                tokio::time::sleep(self.config.drop_delay).await;
                return Ok(());
            }
            ConnectionAction::Block => return Ok(()),
            ConnectionAction::ForwardViaProxy => {
                let proxy = self
                    .config
                    .forward_proxy
                    .as_ref()
                    .ok_or_else(|| anyhow!("未配置上游代理"))?;
                match proxy.connect(&hostname, self.target_port, self.config.dial_timeout).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        self.metrics.inc_failed_connections();
                        error!("经上游代理连接 {}:{} 失败: {:#}", hostname, self.target_port, e);
                        return Ok(());
                    }
                }
            }
            ConnectionAction::Direct => match self.dial_direct(&hostname).await {
                Ok(stream) => Box::new(stream),
                Err(e) => {
                    self.metrics.inc_failed_connections();
                    error!("连接 {}:{} 失败: {:#}", hostname, self.target_port, e);
                    return Ok(());
                }
            },
        };

        // 4. 限速并双向转发
        let bucket = self.limiter.resolve(&classification);
        if let Some(bucket) = &bucket {
            debug!("{} 限速 {} B/s", hostname, bucket.rate());
        }

        let stats = TransferStats::default();
        let result = relay(
            client,
            upstream,
            &sniffed.prefix,
            bucket,
            self.config.idle_timeout,
            &stats,
        )
        .await;

        self.metrics.add_bytes_upstream(stats.upstream());
        self.metrics.add_bytes_downstream(stats.downstream());
        debug!(
            "{} 转发结束 | 上行 {} 字节 | 下行 {} 字节",
            hostname,
            stats.upstream(),
            stats.downstream()
        );

        result
    }

    /// 经上游 DNS 解析后直连，依次尝试每个地址
    async fn dial_direct(&self, hostname: &str) -> Result<TcpStream> {
        let addrs = self.resolver.resolve(hostname).await?;
        let mut last_err = anyhow!("{} 没有可用地址", hostname);

        for ip in addrs {
            let target = SocketAddr::new(ip, self.target_port);
            if is_self_address(target, self.listen_addr) {
                last_err = anyhow!("{} 解析到本机监听地址 {}", hostname, target);
                continue;
            }
            match timeout(self.config.dial_timeout, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    debug!("已连接到 {} ({})", hostname, target);
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = anyhow!(e).context(format!("连接 {} 失败", target)),
                Err(_) => last_err = anyhow!("连接 {} 超时", target),
            }
        }

        Err(last_err)
    }
}

/// 目标就是本监听器自身时拒绝连接，避免转发回环
fn is_self_address(target: SocketAddr, listen: SocketAddr) -> bool {
    if target.port() != listen.port() {
        return false;
    }
    let ip = target.ip();
    ip == listen.ip() || (listen.ip().is_unspecified() && (ip.is_loopback() || ip.is_unspecified()))
}

/// 手动创建监听 socket 以设置更大的 backlog 和端口重用
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    // SO_REUSEPORT - 允许端口重用（Linux/macOS）
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        use std::os::unix::io::AsRawFd;
        unsafe {
            let fd = socket.as_raw_fd();
            let reuse_port: libc::c_int = 1;
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &reuse_port as *const _ as *const libc::c_void,
                std::mem::size_of_val(&reuse_port) as libc::socklen_t,
            );
        }
    }

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::rules::ConnectionAction;

/// 运行时计数器
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // 连接统计
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    failed_connections: AtomicU64,

    // 处理方式
    direct_connections: AtomicU64,
    proxied_connections: AtomicU64,
    blocked_connections: AtomicU64,
    dropped_connections: AtomicU64,
    sniff_errors: AtomicU64,

    // 流量统计
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,

    // DNS 统计
    dns_queries: AtomicU64,
    dns_rewritten: AtomicU64,
    dns_forwarded: AtomicU64,
    dns_dropped: AtomicU64,
    dns_errors: AtomicU64,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                failed_connections: AtomicU64::new(0),
                direct_connections: AtomicU64::new(0),
                proxied_connections: AtomicU64::new(0),
                blocked_connections: AtomicU64::new(0),
                dropped_connections: AtomicU64::new(0),
                sniff_errors: AtomicU64::new(0),
                bytes_upstream: AtomicU64::new(0),
                bytes_downstream: AtomicU64::new(0),
                dns_queries: AtomicU64::new(0),
                dns_rewritten: AtomicU64::new(0),
                dns_forwarded: AtomicU64::new(0),
                dns_dropped: AtomicU64::new(0),
                dns_errors: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // 连接统计
    pub fn inc_total_connections(&self) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_active_connections(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_connections(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_failed_connections(&self) {
        self.inner.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// 按处理方式计数
    pub fn record_action(&self, action: ConnectionAction) {
        let counter = match action {
            ConnectionAction::Direct => &self.inner.direct_connections,
            ConnectionAction::ForwardViaProxy => &self.inner.proxied_connections,
            ConnectionAction::Block => &self.inner.blocked_connections,
            ConnectionAction::Drop => &self.inner.dropped_connections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sniff_errors(&self) {
        self.inner.sniff_errors.fetch_add(1, Ordering::Relaxed);
    }

    // 流量统计
    pub fn add_bytes_upstream(&self, bytes: u64) {
        self.inner.bytes_upstream.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_downstream(&self, bytes: u64) {
        self.inner.bytes_downstream.fetch_add(bytes, Ordering::Relaxed);
    }

    // DNS 统计
    pub fn inc_dns_queries(&self) {
        self.inner.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_rewritten(&self) {
        self.inner.dns_rewritten.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_forwarded(&self) {
        self.inner.dns_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_dropped(&self) {
        self.inner.dns_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_errors(&self) {
        self.inner.dns_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_connections(&self) -> u64 {
        self.inner.total_connections.load(Ordering::Relaxed)
    }

    pub fn get_active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            total_connections: inner.total_connections.load(Ordering::Relaxed),
            active_connections: inner.active_connections.load(Ordering::Relaxed),
            failed_connections: inner.failed_connections.load(Ordering::Relaxed),
            direct_connections: inner.direct_connections.load(Ordering::Relaxed),
            proxied_connections: inner.proxied_connections.load(Ordering::Relaxed),
            blocked_connections: inner.blocked_connections.load(Ordering::Relaxed),
            dropped_connections: inner.dropped_connections.load(Ordering::Relaxed),
            sniff_errors: inner.sniff_errors.load(Ordering::Relaxed),
            bytes_upstream: inner.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: inner.bytes_downstream.load(Ordering::Relaxed),
            dns_queries: inner.dns_queries.load(Ordering::Relaxed),
            dns_rewritten: inner.dns_rewritten.load(Ordering::Relaxed),
            dns_forwarded: inner.dns_forwarded.load(Ordering::Relaxed),
            dns_dropped: inner.dns_dropped.load(Ordering::Relaxed),
            dns_errors: inner.dns_errors.load(Ordering::Relaxed),
            uptime: inner.start_time.elapsed(),
        }
    }

    /// 打印统计摘要
    pub fn print_summary(&self) {
        let s = self.snapshot();
        log::info!("=== 运行统计 ===");
        log::info!("运行时间: {:?}", s.uptime);
        log::info!(
            "连接: 总数 {} | 活跃 {} | 失败 {} | 嗅探失败 {}",
            s.total_connections,
            s.active_connections,
            s.failed_connections,
            s.sniff_errors
        );
        log::info!(
            "处理: 直连 {} | 代理 {} | 拦截 {} | 丢弃 {}",
            s.direct_connections,
            s.proxied_connections,
            s.blocked_connections,
            s.dropped_connections
        );
        log::info!(
            "流量: 上行 {} KB | 下行 {} KB",
            s.bytes_upstream / 1024,
            s.bytes_downstream / 1024
        );
        log::info!(
            "DNS: 查询 {} | 重写 {} | 转发 {} | 丢弃 {} | 上游错误 {}",
            s.dns_queries,
            s.dns_rewritten,
            s.dns_forwarded,
            s.dns_dropped,
            s.dns_errors
        );
    }
}

/// 计数器快照
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
    pub direct_connections: u64,
    pub proxied_connections: u64,
    pub blocked_connections: u64,
    pub dropped_connections: u64,
    pub sniff_errors: u64,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
    pub dns_queries: u64,
    pub dns_rewritten: u64,
    pub dns_forwarded: u64,
    pub dns_dropped: u64,
    pub dns_errors: u64,
    pub uptime: Duration,
}

/// RAII 风格的连接计数器
pub struct ConnectionGuard {
    metrics: Metrics,
}

impl ConnectionGuard {
    pub fn new(metrics: Metrics) -> Self {
        metrics.inc_total_connections();
        metrics.inc_active_connections();
        log::debug!(
            "新连接建立 | 总连接数: {} | 活跃连接: {}",
            metrics.get_total_connections(),
            metrics.get_active_connections()
        );
        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.dec_active_connections();
        log::debug!("连接关闭 | 活跃连接: {}", self.metrics.get_active_connections());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_guard() {
        let metrics = Metrics::new();
        {
            let _a = ConnectionGuard::new(metrics.clone());
            let _b = ConnectionGuard::new(metrics.clone());
            assert_eq!(metrics.get_active_connections(), 2);
        }
        assert_eq!(metrics.get_active_connections(), 0);
        assert_eq!(metrics.get_total_connections(), 2);
    }

    #[test]
    fn test_record_action() {
        let metrics = Metrics::new();
        metrics.record_action(ConnectionAction::Direct);
        metrics.record_action(ConnectionAction::Direct);
        metrics.record_action(ConnectionAction::ForwardViaProxy);
        metrics.record_action(ConnectionAction::Block);
        metrics.record_action(ConnectionAction::Drop);
        metrics.add_bytes_upstream(10);
        metrics.add_bytes_downstream(20);

        let s = metrics.snapshot();
        assert_eq!(s.direct_connections, 2);
        assert_eq!(s.proxied_connections, 1);
        assert_eq!(s.blocked_connections, 1);
        assert_eq!(s.dropped_connections, 1);
        assert_eq!((s.bytes_upstream, s.bytes_downstream), (10, 20));

        // 克隆共享同一组计数器
        let clone = metrics.clone();
        clone.inc_dns_queries();
        assert_eq!(metrics.snapshot().dns_queries, 1);
    }
}

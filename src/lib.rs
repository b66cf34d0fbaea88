//! DNS 重写代理 + SNI/Host 嗅探转发
//!
//! DNS 代理把匹配规则的域名解析到本机，随后到达 HTTP / TLS 监听器的连接
//! 按嗅探出的主机名决定丢弃、拦截、经上游代理转发或直连，并按规则限速。

pub mod config;
pub mod dns;
pub mod domain;
pub mod http;
pub mod logger;
pub mod metrics;
pub mod options;
pub mod proxy;
pub mod ratelimit;
pub mod resolver;
pub mod rules;
pub mod server;
pub mod sniff;
pub mod socks5;
pub mod tls;
pub mod upstream;

use anyhow::Result;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub use config::{Config, ConfigError};
pub use dns::DnsProxy;
pub use domain::{find_match, Rule, RuleSet, WildcardPattern};
pub use metrics::Metrics;
pub use options::Options;
pub use ratelimit::{BandwidthLimiter, Bucket};
pub use rules::{ConnectionAction, ConnectionRules, DnsAction, DnsRules, DomainClassification};
pub use server::RelayServer;
pub use sniff::ListenerKind;
pub use upstream::ForwardProxy;

/// 运行统计的打印间隔
const METRICS_INTERVAL: Duration = Duration::from_secs(60);
/// 直连解析的超时
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// 代理引擎：DNS 代理和两个转发监听器共享同一份配置、限速器和计数器
pub struct Engine {
    config: Arc<Config>,
    metrics: Metrics,
    limiter: Arc<BandwidthLimiter>,
    resolver: Arc<resolver::Resolver>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let limiter = Arc::new(BandwidthLimiter::new(config.bandwidth_rate));
        let resolver = Arc::new(resolver::Resolver::new(config.dns_upstream, RESOLVE_TIMEOUT));
        Self {
            config: Arc::new(config),
            metrics: Metrics::new(),
            limiter,
            resolver,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 获取监控指标
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn relay_server(&self, kind: ListenerKind) -> RelayServer {
        let listen_addr = match kind {
            ListenerKind::Http => self.config.http_listen,
            ListenerKind::Tls => self.config.tls_listen,
        };
        RelayServer::new(
            kind,
            listen_addr,
            self.config.clone(),
            self.limiter.clone(),
            self.resolver.clone(),
            self.metrics.clone(),
        )
    }

    /// 启动全部监听器，直到收到关闭信号；任一监听器绑定失败则整体返回错误
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let dns = Arc::new(DnsProxy::from_config(&self.config, self.metrics.clone()));
        let http = Arc::new(self.relay_server(ListenerKind::Http));
        let tls = Arc::new(self.relay_server(ListenerKind::Tls));

        // 后台任务：每分钟打印监控指标
        let metrics = self.metrics.clone();
        let mut ticker_shutdown = shutdown.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => metrics.print_summary(),
                    _ = ticker_shutdown.changed() => break,
                }
            }
        });

        let result = tokio::try_join!(
            dns.run_with_shutdown(self.config.dns_listen, shutdown.clone()),
            http.run_with_shutdown(shutdown.clone()),
            tls.run_with_shutdown(shutdown),
        );
        ticker.abort();

        info!("📊 最终统计:");
        self.metrics.print_summary();
        result.map(|_| ())
    }
}

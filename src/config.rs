use log::{info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

use crate::domain::{Rule, RuleSet, WildcardPattern};
use crate::options::Options;
use crate::rules::{ConnectionRules, DnsRules};
use crate::upstream::ForwardProxy;

/// 上游 DNS 的默认端口
const DEFAULT_DNS_PORT: u16 = 53;

/// 配置错误，启动时一次性报告，进程直接退出
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("无效的通配符 {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },

    #[error("无效的 {field}: {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("无效的上游 DNS {0:?}（仅支持 ip、ip:port、udp://ip:port）")]
    InvalidUpstream(String),

    #[error("无效的带宽规则 {0:?}（格式: 通配符:字节每秒）")]
    InvalidBandwidthRule(String),

    #[error("无效的带宽速率 {0}")]
    InvalidBandwidthRate(f64),

    #[error("无效的上游代理 {value:?}: {reason}")]
    InvalidForwardProxy { value: String, reason: String },

    #[error("HTTP 和 TLS 监听在同一地址 {0}")]
    ConflictingListeners(SocketAddr),
}

/// 引擎配置，启动时构建一次，之后只读
#[derive(Debug, Clone)]
pub struct Config {
    /// DNS 代理监听地址（UDP + TCP）
    pub dns_listen: SocketAddr,
    /// 上游 DNS
    pub dns_upstream: SocketAddr,
    /// A 记录重定向目标
    pub dns_redirect_ipv4: Option<Ipv4Addr>,
    /// AAAA 记录重定向目标（未设置时自动探测）
    pub dns_redirect_ipv6: Option<Ipv6Addr>,
    /// DNS 重定向 / 丢弃规则
    pub dns_rules: DnsRules,
    /// 明文 HTTP 监听地址
    pub http_listen: SocketAddr,
    /// TLS 监听地址
    pub tls_listen: SocketAddr,
    /// 全局限速（字节/秒），0 表示不限速
    pub bandwidth_rate: f64,
    /// 上游代理（可选）
    pub forward_proxy: Option<ForwardProxy>,
    /// 连接规则：丢弃、拦截、转发、带宽
    pub connection_rules: ConnectionRules,
    /// 丢弃连接的挂起时长
    pub drop_delay: Duration,
    /// 嗅探超时
    pub sniff_timeout: Duration,
    /// 连接超时
    pub dial_timeout: Duration,
    /// 空闲超时
    pub idle_timeout: Duration,
}

impl Config {
    /// 校验并构建配置
    pub fn from_options(opts: &Options) -> Result<Self, ConfigError> {
        let dns_listen = listen_addr("dns-address", &opts.dns_address, opts.dns_port)?;
        let http_listen = listen_addr("http-address", &opts.http_address, opts.http_port)?;
        let tls_listen = listen_addr("tls-address", &opts.tls_address, opts.tls_port)?;

        // 端口 0 由系统分配，不会冲突
        if http_listen == tls_listen && http_listen.port() != 0 {
            return Err(ConfigError::ConflictingListeners(http_listen));
        }

        let dns_redirect_ipv4 = opts
            .dns_redirect_ipv4_to
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim().parse::<Ipv4Addr>().map_err(|_| ConfigError::InvalidAddress {
                    field: "dns-redirect-ipv4-to",
                    value: s.to_string(),
                })
            })
            .transpose()?;

        let dns_redirect_ipv6 = opts
            .dns_redirect_ipv6_to
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim().parse::<Ipv6Addr>().map_err(|_| ConfigError::InvalidAddress {
                    field: "dns-redirect-ipv6-to",
                    value: s.to_string(),
                })
            })
            .transpose()?;

        if !opts.bandwidth_rate.is_finite() || opts.bandwidth_rate < 0.0 {
            return Err(ConfigError::InvalidBandwidthRate(opts.bandwidth_rate));
        }

        let bandwidth = opts
            .bandwidth_rules
            .iter()
            .map(|r| parse_bandwidth_rule(r))
            .collect::<Result<RuleSet<f64>, _>>()?;

        let forward_proxy = opts
            .forward_proxy
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(ForwardProxy::parse)
            .transpose()?;

        Ok(Self {
            dns_listen,
            dns_upstream: parse_upstream(&opts.dns_upstream)?,
            dns_redirect_ipv4,
            dns_redirect_ipv6,
            dns_rules: DnsRules {
                redirect: RuleSet::parse_list(&opts.dns_redirect_rules)?,
                drop: RuleSet::parse_list(&opts.dns_drop_rules)?,
            },
            http_listen,
            tls_listen,
            bandwidth_rate: opts.bandwidth_rate,
            forward_proxy,
            connection_rules: ConnectionRules {
                drop: RuleSet::parse_list(&opts.drop_rules)?,
                block: RuleSet::parse_list(&opts.block_rules)?,
                forward: RuleSet::parse_list(&opts.forward_rules)?,
                bandwidth,
            },
            drop_delay: Duration::from_secs(opts.drop_delay),
            sniff_timeout: Duration::from_secs(opts.sniff_timeout),
            dial_timeout: Duration::from_secs(opts.dial_timeout),
            idle_timeout: Duration::from_secs(opts.idle_timeout),
        })
    }

    /// 启动时打印配置摘要
    pub fn log_summary(&self) {
        info!("DNS 监听: {} (上游: {})", self.dns_listen, self.dns_upstream);
        match self.dns_redirect_ipv4 {
            Some(ip) => info!("A 记录重定向到: {}", ip),
            None => warn!("未配置 dns-redirect-ipv4-to，A 查询将全部转发到上游"),
        }
        if let Some(ip) = self.dns_redirect_ipv6 {
            info!("AAAA 记录重定向到: {}", ip);
        }
        info!("HTTP 监听: {}", self.http_listen);
        info!("TLS 监听: {}", self.tls_listen);

        if self.bandwidth_rate > 0.0 {
            info!("全局限速: {} 字节/秒", self.bandwidth_rate);
        }
        match &self.forward_proxy {
            Some(proxy) => info!("上游代理: {}", proxy),
            None => info!("直接连接到目标服务器（未配置上游代理）"),
        }

        log_rules("DNS 重定向规则", self.dns_rules.redirect.iter().map(|r| r.pattern.to_string()));
        log_rules("DNS 丢弃规则", self.dns_rules.drop.iter().map(|r| r.pattern.to_string()));
        log_rules("丢弃规则", self.connection_rules.drop.iter().map(|r| r.pattern.to_string()));
        log_rules("拦截规则", self.connection_rules.block.iter().map(|r| r.pattern.to_string()));
        log_rules("转发规则", self.connection_rules.forward.iter().map(|r| r.pattern.to_string()));
        log_rules(
            "带宽规则",
            self.connection_rules
                .bandwidth
                .iter()
                .map(|r| format!("{} -> {} 字节/秒", r.pattern, r.value)),
        );
    }
}

/// 只显示前 10 条，避免日志过长
fn log_rules<I: ExactSizeIterator<Item = String>>(title: &str, rules: I) {
    let total = rules.len();
    if total == 0 {
        return;
    }
    info!("{}: {} 条", title, total);
    for (i, rule) in rules.take(10).enumerate() {
        info!("  [{}] {}", i + 1, rule);
    }
    if total > 10 {
        info!("  ... 还有 {} 条", total - 10);
    }
}

fn listen_addr(field: &'static str, address: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let ip: IpAddr = address
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| ConfigError::InvalidAddress {
            field,
            value: address.to_string(),
        })?;
    Ok(SocketAddr::new(ip, port))
}

/// 解析上游 DNS: `8.8.8.8`、`8.8.8.8:53`、`[2001:4860:4860::8888]:53`、`udp://1.1.1.1`
pub fn parse_upstream(raw: &str) -> Result<SocketAddr, ConfigError> {
    let trimmed = raw.trim();
    let value = match trimmed.split_once("://") {
        Some(("udp", rest)) => rest,
        Some(_) => return Err(ConfigError::InvalidUpstream(raw.to_string())),
        None => trimmed,
    };

    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
        .map_err(|_| ConfigError::InvalidUpstream(raw.to_string()))
}

/// 解析带宽规则 `pattern:rate`
pub fn parse_bandwidth_rule(raw: &str) -> Result<Rule<f64>, ConfigError> {
    let (pattern, rate) = raw
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidBandwidthRule(raw.to_string()))?;

    let rate: f64 = rate
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidBandwidthRule(raw.to_string()))?;
    if !rate.is_finite() || rate < 0.0 {
        return Err(ConfigError::InvalidBandwidthRate(rate));
    }

    Ok(Rule {
        pattern: WildcardPattern::parse(pattern)?,
        value: rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::from_options(&Options::default()).unwrap();

        assert_eq!(config.dns_listen, "0.0.0.0:53".parse().unwrap());
        assert_eq!(config.dns_upstream, "8.8.8.8:53".parse().unwrap());
        assert_eq!(config.http_listen, "0.0.0.0:80".parse().unwrap());
        assert_eq!(config.tls_listen, "0.0.0.0:443".parse().unwrap());
        assert!(config.dns_rules.redirect.matches("anything.example"));
        assert!(config.dns_rules.drop.is_empty());
        assert!(config.forward_proxy.is_none());
        assert_eq!(config.drop_delay, Duration::from_secs(180));
    }

    #[test]
    fn test_full_options() {
        let opts = Options {
            dns_address: "::1".into(),
            dns_port: 5353,
            dns_upstream: "udp://1.1.1.1:5300".into(),
            dns_redirect_ipv4_to: Some("10.0.0.1".into()),
            dns_redirect_ipv6_to: Some("2001:db8::1".into()),
            bandwidth_rules: vec!["example.*:1024".into(), "*.video.test:0".into()],
            forward_proxy: Some("socks5://127.0.0.1:1080".into()),
            forward_rules: vec!["*.proxied.test".into()],
            ..Options::default()
        };
        let config = Config::from_options(&opts).unwrap();

        assert_eq!(config.dns_listen, "[::1]:5353".parse().unwrap());
        assert_eq!(config.dns_upstream, "1.1.1.1:5300".parse().unwrap());
        assert_eq!(config.dns_redirect_ipv4, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(config.dns_redirect_ipv6, Some("2001:db8::1".parse().unwrap()));
        assert_eq!(config.connection_rules.bandwidth.len(), 2);
        assert_eq!(
            config.connection_rules.bandwidth.find("example.org").map(|r| r.value),
            Some(1024.0)
        );
        assert!(config.forward_proxy.is_some());

        // 启动摘要遍历全部规则集
        config.log_summary();
    }

    #[test]
    fn test_parse_upstream() {
        assert_eq!(parse_upstream("8.8.8.8").unwrap(), "8.8.8.8:53".parse().unwrap());
        assert_eq!(parse_upstream("8.8.4.4:5353").unwrap(), "8.8.4.4:5353".parse().unwrap());
        assert_eq!(
            parse_upstream("2001:4860:4860::8888").unwrap(),
            "[2001:4860:4860::8888]:53".parse().unwrap()
        );
        assert_eq!(
            parse_upstream("[2001:4860:4860::8888]:5353").unwrap(),
            "[2001:4860:4860::8888]:5353".parse().unwrap()
        );
        assert_eq!(parse_upstream("udp://9.9.9.9").unwrap(), "9.9.9.9:53".parse().unwrap());
        assert!(parse_upstream("tls://1.1.1.1").is_err());
        assert!(parse_upstream("dns.google").is_err());
    }

    #[test]
    fn test_parse_bandwidth_rule() {
        let rule = parse_bandwidth_rule("example.*:1024").unwrap();
        assert_eq!(rule.pattern.as_str(), "example.*");
        assert_eq!(rule.value, 1024.0);

        assert!(parse_bandwidth_rule("example.com").is_err());
        assert!(parse_bandwidth_rule("example.com:fast").is_err());
        assert!(matches!(
            parse_bandwidth_rule("example.com:-5"),
            Err(ConfigError::InvalidBandwidthRate(_))
        ));
        assert!(parse_bandwidth_rule(":100").is_err());
    }

    #[test]
    fn test_invalid_config() {
        let bad_pattern = Options {
            block_rules: vec!["bad..pattern".into()],
            ..Options::default()
        };
        assert!(matches!(
            Config::from_options(&bad_pattern),
            Err(ConfigError::InvalidPattern { .. })
        ));

        let bad_address = Options {
            tls_address: "not-an-ip".into(),
            ..Options::default()
        };
        assert!(matches!(
            Config::from_options(&bad_address),
            Err(ConfigError::InvalidAddress { field: "tls-address", .. })
        ));

        let conflict = Options {
            http_port: 8080,
            tls_port: 8080,
            ..Options::default()
        };
        assert!(matches!(
            Config::from_options(&conflict),
            Err(ConfigError::ConflictingListeners(_))
        ));

        let bad_rate = Options {
            bandwidth_rate: -1.0,
            ..Options::default()
        };
        assert!(Config::from_options(&bad_rate).is_err());

        let bad_proxy = Options {
            forward_proxy: Some("ftp://proxy:21".into()),
            ..Options::default()
        };
        assert!(matches!(
            Config::from_options(&bad_proxy),
            Err(ConfigError::InvalidForwardProxy { .. })
        ));

        let bad_redirect = Options {
            dns_redirect_ipv4_to: Some("2001:db8::1".into()),
            ..Options::default()
        };
        assert!(Config::from_options(&bad_redirect).is_err());
    }
}

use crate::domain::RuleSet;

/// TCP 连接相关的规则集
#[derive(Debug, Clone, Default)]
pub struct ConnectionRules {
    /// 丢弃：挂起一段时间后关闭
    pub drop: RuleSet<()>,
    /// 拦截：立即关闭
    pub block: RuleSet<()>,
    /// 经上游代理转发（为空表示全部转发）
    pub forward: RuleSet<()>,
    /// 按域名限速（字节/秒）
    pub bandwidth: RuleSet<f64>,
}

/// DNS 相关的规则集
#[derive(Debug, Clone, Default)]
pub struct DnsRules {
    /// 重写为代理地址
    pub redirect: RuleSet<()>,
    /// 不作应答
    pub drop: RuleSet<()>,
}

/// 单个域名的分类结果，每个连接现算，不缓存
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainClassification {
    /// 命中的丢弃规则
    pub drop: Option<String>,
    /// 命中的拦截规则
    pub block: Option<String>,
    /// 命中的转发规则
    pub forward: Option<String>,
    /// 命中的带宽规则（模式, 字节/秒）
    pub bandwidth: Option<(String, f64)>,
}

/// 连接的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    /// 挂起后关闭
    Drop,
    /// 立即关闭
    Block,
    /// 经上游代理连接目标
    ForwardViaProxy,
    /// 直接连接目标
    Direct,
}

impl ConnectionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionAction::Drop => "drop",
            ConnectionAction::Block => "block",
            ConnectionAction::ForwardViaProxy => "proxy",
            ConnectionAction::Direct => "direct",
        }
    }
}

/// DNS 查询的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsAction {
    Drop,
    Redirect,
    Pass,
}

impl ConnectionRules {
    /// 用所有规则集测试一个域名
    pub fn classify(&self, hostname: &str) -> DomainClassification {
        DomainClassification {
            drop: self.drop.find(hostname).map(|r| r.pattern.to_string()),
            block: self.block.find(hostname).map(|r| r.pattern.to_string()),
            forward: self.forward.find(hostname).map(|r| r.pattern.to_string()),
            bandwidth: self
                .bandwidth
                .find(hostname)
                .map(|r| (r.pattern.to_string(), r.value)),
        }
    }

    /// 按 丢弃 > 拦截 > 转发 的优先级决定处理方式
    pub fn decide(&self, classification: &DomainClassification, has_forward_proxy: bool) -> ConnectionAction {
        if classification.drop.is_some() {
            return ConnectionAction::Drop;
        }
        if classification.block.is_some() {
            return ConnectionAction::Block;
        }
        if has_forward_proxy && (self.forward.is_empty() || classification.forward.is_some()) {
            return ConnectionAction::ForwardViaProxy;
        }
        ConnectionAction::Direct
    }
}

impl DnsRules {
    /// 丢弃优先于重定向
    pub fn classify(&self, name: &str) -> DnsAction {
        if self.drop.matches(name) {
            DnsAction::Drop
        } else if self.redirect.matches(name) {
            DnsAction::Redirect
        } else {
            DnsAction::Pass
        }
    }
}

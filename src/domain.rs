use std::fmt;

use crate::config::ConfigError;

/// 域名通配符模式，例如 `*.example.com`、`example.*`、`cdn-*.example.org`
///
/// `*` 只在单个标签（两个点之间的部分）内匹配任意长度的字符，不跨越 `.`。
/// 唯一的例外是单独的 `*`，它匹配所有域名。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WildcardPattern {
    /// 规范化后的模式文本（小写，无结尾的点）
    text: String,
    /// 按点切分后的标签
    labels: Vec<String>,
    /// 模式是否就是 `*`
    catch_all: bool,
}

impl WildcardPattern {
    /// 解析并校验通配符模式
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let text = normalize(raw.trim());

        if text.is_empty() {
            return Err(ConfigError::InvalidPattern {
                pattern: raw.to_string(),
                reason: "模式为空",
            });
        }

        if let Some(c) = text
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*')))
        {
            log::debug!("通配符 {} 含有非法字符 {:?}", raw, c);
            return Err(ConfigError::InvalidPattern {
                pattern: raw.to_string(),
                reason: "含有非法字符",
            });
        }

        let labels: Vec<String> = text.split('.').map(str::to_string).collect();
        if labels.iter().any(|l| l.is_empty()) {
            return Err(ConfigError::InvalidPattern {
                pattern: raw.to_string(),
                reason: "含有空标签",
            });
        }

        Ok(Self {
            catch_all: text == "*",
            text,
            labels,
        })
    }

    /// 模式文本
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// 检查域名是否匹配（不区分大小写，忽略结尾的点）
    pub fn matches(&self, hostname: &str) -> bool {
        let host = normalize(hostname);
        if host.is_empty() {
            return false;
        }
        if self.catch_all {
            return true;
        }

        let mut host_labels = host.split('.');
        for pattern in &self.labels {
            match host_labels.next() {
                Some(label) if glob_label(pattern.as_bytes(), label.as_bytes()) => {}
                _ => return false,
            }
        }

        // 标签数量必须一致：`*.example.com` 不匹配 `example.com`，也不匹配 `a.b.example.com`
        host_labels.next().is_none()
    }
}

impl fmt::Display for WildcardPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// 按配置顺序依次匹配，返回第一个命中的模式
pub fn find_match<'a>(hostname: &str, patterns: &'a [WildcardPattern]) -> Option<&'a WildcardPattern> {
    patterns.iter().find(|p| p.matches(hostname))
}

/// 一条规则：模式 + 附带的值（带宽规则为字节/秒，其它规则为 `()`）
#[derive(Debug, Clone, PartialEq)]
pub struct Rule<V> {
    pub pattern: WildcardPattern,
    pub value: V,
}

/// 有序规则集，首个命中即生效
///
/// 必须保持配置时的顺序，所以用 `Vec` 而不是 map。
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet<V> {
    rules: Vec<Rule<V>>,
}

impl<V> Default for RuleSet<V> {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl<V> RuleSet<V> {
    pub fn new(rules: Vec<Rule<V>>) -> Self {
        Self { rules }
    }

    /// 返回第一个匹配的规则
    #[inline]
    pub fn find(&self, hostname: &str) -> Option<&Rule<V>> {
        self.rules.iter().find(|r| r.pattern.matches(hostname))
    }

    #[inline]
    pub fn matches(&self, hostname: &str) -> bool {
        self.find(hostname).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule<V>> {
        self.rules.iter()
    }

    pub fn patterns(&self) -> Vec<WildcardPattern> {
        self.rules.iter().map(|r| r.pattern.clone()).collect()
    }
}

impl RuleSet<()> {
    /// 从字符串列表构建无值规则集（拦截、丢弃、转发、DNS 重定向等）
    pub fn parse_list<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigError> {
        let rules = patterns
            .iter()
            .map(|p| {
                WildcardPattern::parse(p.as_ref()).map(|pattern| Rule { pattern, value: () })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }
}

impl<V> FromIterator<Rule<V>> for RuleSet<V> {
    fn from_iter<I: IntoIterator<Item = Rule<V>>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

/// 统一转换为小写并去掉一个结尾的点
fn normalize(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}

/// 单个标签内的 glob 匹配，`*` 匹配零个或多个字符
fn glob_label(pattern: &[u8], label: &[u8]) -> bool {
    let (mut p, mut l) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while l < label.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = l;
            p += 1;
        } else if p < pattern.len() && pattern[p] == label[l] {
            p += 1;
            l += 1;
        } else if let Some(s) = star {
            // 回溯：让上一个 `*` 多吃一个字符
            p = s + 1;
            mark += 1;
            l = mark;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(list: &[&str]) -> Vec<WildcardPattern> {
        list.iter().map(|p| WildcardPattern::parse(p).unwrap()).collect()
    }

    #[test]
    fn test_exact_match() {
        let p = WildcardPattern::parse("example.com").unwrap();

        assert!(p.matches("example.com"));
        assert!(p.matches("EXAMPLE.COM")); // 大小写不敏感
        assert!(p.matches("example.com.")); // 结尾的点
        assert!(!p.matches("www.example.com"));
        assert!(!p.matches("notexample.com"));
    }

    #[test]
    fn test_wildcard_subdomain() {
        let p = WildcardPattern::parse("*.example.com").unwrap();

        assert!(p.matches("www.example.com"));
        assert!(p.matches("a.example.com"));
        assert!(p.matches("API.Example.Com"));

        assert!(!p.matches("example.com")); // 通配符不匹配主域名本身
        assert!(!p.matches("test.sub.example.com")); // `*` 不跨越点
        assert!(!p.matches("notexample.com"));
        assert!(!p.matches("testexample.com"));
    }

    #[test]
    fn test_wildcard_tld() {
        let p = WildcardPattern::parse("example.*").unwrap();

        assert!(p.matches("example.com"));
        assert!(p.matches("example.org"));
        assert!(!p.matches("example.co.uk"));
        assert!(!p.matches("www.example.com"));
    }

    #[test]
    fn test_wildcard_inside_label() {
        let p = WildcardPattern::parse("cdn-*.example.com").unwrap();

        assert!(p.matches("cdn-1.example.com"));
        assert!(p.matches("cdn-.example.com")); // 零个字符
        assert!(p.matches("cdn-eu-west.example.com"));
        assert!(!p.matches("cdn.example.com"));

        let p = WildcardPattern::parse("a*b*c.test").unwrap();
        assert!(p.matches("abc.test"));
        assert!(p.matches("axxbyyc.test"));
        assert!(p.matches("abbbc.test"));
        assert!(!p.matches("axxbyy.test"));
    }

    #[test]
    fn test_catch_all() {
        let p = WildcardPattern::parse("*").unwrap();

        assert!(p.matches("com"));
        assert!(p.matches("www.example.com"));
        assert!(p.matches("deep.sub.domain.example.org."));
        assert!(!p.matches(""));
    }

    #[test]
    fn test_case_insensitive_pattern() {
        let p = WildcardPattern::parse("*.GitHub.IO.").unwrap();

        assert_eq!(p.as_str(), "*.github.io");
        assert!(p.matches("user.github.io"));
        assert!(p.matches("USER.GITHUB.IO"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(WildcardPattern::parse("").is_err());
        assert!(WildcardPattern::parse("   ").is_err());
        assert!(WildcardPattern::parse("a..b").is_err());
        assert!(WildcardPattern::parse(".example.com").is_err());
        assert!(WildcardPattern::parse("exa mple.com").is_err());
        assert!(WildcardPattern::parse("example.com/path").is_err());
        assert!(WildcardPattern::parse("例子.com").is_err());
    }

    #[test]
    fn test_find_match_first_hit() {
        let list = patterns(&["*.example.com", "www.*.com", "*"]);

        assert_eq!(find_match("www.example.com", &list).unwrap().as_str(), "*.example.com");
        assert_eq!(find_match("www.other.com", &list).unwrap().as_str(), "www.*.com");
        assert_eq!(find_match("anything.org", &list).unwrap().as_str(), "*");
    }

    #[test]
    fn test_find_match_order_matters() {
        let forward = patterns(&["www.*.com", "*.example.com"]);
        let reversed = patterns(&["*.example.com", "www.*.com"]);

        assert_eq!(find_match("www.example.com", &forward).unwrap().as_str(), "www.*.com");
        assert_eq!(find_match("www.example.com", &reversed).unwrap().as_str(), "*.example.com");
    }

    #[test]
    fn test_find_match_none() {
        let list = patterns(&["*.example.com"]);
        assert!(find_match("example.org", &list).is_none());
        assert!(find_match("anything", &[]).is_none());
    }

    #[test]
    fn test_rule_set_values_keep_order() {
        let rules: RuleSet<f64> = vec![
            Rule { pattern: WildcardPattern::parse("*.video.test").unwrap(), value: 1024.0 },
            Rule { pattern: WildcardPattern::parse("*.test").unwrap(), value: 4096.0 },
        ]
        .into_iter()
        .collect();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules.find("cdn.video.test").map(|r| r.value), Some(1024.0));
        assert_eq!(rules.find("video.test").map(|r| r.value), Some(4096.0));
        assert!(rules.find("a.cdn.video.test").is_none()); // 标签数量不同
        assert_eq!(rules.patterns()[0].as_str(), "*.video.test");

        let mut iter = rules.iter();
        assert_eq!(iter.len(), 2);
        assert_eq!(iter.next().map(|r| r.value), Some(1024.0));
        assert_eq!(iter.len(), 1);
    }

    #[test]
    fn test_rule_set_parse_list() {
        let set = RuleSet::parse_list(&["blocked.test", "*.ads.test"]).unwrap();

        assert!(set.matches("blocked.test"));
        assert!(set.matches("x.ads.test"));
        assert!(!set.matches("ads.test"));
        assert!(RuleSet::parse_list(&["ok.test", "bad..test"]).is_err());

        let empty = RuleSet::parse_list::<&str>(&[]).unwrap();
        assert!(empty.is_empty());
        assert!(!empty.matches("example.com"));
    }
}

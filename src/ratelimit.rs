use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::rules::DomainClassification;

/// 令牌桶（单位：字节）
///
/// 状态放在 `tokio::sync::Mutex` 后面。tokio 的互斥锁按到达顺序唤醒等待者，
/// 而 `acquire` 在补足欠额的睡眠期间一直持有锁，所以后来的连接不可能插队，
/// 共享同一个桶的连接按 FIFO 轮流拿到令牌。
#[derive(Debug)]
pub struct Bucket {
    /// 速率（字节/秒）
    rate: f64,
    /// 突发容量
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

impl Bucket {
    /// `rate` 必须大于 0；容量为一秒的量（至少 1 字节），初始为满
    pub fn new(rate: f64) -> Self {
        let capacity = rate.max(1.0);
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// 在写入 `n` 字节之前调用，返回实际等待的时间
    ///
    /// 超过容量的请求按容量分片发放。future 被丢弃时锁随之释放，排队位置也一起释放。
    pub async fn acquire(&self, n: usize) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }

        let mut state = self.state.lock().await;
        let mut remaining = n as f64;
        let mut waited = Duration::ZERO;

        while remaining > 0.0 {
            let chunk = remaining.min(self.capacity);
            state.refill(self.rate, self.capacity);

            if state.tokens < chunk {
                let wait = Duration::from_secs_f64((chunk - state.tokens) / self.rate);
                sleep(wait).await;
                waited += wait;
                state.refill(self.rate, self.capacity);
            }

            state.tokens = (state.tokens - chunk).max(0.0);
            remaining -= chunk;
        }

        waited
    }
}

/// 引擎级的限速器：可选的全局桶 + 按带宽规则模式懒创建的桶
#[derive(Debug, Default)]
pub struct BandwidthLimiter {
    global: Option<Arc<Bucket>>,
    /// 模式 -> 桶；查找和创建在同一把锁内完成，每个模式只会有一个桶
    per_rule: StdMutex<HashMap<String, Arc<Bucket>>>,
}

impl BandwidthLimiter {
    /// `global_rate` 为 0 表示不设全局限速
    pub fn new(global_rate: f64) -> Self {
        Self {
            global: (global_rate > 0.0).then(|| Arc::new(Bucket::new(global_rate))),
            per_rule: StdMutex::new(HashMap::new()),
        }
    }

    /// 连接建立时调用一次，决定由哪个桶限速
    ///
    /// 命中带宽规则时使用该规则的桶（速率为 0 表示该域名不限速），
    /// 否则使用全局桶，都没有则返回 `None`。
    pub fn resolve(&self, classification: &DomainClassification) -> Option<Arc<Bucket>> {
        match &classification.bandwidth {
            Some((pattern, rate)) if *rate > 0.0 => Some(self.bucket_for(pattern, *rate)),
            Some(_) => None,
            None => self.global.clone(),
        }
    }

    fn bucket_for(&self, pattern: &str, rate: f64) -> Arc<Bucket> {
        let mut buckets = match self.per_rule.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buckets
            .entry(pattern.to_string())
            .or_insert_with(|| {
                debug!("创建带宽桶: {} ({} 字节/秒)", pattern, rate);
                Arc::new(Bucket::new(rate))
            })
            .clone()
    }

    /// 已创建的按规则桶数量
    pub fn bucket_count(&self) -> usize {
        match self.per_rule.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn has_global(&self) -> bool {
        self.global.is_some()
    }
}

use anyhow::Result;
use log::debug;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Instant};

use crate::ratelimit::Bucket;

/// 单次读取的缓冲区大小
const RELAY_BUFFER: usize = 64 * 1024;

/// 单个连接两个方向的字节数
#[derive(Debug, Default)]
pub struct TransferStats {
    upstream: AtomicU64,
    downstream: AtomicU64,
}

impl TransferStats {
    /// 客户端 -> 目标（含重放的前缀）
    pub fn upstream(&self) -> u64 {
        self.upstream.load(Ordering::Relaxed)
    }

    /// 目标 -> 客户端
    pub fn downstream(&self) -> u64 {
        self.downstream.load(Ordering::Relaxed)
    }
}

/// 两个方向共用的最近活动时间
struct Activity {
    start: Instant,
    /// 相对 `start` 的毫秒数
    last: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last.store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// 两个方向都超过 `idle_timeout` 没有数据流动时返回
async fn idle_watchdog(activity: &Activity, idle_timeout: Duration) {
    loop {
        let idle = activity.idle_for();
        if idle >= idle_timeout {
            return;
        }
        sleep(idle_timeout - idle).await;
    }
}

/// 双向转发
///
/// 先把嗅探时读到的 `prefix` 原样写给目标，然后两个方向并发复制，
/// 每次写入前都经过限速桶。任一方向结束（EOF 或出错）整个转发结束，
/// 两端连接随之关闭，另一方向上挂起的读写和限速等待也一并取消。
/// 空闲超时按两个方向合计计算：只要任一方向还在传数据就不会超时。
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    prefix: &[u8],
    bucket: Option<Arc<Bucket>>,
    idle_timeout: Duration,
    stats: &TransferStats,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let activity = Activity::new();

    if !prefix.is_empty() {
        throttled_write(&mut upstream_write, prefix, bucket.as_deref(), &activity).await?;
        stats.upstream.fetch_add(prefix.len() as u64, Ordering::Relaxed);
    }

    let client_to_target = copy_throttled(
        &mut client_read,
        &mut upstream_write,
        bucket.as_deref(),
        &activity,
        &stats.upstream,
    );
    let target_to_client = copy_throttled(
        &mut upstream_read,
        &mut client_write,
        bucket.as_deref(),
        &activity,
        &stats.downstream,
    );

    tokio::select! {
        result = client_to_target => {
            if let Err(e) = result {
                debug!("客户端到目标服务器的数据传输结束: {}", e);
            }
        }
        result = target_to_client => {
            if let Err(e) = result {
                debug!("目标服务器到客户端的数据传输结束: {}", e);
            }
        }
        _ = idle_watchdog(&activity, idle_timeout) => {
            debug!("连接空闲超过 {:?}，结束转发", idle_timeout);
        }
    }

    Ok(())
}

/// 单方向复制；读到 EOF 时关闭对端的写方向
async fn copy_throttled<R, W>(
    reader: &mut R,
    writer: &mut W,
    bucket: Option<&Bucket>,
    activity: &Activity,
    counter: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        activity.touch();
        throttled_write(writer, &buf[..n], bucket, activity).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// 按桶容量分段写入，每段先取令牌
async fn throttled_write<W>(writer: &mut W, data: &[u8], bucket: Option<&Bucket>, activity: &Activity) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match bucket {
        None => writer.write_all(data).await?,
        Some(bucket) => {
            let piece = (bucket.capacity() as usize).max(1);
            for chunk in data.chunks(piece) {
                bucket.acquire(chunk.len()).await;
                writer.write_all(chunk).await?;
                activity.touch();
            }
        }
    }
    activity.touch();
    Ok(())
}

use anyhow::Result;
use sniproxy::logger::{init_logger, LogConfig};
use sniproxy::{Config, Engine, Options};
use tokio::sync::watch;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    // 读取命令行参数，指定了 --config 时以配置文件为准
    let options = Options::resolve()?;

    // 初始化日志系统
    let log_config = LogConfig::from_cli(options.verbose, options.output.as_deref());
    init_logger(log_config).map_err(|e| anyhow::anyhow!("初始化日志系统失败: {}", e))?;

    log::info!("=== sniproxy 启动 ===");
    if let Some(path) = &options.config {
        log::info!("配置文件: {}", path);
    }
    log::debug!("生效的参数:\n{}", options.to_pretty_json());

    let config = match Config::from_options(&options) {
        Ok(config) => config,
        Err(e) => {
            log::error!("配置错误: {}", e);
            eprintln!("配置错误: {}", e);
            std::process::exit(2);
        }
    };
    config.log_summary();

    let engine = Engine::new(config);

    // Ctrl-C 触发优雅关闭
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("🛑 收到 Ctrl-C，开始关闭");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                log::error!("无法监听 Ctrl-C: {}", e);
                // 保持发送端存活，否则各监听器会当作关闭信号
                let _keep = shutdown_tx;
                std::future::pending::<()>().await;
            }
        }
    });

    log::info!("=== 服务器准备就绪 ===");
    engine.run(shutdown_rx).await?;
    log::info!("=== sniproxy 已退出 ===");

    Ok(())
}

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod perplexity;
pub mod pool;
pub mod query;
pub mod stdio;

use crate::perplexity::client::{Session, SessionClient};
use crate::pool::manager::SessionFactory;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let opts = cfg.session_options();
    let factory: SessionFactory = Arc::new(move |cookies| {
        Ok(Arc::new(SessionClient::new(cookies, &opts)?) as Arc<dyn Session>)
    });

    let pool = Arc::new(pool::Pool::new(factory, Some(cfg.pool_config_path())));
    if let Err(e) = pool.load(cfg.env_token()).await {
        tracing::warn!("初始化客户端池失败：{e:#}");
    }
    tracing::info!(clients = pool.len().await, "客户端池就绪");

    let _monitor = pool::monitor::spawn(pool.clone());

    if cfg.stdio {
        return stdio::run(pool).await;
    }

    let state = Arc::new(gateway::admin::AdminState {
        pool,
        cfg: cfg.clone(),
    });
    let app = gateway::admin::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,pplx2api=info")
    } else if env.contains("pplx2api") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},pplx2api=info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);

    // 配置了 LOG_FILE 时写文件（管理接口 /logs/tail 读同一文件），否则走 stdout。
    let log_file = cfg.log_file.trim();
    if !log_file.is_empty() {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
        {
            Ok(file) => {
                let _ = builder.with_ansi(false).with_writer(Arc::new(file)).try_init();
                return;
            }
            Err(e) => {
                eprintln!("无法打开日志文件 {log_file}: {e}");
            }
        }
    }
    let _ = builder.try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}

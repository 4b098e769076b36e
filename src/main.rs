//! Foreman - 会话编排服务
//!
//! 入口：初始化日志、加载配置、打开会话，启动调度轮询与 HTTP 服务，收到关闭信号后退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use foreman::config::load_config;
use foreman::core::{Session, ShutdownManager, ShutdownReason};
use foreman::{observability, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path.clone()).context("Failed to load config")?;
    tracing::info!(name = %config.app.name, data_dir = %config.app.data_dir.display(), "starting");

    let session = Session::open(config, config_path)
        .await
        .context("Failed to open session")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let scheduler_task = tokio::spawn(Arc::clone(&session).run_scheduler(shutdown.token()));

    if let Err(e) = session.greet_if_empty().await {
        tracing::warn!("startup greeting skipped: {}", e);
    }

    if let Err(e) = server::serve(Arc::clone(&session), shutdown.token()).await {
        tracing::error!("server error: {:#}", e);
        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
    }
    let _ = scheduler_task.await;

    if let Some(holder) = session.lock().holder() {
        tracing::warn!(message_id = %holder, "exiting with a generation in flight; it will not be committed");
    }
    Ok(())
}

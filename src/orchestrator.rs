use std::sync::Arc;

use anyhow::Result;
use log::info;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::admin::AdminServer;
use crate::config::Config;
use crate::proxy::tcp::TcpProxyListener;
use crate::supervisor::Supervisor;

/// Builds the proxy listeners and admin endpoint described by a `Config`,
/// owns the shared supervisor, and exposes a single shutdown signal that
/// tears the whole process down from either `GET /shutdown` or a caller.
pub struct Orchestrator {
    shutdown: Arc<Notify>,
    proxy_count: usize,
    admin_listen: u16,
    config: Config,
    supervisor: Arc<Supervisor>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            shutdown: Arc::new(Notify::new()),
            proxy_count: config.proxies.len(),
            admin_listen: config.admin.listen,
            config,
            supervisor: Supervisor::new(),
        }
    }

    pub fn close(&self) {
        self.shutdown.notify_waiters();
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "starting nexer with {} proxy listener(s), admin on {}",
            self.proxy_count, self.admin_listen
        );

        let mut tasks = JoinSet::new();

        for proxy in self.config.proxies {
            let listener = TcpProxyListener::new(proxy, self.supervisor.clone());
            tasks.spawn(async move { listener.run().await });
        }

        let admin = AdminServer::new(self.admin_listen, self.shutdown.clone());
        tasks.spawn(async move { admin.run().await });

        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.notified() => {
                info!("shutdown requested, closing listeners");
            }
            result = tasks.join_next() => {
                match result {
                    Some(Err(join_err)) => return Err(join_err.into()),
                    Some(Ok(Err(task_err))) => return Err(task_err),
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

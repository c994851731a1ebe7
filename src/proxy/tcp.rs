use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::TcpListener;

use crate::config::ProxyConfig;
use crate::forwarder::Forwarder;
use crate::retry::connect_with_retry;
use crate::supervisor::Supervisor;

/// Listens on a front port and, for each accepted connection, ensures the
/// upstream application is healthy before bridging the client to it.
pub struct TcpProxyListener {
    config: ProxyConfig,
    supervisor: Arc<Supervisor>,
}

impl TcpProxyListener {
    pub fn new(config: ProxyConfig, supervisor: Arc<Supervisor>) -> Self {
        Self { config, supervisor }
    }

    fn upstream_name(&self) -> String {
        format!("{}:{}", self.config.upstream.host, self.config.upstream.port)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen)).await?;
        info!(
            "proxy listening on {} -> {}",
            self.config.listen,
            self.upstream_name()
        );

        loop {
            let (client, peer) = listener.accept().await?;
            debug!("accepted connection from {peer}");
            self.spawn_connection(client);
        }
    }

    fn spawn_connection(&self, client: tokio::net::TcpStream) {
        let upstream = self.config.upstream.clone();
        let supervisor = self.supervisor.clone();
        let upstream_name = self.upstream_name();

        tokio::spawn(async move {
            let forwarder = Forwarder::new(client);
            let registered = Arc::new(AtomicBool::new(true));
            let registered_for_close = registered.clone();
            forwarder.on_close(move || {
                registered_for_close.store(false, Ordering::SeqCst);
            });

            if let Some(app) = upstream.app.clone() {
                let code = supervisor.require(app).await;
                if code != 0 {
                    warn!("upstream {upstream_name} not healthy (code {code}), dropping connection");
                    if registered.load(Ordering::SeqCst) {
                        forwarder.shutdown();
                    }
                    return;
                }
            }

            if !registered.load(Ordering::SeqCst) {
                return;
            }

            let timeout = Duration::from_millis(upstream.connect_timeout_ms);
            let stream = connect_with_retry(&upstream.host, upstream.port, timeout, || {
                debug!("attempting connect to {upstream_name}");
            })
            .await;

            match stream {
                Some(stream) if registered.load(Ordering::SeqCst) => {
                    forwarder.set_outgoing(stream);
                }
                Some(_) => {
                    // Inbound already closed while we were connecting; drop
                    // the upstream socket by letting it go out of scope.
                }
                None => {
                    warn!("could not reach upstream {upstream_name}");
                    if registered.load(Ordering::SeqCst) {
                        forwarder.shutdown();
                    }
                }
            }
        });
    }
}

use std::time::{Duration, Instant};

use log::debug;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Period between connect attempts: fast enough to notice a just-opened
/// port, slow enough to avoid thrashing an upstream that is still starting.
const RETRY_PERIOD: Duration = Duration::from_millis(500);

/// Repeatedly attempts to connect to `host:port` until one attempt succeeds
/// or `overall_timeout` elapses, whichever comes first. `on_attempt` is
/// invoked once per attempt started, before the connect is awaited.
pub async fn connect_with_retry(
    host: &str,
    port: u16,
    overall_timeout: Duration,
    mut on_attempt: impl FnMut(),
) -> Option<TcpStream> {
    let deadline = Instant::now() + overall_timeout;
    let addr = format!("{host}:{port}");
    let mut ticker = interval(RETRY_PERIOD);
    let mut in_flight: Option<JoinHandle<std::io::Result<TcpStream>>> = None;

    loop {
        if Instant::now() >= deadline {
            if let Some(task) = in_flight.take() {
                task.abort();
            }
            return None;
        }

        tokio::select! {
            _ = ticker.tick() => {
                if in_flight.is_none() {
                    on_attempt();
                    let addr = addr.clone();
                    in_flight = Some(tokio::spawn(async move { TcpStream::connect(addr).await }));
                }
            }
            result = async {
                match &mut in_flight {
                    Some(task) => task.await,
                    None => std::future::pending().await,
                }
            } => {
                in_flight = None;
                match result {
                    Ok(Ok(stream)) => return Some(stream),
                    Ok(Err(e)) => {
                        debug!("connect attempt to {addr} failed: {e}");
                    }
                    Err(_) => {
                        // attempt task panicked or was cancelled; next tick retries.
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline.into()) => {
                if let Some(task) = in_flight.take() {
                    task.abort();
                }
                return None;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_once_listener_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let accept_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            listener.accept().await.unwrap();
        });

        let mut attempts = 0;
        let stream = connect_with_retry("127.0.0.1", port, Duration::from_secs(3), || {
            attempts += 1;
        })
        .await;

        assert!(stream.is_some());
        assert!(attempts >= 1);
        accept_task.await.unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_overall_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let stream =
            connect_with_retry("127.0.0.1", port, Duration::from_millis(900), || {}).await;
        assert!(stream.is_none());
    }
}

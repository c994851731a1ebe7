use std::sync::Arc;

use anyhow::Result;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// A minimal HTTP/1.1 listener serving exactly one route: `GET /shutdown`,
/// which notifies the orchestrator to tear the process down. There is no
/// general-purpose request parser here (no bodies, no headers beyond the
/// request line) since nothing else in this program speaks HTTP.
pub struct AdminServer {
    listen_port: u16,
    shutdown: Arc<Notify>,
}

impl AdminServer {
    pub fn new(listen_port: u16, shutdown: Arc<Notify>) -> Self {
        Self {
            listen_port,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", self.listen_port)).await?;
        debug!("admin endpoint listening on {}", self.listen_port);

        loop {
            let (stream, _) = listener.accept().await?;
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, shutdown).await {
                    warn!("admin connection error: {e}");
                }
            });
        }
    }
}

enum Response {
    Ok,
    NotFound,
    BadRequest,
}

impl Response {
    fn status_line(&self) -> &'static str {
        match self {
            Response::Ok => "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            Response::NotFound => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
            Response::BadRequest => "HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n",
        }
    }
}

async fn serve_connection(stream: TcpStream, shutdown: Arc<Notify>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut request_line = String::new();
        let bytes_read = reader.read_line(&mut request_line).await?;
        if bytes_read == 0 {
            return Ok(());
        }

        // Drain header lines up to the blank line; none are inspected.
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }

        let response = match parse_request_line(&request_line) {
            Some(("GET", "/shutdown")) => {
                shutdown.notify_waiters();
                Response::Ok
            }
            Some(_) => Response::NotFound,
            None => Response::BadRequest,
        };

        let is_bad_request = matches!(response, Response::BadRequest);
        write_half.write_all(response.status_line().as_bytes()).await?;
        if is_bad_request {
            return Ok(());
        }
    }
}

fn parse_request_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split(' ');
    let method = parts.next()?;
    let path = parts.next()?;
    let _version = parts.next()?;
    Some((method, path))
}

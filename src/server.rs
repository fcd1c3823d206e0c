//! TCP access to the bus: one JSON request per line, one JSON response per
//! line. A `watch` request additionally streams every published snapshot.

use crate::protocol::{encode_line, parse_request, BusRequest, BusResponse, ProtocolError};
use crate::runtime::BusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unable to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("client i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct BusServer {
    listener: TcpListener,
    handle: BusHandle,
}

impl BusServer {
    pub async fn bind(addr: &str, handle: BusHandle) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self { listener, handle })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients forever. Each client gets its own task.
    pub async fn serve(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("bus access listening on {}", addr);
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!("client connected: {}", addr);
                    let handle = self.handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handle).await {
                            warn!("client {} error: {}", addr, e);
                        }
                        info!("client {} disconnected", addr);
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn write_line(writer: &Mutex<OwnedWriteHalf>, line: &str) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await
}

fn spawn_watcher(handle: &BusHandle, writer: Arc<Mutex<OwnedWriteHalf>>) -> JoinHandle<()> {
    let mut events = handle.watch();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let line = match encode_line(&event) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("dropping watch event: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write_line(&writer, &line).await {
                        debug!("watch stream closed: {}", e);
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("watcher lagging, skipped {} snapshot(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_client(stream: TcpStream, handle: BusHandle) -> Result<(), ServerError> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));
    let mut watcher: Option<JoinHandle<()>> = None;

    let mut line = String::new();
    let result = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(ServerError::Io(e)),
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut start_watch = false;
        let response = match parse_request(trimmed) {
            Ok(request) => {
                debug!("request: {:?}", request);
                let is_watch = request == BusRequest::Watch;
                let response = match handle.call(request).await {
                    Ok(response) => response,
                    Err(e) => BusResponse::error(e.to_string()),
                };
                start_watch = is_watch && response.is_success() && watcher.is_none();
                response
            }
            Err(e) => BusResponse::invalid(e.to_string()),
        };

        let encoded = match encode_line(&response) {
            Ok(encoded) => encoded,
            Err(e) => break Err(e.into()),
        };
        if let Err(e) = write_line(&writer, &encoded).await {
            break Err(e.into());
        }
        // Acknowledge first so the ack precedes the first streamed event.
        if start_watch {
            watcher = Some(spawn_watcher(&handle, Arc::clone(&writer)));
        }
    };

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    result
}

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::fs;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::connection::{ConnId, Connection, Disposition, ReadStatus};

type Readiness = BoxFuture<'static, (ConnId, io::Result<()>)>;

pub async fn run_server(base_path: PathBuf, bind: &str, port: u16) -> Result<()> {
    if !base_path.exists() {
        fs::create_dir_all(&base_path)
            .await
            .with_context(|| format!("creating {}", base_path.display()))?;
    }
    let root = fs::canonicalize(&base_path)
        .await
        .with_context(|| format!("resolving {}", base_path.display()))?;

    let addr = format!("{}:{}", bind, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("listening on {} saving to {}", addr, root.display());

    serve(listener, root, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
        }
    })
    .await;
    Ok(())
}

/// Run the connection multiplexer until `shutdown` resolves.
///
/// Everything happens on the calling task: new connections are accepted as
/// soon as they arrive, and each readable connection gets exactly one
/// state-machine step per wake-up before it is re-armed. A step never
/// awaits, so one slow peer cannot hold up the others.
pub async fn serve<F>(listener: TcpListener, root: PathBuf, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut mux = Multiplexer::new(root);
    let mut ready: FuturesUnordered<Readiness> = FuturesUnordered::new();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => ready.push(mux.accept(stream, peer)),
                Err(e) => warn!("accept failed: {}", e),
            },
            Some((id, readiness)) = ready.next(), if !ready.is_empty() => {
                if let Some(rearm) = mux.on_ready(id, readiness) {
                    ready.push(rearm);
                }
            }
        }
    }
    info!("closing {} connection(s)", mux.len());
}

fn wait_readable(id: ConnId, stream: Arc<TcpStream>) -> Readiness {
    async move { (id, stream.readable().await) }.boxed()
}

/// Live connections keyed by id. Only the serving task touches it.
struct Multiplexer {
    root: PathBuf,
    connections: HashMap<ConnId, Connection>,
    next_id: u64,
}

impl Multiplexer {
    fn new(root: PathBuf) -> Self {
        Multiplexer {
            root,
            connections: HashMap::new(),
            next_id: 0,
        }
    }

    fn len(&self) -> usize {
        self.connections.len()
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) -> Readiness {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(conn = %id, "set_nodelay: {}", e);
        }
        let conn = Connection::new(id, stream, peer);
        let rearm = wait_readable(id, conn.stream());
        self.connections.insert(id, conn);
        debug!(conn = %id, %peer, "accepted");
        rearm
    }

    fn remove(&mut self, id: ConnId) {
        if let Some(conn) = self.connections.remove(&id) {
            debug!(conn = %id, peer = %conn.peer(), "closed");
        }
    }

    /// Step one connection. Returns the readiness future to wait on next, or
    /// `None` once the connection has been dropped.
    fn on_ready(&mut self, id: ConnId, readiness: io::Result<()>) -> Option<Readiness> {
        let conn = self.connections.get_mut(&id)?;
        if let Err(e) = readiness {
            warn!(conn = %id, peer = %conn.peer(), "readiness error: {}", e);
            self.remove(id);
            return None;
        }

        let outcome = match conn.read_step() {
            ReadStatus::ReadPending => Ok(Disposition::Keep),
            ReadStatus::RequestComplete(request) => conn.handle_request(&self.root, request),
            ReadStatus::BodyComplete => {
                info!(conn = %id, peer = %conn.peer(), "received body");
                conn.finish_body()
            }
            ReadStatus::PeerClosed => Ok(Disposition::Close),
            ReadStatus::Failed(e) => Err(e),
        };

        match outcome {
            Ok(Disposition::Keep) => Some(wait_readable(id, conn.stream())),
            Ok(Disposition::Close) => {
                self.remove(id);
                None
            }
            Err(e) => {
                warn!(conn = %id, peer = %conn.peer(), "dropping connection: {}", e);
                self.remove(id);
                None
            }
        }
    }
}

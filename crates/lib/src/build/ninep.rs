//! 9P file server for staging directories.
//!
//! Each share binds its own TCP listener on the external IP with an
//! ephemeral port. Every accepted connection gets a 9P2000.L server rooted
//! at the staging directory, driven on a blocking thread until the client
//! hangs up or the share is dropped.

use std::collections::BTreeMap;
use std::io::{self, BufReader};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::scheduler::Mount;

use super::share::{FileShare, SharedDir, ninep_mount};

type Connections = Arc<Mutex<Vec<TcpStream>>>;

/// Pause after a failed accept, so a persistent error such as EMFILE does
/// not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct NinePShare {
  ip: IpAddr,
}

impl NinePShare {
  pub fn new(ip: IpAddr) -> Self {
    Self { ip }
  }
}

#[async_trait::async_trait]
impl FileShare for NinePShare {
  async fn share(&self, dir: &Path) -> io::Result<Box<dyn SharedDir>> {
    let listener = TcpListener::bind((self.ip, 0)).await?;
    let addr = listener.local_addr()?;
    debug!(dir = %dir.display(), addr = %addr, "serving staging directory over 9p");

    let connections = Connections::default();
    let accept = tokio::spawn(accept_loop(listener, dir.to_path_buf(), connections.clone()));
    Ok(Box::new(NinePDir {
      addr,
      accept,
      connections,
    }))
  }
}

struct NinePDir {
  addr: SocketAddr,
  accept: JoinHandle<()>,
  connections: Connections,
}

impl SharedDir for NinePDir {
  fn mount(&self) -> Mount {
    ninep_mount(self.addr.ip(), self.addr.port())
  }
}

impl Drop for NinePDir {
  fn drop(&mut self) {
    self.accept.abort();
    let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
    for stream in connections.iter() {
      let _ = stream.shutdown(Shutdown::Both);
    }
  }
}

async fn accept_loop(listener: TcpListener, root: PathBuf, connections: Connections) {
  loop {
    let Some((stream, peer)) = accepted(listener.accept().await).await else {
      continue;
    };
    debug!(peer = %peer, "9p client connected");

    let stream = match into_blocking(stream) {
      Ok(stream) => stream,
      Err(e) => {
        warn!(peer = %peer, err = %e, "failed to set up 9p connection");
        continue;
      }
    };
    if let Ok(handle) = stream.try_clone() {
      connections.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }

    let root = root.clone();
    tokio::task::spawn_blocking(move || serve(stream, &root));
  }
}

async fn accepted<T>(result: io::Result<T>) -> Option<T> {
  match result {
    Ok(conn) => Some(conn),
    Err(e) => {
      warn!(err = %e, "9p accept failed");
      tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
      None
    }
  }
}

fn into_blocking(stream: tokio::net::TcpStream) -> io::Result<TcpStream> {
  let stream = stream.into_std()?;
  stream.set_nonblocking(false)?;
  Ok(stream)
}

fn serve(stream: TcpStream, root: &Path) {
  let mut server = match p9::Server::new(root, BTreeMap::new(), BTreeMap::new()) {
    Ok(server) => server,
    Err(e) => {
      warn!(root = %root.display(), err = %e, "failed to start 9p server");
      return;
    }
  };
  let mut writer = match stream.try_clone() {
    Ok(writer) => writer,
    Err(e) => {
      warn!(err = %e, "failed to clone 9p connection");
      return;
    }
  };
  let mut reader = BufReader::new(stream);

  loop {
    if let Err(e) = server.handle_message(&mut reader, &mut writer) {
      match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected => {
          debug!("9p client disconnected");
        }
        _ => warn!(err = %e, "9p connection closed"),
      }
      return;
    }
  }
}

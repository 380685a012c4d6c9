//! Listening endpoint the workers connect back to
//!
//! A Unix domain socket on Unix, a named pipe on Windows. Names combine the
//! supervisor's process id with a run counter: a pipe name can stay busy while
//! the previous run's workers drain, and several supervisors may share a process.

use std::fmt;
use std::io;
#[cfg(not(windows))]
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};

pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected, bidirectional stream.
pub type Connection = Box<dyn AsyncIo>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(windows)]
    NamedPipe(String),
    #[cfg(not(windows))]
    UnixSocket(PathBuf),
}

impl Endpoint {
    /// The address for run number `run` of supervisor process `pid`.
    pub fn for_run(pid: u32, run: u64) -> Self {
        #[cfg(windows)]
        {
            Self::NamedPipe(format!(r"\\.\pipe\elm_test-{pid}-{run}"))
        }
        #[cfg(not(windows))]
        {
            Self::UnixSocket(std::env::temp_dir().join(format!("elm_test-{pid}-{run}.sock")))
        }
    }

    /// Parse an address as printed by [`Endpoint`]'s `Display`.
    pub fn parse(address: &str) -> Self {
        #[cfg(windows)]
        {
            Self::NamedPipe(address.to_string())
        }
        #[cfg(not(windows))]
        {
            Self::UnixSocket(PathBuf::from(address))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(windows)]
            Endpoint::NamedPipe(name) => f.write_str(name),
            #[cfg(not(windows))]
            Endpoint::UnixSocket(path) => write!(f, "{}", path.display()),
        }
    }
}

pub enum Listener {
    #[cfg(windows)]
    NamedPipe { name: String },
    #[cfg(not(windows))]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    /// Start listening. A stale socket file from an earlier run is removed first.
    pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        #[cfg(windows)]
        {
            let Endpoint::NamedPipe(name) = endpoint;
            Ok(Self::NamedPipe { name: name.clone() })
        }

        #[cfg(not(windows))]
        {
            let Endpoint::UnixSocket(path) = endpoint;
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            let listener = tokio::net::UnixListener::bind(path)?;
            Ok(Self::Unix {
                listener,
                path: path.clone(),
            })
        }
    }

    pub async fn accept(&self) -> io::Result<Connection> {
        #[cfg(windows)]
        {
            use tokio::net::windows::named_pipe::ServerOptions;
            let Self::NamedPipe { name } = self;
            let server = ServerOptions::new().create(name)?;
            server.connect().await?;
            Ok(Box::new(server))
        }

        #[cfg(not(windows))]
        {
            let Self::Unix { listener, .. } = self;
            let (stream, _) = listener.accept().await?;
            Ok(Box::new(stream))
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Named pipes are cleaned up by the OS once the last handle closes.
        #[cfg(not(windows))]
        {
            let Self::Unix { path, .. } = self;
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Connect to a supervisor. Workers never retry once connected.
pub async fn connect(endpoint: &Endpoint) -> io::Result<Connection> {
    #[cfg(windows)]
    {
        use tokio::net::windows::named_pipe::ClientOptions;
        let Endpoint::NamedPipe(name) = endpoint;
        // The server only has one pipe instance waiting at a time, created on accept.
        loop {
            match ClientOptions::new().open(name) {
                Ok(client) => return Ok(Box::new(client)),
                Err(e) if e.raw_os_error() == Some(231) || e.kind() == io::ErrorKind::NotFound => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(not(windows))]
    {
        let Endpoint::UnixSocket(path) = endpoint;
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Box::new(stream))
    }
}

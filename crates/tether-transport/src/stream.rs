use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};

/// A connected parent channel implementing `AsyncRead + AsyncWrite`.
///
/// On Unix this wraps a Unix domain socket stream, either freshly connected
/// or adopted from an inherited descriptor.
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl IpcStream {
    /// Open the parent channel described by `endpoint`.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        #[cfg(not(unix))]
        {
            return Err(TransportError::Unsupported(format!(
                "{endpoint} requires Unix domain sockets"
            )));
        }

        #[cfg(unix)]
        {
            match endpoint {
                Endpoint::Socket(path) => {
                    let stream = tokio::net::UnixStream::connect(path).await.map_err(|e| {
                        TransportError::Connect {
                            path: path.clone(),
                            source: e,
                        }
                    })?;
                    debug!(?path, "connected to parent socket");
                    Ok(Self::from_unix(stream))
                }
                Endpoint::Descriptor(fd) => {
                    let stream = adopt_descriptor(*fd)?;
                    debug!(fd, "adopted inherited parent channel");
                    Ok(stream)
                }
            }
        }
    }

    /// Wrap an already-connected tokio Unix stream.
    #[cfg(unix)]
    pub fn from_unix(stream: tokio::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }
}

#[cfg(unix)]
fn adopt_descriptor(fd: i32) -> Result<IpcStream> {
    use std::os::fd::FromRawFd;

    ensure_socket_descriptor(fd)?;

    // SAFETY: `fd` was verified above to be an open socket. It is inherited from
    // the parent for the exclusive use of this process's channel, and ownership
    // moves into the returned stream, which closes it on drop.
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    std_stream.set_nonblocking(true)?;
    let stream = tokio::net::UnixStream::from_std(std_stream)?;
    Ok(IpcStream::from_unix(stream))
}

#[cfg(unix)]
fn ensure_socket_descriptor(fd: i32) -> Result<()> {
    let invalid = |reason: String| TransportError::InvalidDescriptor {
        var: crate::endpoint::CHANNEL_FD_ENV,
        value: fd.to_string(),
        reason,
    };

    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: `stat` points to writable storage of the size fstat expects and is
    // not retained past the call.
    let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(invalid(io::Error::last_os_error().to_string()));
    }
    // SAFETY: fstat returned 0, so it fully initialized the buffer.
    let stat = unsafe { stat.assume_init() };

    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(invalid("descriptor is not a socket".to_string()));
    }
    Ok(())
}

impl AsyncRead for IpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => f.debug_struct("IpcStream").field("type", &"unix").finish(),
        }
    }
}

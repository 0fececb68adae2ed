use crate::config::types::DeviceConfig;
use anyhow::Context;
use nix::libc;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::unix::pipe;
use tracing::debug;

/// The console device endpoints, opened once for the lifetime of the process.
///
/// Sessions never use these descriptors directly; each one gets duplicates
/// through [`ConsoleDevice::dup_stream`], so closing a session leaves the
/// device usable for the next client.
#[derive(Debug)]
pub struct ConsoleDevice {
    input: File,
    output: File,
    path: PathBuf,
}

impl ConsoleDevice {
    pub fn open(cfg: &DeviceConfig) -> anyhow::Result<Self> {
        let input = open_endpoint(&cfg.input)?;
        let output = match &cfg.output {
            Some(path) => open_endpoint(path)?,
            None => input
                .try_clone()
                .with_context(|| format!("Cannot duplicate {}", cfg.input.display()))?,
        };

        Ok(Self {
            input,
            output,
            path: cfg.input.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Duplicate the device descriptors into a stream owned by the caller.
    /// Must be called from within a tokio runtime.
    pub fn dup_stream(&self) -> io::Result<DeviceStream> {
        let rx = pipe::Receiver::from_file_unchecked(self.input.try_clone()?)?;
        let tx = pipe::Sender::from_file_unchecked(self.output.try_clone()?)?;
        debug!("duplicated console device descriptors");

        Ok(DeviceStream { rx, tx: Some(tx) })
    }
}

fn open_endpoint(path: &Path) -> anyhow::Result<File> {
    // Read-write so that opening a fifo never waits for the other end
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("Cannot open console device {}", path.display()))
}

/// Duplex stream over a duplicated pair of device descriptors.
///
/// Shutting down the write side closes the duplicated output descriptor.
pub struct DeviceStream {
    rx: pipe::Receiver,
    tx: Option<pipe::Sender>,
}

impl AsyncRead for DeviceStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.rx).poll_read(cx, buf)
    }
}

impl AsyncWrite for DeviceStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.tx.as_mut() {
            Some(tx) => Pin::new(tx).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.tx.as_mut() {
            Some(tx) => Pin::new(tx).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        self.tx = None;
        Poll::Ready(Ok(()))
    }
}

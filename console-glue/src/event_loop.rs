use crate::channel::ChannelOptions;
use crate::config::types::Config;
use crate::device::ConsoleDevice;
use crate::{create_listener, handle_client};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::select;
use tokio::sync::oneshot;
use tracing::{error, info, instrument, span, warn, Instrument, Level};

pub struct ConsoleServer {
    pub listen_path: PathBuf,
    pub shutdown_rx: oneshot::Receiver<()>,
    pub tasks_running: Arc<AtomicUsize>,
    device: Arc<ConsoleDevice>,
    options: ChannelOptions,
}

impl ConsoleServer {
    pub fn new(config: &Config) -> anyhow::Result<(oneshot::Sender<()>, Self)> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let device = ConsoleDevice::open(&config.device)?;

        Ok((
            shutdown_tx,
            Self {
                listen_path: config.listen.clone(),
                shutdown_rx,
                tasks_running: Arc::new(AtomicUsize::new(0)),
                device: Arc::new(device),
                options: ChannelOptions::from(config),
            },
        ))
    }

    #[instrument(level = "info", name = "console", skip_all, fields(listen = %self.listen_path.display(), device = %self.device.path().display()))]
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let listener = create_listener(&self.listen_path)?;

        info!("Console listening on unix:{}", self.listen_path.display());
        let _guard = scopeguard::guard(self.listen_path.clone(), |path| {
            if let Err(err) = nix::unistd::unlink(&path) {
                warn!("Cannot remove socket unix:{}: {}", path.display(), err);
            }
            info!("stopped");
        });

        let mut cnx_id: u64 = 0;
        loop {
            let (stream, _) = select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!("Asked to shutdown");
                    break;
                }

                ret = listener.accept() => {
                    match ret {
                        Ok(cnx) => cnx,
                        Err(err) => {
                            error!("error accepting new connections: {:?}", err);
                            continue;
                        }
                    }
                }
            };

            cnx_id += 1;
            let span = span!(Level::INFO, "cnx", id = cnx_id);

            let device = self.device.clone();
            let options = self.options;
            let task_counter = self.tasks_running.clone();
            let session = async move {
                task_counter.fetch_add(1, Ordering::Relaxed);
                let _guard = scopeguard::guard((), |_| {
                    task_counter.fetch_sub(1, Ordering::Relaxed);
                });

                if let Err(err) = handle_client(&device, stream, options).await {
                    warn!("{:?}", err);
                }
            }
            .instrument(span);

            tokio::spawn(session);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::unix::pipe;
    use tokio::net::UnixStream;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn relays_between_socket_client_and_console_device() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("console.in");
        let output = dir.path().join("console.out");
        mkfifo(&input, Mode::S_IRWXU).unwrap();
        mkfifo(&output, Mode::S_IRWXU).unwrap();
        let listen = dir.path().join("agent.sock");

        let config: Config = serde_yaml::from_str(&format!(
            "listen: {}\ndevice:\n  input: {}\n  output: {}\n",
            listen.display(),
            input.display(),
            output.display()
        ))
        .unwrap();

        let (shutdown_tx, mut server) = ConsoleServer::new(&config).unwrap();
        let tasks_running = server.tasks_running.clone();
        let server_task = tokio::spawn(async move { server.run().await });

        let mut guest_out = pipe::OpenOptions::new().open_sender(&input).unwrap();
        let mut guest_in = pipe::OpenOptions::new().open_receiver(&output).unwrap();

        let mut client = timeout(WAIT, async {
            loop {
                match UnixStream::connect(&listen).await {
                    Ok(client) => break client,
                    Err(_) => sleep(Duration::from_millis(10)).await,
                }
            }
        })
        .await
        .unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(WAIT, guest_in.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"ping");

        guest_out.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(tasks_running.load(Ordering::Relaxed), 1);

        // the client leaving ends the session
        drop(client);
        timeout(WAIT, async {
            while tasks_running.load(Ordering::Relaxed) != 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let _ = shutdown_tx.send(());
        timeout(WAIT, server_task).await.unwrap().unwrap().unwrap();
        assert!(!listen.exists());
    }

    #[tokio::test]
    async fn replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("console");
        mkfifo(&device, Mode::S_IRWXU).unwrap();
        let listen = dir.path().join("agent.sock");
        std::fs::write(&listen, b"stale").unwrap();

        let config: Config = serde_yaml::from_str(&format!(
            "listen: {}\ndevice:\n  input: {}\n",
            listen.display(),
            device.display()
        ))
        .unwrap();

        let (shutdown_tx, mut server) = ConsoleServer::new(&config).unwrap();
        let server_task = tokio::spawn(async move { server.run().await });

        let client = timeout(WAIT, async {
            loop {
                match UnixStream::connect(&listen).await {
                    Ok(client) => break client,
                    Err(_) => sleep(Duration::from_millis(10)).await,
                }
            }
        })
        .await
        .unwrap();
        drop(client);

        let _ = shutdown_tx.send(());
        timeout(WAIT, server_task).await.unwrap().unwrap().unwrap();
    }
}

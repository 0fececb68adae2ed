#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod channel;
mod config;
mod device;
mod event_loop;
mod splice;

use anyhow::Context;
use clap::Parser;
use nix::errno::Errno;
use socket2::{Domain, SockAddr};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::channel::{Channel, ChannelOptions};
use crate::device::ConsoleDevice;
use crate::event_loop::ConsoleServer;
use crate::splice::matched_pair;

use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::{pin, select};
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

/// Relay a unix socket to a virtual console device
#[derive(clap::Parser, Debug)]
#[command(author, version, about, verbatim_doc_comment, long_about = None)]
struct CmdLine {
    /// Path to the config file
    #[arg(short = 'c', long, default_value = "console.yaml")]
    config: PathBuf,

    /// Control the log verbosity. i.e: TRACE, DEBUG, INFO, WARN, ERROR, OFF
    /// for more details: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#example-syntax
    #[arg(
        long,
        global = true,
        value_name = "LOG_LEVEL",
        verbatim_doc_comment,
        env = "RUST_LOG",
        default_value = "INFO"
    )]
    log_lvl: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd_line: CmdLine = CmdLine::parse();

    tracing_subscriber::fmt()
        .with_ansi(true)
        .with_env_filter(
            EnvFilter::builder()
                .parse(&cmd_line.log_lvl)
                .with_context(|| format!("Invalid log filter {}", cmd_line.log_lvl))?,
        )
        .init();

    let config = config::parse_config(&cmd_line.config)?;
    let (shutdown_tx, mut server) = ConsoleServer::new(&config)?;
    let task_counter = server.tasks_running.clone();
    let server_task = tokio::spawn(async move {
        if let Err(err) = server.run().await {
            error!("Console server exited abruptly: {:?}", err);
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    select! {
        biased;
        _ = sigterm.recv() => info!("Receive SIGTERM. Closing console"),
        _ = sigint.recv() => info!("Receive SIGINT. Closing console"),
    }

    let _ = shutdown_tx.send(());
    let _ = server_task.await;

    // Wait to drain all the sessions
    let grace = tokio::time::sleep(config.shutdown_grace);
    pin!(grace);
    loop {
        let nb_task = task_counter.load(Ordering::Relaxed);
        if nb_task == 0 {
            break;
        }

        info!("Waiting for {} cnx to shutdown", nb_task);
        select! {
            biased;

            _ = sigint.recv() => {
                info!("Received double SIGINT. Exiting immediately");
                break;
            }
            _ = &mut grace => {
                info!("Grace period of {:?} elapsed. Exiting with {} cnx open", config.shutdown_grace, nb_task);
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }

    Ok(())
}

fn create_listener(path: &Path) -> anyhow::Result<UnixListener> {
    match nix::unistd::unlink(path) {
        Ok(()) | Err(Errno::ENOENT) => {}
        Err(err) => {
            return Err(err).with_context(|| format!("Cannot remove stale socket {}", path.display()))
        }
    }

    let sock = socket2::Socket::new(Domain::UNIX, socket2::Type::STREAM, None)?;
    sock.set_nonblocking(true)?;
    sock.bind(&SockAddr::unix(path)?)
        .with_context(|| format!("Cannot bind console on unix:{}", path.display()))?;
    sock.listen(4096)?;

    let listener = std::os::unix::net::UnixListener::from(OwnedFd::from(sock));
    Ok(UnixListener::from_std(listener)?)
}

async fn handle_client(
    device: &ConsoleDevice,
    stream: UnixStream,
    options: ChannelOptions,
) -> anyhow::Result<()> {
    info!("handling new connection");
    let _guard = scopeguard::guard((), |_| {
        info!("connections closed");
    });

    let device_stream = device
        .dup_stream()
        .with_context(|| format!("Cannot duplicate console device {}", device.path().display()))?;

    // Both units are attached before either side starts reading
    let (ours, theirs) = matched_pair();
    let device_channel = Channel::new(ours, options);
    let client_channel = Channel::new(theirs, options);

    tokio::join!(
        device_channel
            .run(device_stream)
            .instrument(info_span!("device")),
        client_channel
            .run(stream)
            .instrument(info_span!("client")),
    );

    Ok(())
}

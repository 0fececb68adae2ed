use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::{pin, select};
use tracing::{debug, trace, warn};

use crate::splice::{ChannelAdapter, SpliceUnit};

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// Above this many queued outbound bytes the channel reports itself unwritable.
    pub high_watermark: usize,
    /// Writable again once queued outbound bytes drop to this.
    pub low_watermark: usize,
    pub read_buffer_size: usize,
    pub max_reads_per_batch: usize,
    /// Whether end of input only half-closes the partner or closes this connection.
    pub half_close: bool,
    pub close_linger: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            high_watermark: 64 * 1024,
            low_watermark: 32 * 1024,
            read_buffer_size: 8 * 1024,
            max_reads_per_batch: 4,
            half_close: false,
            close_linger: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
enum Command {
    Write(Bytes),
    Flush,
    CloseOutput,
    Close,
    Read,
    StopReading,
}

#[derive(Debug)]
struct WriteBudget {
    buffered: usize,
    writable: bool,
}

/// What the partner unit holds: every operation is forwarded to the task
/// running the connection, except the writability check.
struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
    budget: Arc<Mutex<WriteBudget>>,
    high_watermark: usize,
}

impl ChannelHandle {
    fn send(&self, cmd: Command) {
        // receiver gone: channel already finished
        let _ = self.commands.send(cmd);
    }
}

impl ChannelAdapter for ChannelHandle {
    fn write(&self, data: Bytes) {
        {
            let mut budget = self.budget.lock();
            budget.buffered += data.len();
            if budget.writable && budget.buffered > self.high_watermark {
                trace!("channel became unwritable with {} bytes queued", budget.buffered);
                budget.writable = false;
            }
        }
        self.send(Command::Write(data));
    }

    fn flush(&self) {
        self.send(Command::Flush);
    }

    fn close_output(&self) {
        self.send(Command::CloseOutput);
    }

    fn close(&self) {
        self.send(Command::Close);
    }

    fn read(&self) {
        self.send(Command::Read);
    }

    fn stop_reading(&self) {
        self.send(Command::StopReading);
    }

    fn is_writable(&self) -> bool {
        self.budget.lock().writable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Open,
    Closing,
    Closed,
}

#[derive(Default)]
struct Outbound {
    unflushed: VecDeque<Bytes>,
    wire: VecDeque<Bytes>,
}

impl Outbound {
    fn flush(&mut self) {
        self.wire.extend(self.unflushed.drain(..));
    }

    fn consume(&mut self, n: usize) {
        if let Some(front) = self.wire.front_mut() {
            if n >= front.len() {
                self.wire.pop_front();
            } else {
                front.advance(n);
            }
        }
    }

    fn len(&self) -> usize {
        self.unflushed
            .iter()
            .chain(self.wire.iter())
            .map(Bytes::len)
            .sum()
    }
}

enum ReadOutcome {
    Open,
    Eof,
    Failed(io::Error),
}

/// A connection driven on behalf of a [`SpliceUnit`].
pub struct Channel {
    unit: SpliceUnit,
    commands: mpsc::UnboundedReceiver<Command>,
    budget: Arc<Mutex<WriteBudget>>,
    options: ChannelOptions,
}

impl Channel {
    /// Attach `unit` to a new channel. Nothing is read or written before [`run`](Self::run).
    pub fn new(unit: SpliceUnit, options: ChannelOptions) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let budget = Arc::new(Mutex::new(WriteBudget {
            buffered: 0,
            writable: true,
        }));

        unit.attach(Arc::new(ChannelHandle {
            commands: commands_tx,
            budget: budget.clone(),
            high_watermark: options.high_watermark,
        }));

        Self {
            unit,
            commands,
            budget,
            options,
        }
    }

    /// Drive `stream` until the connection is closed.
    ///
    /// When this returns, or the future is dropped, the unit is told the
    /// connection went inactive and is detached.
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite,
    {
        let _guard = scopeguard::guard(self.unit.clone(), |unit| {
            debug!("channel closed: {:?}", unit);
            unit.channel_inactive();
            unit.detach();
        });

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = vec![0u8; self.options.read_buffer_size];
        let mut outbound = Outbound::default();
        let mut reading = false;
        let mut input_open = true;
        let mut output = Output::Open;
        let mut closing = false;
        let linger = tokio::time::sleep(self.options.close_linger);
        pin!(linger);

        self.unit.read();

        loop {
            if output == Output::Closing && outbound.wire.is_empty() {
                trace!("shutting down output");
                if let Err(err) = writer.shutdown().await {
                    debug!("error while shutting down output: {:?}", err);
                }
                output = Output::Closed;
            }
            if closing && outbound.wire.is_empty() {
                if output != Output::Closed {
                    if let Err(err) = writer.shutdown().await {
                        debug!("error while shutting down output: {:?}", err);
                    }
                }
                break;
            }
            if !input_open && output == Output::Closed {
                break;
            }

            select! {
                biased;

                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    match cmd {
                        Command::Write(data) => {
                            if output == Output::Open && !closing {
                                outbound.unflushed.push_back(data);
                            } else {
                                self.release(data.len());
                            }
                        }
                        Command::Flush => outbound.flush(),
                        Command::CloseOutput => {
                            if output == Output::Open && !closing {
                                outbound.flush();
                                output = Output::Closing;
                            }
                        }
                        Command::Close => {
                            if !closing {
                                debug!("closing");
                                closing = true;
                                reading = false;
                                outbound.flush();
                                linger.as_mut().reset(Instant::now() + self.options.close_linger);
                            }
                        }
                        Command::Read => reading = input_open && !closing,
                        Command::StopReading => reading = false,
                    }
                }

                ret = write_front(&mut writer, &outbound.wire), if !outbound.wire.is_empty() => {
                    match ret {
                        Ok(0) => {
                            self.unit.error_caught(&io::Error::from(io::ErrorKind::WriteZero));
                            break;
                        }
                        Ok(n) => {
                            outbound.consume(n);
                            self.release(n);
                        }
                        Err(err) => {
                            self.unit.error_caught(&err);
                            break;
                        }
                    }
                }

                ret = reader.read(&mut buf), if reading => {
                    reading = false;
                    match self.read_batch(ret, &mut reader, &mut buf) {
                        ReadOutcome::Open => {
                            self.unit.read();
                            if self.unit.pending_read() {
                                trace!("partner is not writable, read deferred");
                            }
                        }
                        ReadOutcome::Eof => {
                            debug!("read EOF");
                            input_open = false;
                            if self.options.half_close {
                                self.unit.input_closed();
                            } else if !closing {
                                closing = true;
                                outbound.flush();
                                linger.as_mut().reset(Instant::now() + self.options.close_linger);
                            }
                        }
                        ReadOutcome::Failed(err) => {
                            self.unit.error_caught(&err);
                            break;
                        }
                    }
                }

                _ = &mut linger, if closing => {
                    warn!(
                        "close linger of {:?} elapsed, dropping {} unsent bytes",
                        self.options.close_linger,
                        outbound.len()
                    );
                    break;
                }
            }
        }
    }

    /// Deliver the chunk already read plus whatever else is immediately
    /// available, then mark the end of the batch.
    fn read_batch<R>(&self, first: io::Result<usize>, reader: &mut R, buf: &mut [u8]) -> ReadOutcome
    where
        R: AsyncRead + Unpin,
    {
        let mut n = match first {
            Ok(0) => return ReadOutcome::Eof,
            Ok(n) => n,
            Err(err) => return ReadOutcome::Failed(err),
        };

        let mut reads = 1;
        let outcome = loop {
            self.unit.channel_read(Bytes::copy_from_slice(&buf[..n]));
            if reads >= self.options.max_reads_per_batch {
                break ReadOutcome::Open;
            }

            match reader.read(buf).now_or_never() {
                None => break ReadOutcome::Open,
                Some(Ok(0)) => break ReadOutcome::Eof,
                Some(Ok(next)) => {
                    n = next;
                    reads += 1;
                }
                Some(Err(err)) => break ReadOutcome::Failed(err),
            }
        };
        trace!("read batch of {} reads", reads);
        self.unit.channel_read_complete();

        outcome
    }

    fn release(&self, n: usize) {
        let became_writable = {
            let mut budget = self.budget.lock();
            budget.buffered = budget.buffered.saturating_sub(n);
            if !budget.writable && budget.buffered <= self.options.low_watermark {
                budget.writable = true;
                true
            } else {
                false
            }
        };

        if became_writable {
            trace!("channel writable again");
            self.unit.writability_changed();
        }
    }
}

async fn write_front<W>(writer: &mut W, wire: &VecDeque<Bytes>) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    match wire.front() {
        Some(chunk) => writer.write(chunk).await,
        None => std::future::pending().await,
    }
}

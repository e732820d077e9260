//! NDT server-to-client (S2C) throughput test.
//!
//! The data channel is drained by a background task that counts every
//! message plus its WebSocket framing overhead. The first `TEST_MSG` on the
//! control channel marks the end of the transfer; later ones carry web100
//! variables until `TEST_FINALIZE`.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::coordinator::{Context, DataTask, Progress, Step, throughput_kbps};
use crate::error::{NdtError, Result};
use crate::message::{Message, MessageType, TestKind};
use crate::params;
use crate::results::{S2C_RATE, S2C_SERVER_RATE, StateChange};
use crate::transport::{Channel, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForTestPrepare,
    WaitForTestStart,
    WaitForFirstTestMsg,
    WaitForTestMsgOrTestFinish,
    Done,
}

/// Counters published by the receive task.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct Received {
    /// Payload plus framing bytes seen so far.
    pub bytes: u64,
    /// When the server closed the data channel.
    pub end: Option<Instant>,
}

/// Bytes a WebSocket frame of `payload` bytes occupies, header included.
pub(crate) fn ws_frame_len(payload: usize) -> u64 {
    let header = if payload < 126 {
        2
    } else if payload < 65536 {
        4
    } else {
        10
    };
    (header + payload) as u64
}

pub(crate) struct DownloadTest {
    state: State,
    start: Option<Instant>,
    counters: Option<watch::Receiver<Received>>,
    receiver: Option<DataTask<()>>,
    client_rate: Option<f64>,
}

impl DownloadTest {
    pub(crate) fn new() -> Self {
        DownloadTest {
            state: State::WaitForTestPrepare,
            start: None,
            counters: None,
            receiver: None,
            client_rate: None,
        }
    }

    pub(crate) async fn handle<C: Connector>(
        &mut self,
        msg: &Message,
        ctx: &mut Context<'_, C>,
    ) -> Result<Step> {
        debug!(kind = %msg.kind, state = ?self.state, "s2c message");
        match (self.state, msg.kind) {
            (State::WaitForTestPrepare, MessageType::TestPrepare) => {
                ctx.notify(StateChange::Preparing(TestKind::S2c));
                let channel = ctx
                    .open_data_channel(msg.msg(), params::S2C_SUBPROTOCOL)
                    .await?;
                let start = Instant::now();
                debug!("opened S2C data channel");

                let (tx, rx) = watch::channel(Received::default());
                self.receiver = Some(DataTask::spawn(receive_loop(
                    channel,
                    start,
                    ctx.config.progress_interval(),
                    ctx.progress_sender(),
                    tx,
                )));
                self.start = Some(start);
                self.counters = Some(rx);
                self.state = State::WaitForTestStart;
            }
            (State::WaitForTestStart, MessageType::TestStart) => {
                ctx.notify(StateChange::Running(TestKind::S2c));
                self.state = State::WaitForFirstTestMsg;
            }
            (State::WaitForFirstTestMsg, MessageType::TestMsg) => {
                // The server stopped sending; measure what made it here.
                let received = self
                    .counters
                    .as_ref()
                    .map(|c| *c.borrow())
                    .unwrap_or_default();
                let start = self
                    .start
                    .ok_or_else(|| NdtError::violation("S2C data channel never opened"))?;
                let end = received.end.unwrap_or_else(Instant::now);
                let rate = throughput_kbps(received.bytes, end.saturating_duration_since(start));

                let server_rate = msg
                    .field("ThroughputValue")
                    .or_else(|| msg.msg().split_whitespace().next());
                info!(
                    rate_kbps = rate,
                    server_rate = server_rate.unwrap_or("-"),
                    bytes = received.bytes,
                    "measured download rate"
                );
                ctx.results.insert(S2C_RATE, rate);
                if let Some(server_rate) = server_rate {
                    ctx.results.insert(S2C_SERVER_RATE, server_rate);
                }
                self.client_rate = Some(rate);

                ctx.send(MessageType::TestMsg, &rate.to_string()).await?;
                self.state = State::WaitForTestMsgOrTestFinish;
            }
            (State::WaitForTestMsgOrTestFinish, MessageType::TestMsg) => {
                if !ctx.results.merge_variable(msg.msg()) {
                    warn!(body = msg.msg(), "skipping web100 variable without a separator");
                }
            }
            (State::WaitForTestMsgOrTestFinish, MessageType::TestFinalize) => {
                ctx.flush_progress()?;
                if let Some(rate) = self.client_rate {
                    ctx.results.insert(S2C_RATE, rate);
                }
                // stops the receive task and drops the data channel
                self.receiver = None;
                debug!(body = msg.msg(), "S2C test is complete");

                ctx.notify(StateChange::Finished(TestKind::S2c));
                self.state = State::Done;
                return Ok(Step::Done);
            }
            (state, kind) => {
                return Err(NdtError::violation(format!(
                    "S2C: unexpected message {kind} in state {state:?}"
                )));
            }
        }
        Ok(Step::Continue)
    }
}

async fn receive_loop<Ch: Channel>(
    mut channel: Ch,
    start: Instant,
    interval: Option<Duration>,
    progress: mpsc::UnboundedSender<Progress>,
    counters: watch::Sender<Received>,
) {
    let mut next_update = interval.map(|every| start + every);
    let mut bytes: u64 = 0;

    while let Some(frame) = channel.recv().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                let _ = progress.send(Progress::Failed {
                    test: TestKind::S2c,
                    reason: e.to_string(),
                });
                return;
            }
        };
        bytes += ws_frame_len(frame.len());
        counters.send_modify(|c| c.bytes = bytes);

        if let (Some(every), Some(at)) = (interval, next_update)
            && Instant::now() > at
        {
            let rate = throughput_kbps(bytes, start.elapsed());
            let _ = progress.send(Progress::Interval {
                test: TestKind::S2c,
                rate_kbps: rate,
            });
            next_update = Some(at + every);
        }
    }

    counters.send_modify(|c| c.end = Some(Instant::now()));
    debug!(bytes, "S2C data channel closed by server");
}

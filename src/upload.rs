//! NDT client-to-server (C2S) throughput test.
//!
//! After `TEST_START` the client keeps the data channel busy for
//! [`params::UPLOAD_DURATION`], refilling it only while fewer than
//! [`params::SEND_LOW_WATER_MARK`] bytes are still queued. The server measures
//! what arrives and reports the authoritative rate in `TEST_MSG`.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::coordinator::{Context, DataTask, Progress, Step, throughput_kbps};
use crate::error::{NdtError, Result};
use crate::message::{Message, MessageType, TestKind};
use crate::params;
use crate::results::{C2S_CLIENT_RATE, C2S_RATE, StateChange};
use crate::transport::{Channel, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForTestPrepare,
    WaitForTestStart,
    WaitForTestMsg,
    WaitForTestFinalize,
    Done,
}

/// What the send loop put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct Transfer {
    pub bytes: u64,
    pub elapsed: Duration,
}

pub(crate) struct UploadTest<Ch> {
    state: State,
    channel: Option<Ch>,
    sender: Option<DataTask<Result<Transfer>>>,
    server_rate: Option<f64>,
}

impl<Ch: Channel> UploadTest<Ch> {
    pub(crate) fn new() -> Self {
        UploadTest {
            state: State::WaitForTestPrepare,
            channel: None,
            sender: None,
            server_rate: None,
        }
    }

    pub(crate) async fn handle<C>(&mut self, msg: &Message, ctx: &mut Context<'_, C>) -> Result<Step>
    where
        C: Connector<Channel = Ch>,
    {
        debug!(kind = %msg.kind, state = ?self.state, "c2s message");
        match (self.state, msg.kind) {
            (State::WaitForTestPrepare, MessageType::TestPrepare) => {
                ctx.notify(StateChange::Preparing(TestKind::C2s));
                let channel = ctx
                    .open_data_channel(msg.msg(), params::C2S_SUBPROTOCOL)
                    .await?;
                self.channel = Some(channel);
                self.state = State::WaitForTestStart;
            }
            (State::WaitForTestStart, MessageType::TestStart) => {
                ctx.notify(StateChange::Running(TestKind::C2s));
                let channel = self
                    .channel
                    .take()
                    .ok_or_else(|| NdtError::violation("C2S data channel is not open"))?;
                self.sender = Some(DataTask::spawn(send_loop(
                    channel,
                    ctx.config.progress_interval(),
                    ctx.progress_sender(),
                )));
                self.state = State::WaitForTestMsg;
            }
            (State::WaitForTestMsg, MessageType::TestMsg) => {
                match msg.msg().trim().parse::<f64>() {
                    Ok(rate) => {
                        info!(rate_kbps = rate, "C2S rate calculated by server");
                        ctx.results.insert(C2S_RATE, rate);
                        self.server_rate = Some(rate);
                    }
                    Err(_) => {
                        warn!(body = msg.msg(), "server sent a non-numeric C2S rate");
                        ctx.results.insert(C2S_RATE, msg.msg());
                    }
                }
                self.state = State::WaitForTestFinalize;
            }
            (State::WaitForTestFinalize, MessageType::TestFinalize) => {
                let transfer = match self.sender.as_mut() {
                    Some(sender) => sender.join().await??,
                    None => Transfer::default(),
                };
                self.sender = None;
                if transfer.bytes == 0 {
                    return Err(NdtError::violation("C2S: no data transmitted"));
                }

                ctx.flush_progress()?;
                let client_rate = throughput_kbps(transfer.bytes, transfer.elapsed);
                info!(rate_kbps = client_rate, bytes = transfer.bytes, "measured upload rate");
                ctx.results.insert(C2S_CLIENT_RATE, client_rate);
                if let Some(rate) = self.server_rate {
                    ctx.results.insert(C2S_RATE, rate);
                }

                ctx.notify(StateChange::Finished(TestKind::C2s));
                self.state = State::Done;
                return Ok(Step::Done);
            }
            (state, kind) => {
                return Err(NdtError::violation(format!(
                    "C2S: unexpected message {kind} in state {state:?}"
                )));
            }
        }
        Ok(Step::Continue)
    }
}

/// Printable ASCII filler; stride 101 avoids a short repeating pattern.
pub(crate) fn printable_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| 32 + ((i * 101) % (126 - 32)) as u8).collect()
}

async fn send_loop<Ch: Channel>(
    mut channel: Ch,
    interval: Option<Duration>,
    progress: mpsc::UnboundedSender<Progress>,
) -> Result<Transfer> {
    let payload = Bytes::from(printable_payload(params::SEND_BUFFER_SIZE));
    let start = Instant::now();
    let deadline = start + params::UPLOAD_DURATION;
    let mut next_update = interval.map(|every| start + every);
    let mut total_sent: u64 = 0;

    while Instant::now() < deadline {
        // Only refill when the channel has drained below the low-water mark.
        if channel.buffered_amount() < params::SEND_LOW_WATER_MARK {
            if let Err(e) = channel.send(payload.clone()).await {
                let _ = progress.send(Progress::Failed {
                    test: TestKind::C2s,
                    reason: e.to_string(),
                });
                return Err(e);
            }
            total_sent += payload.len() as u64;
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(params::SEND_THROTTLE_POLL).await;
        }

        if let (Some(every), Some(at)) = (interval, next_update)
            && Instant::now() >= at
        {
            let unsent = channel.buffered_amount() as u64;
            let rate = throughput_kbps(total_sent.saturating_sub(unsent), start.elapsed());
            let _ = progress.send(Progress::Interval {
                test: TestKind::C2s,
                rate_kbps: rate,
            });
            next_update = Some(at + every);
        }
    }

    let elapsed = start.elapsed();
    if let Err(e) = channel.close().await {
        debug!(error = %e, "closing C2S data channel failed");
    }
    debug!(bytes = total_sent, ?elapsed, "C2S send loop finished");
    Ok(Transfer {
        bytes: total_sent,
        elapsed,
    })
}

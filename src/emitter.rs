//! Output formatting for test events.
//!
//! The [`Emitter`] trait defines callbacks for each stage of a test run.
//! Two implementations are provided:
//! - [`HumanReadableEmitter`]: live progress and a formatted summary on a terminal.
//! - [`JsonEmitter`]: one JSON object per line, suitable for machine consumption.

use std::io::Write;

use serde::Serialize;

use crate::error::Result;
use crate::message::TestKind;
use crate::results::{Results, StateChange, rate_key};
use crate::summary::Summary;

#[derive(Serialize)]
#[serde(tag = "type")]
enum Event<'a> {
    Starting {
        server: &'a str,
    },
    StateChange {
        state: StateChange,
        #[serde(skip_serializing_if = "Option::is_none")]
        test: Option<TestKind>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rate_kbps: Option<f64>,
    },
    Error {
        error: &'a str,
    },
    Results {
        results: &'a Results,
    },
    Summary {
        summary: &'a Summary,
    },
}

/// Callbacks for NDT test lifecycle events.
///
/// A run calls `on_start` once, then `on_state_change` for every milestone,
/// then exactly one of `on_finish` or `on_error`. Errors returned here are
/// logged and never affect the run.
pub trait Emitter: Send {
    /// Called before the control channel is opened.
    fn on_start(&mut self, server: &str) -> Result<()>;
    /// Called for every milestone, with the results collected so far.
    fn on_state_change(&mut self, change: StateChange, results: &Results) -> Result<()>;
    /// Called once after every scheduled test completed.
    fn on_finish(&mut self, results: &Results) -> Result<()>;
    /// Called once when the run fails.
    fn on_error(&mut self, err: &str) -> Result<()>;
}

impl<E: Emitter + ?Sized> Emitter for Box<E> {
    fn on_start(&mut self, server: &str) -> Result<()> {
        (**self).on_start(server)
    }

    fn on_state_change(&mut self, change: StateChange, results: &Results) -> Result<()> {
        (**self).on_state_change(change, results)
    }

    fn on_finish(&mut self, results: &Results) -> Result<()> {
        (**self).on_finish(results)
    }

    fn on_error(&mut self, err: &str) -> Result<()> {
        (**self).on_error(err)
    }
}

/// Emits human-readable progress and results to a writer.
pub struct HumanReadableEmitter<W: Write> {
    out: W,
    server: String,
    progress: bool,
}

impl<W: Write> HumanReadableEmitter<W> {
    /// Create a new emitter writing to `out`.
    pub fn new(out: W) -> Self {
        HumanReadableEmitter {
            out,
            server: String::new(),
            progress: true,
        }
    }

    /// Print only the summary and errors.
    pub fn quiet(mut self) -> Self {
        self.progress = false;
        self
    }

    fn print_summary(&mut self, s: &Summary) -> Result<()> {
        writeln!(self.out, "\nTest results\n")?;
        writeln!(self.out, "{:>10}: {}", "Server", s.server)?;

        if let Some(dl) = &s.download {
            writeln!(self.out, "\n{:>22}", "Download")?;
            writeln!(self.out, "{:>15}: {:>7.1} Mbit/s", "Throughput", dl.throughput_mbps)?;
            if let Some(server) = dl.peer_throughput_mbps {
                writeln!(self.out, "{:>15}: {:>7.1} Mbit/s", "Server saw", server)?;
            }
        }

        if let Some(ul) = &s.upload {
            writeln!(self.out, "\n{:>20}", "Upload")?;
            writeln!(self.out, "{:>15}: {:>7.1} Mbit/s", "Throughput", ul.throughput_mbps)?;
            if let Some(client) = ul.peer_throughput_mbps {
                writeln!(self.out, "{:>15}: {:>7.1} Mbit/s", "Client sent", client)?;
            }
        }

        if let (Some(min), Some(max)) = (s.min_rtt_ms, s.max_rtt_ms) {
            writeln!(self.out, "\n{:>15}: {:.1} / {:.1} ms", "RTT min/max", min, max)?;
        }
        if let Some(avg) = s.avg_rtt_ms {
            writeln!(self.out, "{:>15}: {:.1} ms", "RTT average", avg)?;
        }
        if let Some(jitter) = s.jitter_ms {
            writeln!(self.out, "{:>15}: {:.1} ms", "Jitter", jitter)?;
        }
        if let Some(loss) = s.packet_loss_pct {
            writeln!(self.out, "{:>15}: {:.2} %", "Packet loss", loss)?;
        }
        if s.duplex_mismatch == Some(true) {
            writeln!(self.out, "\nA duplex mismatch condition was detected.")?;
        }
        if s.cable_fault == Some(true) {
            writeln!(self.out, "The test detected a cable fault.")?;
        }

        Ok(())
    }
}

impl<W: Write + Send> Emitter for HumanReadableEmitter<W> {
    fn on_start(&mut self, server: &str) -> Result<()> {
        self.server = server.to_owned();
        Ok(())
    }

    fn on_state_change(&mut self, change: StateChange, results: &Results) -> Result<()> {
        if !self.progress {
            return Ok(());
        }
        match change {
            StateChange::Preparing(test) => write!(self.out, "\rstarting {test}")?,
            StateChange::Running(test) => {
                write!(self.out, "\r{test} in progress with {}\n", self.server)?
            }
            StateChange::Interval(test) => {
                if let Some(kbps) = results.number(rate_key(test)) {
                    write!(self.out, "\rAvg. speed: {:>7.1} Mbit/s", kbps / 1000.0)?;
                }
            }
            StateChange::Finished(test) => write!(self.out, "\n{test}: complete\n")?,
            StateChange::FinishedAll => {}
        }
        self.out.flush()?;
        Ok(())
    }

    fn on_finish(&mut self, results: &Results) -> Result<()> {
        let summary = Summary::from_results(self.server.as_str(), results);
        self.print_summary(&summary)
    }

    fn on_error(&mut self, err: &str) -> Result<()> {
        write!(self.out, "\ntest failed: {err}\n")?;
        Ok(())
    }
}

/// Emits one JSON object per line for each event.
pub struct JsonEmitter<W: Write> {
    out: W,
    server: String,
}

impl<W: Write> JsonEmitter<W> {
    /// Create a new JSON emitter writing to `out`.
    pub fn new(out: W) -> Self {
        JsonEmitter {
            out,
            server: String::new(),
        }
    }

    fn emit(&mut self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event)?;
        writeln!(self.out, "{}", json)?;
        Ok(())
    }
}

impl<W: Write + Send> Emitter for JsonEmitter<W> {
    fn on_start(&mut self, server: &str) -> Result<()> {
        self.server = server.to_owned();
        self.emit(&Event::Starting { server })
    }

    fn on_state_change(&mut self, change: StateChange, results: &Results) -> Result<()> {
        let rate_kbps = match change {
            StateChange::Interval(test) => results.number(rate_key(test)),
            _ => None,
        };
        self.emit(&Event::StateChange {
            state: change,
            test: change.test(),
            rate_kbps,
        })
    }

    fn on_finish(&mut self, results: &Results) -> Result<()> {
        self.emit(&Event::Results { results })?;
        let summary = Summary::from_results(self.server.as_str(), results);
        self.emit(&Event::Summary { summary: &summary })
    }

    fn on_error(&mut self, err: &str) -> Result<()> {
        self.emit(&Event::Error { error: err })
    }
}

use serde::Serialize;

use crate::results::{C2S_CLIENT_RATE, C2S_RATE, Results, S2C_RATE, S2C_SERVER_RATE};

/// Throughput of one direction, in Mbit/s.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtestSummary {
    /// The rate the protocol treats as authoritative.
    pub throughput_mbps: f64,
    /// The other side's figure for the same transfer, when known.
    pub peer_throughput_mbps: Option<f64>,
}

/// Condensed view of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub server: String,
    pub download: Option<SubtestSummary>,
    pub upload: Option<SubtestSummary>,
    pub min_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<f64>,
    pub avg_rtt_ms: Option<f64>,
    /// The server's `Jitter`, or the RTT spread when it sent none.
    pub jitter_ms: Option<f64>,
    /// Share of packets lost during the test, in percent.
    pub packet_loss_pct: Option<f64>,
    pub duplex_mismatch: Option<bool>,
    pub cable_fault: Option<bool>,
    /// Number of variables the run collected.
    pub variables: usize,
}

fn mbps(results: &Results, key: &str) -> Option<f64> {
    results.number(key).map(|kbps| kbps / 1000.0)
}

fn flag(results: &Results, key: &str) -> Option<bool> {
    results.text(key).map(|value| value.trim() == "yes")
}

impl Summary {
    /// Summarize `results` collected from `server`.
    pub fn from_results(server: impl Into<String>, results: &Results) -> Self {
        let download = mbps(results, S2C_RATE).map(|throughput_mbps| SubtestSummary {
            throughput_mbps,
            peer_throughput_mbps: mbps(results, S2C_SERVER_RATE),
        });
        let upload = mbps(results, C2S_RATE).map(|throughput_mbps| SubtestSummary {
            throughput_mbps,
            peer_throughput_mbps: mbps(results, C2S_CLIENT_RATE),
        });

        let min_rtt_ms = results.number("MinRTT");
        let max_rtt_ms = results.number("MaxRTT");
        let jitter_ms = results.number("Jitter").or(match (min_rtt_ms, max_rtt_ms) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        });

        Summary {
            server: server.into(),
            download,
            upload,
            min_rtt_ms,
            max_rtt_ms,
            avg_rtt_ms: results.number("avgrtt"),
            jitter_ms,
            packet_loss_pct: results.number("loss").map(|loss| loss * 100.0),
            duplex_mismatch: flag(results, "mismatch"),
            cable_fault: flag(results, "bad_cable"),
            variables: results.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_from_results() {
        let mut results = Results::new();
        results.insert(C2S_RATE, 8000.0);
        results.insert(C2S_CLIENT_RATE, 9500.0);
        results.insert(S2C_SERVER_RATE, "41000.5");
        results.merge_lines("MinRTT: 5\nMaxRTT: 20");

        let summary = Summary::from_results("ndt.example.net", &results);

        assert_eq!(summary.server, "ndt.example.net");
        let upload = summary.upload.unwrap();
        assert_eq!(upload.throughput_mbps, 8.0);
        assert_eq!(upload.peer_throughput_mbps, Some(9.5));
        // no client-side download rate, so no download summary
        assert!(summary.download.is_none());
        assert_eq!(summary.min_rtt_ms, Some(5.0));
        assert_eq!(summary.max_rtt_ms, Some(20.0));
        // no Jitter variable: fall back to the RTT spread
        assert_eq!(summary.jitter_ms, Some(15.0));
        assert_eq!(summary.avg_rtt_ms, None);
        assert_eq!(summary.packet_loss_pct, None);
        assert_eq!(summary.duplex_mismatch, None);
        assert_eq!(summary.variables, 5);
    }

    #[test]
    fn summary_reads_link_quality_variables() {
        let mut results = Results::new();
        results.merge_lines(
            "MinRTT: 5\nMaxRTT: 20\navgrtt: 12.5\nJitter: 7\nloss: 0.0125\nmismatch: yes\nbad_cable: no",
        );

        let summary = Summary::from_results("ndt.example.net", &results);

        assert_eq!(summary.avg_rtt_ms, Some(12.5));
        assert_eq!(summary.jitter_ms, Some(7.0));
        assert_eq!(summary.packet_loss_pct, Some(1.25));
        assert_eq!(summary.duplex_mismatch, Some(true));
        assert_eq!(summary.cable_fault, Some(false));
        assert_eq!(summary.variables, 7);
    }
}

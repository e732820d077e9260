//! Protocol constants and tuning parameters.

use std::time::Duration;

/// WebSocket subprotocol of the control channel.
pub const CONTROL_SUBPROTOCOL: &str = "ndt";

/// WebSocket subprotocol of the upload data channel.
pub const C2S_SUBPROTOCOL: &str = "c2s";

/// WebSocket subprotocol of the download data channel.
pub const S2C_SUBPROTOCOL: &str = "s2c";

/// Default port of the control channel.
pub const DEFAULT_PORT: u16 = 3001;

/// Default URL path used for every channel.
pub const DEFAULT_PATH: &str = "/ndt_protocol";

/// Protocol version announced in the extended login message.
pub const CLIENT_PROTOCOL_VERSION: &str = "v3.5.5";

/// Size of the message header: type byte plus big-endian body length.
pub const HEADER_LEN: usize = 3;

/// `SRV_QUEUE` body the server sends as a keepalive while the client waits.
pub const SRV_QUEUE_HEARTBEAT: &str = "9990";

/// `SRV_QUEUE` body announcing that the server gave up on the test.
pub const SRV_QUEUE_SERVER_FAULT: &str = "9977";

/// How long the upload test keeps the data channel busy.
pub const UPLOAD_DURATION: Duration = Duration::from_secs(10);

/// Size of the buffer written on each send of the upload loop (1 MiB).
pub const SEND_BUFFER_SIZE: usize = 1 << 20;

/// The upload loop only refills the channel when fewer bytes than this are
/// still waiting to be written.
pub const SEND_LOW_WATER_MARK: usize = 8192;

/// Pause of the upload loop while the channel is above the low-water mark.
pub const SEND_THROTTLE_POLL: Duration = Duration::from_millis(1);

/// Interval between client-side progress reports.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(1000);

/// M-Lab name server answering with the closest NDT server.
pub const MLAB_NS_URL: &str = "https://mlab-ns.appspot.com/ndt?format=json";

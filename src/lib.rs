//! A client library for the WebSocket flavour of the
//! [NDT](https://www.measurementlab.net/tests/ndt/) network diagnostic protocol.
//!
//! NDT measures upload (C2S) and download (S2C) throughput between a client
//! and an M-Lab server. A control channel carries the login, the server's
//! queue and the test schedule; every throughput test opens its own data
//! channel. The server reports its web100 TCP variables at the end.
//!
//! # Quick start
//!
//! ```no_run
//! use ndt_client::client::ClientBuilder;
//! use ndt_client::emitter::HumanReadableEmitter;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ClientBuilder::new("my-app", "0.1.0").build();
//! let server = client.locate_server().await?;
//!
//! let results = client
//!     .run_test(&server.fqdn, HumanReadableEmitter::new(std::io::stdout()))
//!     .await?;
//! for (name, value) in results.iter() {
//!     println!("{name}: {value}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod coordinator;
mod download;
pub mod emitter;
pub mod error;
pub mod locate;
pub mod message;
mod meta;
pub mod params;
pub mod results;
pub mod summary;
pub mod transport;
mod upload;

use std::time::Duration;

use clap::Parser;
use ndt_client::client::ClientBuilder;
use ndt_client::emitter::{Emitter, HumanReadableEmitter, JsonEmitter};
use ndt_client::message::TestSet;
use ndt_client::transport::Scheme;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, clap::ValueEnum)]
enum Format {
    Human,
    Json,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum Protocol {
    Ws,
    Wss,
}

#[derive(Parser, Debug)]
struct Cli {
    /// NDT server hostname; the nearest M-Lab server is used when omitted
    #[arg(long)]
    server: Option<String>,
    /// Port of the control channel
    #[arg(long, default_value_t = ndt_client::params::DEFAULT_PORT)]
    port: u16,
    /// URL path of the WebSocket channels
    #[arg(long, default_value = ndt_client::params::DEFAULT_PATH)]
    path: String,
    /// WebSocket scheme to connect with
    #[arg(long, default_value = "ws")]
    protocol: Protocol,
    /// Requested tests as a bitmask (2 = upload, 4 = download, 32 = meta)
    #[arg(long)]
    tests: Option<u32>,
    /// Skip upload measurement
    #[arg(long)]
    no_upload: bool,
    /// Skip download measurement
    #[arg(long)]
    no_download: bool,
    /// Skip the meta test
    #[arg(long)]
    no_meta: bool,
    /// Milliseconds between progress updates; 0 disables them
    #[arg(long, default_value_t = 1000)]
    update_interval: u64,
    /// Give up on the whole run after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Output format to use: 'human' or 'json' for batch processing
    #[arg(long, default_value = "human")]
    format: Format,
    /// Only check whether the server would queue a test
    #[arg(long)]
    queue_check: bool,
    /// Emit summary and errors only
    #[arg(long, conflicts_with = "debug")]
    quiet: bool,
    /// Log protocol details to stderr
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn tests(&self) -> TestSet {
        let mut tests = match self.tests {
            Some(bits) => TestSet::from_bits(bits),
            None => TestSet::C2S | TestSet::S2C | TestSet::META,
        };
        for (skip, test) in [
            (self.no_upload, TestSet::C2S),
            (self.no_download, TestSet::S2C),
            (self.no_meta, TestSet::META),
        ] {
            if skip {
                tests = tests.difference(test);
            }
        }
        tests
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.debug {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let tests = cli.tests();
    if !cli.queue_check && tests.bits() & (TestSet::C2S | TestSet::S2C | TestSet::META).bits() == 0
    {
        eprintln!("error: nothing to do, every test is disabled");
        std::process::exit(1);
    }

    let client = ClientBuilder::new("ndt-client", env!("CARGO_PKG_VERSION"))
        .port(cli.port)
        .path(cli.path.as_str())
        .scheme(match cli.protocol {
            Protocol::Ws => Scheme::Ws,
            Protocol::Wss => Scheme::Wss,
        })
        .tests(tests)
        .update_interval(Some(Duration::from_millis(cli.update_interval)))
        .timeout(cli.timeout.map(Duration::from_secs))
        .build();

    let server = match cli.server {
        Some(server) => server,
        None => client.locate_server().await?.fqdn,
    };

    if cli.queue_check {
        let status = client.check_queue(&server).await?;
        match cli.format {
            Format::Human => println!("{server}: {status:?}"),
            Format::Json => println!("{}", serde_json::to_string(&status)?),
        }
        return Ok(());
    }

    let emitter: Box<dyn Emitter> = match cli.format {
        Format::Human if cli.quiet => Box::new(HumanReadableEmitter::new(std::io::stdout()).quiet()),
        Format::Human => Box::new(HumanReadableEmitter::new(std::io::stdout())),
        Format::Json => Box::new(JsonEmitter::new(std::io::stdout())),
    };

    if client.run_test(&server, emitter).await.is_err() {
        // the emitter already reported the failure
        std::process::exit(1);
    }

    Ok(())
}

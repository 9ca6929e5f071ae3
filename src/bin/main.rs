use clap::{Parser, Subcommand};
use iperf3_ffi::{Client, Error, LoadOptions, Protocol, Server, Settings, TestResult};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "iperf3-ffi")]
#[command(about = "Run iperf3 tests through libiperf and print the JSON reports", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to libiperf (defaults to $IPERF3_LIBRARY, then the system library)
    #[arg(long, global = true)]
    library: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "5201")]
        port: u16,

        /// Bind to specific address
        #[arg(short = 'B', long)]
        bind: Option<String>,

        /// Serve a single client, then exit
        #[arg(short = '1', long)]
        one_off: bool,

        /// Print the engine's human-readable output instead of JSON reports
        #[arg(long)]
        console: bool,
    },

    /// Run in client mode
    Client {
        /// Server address to connect to
        server: String,

        /// Port to connect to
        #[arg(short, long, default_value = "5201")]
        port: u16,

        /// Use UDP instead of TCP
        #[arg(short, long)]
        udp: bool,

        /// Test duration in seconds
        #[arg(short = 't', long, default_value = "10")]
        time: u32,

        /// Target bandwidth in Mbps
        #[arg(short, long)]
        bandwidth: Option<u64>,

        /// Block size in bytes
        #[arg(short = 'l', long)]
        length: Option<u32>,

        /// Number of parallel streams
        #[arg(short = 'P', long, default_value = "1")]
        parallel: u32,

        /// Run in reverse mode (server sends, client receives)
        #[arg(short = 'R', long)]
        reverse: bool,

        /// Seconds to omit from the start of the test
        #[arg(short = 'O', long)]
        omit: Option<u32>,

        /// Use sendfile() when available
        #[arg(short = 'Z', long)]
        zerocopy: bool,

        /// Print the engine's human-readable output instead of a JSON report
        #[arg(long)]
        console: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let options = match cli.library {
        Some(library) => LoadOptions::new().with_library(library),
        None => LoadOptions::from_env(),
    };

    match cli.command {
        Commands::Server {
            port,
            bind,
            one_off,
            console,
        } => {
            let mut settings = Settings::new().with_port(port).with_json_output(!console);
            if let Some(bind_addr) = bind {
                settings = settings.with_bind_address(bind_addr);
            }

            let server = Server::with_options(&options)?;
            server.configure(&settings)?;

            let cancel_token = server.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nReceived CTRL+C, shutting down server...");
                    cancel_token.cancel();
                }
            });

            loop {
                match server.run().await {
                    Ok(Some(result)) => print_result(&result)?,
                    Ok(None) => {}
                    Err(Error::Cancelled) => break,
                    Err(e) => return Err(e.into()),
                }
                if one_off {
                    break;
                }
            }
        }

        Commands::Client {
            server,
            port,
            udp,
            time,
            bandwidth,
            length,
            parallel,
            reverse,
            omit,
            zerocopy,
            console,
        } => {
            let protocol = if udp { Protocol::Udp } else { Protocol::Tcp };

            let mut settings = Settings::new()
                .with_server_hostname(server)
                .with_port(port)
                .with_protocol(protocol)
                .with_duration(time)
                .with_num_streams(parallel)
                .with_reverse(reverse)
                .with_zerocopy(zerocopy)
                .with_json_output(!console);

            if let Some(bw) = bandwidth {
                settings = settings.with_rate(bw * 1_000_000); // Convert Mbps to bps
            }
            if let Some(blksize) = length {
                settings = settings.with_blksize(blksize);
            }
            if let Some(seconds) = omit {
                settings = settings.with_omit(seconds);
            }

            let client = Client::with_options(&options)?;
            client.configure(&settings)?;

            let outcome = tokio::task::spawn_blocking(move || client.run()).await??;
            if let Some(result) = outcome {
                print_result(&result)?;
                if let Some(message) = result.error() {
                    anyhow::bail!("test failed: {}", message);
                }
            }
        }
    }

    Ok(())
}

fn print_result(result: &TestResult) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

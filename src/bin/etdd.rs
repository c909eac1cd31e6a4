//! etdd: the e-transfer daemon
//!
//! Binds one control listener and any number of data listeners, then
//! serves each accepted connection on its own thread. Every control
//! connection gets its own service instance; data connections share the
//! process-wide transfer registry.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::info;

use etd::{control, data, transport, SharedState, SockName};

#[derive(Parser, Debug)]
#[command(author, version, about = "etdd: accept etd control and data connections")]
struct Args {
    /// Control listener designator
    #[arg(long, default_value = "<tcp/0.0.0.0:2620>")]
    control: String,

    /// Data listener designator; repeat for more than one
    #[arg(long = "data", default_value = "<tcp/0.0.0.0:0>")]
    data: Vec<String>,

    /// Host to advertise for data listeners bound to a wildcard address
    /// (default: this machine's outbound IP)
    #[arg(long)]
    advertise_host: Option<String>,

    /// Verbose level: -v INFO, -vv DEBUG, -vvv TRACE
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let state = SharedState::new();
    for designator in &args.data {
        let sock: SockName = designator
            .parse()
            .with_context(|| format!("bad data designator '{designator}'"))?;
        let advertised = data::spawn_listener(&state, &sock, args.advertise_host.as_deref())?;
        info!("data listener on {advertised}");
    }

    let sock: SockName = args
        .control
        .parse()
        .with_context(|| format!("bad control designator '{}'", args.control))?;
    let (listener, bound) = transport::bind_listener(&sock)?;
    info!("control listener on {bound}");
    control::serve(listener, state);
    Ok(())
}

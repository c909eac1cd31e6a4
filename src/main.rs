//! etd client: copies a file between two endpoints, local or remote
//!
//! A remote endpoint is written `etd://host[:port]/path`; anything else is
//! a local path served by an in-process service. The client requests the
//! write side first (learning how many bytes are already there), then the
//! read side at that offset, then lets one side move the bytes over a data
//! connection.

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing::info;

use etd::service::EtdService;
use etd::{data, transport, EtdProxy, EtdServer, OpenMode, SharedState, SockName};

const DEFAULT_CONTROL_PORT: u16 = 2620;

#[derive(Parser, Debug)]
#[command(author, version, about = "etd: transfer files between etd endpoints")]
struct Args {
    /// Source: local path or etd://host[:port]/path
    source: String,

    /// Destination: local path or etd://host[:port]/path
    #[arg(required_unless_present = "list")]
    destination: Option<String>,

    /// List the source instead of copying
    #[arg(long)]
    list: bool,

    /// How to open the destination
    #[arg(long, value_enum, default_value_t = ModeArg::New)]
    mode: ModeArg,

    /// Verbose level: -v INFO, -vv DEBUG, -vvv TRACE
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum ModeArg {
    New,
    Overwrite,
    Resume,
    SkipExisting,
}

impl From<ModeArg> for OpenMode {
    fn from(m: ModeArg) -> OpenMode {
        match m {
            ModeArg::New => OpenMode::New,
            ModeArg::Overwrite => OpenMode::OverWrite,
            ModeArg::Resume => OpenMode::Resume,
            ModeArg::SkipExisting => OpenMode::SkipExisting,
        }
    }
}

enum Endpoint {
    Local(String),
    Remote { control: SockName, path: String },
}

impl Endpoint {
    fn is_local(&self) -> bool {
        matches!(self, Endpoint::Local(_))
    }

    fn path(&self) -> &str {
        match self {
            Endpoint::Local(p) => p,
            Endpoint::Remote { path, .. } => path,
        }
    }
}

/// `etd://host[:port]/path` is remote, everything else is a local path.
fn parse_endpoint(s: &str) -> Result<Endpoint> {
    let Some(rest) = s.strip_prefix("etd://") else {
        return Ok(Endpoint::Local(s.to_string()));
    };
    let (hostport, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => bail!("remote endpoint '{s}' has no path"),
    };
    let (host, port) = match hostport.rsplit_once(':') {
        Some((h, p)) => (
            h,
            p.parse::<u16>()
                .with_context(|| format!("bad port in '{s}'"))?,
        ),
        None => (hostport, DEFAULT_CONTROL_PORT),
    };
    if host.is_empty() {
        bail!("remote endpoint '{s}' has no host");
    }
    Ok(Endpoint::Remote {
        control: SockName::new("tcp", host, port),
        path: path.to_string(),
    })
}

fn make_service(ep: &Endpoint, state: &SharedState) -> Result<Box<dyn EtdService>> {
    match ep {
        Endpoint::Local(_) => Ok(Box::new(EtdServer::new(state.clone()))),
        Endpoint::Remote { control, .. } => {
            let conn = transport::connect(control)
                .with_context(|| format!("connecting to {control}"))?;
            Ok(Box::new(EtdProxy::new(conn)))
        }
    }
}

fn list(args: &Args) -> Result<()> {
    let state = SharedState::new();
    let ep = parse_endpoint(&args.source)?;
    let mut svc = make_service(&ep, &state)?;
    for entry in svc.list_path(ep.path(), ep.is_local())? {
        println!("{entry}");
    }
    Ok(())
}

fn copy(args: &Args) -> Result<()> {
    let state = SharedState::new();
    let Some(destination) = args.destination.as_deref() else {
        bail!("a destination is required when copying");
    };
    let src_ep = parse_endpoint(&args.source)?;
    let dst_ep = parse_endpoint(destination)?;
    let mode: OpenMode = args.mode.into();

    let mut dst = make_service(&dst_ep, &state)?;
    let mut src = make_service(&src_ep, &state)?;

    // write side first: it tells us where to resume from
    let wgrant = match dst.request_file_write(dst_ep.path(), mode) {
        Ok(grant) => grant,
        Err(e) if mode == OpenMode::SkipExisting => {
            info!("skipping {}: {e}", dst_ep.path());
            println!("{} skipped", dst_ep.path());
            return Ok(());
        }
        Err(e) => return Err(e).context("requesting file write"),
    };
    let rgrant = src
        .request_file_read(src_ep.path(), wgrant.pos)
        .context("requesting file read")?;
    if rgrant.pos < 0 {
        bail!(
            "destination already has {} bytes, source has fewer",
            wgrant.pos
        );
    }
    let todo = rgrant.pos;

    match (src_ep.is_local(), dst_ep.is_local()) {
        (true, true) => {
            // both ends live here; the bytes loop through a local data listener
            let addr = data::spawn_listener(
                &state,
                &SockName::new("tcp", "127.0.0.1", 0),
                Some("127.0.0.1"),
            )?;
            src.send_file(&rgrant.id, &wgrant.id, todo, &[addr])?;
        }
        (true, false) => {
            let addrs = dst.data_channel_addr()?;
            src.send_file(&rgrant.id, &wgrant.id, todo, &addrs)?;
        }
        (false, true) => {
            let addrs = src.data_channel_addr()?;
            dst.get_file(&rgrant.id, &wgrant.id, todo, &addrs)?;
        }
        (false, false) => {
            let addrs = dst.data_channel_addr()?;
            src.send_file(&rgrant.id, &wgrant.id, todo, &addrs)?;
        }
    }

    src.remove_uuid(&rgrant.id)?;
    dst.remove_uuid(&wgrant.id)?;
    println!(
        "{} -> {}: {todo} bytes (starting at {})",
        src_ep.path(),
        dst_ep.path(),
        wgrant.pos
    );
    Ok(())
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
    if args.list {
        list(&args)
    } else {
        copy(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert!(matches!(
            parse_endpoint("/tmp/x").unwrap(),
            Endpoint::Local(p) if p == "/tmp/x"
        ));
        match parse_endpoint("etd://files.example.com/srv/data").unwrap() {
            Endpoint::Remote { control, path } => {
                assert_eq!(control, SockName::new("tcp", "files.example.com", 2620));
                assert_eq!(path, "/srv/data");
            }
            _ => panic!("expected remote"),
        }
        match parse_endpoint("etd://files.example.com:9000/srv/data").unwrap() {
            Endpoint::Remote { control, .. } => assert_eq!(control.port, 9000),
            _ => panic!("expected remote"),
        }
        assert!(parse_endpoint("etd://nohost").is_err());
        assert!(parse_endpoint("etd:///srv/data").is_err());
    }
}

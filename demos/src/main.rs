//! A small CLI that opens a responder against a remote iiod and dumps a
//! single device attribute. Connects over TCP only; USB discovery is a
//! collaborator concern this demo doesn't implement.
//!
//! To use it:
//!
//!     $ iiod-attr-dump --uri ip:192.168.1.5 --dev 0 --attr in_voltage0_raw

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Parser;
use iiod_client::cancel::CancelToken;
use iiod_client::net::NetPort;
use iiod_client::responder::{RejectInboundCommands, Responder};
use iiod_client::uri::Uri;
use iiod_client::{Context, ContextParams};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The responder to connect to. Defaults to $IIOD_REMOTE.
    #[arg(long, value_name = "URI")]
    uri: Option<String>,

    /// The device index to read from.
    #[arg(long, default_value_t = 0)]
    dev: u8,

    /// The attribute name to read.
    #[arg(long)]
    attr: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let uri = args
        .uri
        .or_else(iiod_client::iiod_uri_from_env)
        .ok_or_else(|| anyhow::anyhow!("no --uri given and $IIOD_REMOTE is not set"))?;

    let parsed = iiod_client::parse_uri(&uri).context("parsing URI")?;
    let ip = match parsed {
        Uri::Ip(ip) if !ip.is_discovery() => ip,
        Uri::Ip(_) => bail!("ip: discovery (empty host) isn't wired up in this demo"),
        Uri::Usb { .. } => bail!("usb: URIs aren't supported by this demo"),
    };

    let addr = (ip.host.as_str(), ip.port)
        .to_socket_addrs()
        .context("resolving host")?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no address found for {}", ip.host))?;

    let cancel = Arc::new(CancelToken::new());
    let port = NetPort::connect(addr, cancel.clone(), Some(Duration::from_secs(5)))
        .context("connecting to responder")?;

    let responder = Responder::spawn(Box::new(port), Arc::new(RejectInboundCommands), cancel)
        .context("spawning responder")?;
    let context = Arc::new(Context::new(responder.clone(), ContextParams::default()));

    let value = context
        .read_attr(args.dev, &args.attr)
        .with_context(|| format!("reading attribute {:?} on device {}", args.attr, args.dev))?;

    println!("{}", value);

    responder.close();
    Ok(())
}

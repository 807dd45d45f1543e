use std::{
    fs,
    net::Ipv4Addr,
    path::PathBuf,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use nfq::Queue;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nfq_replay::{
    ReplayContext,
    clock::{Clock, MonotonicClock},
    config::{ReplayConfig, ReplayConfigInput, TeardownPolicy},
    control::{ControlChannel, ControlServer},
    gate::Decision,
    interceptor::{
        ChannelReinjector, NfqMessage, PacketSource, ParkedPackets, Verdict, drain_backlog,
    },
    ip_header::FingerprintOrder,
    releaser::ReleaserHandle,
    signal::install_running_flag,
    stats::StatsReporter,
};

const BATCH_LIMIT: usize = 10000;

#[derive(Parser, Debug)]
#[command(name = "nfq_replay")]
#[command(about = "Replay a recorded packet-timing trace on traffic toward one host")]
struct Args {
    /// IPv4 address of the station whose inbound traffic is replayed
    #[arg(short, long)]
    target: Option<Ipv4Addr>,

    /// NFQUEUE number the iptables rule sends packets to
    #[arg(short, long)]
    queue_num: Option<u16>,

    /// Unix socket accepting schedule records and the start command
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Schedule file to preload, one `id time size priority` per line
    #[arg(short, long)]
    schedule: Option<PathBuf>,

    /// Open the gate right after preloading
    #[arg(long)]
    autostart: bool,

    /// Byte order used to read the checksum fingerprint
    #[arg(long, value_enum)]
    fingerprint_order: Option<FingerprintOrder>,

    /// Verdict for packets still held at shutdown
    #[arg(long, value_enum)]
    teardown: Option<TeardownPolicy>,

    /// TOML config file; command line values win
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<ReplayConfig> {
    let mut input = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            ReplayConfigInput::from_toml_str(&text)?
        }
        None => ReplayConfigInput::default(),
    };
    if args.target.is_some() {
        input.target = args.target;
    }
    if args.queue_num.is_some() {
        input.queue_num = args.queue_num;
    }
    if args.control_socket.is_some() {
        input.control_socket = args.control_socket.clone();
    }
    if args.fingerprint_order.is_some() {
        input.fingerprint_order = args.fingerprint_order;
    }
    if args.teardown.is_some() {
        input.teardown = args.teardown;
    }
    Ok(input.resolve()?)
}

fn make_queue(queue_num: u16, max_len: u32) -> Result<Queue, std::io::Error> {
    let mut q = Queue::open()?;
    q.bind(queue_num)?;
    q.set_copy_range(queue_num, 0xFFFF)?;
    q.set_queue_max_len(queue_num, max_len)?;
    q.set_nonblocking(true);
    Ok(q)
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_target(true)
        .compact()
        .init();

    let config = load_config(&args)?;
    info!(
        station = %config.target,
        queue_num = config.queue_num,
        control = %config.control_socket.display(),
        "nfq_replay starting"
    );

    let ctx = Arc::new(ReplayContext::new(config.target, config.fingerprint_order));

    // 1. control channel: optional preload, then the socket
    let channel = ControlChannel::new(ctx.clone());
    if let Some(path) = &args.schedule {
        channel
            .load_file(path)
            .with_context(|| format!("failed to load schedule {}", path.display()))?;
    }
    if args.autostart {
        ctx.start();
    }
    let mut control = ControlServer::spawn(&config.control_socket, channel)
        .context("failed to open control socket")?;

    // 2. releaser
    let (reinjector, reinject_rx) = ChannelReinjector::new();
    let mut releaser = ReleaserHandle::spawn(
        ctx.clone(),
        MonotonicClock,
        reinjector.clone(),
        config.releaser.clone(),
    )
    .context("failed to spawn releaser")?;

    let running = install_running_flag().context("failed to install signal handler")?;

    // 3. interception loop, sole owner of the queue handle
    let mut queue = make_queue(config.queue_num, config.queue_max_len)
        .with_context(|| format!("failed to bind NFQUEUE {}", config.queue_num))?;
    let mut parked: ParkedPackets<NfqMessage> = ParkedPackets::new();
    let mut reporter = StatsReporter::new(Duration::from_secs(1));
    let clock = MonotonicClock;

    while running.load(Ordering::Acquire) {
        let mut working = false;

        for _ in 0..BATCH_LIMIT {
            let Some(msg) = queue.next_packet() else {
                break;
            };
            working = true;

            let now = clock.now_ms();
            match ctx.admit(msg.as_ref(), now) {
                Decision::Accept => queue.issue(msg, Verdict::Accept),
                Decision::Drop => queue.issue(msg, Verdict::Drop),
                Decision::Hold { fingerprint, .. } => {
                    let handle = parked.hold(msg);
                    if let Err(e) = ctx.hold(handle, fingerprint, now) {
                        warn!("{e}, passing packet through");
                        if let Some(msg) = parked.take(handle) {
                            queue.issue(msg, Verdict::Accept);
                        }
                    }
                }
            }
        }

        for (handle, verdict) in reinject_rx.try_iter() {
            working = true;
            match parked.take(handle) {
                Some(msg) => queue.issue(msg, verdict),
                None => warn!(?handle, "reinjection for unknown packet"),
            }
        }

        reporter.check_and_report(ctx.stats());

        if !working {
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    // 4. teardown
    info!("shutting down");
    ctx.stop_interception();
    control.stop();
    releaser.stop();
    let late = drain_backlog(&mut queue, Verdict::Accept, BATCH_LIMIT);
    if late > 0 {
        info!(count = late, "accepted packets still waiting in the kernel queue");
    }
    ctx.teardown(&reinjector, config.teardown);
    for (handle, verdict) in reinject_rx.try_iter() {
        if let Some(msg) = parked.take(handle) {
            queue.issue(msg, verdict);
        }
    }
    let orphans: Vec<_> = parked.drain().collect();
    if !orphans.is_empty() {
        warn!(count = orphans.len(), "parked packets with no queue entry");
    }
    for (_, msg) in orphans {
        queue.issue(msg, config.teardown.verdict());
    }
    ctx.store().clear();
    info!("nfq_replay stopped");
    Ok(())
}

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use miette::{Context, IntoDiagnostic};
use ringdma::{
    completion::{Mode, NotifyOn},
    config::LoopbackParams,
    control::{Command, DeviceOp, Reply},
    sim::{SimChannel, SimEngine, SimMemory, SimRegisters, Source},
    Device, DeviceConfig, Direction, ErrorCode, Registry,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::Targets, prelude::*};

type SimDevice = Device<SimChannel, SimMemory, SimRegisters>;

/// The configuration used when `--config` is not passed.
const DEFAULT_CONFIG: &str = include_str!("../configs/loopback.toml");

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,

    /// path to a TOML device configuration.
    ///
    /// if this is not set, a built-in configuration with a 64 KiB shared
    /// buffer and two 16-slot rings is used.
    #[arg(short, long, global = true, env = "RINGDMA_CONFIG")]
    config: Option<PathBuf>,

    /// a comma-separated list of `tracing` targets and levels to enable.
    ///
    /// for example, `info,ringdma::completion=trace` enables the `INFO`
    /// level globally, and every level for the completion handlers.
    ///
    /// see <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/targets/struct.Targets.html#filtering-with-targets>
    /// for more details on this syntax.
    #[arg(
        short,
        long = "trace",
        global = true,
        env = "RINGDMA_TRACE",
        default_value_t = Targets::new().with_default(LevelFilter::INFO),
    )]
    trace_filter: Targets,
}

#[derive(Subcommand)]
enum Cmd {
    /// run one transfer from the TX ring into the RX ring and compare them.
    Loopback {
        /// bytes to prime in each half of the shared buffer.
        ///
        /// defaults to the size of the RX channel's buffer.
        #[arg(long)]
        size: Option<usize>,

        /// wraps the index pattern written to the TX half.
        ///
        /// defaults to the RX channel's slot size.
        #[arg(long)]
        bytes_per_ring: Option<usize>,
    },

    /// stream transfers through both channels in continuous mode.
    Stream {
        /// stop after this many slots have been received.
        #[arg(short = 'n', long, default_value_t = 64)]
        transfers: usize,

        /// slots to enqueue for transmission after each step.
        #[arg(long, default_value_t = 1)]
        batch: usize,

        /// fill received slots with a counting pattern, rather than with
        /// what was transmitted.
        #[arg(long)]
        pattern: bool,
    },
}

fn main() -> miette::Result<()> {
    let Args {
        cmd,
        config,
        trace_filter,
    } = Args::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(trace_filter))
        .init();

    let config = match config {
        Some(path) => DeviceConfig::from_file(&path)?,
        None => DeviceConfig::from_toml(DEFAULT_CONFIG).context("built-in configuration")?,
    };
    tracing::debug!(?config);

    match cmd {
        Cmd::Loopback {
            size,
            bytes_per_ring,
        } => {
            let mut engine = SimEngine::new();
            let mut device = bring_up(&config, &mut engine)?;
            loopback(&mut device, &engine, size, bytes_per_ring)
        }
        Cmd::Stream {
            transfers,
            batch,
            pattern,
        } => {
            let source = if pattern {
                Source::Pattern
            } else {
                Source::Loopback
            };
            let mut engine = SimEngine::with_source(source);
            let device = bring_up(&config, &mut engine)?;
            stream(&device, &engine, transfers, batch)
        }
    }
}

/// Probes a device on `engine`, allocates its shared buffer and sets up
/// every channel named in `config`.
fn bring_up(config: &DeviceConfig, engine: &mut SimEngine) -> miette::Result<SimDevice> {
    let registry = Arc::new(Registry::new("ringdma"));
    let mut device = Device::probe(
        registry,
        engine,
        SimMemory::new(config.buffer_size),
        SimRegisters::new(),
        config.watermarks,
    )
    .into_diagnostic()?;
    device
        .allocate_buffer(config.buffer_size)
        .into_diagnostic()
        .context("failed to allocate shared buffer")?;

    for (direction, params) in [(Direction::Inbound, config.rx), (Direction::Outbound, config.tx)] {
        let Some(params) = params else {
            continue;
        };
        device
            .setup_channel(direction, &params)
            .into_diagnostic()
            .with_context(|| format!("failed to set up {direction} channel"))?;
    }
    Ok(device)
}

fn loopback(
    device: &mut SimDevice,
    engine: &SimEngine,
    size: Option<usize>,
    bytes_per_ring: Option<usize>,
) -> miette::Result<()> {
    let rx = device
        .rx()
        .and_then(|rx| rx.geometry())
        .ok_or_else(|| miette::miette!("loopback needs a configured rx channel"))?;
    let params = LoopbackParams {
        size: size.unwrap_or(rx.length),
        bytes_per_ring: bytes_per_ring.unwrap_or(rx.bytes_per_ring),
    };

    device
        .dispatch(Command::Device(DeviceOp::TestLoopback(params)))
        .into_diagnostic()
        .context("loopback test failed to start")?;
    let done = engine.run(2);
    if done != 2 {
        miette::bail!("loopback stalled after {done} transfers");
    }

    let (Some(rx), Some(tx)) = (device.rx(), device.tx()) else {
        miette::bail!("loopback needs both channels");
    };
    for (chan, name) in [(rx, "rx"), (tx, "tx")] {
        let code = chan.take_error();
        if !code.is_none() {
            miette::bail!("{name} channel latched {code}");
        }
    }
    if !device.notifier().signal(Direction::Inbound).take() {
        tracing::warn!("no rx notification was raised");
    }

    let region = device
        .buffer()
        .ok_or_else(|| miette::miette!("shared buffer went away"))?;
    let (Some(received), Some(sent)) = (rx.slot_span(0), tx.slot_span(0)) else {
        miette::bail!("channels have no slot 0");
    };
    let words = received.len().min(sent.len()) / 4;
    let mismatched = (0..words)
        .filter(|word| {
            region.read_u32(received.offset() + word * 4) != region.read_u32(sent.offset() + word * 4)
        })
        .count();
    if mismatched > 0 {
        miette::bail!("{mismatched} of {words} words differ between rx and tx");
    }

    if let Ok(Reply::Properties(props)) = device.dispatch(Command::Device(DeviceOp::GetProperties)) {
        tracing::info!(
            base = format_args!("{:#x}", props.base),
            size = props.size,
            "shared buffer"
        );
    }
    println!("loopback ok: {words} words matched");
    Ok(())
}

fn stream(device: &SimDevice, engine: &SimEngine, transfers: usize, batch: usize) -> miette::Result<()> {
    let (Some(rx), Some(tx)) = (device.rx(), device.tx()) else {
        miette::bail!("streaming needs both channels");
    };
    let tx_slots = tx
        .geometry()
        .ok_or_else(|| miette::miette!("tx channel is not configured"))?
        .ring_total;

    rx.set_mode(Mode::Continuous, NotifyOn::TransferComplete)
        .into_diagnostic()?;
    tx.set_mode(Mode::Continuous, NotifyOn::Dataflow)
        .into_diagnostic()?;
    let prime = (device.watermarks().prime + 1).min(tx_slots - 1);
    tx.enqueue(prime).into_diagnostic().context("failed to prime tx queue")?;

    let mut received = 0;
    let mut sent = 0;
    let mut flow = Vec::new();
    let mut overflows = 0;
    while received < transfers {
        let mut progressed = false;
        if engine.step(Direction::Outbound).is_some() {
            sent += 1;
            progressed = true;
        }
        if let Some(slot) = engine.step(Direction::Inbound) {
            received += 1;
            progressed = true;
            let index = rx.next_index().into_diagnostic()?;
            tracing::debug!(slot, index, "received");
        }

        match tx.take_error() {
            ErrorCode::None => {}
            code => {
                tracing::info!(%code, queued = tx.queued(), status = ?tx.status(), "tx flow");
                flow.push(code);
            }
        }
        match rx.take_error() {
            ErrorCode::None => {}
            code => {
                tracing::warn!(%code, "rx");
                overflows += 1;
            }
        }

        if tx.queued() + batch < tx_slots && tx.enqueue(batch).is_ok() {
            progressed = true;
        }
        if !progressed {
            tracing::warn!(received, sent, "stream stalled");
            break;
        }
    }

    rx.stop().into_diagnostic()?;
    tx.stop().into_diagnostic()?;
    println!(
        "streamed: {sent} sent, {received} received, {} flow signals, {overflows} rx errors",
        flow.len()
    );
    Ok(())
}

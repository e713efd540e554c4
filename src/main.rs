use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use slogic::firmware::{self, FirmwareImage};
use slogic::{Config, Error, RecordingReport, SampleRate, SampleSink, UsbChannel};
use tracing::{info, warn};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::prelude::*;

/// Record samples from a USB logic analyzer
#[derive(Debug, Parser)]
#[command(name = "slogic", version)]
struct Cli {
    /// Output file, `-` writes the samples to stdout
    #[arg(short = 'f', long = "output", required_unless_present = "list_rates")]
    output: Option<String>,

    /// Sample rate (see --list-rates)
    #[arg(short = 'r', long = "rate", required_unless_present = "list_rates")]
    rate: Option<String>,

    /// Number of samples to record [default: one second at the sample rate]
    #[arg(short = 'n', long = "samples", value_parser = clap::value_parser!(u64).range(1..))]
    samples: Option<u64>,

    /// Transfer buffer size in bytes
    #[arg(short = 'b', long = "buffer-size", value_parser = clap::value_parser!(u64).range(1..))]
    buffer_size: Option<u64>,

    /// Number of transfer buffers
    #[arg(short = 't', long = "transfers", value_parser = clap::value_parser!(u64).range(1..))]
    transfers: Option<u64>,

    /// Transfer timeout in milliseconds
    #[arg(short = 'o', long = "timeout", value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,

    /// USB stack log level, 0 to 3 (3 is most verbose)
    #[arg(short = 'u', long = "usb-debug", value_parser = clap::value_parser!(u8).range(0..=3))]
    usb_debug: Option<u8>,

    /// Configuration file
    #[arg(long)]
    config: Option<String>,

    /// Firmware image (JSON) to upload when the device has none
    #[arg(long)]
    firmware: Option<String>,

    /// Print the recording report as JSON on stderr
    #[arg(long)]
    json: bool,

    /// List the available sample rates and exit
    #[arg(long)]
    list_rates: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let usb_level = match cli.usb_debug.unwrap_or(cfg.usb.debug_level) {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        _ => LevelFilter::DEBUG,
    };
    // stdout may carry sample data
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(Targets::new().with_target("nusb", usb_level).with_default(level))
        .init();

    if cli.list_rates {
        for rate in SampleRate::all() {
            println!("{}", rate.label);
        }
        return Ok(());
    }

    let label = cli.rate.as_deref().context("A sample rate has to be specified")?;
    let rate = SampleRate::lookup(label).ok_or_else(|| {
        let available: Vec<_> = SampleRate::all().iter().map(|r| r.label).collect();
        anyhow!("Invalid sample rate: {} (available: {})", label, available.join(", "))
    })?;
    let output = cli.output.as_deref().context("An output file has to be specified")?;

    let mut recording = cfg.recording(rate).tune(
        cli.buffer_size.unwrap_or(0) as usize,
        cli.transfers.unwrap_or(0) as usize,
        cli.timeout.unwrap_or(0),
    );
    recording.drain_timeout = recording.transfer_timeout;
    recording.validate()?;

    let n_samples = cli.samples.unwrap_or(rate.samples_per_second as u64);

    let open = || {
        UsbChannel::open(cfg.usb.vendor_id, cfg.usb.product_id, cfg.usb.interface)
            .context("Failed to open the logic analyzer")
    };

    let mut channel = open()?;
    if !firmware::is_ready(&mut channel) {
        let Some(path) = cli.firmware.as_deref() else {
            bail!("The device has no firmware loaded; pass --firmware <image.json>");
        };
        let image = FirmwareImage::load(path)?;
        firmware::upload(&mut channel, &image, firmware::DEFAULT_SETTLE_DELAY);

        drop(channel);
        channel = open()?;
        if !firmware::is_ready(&mut channel) {
            warn!("Device still does not answer after the firmware upload");
        }
    }

    let mut sink = SampleSink::open(output, n_samples)?;
    let result = slogic::execute(&mut channel, recording, &mut sink);
    let (written, _) = sink.finish()?;

    let report = match result {
        Ok(report) => report,
        Err(Error::Recording(report)) => {
            print_report(&report, cli.json)?;
            bail!("Recording failed: {} ({} samples written)", report.final_state, written);
        }
        Err(e) => return Err(e).context("Recording failed"),
    };

    print_report(&report, cli.json)?;
    info!("Wrote {} samples to {}", written, output);

    Ok(())
}

fn print_report(report: &RecordingReport, json: bool) -> Result<()> {
    if json {
        eprintln!("{}", serde_json::to_string_pretty(report)?);
    }

    info!(
        "Total number of samples read is {} in {} transfers ({:.1}s, {:.0} samples/s)",
        report.total_samples,
        report.total_transfers,
        report.elapsed.as_secs_f64(),
        report.samples_per_second()
    );
    if report.timeout_count > 0 || report.warmup_timeouts > 0 {
        info!(
            "Timeouts: {} while streaming, {} during warm-up",
            report.timeout_count, report.warmup_timeouts
        );
    }
    Ok(())
}

//! pruscope: capture PRU sample streams and render them as VCD waveforms.
//!
//! # Usage
//!
//! ```bash
//! # Capture 64 KiB from the PRU (requires root) and write capture.vcd
//! sudo pruscope capture --bytes 65536
//!
//! # Load new firmware first, keep the raw samples and a JSON report
//! sudo pruscope capture --bytes 65536 --firmware pru1.out --raw capture.raw --report capture.json
//!
//! # Exercise the pipeline without hardware
//! pruscope capture --bytes 65536 --simulate
//!
//! # Render a saved raw capture at a different sampling interval
//! pruscope render --raw capture.raw --interval 40
//!
//! # Print samples as `index: value`
//! pruscope dump --vcd capture.vcd
//! ```

use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use pruscope_capture::buffer::{page_size, validate_trace_bytes};
use pruscope_capture::lifecycle::{
    install_firmware, Coprocessor, RemoteProc, RunningGuard, DEFAULT_FIRMWARE_DEST,
    DEFAULT_REMOTEPROC,
};
use pruscope_capture::session::{
    capture_from_hardware, Capture, CaptureConfig, CaptureSession, SessionError,
};
use pruscope_capture::sim::{FakeRegion, ProducerMode, TimedProducer};
use pruscope_capture::{
    AlignmentPolicy, CancelToken, CollectorConfig, FinalAckPolicy, LifecycleError, OverrunPolicy,
    WaitPolicy,
};
use pruscope_protocol::RegionLayout;
use pruscope_vcd::encoder::DEFAULT_SAMPLING_INTERVAL_NS;
use pruscope_vcd::{parse_samples, EmptyPolicy, EncodeError, EncoderConfig, ParseError, WaveformEncoder};
use snafu::Snafu;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Ticks between halves for the `--simulate` producer.
const SIMULATED_HALF_PERIOD: u64 = 4000;

/// CLI errors for the pruscope binary.
#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("Capture failed: {source}"), context(false))]
    Session { source: SessionError },
    #[snafu(display("Co-processor control failed: {source}"), context(false))]
    Lifecycle { source: LifecycleError },
    #[snafu(display("Encoding failed: {source}"), context(false))]
    Encode { source: EncodeError },
    #[snafu(display("Cannot read waveform: {source}"), context(false))]
    Parse { source: ParseError },
    #[snafu(display("I/O error: {source}"), context(false))]
    Io { source: std::io::Error },
    #[snafu(display("{message}"))]
    Other { message: String },
}

#[derive(Parser)]
#[command(name = "pruscope")]
#[command(about = "Capture PRU shared-memory sample streams as VCD waveforms")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture samples from the PRU and render them.
    Capture(CaptureArgs),

    /// Render a raw capture file as VCD.
    Render {
        /// Raw samples, one byte per sample.
        #[arg(short, long)]
        raw: PathBuf,

        /// Nanoseconds between samples.
        #[arg(short, long, default_value_t = DEFAULT_SAMPLING_INTERVAL_NS)]
        interval: u64,

        /// Output file (default: the raw file with a .vcd extension).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write a header-only waveform for an empty capture.
        #[arg(long)]
        allow_empty: bool,
    },

    /// Print samples one per line as `index: value`.
    Dump {
        #[command(flatten)]
        source: DumpSource,
    },
}

#[derive(Args, Debug)]
struct CaptureArgs {
    /// Trace size in bytes (whole pages unless --word-aligned).
    #[arg(short, long)]
    bytes: usize,

    /// Nanoseconds between samples.
    #[arg(short, long, default_value_t = DEFAULT_SAMPLING_INTERVAL_NS)]
    interval: u64,

    /// Waveform output file.
    #[arg(short, long, default_value = "capture.vcd")]
    output: PathBuf,

    /// Also save the raw samples here.
    #[arg(long)]
    raw: Option<PathBuf>,

    /// Save a JSON capture report here.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Give up when no half arrives within this many milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// On failure, still render whatever was collected.
    #[arg(long)]
    best_effort: bool,

    /// Clear the status word after a partial final transfer.
    #[arg(long)]
    ack_final: bool,

    /// Fail when the trace size is not a whole number of halves.
    #[arg(long)]
    reject_truncated: bool,

    /// Accept any whole number of words instead of whole pages.
    #[arg(long)]
    word_aligned: bool,

    /// Install this firmware image before starting the PRU.
    #[arg(long)]
    firmware: Option<PathBuf>,

    /// remoteproc instance that runs the producer.
    #[arg(long, default_value = DEFAULT_REMOTEPROC)]
    remoteproc: String,

    /// Leave the PRU alone; assume the producer is already running.
    #[arg(long)]
    no_lifecycle: bool,

    /// Use a simulated producer instead of /dev/mem.
    #[arg(long)]
    simulate: bool,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct DumpSource {
    /// Raw capture file.
    #[arg(long)]
    raw: Option<PathBuf>,

    /// VCD file written by pruscope.
    #[arg(long)]
    vcd: Option<PathBuf>,
}

impl CaptureArgs {
    fn capture_config(&self, cancel: CancelToken) -> CaptureConfig {
        let wait = match self.timeout_ms {
            Some(ms) => WaitPolicy::with_timeout(Duration::from_millis(ms)),
            None => WaitPolicy::spin(),
        };
        CaptureConfig {
            trace_bytes: self.bytes,
            alignment: if self.word_aligned {
                AlignmentPolicy::WordAligned
            } else {
                AlignmentPolicy::PageAligned
            },
            collector: CollectorConfig {
                wait: wait.cancellable(cancel),
                final_ack: if self.ack_final {
                    FinalAckPolicy::Acknowledge
                } else {
                    FinalAckPolicy::LeaveRaised
                },
                overrun: if self.reject_truncated {
                    OverrunPolicy::Reject
                } else {
                    OverrunPolicy::Accept
                },
                ..CollectorConfig::default()
            },
            best_effort: self.best_effort,
        }
    }

    fn encoder(&self) -> WaveformEncoder {
        WaveformEncoder::new(EncoderConfig::with_interval(self.interval))
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Capture(args) => cmd_capture(&args),
        Commands::Render {
            raw,
            interval,
            output,
            allow_empty,
        } => cmd_render(raw, interval, output, allow_empty),
        Commands::Dump { source } => cmd_dump(source),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_capture(args: &CaptureArgs) -> Result<(), CliError> {
    capture_with(args, RemoteProc::new(&args.remoteproc))
}

fn capture_with(args: &CaptureArgs, remoteproc: RemoteProc) -> Result<(), CliError> {
    let cancel = CancelToken::new();
    cancel_on_signal(&cancel);
    let config = args.capture_config(cancel);

    // Nothing on the PRU, in /lib/firmware or in /dev/mem is touched before this
    validate_trace_bytes(config.trace_bytes, config.alignment, page_size())
        .map_err(SessionError::from)?;

    let result = if args.simulate {
        info!("Simulating the producer; no hardware is touched");
        let producer = TimedProducer::new(SIMULATED_HALF_PERIOD, ProducerMode::Waits);
        let region = FakeRegion::timed(RegionLayout::pru_shared(), producer);
        CaptureSession::open(region, config).and_then(CaptureSession::run)
    } else {
        // Stops the PRU when this block ends, after the region is unmapped
        let _running = if args.no_lifecycle {
            None
        } else {
            Some(start_coprocessor(args, remoteproc)?)
        };
        capture_from_hardware(RegionLayout::pru_shared(), config)
    };
    finish_capture(args, result)
}

fn finish_capture(
    args: &CaptureArgs,
    result: Result<Capture, SessionError>,
) -> Result<(), CliError> {
    let capture = match result {
        Ok(capture) => capture,
        Err(SessionError::Collection {
            source,
            partial: Some(partial),
        }) => {
            warn!(
                "Rendering the {} words collected before the failure",
                partial.filled_words()
            );
            write_outputs(args, partial.into_samples())?;
            return Err(SessionError::Collection {
                source,
                partial: None,
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "Captured {} words in {} transfers ({:?})",
        capture.report.words_copied, capture.report.transfers, capture.report.completion
    );
    if let Some(path) = &args.report {
        capture.summary().save(path)?;
        println!("Saved capture report to {}", path.display());
    }
    write_outputs(args, capture.buffer.into_samples())
}

fn start_coprocessor(
    args: &CaptureArgs,
    mut remoteproc: RemoteProc,
) -> Result<RunningGuard<RemoteProc>, CliError> {
    if let Some(firmware) = &args.firmware {
        // The driver only loads firmware on start
        remoteproc.stop()?;
        install_firmware(firmware, DEFAULT_FIRMWARE_DEST)?;
    }
    Ok(RunningGuard::start(remoteproc)?)
}

fn write_outputs(args: &CaptureArgs, samples: Vec<u8>) -> Result<(), CliError> {
    if let Some(raw) = &args.raw {
        std::fs::write(raw, &samples)?;
        println!("Saved {} raw samples to {}", samples.len(), raw.display());
    }
    let doc = args.encoder().encode(samples)?;
    doc.save(&args.output)?;
    println!("Wrote {} samples to {}", doc.len(), args.output.display());
    Ok(())
}

fn cmd_render(
    raw: PathBuf,
    interval: u64,
    output: Option<PathBuf>,
    allow_empty: bool,
) -> Result<(), CliError> {
    let samples = std::fs::read(&raw)?;
    let output = output.unwrap_or_else(|| raw.with_extension("vcd"));
    let encoder = WaveformEncoder::new(EncoderConfig {
        empty: if allow_empty {
            EmptyPolicy::HeaderOnly
        } else {
            EmptyPolicy::Reject
        },
        ..EncoderConfig::with_interval(interval)
    });

    let doc = encoder.encode(samples)?;
    doc.save(&output)?;
    println!("Wrote {} samples to {}", doc.len(), output.display());
    Ok(())
}

fn cmd_dump(source: DumpSource) -> Result<(), CliError> {
    let samples = match (source.raw, source.vcd) {
        (Some(raw), _) => std::fs::read(raw)?,
        (None, Some(vcd)) => parse_samples(&std::fs::read_to_string(vcd)?)?,
        (None, None) => {
            return OtherSnafu {
                message: "one of --raw or --vcd is required",
            }
            .fail()
        }
    };

    let mut out = BufWriter::new(std::io::stdout().lock());
    for (i, value) in samples.iter().enumerate() {
        writeln!(out, "{}: {}", i, value)?;
    }
    out.flush()?;
    Ok(())
}

static CANCEL: OnceLock<CancelToken> = OnceLock::new();

/// Cancel `token` on SIGINT or SIGTERM.
fn cancel_on_signal(token: &CancelToken) {
    if CANCEL.set(token.clone()).is_err() {
        return;
    }

    extern "C" fn handler(_: libc::c_int) {
        if let Some(token) = CANCEL.get() {
            token.cancel();
        }
    }

    unsafe {
        let h = handler as *const () as libc::sighandler_t;
        libc::signal(libc::SIGINT, h);
        libc::signal(libc::SIGTERM, h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pruscope_capture::session::CaptureReport;
    use pruscope_capture::sim::ScriptStep;
    use pruscope_protocol::Half;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Commands {
        Cli::try_parse_from(args).unwrap().command
    }

    fn capture_args(args: &[&str]) -> CaptureArgs {
        let mut argv = vec!["pruscope", "capture"];
        argv.extend_from_slice(args);
        match parse(&argv) {
            Commands::Capture(args) => args,
            _ => panic!("expected capture"),
        }
    }

    #[test]
    fn capture_flags_map_to_policies() {
        let args = capture_args(&[
            "--bytes",
            "8192",
            "--timeout-ms",
            "250",
            "--ack-final",
            "--reject-truncated",
            "--best-effort",
        ]);
        let config = args.capture_config(CancelToken::new());
        assert_eq!(config.trace_bytes, 8192);
        assert_eq!(config.alignment, AlignmentPolicy::PageAligned);
        assert_eq!(config.collector.final_ack, FinalAckPolicy::Acknowledge);
        assert_eq!(config.collector.overrun, OverrunPolicy::Reject);
        assert_eq!(config.collector.wait.timeout, Some(Duration::from_millis(250)));
        assert!(config.collector.wait.cancel.is_some());
        assert!(config.best_effort);
    }

    #[test]
    fn capture_defaults() {
        let args = capture_args(&["--bytes", "4096"]);
        assert_eq!(args.interval, 35);
        assert_eq!(args.remoteproc, "remoteproc2");
        assert_eq!(args.output, PathBuf::from("capture.vcd"));
        let config = args.capture_config(CancelToken::new());
        assert_eq!(config.collector.final_ack, FinalAckPolicy::LeaveRaised);
        assert_eq!(config.collector.overrun, OverrunPolicy::Accept);
        assert_eq!(config.collector.wait.timeout, None);
    }

    #[test]
    fn dump_needs_exactly_one_source() {
        assert!(Cli::try_parse_from(["pruscope", "dump"]).is_err());
        assert!(Cli::try_parse_from(["pruscope", "dump", "--raw", "a", "--vcd", "b"]).is_err());
        assert!(Cli::try_parse_from(["pruscope", "dump", "--vcd", "b"]).is_ok());
    }

    #[test]
    fn simulated_capture_writes_all_outputs() {
        let dir = TempDir::new().unwrap();
        let vcd = dir.path().join("c.vcd");
        let raw = dir.path().join("c.raw");
        let report = dir.path().join("c.json");
        let args = capture_args(&[
            "--bytes",
            "4096",
            "--simulate",
            "--output",
            vcd.to_str().unwrap(),
            "--raw",
            raw.to_str().unwrap(),
            "--report",
            report.to_str().unwrap(),
        ]);
        cmd_capture(&args).unwrap();

        let samples = std::fs::read(&raw).unwrap();
        assert_eq!(samples.len(), 4096);
        let rendered = std::fs::read_to_string(&vcd).unwrap();
        assert_eq!(parse_samples(&rendered).unwrap(), samples);
        let report = CaptureReport::load(&report).unwrap();
        assert_eq!(report.requested_bytes, 4096);
        assert_eq!(report.collection.transfers, 1);
    }

    #[test]
    fn simulated_capture_rejects_partial_page() {
        let dir = TempDir::new().unwrap();
        let vcd = dir.path().join("c.vcd");
        let args = capture_args(&["--bytes", "100", "--simulate", "--output", vcd.to_str().unwrap()]);
        let err = cmd_capture(&args).unwrap_err();
        assert!(matches!(err, CliError::Session { .. }));
        assert!(!vcd.exists());
    }

    #[test]
    fn render_respects_empty_policy() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("empty.raw");
        std::fs::write(&raw, b"").unwrap();

        let err = cmd_render(raw.clone(), 35, None, false).unwrap_err();
        assert!(matches!(err, CliError::Encode { .. }));

        cmd_render(raw.clone(), 35, None, true).unwrap();
        let text = std::fs::read_to_string(raw.with_extension("vcd")).unwrap();
        assert!(text.ends_with("$enddefinitions $end\n\n"));
    }

    #[test]
    fn render_then_parse_recovers_samples() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("trace.raw");
        let out = dir.path().join("trace.vcd");
        std::fs::write(&raw, [0xB2, 0x00, 0xFF]).unwrap();
        cmd_render(raw, 5, Some(out.clone()), false).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("#10\nb11111111 B\n"));
        assert_eq!(parse_samples(&text).unwrap(), vec![0xB2, 0x00, 0xFF]);
    }

    #[test]
    fn invalid_size_leaves_coprocessor_and_firmware_alone() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        std::fs::write(&state, "running\n").unwrap();
        let firmware = dir.path().join("pru1.out");
        std::fs::write(&firmware, b"firmware").unwrap();
        let vcd = dir.path().join("c.vcd");
        let args = capture_args(&[
            "--bytes",
            "100",
            "--firmware",
            firmware.to_str().unwrap(),
            "--output",
            vcd.to_str().unwrap(),
        ]);

        let err = capture_with(&args, RemoteProc::at(&state)).unwrap_err();
        assert!(matches!(
            err,
            CliError::Session {
                source: SessionError::Config(_)
            }
        ));
        // A stop before a firmware install would have rewritten the state file
        assert_eq!(std::fs::read_to_string(&state).unwrap(), "running\n");
        assert!(!vcd.exists());
    }

    fn failing_session(args: &CaptureArgs) -> Result<Capture, SessionError> {
        // One half, then garbage in the status word
        let region = FakeRegion::scripted(
            FakeRegion::small_layout(),
            [ScriptStep::Publish(Half::First), ScriptStep::Raw(9)],
        );
        CaptureSession::open(region, args.capture_config(CancelToken::new()))
            .and_then(CaptureSession::run)
    }

    #[test]
    fn best_effort_renders_partial_capture_and_still_fails() {
        let dir = TempDir::new().unwrap();
        let vcd = dir.path().join("partial.vcd");
        let raw = dir.path().join("partial.raw");
        let args = capture_args(&[
            "--bytes",
            "48",
            "--word-aligned",
            "--best-effort",
            "--output",
            vcd.to_str().unwrap(),
            "--raw",
            raw.to_str().unwrap(),
        ]);

        let err = finish_capture(&args, failing_session(&args)).unwrap_err();
        assert!(matches!(
            err,
            CliError::Session {
                source: SessionError::Collection { partial: None, .. }
            }
        ));
        let expected = FakeRegion::expected_samples(16);
        assert_eq!(std::fs::read(&raw).unwrap(), expected);
        let rendered = std::fs::read_to_string(&vcd).unwrap();
        assert_eq!(parse_samples(&rendered).unwrap(), expected);
    }

    #[test]
    fn failed_capture_without_best_effort_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let vcd = dir.path().join("partial.vcd");
        let args = capture_args(&[
            "--bytes",
            "48",
            "--word-aligned",
            "--output",
            vcd.to_str().unwrap(),
        ]);

        let err = finish_capture(&args, failing_session(&args)).unwrap_err();
        assert!(matches!(err, CliError::Session { .. }));
        assert!(!vcd.exists());
    }
}

//! Digital coded exposure CLI.
//!
//! Loads event recordings (EVT 3.0 `.raw` or event CSV), answers time index
//! queries, renders coded exposures and replays recordings through the
//! bounded streaming buffer.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dce_core::config::StreamConfig;
use dce_core::export::{self, OutputFormat};
use dce_core::stream::STREAM_DIFF_SCALE;
use dce_core::{
    analyze, open_path, ComputeBackend, ComputeOutput, Contribution, EventStore, ExposureConfig,
    ExposureRequest, HostBackend, IndexRange, IngestState, LoadOptions, Scene, ShutterCompute,
    ShutterType, SpaceWindow, StepOutcome, StreamIngestor, TimeUnit,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Digital coded exposure for event camera recordings.
///
/// Reads .raw files in EVT 3.0 format or event CSV files.
#[derive(Parser, Debug)]
#[command(name = "dce")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print recording statistics
    Info {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Find the events bracketing a point in time
    Query {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Time to look up, in --unit relative to the first event
        #[arg(short, long)]
        time: f32,

        /// Time unit (us, ms, s)
        #[arg(short, long, default_value = "ms", value_parser = parse_unit)]
        unit: TimeUnit,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Render a coded exposure
    Expose(ExposeArgs),

    /// Replay a recording through the bounded streaming buffer
    Stream {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Retention horizon in milliseconds
        #[arg(long, default_value_t = 100.0)]
        max_z: f64,

        /// Maximum retained events per millisecond
        #[arg(long)]
        time_density: Option<f64>,

        /// Pause every N steps and expose the buffered events
        #[arg(long, value_name = "N")]
        pause_every: Option<u64>,

        #[arg(long, value_enum, default_value_t = BackendKind::Auto)]
        backend: BackendKind,
    },
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Keep every N-th event
    #[arg(long)]
    mod_freq: Option<u32>,

    /// Scaled length the recorded span is mapped onto
    #[arg(long)]
    time_span: Option<f64>,
}

impl LoadArgs {
    fn options(&self, base: LoadOptions) -> LoadOptions {
        LoadOptions {
            mod_freq: self.mod_freq.unwrap_or(base.mod_freq),
            time_span: self.time_span.unwrap_or(base.time_span),
        }
    }
}

#[derive(Args, Debug)]
struct ExposeArgs {
    /// Input recording (.raw or .csv)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output file path (.csv, .bin)
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// TOML configuration; flags below override it
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(flatten)]
    load: LoadArgs,

    /// Time window (in --unit)
    #[arg(long, num_args = 2, value_names = ["LEFT", "RIGHT"], conflicts_with = "event_window")]
    time_window: Option<Vec<f32>>,

    /// Event index window
    #[arg(long, num_args = 2, value_names = ["LEFT", "RIGHT"])]
    event_window: Option<Vec<u32>>,

    /// Unit of --time-window (us, ms, s)
    #[arg(short, long, value_parser = parse_unit)]
    unit: Option<TimeUnit>,

    /// Space window as TOP RIGHT BOTTOM LEFT
    #[arg(long, num_args = 4, value_names = ["TOP", "RIGHT", "BOTTOM", "LEFT"])]
    space: Option<Vec<f32>>,

    /// Morlet carrier frequency in Hz
    #[arg(long, requires = "h")]
    morlet: Option<f32>,

    /// Morlet envelope full width at half maximum, in scaled time
    #[arg(long)]
    h: Option<f32>,

    /// Constant weight for the base contribution
    #[arg(long, conflicts_with = "morlet")]
    weight: Option<f32>,

    /// Keep only positive-polarity events
    #[arg(long)]
    positive_only: bool,

    /// Also write principal axes to OUTPUT with a .pca.csv suffix
    #[arg(long)]
    pca: bool,

    /// Compute backend; auto uses the GPU when one is available
    #[arg(long, value_enum, default_value_t = BackendKind::Auto)]
    backend: BackendKind,

    /// Output format (csv, bin); defaults to the OUTPUT extension
    #[arg(short, long)]
    format: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendKind {
    Auto,
    Host,
    Gpu,
}

fn parse_unit(s: &str) -> Result<TimeUnit, String> {
    TimeUnit::from_str(s)
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn spinner(quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .context("Invalid progress template")?,
    );
    Ok(pb)
}

fn make_backend(kind: BackendKind) -> Result<Box<dyn ComputeBackend>> {
    match kind {
        BackendKind::Host => Ok(Box::new(HostBackend::new())),
        #[cfg(feature = "gpu")]
        BackendKind::Auto => match dce_core::WgpuBackend::new() {
            Ok(backend) => {
                info!(adapter = backend.adapter_name(), "using GPU backend");
                Ok(Box::new(backend))
            }
            Err(err) => {
                warn!(error = %err, "GPU unavailable, using host backend");
                Ok(Box::new(HostBackend::new()))
            }
        },
        #[cfg(not(feature = "gpu"))]
        BackendKind::Auto => {
            warn!("built without GPU support, using host backend");
            Ok(Box::new(HostBackend::new()))
        }
        #[cfg(feature = "gpu")]
        BackendKind::Gpu => {
            let backend = dce_core::WgpuBackend::new().context("Failed to initialise GPU")?;
            info!(adapter = backend.adapter_name(), "using GPU backend");
            Ok(Box::new(backend))
        }
        #[cfg(not(feature = "gpu"))]
        BackendKind::Gpu => bail!("This build has no GPU support. Rebuild with --features gpu"),
    }
}

fn load_store(input: &Path, options: LoadOptions, progress: &ProgressBar) -> Result<EventStore> {
    progress.set_message(format!(
        "Loading {:?}...",
        input.file_name().unwrap_or_default()
    ));
    let mut source = open_path(input).context("Failed to open recording")?;
    EventStore::load_source(&mut source, options).context("Failed to load recording")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Info { input, load } => {
            run_info(&input, load.options(LoadOptions::default()), cli.quiet)
        }
        Command::Query {
            input,
            time,
            unit,
            load,
        } => run_query(&input, time, unit, load.options(LoadOptions::default()), cli.quiet),
        Command::Expose(args) => run_expose(args, cli.quiet),
        Command::Stream {
            input,
            max_z,
            time_density,
            pause_every,
            backend,
        } => run_stream(&input, max_z, time_density, pause_every, backend, cli.quiet),
    }
}

fn run_info(input: &Path, options: LoadOptions, quiet: bool) -> Result<()> {
    let progress = spinner(quiet)?;
    let start_time = Instant::now();
    let store = load_store(input, options, &progress)?;
    progress.finish_and_clear();

    let (first, last) = store.raw_span();
    let bounds = store.bounds();
    println!("Input:        {:?}", input);
    println!(
        "Sensor:       {}x{}",
        store.resolution().width,
        store.resolution().height
    );
    println!("Events:       {}", store.len());
    println!("Raw span:     {} .. {} us", first, last);
    println!("Diff scale:   {}", store.diff_scale());
    println!(
        "Bounds:       x [{}, {}] y [{}, {}] t [{}, {}]",
        bounds.min[0], bounds.max[0], bounds.min[1], bounds.max[1], bounds.min[2], bounds.max[2]
    );
    if !quiet {
        eprintln!("Loaded in {:.3}s", start_time.elapsed().as_secs_f64());
    }
    Ok(())
}

fn run_query(input: &Path, time: f32, unit: TimeUnit, options: LoadOptions, quiet: bool) -> Result<()> {
    let progress = spinner(quiet)?;
    let mut scene = Scene::new(load_store(input, options, &progress)?);
    progress.finish_and_clear();
    scene.oddize_time(unit);

    let first = scene.first_event(time).context("Index query failed")?;
    let last = scene.last_event(time).context("Index query failed")?;
    let suffix = unit.suffix();
    for (label, index) in [("first at or after", first), ("last at or before", last)] {
        let t = scene.timestamp(index).context("Index query failed")?;
        println!("{:<18} {:>10}  t = {} {}", label, index, t, suffix);
    }
    Ok(())
}

fn run_expose(args: ExposeArgs, quiet: bool) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ExposureConfig::from_file(path)
            .with_context(|| format!("Failed to read config {:?}", path))?,
        None => ExposureConfig::default(),
    };
    apply_overrides(&mut config, &args)?;
    config.validate().context("Invalid exposure settings")?;

    let format = match &args.format {
        Some(name) => OutputFormat::from_str(name).context("Invalid output format")?,
        None => OutputFormat::from_path(&args.output),
    };

    let progress = spinner(quiet)?;
    let start_time = Instant::now();
    let mut scene = Scene::new(load_store(&args.input, config.load, &progress)?);
    config.shutter.apply(&mut scene);
    debug!(window = ?scene.window(), "exposure window");

    let mut compute = ShutterCompute::new(make_backend(args.backend)?);
    progress.set_message("Exposing...");
    compute
        .bind(scene.store().events())
        .context("Failed to upload events")?;
    let request = scene.exposure_request(config.contribution);
    let summary = compute.run(&request).context("Exposure failed")?;
    let output = compute.snapshot().context("Failed to read exposure")?;
    compute.release();

    progress.set_message(format!(
        "Writing to {:?}...",
        args.output.file_name().unwrap_or_default()
    ));
    export::write_output(&args.output, &output, scene.store().resolution(), format)
        .context("Failed to write exposure")?;

    let pca_path = if config.pca {
        Some(write_pca(&args.output, &output)?)
    } else {
        None
    };

    let total_duration = start_time.elapsed();
    progress.finish_with_message(format!(
        "Done! Exposed {} of {} events in {:.2}s",
        summary.count,
        request.range.len(),
        total_duration.as_secs_f64()
    ));

    if !quiet {
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:        {:?}", args.input);
        eprintln!("  Output:       {:?}", args.output);
        if let Some(path) = &pca_path {
            eprintln!("  Axes:         {:?}", path);
        }
        eprintln!("  Backend:      {}", compute.backend().name());
        eprintln!(
            "  Window:       events {}..={}",
            request.range.left, request.range.right
        );
        eprintln!("  Emitted:      {}", summary.count);
        eprintln!("  Weight:       {:.4}", output.total_weight());
        if let Some([mx, my]) = output.mean() {
            eprintln!("  Mean:         ({:.2}, {:.2})", mx, my);
        }
        eprintln!("  Duration:     {:.3}s", total_duration.as_secs_f64());
    }
    Ok(())
}

fn apply_overrides(config: &mut ExposureConfig, args: &ExposeArgs) -> Result<()> {
    config.load = args.load.options(config.load);

    let shutter = &mut config.shutter;
    if let Some(unit) = args.unit {
        shutter.unit = Some(unit);
    }
    if let Some(tw) = &args.time_window {
        shutter.mode = ShutterType::Time;
        shutter.time_window = Some([tw[0], tw[1]]);
        shutter.time_shutter = None;
    }
    if let Some(ew) = &args.event_window {
        if ew[0] > ew[1] {
            bail!("Event window is inverted: {} > {}", ew[0], ew[1]);
        }
        shutter.mode = ShutterType::Event;
        shutter.event_window = Some([ew[0], ew[1]]);
        shutter.event_shutter = None;
    }
    if let Some(s) = &args.space {
        shutter.space_window = Some(SpaceWindow::new(s[0], s[1], s[2], s[3]));
    }
    shutter.positive_only |= args.positive_only;

    if let Some(freq_hz) = args.morlet {
        let h = args.h.context("--morlet requires --h")?;
        config.contribution = Contribution::Morlet { freq_hz, h };
    } else if let Some(contribution) = args.weight {
        config.contribution = Contribution::Base { contribution };
    }
    config.pca |= args.pca;
    Ok(())
}

fn write_pca(output_path: &Path, output: &ComputeOutput) -> Result<PathBuf> {
    let axes = analyze(output).context("Principal component analysis failed")?;
    let path = output_path.with_extension("pca.csv");
    let file = std::fs::File::create(&path)
        .with_context(|| format!("Failed to create {:?}", path))?;
    export::write_pca_csv(file, &axes).context("Failed to write principal axes")?;
    info!(
        major = axes.eigenvalues[0],
        minor = axes.eigenvalues[1],
        "principal axes"
    );
    Ok(path)
}

fn run_stream(
    input: &Path,
    max_z: f64,
    time_density: Option<f64>,
    pause_every: Option<u64>,
    backend: BackendKind,
    quiet: bool,
) -> Result<()> {
    let config = ExposureConfig {
        stream: StreamConfig {
            max_z,
            time_density,
        },
        ..ExposureConfig::default()
    };
    config.validate().context("Invalid stream settings")?;

    let progress = spinner(quiet)?;
    let start_time = Instant::now();
    let mut ingestor = StreamIngestor::new();
    ingestor
        .open_file(input)
        .context("Failed to open recording")?;

    let mut compute = ShutterCompute::new(make_backend(backend)?);
    let run = drive_stream(
        &mut ingestor,
        &config.stream,
        pause_every,
        &mut compute,
        &progress,
    )?;
    let total_duration = start_time.elapsed();
    progress.finish_with_message(format!(
        "Done! {} steps in {:.2}s",
        run.steps,
        total_duration.as_secs_f64()
    ));

    if !quiet {
        let buffer = ingestor.buffer();
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:        {:?}", input);
        eprintln!(
            "  Sensor:       {}x{}",
            ingestor.resolution().width,
            ingestor.resolution().height
        );
        eprintln!("  Steps:        {}", run.steps);
        eprintln!("  Exposures:    {}", run.exposures);
        eprintln!("  Retained:     {} events, {} frames", buffer.len(), buffer.frames().len());
        if let (Some(first), Some(newest)) = (buffer.events().front(), buffer.newest()) {
            eprintln!("  Buffer span:  {:.3} .. {:.3} ms", first.t, newest);
        }
        eprintln!("  Last exposure: {} events", run.last_count);
        eprintln!("  Duration:     {:.3}s", total_duration.as_secs_f64());
    }
    Ok(())
}

/// Totals of one streaming replay.
#[derive(Debug, Default, PartialEq)]
struct StreamRun {
    steps: u64,
    /// Snapshot exposures, including the final one.
    exposures: u64,
    last_count: u32,
}

/// Steps `ingestor` until its source finishes, then exposes the final buffer.
///
/// With `pause_every = Some(n)` the stream pauses after every `n` pulling
/// steps and exposes a snapshot; the following step resumes pulling.
fn drive_stream<B: ComputeBackend>(
    ingestor: &mut StreamIngestor,
    stream: &StreamConfig,
    pause_every: Option<u64>,
    compute: &mut ShutterCompute<B>,
    progress: &ProgressBar,
) -> Result<StreamRun> {
    let mut run = StreamRun::default();
    let mut pulls_since_pause = 0u64;
    loop {
        let pause = pause_every.is_some_and(|n| n > 0 && pulls_since_pause >= n);
        let outcome = ingestor
            .step(&stream.step_params(pause))
            .context("Stream step failed")?;
        run.steps += 1;

        if outcome == StepOutcome::FirstBatch {
            info!(retained = ingestor.buffer().len(), "first batch buffered");
        }
        if ingestor.state() == IngestState::Paused {
            pulls_since_pause = 0;
            run.last_count = expose_snapshot(ingestor, compute)?;
            run.exposures += 1;
            progress.set_message(format!(
                "step {}: {} buffered, {} exposed",
                run.steps,
                ingestor.buffer().len(),
                run.last_count
            ));
        } else {
            pulls_since_pause += 1;
            progress.set_message(format!(
                "step {}: {} buffered",
                run.steps,
                ingestor.buffer().len()
            ));
        }
        progress.tick();

        if outcome == StepOutcome::Finished {
            break;
        }
    }

    run.last_count = expose_snapshot(ingestor, compute)?;
    run.exposures += 1;
    Ok(run)
}

/// Exposes the whole buffered snapshot and returns the emitted count.
fn expose_snapshot<B: ComputeBackend>(
    ingestor: &StreamIngestor,
    compute: &mut ShutterCompute<B>,
) -> Result<u32> {
    let snapshot = ingestor.snapshot().context("Snapshot failed")?;
    let (Some(first), Some(last)) = (snapshot.events.first(), snapshot.events.last()) else {
        return Ok(0);
    };
    let center_t = first.t + (last.t - first.t) / 2.0;
    compute
        .bind(&snapshot.events)
        .context("Failed to upload events")?;
    let request = ExposureRequest {
        range: IndexRange::new(0, snapshot.events.len() as u32 - 1),
        center_t,
        space: SpaceWindow::unbounded(),
        positive_only: false,
        contribution: Contribution::default(),
        diff_scale: STREAM_DIFF_SCALE,
    };
    Ok(compute.run(&request).context("Exposure failed")?.count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dce_core::source::MemorySource;
    use dce_core::{RawEvent, Resolution};

    fn ingestor() -> StreamIngestor {
        let events: Vec<RawEvent> = (0..10)
            .map(|i| RawEvent::new(i as u16, 0, true, i * 100))
            .collect();
        let mut ingestor = StreamIngestor::new();
        ingestor.start(Box::new(MemorySource::from_events(
            Resolution::default(),
            &events,
            2,
        )));
        ingestor
    }

    fn replay(pause_every: Option<u64>) -> StreamRun {
        let stream = StreamConfig {
            max_z: 100.0,
            time_density: None,
        };
        let mut compute = ShutterCompute::new(HostBackend::new());
        drive_stream(
            &mut ingestor(),
            &stream,
            pause_every,
            &mut compute,
            &ProgressBar::hidden(),
        )
        .unwrap()
    }

    #[test]
    fn test_replay_without_pauses() {
        let run = replay(None);
        // Five pulling steps, then the step that finds the source drained.
        assert_eq!(run.steps, 6);
        assert_eq!(run.exposures, 1);
        assert_eq!(run.last_count, 10);
    }

    #[test]
    fn test_pause_every_step_still_finishes() {
        let run = replay(Some(1));
        // Each of the five pulls is followed by a pause.
        assert_eq!(run.steps, 11);
        assert_eq!(run.exposures, 6);
        assert_eq!(run.last_count, 10);
    }

    #[test]
    fn test_pause_every_other_pull() {
        let run = replay(Some(2));
        // pull pull pause pull pull pause pull finish
        assert_eq!(run.steps, 8);
        assert_eq!(run.exposures, 3);
        assert_eq!(run.last_count, 10);
    }
}

use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use speedo_core::{
    ms_to_kmh_f64, parse_events, scripted_speeds, summarize_events, DistanceModel,
    EngineConfig, Position, ReplaySource, Sample, SampleSink, Section, SpeedFormat,
    TrackSummary, TrackingEngine, DEMO_SPEEDS_KMH,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Speed tracking replay CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay GPX/FIT/CSV/JSON tracks through the engine and export sections
    Replay(ReplayArgs),
    /// Run the built-in scripted ride and print speeds as they change
    Demo(DemoArgs),
    /// Check tracks for samples the engine can use before replaying them
    Check(CheckArgs),
}

#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Engine config JSON; flags below override its values
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Speed (km/h) at or above which the device counts as moving
    #[arg(long)]
    min_speed_kmh: Option<f64>,

    /// Lower speed (km/h) for leaving the moving state
    #[arg(long)]
    exit_speed_kmh: Option<f64>,

    /// Digits after the decimal separator in formatted speeds
    #[arg(long)]
    precision: Option<u8>,

    /// Decimal separator for formatted speeds
    #[arg(long)]
    decimal_separator: Option<char>,

    /// Distance model for section lengths
    #[arg(long, value_enum)]
    distance_model: Option<DistanceModelOpt>,
}

#[derive(Parser, Debug)]
struct ReplayArgs {
    /// Track files to replay
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "sections.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Close a section still open at end of stream as if the provider went away
    #[arg(long, action = ArgAction::SetTrue)]
    close_at_end: bool,

    #[command(flatten)]
    engine: EngineArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Time between scripted samples (milliseconds)
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Print the closed section as JSON instead of text
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    #[command(flatten)]
    engine: EngineArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Track files to check
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Report path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    engine: EngineArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DistanceModelOpt {
    Haversine,
    Vincenty,
}

impl From<DistanceModelOpt> for DistanceModel {
    fn from(value: DistanceModelOpt) -> Self {
        match value {
            DistanceModelOpt::Haversine => DistanceModel::Haversine,
            DistanceModelOpt::Vincenty => DistanceModel::Vincenty,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Replay(args) => args.verbose,
        Command::Demo(args) => args.verbose,
        Command::Check(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Replay(args) => handle_replay(args),
        Command::Demo(args) => handle_demo(args),
        Command::Check(args) => handle_check(args),
    }
}

fn build_config(args: &EngineArgs) -> Result<EngineConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(value) = args.min_speed_kmh {
        config.min_speed_kmh = value;
    }
    if let Some(value) = args.exit_speed_kmh {
        config.exit_speed_kmh = Some(value);
    }
    if let Some(value) = args.precision {
        config.display.precision = value;
    }
    if let Some(value) = args.decimal_separator {
        config.display.decimal_separator = value;
    }
    if let Some(value) = args.distance_model {
        config.distance_model = value.into();
    }
    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

/// Collects every section an engine closes.
fn collect_sections(engine: &TrackingEngine) -> Arc<Mutex<Vec<Section>>> {
    let sections = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&sections);
    engine.subscribe_section(Arc::new(move |section: &Section| {
        sink.lock().unwrap_or_else(|e| e.into_inner()).push(*section);
    }));
    sections
}

/// Replay one parsed track through a fresh engine and return its sections.
fn replay_bytes(
    data: &[u8],
    hint: &str,
    config: &EngineConfig,
    close_at_end: bool,
) -> Result<Vec<Section>> {
    let events = parse_events(data, hint)?;
    let source = Arc::new(ReplaySource::from_events(events));
    let engine = TrackingEngine::new(config.clone(), source.clone())?;
    let sections = collect_sections(&engine);

    if !engine.start_tracking() {
        return Err(anyhow!("replay source is not ready"));
    }
    let delivered = source.drain();
    debug!("Delivered {} events", delivered);
    if source.pending() > 0 {
        warn!("{} events left undelivered", source.pending());
    }
    if close_at_end && engine.is_speed_active() {
        info!("Stream ended while moving; closing section");
        engine.on_provider_disabled();
    }
    engine.shutdown();

    let sections = sections.lock().unwrap_or_else(|e| e.into_inner()).clone();
    Ok(sections)
}

fn handle_replay(args: ReplayArgs) -> Result<()> {
    if args.inputs.is_empty() {
        return Err(anyhow!("no input files supplied"));
    }
    let config = build_config(&args.engine)?;

    let inputs: Vec<(usize, PathBuf)> = args.inputs.iter().cloned().enumerate().collect();
    let mut results: Vec<(usize, Vec<Section>)> = inputs
        .par_iter()
        .map(|(file_id, path)| -> Result<(usize, Vec<Section>)> {
            let data =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            let hint = path
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("csv");
            let sections = replay_bytes(&data, hint, &config, args.close_at_end)
                .with_context(|| format!("failed to replay {}", path.display()))?;
            info!("{}: {} sections", path.display(), sections.len());
            Ok((*file_id, sections))
        })
        .collect::<Result<Vec<_>>>()?;

    // Restore original ordering by file_id
    results.sort_by_key(|(id, _)| *id);
    let rows: Vec<(&Path, Vec<Section>)> = results
        .into_iter()
        .map(|(id, sections)| (args.inputs[id].as_path(), sections))
        .collect();

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        write_section_rows(&rows, &mut writer)?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        write_section_rows(&rows, &mut writer)?;
        info!("Wrote sections CSV: {}", args.output.display());
    }
    Ok(())
}

fn write_section_rows<W: Write>(
    rows: &[(&Path, Vec<Section>)],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "file",
        "section",
        "start_s",
        "end_s",
        "distance_m",
        "time_elapsed_s",
        "average_kmh",
    ])?;
    for (path, sections) in rows {
        for (index, section) in sections.iter().enumerate() {
            writer.write_record([
                path.display().to_string(),
                (index + 1).to_string(),
                format!("{:.3}", section.started_at_ns as f64 / 1e9),
                format!("{:.3}", section.ended_at_ns as f64 / 1e9),
                format!("{:.2}", section.distance_m),
                section.time_elapsed_s.to_string(),
                format!("{:.2}", section.average_speed_kmh()),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Instantaneous speed at display precision, not the rounded notification value.
fn speed_line(format: &SpeedFormat, sample: &Sample) -> String {
    format!(
        "{:>6.1}s  {} km/h",
        sample.timestamp_s(),
        format.format_kmh(ms_to_kmh_f64(sample.speed()))
    )
}

fn handle_demo(args: DemoArgs) -> Result<()> {
    let config = build_config(&args.engine)?;
    let events = scripted_speeds(&DEMO_SPEEDS_KMH, args.interval_ms, Position::new(45.0, 5.0));
    let source = Arc::new(ReplaySource::from_events(events));
    let engine = TrackingEngine::new(config, source.clone())?;
    let sections = collect_sections(&engine);

    let format = engine.config().display;
    engine.subscribe_speed(Arc::new(move |_kmh: i32, sample: &Sample| {
        println!("{}", speed_line(&format, sample));
    }));
    engine.subscribe_activity(Arc::new(|active: bool| {
        println!("        {}", if active { "moving" } else { "stationary" });
    }));

    if !engine.start_tracking() {
        return Err(anyhow!("demo source is not ready"));
    }
    source.drain();
    engine.shutdown();

    let sections = sections.lock().unwrap_or_else(|e| e.into_inner()).clone();
    for section in &sections {
        if args.json {
            println!("{}", serde_json::to_string(section)?);
        } else {
            println!(
                "section: {:.1} m in {} s, average {} km/h",
                section.distance_m,
                section.time_elapsed_s,
                format.format_kmh(section.average_speed_kmh())
            );
        }
    }
    if sections.is_empty() {
        warn!("Demo ride closed no section");
    }
    Ok(())
}

/// Problems that would make a replay of this track meaningless.
fn track_issues(summary: &TrackSummary, config: &EngineConfig) -> Vec<String> {
    let mut issues = Vec::new();
    if summary.samples == 0 {
        issues.push("no samples".to_string());
        return issues;
    }
    if summary.with_position == 0 {
        issues.push("no positions: section distances will be 0".to_string());
    } else if summary.with_position < summary.samples {
        issues.push(format!(
            "{} of {} samples lack a position",
            summary.samples - summary.with_position,
            summary.samples
        ));
    }
    if summary.moving == 0 {
        issues.push(format!(
            "never reaches {} km/h: no section will close",
            config.min_speed_kmh
        ));
    }
    if summary.out_of_order > 0 {
        issues.push(format!("{} out-of-order samples", summary.out_of_order));
    }
    issues
}

/// Report block for one input, plus whether it has issues.
fn check_bytes(name: &str, data: &[u8], hint: &str, config: &EngineConfig) -> (String, bool) {
    let mut report = format!("FILE: {}\n", name);
    let issues = match parse_events(data, hint) {
        Ok(events) => {
            let summary = summarize_events(&events, config.min_speed_running_mps());
            report.push_str(&format!(
                "  samples: {} (lifecycle events: {})\n",
                summary.samples, summary.lifecycle_events
            ));
            report.push_str(&format!("  with position: {}\n", summary.with_position));
            report.push_str(&format!(
                "  max speed: {} km/h\n",
                config.display.format_kmh(ms_to_kmh_f64(summary.max_speed_mps))
            ));
            report.push_str(&format!("  timespan_s: {:.1}\n", summary.span_s));
            track_issues(&summary, config)
        }
        Err(err) => vec![format!("unreadable: {}", err)],
    };
    if issues.is_empty() {
        report.push_str("  issues: none\n");
    } else {
        report.push_str("  issues:\n");
        for issue in &issues {
            report.push_str(&format!("    - {}\n", issue));
        }
    }
    (report, !issues.is_empty())
}

fn handle_check(args: CheckArgs) -> Result<()> {
    let config = build_config(&args.engine)?;
    let mut report = String::new();
    let mut flagged = 0usize;

    for path in &args.inputs {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let hint = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("csv");
        let (block, has_issues) = check_bytes(&path.display().to_string(), &data, hint, &config);
        if has_issues {
            warn!("{}: not suitable for replay as is", path.display());
            flagged += 1;
        }
        report.push_str(&block);
        report.push('\n');
    }

    if args.output.as_os_str() == "-" {
        io::stdout().lock().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Check report written: {}", args.output.display());
    }
    if flagged > 0 {
        return Err(anyhow!("{} of {} inputs have issues", flagged, args.inputs.len()));
    }
    Ok(())
}

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use veriscript_contracts::events::EventWriter;
use veriscript_contracts::projector::project_markers;
use veriscript_contracts::report::AnalysisReport;
use veriscript_engine::{
    AnalysisPipeline, ClientOptions, DryrunEngine, GeminiEngine, NormalizeOptions,
    ReasoningClient, ReasoningEngine, DEFAULT_MODEL,
};

#[derive(Debug, Parser)]
#[command(name = "veriscript", version, about = "Handwriting forgery analysis pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compare a reference specimen against a questioned one.
    Analyze(AnalyzeArgs),
    /// Project a stored report's evidence markers onto rendered dimensions.
    Project(ProjectArgs),
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    /// Known-authentic specimen image.
    #[arg(long)]
    reference: PathBuf,
    /// Disputed specimen image.
    #[arg(long)]
    questioned: PathBuf,
    /// Where to write the report JSON; stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Append pipeline events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "gemini")]
    engine: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    /// Encode specimens at higher quality, trading latency for detail.
    #[arg(long)]
    thorough: bool,
}

#[derive(Debug, Parser)]
struct ProjectArgs {
    /// Report JSON produced by `analyze`.
    #[arg(long)]
    report: PathBuf,
    /// Rendered image width in pixels.
    #[arg(long)]
    width: f64,
    /// Rendered image height in pixels.
    #[arg(long)]
    height: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Project(args) => run_project(args),
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<()> {
    let reference = fs::read(&args.reference)
        .with_context(|| format!("failed reading {}", args.reference.display()))?;
    let questioned = fs::read(&args.questioned)
        .with_context(|| format!("failed reading {}", args.questioned.display()))?;

    let engine = resolve_engine(&args.engine)?;
    let options = ClientOptions {
        model: args.model,
        ..ClientOptions::default()
    };

    let events = args
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, format!("case-{}", timestamp_millis())));
    let mut client = ReasoningClient::new(engine, options);
    if let Some(writer) = &events {
        client = client.with_events(writer.clone());
    }

    let normalize = if args.thorough {
        NormalizeOptions::thorough()
    } else {
        NormalizeOptions::default()
    };
    let mut pipeline = AnalysisPipeline::new(client).with_normalize_options(normalize);
    if let Some(writer) = events {
        pipeline = pipeline.with_events(writer);
    }

    let report = pipeline.run(&reference, &questioned)?;
    let rendered = serde_json::to_string_pretty(&report)?;
    match &args.out {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("report written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    println!(
        "verdict: {} (confidence {:.1}%), {} evidence marker(s), report id {}",
        if report.is_forgery {
            "likely forgery"
        } else {
            "likely authentic"
        },
        report.confidence,
        report.evidence_markers.len(),
        report.id,
    );
    Ok(())
}

fn run_project(args: ProjectArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.report)
        .with_context(|| format!("failed reading {}", args.report.display()))?;
    let report: AnalysisReport = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a valid report", args.report.display()))?;

    let rects = project_markers(&report.evidence_markers, args.width, args.height);
    let rows: Vec<Value> = report
        .evidence_markers
        .iter()
        .zip(rects)
        .map(|(marker, rect)| {
            json!({
                "type": marker.kind.wire_name(),
                "subType": marker.sub_kind,
                "confidence": marker.local_confidence,
                "top": rect.top,
                "left": rect.left,
                "width": rect.width,
                "height": rect.height,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&Value::Array(rows))?);
    Ok(())
}

fn resolve_engine(name: &str) -> Result<Box<dyn ReasoningEngine>> {
    match name {
        "gemini" => Ok(Box::new(GeminiEngine::from_env())),
        "dryrun" => Ok(Box::new(DryrunEngine)),
        other => bail!("unknown engine '{other}' (expected gemini or dryrun)"),
    }
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

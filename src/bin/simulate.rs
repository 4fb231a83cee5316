use std::{fs, path::PathBuf, sync::Arc};

use callsim::{
    load_scenarios, telemetry, BatchEvent, BatchRegistry, BatchScheduler, LLMProvider, OpenAI,
    PromptTemplates, ResultRecord, ScenarioRunner, ScenarioStatus, SimulationConfig,
};
use clap::Parser;
use colored::Colorize;

#[derive(Parser)]
#[command(name = "simulate")]
#[command(about = "Simulate Agent/Client calls and score them")]
struct Args {
    /// JSON or YAML file with an array of scenarios
    scenarios: PathBuf,

    /// Override CONCURRENCY
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Override MAX_TURNS
    #[arg(long)]
    max_turns: Option<usize>,

    /// Override OPENAI_MODEL
    #[arg(long)]
    model: Option<String>,

    /// Directory with agent_system.hbs, client_system.hbs, evaluator_system.hbs
    #[arg(long, env = "PROMPTS_DIR")]
    prompts: Option<PathBuf>,

    /// Write result records as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    telemetry::init_tracing(args.json_logs);

    let mut config = SimulationConfig::from_env()?;
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(max_turns) = args.max_turns {
        config.max_turns = max_turns;
    }
    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(dir) = args.prompts {
        config.prompts_dir = dir;
    }
    config.validate()?;

    let specs = load_scenarios(&args.scenarios)?;
    println!("Loaded {} scenarios from {}", specs.len(), args.scenarios.display());
    // Invalid scenarios fail in their own slot; the rest of the batch still runs.
    for (index, spec) in specs.iter().enumerate() {
        if let Err(err) = spec.validate() {
            tracing::warn!(index, scenario = %spec.name, error = %err, "invalid scenario");
        }
    }

    let templates = PromptTemplates::from_dir(&config.prompts_dir)?;
    let provider: Arc<dyn LLMProvider> = Arc::new(OpenAI::from_env()?);
    let runner = ScenarioRunner::new(provider, templates, config.runner_settings())
        .with_session_source(config.session_source());

    let scheduler = BatchScheduler::new(Arc::new(runner), BatchRegistry::new(), config.scheduler_config())
        .with_event_callback(|event| {
            if let BatchEvent::ScenarioFinished {
                scenario,
                status,
                progress,
                ..
            } = event
            {
                println!("[{progress:>5.1}%] {scenario}: {}", status_label(*status));
            }
        });

    let batch = scheduler.run(specs).await?;
    let records = batch.records();

    println!();
    for record in &records {
        print_record(record);
    }

    let summary = batch.summary();
    println!();
    println!("{}", "Batch summary".bold());
    println!("  batch id:   {}", batch.batch_id);
    println!("  status:     {:?}", batch.status);
    println!(
        "  scenarios:  {} total, {} completed, {} failed, {} timed out, {} cancelled",
        summary.total, summary.completed, summary.failed, summary.timed_out, summary.cancelled
    );
    if let Some(average) = summary.average_score {
        println!(
            "  score:      {:.2} avg (1: {}, 2: {}, 3: {})",
            average,
            summary.score_distribution.poor,
            summary.score_distribution.fair,
            summary.score_distribution.excellent
        );
    }
    println!(
        "  turns:      {:.1} avg, {:.1}s avg duration",
        summary.average_turns, summary.average_duration_seconds
    );
    println!(
        "  tokens:     {} prompt, {} completion",
        summary.usage_totals.prompt_tokens, summary.usage_totals.completion_tokens
    );

    if let Some(path) = args.output {
        fs::write(&path, serde_json::to_string_pretty(&records)?)?;
        println!("Results written to {}", path.display());
    }

    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn status_label(status: ScenarioStatus) -> colored::ColoredString {
    match status {
        ScenarioStatus::Completed => "completed".green(),
        ScenarioStatus::Failed => "failed".red(),
        ScenarioStatus::Timeout => "timeout".yellow(),
        ScenarioStatus::Cancelled => "cancelled".dimmed(),
    }
}

fn print_record(record: &ResultRecord) {
    let score = record
        .score
        .map(|score| score.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{} {} score={} turns={} reason={:?} {:.1}s",
        status_label(record.status),
        record.scenario_name.bold(),
        score,
        record.turn_count,
        record.termination_reason,
        record.duration_seconds
    );
    if let Some(comment) = &record.comment {
        println!("    {comment}");
    }
}

use std::{fs, path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, ValueEnum};
use colored::Colorize;
use parley::{
    cancellation,
    providers::{
        openai::OpenAI,
        rate_limited::RateLimitedProvider,
    },
    AgentAdapter, BatchRunner, Evaluator, ExampleStatus, GradingPolicy, LLMProvider, LeakagePolicy,
    LlmAssistant, LlmJudge, SimulatedUser, SimulationConfig, SimulationEvent, TranscriptRenderer,
};
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Grader {
    /// Ask the judge model whether the red-team objective was met
    Judge,
    /// Fail when the assistant repeats any restricted string
    Leakage,
}

#[derive(Parser)]
#[command(name = "simulate")]
#[command(about = "Red-team an assistant with a simulated user and grade the transcripts")]
struct Args {
    /// Dataset file (json, jsonl, yaml) or directory of dataset files
    #[arg(short, long)]
    dataset: PathBuf,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    assistant_model: Option<String>,

    #[arg(long)]
    counterpart_model: Option<String>,

    #[arg(long)]
    judge_model: Option<String>,

    #[arg(long, value_enum, default_value_t = Grader::Judge)]
    grader: Grader,

    /// Restricted string for the leakage grader (repeatable)
    #[arg(long = "restricted")]
    restricted: Vec<String>,

    #[arg(long)]
    max_turns: Option<usize>,

    #[arg(long)]
    concurrency: Option<usize>,

    /// Write the batch result as JSON to this path
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// API token (can also set OPENAI_API_KEY env var)
    #[arg(long)]
    token: Option<String>,

    /// Print every transcript, not only the failing ones
    #[arg(long)]
    show_transcripts: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,simulate=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SimulationConfig::from_yaml_file(path)?,
        None => SimulationConfig::default(),
    };
    if let Some(model) = args.assistant_model.clone() {
        config.assistant.model = model;
    }
    if let Some(model) = args.counterpart_model.clone() {
        config.counterpart.model = model;
    }
    if let Some(model) = args.judge_model.clone() {
        config.judge.model = model;
    }
    if let Some(max_turns) = args.max_turns {
        config.max_turns = max_turns;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if config.provider.api_key.is_none() {
        config.provider.api_key = args
            .token
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    }
    config.validate()?;

    let dataset = parley::load_dataset(&args.dataset)?;
    if dataset.is_empty() {
        warn!(path = %args.dataset.display(), "dataset is empty");
    }

    let mut provider: Arc<dyn LLMProvider> = Arc::new(OpenAI::from_config(config.openai_config()?)?);
    if let Some(limits) = &config.rate_limit {
        provider = Arc::new(RateLimitedProvider::new(provider, limits.limiter()));
    }
    let retry = config.retry.policy();

    let mut assistant = LlmAssistant::new(Arc::clone(&provider), config.assistant.model.clone())
        .with_retry_policy(retry);
    if let Some(prompt) = &config.assistant.system_prompt {
        assistant = assistant.with_system_prompt(prompt.clone());
    }
    if let Some(temperature) = config.assistant.temperature {
        assistant = assistant.with_temperature(temperature);
    }

    let mut counterpart = SimulatedUser::new(Arc::clone(&provider), config.counterpart.model.clone())
        .with_sentinel(config.counterpart.sentinel.clone())
        .with_fixed_responses(config.counterpart.fixed_responses.clone())
        .with_retry_policy(retry);
    if let Some(directive) = &config.counterpart.directive {
        counterpart = counterpart.with_directive(directive.clone());
    }
    if let Some(temperature) = config.counterpart.temperature {
        counterpart = counterpart.with_temperature(temperature);
    }

    let policy: Arc<dyn GradingPolicy> = match args.grader {
        Grader::Judge => {
            let mut judge = LlmJudge::new(Arc::clone(&provider), config.judge.model.clone())
                .with_retry_policy(retry);
            if let Some(prompt) = &config.judge.prompt {
                judge = judge.with_prompt(prompt.clone());
            }
            Arc::new(judge)
        }
        Grader::Leakage => {
            if args.restricted.is_empty() {
                return Err("the leakage grader needs at least one --restricted string".into());
            }
            Arc::new(LeakagePolicy::new(args.restricted.clone()))
        }
    };
    let evaluator = Evaluator::new(policy);

    let (cancel_handle, cancel_signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling outstanding conversations");
            cancel_handle.cancel();
        }
    });

    let assistant: Arc<dyn AgentAdapter> = Arc::new(assistant);
    let counterpart: Arc<dyn AgentAdapter> = Arc::new(counterpart);
    let runner = BatchRunner::new(assistant, counterpart)?
        .with_cancel_signal(cancel_signal)
        .with_event_callback(|example: &str, event: &SimulationEvent| match event {
            SimulationEvent::Message { agent, turn_count, .. } => {
                debug!(example, agent = %agent, turn_count, "message relayed");
            }
            SimulationEvent::Terminated { reason, turn_count, .. } => {
                debug!(example, reason = %reason, turn_count, "conversation finished");
            }
            SimulationEvent::Seeded { .. } => debug!(example, "conversation seeded"),
        });

    let batch = runner
        .run(&dataset, config.max_turns, &evaluator, config.concurrency)
        .await;

    let renderer = TranscriptRenderer::colored();
    for result in &batch.results {
        let status = match result.status {
            ExampleStatus::Passed => "PASS".green().bold(),
            ExampleStatus::Failed => "FAIL".red().bold(),
            ExampleStatus::Ungraded => "UNGRADED".yellow().bold(),
            ExampleStatus::Errored => "ERROR".red().bold(),
            ExampleStatus::Cancelled => "CANCELLED".dimmed(),
        };
        println!(
            "{status} {} ({}, {} turns)",
            result.example_id, result.termination_reason, result.turn_count
        );
        if let Some(rationale) = &result.rationale {
            println!("  {rationale}");
        }
        if let Some(error) = &result.error {
            println!("  {}", error.red());
        }
        if args.show_transcripts || result.status != ExampleStatus::Passed {
            print!("{}", renderer.render(&result.transcript));
            println!();
        }
    }

    let summary = &batch.summary;
    println!(
        "Total: {}, Passed: {}, Failed: {}, Ungraded: {}, Errors: {}, Cancelled: {}",
        summary.total,
        summary.passed_count,
        summary.failed_count,
        summary.ungraded_count,
        summary.error_count,
        summary.cancelled_count
    );

    if let Some(path) = &args.out {
        fs::write(path, serde_json::to_string_pretty(&batch)?)?;
    }

    if summary.all_passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

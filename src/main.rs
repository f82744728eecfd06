use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use bpaf::{OptionParser, Parser, construct, long};
use determinism::{
    ConsistencyJudge, EngineConfig, EvaluationConfig, EvaluationEngine, EvaluationSettings,
    ModelClient, ModelRequest, OpenAiJudge, OpenAiModelClient, Phase, StatusSnapshot,
    constants::{DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_TEST_COUNT},
};
use tracing::info;
use tracing_subscriber::{
    EnvFilter, fmt::time::ChronoLocal, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(Debug, Clone)]
struct RunArgs {
    model:    String,
    prompt:   String,
    system:   Option<String>,
    original: Option<String>,
    samples:  usize,
    retries:  u32,
    alerts:   bool,
    no_judge: bool,
    export:   Option<PathBuf>,
}

fn run_args() -> impl Parser<RunArgs> {
    let model = long("model")
        .help("Model id to evaluate")
        .argument::<String>("MODEL");
    let prompt = long("prompt")
        .help("User prompt repeated for every sample")
        .argument::<String>("TEXT");
    let system = long("system")
        .help("Optional system prompt")
        .argument::<String>("TEXT")
        .optional();
    let original = long("original")
        .help("Reference response; fetched from the model when omitted")
        .argument::<String>("TEXT")
        .optional();
    let samples = long("samples")
        .help("Number of repeated samples")
        .argument::<usize>("N")
        .fallback(DEFAULT_TEST_COUNT);
    let retries = long("retries")
        .help("Retries per sample after the first attempt")
        .argument::<u32>("N")
        .fallback(DEFAULT_MAX_RETRY_ATTEMPTS);
    let alerts = long("alerts").help("Report every throttled attempt").switch();
    let no_judge = long("no-judge")
        .help("Grade statistically without the judging model")
        .switch();
    let export = long("export")
        .help("Write the evaluation document to PATH")
        .argument::<PathBuf>("PATH")
        .optional();

    construct!(RunArgs {
        model,
        prompt,
        system,
        original,
        samples,
        retries,
        alerts,
        no_judge,
        export,
    })
}

fn cli() -> OptionParser<RunArgs> {
    run_args()
        .to_options()
        .descr("Repeat one model request and grade how consistent the answers are")
        .command("run")
        .to_options()
        .descr("Determinism evaluation against an OpenAI-compatible backend")
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_timer(ChronoLocal::rfc_3339())
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli().run();
    init_tracing();
    run(args).await
}

async fn run(args: RunArgs) -> Result<()> {
    let client = Arc::new(OpenAiModelClient::from_env()?);
    let judge: Option<Arc<dyn ConsistencyJudge>> = if args.no_judge {
        None
    } else {
        Some(Arc::new(OpenAiJudge::from_env()?))
    };
    let engine = EvaluationEngine::spawn(client.clone(), judge, EngineConfig::from_env()?)?;

    let mut request = ModelRequest::new(args.model.clone(), args.prompt.clone());
    if let Some(system) = &args.system {
        request = request.with_system_prompt(system.clone());
    }

    let original = match args.original.clone() {
        Some(text) => text,
        None => {
            client
                .invoke(&request)
                .await
                .context("failed to fetch the reference response")?
                .text
        }
    };

    let settings = EvaluationSettings {
        test_count:               args.samples,
        max_retry_attempts:       args.retries,
        enable_throttling_alerts: args.alerts,
    };
    let config = EvaluationConfig::from_settings("cli", request, original, &settings);

    let id = engine.start(config).await?;
    info!(evaluation_id = %id, model = %args.model, samples = args.samples, "cli.started");

    let mut subscription = engine.subscribe(id).await?;
    let mut outcome = None;
    while let Some(snapshot) = subscription.recv().await {
        print_progress(&snapshot);
        if snapshot.phase.is_terminal() || snapshot.phase == Phase::Idle {
            outcome = Some(snapshot);
            break;
        }
    }

    if let Some(snapshot) = &outcome {
        print_outcome(snapshot);
    }

    if let Some(path) = &args.export {
        let document = engine.export_evaluation_data(id).await?;
        tokio::fs::write(path, document)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Evaluation written to {}", path.display());
    }

    engine.shutdown().await;
    Ok(())
}

fn print_progress(snapshot: &StatusSnapshot) {
    let eta = snapshot
        .estimated_time_remaining_ms
        .map(|ms| format!(", ~{}s left", ms.div_ceil(1000)))
        .unwrap_or_default();
    println!(
        "[{}] {}/{} samples ({:.0}%), {} in flight, {} throttled, {} abandoned{}",
        snapshot.phase,
        snapshot.completed_count,
        snapshot.total_target,
        snapshot.progress_percent,
        snapshot.in_flight,
        snapshot.throttle_stats.throttled_count,
        snapshot.throttle_stats.abandoned_count,
        eta
    );
    if let Some(alert) = &snapshot.throttle_alert {
        println!("  ! {alert}");
    }
}

fn print_outcome(snapshot: &StatusSnapshot) {
    if let Some(grade) = &snapshot.grade {
        println!(
            "Grade {} ({:.1}/100, {:?}{})",
            grade.letter,
            grade.score,
            grade.method,
            if grade.partial { ", partial" } else { "" }
        );
        let metrics = &grade.metrics;
        println!(
            "  decision {:.2}  semantic {:.2}  structure {:.2}  tools {:.2}  exact {:.2}  length {:.2}",
            metrics.decision_consistency,
            metrics.semantic_equivalence,
            metrics.structural_consistency,
            metrics.tool_usage_consistency,
            metrics.exact_match_rate,
            metrics.length_consistency
        );
        println!(
            "  {} unique responses, {} match the original",
            metrics.unique_responses, metrics.matches_original
        );
        for variation in &grade.notable_variations {
            println!("  - {variation}");
        }
    }

    if let Some(error) = &snapshot.error {
        println!("Evaluation failed: {error}");
        for (rank, action) in error.actions.iter().enumerate() {
            println!("  {}. {action}", rank + 1);
        }
    }

    for recommendation in &snapshot.health.recommendations {
        println!("Recommendation: {recommendation}");
    }
}

//! rag-lab CLI
//!
//! Evaluates retrieval-augmented generation pipelines against labeled query
//! sets and compares configurations.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rag_lab::{
    config::Config,
    corpus::{ChunkConfig, Corpus},
    analysis::QueryIssue,
    evaluation::{EvaluationOptions, EvaluationRun, Evaluator, Metric, MetricValue, QueryStatus},
    experiment::{
        AbComparison, Comparison, ConfigurationOutcome, CorpusPipelineFactory,
        DEFAULT_CHUNK_SIZES, DEFAULT_K_VALUES, DEFAULT_OVERLAP_PERCENT, Experiment,
        ExperimentConfig, ExperimentOptions, ExperimentReport, ParamValue, ParameterSweep,
        Significance,
    },
    llm::LlmClient,
    persistence::{DEFAULT_REPORT_FILENAME, load_report, report_exists, report_size, save_report},
    pipeline::PipelineFactory,
    query::{QuerySet, create_sample_query_set, sample_documents},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// rag-lab - evaluate and compare RAG retrieval pipelines
#[derive(Parser)]
#[command(name = "rag-lab")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Where the corpus and queries come from and how the pipeline is assembled.
#[derive(Args, Clone)]
struct PipelineArgs {
    /// Query set: JSON, or text with one question per line (the built-in sample set when omitted)
    #[arg(long)]
    queries: Option<PathBuf>,

    /// Directory of .txt/.md documents (config data_dir, else the sample corpus)
    #[arg(long)]
    docs: Option<PathBuf>,

    /// Answer generator: extractive or llm
    #[arg(long, default_value = "extractive")]
    generator: String,

    /// Relevance scorer: none, keyword, reference or llm_judge
    #[arg(long, default_value = "keyword")]
    scorer: String,

    /// Only evaluate the first N queries
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one pipeline configuration against a query set
    Evaluate {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Number of chunks to retrieve (defaults to the configured K)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Chunk size in characters
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Chunk overlap in characters
        #[arg(long)]
        chunk_overlap: Option<usize>,

        /// Write the evaluation run to this file (.json or .yaml)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print per-query results
        #[arg(long)]
        details: bool,
    },

    /// Run a multi-configuration experiment
    #[command(subcommand)]
    Experiment(ExperimentCommand),

    /// Display a saved evaluation run or experiment report
    Show {
        /// Path to the report file (defaults to the experiment report under data/)
        report: Option<PathBuf>,

        /// Print the raw JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Write the sample corpus and query set to a directory
    Sample {
        /// Target directory
        #[arg(default_value = "data")]
        dir: PathBuf,
    },

    /// Test LLM connection
    Test,
}

#[derive(Subcommand)]
enum ExperimentCommand {
    /// Vary one parameter over a list of values
    Sweep {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Parameter to sweep (chunk_size and k have built-in presets)
        #[arg(long, default_value = "chunk_size")]
        param: String,

        /// Comma-separated values (preset defaults for chunk_size and k)
        #[arg(long, value_delimiter = ',')]
        values: Vec<String>,

        /// Run up to N configurations at once
        #[arg(long)]
        parallel: Option<usize>,

        /// Write the report to this file (.json or .yaml; defaults under data/)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare a candidate configuration against a baseline
    Ab {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Baseline parameters, e.g. "k=3,chunk_size=500"
        #[arg(long, default_value = "")]
        baseline: String,

        /// Candidate parameters, e.g. "k=5,chunk_size=500"
        #[arg(long)]
        candidate: String,

        /// Write the report to this file (.json or .yaml)
        #[arg(short, long, default_value = "data/ab_report.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet, cli.log_json);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Evaluate {
            pipeline,
            top_k,
            chunk_size,
            chunk_overlap,
            output,
            details,
        } => {
            cmd_evaluate(
                &config,
                &pipeline,
                top_k,
                chunk_size,
                chunk_overlap,
                output,
                details,
            )
            .await
        }
        Commands::Experiment(ExperimentCommand::Sweep {
            pipeline,
            param,
            values,
            parallel,
            output,
        }) => {
            let output = output.unwrap_or_else(default_report_path);
            cmd_sweep(&config, &pipeline, &param, &values, parallel, &output).await
        }
        Commands::Experiment(ExperimentCommand::Ab {
            pipeline,
            baseline,
            candidate,
            output,
        }) => cmd_ab(&config, &pipeline, &baseline, &candidate, &output).await,
        Commands::Show { report, json } => {
            cmd_show(&report.unwrap_or_else(default_report_path), json)
        }
        Commands::Sample { dir } => cmd_sample(&dir),
        Commands::Test => cmd_test(&config).await,
    }
}

fn default_report_path() -> PathBuf {
    Path::new("data").join(DEFAULT_REPORT_FILENAME)
}

/// Human-readable stderr logging, optionally JSON. `RUST_LOG` overrides the flags.
fn init_tracing(verbose: u8, quiet: bool, json: bool) {
    let level = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter())
    });
    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter())
    });

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .init();
}

fn load_queries(args: &PipelineArgs) -> Result<QuerySet> {
    let set = match &args.queries {
        Some(path) => QuerySet::load(path)
            .with_context(|| format!("Failed to load query set from {}", path.display()))?,
        None => {
            info!("No query set given, using the built-in sample set");
            create_sample_query_set()
        }
    };
    Ok(match args.limit {
        Some(n) => set.take(n),
        None => set,
    })
}

fn load_corpus(config: &Config, args: &PipelineArgs) -> Result<Corpus> {
    if let Some(dir) = &args.docs {
        return Corpus::load_dir(dir)
            .with_context(|| format!("Failed to load documents from {}", dir.display()));
    }
    if config.corpus.data_dir.is_dir() {
        match Corpus::load_dir(&config.corpus.data_dir) {
            Ok(corpus) => return Ok(corpus),
            Err(e) => warn!(error = %e, "Could not use the configured data directory"),
        }
    }
    info!("No documents found, using the built-in sample corpus");
    Ok(Corpus::from_pairs(sample_documents()))
}

fn build_factory(config: &Config, args: &PipelineArgs) -> Result<CorpusPipelineFactory> {
    let corpus = Arc::new(load_corpus(config, args)?);
    info!(documents = corpus.len(), "Loaded corpus");

    let chunking = ChunkConfig {
        chunk_size: config.corpus.chunk_size,
        chunk_overlap: config.corpus.chunk_overlap,
    };
    let mut factory = CorpusPipelineFactory::new(corpus, chunking);

    let needs_llm = args.generator.eq_ignore_ascii_case("llm")
        || args.scorer.eq_ignore_ascii_case("llm_judge");
    if needs_llm {
        config
            .validate_llm()
            .context("LLM settings are required for the llm generator or llm_judge scorer")?;
        factory = factory.with_llm(config.llm.clone());
    }

    Ok(factory
        .with_generator(args.generator.parse()?)
        .with_scorer(args.scorer.parse()?))
}

/// Parse "k=3,chunk_size=500" into a configuration.
fn parse_assignments(name: &str, assignments: &str) -> Result<ExperimentConfig> {
    let mut config = ExperimentConfig::new(name);
    for pair in assignments.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected key=value, got '{}'", pair))?;
        config = config.with_param(key.trim(), ParamValue::parse(value));
    }
    Ok(config)
}

async fn cmd_evaluate(
    config: &Config,
    args: &PipelineArgs,
    top_k: Option<usize>,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
    output: Option<PathBuf>,
    details: bool,
) -> Result<()> {
    let queries = load_queries(args)?;
    let factory = build_factory(config, args)?;

    let mut params = ExperimentConfig::new("evaluate");
    if let Some(size) = chunk_size {
        params = params.with_param("chunk_size", size);
    }
    if let Some(overlap) = chunk_overlap {
        params = params.with_param("chunk_overlap", overlap);
    }
    let k = params
        .retrieval_k(top_k.unwrap_or(config.eval.retrieval_k))
        .context("Invalid retrieval depth")?;

    let pipeline = factory
        .build(&params)
        .await
        .context("Failed to build pipeline")?;

    println!(
        "Evaluating {} queries from '{}' (k = {})",
        queries.len(),
        queries.name,
        k
    );

    let evaluator = Evaluator::new(EvaluationOptions::from(&config.eval));
    let run = evaluator
        .evaluate(&queries, &pipeline, None, k)
        .await
        .context("Evaluation failed")?;

    print_run(&run, details);

    if let Some(path) = output {
        save_report(&run, &path).context("Failed to save evaluation run")?;
        println!("\nRun saved to: {}", path.display());
    }

    Ok(())
}

async fn cmd_sweep(
    config: &Config,
    args: &PipelineArgs,
    param: &str,
    values: &[String],
    parallel: Option<usize>,
    output: &Path,
) -> Result<()> {
    let queries = load_queries(args)?;
    let factory = build_factory(config, args)?;
    let base = ExperimentConfig::new("base");

    let sweep = match param {
        "chunk_size" if values.is_empty() => {
            ParameterSweep::chunk_sizes(base, &DEFAULT_CHUNK_SIZES, DEFAULT_OVERLAP_PERCENT)
        }
        "chunk_size" => {
            let sizes = values
                .iter()
                .map(|v| v.trim().parse::<usize>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("chunk_size values must be positive integers")?;
            ParameterSweep::chunk_sizes(base, &sizes, DEFAULT_OVERLAP_PERCENT)
        }
        "k" | "top_k" if values.is_empty() => ParameterSweep::k_values(base, &DEFAULT_K_VALUES),
        _ if values.is_empty() => anyhow::bail!("--values is required when sweeping '{}'", param),
        _ => ParameterSweep::new(base, param, values.iter().map(|v| ParamValue::parse(v))),
    };

    let mut options = ExperimentOptions::from(&config.eval);
    if let Some(parallel) = parallel {
        options.max_parallel_configurations = parallel;
    }

    println!(
        "Sweeping '{}' over {} values with {} queries",
        sweep.parameter(),
        sweep.values().len(),
        queries.len()
    );

    let report = Experiment::new(format!("{}-sweep", sweep.parameter()), options)
        .run_sweep(&sweep, &queries, &factory)
        .await
        .context("Experiment failed")?;

    print_report(&report);
    save_report(&report, output).context("Failed to save report")?;
    println!("\nReport saved to: {}", output.display());

    Ok(())
}

async fn cmd_ab(
    config: &Config,
    args: &PipelineArgs,
    baseline: &str,
    candidate: &str,
    output: &Path,
) -> Result<()> {
    let queries = load_queries(args)?;
    let factory = build_factory(config, args)?;
    let baseline = parse_assignments("baseline", baseline)?;
    let candidate = parse_assignments("candidate", candidate)?;

    println!("A/B comparison with {} queries", queries.len());

    let report = Experiment::new("ab-test", ExperimentOptions::from(&config.eval))
        .run_ab(baseline, candidate, &queries, &factory)
        .await
        .context("Experiment failed")?;

    print_report(&report);
    save_report(&report, output).context("Failed to save report")?;
    println!("\nReport saved to: {}", output.display());

    Ok(())
}

fn cmd_show(path: &Path, json: bool) -> Result<()> {
    if !report_exists(path) {
        anyhow::bail!("Report not found at '{}'.", path.display());
    }

    if json {
        let value: serde_json::Value = load_report(path).context("Failed to load report")?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let size = report_size(path)?;
    println!("{} ({:.1} KB)\n", path.display(), size as f64 / 1024.0);

    if let Ok(report) = load_report::<ExperimentReport>(path) {
        print_report(&report);
    } else {
        let run: EvaluationRun = load_report(path).context("Failed to load report")?;
        print_run(&run, true);
    }

    Ok(())
}

fn cmd_sample(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    for (id, text) in sample_documents() {
        let path = dir.join(format!("{}.txt", id));
        std::fs::write(&path, text)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let queries_path = dir.join("queries.json");
    create_sample_query_set()
        .save_json(&queries_path)
        .context("Failed to write sample query set")?;

    println!(
        "Wrote {} documents and {} to {}",
        sample_documents().len(),
        queries_path.display(),
        dir.display()
    );
    Ok(())
}

async fn cmd_test(config: &Config) -> Result<()> {
    println!("Testing LLM connection...\n");

    println!("Configuration:");
    println!("  API Base:  {}", config.llm.api_base);
    println!("  Model:     {}", config.llm.model);
    println!(
        "  API Key:   {}...",
        config.llm.api_key.chars().take(8).collect::<String>()
    );
    println!();

    if let Err(e) = config.validate_llm() {
        println!("Configuration error: {}", e);
        return Ok(());
    }

    let client = LlmClient::new(config.llm.clone());

    println!("Sending test request...");
    match client.test_connection().await {
        Ok(()) => println!("Connection successful!"),
        Err(e) => {
            warn!(error = %e, "LLM connection test failed");
            println!("Connection failed: {}", e);
        }
    }

    Ok(())
}

fn fmt_value(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.3}", v))
        .unwrap_or_else(|| "-".to_string())
}

fn fmt_cell(cell: &MetricValue) -> String {
    match cell {
        MetricValue::Computed { value } => format!("{:.3}", value),
        MetricValue::Excluded { .. } => "excluded".to_string(),
        MetricValue::Failed { .. } => "failed".to_string(),
    }
}

fn print_run(run: &EvaluationRun, details: bool) {
    let agg = &run.aggregate;

    println!("\nEvaluation Results");
    println!("{}", "─".repeat(60));
    println!("  Query set:    {}", run.query_set);
    println!(
        "  Queries:      {} total, {} succeeded, {} failed",
        agg.total, agg.succeeded, agg.failed
    );
    println!("  K:            {}", run.k);
    if let Some(scorer) = &run.scorer {
        println!("  Scorer:       {}", scorer);
    }
    println!();

    for metric in Metric::ALL {
        if let Some(cell) = agg.cell(metric) {
            println!(
                "  {:<14} {:>8}   (n = {})",
                metric.name(),
                fmt_cell(&cell.value),
                cell.denominator
            );
        }
    }

    if let Some(latency) = &agg.latency.total {
        println!(
            "\n  Latency:      mean {:.1} ms, median {:.1} ms, p95 {:.1} ms",
            latency.mean, latency.median, latency.p95
        );
    }
    println!("  Throughput:   {:.2} queries/s", agg.throughput_qps);
    println!("  Duration:     {:.1} ms", run.duration_ms);
    if let Some(length) = &agg.answer_length {
        println!("  Answers:      {:.0} characters on average", length.mean);
    }

    let popularity = &run.analysis.popularity;
    print!(
        "  Retrieval:    {} unique chunks in {} retrievals",
        popularity.unique_chunks, popularity.total_retrievals
    );
    match (run.index_chunks, popularity.coverage) {
        (Some(total), Some(coverage)) => {
            println!(", {:.1}% of {} indexed", coverage * 100.0, total)
        }
        _ => println!(),
    }
    for source in popularity.sources.iter().take(5) {
        println!("                {}x {}", source.count, source.id);
    }
    for rank in &run.analysis.rank_statistics {
        println!(
            "  rank {:<2}      mean score {:.3} (min {:.3}, max {:.3})",
            rank.rank, rank.scores.mean, rank.scores.min, rank.scores.max
        );
    }
    if !run.analysis.flagged.is_empty() {
        println!("\n  Flagged queries:");
        for flagged in &run.analysis.flagged {
            let issue = match &flagged.issue {
                QueryIssue::NoResults => "no results".to_string(),
                QueryIssue::PoorSimilarity { best_score } => {
                    format!("poor similarity (best {:.3})", best_score)
                }
                QueryIssue::LowDiscrimination { std_dev } => {
                    format!("low discrimination (std {:.4})", std_dev)
                }
            };
            println!("    {} {}: {}", flagged.query_id, issue, flagged.query);
        }
    }

    if details {
        println!("\nPer-query results:");
        for q in &run.queries {
            if q.succeeded() {
                let ids: Vec<&str> = q.retrieved.iter().map(|c| c.chunk_id.as_str()).collect();
                println!(
                    "  {} P={} R={} RR={}  [{}]",
                    q.query_id,
                    fmt_value(q.metrics.precision.value()),
                    fmt_value(q.metrics.recall.value()),
                    fmt_value(q.metrics.mrr.value()),
                    ids.join(", ")
                );
            } else if let QueryStatus::Failed { category, message } = &q.status {
                println!("  {} FAILED ({}): {}", q.query_id, category, message);
            }
        }
    }
    println!("{}", "─".repeat(60));
}

fn print_report(report: &ExperimentReport) {
    println!("\nExperiment: {}", report.name);
    println!("{}", "─".repeat(72));
    println!(
        "{:<24} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8} {:>8}",
        "configuration", "precision", "recall", "mrr", "ndcg", "latency", "chunks", "answer"
    );

    for result in &report.results {
        match &result.outcome {
            ConfigurationOutcome::Completed { .. } => println!(
                "{:<24} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8} {:>8}",
                result.name,
                fmt_cell(&result.cell(Metric::Precision)),
                fmt_cell(&result.cell(Metric::Recall)),
                fmt_cell(&result.cell(Metric::ReciprocalRank)),
                fmt_cell(&result.cell(Metric::Ndcg)),
                fmt_cell(&result.cell(Metric::LatencyMs)),
                result
                    .index_chunks()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                result
                    .mean_answer_length()
                    .map(|n| format!("{:.0}", n))
                    .unwrap_or_else(|| "-".to_string()),
            ),
            ConfigurationOutcome::Excluded { reason } => {
                println!("{:<24} excluded: {}", result.name, reason)
            }
            ConfigurationOutcome::Failed { category, message } => {
                println!("{:<24} failed ({}): {}", result.name, category, message)
            }
        }
    }

    match &report.comparison {
        Some(Comparison::Sweep(sweep)) => {
            println!("\nTrends over '{}':", sweep.parameter);
            for trend in &sweep.trends {
                let best = trend
                    .best
                    .as_ref()
                    .map(|p| p.parameter_value.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<14} {:<11} best at {}",
                    trend.metric.name(),
                    format!("{:?}", trend.direction).to_lowercase(),
                    best
                );
            }
        }
        Some(Comparison::AbTest(AbComparison::Available {
            baseline,
            candidate,
            metrics,
        })) => {
            println!("\n{} vs {}:", candidate, baseline);
            for delta in metrics {
                let significance = match &delta.significance {
                    Significance::Computed {
                        test, significant, ..
                    } => format!(
                        "p = {:.4}{}",
                        test.p_value,
                        if *significant { " *" } else { "" }
                    ),
                    Significance::InsufficientData {
                        required,
                        available,
                    } => format!("insufficient data ({}/{})", available, required),
                    Significance::Unavailable { reason } => format!("n/a ({})", reason),
                };
                println!(
                    "  {:<14} {:>8} -> {:>8}  delta {:>8}  {}",
                    delta.metric.name(),
                    fmt_cell(&delta.baseline),
                    fmt_cell(&delta.candidate),
                    fmt_value(delta.delta),
                    significance
                );
            }
        }
        Some(Comparison::AbTest(AbComparison::Unavailable { reason, .. })) => {
            println!("\nA/B comparison unavailable: {}", reason);
        }
        None => {}
    }
    println!("{}", "─".repeat(72));
}

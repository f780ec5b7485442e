//! Diligence Co-Pilot CLI
//!
//! The `diligence` command runs due-diligence sessions over a JSON evidence
//! corpus with the built-in extractive agents.
//!
//! ## Commands
//!
//! - `run`: submit a session and print the briefing when it finishes
//! - `status`: show task states of a session
//! - `ask`: answer a question grounded in a session's evidence
//! - `resume`: continue a session interrupted by a restart
//! - `report`: print the stored briefing of a session
//! - `list`: list sessions
//! - `similar`: search the corpus for comparable startups
//! - `invest`: record a startup's investment status in the corpus

mod corpus;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use diligence_core::{
    telemetry::init_tracing, AgentRegistry, DiligenceError, DiligenceService, HashingEmbedder,
    InMemoryStructuredStore, InMemoryVectorStore, OrchestratorConfig, RetrievalAdapter,
    SessionEvent, SessionId, SessionStatus, SimilarStartupQuery, SubmitOptions, SynthesisError,
    SynthesisResult,
};
use diligence_state::{SessionStore, SurrealSessionStore};

use crate::corpus::{load_profile, Corpus};

#[derive(Parser)]
#[command(name = "diligence")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-agent due-diligence co-pilot", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Orchestrator config file (TOML)
    #[arg(short, long, global = true, env = "DILIGENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Evidence corpus (JSON with `chunks` and `rows`)
    #[arg(long, global = true, env = "DILIGENCE_CORPUS")]
    corpus: Option<PathBuf>,

    /// Local session store directory (default: resolved from SURREALDB_* env)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Markdown,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Invested {
    Yes,
    No,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a session and wait for its briefing
    Run {
        /// Startup profile (JSON)
        #[arg(short, long)]
        profile: PathBuf,

        /// Analyses to run
        #[arg(
            short,
            long,
            value_delimiter = ',',
            default_value = "summary,competitor,industry,web_search,qa"
        )]
        analyses: Vec<String>,

        /// Question for the Q&A analysis (repeatable)
        #[arg(short, long)]
        question: Vec<String>,

        /// Session deadline override in milliseconds
        ///
        /// A task waits for its optional upstreams (web search feeding Q&A)
        /// to settle. A slow optional upstream therefore holds its dependent
        /// until the deadline, and the dependent ends cancelled without
        /// having run.
        #[arg(long)]
        deadline_ms: Option<u64>,

        /// Session concurrency override
        #[arg(long)]
        max_concurrent: Option<usize>,

        #[arg(short, long, value_enum, default_value = "markdown")]
        format: Format,
    },

    /// Show task states of a session
    Status {
        session: String,
    },

    /// Ask a question about a session
    Ask {
        session: String,
        question: String,
    },

    /// Resume an interrupted session
    ///
    /// A crashed process keeps the session's writer lease until it expires
    /// (`lease_ttl_ms`, 30 seconds by default). Resuming before then fails
    /// with a writer conflict; retry once the lease has lapsed.
    Resume {
        session: String,

        #[arg(short, long, value_enum, default_value = "markdown")]
        format: Format,
    },

    /// Print a session's briefing
    Report {
        session: String,

        #[arg(short, long, value_enum, default_value = "markdown")]
        format: Format,
    },

    /// List sessions
    List {
        /// Only sessions with this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Find startups in the corpus similar to a description
    Similar {
        /// Free-text description to match
        #[arg(required = true)]
        terms: Vec<String>,

        /// Only startups in this industry
        #[arg(long)]
        industry: Option<String>,

        /// Only portfolio (yes) or non-portfolio (no) startups
        #[arg(long, value_enum)]
        invested: Option<Invested>,

        /// Leave this startup out of the results
        #[arg(long)]
        exclude: Option<String>,

        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize,
    },

    /// Record whether a startup is a portfolio company
    ///
    /// Rewrites the `invested` metadata of every corpus chunk for the startup
    /// and saves the corpus file.
    Invest {
        /// Startup name as recorded in chunk metadata
        startup: String,

        /// Mark the startup as not invested
        #[arg(long)]
        no: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = OrchestratorConfig::load(cli.config.as_deref())
        .context("Failed to load orchestrator config")?;
    let store = open_store(cli.db.as_deref()).await?;
    // `invest` writes the corpus back, so it must not pick up local embeddings.
    let embed = !matches!(cli.command, Commands::Invest { .. });
    let (service, stores) = build_service(store, cli.corpus.as_deref(), config, embed).await?;

    match cli.command {
        Commands::Run {
            profile,
            analyses,
            question,
            deadline_ms,
            max_concurrent,
            format,
        } => {
            let options = SubmitOptions {
                questions: question,
                session_deadline_ms: deadline_ms,
                max_concurrent,
            };
            cmd_run(&service, &profile, &analyses, options, format).await
        }
        Commands::Status { session } => cmd_status(&service, &SessionId(session)).await,
        Commands::Ask { session, question } => {
            cmd_ask(&service, &SessionId(session), &question).await
        }
        Commands::Resume { session, format } => {
            cmd_resume(&service, &SessionId(session), format).await
        }
        Commands::Report { session, format } => {
            let report = service
                .report(&SessionId(session))
                .await
                .context("Failed to load report")?;
            print_report(&report, format)
        }
        Commands::List { status } => cmd_list(&service, status.as_deref()).await,
        Commands::Similar {
            terms,
            industry,
            invested,
            exclude,
            top_k,
        } => {
            let mut query = SimilarStartupQuery::new(terms.join(" "), top_k);
            query.industry = industry;
            query.exclude = exclude;
            if let Some(invested) = invested {
                query = query.with_invested(invested == Invested::Yes);
            }
            cmd_similar(&service, &query).await
        }
        Commands::Invest { startup, no } => {
            let Some(path) = cli.corpus.as_deref() else {
                bail!("invest needs a corpus file (--corpus or DILIGENCE_CORPUS)");
            };
            cmd_invest(&service, &stores, path, &startup, !no).await
        }
    }
}

async fn open_store(db: Option<&Path>) -> Result<Arc<dyn SessionStore>> {
    let store = match db {
        Some(path) => SurrealSessionStore::open_local(path).await,
        None => SurrealSessionStore::from_env().await,
    }
    .context("Failed to connect to session store")?;
    Ok(Arc::new(store))
}

type Stores = (Arc<InMemoryVectorStore>, Arc<InMemoryStructuredStore>);

/// Load the corpus, optionally embed its bare chunks, and wire a service over it.
async fn build_service(
    store: Arc<dyn SessionStore>,
    corpus: Option<&Path>,
    config: OrchestratorConfig,
    embed: bool,
) -> Result<(DiligenceService, Stores)> {
    let corpus = match corpus {
        Some(path) => Corpus::load(path)?,
        None => Corpus::default(),
    };
    info!(
        chunks = corpus.chunks.len(),
        rows = corpus.rows.len(),
        "corpus loaded"
    );
    let (vector, structured) = corpus.into_stores();

    let mut adapter = RetrievalAdapter::new(vector.clone(), structured.clone(), &config);
    if embed {
        let embedder = Arc::new(HashingEmbedder::default());
        let embedded = vector
            .embed_missing(embedder.as_ref())
            .await
            .context("Failed to embed corpus")?;
        if embedded > 0 {
            info!(embedded, "embedded corpus chunks locally");
        }
        adapter = adapter.with_embedder(embedder);
    }
    let service = DiligenceService::from_adapter(store, adapter, AgentRegistry::extractive(), config)
        .context("Failed to build diligence service")?;
    Ok((service, (vector, structured)))
}

async fn cmd_run(
    service: &DiligenceService,
    profile: &Path,
    analyses: &[String],
    options: SubmitOptions,
    format: Format,
) -> Result<()> {
    let profile = load_profile(profile)?;
    let session_id = service
        .submit(profile, analyses, options)
        .await
        .context("Failed to submit session")?;
    eprintln!("session {session_id}");

    let report = follow(service, &session_id).await?;
    print_report(&report, format)
}

async fn cmd_resume(
    service: &DiligenceService,
    session_id: &SessionId,
    format: Format,
) -> Result<()> {
    service
        .resume(session_id)
        .await
        .with_context(|| format!("Failed to resume session {session_id}"))?;
    let report = follow(service, session_id).await?;
    print_report(&report, format)
}

/// Print progress until the session finishes. Ctrl-C cancels it.
async fn follow(service: &DiligenceService, session_id: &SessionId) -> Result<SynthesisResult> {
    // A session that already finished has no event stream left.
    let mut events = match service.subscribe(session_id) {
        Ok(events) => Some(events),
        Err(DiligenceError::NotActive(_)) => None,
        Err(e) => return Err(e.into()),
    };
    let progress = tokio::spawn(async move {
        let Some(events) = events.as_mut() else {
            return;
        };
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::TaskChanged {
                    task_id,
                    state,
                    attempt,
                    ..
                } => eprintln!("  {task_id} {state} (attempt {attempt})"),
                SessionEvent::SessionFinished { .. } => break,
            }
        }
    });

    let finished = tokio::select! {
        report = service.wait(session_id) => report,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("cancelling...");
            match service.cancel(session_id) {
                Ok(()) | Err(DiligenceError::NotActive(_)) => {}
                Err(e) => return Err(e.into()),
            }
            service.wait(session_id).await
        }
    };
    let report = finished.context("Session did not finish")?;

    progress.abort();
    eprintln!("session {}", report.status);
    Ok(report)
}

async fn cmd_status(service: &DiligenceService, session_id: &SessionId) -> Result<()> {
    let record = service
        .status(session_id)
        .await
        .with_context(|| format!("Failed to read session {session_id}"))?;

    println!("session  {}", record.session_id);
    println!("startup  {} ({})", record.profile.name, record.profile.industry);
    println!("status   {}", record.status);
    println!(
        "updated  {}",
        record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();
    for task in &record.tasks {
        let mut line = format!(
            "  {:<12} {:<10} attempts={}",
            task.task_id.as_str(),
            task.state.to_string(),
            task.attempts
        );
        if !task.gaps.is_empty() {
            let gaps: Vec<_> = task.gaps.iter().map(|g| g.as_str()).collect();
            line.push_str(&format!(" gaps={}", gaps.join(",")));
        }
        if let Some(error) = &task.error {
            line.push_str(&format!(" error=\"{error}\""));
        }
        println!("{line}");
    }
    println!();
    println!("evidence {}", record.evidence.len());
    Ok(())
}

async fn cmd_ask(service: &DiligenceService, session_id: &SessionId, question: &str) -> Result<()> {
    match service.ask(session_id, question).await {
        Ok(answer) => {
            println!("{}", answer.text);
            println!();
            for citation in &answer.citations {
                println!("[{}] {}", citation.id, citation.excerpt);
            }
            Ok(())
        }
        Err(DiligenceError::Synthesis(SynthesisError::InsufficientContext { .. })) => {
            println!("Cannot answer: no relevant evidence was found for this question.");
            Ok(())
        }
        Err(e) => Err(e).context("Failed to answer question"),
    }
}

async fn cmd_list(service: &DiligenceService, status: Option<&str>) -> Result<()> {
    let status = match status {
        Some(s) => match s.parse::<SessionStatus>() {
            Ok(status) => Some(status),
            Err(e) => bail!(e),
        },
        None => None,
    };
    let sessions = service.list(status).await?;
    if sessions.is_empty() {
        println!("No sessions found");
    }
    for session_id in sessions {
        println!("{session_id}");
    }
    Ok(())
}

async fn cmd_similar(service: &DiligenceService, query: &SimilarStartupQuery) -> Result<()> {
    let found = service
        .similar_startups(query)
        .await
        .context("Failed to search similar startups")?;
    if found.is_empty() {
        println!("No similar startups found");
    }
    for startup in found {
        let portfolio = if startup.invested { " [portfolio]" } else { "" };
        println!(
            "{:.3}  {} ({}){portfolio}",
            startup.score,
            startup.startup_name,
            startup.industry.as_deref().unwrap_or("unknown industry")
        );
        for url in &startup.linkedin_urls {
            println!("       {url}");
        }
    }
    Ok(())
}

async fn cmd_invest(
    service: &DiligenceService,
    stores: &Stores,
    corpus: &Path,
    startup: &str,
    invested: bool,
) -> Result<()> {
    let updated = service
        .update_investment_status(startup, invested)
        .await
        .with_context(|| format!("Failed to update investment status of {startup}"))?;
    let (vector, structured) = stores;
    Corpus::from_stores(vector, structured).save(corpus)?;
    println!(
        "{startup}: invested={} ({updated} chunks updated)",
        if invested { "yes" } else { "no" }
    );
    Ok(())
}

fn print_report(report: &SynthesisResult, format: Format) -> Result<()> {
    match format {
        Format::Markdown => print!("{}", report.to_markdown()),
        Format::Json => println!(
            "{}",
            serde_json::to_string_pretty(report).context("Failed to serialize report")?
        ),
    }
    Ok(())
}

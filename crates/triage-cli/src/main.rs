//! triage - streaming client for fan-out expert analysis

mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use triage_session::{
    QueryRequest, Session, SessionConfig, SessionPhase, SessionUpdate, SseEventSource,
};
use triage_stream::{ConversationState, RunStatus, SequencerConfig};

/// triage - stream a fan-out expert analysis and render its progress
#[derive(Parser, Debug)]
#[command(name = "triage")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Natural-language query to analyze
    query: Option<String>,

    /// Backend base URL (default: http://localhost:8000)
    #[arg(short, long)]
    url: Option<String>,

    /// Conversation id to scope the run; generated when omitted
    #[arg(long)]
    thread_id: Option<String>,

    /// Arbitrary JSON forwarded to the experts
    #[arg(long)]
    input: Option<String>,

    /// How long to wait on a sequence gap before force-applying, in ms
    #[arg(long)]
    gap_timeout_ms: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("triage=debug")
            .init();
    }

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let Some(query) = args.query else {
        anyhow::bail!("a query is required; see --help");
    };

    let cfg = config::Config::load();
    let url = args
        .url
        .or(cfg.url)
        .unwrap_or_else(|| "http://localhost:8000".to_string());

    let mut sequencer = SequencerConfig::default();
    if let Some(ms) = args.gap_timeout_ms.or(cfg.gap_timeout_ms) {
        sequencer.gap_timeout = Duration::from_millis(ms);
    }
    if let Some(max) = cfg.max_buffered {
        sequencer.max_buffered = max;
    }

    let mut request = QueryRequest::new(query);
    if let Some(thread_id) = args.thread_id {
        request = request.with_thread_id(thread_id);
    }
    if let Some(input) = args.input {
        request.input = serde_json::from_str(&input)
            .map_err(|e| anyhow::anyhow!("--input is not valid JSON: {e}"))?;
    }

    let transport = Arc::new(SseEventSource::new(url));
    let session = Session::with_config(transport, SessionConfig { sequencer });
    let mut updates = session.subscribe();

    session.start(request).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            session.cancel();
            eprintln!("\ninterrupted, partial results follow");
        }
        _ = drive(&session, &mut updates) => {}
    }

    let state = session.snapshot();
    render_outcome(&state, session.phase());

    if state.run_status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Print timeline entries as they are applied, until the session settles
async fn drive(session: &Session, updates: &mut broadcast::Receiver<SessionUpdate>) {
    let mut printed = 0;
    loop {
        match updates.recv().await {
            Ok(SessionUpdate::Applied { .. }) => {
                let state = session.snapshot();
                for entry in &state.timeline[printed..] {
                    println!("[{:>4}] {}", entry.sequence, entry.text);
                }
                printed = state.timeline.len();
            }
            Ok(SessionUpdate::Phase(phase)) => {
                tracing::debug!(?phase, "session phase changed");
                if phase.is_terminal() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "renderer lagged behind session updates");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn render_outcome(state: &ConversationState, phase: SessionPhase) {
    let buckets = triage_stream::lanes_by_status(state);
    let progress = triage_stream::progress_fraction(state) * 100.0;

    println!();
    match state.expected_record_count {
        Some(expected) => println!(
            "records: {}/{} ({progress:.0}%)",
            state.processed_record_count, expected
        ),
        None => println!("records: {}", state.processed_record_count),
    }

    if !buckets.is_empty() {
        for lane in &buckets.completed {
            match lane.confidence {
                Some(c) => println!("  done    {} (confidence {c:.2})", lane.lane_id),
                None => println!("  done    {}", lane.lane_id),
            }
        }
        for lane in &buckets.failed {
            println!(
                "  failed  {} ({})",
                lane.lane_id,
                lane.error_message.as_deref().unwrap_or("no details")
            );
        }
        for lane in &buckets.processing {
            println!("  partial {}", lane.lane_id);
        }
        for lane in &buckets.pending {
            println!("  pending {}", lane.lane_id);
        }
    }

    if let Some(summary) = &state.final_summary {
        println!("\n{summary}");
    }

    for error in &state.errors {
        eprintln!("error[{}]: {}", error.code, error.message);
    }

    if phase == SessionPhase::Cancelled {
        eprintln!("run cancelled; results above are partial");
    }
}

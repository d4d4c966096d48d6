use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use harvest_client::{
    ApiClient, ApiConfig, CatalogExtractor, HttpCallbackTransport, build_contexts, teardown_all,
};
use harvest_core::callback::{CallbackChannel, CallbackConfig};
use harvest_core::chunk::ChunkSender;
use harvest_core::collector::{CollectOutcome, Collector, TracingCollectReporter};
use harvest_core::context::{ContextPool, ExecutionMode, RunContext};
use harvest_core::metrics::RunSummary;
use harvest_core::profile::SupplierProfile;
use harvest_core::rate_limit::RateLimitConfig;
use harvest_core::session::{PhaseDecision, SessionState, collect_gate, reset_gate};
use harvest_core::task::WorkerConfig;
use harvest_core::traits::{Extractor, SessionApi};
use harvest_core::worker::{EMPTY_FIRST_CLAIM, QueueWorker, TracingWorkerReporter};

/// Conventional exit status after SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "harvest", version, about = "Supplier catalog collector and product queue worker")]
struct Cli {
    /// Supplier profile (JSON)
    #[arg(short, long, env = "HARVEST_PROFILE", global = true)]
    profile: Option<PathBuf>,

    /// Parsing session id; enables session gating and callbacks
    #[arg(long, env = "PARSER_SESSION_ID", global = true)]
    session_id: Option<String>,

    /// Callback endpoint (overrides PARSER_CALLBACK_URL)
    #[arg(long, global = true)]
    api_callback: Option<String>,

    /// Callback token (overrides PARSER_CALLBACK_TOKEN)
    #[arg(long, global = true)]
    api_token: Option<String>,

    /// HMAC secret for save-urls (overrides PARSER_HMAC_SECRET)
    #[arg(long, global = true)]
    hmac_secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk the catalog and send discovered product URLs to the Store
    Collect,

    /// Re-queue every known URL of the supplier
    Reset,

    /// Claim, extract and report product pages until the queue is drained
    Queue(QueueArgs),

    /// Collect, reset, then run the queue in strict mode
    FullScan(QueueArgs),
}

#[derive(Args, Clone)]
struct QueueArgs {
    /// URLs per claim
    #[arg(long, env = "PARSER_BATCH_SIZE", default_value_t = 20)]
    batch_size: usize,

    /// Concurrent execution contexts (at most 5)
    #[arg(long, env = "PARSER_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// In-flight requests per domain (defaults to concurrency)
    #[arg(long, env = "PARSER_DOMAIN_LIMIT")]
    domain_limit: Option<usize>,

    /// Minimum spacing between requests to one domain, in seconds
    #[arg(long, env = "PARSER_REQUEST_DELAY")]
    min_request_interval: Option<f64>,

    /// Only claim URLs of this material type
    #[arg(long)]
    material_type: Option<String>,

    /// Re-parse done URLs older than this many days
    #[arg(long, default_value_t = 7)]
    reparse_days: u32,

    /// Stop after this many claimed batches
    #[arg(long)]
    max_batches: Option<u32>,

    /// Fail when the first claim comes back empty
    #[arg(long, default_value_t = false)]
    strict: bool,

    #[arg(long, env = "PARSER_WORKER_ID")]
    worker_id: Option<String>,

    /// cooperative | thread-pool
    #[arg(long, env = "PARSER_EXECUTION_MODE", default_value = "cooperative")]
    execution_mode: ExecutionMode,
}

fn main() -> Result<ExitCode> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = build_runtime(&cli)?;

    let shutdown = CancellationToken::new();
    let code = runtime.block_on(async {
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping");
                signal.cancel();
            }
        });

        let result = run(cli, shutdown.clone()).await;
        if shutdown.is_cancelled() {
            return ExitCode::from(EXIT_INTERRUPTED);
        }
        match result {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Run failed");
                ExitCode::FAILURE
            }
        }
    });
    runtime.shutdown_timeout(Duration::from_secs(5));
    Ok(code)
}

/// Current-thread runtime for cooperative runs; one worker thread per
/// context otherwise.
fn build_runtime(cli: &Cli) -> Result<tokio::runtime::Runtime> {
    let thread_pool = match &cli.command {
        Commands::Queue(args) | Commands::FullScan(args) => {
            (args.execution_mode == ExecutionMode::ThreadPool).then_some(args.concurrency.max(1))
        }
        _ => None,
    };
    let runtime = match thread_pool {
        Some(threads) => tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .enable_all()
            .build(),
        None => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build(),
    };
    runtime.context("Failed to build tokio runtime")
}

/// Everything a phase needs, resolved once per process.
struct Env {
    profile: Arc<SupplierProfile>,
    api: ApiClient,
    api_config: ApiConfig,
    session_id: Option<String>,
    callbacks: CallbackChannel,
    shutdown: CancellationToken,
}

impl Env {
    fn run_context(&self, rate_limit: RateLimitConfig) -> RunContext {
        RunContext::with_shutdown(self.session_id.clone(), rate_limit, self.shutdown.clone())
    }

    /// Session state, or `None` when running without a session.
    async fn session_state(&self) -> Result<Option<SessionState>> {
        let Some(session_id) = &self.session_id else {
            return Ok(None);
        };
        let state = self
            .api
            .session_state(session_id)
            .await
            .with_context(|| format!("Failed to read state of session {session_id}"))?;
        tracing::info!(
            session_id = %session_id,
            lifecycle_status = %state.lifecycle_status,
            can_collect = state.can_collect,
            has_collect_executed = state.has_collect_executed,
            has_parsing_started = state.has_parsing_started,
            "Session state"
        );
        Ok(Some(state))
    }
}

/// Returns `Ok(true)` when the process should exit 0.
async fn run(cli: Cli, shutdown: CancellationToken) -> Result<bool> {
    let profile_path = cli
        .profile
        .context("No supplier profile given (--profile or HARVEST_PROFILE)")?;
    let profile = SupplierProfile::load(&profile_path)
        .with_context(|| format!("Failed to load profile {}", profile_path.display()))?;
    let profile = Arc::new(profile);

    let mut api_config = ApiConfig::from_env().context("Invalid API configuration")?;
    if let Some(url) = cli.api_callback {
        api_config.callback_url = url;
    }
    if let Some(token) = cli.api_token {
        api_config = api_config.with_callback_token(token);
    }
    if let Some(secret) = cli.hmac_secret {
        api_config = api_config.with_hmac_secret(secret);
    }

    let api = ApiClient::new(api_config.clone())?
        .with_supplier(profile.name.clone())
        .with_session(cli.session_id.clone());
    let callbacks = open_callbacks(&api_config, cli.session_id.as_deref())?;

    let env = Env {
        profile,
        api,
        api_config,
        session_id: cli.session_id,
        callbacks,
        shutdown,
    };
    tracing::info!(
        supplier = %env.profile.name,
        api = %env.api_config.api_url,
        session_id = env.session_id.as_deref().unwrap_or("-"),
        "Harvest starting"
    );

    let result = match cli.command {
        Commands::Collect => cmd_collect(&env).await,
        Commands::Reset => cmd_reset(&env).await,
        Commands::Queue(args) => cmd_queue(&env, &args).await,
        Commands::FullScan(args) => cmd_full_scan(&env, &args).await,
    };
    env.callbacks.close().await;
    result
}

fn open_callbacks(config: &ApiConfig, session_id: Option<&str>) -> Result<CallbackChannel> {
    let (Some(session_id), Some(token)) = (session_id, config.callback_token.as_deref()) else {
        if session_id.is_some() {
            tracing::warn!("No callback token configured, callbacks disabled");
        }
        return Ok(CallbackChannel::disabled());
    };
    let transport = HttpCallbackTransport::new(config)?;
    tracing::info!(url = %transport.url(), "Callbacks enabled");
    Ok(CallbackChannel::spawn(
        transport,
        session_id,
        token,
        CallbackConfig::default(),
    ))
}

/// Log a gate decision. `Some(exit_ok)` means the phase must not run.
fn gate_outcome(phase: &str, decision: PhaseDecision) -> Option<bool> {
    match decision {
        PhaseDecision::Proceed => None,
        PhaseDecision::Skip(reason) => {
            tracing::info!(phase, %reason, "Phase skipped");
            Some(true)
        }
        PhaseDecision::Abort(reason) => {
            tracing::error!(phase, %reason, "Phase not allowed");
            Some(false)
        }
    }
}

/// save-urls bodies are always signed; fail before any phase side effect.
fn require_signing(config: &ApiConfig) -> Result<()> {
    if config.hmac_secret.is_none() {
        anyhow::bail!("No HMAC secret configured (--hmac-secret or PARSER_HMAC_SECRET)");
    }
    Ok(())
}

async fn cmd_collect(env: &Env) -> Result<bool> {
    require_signing(&env.api_config)?;
    if let Some(state) = env.session_state().await?
        && let Some(exit_ok) = gate_outcome("collect", collect_gate(&state))
    {
        return Ok(exit_ok);
    }
    if !env.profile.collect_urls {
        tracing::info!(supplier = %env.profile.name, "URL collection disabled for supplier");
        return Ok(true);
    }
    let outcome = collect(env).await?;
    print_json(&collect_report(&outcome))?;
    Ok(outcome.is_success())
}

async fn collect(env: &Env) -> Result<CollectOutcome> {
    let profile = &env.profile;
    let ctx = env.run_context(RateLimitConfig::new(profile.request_interval(), 1));
    let sender = ChunkSender::new(
        env.api.clone(),
        profile.name.clone(),
        profile.chunk_config(),
        ctx.dedup(),
    );
    let collector = Collector::new(
        profile.collect_plan(),
        profile.collect_limits(),
        profile.keyword_filter(),
    );

    let mut contexts = build_contexts(profile.clone(), 1)
        .await
        .context("Failed to prepare the extractor")?;
    let outcome = match contexts.first_mut() {
        Some(extractor) => {
            collector
                .collect(extractor, &sender, &ctx, &env.callbacks, &TracingCollectReporter)
                .await
        }
        None => anyhow::bail!("No execution context available"),
    };
    teardown_all(&mut contexts).await;
    Ok(outcome)
}

fn collect_report(outcome: &CollectOutcome) -> serde_json::Value {
    let mut report = serde_json::to_value(&outcome.stats).unwrap_or_default();
    if let Some(map) = report.as_object_mut() {
        map.insert("stop_reason".into(), outcome.stop_reason.as_str().into());
        map.insert("success".into(), outcome.is_success().into());
    }
    report
}

async fn cmd_reset(env: &Env) -> Result<bool> {
    if let Some(state) = env.session_state().await?
        && let Some(exit_ok) = gate_outcome("reset", reset_gate(&state))
    {
        return Ok(exit_ok);
    }
    let pending = reset(env).await?;
    print_json(&serde_json::json!({ "pending": pending }))?;
    Ok(true)
}

async fn reset(env: &Env) -> Result<u64> {
    let outcome = env
        .api
        .full_scan_reset(&env.profile.name)
        .await
        .context("full-scan-reset failed")?;
    let pending = outcome.pending();
    tracing::info!(supplier = %env.profile.name, pending, "Full-scan reset done");
    Ok(pending)
}

async fn cmd_queue(env: &Env, args: &QueueArgs) -> Result<bool> {
    let plan = queue_plan(&env.profile, args, args.strict)?;
    run_queue(env, plan).await
}

async fn run_queue(env: &Env, plan: QueuePlan) -> Result<bool> {
    let summary = queue(env, plan).await?;
    print_json(&summary)?;
    Ok(!summary.status.is_failure())
}

/// Validated worker settings, resolved before any phase runs.
struct QueuePlan {
    config: WorkerConfig,
    interval: Duration,
}

fn queue_plan(profile: &SupplierProfile, args: &QueueArgs, strict: bool) -> Result<QueuePlan> {
    let config = worker_config(profile, args, strict);
    config.validate().context("Invalid worker configuration")?;
    let interval = match args.min_request_interval {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .with_context(|| format!("Invalid request interval: {secs}"))?,
        None => profile.request_interval(),
    };
    Ok(QueuePlan { config, interval })
}

fn worker_config(profile: &SupplierProfile, args: &QueueArgs, strict: bool) -> WorkerConfig {
    let mut config = WorkerConfig::new(profile.name.clone())
        .with_batch_size(args.batch_size)
        .with_concurrency(args.concurrency)
        .with_material_type(args.material_type.clone())
        .with_reparse_days(args.reparse_days)
        .with_max_batches(args.max_batches)
        .with_strict(strict)
        .with_nav_timeout(profile.nav_timeout())
        .with_nav_retries(profile.delays.page_load_retries)
        .with_execution_mode(args.execution_mode);
    if let Some(limit) = args.domain_limit {
        config = config.with_domain_limit(limit);
    }
    if let Some(id) = &args.worker_id {
        config = config.with_worker_id(id.clone());
    }
    config
}

async fn queue(env: &Env, plan: QueuePlan) -> Result<RunSummary> {
    let QueuePlan { config, interval } = plan;
    let strict = config.strict;
    let ctx = env.run_context(RateLimitConfig::new(
        interval,
        config.effective_domain_limit(),
    ));

    let contexts = build_contexts(env.profile.clone(), config.concurrency)
        .await
        .context("Failed to prepare execution contexts")?;
    let pool: ContextPool<CatalogExtractor> = ContextPool::new(contexts);
    let worker = QueueWorker::new(env.api.clone(), pool.clone(), config)?;
    tracing::info!(
        worker_id = %worker.config().worker_id,
        concurrency = worker.config().concurrency,
        mode = ?worker.config().execution_mode,
        strict,
        "Queue worker starting"
    );

    let summary = worker
        .run(&ctx, &env.callbacks, &TracingWorkerReporter)
        .await;

    let mut slots = pool.drain().await;
    for slot in slots.iter_mut() {
        if let Err(e) = slot.teardown().await {
            tracing::warn!(error = %e, "Context teardown failed");
        }
    }
    Ok(summary)
}

/// collect, reset, verify pending, strict queue run.
async fn cmd_full_scan(env: &Env, args: &QueueArgs) -> Result<bool> {
    // Collect and reset run once per session, so reject bad settings first.
    let plan = queue_plan(&env.profile, args, true)?;
    require_signing(&env.api_config)?;

    if let Some(state) = env.session_state().await?
        && let Some(exit_ok) = gate_outcome("full-scan", collect_gate(&state))
    {
        return Ok(exit_ok);
    }

    tracing::info!(supplier = %env.profile.name, "Full scan step 1: collect");
    let outcome = collect(env).await?;
    if env.shutdown.is_cancelled() {
        return Ok(false);
    }
    if !outcome.is_success() {
        tracing::error!(stop_reason = outcome.stop_reason.as_str(), "Collect sent no URLs");
        print_json(&collect_report(&outcome))?;
        return Ok(false);
    }

    tracing::info!("Full scan step 2: reset");
    let pending = reset(env).await?;
    if pending == 0 {
        tracing::error!(reason = EMPTY_FIRST_CLAIM, "Reset left no pending URLs");
        return Ok(false);
    }

    tracing::info!(pending, "Full scan step 3: queue");
    run_queue(env, plan).await
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::MockServer;

    #[test]
    fn cli_parses_queue_flags() {
        let cli = Cli::try_parse_from([
            "harvest",
            "--profile",
            "acme.json",
            "queue",
            "--batch-size",
            "10",
            "--concurrency",
            "2",
            "--strict",
            "--execution-mode",
            "thread-pool",
        ])
        .unwrap();
        let Commands::Queue(args) = cli.command else {
            panic!("expected queue");
        };
        assert_eq!(args.batch_size, 10);
        assert_eq!(args.concurrency, 2);
        assert!(args.strict);
        assert_eq!(args.execution_mode, ExecutionMode::ThreadPool);
    }

    #[test]
    fn worker_config_follows_profile_and_flags() {
        let profile = SupplierProfile::from_json(
            r#"{"name":"acme","base_url":"https://shop.example","delays":{"page_load_timeout":9000,"page_load_retries":2}}"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from(["harvest", "full-scan", "--max-batches", "4"]).unwrap();
        let Commands::FullScan(args) = cli.command else {
            panic!("expected full-scan");
        };
        let config = worker_config(&profile, &args, true);
        assert_eq!(config.supplier, "acme");
        assert_eq!(config.nav_timeout, Duration::from_millis(9000));
        assert_eq!(config.nav_retries, 2);
        assert_eq!(config.max_batches, Some(4));
        assert!(config.strict);
        assert!(config.validate().is_ok());
    }

    fn env_for(server: &MockServer, api_config: ApiConfig) -> Env {
        let raw = format!(
            r#"{{"name":"acme","base_url":"{uri}","catalog_base_url":"{uri}/catalog/"}}"#,
            uri = server.uri()
        );
        let profile = Arc::new(SupplierProfile::from_json(&raw).unwrap());
        Env {
            api: ApiClient::new(api_config.clone()).unwrap().with_supplier("acme"),
            profile,
            api_config,
            session_id: None,
            callbacks: CallbackChannel::disabled(),
            shutdown: CancellationToken::new(),
        }
    }

    fn signed_config(server: &MockServer) -> ApiConfig {
        ApiConfig::new(&format!("{}/api", server.uri()))
            .unwrap()
            .with_hmac_secret("secret")
    }

    fn full_scan_args(extra: &[&str]) -> QueueArgs {
        let argv = ["harvest", "full-scan"].into_iter().chain(extra.iter().copied());
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::FullScan(args) => args,
            _ => panic!("expected full-scan"),
        }
    }

    #[test]
    fn queue_plan_rejects_bad_settings() {
        let profile = SupplierProfile::from_json(
            r#"{"name":"acme","base_url":"https://shop.example"}"#,
        )
        .unwrap();
        assert!(queue_plan(&profile, &full_scan_args(&["--concurrency", "8"]), true).is_err());
        assert!(
            queue_plan(&profile, &full_scan_args(&["--min-request-interval=-1"]), true).is_err()
        );

        let plan = queue_plan(&profile, &full_scan_args(&["--min-request-interval", "1.5"]), true)
            .unwrap();
        assert_eq!(plan.interval, Duration::from_millis(1500));
        assert!(plan.config.strict);
    }

    #[tokio::test]
    async fn full_scan_with_bad_concurrency_fails_before_collect() {
        let server = MockServer::start().await;
        let env = env_for(&server, signed_config(&server));

        let err = cmd_full_scan(&env, &full_scan_args(&["--concurrency", "8"]))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("Invalid worker configuration"));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn collect_without_secret_fails_before_any_request() {
        let server = MockServer::start().await;
        let unsigned = ApiConfig::new(&format!("{}/api", server.uri())).unwrap();
        let env = env_for(&server, unsigned);

        assert!(cmd_collect(&env).await.is_err());
        assert!(cmd_full_scan(&env, &full_scan_args(&[])).await.is_err());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn gate_outcomes_map_to_exit_status() {
        assert_eq!(gate_outcome("collect", PhaseDecision::Proceed), None);
        assert_eq!(gate_outcome("collect", PhaseDecision::Skip("done".into())), Some(true));
        assert_eq!(gate_outcome("reset", PhaseDecision::Abort("no".into())), Some(false));
    }
}

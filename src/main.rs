use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use semrel_api::{ApiState, RestApi};
use semrel_core::{
    default_bundles, read_bundles, CentroidPhraseCreator, EvalOptions, KnownPhraseSim, PhraseDictionary,
    PhraseResolver, PhraseSimEvaluator, QueryEngine, Registry, SrConfig,
};
use semrel_storage::{ArtifactManager, BuildPool};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Semantic relatedness engine
#[derive(Parser, Debug)]
#[command(name = "semrel")]
#[command(about = "Semantic relatedness between concepts and phrases", long_about = None)]
struct Args {
    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the latest artifacts and serve queries over HTTP
    Serve {
        /// JSON configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// HTTP API port
        #[arg(long, default_value_t = 8080)]
        http_port: u16,

        /// Phrase dictionary (`phrase<TAB>concept id` per line)
        #[arg(long)]
        phrases: Option<PathBuf>,
    },
    /// Build feature matrices from their feature files and publish them
    Build {
        #[arg(short, long)]
        config: PathBuf,

        /// Only build this metric
        #[arg(long)]
        metric: Option<String>,
    },
    /// Run the phrase-bundle evaluation against the latest artifacts
    Eval {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long)]
        phrases: PathBuf,

        /// Tab-separated bundles, one per line; built-in bundles otherwise
        #[arg(long)]
        bundles: Option<PathBuf>,

        /// Metric to evaluate; defaults to the configured metric
        #[arg(long)]
        metric: Option<String>,

        #[arg(long, default_value_t = 10)]
        topk: usize,

        #[arg(long, default_value_t = 1000)]
        samples: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

/// Registry, query engine and loaded artifacts for one configuration
struct Runtime {
    config: SrConfig,
    manager: ArtifactManager,
    engine: Arc<QueryEngine>,
}

impl Runtime {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let config = SrConfig::load(path).with_context(|| format!("loading configuration {:?}", path))?;
        let registry = Arc::new(Registry::from_config(&config)?);
        let manager = ArtifactManager::from_config(registry.clone(), &config)?;
        let engine = Arc::new(QueryEngine::from_config(registry, &config));
        info!("Artifact store: {:?}", config.feature_matrix_location);
        Ok(Self {
            config,
            manager,
            engine,
        })
    }

    fn dictionary(phrases: &Path) -> anyhow::Result<Arc<PhraseDictionary>> {
        let dictionary = Arc::new(PhraseDictionary::new());
        let file = File::open(phrases).with_context(|| format!("opening phrase dictionary {:?}", phrases))?;
        let loaded = dictionary.load_tsv(BufReader::new(file))?;
        info!("Loaded {} phrases from {:?}", loaded, phrases);
        Ok(dictionary)
    }

    fn resolver(&self, phrases: &Path, metric: &str) -> anyhow::Result<PhraseResolver> {
        let dictionary = Self::dictionary(phrases)?;
        let entry = self.manager.registry().get(&self.config.language, metric)?;
        let creator = CentroidPhraseCreator::new(dictionary.clone(), entry.metric());
        Ok(
            PhraseResolver::new(dictionary, self.engine.clone(), self.config.language.clone(), metric)
                .with_creator(Arc::new(creator)),
        )
    }

    /// Phrase-keyed space over `metric`, with vectors from the dictionary's concepts
    fn known_phrases(&self, phrases: &Path, metric: &str) -> anyhow::Result<KnownPhraseSim> {
        let dictionary = Self::dictionary(phrases)?;
        let entry = self.manager.registry().get(&self.config.language, metric)?;
        entry.metric().ensure_built()?;
        let creator = CentroidPhraseCreator::new(dictionary, entry.metric());
        Ok(KnownPhraseSim::new(Arc::new(creator), entry.metric().clone()))
    }
}

fn serve(runtime: Runtime, http_port: u16, phrases: Option<PathBuf>) -> anyhow::Result<std::thread::JoinHandle<()>> {
    runtime.manager.load_latest();
    let mut state = ApiState::new(
        runtime.engine.clone(),
        runtime.config.language.clone(),
        runtime.config.metric_name.clone(),
    );
    if let Some(path) = phrases {
        let resolver = runtime.resolver(&path, &runtime.config.metric_name)?;
        state = state.with_resolver(Arc::new(resolver));
    }
    let state = Arc::new(state);

    let handle = std::thread::spawn(move || {
        info!("Starting HTTP server on port {}", http_port);
        let sys = actix_web::rt::System::new();
        sys.block_on(async {
            if let Err(e) = RestApi::start(state, http_port).await {
                error!("HTTP server error: {}", e);
            }
        })
    });
    Ok(handle)
}

fn build(runtime: Runtime, metric: Option<String>) -> anyhow::Result<()> {
    let pool = BuildPool::new(runtime.config.build.workers)?;
    let outcomes = runtime.manager.build_all(&pool, metric.as_deref());
    if outcomes.is_empty() {
        warn!("Nothing to build: no metric with a feature file matched");
    }

    let mut failed = 0;
    for (key, outcome) in &outcomes {
        match outcome {
            Ok(report) => println!("{}", report),
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", key, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} builds failed", failed, outcomes.len());
    }
    Ok(())
}

fn eval(
    runtime: Runtime,
    phrases: &Path,
    bundles: Option<&Path>,
    metric: Option<String>,
    options: EvalOptions,
) -> anyhow::Result<()> {
    runtime.manager.load_latest();
    let metric = metric.unwrap_or_else(|| runtime.config.metric_name.clone());
    let sim = Arc::new(runtime.known_phrases(phrases, &metric)?);

    let bundles = match bundles {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening bundles {:?}", path))?;
            read_bundles(BufReader::new(file))?
        }
        None => default_bundles(),
    };
    info!("Evaluating {} on {} bundles", metric, bundles.len());

    let evaluator = PhraseSimEvaluator::new(sim, bundles);
    evaluator.register()?;
    let report = evaluator.evaluate(options);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting semrel v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Serve {
            config,
            http_port,
            phrases,
        } => {
            let runtime = Runtime::open(&config)?;
            let http_handle = serve(runtime, http_port, phrases)?;
            info!("HTTP API: http://localhost:{}/", http_port);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                }
                _ = tokio::task::spawn_blocking(move || {
                    http_handle.join().ok();
                }) => {
                    info!("HTTP server stopped");
                }
            }
        }
        Command::Build { config, metric } => {
            let runtime = Runtime::open(&config)?;
            tokio::task::spawn_blocking(move || build(runtime, metric)).await??;
        }
        Command::Eval {
            config,
            phrases,
            bundles,
            metric,
            topk,
            samples,
            seed,
        } => {
            let runtime = Runtime::open(&config)?;
            let options = EvalOptions { samples, k: topk, seed };
            tokio::task::spawn_blocking(move || eval(runtime, &phrases, bundles.as_deref(), metric, options))
                .await??;
        }
    }

    info!("Shutting down...");
    Ok(())
}

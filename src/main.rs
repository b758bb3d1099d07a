use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use wireflow::{
    api,
    config::{EnvConfig, Settings},
    engine::{Engine, EngineContext},
    flow::compiler::compile,
    flow::document::FlowDocument,
    logger::init_tracing,
    registry::NodeRegistry,
    schema::{flow_schema, write_schema},
    store::FileFlowStore,
};

#[derive(Parser, Debug)]
#[command(name = "wireflow", about = "Flow execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the deploy API and run the stored flows
    Run(RunArgs),

    /// Compile a flow file and report warnings and cycles
    Validate { file: PathBuf },

    /// Emit the flow document JSON schema
    Schema {
        /// Directory to write schema files into; prints to stdout when absent
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// .env file read before the environment
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Listen address override
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Flow file override
    #[arg(long)]
    flows: Option<PathBuf>,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Directory for log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        env_file: PathBuf::from(".env"),
        ..RunArgs::default()
    })) {
        Commands::Run(args) => run(args).await,
        Commands::Validate { file } => validate(file),
        Commands::Schema { out } => {
            match out {
                Some(dir) => {
                    for path in write_schema(&dir)? {
                        println!("wrote {}", path.display());
                    }
                }
                None => println!("{}", serde_json::to_string_pretty(&flow_schema())?),
            }
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let source = EnvConfig::new(Some(args.env_file));
    let mut settings = Settings::load(&source).await?;
    if let Some(listen) = args.listen {
        settings.listen = listen;
    }
    if let Some(flows) = args.flows {
        settings.flows_file = flows;
    }
    if let Some(level) = args.log_level {
        settings.log_level = level;
    }
    if let Some(dir) = args.log_dir {
        settings.log_dir = Some(dir);
    }

    let _guards = init_tracing(&settings.log_level, settings.log_dir.as_deref())?;
    info!("wireflow starting: {settings}");

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("cannot listen on {}", settings.listen))?;
    let store = Arc::new(FileFlowStore::new(settings.flows_file.clone()));
    let engine = Engine::new(EngineContext::new(settings, NodeRegistry::with_builtins()), store);

    if let Err(err) = engine.start().await {
        error!("failed to deploy stored flows: {err}");
        engine.shutdown().await;
        bail!(err);
    }

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(api::serve(listener, engine.manager().clone(), shutdown.clone()));

    info!("wireflow running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;
    info!("wireflow shutting down");

    shutdown.cancel();
    match server.await {
        Ok(Err(err)) => error!("deploy API failed: {err:#}"),
        Err(err) => error!("deploy API task failed: {err}"),
        Ok(Ok(())) => {}
    }
    engine.shutdown().await;
    Ok(())
}

fn validate(file: PathBuf) -> anyhow::Result<()> {
    let bytes = std::fs::read(&file).with_context(|| format!("cannot read {}", file.display()))?;
    let (doc, mut warnings) = FlowDocument::from_slice(&bytes)?;
    let blueprint = compile(&doc, &NodeRegistry::with_builtins());
    warnings.extend(blueprint.warnings().iter().cloned());

    println!("{} nodes, {} runnable", doc.len(), blueprint.nodes().len());
    for warning in &warnings {
        println!("warning: {warning}");
    }
    for cycle in blueprint.cycles() {
        println!("cycle: {}", cycle.join(" -> "));
    }
    if warnings.is_empty() {
        println!("Flow file is valid.");
    }
    Ok(())
}

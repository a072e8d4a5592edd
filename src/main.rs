use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use whisperer::backend::Backend;
use whisperer::backend::engine::ChatEngineBackend;
use whisperer::backend::fetch::ModelFetcher;
use whisperer::backend::gemma::GemmaPipeline;
use whisperer::backend::mock::ScriptedPipeline;
use whisperer::backend::pipeline::PipelineBackend;
use whisperer::banner::{BannerInfo, print_banner, print_session_summary};
use whisperer::bridge::Bridge;
use whisperer::catalog::{CatalogSource, LazyCatalog};
use whisperer::chat_state::{ChatState, Submission};
use whisperer::commands::{CommandRegistry, CommandResult, SessionInfo};
use whisperer::config::{Config, Setting};
use whisperer::consts::{DEFAULT_ENGINE_MODEL, DEFAULT_PIPELINE_MODEL, default_db_path};
use whisperer::payment::{Checkout, CheckoutOptions, PaymentLinkWidget, RazorpayClient, to_paise};
use whisperer::relay::{Relay, SinkRegistry};
use whisperer::session::{Callbacks, Session};
use whisperer::spinner::Spinner;
use whisperer::terminal::TerminalSink;

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum BackendKind {
    /// OpenAI-compatible chat engine over HTTP
    Engine,
    /// Gemma 3 run in-process on candle; model files are downloaded on first load
    Pipeline,
    /// Canned replies through the local pipeline path (offline demo)
    Scripted,
}

#[derive(Parser)]
#[command(name = "whisperer", version, about = "Heartyculture's plant care assistant.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Inference backend [default: stored setting, else engine]
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,

    /// Model name (backend-specific)
    #[arg(long)]
    model: Option<String>,

    /// Chat engine endpoint, e.g. http://127.0.0.1:8000/v1
    #[arg(long)]
    endpoint: Option<String>,

    /// Plant catalog: a JSON file path or URL, or "none"
    #[arg(long)]
    catalog: Option<String>,

    /// SQLite database for settings (use :memory: for ephemeral)
    #[arg(short, long)]
    db: Option<String>,

    /// Ask a single question and exit (non-interactive)
    #[arg(short, long)]
    run: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Show, set, or remove stored settings
    Config {
        /// Setting name (backend, model, endpoint, catalog)
        key: Option<String>,
        /// New value
        value: Option<String>,
        /// Remove the stored value
        #[arg(long, conflicts_with = "value")]
        unset: bool,
    },
    /// Pay for an order through a hosted payment page
    Pay {
        /// Amount in rupees
        #[arg(long)]
        amount: f64,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        contact: String,
        #[arg(long)]
        description: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("whisperer=warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let db = match &cli.db {
        Some(db) => db.clone(),
        None => {
            let path = default_db_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("failed to create settings directory")?;
            }
            path.to_string_lossy().into_owned()
        }
    };
    let config = Config::open(&db)?;

    if let Some(command) = cli.command {
        return match command {
            Command::Config { key, value, unset } => handle_config(&config, key, value, unset),
            Command::Pay {
                amount,
                name,
                contact,
                description,
            } => handle_pay(amount, &name, &contact, description).await,
        };
    }

    let kind = match cli.backend {
        Some(kind) => kind,
        None => {
            let stored = config
                .resolve(Setting::Backend, None)?
                .unwrap_or_else(|| "engine".to_string());
            BackendKind::from_str(&stored, true)
                .map_err(|e| anyhow::anyhow!("invalid stored backend '{stored}': {e}"))?
        }
    };
    let endpoint = config
        .resolve(Setting::Endpoint, cli.endpoint.as_deref())?
        .unwrap_or_default();
    let model = match config.resolve(Setting::Model, cli.model.as_deref())? {
        Some(model) => model,
        None if kind == BackendKind::Engine => DEFAULT_ENGINE_MODEL.to_string(),
        None => DEFAULT_PIPELINE_MODEL.to_string(),
    };
    let catalog_setting = config
        .resolve(Setting::Catalog, cli.catalog.as_deref())?
        .unwrap_or_default();

    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Engine => {
            let mut engine = ChatEngineBackend::new(&endpoint, &model);
            if let Ok(key) = std::env::var("WHISPERER_API_KEY")
                && !key.is_empty()
            {
                engine = engine.with_api_key(key);
            }
            Arc::new(engine)
        }
        BackendKind::Pipeline => {
            let mut fetcher = ModelFetcher::hugging_face(&model);
            if let Ok(token) = std::env::var("HF_TOKEN")
                && !token.is_empty()
            {
                fetcher = fetcher.with_token(token);
            }
            Arc::new(PipelineBackend::new(&model, GemmaPipeline::new(fetcher)))
        }
        BackendKind::Scripted => Arc::new(PipelineBackend::new(&model, demo_pipeline())),
    };

    let catalog = if catalog_setting.is_empty() || catalog_setting == "none" {
        LazyCatalog::disabled()
    } else {
        LazyCatalog::new(CatalogSource::parse(&catalog_setting))
    };

    print_banner(&BannerInfo {
        backend: backend.name(),
        model: backend.model(),
        endpoint: (kind == BackendKind::Engine).then_some(endpoint.as_str()),
        catalog: if catalog_setting.is_empty() { "none" } else { &catalog_setting },
        settings: if db == ":memory:" { "ephemeral" } else { &db },
    });

    // Host side: the chat state and the sink it is reached through.
    let chat = Arc::new(ChatState::new());
    let sink = Arc::new(TerminalSink::new(chat.clone()));
    let registry = Arc::new(SinkRegistry::new());
    registry.register(sink.clone());
    let relay = Relay::new(registry);

    let bridge = Bridge::new(relay.clone());
    let session = Arc::new(Session::new(backend.clone(), relay.clone(), catalog));
    bridge.install(session.clone());

    chat.begin_load();
    let spinner = Spinner::follow(sink.progress());
    let loaded = bridge.load().await;
    spinner.stop().await;
    if let Err(e) = loaded {
        eprintln!("error: {e}");
        eprintln!("the model could not be loaded; questions will be answered once it is");
    }

    if let Some(question) = cli.run {
        ask(&bridge, &session, &chat, &relay, &question).await;
        let (tokens, tps) = session.last_stats();
        print_session_summary(tokens, tps);
        return Ok(());
    }

    let commands = CommandRegistry::new();
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("\nyou> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            result = lines.next_line() => {
                match result {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        // Ctrl+D (EOF)
                        println!();
                        break;
                    }
                    Err(e) => {
                        eprintln!("input error: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };

        let info = SessionInfo {
            backend: backend.name(),
            model: backend.model(),
            settings: &db,
            session: Some(session.as_ref()),
            chat: Some(chat.as_ref()),
        };
        let question = match commands.dispatch(&line, &info).await {
            CommandResult::NotACommand => line,
            CommandResult::Ask(question) => question,
            CommandResult::Handled => continue,
            CommandResult::Quit => break,
        };

        ask(&bridge, &session, &chat, &relay, &question).await;
    }

    bridge.shutdown();
    let (tokens, tps) = session.last_stats();
    print_session_summary(tokens, tps);
    Ok(())
}

/// Send one question, printing the streamed reply. Ctrl+C stops the
/// generation; the partial reply still completes.
async fn ask(bridge: &Bridge, session: &Session, chat: &ChatState, relay: &Relay, input: &str) {
    let question = match chat.submit(input) {
        Submission::Empty => return,
        // the session answers with a "still preparing" notice and keeps loading
        Submission::NotLoaded => input.trim().to_string(),
        Submission::Accepted(question) => question,
    };

    print!("\ngemma> ");
    let _ = io::stdout().flush();

    let reply = bridge.ask(&question, Callbacks::relay(relay.clone()));
    tokio::pin!(reply);
    let result = tokio::select! {
        result = &mut reply => result,
        _ = tokio::signal::ctrl_c() => {
            if let Err(e) = session.interrupt().await {
                eprintln!("\ncould not interrupt: {e}");
            }
            println!("\n\ninterrupted");
            reply.await
        }
    };
    if let Err(e) = result {
        eprintln!("\nerror: {e}");
    }
}

fn handle_config(
    config: &Config,
    key: Option<String>,
    value: Option<String>,
    unset: bool,
) -> anyhow::Result<()> {
    let Some(key) = key else {
        for setting in Setting::ALL {
            let stored = config.get(setting.key())?;
            let shown = stored
                .as_deref()
                .or(setting.default_value())
                .unwrap_or("(backend default)");
            let origin = if stored.is_some() { "" } else { "  [default]" };
            println!("{:<9} {shown}{origin}", setting.key());
        }
        return Ok(());
    };

    let setting: Setting = key.parse()?;
    if setting == Setting::Backend
        && let Some(value) = &value
        && BackendKind::from_str(value, true).is_err()
    {
        bail!("unknown backend '{value}' (expected engine, pipeline or scripted)");
    }

    match (value, unset) {
        (Some(value), _) => {
            config.set(setting.key(), &value)?;
            println!("✓ {setting} = {value}");
        }
        (None, true) => {
            config.remove(setting.key())?;
            println!("✓ {setting} reset to default");
        }
        (None, false) => match config.resolve(setting, None)? {
            Some(value) => println!("{value}"),
            None => println!("(backend default)"),
        },
    }
    Ok(())
}

async fn handle_pay(
    amount: f64,
    name: &str,
    contact: &str,
    description: Option<String>,
) -> anyhow::Result<()> {
    let paise = to_paise(amount);
    if paise == 0 {
        bail!("amount must be a positive number of rupees");
    }

    let client = RazorpayClient::from_env()?;
    let order = client.create_order(paise).await?;

    let mut options = CheckoutOptions::new(client.key_id(), order.amount, &order.id)
        .with_prefill(name, contact);
    if let Some(description) = description {
        options = options.with_description(description);
    }

    let checkout = Checkout::new(options, |payment_id| {
        println!("Payment successful! ID: {payment_id}");
    })
    .on_failure(|failure| {
        eprintln!("Payment failed: {}", failure.description);
    });
    checkout.open(&PaymentLinkWidget::new(client)).await?;
    Ok(())
}

fn demo_pipeline() -> ScriptedPipeline {
    ScriptedPipeline::new(vec![
        "Most houseplants like their soil to dry out a little between waterings. \
         Check the top inch with your finger before watering."
            .to_string(),
        "Snake plants, ZZ plants and pothos all tolerate low light well.".to_string(),
        "Water a cactus deeply every two to three weeks in summer and about once a month in winter."
            .to_string(),
    ])
}

use anyhow::Context;
use dotenvy::dotenv;
use oxide_dispatch_core::config::DispatchSettings;
use oxide_dispatch_core::Orchestrator;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Secret patterns masked in every log line, with their replacement
struct RedactionPatterns {
    rules: Vec<(Regex, &'static str)>,
}

impl RedactionPatterns {
    /// Compile all patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        let rules = vec![
            (
                Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
                "$1[TELEGRAM_TOKEN]$3",
            ),
            (
                Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
                "[TELEGRAM_TOKEN]",
            ),
            (
                Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
                "$1[TELEGRAM_TOKEN]",
            ),
            (Regex::new(r"AIza[0-9A-Za-z_-]{20,}")?, "[GEMINI_KEY]"),
            (Regex::new(r"sk-or-[A-Za-z0-9_-]+")?, "[OPENROUTER_KEY]"),
            (Regex::new(r"([?&]key=)[^&\s]+")?, "$1[MASKED]"),
        ];
        Ok(Self { rules })
    }

    fn redact(&self, input: &str) -> String {
        self.rules
            .iter()
            .fold(input.to_string(), |output, (pattern, replacement)| {
                pattern.replace_all(&output, *replacement).into_owned()
            })
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length; the redacted line may be shorter or longer.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), Arc::clone(&self.patterns))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Before logging, so nothing is ever written unredacted
    let patterns = Arc::new(RedactionPatterns::new().context("invalid redaction pattern")?);
    init_logging(patterns);

    info!("Starting Oxide dispatcher...");

    let settings = DispatchSettings::new().context("failed to load configuration")?;
    let orchestrator = match Orchestrator::from_settings(&settings) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "Invalid dispatch configuration");
            return Err(e).context("failed to build orchestrator");
        }
    };

    let commands = orchestrator.commands();
    if commands.is_empty() {
        warn!("No API keys configured; every command is disabled");
    }
    for command in &commands {
        if let Some(route) = orchestrator.route(*command) {
            info!(command = %command, chain = %route.chain, partition = ?route.partition, "Command enabled");
        }
    }
    log_health(&orchestrator);

    let token = CancellationToken::new();
    let maintenance = orchestrator.spawn_maintenance(MAINTENANCE_INTERVAL, token.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");

    token.cancel();
    if let Err(e) = maintenance.await {
        warn!(error = %e, "Maintenance task ended abnormally");
    }
    let failed = orchestrator.shutdown();
    info!(failed, "Dispatcher stopped");
    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);

    let debug_mode = std::env::var("DEBUG_MODE")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let filter = if debug_mode {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "oxide_dispatch_core=info,oxide_dispatch_bot=info,hyper=warn,h2=error,reqwest=warn,tokio=warn,tower=warn",
            )
        })
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn log_health(orchestrator: &Orchestrator) {
    let health = orchestrator.health();
    for pool in &health.pools {
        info!(
            provider = %pool.provider,
            model_class = %pool.model_class,
            keys = pool.credentials.len(),
            "Key pool ready"
        );
    }
    for breaker in &health.breakers {
        info!(dependency = %breaker.dependency, state = ?breaker.state, "Circuit breaker ready");
    }
}

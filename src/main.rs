use anyhow::{Context as _, Result};
use convoy::cli::output::{style, ConsoleObserver, CHECK, CROSS, INFO};
use convoy::cli::{parse_binding, Cli, Command, RunCommand, ValidateCommand};
use convoy::core::PipelineConfig;
use convoy::CancelToken;
use std::sync::Arc;
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await,
        Command::Validate(cmd) => validate_pipeline(cmd),
    }
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let config =
        PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;

    let mut descriptor = config.to_descriptor();
    for raw in &cmd.globals {
        let (key, value) = parse_binding(raw).map_err(anyhow::Error::msg)?;
        println!(
            "{} Global override: {} = {}",
            INFO,
            style(&key).cyan(),
            style(&value).dim()
        );
        descriptor.globals.insert(key, value);
    }

    let pipeline = descriptor.build();
    pipeline.attach(Arc::new(ConsoleObserver::new(cmd.stream)));

    let cancel = CancelToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling the run");
            ctrl_c_cancel.cancel();
        }
    });

    let summary = pipeline.run_with_cancel(&cancel).await;

    if summary.success {
        println!(
            "{} {} completed {}",
            CHECK,
            style(pipeline.title()).bold(),
            style("successfully").green()
        );
        Ok(())
    } else {
        println!(
            "{} {} {}",
            CROSS,
            style(pipeline.title()).bold(),
            style("failed").red()
        );
        std::process::exit(1);
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => {
            if cmd.json {
                let summary = serde_json::json!({
                    "valid": true,
                    "title": config.title,
                    "steps": config.steps.len(),
                    "remotes": config.remotes.keys().collect::<Vec<_>>(),
                    "globals": config.globals.keys().collect::<Vec<_>>(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{} Pipeline configuration is valid", CHECK);
                println!("  Title: {}", style(&config.title).bold());
                println!("  Steps: {}", style(config.steps.len()).cyan());
                println!("  Remotes: {}", style(config.remotes.len()).cyan());
            }
            Ok(())
        }
        Err(e) => {
            if cmd.json {
                let summary = serde_json::json!({
                    "valid": false,
                    "error": e.to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{} Validation failed:", CROSS);
                println!("  {}", style(e).red());
            }
            std::process::exit(1);
        }
    }
}

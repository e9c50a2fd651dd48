//! Lifecycle acceptance harness CLI
//!
//! Provisions the fixtures for one phase, prints the resolved environment as
//! JSON and tears everything down on Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;

use lifecycle_acceptance::{
    Collaborators, HarnessConfig, PhaseTest, PhaseTestOptions, Validate,
};

struct Args {
    phase: String,
    context: PathBuf,
    options: PhaseTestOptions,
    config: Option<PathBuf>,
}

fn usage(program: &str) {
    eprintln!(
        "Usage: {} <phase> <test-context> [--without-registry] [--without-daemon-fixtures] [--config <file>]",
        program
    );
    eprintln!("\nProvisions fixtures and a test image for a lifecycle phase.");
    eprintln!("\nEnvironment variables:");
    eprintln!("  LIFECYCLE_ACCEPTANCE_*  Override harness settings (e.g. _BASE_IMAGE)");
    eprintln!("  RUST_LOG                Log filter (default: info)");
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut positional = Vec::new();
    let mut options = PhaseTestOptions::default();
    let mut config = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--without-registry" => options = options.without_registry(),
            "--without-daemon-fixtures" => options = options.without_daemon_fixtures(),
            "--config" => {
                let path = args.next().ok_or("--config needs a file")?;
                config = Some(PathBuf::from(path));
            }
            flag if flag.starts_with("--") => return Err(format!("unknown flag {}", flag)),
            _ => positional.push(arg),
        }
    }

    let [phase, context]: [String; 2] = positional
        .try_into()
        .map_err(|_| "expected <phase> and <test-context>".to_string())?;

    Ok(Args {
        phase,
        context: PathBuf::from(context),
        options,
        config,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut raw = std::env::args();
    let program = raw.next().unwrap_or_else(|| "lifecycle-acceptance".to_string());
    let args = match parse_args(raw) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}\n", e);
            usage(&program);
            return ExitCode::FAILURE;
        }
    };

    let config = match &args.config {
        Some(path) => match HarnessConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => HarnessConfig::from_env(),
    };
    if let Err(e) = config.validate().into_result() {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    let collaborators = Collaborators::docker(&config);
    let mut test = match PhaseTest::with_collaborators(
        &args.phase,
        &args.context,
        args.options,
        config,
        collaborators,
    )
    .await
    {
        Ok(test) => test,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut code = ExitCode::SUCCESS;
    match test.start().await {
        Ok(()) => {
            match serde_json::to_string_pretty(&test.env()) {
                Ok(json) => println!("{}", json),
                Err(e) => tracing::warn!(error = %e, "failed to render phase environment"),
            }
            tracing::info!("fixtures ready, press Ctrl-C to tear down");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to wait for Ctrl-C, tearing down");
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            code = ExitCode::FAILURE;
        }
    }

    if let Err(e) = test.stop().await {
        eprintln!("teardown error: {}", e);
        code = ExitCode::FAILURE;
    }
    code
}

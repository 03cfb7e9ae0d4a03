//! Callflow CLI Entry Point
//!
//! Runs a single pipeline from the command line and reports how it went.
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline with parameters
//! callflow call_debtor.yaml --param full_name="Ivan Petrov" --param debt_amount=15000
//!
//! # With an engine config (connections, compliance window, archive)
//! callflow call_debtor.yaml --config callflow.yaml
//!
//! # Only check that the pipeline is valid
//! callflow call_debtor.yaml --validate
//! ```

use std::collections::BTreeMap;
use std::env;
use std::process::ExitCode;

use colored::*;
use log::{error, info};
use serde_json::Value;

use callflow::monitoring::RunTimeline;
use callflow::{
    load_pipeline, quick_validate, Engine, EngineConfig, RunSnapshot, RunStatus, Trigger,
    APP_NAME, VERSION,
};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    pipeline_path: Option<String>,
    config_path: Option<String>,
    params: BTreeMap<String, Value>,
    validate_only: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Declarative Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: callflow [OPTIONS] <PIPELINE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PIPELINE_FILE>     Path to pipeline YAML file");
    println!();
    println!("Options:");
    println!("  --config FILE       Engine config (default: ${})", callflow::config::CONFIG_ENV);
    println!("  --param KEY=VALUE   Run parameter; JSON values are parsed (repeatable)");
    println!("  --validate          Validate the pipeline without running it");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  callflow call_debtor.yaml --param full_name=Ivan --param debt_amount=15000");
    println!("  callflow call_debtor.yaml --config callflow.yaml");
    println!("  callflow call_debtor.yaml --validate");
}

/// Parses `key=value`; the value is read as JSON when it parses, otherwise
/// as a plain string.
fn parse_param(text: &str) -> Result<(String, Value), String> {
    let (key, raw) = text
        .split_once('=')
        .ok_or_else(|| format!("Invalid parameter '{}': expected KEY=VALUE", text))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Invalid parameter '{}': empty key", text));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--validate" => {
                config.validate_only = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--config" => {
                i += 1;
                let path = args.get(i).ok_or("--config requires a path argument")?;
                config.config_path = Some(path.clone());
            }
            "--param" | "-p" => {
                i += 1;
                let text = args.get(i).ok_or("--param requires a KEY=VALUE argument")?;
                let (key, value) = parse_param(text)?;
                config.params.insert(key, value);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.pipeline_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.pipeline_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

fn colorize_status(status: RunStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        RunStatus::Queued => label.yellow(),
        RunStatus::Running => label.cyan(),
        RunStatus::Succeeded => label.green(),
        RunStatus::Failed | RunStatus::TimedOut => label.red(),
        RunStatus::Cancelled => label.dimmed(),
    }
}

/// Prints the run's timeline and outcome.
fn print_report(run: &RunSnapshot) {
    println!("{}", RunTimeline::from_snapshot(run).gantt_chart());
    println!("{} {}", "Run:".bold(), run.id.to_string().dimmed());
    println!("{} {}", "Status:".bold(), colorize_status(run.status));
    if let Some(duration) = run.duration() {
        println!("{} {:.2?}", "Duration:".bold(), duration);
    }
    if let Some(reason) = &run.reason {
        println!("{} {}", "Reason:".bold(), reason.to_string().red());
    }
    println!();
}

/// Main application entry point.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let pipeline_path = config
        .pipeline_path
        .ok_or("No pipeline file given (see --help)")?;

    // Load pipeline
    info!("Loading pipeline: {}", pipeline_path);
    let pipeline = load_pipeline(&pipeline_path).map_err(|e| {
        error!("Failed to load pipeline: {}", e);
        format!("Could not load pipeline from '{}': {}", pipeline_path, e)
    })?;

    if config.validate_only {
        let problems = quick_validate(&pipeline);
        if problems.is_empty() {
            println!("{} '{}' is valid", "✓".green(), pipeline.name);
            return Ok(true);
        }
        for problem in &problems {
            println!("{} {}", "✗".red(), problem);
        }
        return Ok(false);
    }

    // Load engine config
    let engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };

    let engine = Engine::new(engine_config)?;
    let name = pipeline.name.clone();
    engine.register_pipeline(pipeline)?;

    let id = engine.submit_run(&name, config.params, Trigger::manual())?;
    let run = engine.wait_for_run(id).await?;
    engine.shutdown().await;

    print_report(&run);
    Ok(run.status == RunStatus::Succeeded)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("callflow")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_arguments() {
        let config = parse_arguments(&args(&[
            "call_debtor.yaml",
            "--config",
            "callflow.yaml",
            "--param",
            "full_name=Ivan Petrov",
            "-p",
            "debt_amount=15000",
            "--verbose",
        ]))
        .unwrap();

        assert_eq!(config.pipeline_path.as_deref(), Some("call_debtor.yaml"));
        assert_eq!(config.config_path.as_deref(), Some("callflow.yaml"));
        assert_eq!(config.params["full_name"], json!("Ivan Petrov"));
        assert_eq!(config.params["debt_amount"], json!(15000));
        assert!(config.verbose);
        assert!(!config.validate_only);
    }

    #[test]
    fn test_parse_arguments_errors() {
        assert!(parse_arguments(&args(&["--config"])).is_err());
        assert!(parse_arguments(&args(&["--param", "novalue"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("flag=true").unwrap(), ("flag".into(), json!(true)));
        assert_eq!(parse_param("tz=Europe/Moscow").unwrap(), ("tz".into(), json!("Europe/Moscow")));
        assert_eq!(parse_param("empty=").unwrap(), ("empty".into(), json!("")));
        assert!(parse_param("=x").is_err());
    }
}

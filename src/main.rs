use anyhow::{bail, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use greetguard::host::{InMemoryHost, LoggingNotifier};
use greetguard::{AddresseeRecord, GreetingValidator, GuardConfig, UserMessage, ValidationResult};
use log::LevelFilter;
use std::io::Read;
use std::process;
use std::sync::Arc;

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_MISMATCH: i32 = 2;

#[tokio::main]
async fn main() {
    let matches = Command::new("greetguard")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Check that the names in a message greeting match its recipients")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (defaults are used when omitted)")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a default configuration file and exit")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_name("FILE")
                .help("Message body to check ('-' reads stdin)")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("to")
                .short('t')
                .long("to")
                .value_name("ADDR")
                .help("Recipient address, optionally as 'Name <addr>' (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("language")
                .short('l')
                .long("language")
                .value_name("LANG")
                .help("Greeting language: auto, en, de, fr, es, pt")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("threshold")
                .long("threshold")
                .value_name("CONFIDENCE")
                .help("Minimum match confidence between 0 and 1")
                .value_parser(clap::value_parser!(f64))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print results as JSON")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("diagnostics")
                .long("diagnostics")
                .help("Print recorded error reports to stderr")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    match run(&matches).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            let message = UserMessage::from_anyhow(&e);
            eprintln!("{}", message.title);
            for suggestion in &message.suggestions {
                eprintln!("  - {suggestion}");
            }
            process::exit(EXIT_ERROR);
        }
    }
}

async fn run(matches: &ArgMatches) -> anyhow::Result<i32> {
    if let Some(path) = matches.get_one::<String>("generate-config") {
        init_logging(matches, None);
        GuardConfig::default()
            .to_file(path)
            .with_context(|| format!("Failed to generate configuration at {path}"))?;
        println!("Default configuration written to: {path}");
        return Ok(EXIT_OK);
    }

    let config_result = load_config(matches);
    let log_level = config_result
        .as_ref()
        .ok()
        .and_then(|c| c.logging.level_filter().ok().flatten());
    init_logging(matches, log_level);
    let config = config_result?;

    if matches.get_flag("test-config") {
        print_config_summary(&config);
        return Ok(EXIT_OK);
    }

    let Some(body_path) = matches.get_one::<String>("body") else {
        bail!("--body is required unless --generate-config or --test-config is given");
    };
    let body = read_body(body_path)?;
    let addressees: Vec<AddresseeRecord> = matches
        .get_many::<String>("to")
        .map(|values| values.map(|v| AddresseeRecord::parse(v)).collect())
        .unwrap_or_default();
    if addressees.is_empty() {
        log::warn!("No recipients given; every greeting will be flagged");
    }

    let host = Arc::new(InMemoryHost::new(addressees, body));
    let validator = GreetingValidator::new(config, host, Arc::new(LoggingNotifier))?;
    validator.initialize().await?;
    let outcome = validator.validate().await;

    if matches.get_flag("diagnostics") {
        for report in validator.diagnostics().recent() {
            eprintln!("{}", report.to_json());
        }
    }

    let results = outcome?;
    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results(&results);
    }

    if results.iter().all(|r| r.is_valid) {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_MISMATCH)
    }
}

fn init_logging(matches: &ArgMatches, configured: Option<LevelFilter>) {
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        configured.unwrap_or(LevelFilter::Info)
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<GuardConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => GuardConfig::load_from_file(path)?,
        None => GuardConfig::default(),
    };

    if let Some(language) = matches.get_one::<String>("language") {
        config.validation.language = language.trim().to_lowercase();
    }
    if let Some(threshold) = matches.get_one::<f64>("threshold") {
        config.validation.min_confidence = *threshold;
    }
    config.validate()?;
    Ok(config)
}

fn read_body(path: &str) -> anyhow::Result<String> {
    if path == "-" {
        let mut body = String::new();
        std::io::stdin()
            .read_to_string(&mut body)
            .context("Failed to read message body from stdin")?;
        Ok(body)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read message body: {path}"))
    }
}

fn print_config_summary(config: &GuardConfig) {
    let validation = &config.validation;
    println!("Configuration is valid");
    println!("  language:         {}", validation.language);
    println!("  min confidence:   {}", validation.min_confidence);
    println!("  fuzzy matching:   {}", validation.fuzzy_matching);
    println!("  exclude generic:  {}", validation.exclude_generic);
    println!("  custom patterns:  {}", validation.greeting_patterns.len());
    println!(
        "  retry attempts:   {} per host call, {} per run",
        config.resilience.retry.max_attempts, config.resilience.pipeline_retry.max_attempts
    );
    println!(
        "  circuit breaker:  opens after {} failures, {}ms cooldown",
        config.resilience.circuit_breaker.failure_threshold,
        config.resilience.circuit_breaker.cooldown_ms
    );
}

fn print_results(results: &[ValidationResult]) {
    if results.is_empty() {
        println!("No greeting found");
        return;
    }
    for result in results {
        let status = if result.is_valid { "OK" } else { "MISMATCH" };
        match &result.suggested_identity {
            Some(identity) => println!(
                "{status:<8} {} -> {} ({:?}, confidence {:.2})",
                result.greeting_name, identity.address, result.match_kind, result.confidence
            ),
            None => println!(
                "{status:<8} {} -> no matching recipient",
                result.greeting_name
            ),
        }
    }
}

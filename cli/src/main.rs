use clap::Parser;
use modshield_core::modshield_config::{
    ProtectionConfig, ProtectionLevel, YamlConfig, YAML_CONFIG_VERSION,
};
use modshield_core::diagnostics::Severity;
use modshield_core::Protector;
use std::{fs, path::PathBuf, process::ExitCode};

const DOCS_LINK: &str = "https://github.com/modshield/modshield/releases";

/// Commandline interface for ModShield
#[derive(Parser, Debug)]
#[command(name = "modshield-cli")]
#[command(about = "Commandline interface for ModShield", long_about = None)]
pub struct Cli {
    /// Input module to protect (also accepted as the first positional argument)
    #[arg(short = 'i', long, value_name = "PATH")]
    pub input: Option<PathBuf>,
    /// Positional fallback for the input module
    #[arg(value_name = "INPUT", conflicts_with = "input")]
    pub input_positional: Option<PathBuf>,
    /// Output path for the protected module
    #[arg(short = 'o', long, value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// Path to a YAML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Coarse protection preset applied before individual switches
    #[arg(short = 'l', long, value_enum)]
    pub level: Option<Level>,
    /// Disable the renaming pass
    #[arg(long = "no-renaming")]
    pub no_renaming: bool,
    /// Disable the string-encryption pass
    #[arg(long = "no-stringenc")]
    pub no_stringenc: bool,
    /// Disable the control-flow flattening pass
    #[arg(long = "no-controlflow")]
    pub no_controlflow: bool,
    /// Disable the anti-debug pass
    #[arg(long = "no-antidebug")]
    pub no_antidebug: bool,
    /// Fixed random seed for reproducible builds
    #[arg(long)]
    pub seed: Option<u64>,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum Level {
    None,
    Minimal,
    Balanced,
    Aggressive,
}

impl From<Level> for ProtectionLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::None => ProtectionLevel::None,
            Level::Minimal => ProtectionLevel::Minimal,
            Level::Balanced => ProtectionLevel::Balanced,
            Level::Aggressive => ProtectionLevel::Aggressive,
        }
    }
}

fn load_config(cli: &Cli) -> Result<ProtectionConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let contents = fs::read_to_string(path)?;
            let yaml: YamlConfig = serde_yaml::from_str(&contents)?;
            if yaml.version != YAML_CONFIG_VERSION {
                log::error!(
                    "Invalid config version: {}, expected: {}",
                    yaml.version,
                    YAML_CONFIG_VERSION
                );
                log::error!("Latest version available at: {DOCS_LINK}");
                return Err("config version mismatch".into());
            }
            yaml.protection
        }
        None => ProtectionConfig::default(),
    };

    if let Some(level) = cli.level {
        config.apply_level(level.into());
    }
    if cli.no_renaming {
        config.enable_renaming = false;
    }
    if cli.no_stringenc {
        config.enable_string_encryption = false;
    }
    if cli.no_controlflow {
        config.enable_control_flow = false;
    }
    if cli.no_antidebug {
        config.enable_anti_debug = false;
    }
    if let Some(seed) = cli.seed {
        config.seed = Some(seed);
    }
    if let Some(output) = &cli.output {
        config.output_path = Some(output.clone());
    }
    Ok(config)
}

fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    env_logger::builder().filter_level(cli.log_level).init();

    let Some(input) = cli.input.clone().or_else(|| cli.input_positional.clone()) else {
        log::error!("No input module given; pass -i <path> or a positional argument");
        return Ok(false);
    };
    let config = load_config(&cli)?;
    if config.output_path.is_none() {
        log::error!("No output path given; pass -o <path> or set output_path in the config");
        return Ok(false);
    }

    let result = Protector::new().protect(&input, config)?;
    for diagnostic in &result.diagnostics {
        match diagnostic.severity {
            Severity::Info => log::debug!("[{}] {}", diagnostic.code, diagnostic.message),
            Severity::Warning => log::warn!("[{}] {}", diagnostic.code, diagnostic.message),
            Severity::Error => log::error!("[{}] {}", diagnostic.code, diagnostic.message),
        }
    }
    for record in &result.passes {
        log::info!(
            "pass `{}`: {} in {:?}",
            record.id,
            if record.applied { "applied" } else { "skipped" },
            record.duration
        );
    }
    for error in &result.errors {
        log::error!("{error}");
    }
    if result.success {
        log::info!("Protection finished in {:?}", result.duration);
    } else {
        log::error!("Protection failed after {:?}", result.duration);
    }
    Ok(result.success)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

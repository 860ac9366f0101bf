use clap::{Args, Parser, Subcommand, ValueEnum, crate_version};
use convenient_kas::{ConfigOptions, DumpFormat, KasConfig, WorkdirFetcher};
use std::path::PathBuf;
use tracing::{Level, debug, error, span};
use tracing_subscriber::FmtSubscriber;

/// Resolve kas project configurations.
#[derive(Parser)]
#[clap(version = crate_version!(), author = "Ralf Anton Beier")]
struct Opts {
    /// Log level: debug, info, warning, error or critical.
    #[clap(short, long, default_value = "warning")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the flattened configuration
    Dump {
        /// Output format
        #[clap(long, value_enum, default_value_t = Format::Yaml)]
        format: Format,

        /// Ignore lockfiles, resolve floating references as written
        #[clap(long)]
        update: bool,

        #[clap(flatten)]
        project: ProjectArgs,
    },
    /// List the repositories of the configuration
    Repos {
        #[clap(flatten)]
        project: ProjectArgs,
    },
}

#[derive(Args)]
struct ProjectArgs {
    /// Directory holding the checkouts of remote repositories.
    #[clap(long, env = "KAS_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Replace the build target(s) of the configuration, separated by spaces.
    #[clap(long, env = "KAS_TARGET", value_delimiter = ' ')]
    target: Vec<String>,

    /// Replace the task of the configuration.
    #[clap(long, env = "KAS_TASK")]
    task: Option<String>,

    /// Config file(s), separated by colons if multiple
    config: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

impl From<Format> for DumpFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Yaml => DumpFormat::Yaml,
            Format::Json => DumpFormat::Json,
        }
    }
}

/// Gets the log level enum variant from a level string.
///
/// # Arguments
///
/// * `level` - The log level string, e.g. "DEBUG", "WARNING".
///
/// # Returns
///
/// Returns the corresponding `Level` enum variant for the level string.
pub fn get_log_level(level: &str) -> Level {
    match level.to_uppercase().as_ref() {
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        "CRITICAL" | "FATAL" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Splits a colon separated list of config files.
fn split_config_files(config: &str) -> Vec<PathBuf> {
    config
        .split(':')
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn options(project: &ProjectArgs, update: bool) -> ConfigOptions<'static> {
    let mut options = ConfigOptions::default().with_lock(!update);
    if let Some(work_dir) = &project.work_dir {
        options = options.with_work_dir(work_dir);
    }
    if !project.target.is_empty() {
        options = options.with_target(project.target.iter().cloned());
    }
    if let Some(task) = &project.task {
        options = options.with_task(task);
    }
    options
}

async fn load(project: &ProjectArgs, update: bool) -> Result<KasConfig, Box<dyn std::error::Error>> {
    let files = split_config_files(&project.config);
    debug!("Loading config files {:?}", files);
    let config = KasConfig::load(&files, &options(project, update), &WorkdirFetcher).await?;
    Ok(config)
}

async fn run(opts: Opts) -> Result<(), Box<dyn std::error::Error>> {
    match opts.command {
        Command::Dump {
            format,
            update,
            project,
        } => {
            let span = span!(Level::INFO, "dump");
            let _enter = span.enter();
            let config = load(&project, update).await?;
            print!("{}", config.dump(format.into())?);
        }
        Command::Repos { project } => {
            let span = span!(Level::INFO, "repos");
            let _enter = span.enter();
            let config = load(&project, false).await?;
            for repo in config.repos() {
                println!(
                    "{}\t{}\t{}",
                    repo.name,
                    repo.path.display(),
                    repo.revision().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Get the command line arguments
    let opts: Opts = Opts::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(get_log_level(&opts.log_level))
        .with_writer(std::io::stderr)
        .with_file(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(opts).await {
        error!("{}", e);
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels() {
        assert_eq!(get_log_level("warning"), Level::WARN);
        assert_eq!(get_log_level("critical"), Level::ERROR);
        assert_eq!(get_log_level("debug"), Level::DEBUG);
        assert_eq!(get_log_level("bogus"), Level::INFO);
    }

    #[test]
    fn config_files_are_colon_separated() {
        assert_eq!(
            split_config_files("kas.yml:kas/machine.yml:"),
            vec![PathBuf::from("kas.yml"), PathBuf::from("kas/machine.yml")]
        );
    }

    #[test]
    fn dump_arguments() {
        let opts = Opts::try_parse_from([
            "kas-config",
            "-l",
            "debug",
            "dump",
            "--format",
            "json",
            "--update",
            "--target",
            "core-image-sato",
            "kas.yml:extra.yml",
        ])
        .unwrap();
        assert_eq!(opts.log_level, "debug");
        match opts.command {
            Command::Dump {
                format,
                update,
                project,
            } => {
                assert!(matches!(format, Format::Json));
                assert!(update);
                assert_eq!(project.target, ["core-image-sato"]);
                assert_eq!(split_config_files(&project.config).len(), 2);
            }
            Command::Repos { .. } => panic!("expected dump"),
        }
    }

    #[test]
    fn targets_are_space_separated() {
        let opts = Opts::try_parse_from([
            "kas-config",
            "repos",
            "--target",
            "core-image-minimal core-image-sato",
            "kas.yml",
        ])
        .unwrap();
        match opts.command {
            Command::Repos { project } => {
                assert_eq!(project.target, ["core-image-minimal", "core-image-sato"]);
            }
            Command::Dump { .. } => panic!("expected repos"),
        }
    }
}

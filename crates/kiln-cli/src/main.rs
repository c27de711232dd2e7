mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{parse_backend, Failure, EXIT_FAILURE, EXIT_MANIFEST_ERROR};
use kiln_core::{install_signal_handler, Engine, KilnConfig};
use kiln_runtime::CancelFlag;
use kiln_schema::{Architecture, BackendKind};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Compile declarative image instructions into reproducible container images"
)]
struct Cli {
    /// Path to the kiln store directory (default from config, else ~/.local/share/kiln).
    #[arg(long, global = true)]
    store: Option<String>,

    /// Tool configuration file (default ~/.config/kiln/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build images from manifests, in the order given.
    Build {
        /// Manifest files. Later images may be based on earlier ones.
        #[arg(default_value = "kiln.toml")]
        manifests: Vec<PathBuf>,
    },
    /// Resolve requested packages to exact pins and write the lockfile.
    Lock {
        /// Path to manifest TOML file.
        #[arg(default_value = "kiln.toml")]
        manifest: PathBuf,
        /// Architecture to resolve for; repeat for several. Defaults to the manifest's.
        #[arg(long = "arch")]
        architectures: Vec<Architecture>,
    },
    /// Print the compiled build plan without building.
    Render {
        /// Path to manifest TOML file.
        #[arg(default_value = "kiln.toml")]
        manifest: PathBuf,
    },
    /// Pull an image reference, retrying transient failures.
    Pull {
        /// Image reference, e.g. ubuntu:20.04.
        reference: String,
        #[arg(long, value_parser = parse_backend, default_value = "daemon")]
        backend: BackendKind,
    },
    /// Remove images by tag. Missing images are reported, not failed.
    Clean {
        #[arg(required = true)]
        tags: Vec<String>,
        #[arg(long, value_parser = parse_backend, default_value = "daemon")]
        backend: BackendKind,
    },
    /// List local image tags.
    Images {
        #[arg(long, value_parser = parse_backend, default_value = "daemon")]
        backend: BackendKind,
    },
    /// Run diagnostic checks on the container engine and store.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => KilnConfig::load(path),
        None => KilnConfig::load_default(),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_MANIFEST_ERROR);
        }
    };

    let cancel = CancelFlag::new();
    install_signal_handler(cancel.clone());

    let store_path = cli
        .store
        .as_deref()
        .map_or_else(|| config.store_root(), expand_tilde);
    let json_output = cli.json;

    let needs_engine = matches!(
        cli.command,
        Commands::Pull {
            backend: BackendKind::Daemon,
            ..
        } | Commands::Clean {
            backend: BackendKind::Daemon,
            ..
        } | Commands::Images {
            backend: BackendKind::Daemon
        }
    );
    if needs_engine && std::env::var("KILN_SKIP_PREREQS").as_deref() != Ok("1") {
        let missing = kiln_runtime::check_engine_prereqs(&config.engine);
        if !missing.is_empty() {
            eprintln!("error: {}", kiln_runtime::format_missing(&missing));
            return ExitCode::from(EXIT_FAILURE);
        }
    }

    let engine = Engine::new(&store_path, config.clone()).with_cancel(cancel);

    let result = match cli.command {
        Commands::Build { manifests } => commands::build::run(&engine, &manifests, json_output),
        Commands::Lock {
            manifest,
            architectures,
        } => commands::lock::run(&engine, &manifest, &architectures, json_output),
        Commands::Render { manifest } => commands::render::run(&engine, &manifest, json_output),
        Commands::Pull { reference, backend } => {
            commands::pull::run(&engine, backend, &reference, json_output)
        }
        Commands::Clean { tags, backend } => {
            commands::clean::run(&engine, backend, &tags, json_output)
        }
        Commands::Images { backend } => commands::images::run(&engine, backend, json_output),
        Commands::Doctor => commands::doctor::run(&config, &store_path, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(Failure { code, message }) => {
            eprintln!("error: {message}");
            ExitCode::from(code)
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

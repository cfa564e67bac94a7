//! kernel-bootstrap CLI entry point.

use std::io::Write;

use clap::Parser;
use kernel_bootstrap::{
    BootstrapConfig, BootstrapError, Cli, Collaborators, EnvVars, Orchestrator, Outcome,
    ProgramArgs,
};
use log::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let program_args = ProgramArgs::from_args(std::env::args().skip(1).collect());
    let cli = Cli::parse_from(
        std::iter::once("kernel-bootstrap".to_string()).chain(program_args.args.iter().cloned()),
    );
    let vars = EnvVars::capture();

    let config = match BootstrapConfig::from_cli(cli, &vars) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    };

    // Initialize logging; RUST_LOG overrides the positional level
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .format(|buf, record| writeln!(buf, "{:>8} | {}", record.level(), record.args()))
    .init();

    let code = match run(config, vars, &program_args).await {
        Ok(outcome) => {
            if let Outcome::Planned(plan) = &outcome {
                match serde_json::to_string_pretty(plan) {
                    Ok(json) => println!("{json}"),
                    Err(e) => error!("Failed to render plan: {e}"),
                }
            }
            outcome.exit_code()
        }
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(
    config: BootstrapConfig,
    vars: EnvVars,
    program_args: &ProgramArgs,
) -> Result<Outcome, BootstrapError> {
    info!("kernel-bootstrap {} starting", env!("CARGO_PKG_VERSION"));
    if program_args.is_rerun {
        info!("Re-executed with a temporary capability venv");
    }

    let collaborators = Collaborators::system(&config, &vars, program_args)?;
    let orchestrator = Orchestrator::new(config, vars, collaborators);
    let outcome = orchestrator.run(program_args).await?;

    if let Outcome::Completed(report) = &outcome {
        info!("Environment ready: {:?} ({})", report.env_path, report.backend);
        info!("  Python: {:?}", report.python_path);
        if let Some(kernel) = &report.kernel {
            info!("  Kernel: {} ({})", kernel.name, kernel.display_name);
        }
        for hook in &report.hooks {
            info!("  Hook: {:?}", hook);
        }
    }
    Ok(outcome)
}

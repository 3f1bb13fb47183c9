//! occsearch CLI - Run constrained occupation matrix searches from JSON configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::{Parser, Subcommand};

use occsearch::{
    report,
    schema::{SearchConfig, SearchOutput},
    search::{Checkpoint, CommandSubstrate, SearchController, SearchProgress},
};

#[derive(Parser)]
#[command(name = "occsearch", version, about = "Constrained DFT+U occupation matrix search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a default configuration.
    ExampleConfig,
    /// Run a search from a configuration file.
    Run {
        config: PathBuf,
        /// Directory holding one subdirectory per calculation.
        #[arg(long, default_value = "runs")]
        workdir: PathBuf,
        /// Write the workflow output here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Continue a search from a checkpoint.
    Resume {
        checkpoint: PathBuf,
        config: PathBuf,
        #[arg(long, default_value = "runs")]
        workdir: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Extract converged calculations from a checkpoint.
    Extract {
        checkpoint: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = report::DEFAULT_MAX_DEPTH)]
        max_depth: usize,
    },
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::ExampleConfig => {
            print_example_config();
            0
        }
        Commands::Run {
            config,
            workdir,
            output,
        } => {
            let config = load_config(&config);
            let controller = SearchController::new(config, CommandSubstrate::new(workdir))
                .unwrap_or_else(|e| exit_with(&format!("Invalid configuration: {}", e)));
            run_search(controller, output.as_deref())
        }
        Commands::Resume {
            checkpoint,
            config,
            workdir,
            output,
        } => {
            let config = load_config(&config);
            let checkpoint = load_checkpoint(&checkpoint);
            let controller =
                SearchController::resume(config, CommandSubstrate::new(workdir), checkpoint)
                    .unwrap_or_else(|e| exit_with(&format!("Invalid configuration: {}", e)));
            run_search(controller, output.as_deref())
        }
        Commands::Extract {
            checkpoint,
            output,
            max_depth,
        } => {
            let checkpoint = load_checkpoint(&checkpoint);
            let tree = report::ProvenanceNode::from_checkpoint(&checkpoint);
            let extracted = report::gather(&tree, max_depth);
            if let Err(e) = report::write_report(&extracted, &output) {
                exit_with(&format!("Error writing report: {}", e));
            }
            let stats = &extracted.statistics;
            println!(
                "Extracted {} converged of {} calculations ({:.1}%) to {}",
                stats.converged_calculations,
                stats.total_calculations,
                stats.convergence_rate_percent,
                output.display()
            );
            0
        }
    };

    process::exit(code);
}

fn exit_with(message: &str) -> ! {
    eprintln!("{}", message);
    process::exit(1);
}

fn load_config(path: &Path) -> SearchConfig {
    SearchConfig::from_file(path)
        .unwrap_or_else(|e| exit_with(&format!("Error loading {}: {}", path.display(), e)))
}

fn load_checkpoint(path: &Path) -> Checkpoint {
    Checkpoint::load(path)
        .unwrap_or_else(|e| exit_with(&format!("Error loading {}: {}", path.display(), e)))
}

fn report_progress(progress: &SearchProgress) {
    println!(
        "[{:?}] generations: {:3} | attempted: {:4}/{} | successful: {:4}",
        progress.phase,
        progress.generations,
        progress.attempted,
        progress.n_max,
        progress.successful
    );
}

/// Run to completion and return the process exit code.
fn run_search(mut controller: SearchController<CommandSubstrate>, output: Option<&Path>) -> i32 {
    let start = Instant::now();
    let (result, code) = match controller.run_with_callback(report_progress) {
        Ok(result) => (result, 0),
        Err(failure) => {
            eprintln!("Search failed: {}", failure.error);
            let code = i32::from(failure.output.exit_code.code());
            (failure.output, code)
        }
    };

    write_output(&result, output);

    println!();
    println!("Search {}:", controller.state().workflow_pk);
    println!("  Exit code: {} ({})", result.exit_code.code(), result.exit_code.label());
    println!("  Generations: {}", result.generation_summary.len());
    println!("  Calculations: {}", result.all_calculation_pks.len());
    println!("  Time: {:.1}s", start.elapsed().as_secs_f32());

    code
}

fn write_output(result: &SearchOutput, output: Option<&Path>) {
    let json = match serde_json::to_string_pretty(result) {
        Ok(json) => json,
        Err(e) => exit_with(&format!("Error serializing output: {}", e)),
    };
    match output {
        Some(path) => {
            if let Err(e) = fs::write(path, json) {
                exit_with(&format!("Error writing {}: {}", path.display(), e));
            }
            println!("Output written to {}", path.display());
        }
        None => println!("{}", json),
    }
}

fn print_example_config() {
    match serde_json::to_string_pretty(&SearchConfig::default()) {
        Ok(json) => {
            println!("Example configuration (search.json):");
            println!("{}", json);
        }
        Err(e) => exit_with(&format!("Error serializing example: {}", e)),
    }
}

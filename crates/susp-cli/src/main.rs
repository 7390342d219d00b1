//! `susp`: solve suspension projects from the command line

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "susp")]
#[command(version, about = "Suspension geometry kinematics and skidpad solver")]
struct Cli {
    /// Solver configuration (RON); defaults apply to missing fields
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve element positions under the project's controls
    Kinematics {
        /// Project file (RON)
        project: PathBuf,

        /// Override a controlled offset, as `element=value`
        #[arg(short, long = "offset")]
        offsets: Vec<String>,

        /// Write the solved project here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Static solve of the vehicle on a steady-state skidpad
    Skidpad {
        /// Project file (RON)
        project: PathBuf,

        /// Skidpad configuration (RON)
        #[arg(short, long)]
        skidpad: Option<PathBuf>,

        /// Forward speed in m/s, overrides the skidpad configuration
        #[arg(short, long)]
        velocity: Option<f64>,

        /// Write the solved project here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a project and print its constraint groups
    Check {
        /// Project file (RON)
        project: PathBuf,
    },
}

fn main() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "susp_solver=info,susp_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Kinematics {
            project,
            offsets,
            output,
        } => commands::kinematics(&project, config, &offsets, output.as_deref()),
        Commands::Skidpad {
            project,
            skidpad,
            velocity,
            output,
        } => commands::skidpad(&project, config, skidpad.as_deref(), velocity, output.as_deref()),
        Commands::Check { project } => commands::check(&project, config),
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

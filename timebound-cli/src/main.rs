// CLI application
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use timebound_cli::commands::{self, Inputs};

#[derive(Parser)]
#[command(name = "timebound")]
#[command(about = "Static WCET analysis for embedded binaries")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct InputArgs {
    /// Decoded program description (JSON)
    #[arg(short, long)]
    program: PathBuf,

    /// Hardware description (JSON)
    #[arg(long)]
    hardware: Option<PathBuf>,

    /// Flow-fact file (.ff)
    #[arg(short, long)]
    flowfacts: Option<PathBuf>,

    /// Task entry function, by name or address
    #[arg(short, long)]
    entry: Option<String>,

    /// Human-readable ILP variable names
    #[arg(long)]
    explicit: bool,

    /// Disable call inlining
    #[arg(long)]
    no_virtualize: bool,

    /// Unroll the first iteration of every bounded loop
    #[arg(long)]
    unroll: bool,

    /// Split blocks by instruction condition
    #[arg(long)]
    restructure: bool,
}

impl InputArgs {
    fn into_inputs(self) -> Inputs {
        Inputs {
            program: self.program,
            hardware: self.hardware,
            flowfacts: self.flowfacts,
            entry: self.entry,
            explicit: self.explicit,
            virtualize: !self.no_virtualize,
            unroll: self.unroll,
            restructure: self.restructure,
        }
    }
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Compute the WCET of a task
    Wcet {
        #[command(flatten)]
        inputs: InputArgs,

        /// Also dump the solved ILP system in LP format
        #[arg(long)]
        dump_lp: Option<PathBuf>,

        /// Write per-block statistics (JSON)
        #[arg(long)]
        stats: Option<PathBuf>,

        /// Write the annotated CFG collection (XML)
        #[arg(long)]
        xml: Option<PathBuf>,
    },
    /// Assemble the ILP system and print it without solving
    DumpLp {
        #[command(flatten)]
        inputs: InputArgs,

        /// Output file (stdout when absent)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a flow-fact template for every loop of the task
    Mkff {
        #[command(flatten)]
        inputs: InputArgs,
    },
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap prints help/version through the error path too
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let result = match cli.command {
        Commands::Wcet { inputs, dump_lp, stats, xml } => commands::wcet(
            &inputs.into_inputs(),
            dump_lp.as_deref(),
            stats.as_deref(),
            xml.as_deref(),
        ),
        Commands::DumpLp { inputs, output } => {
            commands::dump_lp(&inputs.into_inputs(), output.as_deref())
        }
        Commands::Mkff { inputs } => commands::mkff(&inputs.into_inputs()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

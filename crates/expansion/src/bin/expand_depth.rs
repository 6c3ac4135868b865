use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;
use expansion::{run_expansion, ExpansionError, ExpansionParams, ExpansionStrategy};
use model::STACK_PREFIX;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        eprintln!("expansion failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Grow a trained encoder snapshot to a deeper stack", long_about = None)]
struct Args {
    #[arg(value_name = "INPUT", help = "Snapshot directory to read")]
    input: PathBuf,

    #[arg(value_name = "OUTPUT", help = "Snapshot directory to write")]
    output: PathBuf,

    #[arg(value_name = "DEPTH_DELTA", help = "Number of layer positions to add")]
    depth_delta: usize,

    #[arg(long, value_enum, default_value_t = ExpansionStrategy::StackOnTop)]
    strategy: ExpansionStrategy,

    #[arg(long, default_value = STACK_PREFIX, help = "Parameter prefix of the stack to grow")]
    stack: String,

    #[arg(
        long,
        value_name = "K",
        value_delimiter = ',',
        help = "Checkpoint list for the output, e.g. 0,6,12"
    )]
    checkpoints: Option<Vec<usize>>,

    #[arg(long, help = "Replace OUTPUT if it already exists")]
    force: bool,
}

fn run() -> Result<(), ExpansionError> {
    let args = Args::parse();

    let mut params = ExpansionParams::new(args.strategy, args.depth_delta).with_stack(args.stack);
    if let Some(checkpoints) = args.checkpoints {
        params = params.with_checkpoints(checkpoints);
    }

    let manifest = run_expansion(&args.input, &args.output, &params, args.force, &Device::Cpu)?;
    println!(
        "wrote {} ({} bytes, {} layers, k = {:?})",
        args.output.display(),
        manifest.model.bytes,
        manifest.metadata.encoder_layers,
        manifest.metadata.k
    );
    Ok(())
}

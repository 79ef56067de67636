//! synthesizes a deployment file into cloudformation templates

use anyhow::Context;
use clap::Parser;
use meshsynth::{
    app::App,
    config::{Command, DeploySpec, Opts},
};
use tracing_subscriber::EnvFilter;

fn inner_main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let mut spec = DeploySpec::from_file(&opts.config)?;
    if let Some(network) = &opts.network {
        spec.network = network.clone();
    }
    let env = opts.environment()?;
    let build = opts.build_info()?;

    let assembly = App::from_spec(&spec, env, &build)
        .and_then(App::synth)
        .with_context(|| format!("failed to synthesize {}", opts.config.to_string_lossy()))?;

    match &opts.command {
        Command::Synth { out, format } => {
            let written = assembly
                .write(out, *format)
                .with_context(|| format!("failed to write {}", out.to_string_lossy()))?;
            eprintln!("wrote {} files to {}", written.len(), out.to_string_lossy());
        }
        Command::List => {
            for stack in &assembly.stacks {
                println!("{}", stack.name);
            }
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = inner_main() {
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
}

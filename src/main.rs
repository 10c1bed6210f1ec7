use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use maasim::instruction::EncodedFields;
use maasim::sim::Simulator;
use maasim::{Config, WriteOutcome};
use serde::Deserialize;
use std::path::PathBuf;

/// One upstream action from a command trace.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    /// Seed the functional memory backend.
    FillMemory { addr: u64, values: Vec<u32> },
    WriteReg { reg: usize, value: i32 },
    WriteTile { tile: usize, values: Vec<u32> },
    Instruction(EncodedFields),
    /// Drain the accelerator, then print a tile.
    DumpTile { tile: usize },
}

#[derive(Debug, Parser)]
#[command(author, version, about = "memory access accelerator model", long_about = None)]
struct Options {
    /// Command trace (JSON list of upstream actions)
    #[arg(short = 'p', long = "path", value_name = "COMMANDS")]
    commands: PathBuf,
    /// Accelerator configuration (YAML); defaults match the shipped model
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Give up after this many cycles without draining
    #[arg(long, default_value_t = 1_000_000)]
    max_cycles: u64,
    /// Write collected statistics as JSON here instead of stdout
    #[arg(short, long)]
    stats: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let options = Options::parse();

    let config = match &options.config {
        Some(path) => {
            let file = std::fs::File::open(path)
                .wrap_err_with(|| format!("failed to open config {}", path.display()))?;
            serde_yaml::from_reader(file)?
        }
        None => Config::default(),
    };
    let mut sim = Simulator::new(config)?;

    let file = std::fs::File::open(&options.commands)
        .wrap_err_with(|| format!("failed to open commands {}", options.commands.display()))?;
    let commands: Vec<Command> = serde_json::from_reader(file)?;

    for command in commands {
        log::info!("command: {command:?}");
        match command {
            Command::FillMemory { addr, values } => {
                for (i, value) in values.into_iter().enumerate() {
                    sim.memory.write_word(addr + 4 * i as u64, value);
                }
            }
            Command::WriteReg { reg, value } => sim.write_reg(reg, value)?,
            Command::WriteTile { tile, values } => sim.write_tile(tile, &values)?,
            Command::Instruction(fields) => {
                // a nacked push retries once the blocking instruction drains
                while sim.push_instruction(&fields)? == WriteOutcome::Nack {
                    sim.run_until_idle(options.max_cycles)?;
                }
            }
            Command::DumpTile { tile } => {
                sim.run_until_idle(options.max_cycles)?;
                let len = usize::from(sim.tile_size(tile)?);
                println!("tile[{tile}][0..{len}] = {:?}", sim.read_tile(tile, len)?);
            }
        }
    }
    sim.run_until_idle(options.max_cycles)?;

    let collected = sim.maa.collected_stats();
    let json = serde_json::to_string_pretty(&collected)?;
    match &options.stats {
        Some(path) => std::fs::write(path, json)
            .wrap_err_with(|| format!("failed to write stats {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

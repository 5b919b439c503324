use clap::Parser;
use rv32i_vm::engine::Register;
use rv32i_vm::{Emulator, EmulatorConfig, HaltOnEnvironmentCall, RunOutcome};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to an ELF32 executable or flat binary
    #[arg(short, long)]
    kernel: PathBuf,

    /// Address to place a flat binary at (decimal or 0x-prefixed hex)
    #[arg(long, default_value = "0", value_parser = parse_u32)]
    load_addr: u32,

    /// Override the entry point reported by the loader
    #[arg(long, value_parser = parse_u32)]
    entry: Option<u32>,

    /// Stop after this many instructions
    #[arg(long)]
    max_instructions: Option<u64>,

    /// Trap on misaligned halfword/word accesses and jump targets
    #[arg(long)]
    strict_alignment: bool,

    /// Write a machine snapshot here once the run stops
    #[arg(long)]
    snapshot_out: Option<PathBuf>,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn dump_registers(emu: &Emulator) {
    let state = emu.registers();
    for (i, reg) in Register::ALL.iter().enumerate() {
        print!("{:>4}={:08x}", reg.abi_name(), state.regs[i]);
        if i % 4 == 3 {
            println!();
        } else {
            print!("  ");
        }
    }
    println!("  pc={:08x}  instret={}", state.pc, emu.instret());
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let buffer = std::fs::read(&args.kernel)?;
    let config = EmulatorConfig {
        strict_alignment: args.strict_alignment,
        max_instructions: args.max_instructions,
        entry: args.entry,
    };
    let mut emu = Emulator::with_config(config);
    let entry = emu.load_image(&buffer, args.load_addr)?;
    log::debug!(
        "Loaded {} ({} bytes), entry=0x{:08x}",
        args.kernel.display(),
        buffer.len(),
        entry
    );

    let result = emu.run_configured(&mut HaltOnEnvironmentCall);
    match &result {
        Ok(RunOutcome::Exited(exit)) => {
            println!(
                "Halted by {:?} at pc=0x{:08x} with exit code {}",
                exit.call, exit.pc, exit.code
            );
        }
        Ok(RunOutcome::BudgetExhausted { executed }) => {
            println!("Instruction budget exhausted after {} instructions", executed);
        }
        Err(e) => {
            println!("Stopped: {}", e);
        }
    }
    dump_registers(&emu);

    if let Some(path) = &args.snapshot_out {
        emu.save_snapshot_to_path(path)?;
        println!("Snapshot saved to {}", path.display());
    }

    result?;
    Ok(())
}

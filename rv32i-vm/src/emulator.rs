use crate::cpu::{Cpu, EnvCall, Fault, Step};
use crate::engine::decoder::Register;
use crate::loader::{self, LoadError};
use crate::memory::Memory;
use crate::snapshot::{self, CpuSnapshot, SNAPSHOT_VERSION, Snapshot, SnapshotError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

/// Machine configuration. Every field has a default, so a partial
/// (or empty) serialized config is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Trap on misaligned halfword/word accesses and jump targets instead
    /// of masking the address.
    pub strict_alignment: bool,
    /// Instruction budget applied by [`Emulator::run_configured`].
    pub max_instructions: Option<u64>,
    /// Entry point overriding the one reported by the loader.
    pub entry: Option<u32>,
}

/// Decision returned by an [`Environment`] after servicing ECALL/EBREAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Continue with the instruction after the call, or at the pc the
    /// environment wrote if it moved it.
    Resume,
    /// Stop the machine with the given exit code.
    Halt(u32),
}

/// Host services reachable from the guest through ECALL and EBREAK.
pub trait Environment {
    fn call(&mut self, call: EnvCall, cpu: &mut Cpu, memory: &mut Memory) -> Control;
}

/// Default environment: any ECALL or EBREAK stops the machine, with the
/// exit code taken from `a0`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HaltOnEnvironmentCall;

impl Environment for HaltOnEnvironmentCall {
    fn call(&mut self, _call: EnvCall, cpu: &mut Cpu, _memory: &mut Memory) -> Control {
        Control::Halt(cpu.read_reg(Register::X10))
    }
}

/// Orderly stop requested by the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit {
    pub code: u32,
    pub call: EnvCall,
    /// Address of the ECALL/EBREAK that stopped the machine.
    pub pc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Halt {
    Exit(Exit),
    Fault(Fault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Halted(Halt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(Exit),
    /// The budget ran out while the machine was still running.
    BudgetExhausted { executed: u64 },
}

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error(transparent)]
    Fault(#[from] Fault),

    #[error("machine is halted ({0:?}); reset it before stepping again")]
    Halted(Halt),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// A complete RV32I machine: register file, memory and the fetch-execute
/// loop that drives them.
///
/// ```ignore
/// let mut emu = Emulator::new();
/// emu.load_image(&bytes, 0)?;
/// let exit = emu.run(&mut HaltOnEnvironmentCall)?;
/// ```
pub struct Emulator {
    pub cpu: Cpu,
    pub memory: Memory,
    config: EmulatorConfig,
    state: State,
    /// Instructions retired since construction or the last reset.
    instret: u64,
    entry: u32,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Emulator {
    pub fn new() -> Self {
        Self::with_config(EmulatorConfig::default())
    }

    pub fn with_config(config: EmulatorConfig) -> Self {
        let entry = config.entry.unwrap_or(0);
        let mut cpu = Cpu::new(entry);
        cpu.strict_alignment = config.strict_alignment;
        Self {
            cpu,
            memory: Memory::new(),
            config,
            state: State::Running,
            instret: 0,
            entry,
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, State::Halted(_))
    }

    pub fn instret(&self) -> u64 {
        self.instret
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Registers and pc as of the last completed instruction.
    pub fn registers(&self) -> CpuSnapshot {
        self.cpu.snapshot()
    }

    fn set_entry(&mut self, loaded: u32) -> u32 {
        let entry = self.config.entry.unwrap_or(loaded);
        self.entry = entry;
        self.cpu.pc = entry;
        entry
    }

    /// Load an ELF or flat image (flat images go to `load_addr`) and point
    /// the pc at its entry.
    pub fn load_image(&mut self, buffer: &[u8], load_addr: u32) -> Result<u32, EmulatorError> {
        let loaded = loader::load_image(buffer, load_addr, &mut self.memory)?;
        Ok(self.set_entry(loaded))
    }

    /// Seed memory with individual words and set the entry pc.
    pub fn load_words<I>(&mut self, entry: u32, words: I) -> u32
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        for (addr, word) in words {
            self.memory.write_word(addr, word);
        }
        self.set_entry(entry)
    }

    /// Return to the initial state: all registers and memory zero, pc at
    /// the entry point, counters cleared.
    pub fn reset(&mut self) {
        self.cpu.reset(self.entry);
        self.memory.clear();
        self.state = State::Running;
        self.instret = 0;
    }

    /// Execute exactly one instruction.
    ///
    /// A fault halts the machine and is returned as `EmulatorError::Fault`;
    /// the state it left behind is what it was before the instruction.
    pub fn step(&mut self, env: &mut dyn Environment) -> Result<State, EmulatorError> {
        if let State::Halted(halt) = self.state {
            return Err(EmulatorError::Halted(halt));
        }

        let pc = self.cpu.pc;
        match self.cpu.step(&mut self.memory) {
            Ok(Step::Retired) => {
                self.instret += 1;
            }
            Ok(Step::Environment(call)) => match env.call(call, &mut self.cpu, &mut self.memory) {
                Control::Resume => {
                    if self.cpu.pc == pc {
                        self.cpu.pc = pc.wrapping_add(4);
                    }
                    self.instret += 1;
                }
                Control::Halt(code) => {
                    log::debug!(
                        "Halted by {:?} at pc=0x{:08x} (code {:#x}) after {} instructions",
                        call,
                        pc,
                        code,
                        self.instret
                    );
                    self.state = State::Halted(Halt::Exit(Exit { code, call, pc }));
                }
            },
            Err(fault) => {
                log::warn!("{} after {} instructions", fault, self.instret);
                self.state = State::Halted(Halt::Fault(fault));
                return Err(fault.into());
            }
        }
        Ok(self.state)
    }

    /// Run until the environment halts the machine or an instruction faults.
    pub fn run(&mut self, env: &mut dyn Environment) -> Result<Exit, EmulatorError> {
        loop {
            if let State::Halted(Halt::Exit(exit)) = self.step(env)? {
                return Ok(exit);
            }
        }
    }

    /// Like [`run`](Self::run), but stops after `budget` steps.
    pub fn run_with_budget(
        &mut self,
        env: &mut dyn Environment,
        budget: u64,
    ) -> Result<RunOutcome, EmulatorError> {
        for _ in 0..budget {
            if let State::Halted(Halt::Exit(exit)) = self.step(env)? {
                return Ok(RunOutcome::Exited(exit));
            }
        }
        log::debug!(
            "Instruction budget of {} exhausted at pc=0x{:08x}",
            budget,
            self.cpu.pc
        );
        Ok(RunOutcome::BudgetExhausted { executed: budget })
    }

    /// Run with the budget from the configuration, if any.
    pub fn run_configured(&mut self, env: &mut dyn Environment) -> Result<RunOutcome, EmulatorError> {
        match self.config.max_instructions {
            Some(budget) => self.run_with_budget(env, budget),
            None => self.run(env).map(RunOutcome::Exited),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION.to_string(),
            cpu: self.cpu.snapshot(),
            instret: self.instret,
            pages: snapshot::capture_pages(&self.memory),
        }
    }

    /// Restore machine state from a previously captured snapshot. The
    /// machine is running afterwards, even if it was halted when captured.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), EmulatorError> {
        snapshot.check_version()?;
        snapshot::restore_pages(&mut self.memory, &snapshot.pages)?;
        self.cpu.restore(&snapshot.cpu);
        self.instret = snapshot.instret;
        self.state = State::Running;
        Ok(())
    }

    pub fn from_snapshot(snapshot: &Snapshot, config: EmulatorConfig) -> Result<Self, EmulatorError> {
        let mut emu = Emulator::with_config(config);
        emu.apply_snapshot(snapshot)?;
        emu.entry = snapshot.cpu.pc;
        Ok(emu)
    }

    /// Save a snapshot to disk using bincode.
    pub fn save_snapshot_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), EmulatorError> {
        let bytes = self.snapshot().to_bytes()?;
        let mut file = File::create(path.as_ref()).map_err(SnapshotError::from)?;
        file.write_all(&bytes).map_err(SnapshotError::from)?;
        file.flush().map_err(SnapshotError::from)?;
        log::debug!(
            "Snapshot written to {} ({} bytes)",
            path.as_ref().display(),
            bytes.len()
        );
        Ok(())
    }

    /// Load a snapshot from disk and construct a new emulator instance.
    pub fn load_snapshot_from_path<P: AsRef<Path>>(
        path: P,
        config: EmulatorConfig,
    ) -> Result<Self, EmulatorError> {
        let mut bytes = Vec::new();
        File::open(path.as_ref())
            .and_then(|mut file| file.read_to_end(&mut bytes))
            .map_err(SnapshotError::from)?;
        let snapshot = Snapshot::from_bytes(&bytes)?;
        Emulator::from_snapshot(&snapshot, config)
    }
}

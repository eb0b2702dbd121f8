use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use wasmtime::{
    Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap, Val,
};
use wasmtime_wasi::preview1::{self as p1, WasiP1Ctx};
use wasmtime_wasi::p2::WasiCtxBuilder;
use wasmtime_wasi::{DirPerms, FilePerms};

use crate::config::WasmLimits;
use crate::error::{AgentError, Result};
use crate::job::{ExecutionResult, JobStatus};

const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];
const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Interval at which the engine epoch advances while a guest runs. The
/// wall-clock deadline is expressed in these ticks.
const EPOCH_TICK: Duration = Duration::from_millis(100);

/// Grace added to the host-side backstop timeout so the epoch trap normally
/// wins the race.
const BACKSTOP_GRACE: Duration = Duration::from_secs(1);

/// Budget for a single execution, derived from the job and agent limits.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionBudget {
    pub wall_clock: Duration,
    pub cpu_time: Duration,
    pub memory_bytes: usize,
}

/// Store data: the WASI context plus the limiter bounding linear memory.
struct SandboxState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// What the guest did, as observed on the blocking thread.
enum GuestOutcome {
    /// Entry returned normally; the first return value, if any, rendered.
    Completed(Option<String>),
    /// Guest called the WASI exit syscall.
    Exit(i32),
    /// Guest trapped at runtime.
    Trapped { trap: TrapKind, message: String },
    /// Setup failed before the guest ever ran.
    Failed(String),
}

enum TrapKind {
    OutOfFuel,
    Deadline,
    Other,
}

struct GuestRun {
    outcome: GuestOutcome,
    fuel_used: u64,
}

/// Loads, validates and runs WebAssembly modules under hard compute, time
/// and memory budgets.
pub struct SandboxExecutor {
    engine: Engine,
    limits: WasmLimits,
}

impl SandboxExecutor {
    pub fn new(limits: WasmLimits) -> Result<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        // Shrink the trusted compiler surface: jobs get the MVP instruction
        // set only.
        config.wasm_bulk_memory(false);
        config.wasm_reference_types(false);
        config.wasm_multi_value(false);
        config.wasm_threads(false);
        config.wasm_simd(false);
        // Proposals layered on the ones above must go too or the engine
        // rejects the configuration.
        config.wasm_relaxed_simd(false);
        config.wasm_function_references(false);
        config.wasm_gc(false);

        let engine = Engine::new(&config)
            .map_err(|e| AgentError::Internal(format!("failed to create wasm engine: {e}")))?;

        Ok(Self { engine, limits })
    }

    pub fn limits(&self) -> &WasmLimits {
        &self.limits
    }

    /// Budget for a job declaring `max_seconds` / `mem_mb`. Zero fields fall
    /// back to the configured defaults; the caller is responsible for
    /// clamping `max_seconds` to the agent-wide ceiling.
    pub fn budget_for(&self, max_seconds: u64, mem_mb: u64) -> ExecutionBudget {
        let wall_clock = if max_seconds == 0 {
            self.limits.max_execution
        } else {
            Duration::from_secs(max_seconds)
        };
        let memory_bytes = if mem_mb == 0 {
            self.limits.default_memory_bytes()
        } else {
            (mem_mb as usize) * 1024 * 1024
        };
        ExecutionBudget {
            wall_clock,
            cpu_time: self.limits.cpu_time.min(wall_clock.max(Duration::from_secs(1))),
            memory_bytes,
        }
    }

    /// Structural validation. Pure function of the bytes: same input, same
    /// verdict.
    pub fn verify(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < 8 {
            return Err(AgentError::Validation("module too short".to_string()));
        }
        if bytes[0..4] != WASM_MAGIC {
            return Err(AgentError::Validation(
                "missing WebAssembly magic number".to_string(),
            ));
        }
        if bytes[4..8] != WASM_VERSION {
            return Err(AgentError::Validation(
                "unsupported WebAssembly version".to_string(),
            ));
        }
        Module::validate(&self.engine, bytes)
            .map_err(|e| AgentError::Validation(format!("module rejected: {e}")))
    }

    /// Run a module inside a fresh store. No state is shared across jobs.
    ///
    /// `preopen_dir`, when given, is exposed to the guest read-only at `/`;
    /// nothing else of the host filesystem is visible, and the guest has no
    /// network access.
    pub async fn execute(
        &self,
        bytes: Vec<u8>,
        entry: Option<&str>,
        budget: ExecutionBudget,
        preopen_dir: Option<PathBuf>,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let start = Instant::now();

        if let Err(e) = self.verify(&bytes) {
            return ExecutionResult::failure(e.to_string(), started_at);
        }

        let fuel = budget.cpu_time.as_secs().max(1) * self.limits.fuel_per_cpu_second;
        let deadline_ticks =
            ((budget.wall_clock.as_millis() as u64) / (EPOCH_TICK.as_millis() as u64)).max(1);
        let entry = entry.unwrap_or("_start").to_string();

        let engine = self.engine.clone();
        let guest = tokio::task::spawn_blocking(move || {
            run_guest(
                engine,
                bytes,
                entry,
                fuel,
                deadline_ticks,
                budget.memory_bytes,
                preopen_dir,
            )
        });

        // Advance the epoch on a timer so a spinning guest traps at the
        // deadline even though it never yields.
        let pump_engine = self.engine.clone();
        let pump = tokio::spawn(async move {
            for _ in 0..=deadline_ticks {
                tokio::time::sleep(EPOCH_TICK).await;
                pump_engine.increment_epoch();
            }
        });

        let outcome = tokio::time::timeout(budget.wall_clock + BACKSTOP_GRACE, guest).await;
        pump.abort();

        let finished_at = Utc::now();
        let cpu_time = start.elapsed();

        let run = match outcome {
            Err(_) => {
                return ExecutionResult {
                    status: JobStatus::Timeout,
                    output: None,
                    error: Some(AgentError::Timeout(budget.wall_clock).to_string()),
                    started_at,
                    finished_at,
                    cpu_time,
                    fuel_used: 0,
                };
            }
            Ok(Err(join_err)) => {
                return ExecutionResult {
                    status: JobStatus::Error,
                    output: None,
                    error: Some(format!("execution task failed: {join_err}")),
                    started_at,
                    finished_at,
                    cpu_time,
                    fuel_used: 0,
                };
            }
            Ok(Ok(run)) => run,
        };

        let (status, output, error) = match run.outcome {
            GuestOutcome::Completed(output) => (JobStatus::Ok, output, None),
            GuestOutcome::Exit(0) => (JobStatus::Ok, None, None),
            GuestOutcome::Exit(code) => (
                JobStatus::Error,
                None,
                Some(format!("guest exited with status {code}")),
            ),
            GuestOutcome::Trapped { trap, message } => match trap {
                TrapKind::OutOfFuel => (
                    JobStatus::Error,
                    None,
                    Some(AgentError::FuelExhausted.to_string()),
                ),
                TrapKind::Deadline => (
                    JobStatus::Timeout,
                    None,
                    Some(AgentError::Timeout(budget.wall_clock).to_string()),
                ),
                TrapKind::Other => (
                    JobStatus::Error,
                    None,
                    Some(AgentError::Trap(message).to_string()),
                ),
            },
            GuestOutcome::Failed(message) => (JobStatus::Error, None, Some(message)),
        };

        ExecutionResult {
            status,
            output,
            error,
            started_at,
            finished_at,
            cpu_time,
            fuel_used: run.fuel_used,
        }
    }
}

/// Compile, instantiate and run on a blocking thread. wasmtime execution is
/// CPU-bound and must not occupy the async runtime.
fn run_guest(
    engine: Engine,
    bytes: Vec<u8>,
    entry: String,
    fuel: u64,
    deadline_ticks: u64,
    memory_bytes: usize,
    preopen_dir: Option<PathBuf>,
) -> GuestRun {
    let failed = |message: String| GuestRun {
        outcome: GuestOutcome::Failed(message),
        fuel_used: 0,
    };

    let module = match Module::new(&engine, &bytes) {
        Ok(module) => module,
        Err(e) => return failed(format!("invalid module: failed to compile: {e}")),
    };

    let mut builder = WasiCtxBuilder::new();
    builder.inherit_stdout();
    builder.inherit_stderr();
    if let Some(dir) = preopen_dir {
        if let Err(e) = builder.preopened_dir(&dir, "/", DirPerms::READ, FilePerms::READ) {
            return failed(format!("failed to preopen job directory: {e}"));
        }
    }
    let wasi = builder.build_p1();

    let limits = StoreLimitsBuilder::new()
        .memory_size(memory_bytes)
        .instances(1)
        .build();

    let mut store = Store::new(&engine, SandboxState { wasi, limits });
    store.limiter(|state| &mut state.limits);
    if let Err(e) = store.set_fuel(fuel) {
        return failed(format!("failed to set fuel quota: {e}"));
    }
    store.set_epoch_deadline(deadline_ticks);

    let mut linker: Linker<SandboxState> = Linker::new(&engine);
    if let Err(e) = p1::add_to_linker_sync(&mut linker, |state: &mut SandboxState| &mut state.wasi)
    {
        return failed(format!("failed to link WASI: {e}"));
    }

    let instance = match linker.instantiate(&mut store, &module) {
        Ok(instance) => instance,
        Err(e) => return failed(format!("failed to instantiate module: {e}")),
    };

    let func = match instance.get_func(&mut store, &entry) {
        Some(func) => func,
        None => return failed(format!("entry point '{entry}' not found")),
    };

    let ty = func.ty(&store);
    if ty.params().len() != 0 {
        return failed(format!("entry point '{entry}' takes parameters"));
    }
    let mut results = vec![Val::I32(0); ty.results().len()];

    let fuel_used = |store: &Store<SandboxState>| fuel.saturating_sub(store.get_fuel().unwrap_or(0));

    match func.call(&mut store, &[], &mut results) {
        Ok(()) => GuestRun {
            fuel_used: fuel_used(&store),
            outcome: GuestOutcome::Completed(results.first().map(render_val)),
        },
        Err(e) => {
            let fuel_used = fuel_used(&store);
            if let Some(exit) = e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                return GuestRun {
                    outcome: GuestOutcome::Exit(exit.0),
                    fuel_used,
                };
            }
            let trap = match e.downcast_ref::<Trap>() {
                Some(Trap::OutOfFuel) => TrapKind::OutOfFuel,
                Some(Trap::Interrupt) => TrapKind::Deadline,
                _ => TrapKind::Other,
            };
            GuestRun {
                outcome: GuestOutcome::Trapped {
                    trap,
                    message: format!("{e}"),
                },
                fuel_used,
            }
        }
    }
}

fn render_val(val: &Val) -> String {
    match val {
        Val::I32(v) => v.to_string(),
        Val::I64(v) => v.to_string(),
        Val::F32(bits) => f32::from_bits(*bits).to_string(),
        Val::F64(bits) => f64::from_bits(*bits).to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(WasmLimits::default()).unwrap()
    }

    #[test]
    fn verify_rejects_short_input() {
        let err = executor().verify(&[0x00, 0x61]).unwrap_err();
        assert!(matches!(err, AgentError::Validation(ref m) if m.contains("too short")));
    }

    #[test]
    fn verify_rejects_bad_magic() {
        let err = executor()
            .verify(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x00, 0x00, 0x00])
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(ref m) if m.contains("magic")));
    }

    #[test]
    fn verify_rejects_bad_version() {
        let err = executor()
            .verify(&[0x00, 0x61, 0x73, 0x6d, 0x02, 0x00, 0x00, 0x00])
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(ref m) if m.contains("version")));
    }

    #[test]
    fn verify_is_deterministic() {
        let exec = executor();
        let bytes = wat::parse_str("(module)").unwrap();
        for _ in 0..3 {
            assert!(exec.verify(&bytes).is_ok());
        }
        for _ in 0..3 {
            assert!(exec.verify(&[0x00, 0x61]).is_err());
        }
    }

    #[test]
    fn budget_defaults_and_overrides() {
        let exec = executor();
        let budget = exec.budget_for(0, 0);
        assert_eq!(budget.wall_clock, Duration::from_secs(30));
        assert_eq!(budget.memory_bytes, 4 * 1024 * 1024);

        let budget = exec.budget_for(5, 16);
        assert_eq!(budget.wall_clock, Duration::from_secs(5));
        assert_eq!(budget.cpu_time, Duration::from_secs(5));
        assert_eq!(budget.memory_bytes, 16 * 1024 * 1024);
    }
}

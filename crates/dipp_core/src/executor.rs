//! Runs a single module implementation in an isolated subordinate process.
//! Rust has no safe equivalent of `fork()`, so isolation here is a re-exec of
//! the current binary with a hidden entry-point argument, the same
//! `Command::new(current_exe)` self-respawn idiom used to launch a detached
//! daemon elsewhere in this codebase. The subordinate arms its own
//! wall-clock timeout and talks back over stdout (the result descriptor) and
//! stderr (a numeric error code on failure); both are always drained
//! regardless of how the subordinate exits.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::error::{DippError, DippResult};
use crate::interfaces::ModuleRegistry;
use crate::model::{BatchIdentity, ModuleOutcome, ModuleParameterList};

/// Module-defined error codes occupy `0..MODULE_DEFINED_CODE_CEILING`; the
/// executor remaps them by adding `MODULE_EXIT_CUSTOM` so they can never
/// collide with the framework sentinels below, which all live at or above
/// it.
pub const MODULE_DEFINED_CODE_CEILING: u16 = 100;
pub const MODULE_EXIT_CUSTOM: u16 = 1000;
pub const MODULE_EXIT_TIMEOUT: u16 = 100;
pub const MODULE_EXIT_CRASH: u16 = 101;
pub const MODULE_EXIT_PIPE_READ: u16 = 102;

/// The hidden argv[1] this binary recognizes to behave as a subordinate
/// instead of the ordinary CLI. Owned here so both the spawn side and the
/// dispatch side agree on the literal.
pub const SUBORDINATE_ARG: &str = "__dipp_run_module";

#[derive(serde::Serialize, serde::Deserialize)]
struct SubordinateRequest {
    entry_point: String,
    identity: BatchIdentity,
    config: ModuleParameterList,
    timeout_ms: u64,
}

/// Launches subordinate processes. Abstracted behind a trait so tests can
/// substitute a fake launcher without spawning the real binary.
pub trait SubordinateSpawner: Send + Sync {
    fn spawn(&self, exe_args: &[String]) -> std::io::Result<Child>;
}

/// Spawns `std::env::current_exe()` with the hidden subordinate argument.
pub struct ProcessSpawner;

impl SubordinateSpawner for ProcessSpawner {
    fn spawn(&self, exe_args: &[String]) -> std::io::Result<Child> {
        let exe = std::env::current_exe()?;
        Command::new(exe)
            .args(exe_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

pub struct ModuleExecutor<S: SubordinateSpawner> {
    spawner: S,
}

impl<S: SubordinateSpawner> ModuleExecutor<S> {
    pub fn new(spawner: S) -> Self {
        Self { spawner }
    }

    /// Runs `entry_point` against `identity`/`config`, passing `timeout` down
    /// so the subordinate can arm its own watchdog. Blocks until the
    /// subordinate exits. On any failure the caller should invalidate
    /// whatever pipeline/module configuration cache it holds, since the
    /// failure may mean that configuration is stale or broken.
    pub fn execute(
        &self,
        entry_point: &str,
        identity: &BatchIdentity,
        config: &ModuleParameterList,
        timeout: Duration,
    ) -> DippResult<BatchIdentity> {
        let request = SubordinateRequest {
            entry_point: entry_point.to_string(),
            identity: identity.clone(),
            config: config.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| DippError::Ipc(format!("encode request: {e}")))?;

        let mut child = self
            .spawner
            .spawn(&[SUBORDINATE_ARG.to_string()])
            .map_err(|e| DippError::Ipc(format!("spawn subordinate: {e}")))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(&payload)
                .map_err(|e| DippError::Ipc(format!("write to subordinate: {e}")))?;
        }
        // Drop stdin so the subordinate sees EOF and stops waiting for input.
        drop(child.stdin.take());

        let mut out = Vec::new();
        let mut err = Vec::new();
        if let Some(stdout) = child.stdout.as_mut() {
            let _ = stdout.read_to_end(&mut out);
        }
        if let Some(stderr) = child.stderr.as_mut() {
            let _ = stderr.read_to_end(&mut err);
        }

        let status = child
            .wait()
            .map_err(|e| DippError::Ipc(format!("wait on subordinate: {e}")))?;

        match status.code() {
            Some(0) => {
                let identity: BatchIdentity = serde_json::from_slice(&out)
                    .map_err(|e| DippError::Ipc(format!("decode subordinate output: {e}")))?;
                Ok(identity)
            }
            Some(_) => Err(self.map_error_code(&err)),
            // No exit code means the process was killed by a signal: an
            // abnormal termination, not an ordinary nonzero exit.
            None => Err(DippError::ModuleCrash {
                code: MODULE_EXIT_CRASH,
            }),
        }
    }

    fn map_error_code(&self, err: &[u8]) -> DippError {
        if err.is_empty() {
            return DippError::ModuleExit {
                code: MODULE_EXIT_PIPE_READ,
            };
        }
        let raw = match String::from_utf8_lossy(err).trim().parse::<u16>() {
            Ok(v) => v,
            Err(_) => return DippError::ModuleExit { code: MODULE_EXIT_CRASH },
        };
        if raw == MODULE_EXIT_TIMEOUT {
            return DippError::ModuleTimeout;
        }
        let code = if raw < MODULE_DEFINED_CODE_CEILING {
            MODULE_EXIT_CUSTOM + raw
        } else {
            raw
        };
        DippError::ModuleExit { code }
    }
}

/// Entry point the subordinate side of the protocol runs through: read a
/// request from stdin, resolve the entry point via `registry`, run it behind
/// a self-armed timeout watchdog, and write the outcome to stdout/stderr
/// before exiting. Never returns.
pub fn run_subordinate(registry: &dyn ModuleRegistry) -> ! {
    let mut input = Vec::new();
    if std::io::stdin().read_to_end(&mut input).is_err() {
        eprint!("{MODULE_EXIT_CRASH}");
        std::process::exit(1);
    }

    let request: SubordinateRequest = match serde_json::from_slice(&input) {
        Ok(r) => r,
        Err(_) => {
            eprint!("{MODULE_EXIT_CRASH}");
            std::process::exit(1);
        }
    };

    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(request.timeout_ms));
        eprint!("{MODULE_EXIT_TIMEOUT}");
        std::process::exit(1);
    });

    let Some(func) = registry.lookup(&request.entry_point) else {
        eprint!("{MODULE_EXIT_CRASH}");
        std::process::exit(1);
    };

    let batch = crate::model::ImageBatch::new(request.identity);
    match func(&batch, &request.config) {
        ModuleOutcome::Success(result) => {
            let encoded = serde_json::to_vec(&result).unwrap_or_default();
            let _ = std::io::stdout().write_all(&encoded);
            std::process::exit(0);
        }
        ModuleOutcome::Failure(code) => {
            eprint!("{code}");
            std::process::exit(1);
        }
    }
}

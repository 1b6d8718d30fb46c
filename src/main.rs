//! RayOS Dispatch - hello_world demo
//!
//! Brings up the dispatch runtime, loads a kernel, dispatches it once over
//! a 1 MiB device buffer, copies the buffer back and prints it.

use anyhow::{bail, Context, Result};
use bytemuck::{Pod, Zeroable};
use clap::{Parser, ValueEnum};
use log::LevelFilter;
use rayos_dispatch::hal::sim::{KernelInvocation, SimCodeObject, SimPlatform};
use rayos_dispatch::{
    DispatchDescriptor, DispatchRuntime, Platform, RegionClass, RuntimeConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const MEMSIZE: usize = 1024 * 1024;
const INTS_PER_ROW: usize = 16;

#[derive(Parser, Debug)]
#[command(name = "rayos-dispatch")]
#[command(about = "Dispatch a kernel on the accelerator and dump its output", long_about = None)]
struct Cli {
    /// Platform backend
    #[arg(long, value_enum, default_value_t = Backend::Sim)]
    backend: Backend,

    /// Code object to load (the sim backend builds one when omitted)
    #[arg(long)]
    code_object: Option<PathBuf>,

    /// Kernel entry point
    #[arg(long, default_value = "hello_world")]
    entry: String,

    /// TOML runtime configuration
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 64)]
    workgroup: u16,

    #[arg(long, default_value_t = 2048)]
    grid: u32,

    /// Completion timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Rows of 16 ints to print
    #[arg(long, default_value_t = 128)]
    rows: usize,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Backend {
    Sim,
    Hsa,
}

/// Kernel arguments of `hello_world`
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct HelloArgs {
    out: u64,
    len: u64,
}

/// Simulated `hello_world`: work-item `i` writes `i` to `out[i]`
fn hello_world(inv: &KernelInvocation) {
    // SAFETY: the demo always passes a `HelloArgs` kernarg.
    let args: HelloArgs = unsafe { inv.kernargs() };
    let out = args.out as *mut i32;
    for i in 0..inv.work_items().min(args.len) {
        // SAFETY: `out` holds `len` ints and `i < len`.
        unsafe { out.add(i as usize).write(i as i32) };
    }
}

fn platform(backend: Backend) -> Result<Arc<dyn Platform>> {
    match backend {
        Backend::Sim => Ok(Arc::new(
            SimPlatform::builder().kernel("hello_world", hello_world).build(),
        )),
        #[cfg(feature = "hsa")]
        Backend::Hsa => Ok(Arc::new(rayos_dispatch::hal::hsa::HsaPlatform::load()?)),
        #[cfg(not(feature = "hsa"))]
        Backend::Hsa => bail!("built without the `hsa` feature"),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::default(),
    }
    .with_env_overrides()?;

    let rt = DispatchRuntime::initialize(platform(cli.backend)?, config)?;

    let program = match (&cli.code_object, cli.backend) {
        (Some(path), _) => rt.load_program_from_file(path, &cli.entry)?,
        (None, Backend::Sim) => {
            let blob = SimCodeObject::new([cli.entry.as_str()]).to_bytes();
            rt.load_program(&blob, &cli.entry)?
        }
        (None, Backend::Hsa) => bail!("--code-object is required with the hsa backend"),
    };

    let mut kernarg = rt.allocate(RegionClass::Kernarg, MEMSIZE)?;
    let mut cpubuf = rt.allocate(RegionClass::HostVisibleLocal, MEMSIZE)?;
    let gpubuf = rt.allocate(RegionClass::DeviceLocal, MEMSIZE)?;

    kernarg.write_pod(
        0,
        &HelloArgs {
            out: gpubuf.address(),
            len: (MEMSIZE / std::mem::size_of::<i32>()) as u64,
        },
    )?;

    let signal = rt.create_signal()?;
    let desc = DispatchDescriptor::new(program.kernel_object())
        .workgroup(cli.workgroup, 1, 1)
        .grid(cli.grid, 1, 1)
        .kernarg(kernarg.address())
        .completion_signal(&signal);

    let index = rt.dispatch(&desc)?;
    log::info!("Dispatched packet {index}");

    let timeout = Duration::from_secs(cli.timeout);
    if !rt.wait(&signal, timeout) {
        bail!("kernel did not complete within {timeout:?}");
    }

    gpubuf.assign_agent(rt.host().handle)?;
    gpubuf.copy_to(&mut cpubuf)?;

    let ints: Vec<i32> = cpubuf.to_pod_vec()?;
    for row in ints.chunks(INTS_PER_ROW).take(cli.rows) {
        let line: String = row.iter().map(|v| format!("{v:5} ")).collect();
        println!("{line}");
    }

    let stats = rt.stats();
    log::info!(
        "Queue: {} reserved, {} consumed, {} in flight",
        stats.reserved,
        stats.consumed,
        stats.in_flight()
    );
    Ok(())
}

/// Code Loader
///
/// Stages a kernel binary in region memory, turns it into a frozen
/// executable and resolves a kernel entry by name.
///
/// code object -> executable (unfrozen) -> executable (frozen) -> kernel object

use crate::error::{DispatchError, LoadStage, Result};
use crate::hal::agent::Agent;
use crate::hal::allocator::{RegionAllocator, RegionBuffer};
use crate::hal::Runtime;
use crate::types::{AgentHandle, CodeObjectHandle, ExecutableHandle, KernelObject, RegionClass};
use std::marker::PhantomData;
use std::path::Path;

/// Executable still accepting code objects
#[derive(Debug)]
pub struct Unfrozen;

/// Immutable, dispatchable executable
#[derive(Debug)]
pub struct Frozen;

/// A deserialized code object, destroyed on drop
#[derive(Debug)]
pub struct CodeObject {
    handle: CodeObjectHandle,
    runtime: Runtime,
}

impl CodeObject {
    pub fn deserialize(runtime: &Runtime, blob: &[u8]) -> Result<Self> {
        let handle = runtime.platform().deserialize_code_object(blob)?;
        Ok(Self {
            handle,
            runtime: runtime.clone(),
        })
    }

    pub fn handle(&self) -> CodeObjectHandle {
        self.handle
    }
}

impl Drop for CodeObject {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.platform().destroy_code_object(self.handle) {
            log::error!("{e}");
        }
    }
}

#[derive(Debug)]
struct ExecutableInner {
    handle: ExecutableHandle,
    agent: AgentHandle,
    runtime: Runtime,
}

impl Drop for ExecutableInner {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.platform().destroy_executable(self.handle) {
            log::error!("{e}");
        }
    }
}

/// An executable bound to one agent, in state `S`
#[derive(Debug)]
pub struct Executable<S> {
    inner: ExecutableInner,
    _state: PhantomData<S>,
}

impl<S> Executable<S> {
    pub fn handle(&self) -> ExecutableHandle {
        self.inner.handle
    }
}

impl Executable<Unfrozen> {
    /// Create an empty executable for `agent`
    pub fn create(runtime: &Runtime, agent: &Agent) -> Result<Self> {
        let handle = runtime.platform().create_executable()?;
        Ok(Self {
            inner: ExecutableInner {
                handle,
                agent: agent.handle,
                runtime: runtime.clone(),
            },
            _state: PhantomData,
        })
    }

    pub fn load_code_object(&mut self, code_object: &CodeObject) -> Result<()> {
        self.inner
            .runtime
            .platform()
            .load_code_object(self.inner.handle, self.inner.agent, code_object.handle)?;
        Ok(())
    }

    /// Make the executable immutable. On failure it is destroyed.
    pub fn freeze(self) -> Result<Executable<Frozen>> {
        self.inner
            .runtime
            .platform()
            .freeze_executable(self.inner.handle)?;
        Ok(Executable {
            inner: self.inner,
            _state: PhantomData,
        })
    }
}

impl Executable<Frozen> {
    /// Resolve a kernel entry point to the handle a dispatch packet carries
    pub fn kernel_object(&self, name: &str) -> Result<KernelObject> {
        let platform = self.inner.runtime.platform();
        let symbol = platform.get_symbol(self.inner.handle, name, self.inner.agent)?;
        Ok(platform.kernel_object(symbol)?)
    }
}

/// A loaded kernel, ready to dispatch any number of times.
///
/// Owns the staging buffer, the code object and the executable; they are
/// released in reverse order of creation when the program drops.
#[derive(Debug)]
pub struct Program {
    entry: String,
    kernel_object: KernelObject,
    executable: Executable<Frozen>,
    _code_object: CodeObject,
    _staging: RegionBuffer,
}

impl Program {
    pub fn kernel_object(&self) -> KernelObject {
        self.kernel_object
    }

    /// Entry point name the program was loaded for
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Resolve another entry point of the same executable
    pub fn resolve(&self, name: &str) -> Result<KernelObject> {
        self.executable
            .kernel_object(name)
            .map_err(|e| e.at_stage(LoadStage::Resolve))
    }

    pub fn executable(&self) -> &Executable<Frozen> {
        &self.executable
    }
}

fn stage<T>(step: LoadStage, entry: &str, res: Result<T>) -> Result<T> {
    res.map_err(|e| {
        log::error!("Loading kernel '{entry}': {step} failed: {e}");
        e.at_stage(step)
    })
}

/// Load `blob` for `agent` and resolve `entry`.
///
/// The binary is first copied into the agent's SYSTEM region; every later
/// step depends on the previous one and the first failure is returned.
pub fn load(allocator: &RegionAllocator, agent: &Agent, blob: &[u8], entry: &str) -> Result<Program> {
    let runtime = allocator.runtime();
    log::info!("Loading kernel '{entry}' for {} ({} bytes)", agent.name, blob.len());

    let staging = stage(LoadStage::Stage, entry, {
        allocator.allocate(RegionClass::System, blob.len()).and_then(|mut buf| {
            buf.copy_from_slice(0, blob)?;
            Ok(buf)
        })
    })?;

    let code_object = stage(
        LoadStage::Deserialize,
        entry,
        staging
            .as_bytes()
            .and_then(|bytes| CodeObject::deserialize(runtime, bytes)),
    )?;

    let mut executable = stage(LoadStage::Create, entry, Executable::create(runtime, agent))?;
    stage(LoadStage::Load, entry, executable.load_code_object(&code_object))?;
    let executable = stage(LoadStage::Freeze, entry, executable.freeze())?;
    let kernel_object = stage(LoadStage::Resolve, entry, executable.kernel_object(entry))?;

    log::info!("✓ Kernel '{entry}' resolved to {kernel_object}");
    Ok(Program {
        entry: entry.to_string(),
        kernel_object,
        executable,
        _code_object: code_object,
        _staging: staging,
    })
}

/// Read a kernel binary from disk and [`load`] it
pub fn load_from_file(
    allocator: &RegionAllocator,
    agent: &Agent,
    path: impl AsRef<Path>,
    entry: &str,
) -> Result<Program> {
    let path = path.as_ref();
    let blob = stage(
        LoadStage::Stage,
        entry,
        std::fs::read(path).map_err(DispatchError::from),
    )?;
    log::debug!("Read {} bytes from {}", blob.len(), path.display());
    load(allocator, agent, &blob, entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformStatus;
    use crate::hal::agent::discover_agents;
    use crate::hal::sim::{SimCodeObject, SimPlatform};
    use crate::types::SelectionPolicy;
    use std::sync::Arc;

    fn setup(sim: SimPlatform) -> (Arc<SimPlatform>, RegionAllocator, Agent) {
        let sim = Arc::new(sim);
        let rt = Runtime::new(sim.clone()).unwrap();
        let topo = discover_agents(&rt, &SelectionPolicy::Last, &SelectionPolicy::Last).unwrap();
        let alloc = RegionAllocator::new(rt, &topo.accelerator);
        (sim, alloc, topo.accelerator)
    }

    fn blob() -> Vec<u8> {
        SimCodeObject::new(["hello_world", "fill"]).to_bytes()
    }

    fn failed_stage(res: Result<Program>) -> LoadStage {
        match res {
            Err(DispatchError::Load { stage, .. }) => stage,
            other => panic!("expected a load error, got {other:?}"),
        }
    }

    #[test]
    fn load_resolves_entry() {
        let (_sim, alloc, agent) = setup(SimPlatform::builder().build());
        let program = load(&alloc, &agent, &blob(), "hello_world").unwrap();
        assert!(program.kernel_object().is_valid());
        assert_eq!(program.entry(), "hello_world");

        let other = program.resolve("fill").unwrap();
        assert_ne!(other, program.kernel_object());
        assert!(matches!(
            program.resolve("nope"),
            Err(DispatchError::Load { stage: LoadStage::Resolve, .. })
        ));
    }

    #[test]
    fn loading_twice_gives_independent_programs() {
        let (_sim, alloc, agent) = setup(SimPlatform::builder().build());
        let a = load(&alloc, &agent, &blob(), "hello_world").unwrap();
        let b = load(&alloc, &agent, &blob(), "hello_world").unwrap();
        assert_ne!(a.kernel_object(), b.kernel_object());
        assert_ne!(a.executable().handle(), b.executable().handle());
    }

    #[test]
    fn program_drop_releases_staging() {
        let (sim, alloc, agent) = setup(SimPlatform::builder().build());
        let program = load(&alloc, &agent, &blob(), "hello_world").unwrap();
        assert_eq!(alloc.allocated_in(RegionClass::System), blob().len());
        drop(program);
        assert_eq!(alloc.allocation_count(), 0);
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn failures_name_their_stage() {
        let (_sim, alloc, agent) = setup(SimPlatform::builder().build());
        assert_eq!(failed_stage(load(&alloc, &agent, b"not a code object", "k")), LoadStage::Deserialize);
        assert_eq!(failed_stage(load(&alloc, &agent, &[], "k")), LoadStage::Stage);
        assert_eq!(failed_stage(load(&alloc, &agent, &blob(), "missing")), LoadStage::Resolve);

        for (op, expected) in [
            ("create_executable", LoadStage::Create),
            ("load_code_object", LoadStage::Load),
            ("freeze_executable", LoadStage::Freeze),
        ] {
            let (_sim, alloc, agent) = setup(SimPlatform::builder().fail_on(op).build());
            assert_eq!(failed_stage(load(&alloc, &agent, &blob(), "hello_world")), expected, "{op}");
            assert_eq!(alloc.allocation_count(), 0);
        }
    }

    #[test]
    fn staging_needs_system_region() {
        let (_sim, alloc, agent) = setup(SimPlatform::builder().without_region(RegionClass::System).build());
        match load(&alloc, &agent, &blob(), "hello_world") {
            Err(DispatchError::Load { stage: LoadStage::Stage, source }) => {
                assert!(matches!(*source, DispatchError::RegionUnavailable(RegionClass::System)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn resolve_failure_reports_platform_status() {
        let (_sim, alloc, agent) = setup(SimPlatform::builder().build());
        match load(&alloc, &agent, &blob(), "missing") {
            Err(DispatchError::Load { source, .. }) => match *source {
                DispatchError::Platform(e) => assert_eq!(e.status, PlatformStatus::InvalidSymbolName),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_file_fails_at_staging() {
        let (_sim, alloc, agent) = setup(SimPlatform::builder().build());
        let res = load_from_file(&alloc, &agent, "/nonexistent/kernel.co", "hello_world");
        assert_eq!(failed_stage(res), LoadStage::Stage);
    }
}

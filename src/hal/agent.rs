/// Agent discovery
///
/// Enumerates platform agents once, picks the host and the accelerator
/// according to a `SelectionPolicy` and classifies the accelerator's
/// memory regions. The result is an immutable `Topology`.

use super::region::RegionSet;
use super::Runtime;
use crate::error::{DispatchError, Result};
use crate::types::{AgentHandle, AgentInfo, AgentRole, RegionClass, SelectionPolicy};

/// A discovered compute agent
#[derive(Debug, Clone)]
pub struct Agent {
    pub handle: AgentHandle,
    pub role: AgentRole,
    pub name: String,
    /// Classified regions; only populated for the accelerator
    pub regions: RegionSet,
}

impl Agent {
    pub fn region(&self, class: RegionClass) -> Result<crate::types::RegionHandle> {
        self.regions
            .get(class)
            .ok_or(DispatchError::RegionUnavailable(class))
    }
}

/// The host/accelerator pair every downstream component works against
#[derive(Debug, Clone)]
pub struct Topology {
    pub host: Agent,
    pub accelerator: Agent,
}

/// Pick one agent of `role` out of the enumeration
pub fn select_agent<'a>(
    agents: &'a [AgentInfo],
    role: AgentRole,
    policy: &SelectionPolicy,
) -> Option<&'a AgentInfo> {
    let mut candidates = agents
        .iter()
        .filter(|a| AgentRole::of(a.device) == Some(role));
    match policy {
        SelectionPolicy::Last => candidates.last(),
        SelectionPolicy::First => candidates.next(),
        SelectionPolicy::Index(n) => candidates.nth(*n),
        SelectionPolicy::NameContains(needle) => candidates.find(|a| a.name.contains(needle.as_str())),
    }
}

/// Enumerate and select the host and accelerator agents
pub fn discover_agents(
    runtime: &Runtime,
    host_policy: &SelectionPolicy,
    accelerator_policy: &SelectionPolicy,
) -> Result<Topology> {
    let agents = runtime.platform().agents()?;
    log::debug!("Platform reported {} agent(s)", agents.len());

    let host = select_agent(&agents, AgentRole::Host, host_policy);
    let accel = select_agent(&agents, AgentRole::Accelerator, accelerator_policy);

    let host = match host {
        Some(info) => info,
        None => {
            log::error!("No host agent matched {host_policy:?}");
            return Err(DispatchError::AgentNotFound(AgentRole::Host));
        }
    };
    let accel = match accel {
        Some(info) => info,
        None => {
            log::error!("No accelerator agent matched {accelerator_policy:?}");
            return Err(DispatchError::AgentNotFound(AgentRole::Accelerator));
        }
    };

    log::info!("AGENT HOST: {}", host.name);
    log::info!("AGENT ACCELERATOR: {}", accel.name);

    let accelerator = Agent {
        handle: accel.handle,
        role: AgentRole::Accelerator,
        name: accel.name.clone(),
        regions: classify_regions(runtime, accel.handle)?,
    };

    Ok(Topology {
        host: Agent {
            handle: host.handle,
            role: AgentRole::Host,
            name: host.name.clone(),
            regions: RegionSet::default(),
        },
        accelerator,
    })
}

/// Classify an agent's global regions. Missing classes are only logged.
pub fn classify_regions(runtime: &Runtime, agent: AgentHandle) -> Result<RegionSet> {
    let regions = runtime.platform().regions(agent)?;
    let set = RegionSet::from_regions(&regions);

    for (class, handle) in set.iter() {
        match handle {
            Some(h) => log::info!("  region {class:<18}: {h}"),
            None => log::warn!("  region {class:<18}: not available"),
        }
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceType;

    fn info(handle: u64, device: DeviceType, name: &str) -> AgentInfo {
        AgentInfo {
            handle: AgentHandle(handle),
            device,
            name: name.to_string(),
        }
    }

    fn sample() -> Vec<AgentInfo> {
        vec![
            info(1, DeviceType::Cpu, "cpu0"),
            info(2, DeviceType::Gpu, "gfx906"),
            info(3, DeviceType::Other(2), "dsp"),
            info(4, DeviceType::Gpu, "gfx90a"),
            info(5, DeviceType::Cpu, "cpu1"),
        ]
    }

    #[test]
    fn last_wins_by_default() {
        let agents = sample();
        let policy = SelectionPolicy::default();
        assert_eq!(select_agent(&agents, AgentRole::Accelerator, &policy).unwrap().handle, AgentHandle(4));
        assert_eq!(select_agent(&agents, AgentRole::Host, &policy).unwrap().handle, AgentHandle(5));
    }

    #[test]
    fn explicit_policies() {
        let agents = sample();
        let first = select_agent(&agents, AgentRole::Accelerator, &SelectionPolicy::First).unwrap();
        assert_eq!(first.name, "gfx906");

        let second = select_agent(&agents, AgentRole::Accelerator, &SelectionPolicy::Index(1)).unwrap();
        assert_eq!(second.name, "gfx90a");
        assert!(select_agent(&agents, AgentRole::Accelerator, &SelectionPolicy::Index(2)).is_none());

        let named = SelectionPolicy::NameContains("906".into());
        assert_eq!(select_agent(&agents, AgentRole::Accelerator, &named).unwrap().handle, AgentHandle(2));
    }

    #[test]
    fn other_device_types_are_never_selected() {
        let agents = vec![info(3, DeviceType::Other(2), "dsp")];
        assert!(select_agent(&agents, AgentRole::Host, &SelectionPolicy::Last).is_none());
        assert!(select_agent(&agents, AgentRole::Accelerator, &SelectionPolicy::Last).is_none());
    }
}

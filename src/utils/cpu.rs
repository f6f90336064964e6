//! CPU affinity helpers
//!
//! Pinning a collector shard thread to a dedicated core keeps batch assembly
//! latency flat under load. Pinning is opt-in through
//! [`ContextConfig::pin_cpus`](crate::ContextConfig) and silently unsupported
//! off Linux.

use crate::error::Result;

/// Pin the calling thread to the given CPU core
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(cpu: usize) -> Result<()> {
    use nix::sched::{ sched_setaffinity, CpuSet };
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}

/// Pin the calling thread to the given CPU core (no-op on this platform)
#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(_cpu: usize) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_to_current_cpu() {
        // Core 0 exists everywhere this runs; failure would mean the call
        // itself is broken, not the machine.
        assert!(pin_to_cpu(0).is_ok());
    }
}

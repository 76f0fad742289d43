// FILE: src/state.rs

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use serde::Serialize;
use crate::error::{MediaError, Result};

/// What the engine is doing right now. Reported by the health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    Starting,
    Idle,
    Reconciling,
    Evicting,
}

impl SystemState {
    pub fn as_u8(self) -> u8 {
        match self {
            SystemState::Starting => 0,
            SystemState::Idle => 1,
            SystemState::Reconciling => 2,
            SystemState::Evicting => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => SystemState::Idle,
            2 => SystemState::Reconciling,
            3 => SystemState::Evicting,
            _ => SystemState::Starting,
        }
    }
}

/// Runtime flags shared by the API, the reconciler, eviction and the Librarian.
pub struct EngineState {
    system_state: AtomicU8,

    /// Set when the store was found corrupt. Writes other than recovery are
    /// refused until a reconciliation pass completes.
    write_fenced: AtomicBool,

    /// Serializes reconciliation and eviction passes.
    maintenance: Mutex<()>,

    /// When did this engine start?
    pub start_time: SystemTime,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            system_state: AtomicU8::new(SystemState::Starting.as_u8()),
            write_fenced: AtomicBool::new(false),
            maintenance: Mutex::new(()),
            start_time: SystemTime::now(),
        }
    }
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn system_state(&self) -> SystemState {
        SystemState::from_u8(self.system_state.load(Ordering::Relaxed))
    }

    pub fn set_system_state(&self, state: SystemState) {
        self.system_state.store(state.as_u8(), Ordering::Relaxed);
    }

    pub fn is_write_fenced(&self) -> bool {
        self.write_fenced.load(Ordering::SeqCst)
    }

    pub fn fence_writes(&self) {
        if !self.write_fenced.swap(true, Ordering::SeqCst) {
            tracing::error!("[Registry] Writes fenced until the registry is recovered and reconciled");
        }
    }

    pub fn lift_fence(&self) {
        if self.write_fenced.swap(false, Ordering::SeqCst) {
            tracing::info!("[Registry] Write fence lifted");
        }
    }

    /// Refuse a collaborator write while fenced.
    pub fn ensure_writable(&self) -> Result<()> {
        if self.is_write_fenced() {
            return Err(MediaError::StoreCorruption(
                "registry is recovering from corruption; writes are paused".into(),
            ));
        }
        Ok(())
    }

    /// Exclusive maintenance slot; the state returns to Idle when dropped.
    pub fn begin_maintenance(&self, state: SystemState) -> Result<MaintenanceGuard<'_>> {
        let guard = self.maintenance.lock().map_err(|_| MediaError::poisoned())?;
        self.set_system_state(state);
        Ok(MaintenanceGuard { state: self, _guard: guard })
    }
}

pub struct MaintenanceGuard<'a> {
    state: &'a EngineState,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.state.set_system_state(SystemState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_guard_restores_idle() {
        let state = EngineState::new();
        {
            let _guard = state.begin_maintenance(SystemState::Reconciling).unwrap();
            assert_eq!(state.system_state(), SystemState::Reconciling);
        }
        assert_eq!(state.system_state(), SystemState::Idle);
    }

    #[test]
    fn fence_blocks_writes() {
        let state = EngineState::new();
        assert!(state.ensure_writable().is_ok());
        state.fence_writes();
        assert!(matches!(state.ensure_writable(), Err(MediaError::StoreCorruption(_))));
        state.lift_fence();
        assert!(state.ensure_writable().is_ok());
    }
}

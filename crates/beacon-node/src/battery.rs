use std::sync::{Arc, Mutex, PoisonError};

/// Source of the device battery level consulted by the resolution policy.
pub trait BatteryLevelProvider: Send + Sync {
    /// Battery charge in percent, or `None` when unknown.
    fn current_percentage(&self) -> Option<f32>;
}

/// Provider for platforms without battery information.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBatteryLevel;

impl BatteryLevelProvider for NoBatteryLevel {
    fn current_percentage(&self) -> Option<f32> {
        None
    }
}

/// Settable provider shared between its owner and the policy engine.
#[derive(Debug, Default, Clone)]
pub struct SharedBatteryLevel {
    level: Arc<Mutex<Option<f32>>>,
}

impl SharedBatteryLevel {
    pub fn new(level: Option<f32>) -> Self {
        Self {
            level: Arc::new(Mutex::new(level)),
        }
    }

    pub fn set(&self, level: Option<f32>) {
        *self.level.lock().unwrap_or_else(PoisonError::into_inner) = level;
    }
}

impl BatteryLevelProvider for SharedBatteryLevel {
    fn current_percentage(&self) -> Option<f32> {
        *self.level.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Hardware seams used by the boot path

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use super::BootTarget;

/// Input pin and the level that counts as "pressed"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    pub pin: u8,
    pub active_low: bool,
}

impl PinConfig {
    pub const fn active_low(pin: u8) -> Self {
        Self { pin, active_low: true }
    }

    pub fn is_asserted<P: BootPlatform + ?Sized>(&self, platform: &mut P) -> bool {
        platform.read_pin(self.pin) != self.active_low
    }
}

/// Pins, timing and reset as seen from the boot loader. Polled only, no interrupts.
pub trait BootPlatform {
    /// Current level of `pin`, true for high
    fn read_pin(&mut self, pin: u8) -> bool;
    fn delay_ms(&mut self, ms: u32);
    fn feed_watchdog(&mut self);
    /// Hardware reset. Does not return on a real device.
    fn system_reset(&mut self);
}

/// Jump into a validated image with its entry registers set up
pub trait Trampoline {
    fn enter(&mut self, target: &BootTarget) -> !;
}

/// Platform driven by per-pin level scripts, for the simulator and tests.
///
/// Each read pops the next scripted level; the last level sticks. Unscripted pins read high
/// (pulled up).
#[derive(Debug, Default, Clone)]
pub struct ScriptedPlatform {
    levels: HashMap<u8, VecDeque<bool>>,
    pub elapsed_ms: u64,
    pub resets: u32,
    pub watchdog_feeds: u32,
}

impl ScriptedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `pin` at `level` for every read
    pub fn hold(mut self, pin: u8, level: bool) -> Self {
        self.levels.insert(pin, VecDeque::from(vec![level]));
        self
    }

    /// Return these levels in order, then keep the last one
    pub fn script(mut self, pin: u8, levels: &[bool]) -> Self {
        self.levels.insert(pin, levels.iter().copied().collect());
        self
    }
}

impl BootPlatform for ScriptedPlatform {
    fn read_pin(&mut self, pin: u8) -> bool {
        match self.levels.get_mut(&pin) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(true),
            Some(queue) => queue.front().copied().unwrap_or(true),
            None => true,
        }
    }

    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms as u64;
    }

    fn feed_watchdog(&mut self) {
        self.watchdog_feeds += 1;
    }

    fn system_reset(&mut self) {
        self.resets += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unscripted_pin_reads_high() {
        let mut platform = ScriptedPlatform::new();
        assert!(platform.read_pin(3));
        assert!(!PinConfig::active_low(3).is_asserted(&mut platform));
    }

    #[test]
    fn test_script_last_level_sticks() {
        let mut platform = ScriptedPlatform::new().script(14, &[false, false, true]);
        assert!(!platform.read_pin(14));
        assert!(!platform.read_pin(14));
        assert!(platform.read_pin(14));
        assert!(platform.read_pin(14));
    }

    #[test]
    fn test_active_high_pin() {
        let mut platform = ScriptedPlatform::new().hold(5, true);
        let pin = PinConfig { pin: 5, active_low: false };
        assert!(pin.is_asserted(&mut platform));
    }
}

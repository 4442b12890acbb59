//! Software NVIC model: per-IRQ enable/pending/active/priority/ITNS state
//! and priority-based selection, held as an owned per-IRQ array since this
//! NVIC has no physical register file of its own.

use crate::cpu::Security;

#[derive(Debug, Clone, Copy, Default)]
pub struct IrqState {
    pub enabled: bool,
    pub pending: bool,
    pub active: bool,
    pub priority: u8,
    /// `true` routes this IRQ to Non-secure; `false` keeps it Secure.
    pub target_ns: bool,
}

#[derive(Debug, Clone)]
pub struct Nvic {
    irqs: Vec<IrqState>,
}

impl Nvic {
    pub fn new(num_irq: usize) -> Self {
        Nvic {
            irqs: vec![IrqState::default(); num_irq],
        }
    }

    pub fn len(&self) -> usize {
        self.irqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.irqs.is_empty()
    }

    pub fn set_enabled(&mut self, irq: usize, enabled: bool) {
        if let Some(s) = self.irqs.get_mut(irq) {
            s.enabled = enabled;
        }
    }

    pub fn set_pending(&mut self, irq: usize, pending: bool) {
        if let Some(s) = self.irqs.get_mut(irq) {
            s.pending = pending;
        }
    }

    pub fn set_active(&mut self, irq: usize, active: bool) {
        if let Some(s) = self.irqs.get_mut(irq) {
            s.active = active;
        }
    }

    pub fn set_priority(&mut self, irq: usize, priority: u8) {
        if let Some(s) = self.irqs.get_mut(irq) {
            s.priority = priority;
        }
    }

    pub fn set_target_security(&mut self, irq: usize, ns: bool) {
        if let Some(s) = self.irqs.get_mut(irq) {
            s.target_ns = ns;
        }
    }

    pub fn get(&self, irq: usize) -> Option<IrqState> {
        self.irqs.get(irq).copied()
    }

    pub fn target_security(&self, irq: usize) -> Security {
        match self.irqs.get(irq) {
            Some(s) if s.target_ns => Security::NonSecure,
            _ => Security::Secure,
        }
    }

    /// Highest-priority enabled-and-pending, not-yet-active IRQ (lower
    /// numeric priority wins; ties broken by lowest IRQ number). Masking
    /// by PRIMASK/BASEPRI/FAULTMASK is the caller's responsibility (it
    /// depends on the *target* security's exception-mask state).
    pub fn select(&self) -> Option<usize> {
        self.irqs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.enabled && s.pending && !s.active)
            .min_by_key(|(i, s)| (s.priority, *i))
            .map(|(i, _)| i)
    }

    pub fn has_pending(&self) -> bool {
        self.irqs.iter().any(|s| s.enabled && s.pending)
    }

    pub fn clear_all_pending(&mut self) {
        for s in &mut self.irqs {
            s.pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_picks_highest_priority_lowest_number_on_tie() {
        let mut nvic = Nvic::new(8);
        nvic.set_enabled(3, true);
        nvic.set_pending(3, true);
        nvic.set_priority(3, 0x40);
        nvic.set_enabled(5, true);
        nvic.set_pending(5, true);
        nvic.set_priority(5, 0x40);
        assert_eq!(nvic.select(), Some(3));

        nvic.set_priority(5, 0x10);
        assert_eq!(nvic.select(), Some(5));
    }

    #[test]
    fn active_irq_is_not_reselected() {
        let mut nvic = Nvic::new(4);
        nvic.set_enabled(1, true);
        nvic.set_pending(1, true);
        nvic.set_active(1, true);
        assert_eq!(nvic.select(), None);
    }

    #[test]
    fn itns_routes_target_security() {
        let mut nvic = Nvic::new(4);
        nvic.set_target_security(2, true);
        assert_eq!(nvic.target_security(2), Security::NonSecure);
        assert_eq!(nvic.target_security(0), Security::Secure);
    }
}

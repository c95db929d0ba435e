//! Buffer role bookkeeping
//!
//! Physical buffers never move. Solvers address them through roles, and the
//! only way roles change hands is through the swap primitives below, so a
//! kernel can never end up reading and writing the same buffer.

/// Role of one of the three velocity buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VelocitySlot {
    /// The externally visible field between steps
    Current,
    /// The field being built up during a step
    Work,
    /// Scratch target for the next kernel write
    Spare,
}

/// Permutation mapping velocity roles onto three physical buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VelocitySlots {
    // Physical index for Current, Work, Spare in that order
    order: [usize; 3],
}

impl VelocitySlots {
    pub fn new() -> Self {
        Self { order: [0, 1, 2] }
    }

    /// Physical buffer index currently playing `slot`
    pub fn index(&self, slot: VelocitySlot) -> usize {
        match slot {
            VelocitySlot::Current => self.order[0],
            VelocitySlot::Work => self.order[1],
            VelocitySlot::Spare => self.order[2],
        }
    }

    /// Work and Spare exchange buffers after a kernel wrote into Spare
    pub fn swap_work(&mut self) {
        self.order.swap(1, 2);
    }

    /// Spare becomes the new Current; the old Current is recycled as Spare
    pub fn promote_spare(&mut self) {
        self.order.swap(0, 2);
    }
}

impl Default for VelocitySlots {
    fn default() -> Self {
        Self::new()
    }
}

/// Two-slot ping-pong used for the pressure relaxation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingPong {
    flipped: bool,
}

impl PingPong {
    pub fn new() -> Self {
        Self { flipped: false }
    }

    /// Buffer holding the latest estimate
    pub fn front(&self) -> usize {
        usize::from(self.flipped)
    }

    /// Buffer the next sweep writes into
    pub fn back(&self) -> usize {
        usize::from(!self.flipped)
    }

    pub fn swap(&mut self) {
        self.flipped = !self.flipped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distinct(slots: &VelocitySlots) -> bool {
        let c = slots.index(VelocitySlot::Current);
        let w = slots.index(VelocitySlot::Work);
        let s = slots.index(VelocitySlot::Spare);
        c != w && w != s && c != s
    }

    #[test]
    fn test_velocity_roles_stay_a_permutation() {
        let mut slots = VelocitySlots::new();
        for i in 0..10 {
            if i % 3 == 0 {
                slots.promote_spare();
            } else {
                slots.swap_work();
            }
            assert!(distinct(&slots));
        }
    }

    #[test]
    fn test_promote_spare_rotates_current() {
        let mut slots = VelocitySlots::new();
        let spare = slots.index(VelocitySlot::Spare);
        let current = slots.index(VelocitySlot::Current);
        slots.promote_spare();
        assert_eq!(slots.index(VelocitySlot::Current), spare);
        assert_eq!(slots.index(VelocitySlot::Spare), current);
    }

    #[test]
    fn test_ping_pong() {
        let mut pp = PingPong::new();
        assert_eq!((pp.front(), pp.back()), (0, 1));
        pp.swap();
        assert_eq!((pp.front(), pp.back()), (1, 0));
        pp.swap();
        assert_eq!((pp.front(), pp.back()), (0, 1));
    }
}

//! Storage for one solver's grid fields
//!
//! [`GridBuffers`] owns three velocity buffers, two pressure buffers and one
//! divergence buffer, all of the same [`GridSize`]. The storage type is a
//! parameter: host [`Field`](super::Field)s for the CPU solver, `wgpu`
//! buffers or textures for the GPU solvers. Releasing consumes the value, so
//! each buffer is freed exactly once.

use super::slots::{PingPong, VelocitySlot, VelocitySlots};
use super::GridSize;
use crate::error::Result;

pub struct GridBuffers<V, S> {
    size: GridSize,
    velocity: [V; 3],
    pressure: [S; 2],
    divergence: S,
    velocity_slots: VelocitySlots,
    pressure_slots: PingPong,
}

impl<V, S> GridBuffers<V, S> {
    /// Allocate every field through the backend's constructors
    ///
    /// The first allocation error aborts construction; buffers created before
    /// it are dropped with the partially built set.
    pub fn allocate(
        size: GridSize,
        mut make_vector: impl FnMut(&str) -> Result<V>,
        mut make_scalar: impl FnMut(&str) -> Result<S>,
    ) -> Result<Self> {
        let velocity = [
            make_vector("velocity 0")?,
            make_vector("velocity 1")?,
            make_vector("velocity 2")?,
        ];
        let pressure = [make_scalar("pressure 0")?, make_scalar("pressure 1")?];
        let divergence = make_scalar("divergence")?;

        Ok(Self {
            size,
            velocity,
            pressure,
            divergence,
            velocity_slots: VelocitySlots::new(),
            pressure_slots: PingPong::new(),
        })
    }

    pub fn size(&self) -> GridSize {
        self.size
    }

    pub fn velocity(&self, slot: VelocitySlot) -> &V {
        &self.velocity[self.velocity_slots.index(slot)]
    }

    pub fn velocity_mut(&mut self, slot: VelocitySlot) -> &mut V {
        &mut self.velocity[self.velocity_slots.index(slot)]
    }

    /// Physical index of the buffer playing `slot`
    pub fn velocity_index(&self, slot: VelocitySlot) -> usize {
        self.velocity_slots.index(slot)
    }

    /// Latest pressure estimate
    pub fn pressure_front(&self) -> &S {
        &self.pressure[self.pressure_slots.front()]
    }

    pub fn pressure_front_mut(&mut self) -> &mut S {
        &mut self.pressure[self.pressure_slots.front()]
    }

    /// Pressure buffer the next sweep writes into
    pub fn pressure_back(&self) -> &S {
        &self.pressure[self.pressure_slots.back()]
    }

    pub fn divergence(&self) -> &S {
        &self.divergence
    }

    pub fn swap_work(&mut self) {
        self.velocity_slots.swap_work();
    }

    pub fn promote_spare(&mut self) {
        self.velocity_slots.promote_spare();
    }

    pub fn swap_pressure(&mut self) {
        self.pressure_slots.swap();
    }

    /// Free every buffer through the backend's destructors
    pub fn release(self, mut free_vector: impl FnMut(V), mut free_scalar: impl FnMut(S)) {
        let [v0, v1, v2] = self.velocity;
        free_vector(v0);
        free_vector(v1);
        free_vector(v2);
        let [p0, p1] = self.pressure;
        free_scalar(p0);
        free_scalar(p1);
        free_scalar(self.divergence);
    }
}

impl<V: Default, S: Default> GridBuffers<V, S> {
    /// Write a velocity slot while reading the others
    ///
    /// The target is moved out for the duration of `write`, so the closure
    /// only ever sees the remaining slots through `&Self`.
    pub fn write_velocity<R>(
        &mut self,
        target: VelocitySlot,
        write: impl FnOnce(&Self, &mut V) -> R,
    ) -> R {
        let index = self.velocity_slots.index(target);
        let mut out = std::mem::take(&mut self.velocity[index]);
        let result = write(self, &mut out);
        self.velocity[index] = out;
        result
    }

    /// Write the back pressure buffer while reading the front one
    pub fn write_pressure_back<R>(&mut self, write: impl FnOnce(&Self, &mut S) -> R) -> R {
        let index = self.pressure_slots.back();
        let mut out = std::mem::take(&mut self.pressure[index]);
        let result = write(self, &mut out);
        self.pressure[index] = out;
        result
    }

    /// Write the divergence and the front pressure buffer together
    pub fn write_divergence_and_pressure<R>(
        &mut self,
        write: impl FnOnce(&Self, &mut S, &mut S) -> R,
    ) -> R {
        let index = self.pressure_slots.front();
        let mut divergence = std::mem::take(&mut self.divergence);
        let mut pressure = std::mem::take(&mut self.pressure[index]);
        let result = write(self, &mut divergence, &mut pressure);
        self.divergence = divergence;
        self.pressure[index] = pressure;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FluidError;

    fn labelled(size: GridSize) -> GridBuffers<String, String> {
        GridBuffers::allocate(size, |l| Ok(l.to_string()), |l| Ok(l.to_string())).unwrap()
    }

    #[test]
    fn test_allocation_creates_all_buffers() {
        let size = GridSize::new(8, 8).unwrap();
        let mut made = Vec::new();
        let buffers = GridBuffers::allocate(
            size,
            |l| {
                made.push(l.to_string());
                Ok(())
            },
            |_| Ok(()),
        )
        .unwrap();
        assert_eq!(made, ["velocity 0", "velocity 1", "velocity 2"]);
        assert_eq!(buffers.size(), size);
    }

    #[test]
    fn test_allocation_failure_propagates() {
        let size = GridSize::new(8, 8).unwrap();
        let result: Result<GridBuffers<(), ()>> = GridBuffers::allocate(
            size,
            |_| Ok(()),
            |l| {
                if l == "divergence" {
                    Err(FluidError::allocation(l, "out of memory"))
                } else {
                    Ok(())
                }
            },
        );
        assert!(matches!(result, Err(FluidError::Allocation { .. })));
    }

    #[test]
    fn test_release_frees_each_buffer_once() {
        let buffers = labelled(GridSize::new(4, 4).unwrap());
        let mut freed = Vec::new();
        let mut freed_scalars = Vec::new();
        buffers.release(|v| freed.push(v), |s| freed_scalars.push(s));
        assert_eq!(freed.len(), 3);
        assert_eq!(freed_scalars, ["pressure 0", "pressure 1", "divergence"]);
    }

    #[test]
    fn test_write_velocity_hides_target() {
        let mut buffers = labelled(GridSize::new(4, 4).unwrap());
        buffers.write_velocity(VelocitySlot::Spare, |grid, out| {
            // The target is absent while it is being written
            assert_eq!(grid.velocity(VelocitySlot::Spare), "");
            *out = format!("from {}", grid.velocity(VelocitySlot::Work));
        });
        assert_eq!(buffers.velocity(VelocitySlot::Spare), "from velocity 1");
    }
}

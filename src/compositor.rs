//! Dye compositing on the CPU
//!
//! A [`DyeField`] is an RGBA image carried along by a velocity field. Its
//! resolution is independent of the simulation grid: lookups go through
//! normalized coordinates, and the backtrace is scaled by the dye's aspect
//! ratio so one velocity unit is one dye-image height.

use crate::error::Result;
use crate::grid::{Field, GridSize, VectorField};
use cgmath::{InnerSpace, Vector2};

pub type Rgba = [f32; 4];

/// Amplitude multiplier before a splat saturates to the pure dye colour
const SPLAT_SHARPNESS: f32 = 100.0;

/// Phase rates of the default cycling dye colour
const DYE_CYCLE: [f32; 3] = [2.72, 5.12, 4.98];

/// A colour that cycles smoothly with `time`, each channel in `[0, 1]`
pub fn cycling_dye(time: f32) -> Rgba {
    let channel = |rate: f32| ((time * rate).sin() + 0.5).clamp(0.0, 1.0);
    [
        channel(DYE_CYCLE[0]),
        channel(DYE_CYCLE[1]),
        channel(DYE_CYCLE[2]),
        1.0,
    ]
}

fn lerp(a: Rgba, b: Rgba, t: f32) -> Rgba {
    std::array::from_fn(|i| a[i] + (b[i] - a[i]) * t)
}

pub struct DyeField {
    color: Field<Rgba>,
    scratch: Field<Rgba>,
}

impl DyeField {
    /// Allocate a transparent dye image
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let size = GridSize::new(width, height)?;
        Ok(Self {
            color: Field::zeros(size)?,
            scratch: Field::zeros(size)?,
        })
    }

    /// Wrap an existing image
    pub fn from_field(color: Field<Rgba>) -> Result<Self> {
        let scratch = Field::zeros(color.size())?;
        Ok(Self { color, scratch })
    }

    pub fn size(&self) -> GridSize {
        self.color.size()
    }

    pub fn color(&self) -> &Field<Rgba> {
        &self.color
    }

    /// Normalized `[0, 1]` coordinates of a texel centre
    fn texel_uv(size: GridSize, x: usize, y: usize) -> Vector2<f32> {
        Vector2::new(
            (x as f32 + 0.5) / size.width as f32,
            (y as f32 + 0.5) / size.height as f32,
        )
    }

    fn sample(field: &Field<Rgba>, uv: Vector2<f32>) -> Rgba {
        let size = field.size();
        let texel = size.clamp_position(Vector2::new(
            uv.x * size.width as f32 - 0.5,
            uv.y * size.height as f32 - 0.5,
        ));
        let (x, y) = (texel.x, texel.y);
        let (x0, y0) = (x.floor(), y.floor());
        let (sx, sy) = (x - x0, y - y0);
        let (x0, y0) = (x0 as i64, y0 as i64);

        let bottom = lerp(field.get_clamped(x0, y0), field.get_clamped(x0 + 1, y0), sx);
        let top = lerp(field.get_clamped(x0, y0 + 1), field.get_clamped(x0 + 1, y0 + 1), sx);
        lerp(bottom, top, sy)
    }

    /// Carry the dye one time step along `velocity`
    ///
    /// The velocity field should be the one just produced by the solver; it is
    /// sampled bilinearly at each dye texel.
    pub fn advect(&mut self, velocity: &VectorField, delta_time: f32) {
        let size = self.size();
        let aspect_inv = size.height as f32 / size.width as f32;
        let grid = velocity.size();
        let color = &self.color;

        self.scratch.fill_with(|x, y| {
            let uv = Self::texel_uv(size, x, y);
            let cell = Vector2::new(
                uv.x * grid.width as f32 - 0.5,
                uv.y * grid.height as f32 - 0.5,
            );
            let v = velocity.sample_bilinear(cell);
            let delta = Vector2::new(v.x * aspect_inv, v.y) * delta_time;
            Self::sample(color, uv - delta)
        });
        std::mem::swap(&mut self.color, &mut self.scratch);
    }

    /// Blend a colour splat centred on `origin`
    ///
    /// `origin` uses the same grid-normalized coordinates as force origins.
    pub fn inject(&mut self, origin: Vector2<f32>, dye: Rgba, exponent: f32) {
        let size = self.size();
        let color = &self.color;
        self.scratch.fill_with(|x, y| {
            let distance2 = (size.cell_position(x, y) - origin).magnitude2();
            let weight = ((-exponent * distance2).exp() * SPLAT_SHARPNESS).min(1.0);
            lerp(color.get(x, y), dye, weight)
        });
        std::mem::swap(&mut self.color, &mut self.scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba = [1.0, 0.0, 0.0, 1.0];

    #[test]
    fn test_uniform_velocity_shifts_dye_one_texel() {
        let size = GridSize::new(32, 16).unwrap();
        let stripe = Field::from_fn(size, |x, _| if x == 5 { RED } else { [0.0; 4] }).unwrap();
        let mut dye = DyeField::from_field(stripe).unwrap();

        // One height unit per second for 1/16 s is one texel of a 32-wide image
        let velocity = Field::from_fn(GridSize::new(16, 16).unwrap(), |_, _| [1.0, 0.0]).unwrap();
        dye.advect(&velocity, 1.0 / 16.0);

        for y in 0..16 {
            assert_eq!(dye.color().get(6, y), RED);
            assert_eq!(dye.color().get(5, y), [0.0; 4]);
        }
    }

    #[test]
    fn test_zero_velocity_keeps_dye() {
        let size = GridSize::new(16, 8).unwrap();
        let image = Field::from_fn(size, |x, y| [x as f32, y as f32, 0.5, 1.0]).unwrap();
        let mut dye = DyeField::from_field(image.clone()).unwrap();
        let velocity = Field::zeros(GridSize::new(8, 8).unwrap()).unwrap();
        dye.advect(&velocity, 0.1);
        assert_eq!(dye.color(), &image);
    }

    #[test]
    fn test_extreme_velocity_reads_edge_colour() {
        let size = GridSize::new(8, 8).unwrap();
        let image = Field::from_fn(size, |x, _| [x as f32 / 7.0, 0.0, 0.0, 1.0]).unwrap();
        let mut dye = DyeField::from_field(image).unwrap();
        let velocity = Field::from_fn(size, |_, _| [-1.0e20, 0.0]).unwrap();
        dye.advect(&velocity, 1.0 / 60.0);

        // Every texel traces back past the right edge
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(dye.color().get(x, y), [1.0, 0.0, 0.0, 1.0]);
            }
        }
    }

    #[test]
    fn test_inject_is_local() {
        let mut dye = DyeField::new(32, 32).unwrap();
        dye.inject(Vector2::new(0.0, 0.0), RED, 200.0);
        assert_eq!(dye.color().get(16, 16), RED);
        assert!(dye.color().get(0, 0).iter().all(|c| *c < 1e-6));
    }

    #[test]
    fn test_cycling_dye_is_in_range() {
        for step in 0..100 {
            let dye = cycling_dye(step as f32 * 0.37);
            assert!(dye.iter().all(|c| (0.0..=1.0).contains(c)));
        }
    }
}

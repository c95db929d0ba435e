//! Grid dimensions and host-side fields
//!
//! Every field of a solver shares one [`GridSize`]. Host fields are stored
//! row-major with `x` varying fastest, the same layout the GPU backends use for
//! their storage buffers so uploads and readbacks are plain byte copies.

pub mod buffers;
pub mod slots;

pub use buffers::GridBuffers;
pub use slots::{PingPong, VelocitySlot, VelocitySlots};

use crate::error::{FluidError, Result};
use cgmath::Vector2;
use rayon::prelude::*;

/// Cells below this count are processed on the calling thread.
const PARALLEL_THRESHOLD: usize = 64 * 64;

fn should_parallel(len: usize) -> bool {
    len >= PARALLEL_THRESHOLD && rayon::current_num_threads() > 1
}

/// Width and height of a simulation grid, in cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GridSize {
    pub width: u32,
    pub height: u32,
}

impl GridSize {
    /// Create a grid size, rejecting empty grids
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(FluidError::InvalidGridSize { width, height });
        }
        Ok(Self { width, height })
    }

    /// Create a grid size rounded up to a multiple of `granularity` in each dimension
    pub fn aligned(width: u32, height: u32, granularity: u32) -> Result<Self> {
        Self::new(width, height)?.align_to(granularity)
    }

    /// Derive the grid from a target surface and a simulation scale
    ///
    /// The scaled size is rounded to the nearest cell, kept at least one cell,
    /// then aligned to `granularity`.
    pub fn from_surface(
        surface_width: u32,
        surface_height: u32,
        scale: f32,
        granularity: u32,
    ) -> Result<Self> {
        if surface_width == 0 || surface_height == 0 {
            return Err(FluidError::InvalidGridSize {
                width: surface_width,
                height: surface_height,
            });
        }
        let width = (surface_width as f32 * scale).round().max(1.0) as u32;
        let height = (surface_height as f32 * scale).round().max(1.0) as u32;
        Self::aligned(width, height, granularity)
    }

    /// Round both dimensions up to a multiple of `granularity`
    ///
    /// Fails when a rounded dimension no longer fits in a `u32`.
    pub fn align_to(self, granularity: u32) -> Result<Self> {
        let granularity = granularity.max(1);
        let round = |dimension: u32| {
            dimension
                .div_ceil(granularity)
                .checked_mul(granularity)
                .ok_or_else(|| {
                    FluidError::allocation(
                        format!("{self} grid aligned to {granularity}"),
                        "dimension overflows u32",
                    )
                })
        };
        Ok(Self {
            width: round(self.width)?,
            height: round(self.height)?,
        })
    }

    /// Bytes taken by `bytes_per_cell` bytes for every cell
    pub fn byte_len(&self, bytes_per_cell: u64) -> Result<u64> {
        (self.width as u64 * self.height as u64)
            .checked_mul(bytes_per_cell)
            .ok_or_else(|| {
                FluidError::allocation(format!("{self} grid"), "byte size overflows u64")
            })
    }

    /// Bytes in one row of `bytes_per_cell` values, padded up to `alignment`
    pub fn padded_row_bytes(&self, bytes_per_cell: u32, alignment: u32) -> Result<u32> {
        let alignment = alignment.max(1);
        self.width
            .checked_mul(bytes_per_cell)
            .and_then(|bytes| bytes.div_ceil(alignment).checked_mul(alignment))
            .ok_or_else(|| {
                FluidError::allocation(format!("{self} grid row"), "row size overflows u32")
            })
    }

    /// Number of cells
    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grid spacing, normalized to the vertical resolution
    pub fn dx(&self) -> f32 {
        1.0 / self.height as f32
    }

    /// Row-major index of an in-range cell
    pub fn index(&self, x: usize, y: usize) -> usize {
        y * self.width as usize + x
    }

    /// Clamp a possibly out-of-range cell coordinate onto the grid
    pub fn clamp(&self, x: i64, y: i64) -> (usize, usize) {
        let cx = x.clamp(0, self.width as i64 - 1) as usize;
        let cy = y.clamp(0, self.height as i64 - 1) as usize;
        (cx, cy)
    }

    /// Clamp a cell-space position to one cell beyond each edge
    ///
    /// Keeps the integer footprint of a bilinear lookup small enough that its
    /// `+1` neighbour cannot overflow. NaN passes through and samples cell 0.
    pub fn clamp_position(&self, position: Vector2<f32>) -> Vector2<f32> {
        Vector2::new(
            position.x.clamp(-1.0, self.width as f32),
            position.y.clamp(-1.0, self.height as f32),
        )
    }

    /// Centre of a cell in grid-normalized coordinates
    ///
    /// The origin sits at the grid centre and one unit equals the grid height,
    /// matching the coordinate space of force origins.
    pub fn cell_position(&self, x: usize, y: usize) -> Vector2<f32> {
        let h = self.height as f32;
        Vector2::new(
            (x as f32 + 0.5 - self.width as f32 * 0.5) / h,
            (y as f32 + 0.5 - h * 0.5) / h,
        )
    }
}

impl std::fmt::Display for GridSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A dense 2D field over a grid
///
/// The default value is an empty 0x0 placeholder, used while a field is moved
/// out of its slot to be written.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Field<T> {
    size: GridSize,
    data: Vec<T>,
}

/// Two components per cell: `(u, v)`
pub type VectorField = Field<[f32; 2]>;

/// One component per cell
pub type ScalarField = Field<f32>;

impl<T: Copy + Default + Send + Sync> Field<T> {
    /// Allocate a zero-filled field, reporting allocation failure instead of aborting
    pub fn zeros(size: GridSize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size.len()).map_err(|err| {
            FluidError::allocation(format!("{} field of {} cells", size, size.len()), err)
        })?;
        data.resize(size.len(), T::default());
        Ok(Self { size, data })
    }

    /// Wrap existing data, which must hold exactly one value per cell
    pub fn from_data(size: GridSize, data: Vec<T>) -> Result<Self> {
        if data.len() != size.len() {
            return Err(FluidError::FieldLength {
                expected: size.len(),
                actual: data.len(),
            });
        }
        Ok(Self { size, data })
    }

    /// Build a field by evaluating `f` at every cell
    pub fn from_fn(size: GridSize, f: impl Fn(usize, usize) -> T + Sync) -> Result<Self> {
        let mut field = Self::zeros(size)?;
        field.fill_with(f);
        Ok(field)
    }

    pub fn size(&self) -> GridSize {
        self.size
    }

    pub fn get(&self, x: usize, y: usize) -> T {
        self.data[self.size.index(x, y)]
    }

    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let index = self.size.index(x, y);
        self.data[index] = value;
    }

    /// Read a cell, clamping out-of-range coordinates to the nearest edge cell
    pub fn get_clamped(&self, x: i64, y: i64) -> T {
        let (cx, cy) = self.size.clamp(x, y);
        self.get(cx, cy)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Set every cell to `value`
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Copy another field of the same size into this one
    pub fn copy_from(&mut self, other: &Field<T>) {
        self.data.copy_from_slice(&other.data);
    }

    /// Overwrite every cell with `f(x, y)`, in parallel for large grids
    pub fn fill_with(&mut self, f: impl Fn(usize, usize) -> T + Sync) {
        let width = self.size.width as usize;
        if should_parallel(self.data.len()) {
            self.data
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| {
                    for (x, value) in row.iter_mut().enumerate() {
                        *value = f(x, y);
                    }
                });
        } else {
            for (y, row) in self.data.chunks_mut(width).enumerate() {
                for (x, value) in row.iter_mut().enumerate() {
                    *value = f(x, y);
                }
            }
        }
    }

    /// Ensure this field matches `size`
    pub fn check_size(&self, size: GridSize) -> Result<()> {
        if self.size == size {
            Ok(())
        } else {
            Err(FluidError::FieldSizeMismatch {
                width: size.width,
                height: size.height,
                actual_width: self.size.width,
                actual_height: self.size.height,
            })
        }
    }
}

impl VectorField {
    /// Bilinearly sample the field at a cell-space position
    ///
    /// Cell `(x, y)` has its centre at `(x, y)`. Both the integer footprint and
    /// its `+1` neighbours are clamped to the grid, reproducing a clamp-to-edge
    /// bilinear texture fetch. Positions any distance off the grid, infinite
    /// ones included, read the edge value.
    pub fn sample_bilinear(&self, position: Vector2<f32>) -> Vector2<f32> {
        let position = self.size.clamp_position(position);
        let x0 = position.x.floor();
        let y0 = position.y.floor();
        let sx = position.x - x0;
        let sy = position.y - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let v00 = Vector2::from(self.get_clamped(x0, y0));
        let v10 = Vector2::from(self.get_clamped(x0 + 1, y0));
        let v01 = Vector2::from(self.get_clamped(x0, y0 + 1));
        let v11 = Vector2::from(self.get_clamped(x0 + 1, y0 + 1));

        let bottom = v00 + (v10 - v00) * sx;
        let top = v01 + (v11 - v01) * sx;
        bottom + (top - bottom) * sy
    }

    /// Velocity at a cell as a vector
    pub fn vector(&self, x: usize, y: usize) -> Vector2<f32> {
        Vector2::from(self.get(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_alignment() {
        let size = GridSize::aligned(61, 33, 8).unwrap();
        assert_eq!(size, GridSize { width: 64, height: 40 });

        let exact = GridSize::aligned(64, 64, 8).unwrap();
        assert_eq!(exact, GridSize { width: 64, height: 64 });

        assert!(GridSize::new(0, 4).is_err());
    }

    #[test]
    fn test_alignment_overflow_is_an_error() {
        assert!(matches!(
            GridSize::aligned(u32::MAX, 8, 8),
            Err(FluidError::Allocation { .. })
        ));
        assert!(GridSize::aligned(8, u32::MAX - 2, 4).is_err());
        // Already aligned dimensions never round past themselves
        let size = GridSize::aligned(u32::MAX, 1, 1).unwrap();
        assert_eq!(size.width, u32::MAX);
    }

    #[test]
    fn test_byte_sizes_are_checked() {
        let size = GridSize::new(13, 5).unwrap();
        assert_eq!(size.byte_len(8).unwrap(), 13 * 5 * 8);
        assert_eq!(size.padded_row_bytes(8, 256).unwrap(), 256);
        assert_eq!(size.padded_row_bytes(4, 1).unwrap(), 52);

        let huge = GridSize::new(u32::MAX, u32::MAX).unwrap();
        assert!(huge.byte_len(8).is_err());
        assert!(huge.padded_row_bytes(8, 256).is_err());
    }

    #[test]
    fn test_grid_from_surface() {
        // Half-scale 1280x720 surface snapped to the compute granularity
        let size = GridSize::from_surface(1280, 720, 0.5, 8).unwrap();
        assert_eq!(size, GridSize { width: 640, height: 360 });

        let odd = GridSize::from_surface(101, 51, 0.5, 8).unwrap();
        assert_eq!(odd, GridSize { width: 56, height: 32 });

        let tiny = GridSize::from_surface(1, 1, 0.1, 1).unwrap();
        assert_eq!(tiny, GridSize { width: 1, height: 1 });
    }

    #[test]
    fn test_clamp_never_wraps() {
        let size = GridSize::new(16, 8).unwrap();
        assert_eq!(size.clamp(-1, -5), (0, 0));
        assert_eq!(size.clamp(16, 11), (15, 7));
        assert_eq!(size.clamp(3, 4), (3, 4));
    }

    #[test]
    fn test_cell_position_is_centered() {
        let size = GridSize::new(4, 2).unwrap();
        let left = size.cell_position(0, 0);
        assert!((left.x + 0.75).abs() < 1e-6);
        assert!((left.y + 0.25).abs() < 1e-6);
        let right = size.cell_position(3, 1);
        assert!((right.x - 0.75).abs() < 1e-6);
        assert!((right.y - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_bilinear_sampling_clamps_at_edges() {
        let size = GridSize::new(4, 4).unwrap();
        let field = VectorField::from_fn(size, |x, _| [x as f32, 0.0]).unwrap();

        let mid = field.sample_bilinear(Vector2::new(1.5, 2.0));
        assert!((mid.x - 1.5).abs() < 1e-6);

        // Far outside the grid the edge value is held, not wrapped
        let left = field.sample_bilinear(Vector2::new(-10.0, 1.0));
        assert_eq!(left.x, 0.0);
        let right = field.sample_bilinear(Vector2::new(10.0, 1.0));
        assert_eq!(right.x, 3.0);

        // Positions past the range of i64 still land on the edge
        let far = field.sample_bilinear(Vector2::new(1.0e20, -1.0e20));
        assert_eq!(far.x, 3.0);
        let infinite = field.sample_bilinear(Vector2::new(f32::NEG_INFINITY, f32::INFINITY));
        assert_eq!(infinite.x, 0.0);
    }

    #[test]
    fn test_from_data_rejects_wrong_length() {
        let size = GridSize::new(4, 4).unwrap();
        assert!(ScalarField::from_data(size, vec![0.0; 15]).is_err());
        assert!(ScalarField::from_data(size, vec![0.0; 16]).is_ok());
    }

    #[test]
    fn test_parallel_fill_matches_layout() {
        let size = GridSize::new(128, 96).unwrap();
        let field = ScalarField::from_fn(size, |x, y| (y * 1000 + x) as f32).unwrap();
        assert_eq!(field.get(5, 7), 7005.0);
        assert_eq!(field.as_slice()[size.index(127, 95)], 95127.0);
    }
}

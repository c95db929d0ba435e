//! Per-cell solver stages for the CPU backend
//!
//! Each kernel reads its inputs and writes one *different* output field of the
//! same size. Neighbour lookups clamp to the nearest edge cell. The WGSL
//! kernels of the GPU backends implement the same formulas.

use crate::grid::{ScalarField, VectorField};
use cgmath::{InnerSpace, Vector2};

/// Sum of the four clamped neighbours of a vector cell
fn vector_neighbours(field: &VectorField, x: i64, y: i64) -> Vector2<f32> {
    Vector2::from(field.get_clamped(x - 1, y))
        + Vector2::from(field.get_clamped(x + 1, y))
        + Vector2::from(field.get_clamped(x, y - 1))
        + Vector2::from(field.get_clamped(x, y + 1))
}

fn scalar_neighbours(field: &ScalarField, x: i64, y: i64) -> f32 {
    field.get_clamped(x - 1, y)
        + field.get_clamped(x + 1, y)
        + field.get_clamped(x, y - 1)
        + field.get_clamped(x, y + 1)
}

/// Semi-Lagrangian self-advection: `out(c) = U(c - U(c) * dt / dx)`
pub fn advect(u: &VectorField, delta_time: f32, dx: f32, out: &mut VectorField) {
    let scale = delta_time / dx;
    out.fill_with(|x, y| {
        let position = Vector2::new(x as f32, y as f32);
        let back = position - u.vector(x, y) * scale;
        u.sample_bilinear(back).into()
    });
}

/// One Jacobi sweep on a vector field: `(sum of neighbours + alpha * b) / beta`
pub fn jacobi_vector(x_in: &VectorField, b: &VectorField, alpha: f32, beta: f32, out: &mut VectorField) {
    out.fill_with(|x, y| {
        let sum = vector_neighbours(x_in, x as i64, y as i64);
        ((sum + b.vector(x, y) * alpha) / beta).into()
    });
}

/// Add a Gaussian point impulse centred on `origin`
pub fn apply_point_force(
    w: &VectorField,
    origin: Vector2<f32>,
    force: Vector2<f32>,
    exponent: f32,
    out: &mut VectorField,
) {
    let size = w.size();
    out.fill_with(|x, y| {
        let distance2 = (size.cell_position(x, y) - origin).magnitude2();
        let amplitude = (-exponent * distance2).exp();
        (w.vector(x, y) + force * amplitude).into()
    });
}

/// Add a per-cell force field
pub fn apply_force_field(w: &VectorField, force: &VectorField, out: &mut VectorField) {
    out.fill_with(|x, y| (w.vector(x, y) + force.vector(x, y)).into());
}

fn divergence_at(w: &VectorField, x: i64, y: i64, inv_2dx: f32) -> f32 {
    let right = w.get_clamped(x + 1, y)[0];
    let left = w.get_clamped(x - 1, y)[0];
    let up = w.get_clamped(x, y + 1)[1];
    let down = w.get_clamped(x, y - 1)[1];
    (right - left + up - down) * inv_2dx
}

/// Divergence by central differences, and a zeroed pressure seed
pub fn projection_setup(
    w: &VectorField,
    dx: f32,
    divergence: &mut ScalarField,
    pressure: &mut ScalarField,
) {
    let inv_2dx = 0.5 / dx;
    divergence.fill_with(|x, y| divergence_at(w, x as i64, y as i64, inv_2dx));
    pressure.fill(0.0);
}

/// One Jacobi sweep on a scalar field
pub fn jacobi_scalar(x_in: &ScalarField, b: &ScalarField, alpha: f32, beta: f32, out: &mut ScalarField) {
    out.fill_with(|x, y| {
        let sum = scalar_neighbours(x_in, x as i64, y as i64);
        (sum + alpha * b.get(x, y)) / beta
    });
}

/// Subtract the pressure gradient: `out = W - grad(P)`
pub fn projection_finish(w: &VectorField, p: &ScalarField, dx: f32, out: &mut VectorField) {
    let inv_2dx = 0.5 / dx;
    out.fill_with(|x, y| {
        let (xi, yi) = (x as i64, y as i64);
        let gradient = Vector2::new(
            p.get_clamped(xi + 1, yi) - p.get_clamped(xi - 1, yi),
            p.get_clamped(xi, yi + 1) - p.get_clamped(xi, yi - 1),
        ) * inv_2dx;
        (w.vector(x, y) - gradient).into()
    });
}

/// L2 norm of the discrete divergence, using the projection's stencil
pub fn divergence_norm(w: &VectorField, dx: f32) -> f32 {
    let size = w.size();
    let inv_2dx = 0.5 / dx;
    let mut sum = 0.0f64;
    for y in 0..size.height as i64 {
        for x in 0..size.width as i64 {
            let d = divergence_at(w, x, y, inv_2dx) as f64;
            sum += d * d;
        }
    }
    sum.sqrt() as f32
}

/// Sum of squared velocity magnitudes
pub fn kinetic_energy(w: &VectorField) -> f32 {
    w.as_slice()
        .iter()
        .map(|v| (v[0] as f64) * (v[0] as f64) + (v[1] as f64) * (v[1] as f64))
        .sum::<f64>() as f32
}

/// Residual `||beta * X - sum(neighbours of X) - alpha * B||` of a scalar Jacobi system
pub fn jacobi_scalar_residual(x_in: &ScalarField, b: &ScalarField, alpha: f32, beta: f32) -> f32 {
    let size = x_in.size();
    let mut sum = 0.0f64;
    for y in 0..size.height as usize {
        for x in 0..size.width as usize {
            let r = beta * x_in.get(x, y)
                - scalar_neighbours(x_in, x as i64, y as i64)
                - alpha * b.get(x, y);
            sum += (r as f64) * (r as f64);
        }
    }
    sum.sqrt() as f32
}

/// Residual of a vector Jacobi system, summed over both components
pub fn jacobi_vector_residual(x_in: &VectorField, b: &VectorField, alpha: f32, beta: f32) -> f32 {
    let size = x_in.size();
    let mut sum = 0.0f64;
    for y in 0..size.height as usize {
        for x in 0..size.width as usize {
            let r = x_in.vector(x, y) * beta
                - vector_neighbours(x_in, x as i64, y as i64)
                - b.vector(x, y) * alpha;
            sum += r.magnitude2() as f64;
        }
    }
    sum.sqrt() as f32
}

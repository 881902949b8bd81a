//! Geometric models: immutable triangle meshes plus precomputed sparse
//! viewpoint templates, shared read-only across all bodies of one object
//! type.

pub mod body;
pub mod mesh;

pub use body::{Body, BodyStatus, ModalityToggles};

use std::sync::Arc;

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, TrackError};

/// Sparse template for one view direction: surface points and normals of the
/// geometry visible from that direction, in the body frame.
#[derive(Debug, Clone)]
pub struct ViewTemplate {
    /// Unit direction from the body origin toward the viewer, body frame.
    pub direction: Vector3<f64>,
    pub points: Vec<Vector3<f64>>,
    pub normals: Vec<Vector3<f64>>,
}

/// Immutable mesh + precomputed template set.
#[derive(Debug)]
pub struct GeometricModel {
    name: String,
    vertices: Vec<Vector3<f64>>,
    triangles: Vec<[u32; 3]>,
    /// Per-triangle outward unit normals.
    normals: Vec<Vector3<f64>>,
    templates: Vec<ViewTemplate>,
    /// Bounding-sphere radius around the body origin, meters.
    radius: f64,
}

impl GeometricModel {
    /// Build a model from mesh data supplied by an external loader.
    ///
    /// `scale` converts the mesh units to meters (e.g. `0.001` for
    /// millimeter models). Fails with `ModelNotLoaded` when the mesh is
    /// empty or indices are out of range.
    pub fn from_mesh(
        name: &str,
        vertices: &[Vector3<f64>],
        triangles: &[[u32; 3]],
        scale: f64,
    ) -> Result<Arc<Self>> {
        if vertices.is_empty() || triangles.is_empty() || scale <= 0.0 {
            return Err(TrackError::ModelNotLoaded {
                body: name.to_string(),
            });
        }
        for tri in triangles {
            if tri.iter().any(|&i| i as usize >= vertices.len()) {
                return Err(TrackError::ModelNotLoaded {
                    body: name.to_string(),
                });
            }
        }

        let vertices: Vec<Vector3<f64>> = vertices.iter().map(|v| v * scale).collect();
        let normals = triangles
            .iter()
            .map(|&[a, b, c]| {
                let (a, b, c) = (
                    vertices[a as usize],
                    vertices[b as usize],
                    vertices[c as usize],
                );
                let n = (b - a).cross(&(c - a));
                let len = n.norm();
                if len > 1e-12 { n / len } else { Vector3::z() }
            })
            .collect();
        let radius = vertices.iter().map(|v| v.norm()).fold(0.0, f64::max);

        let mut model = Self {
            name: name.to_string(),
            vertices,
            triangles: triangles.to_vec(),
            normals,
            templates: Vec::new(),
            radius,
        };
        model.generate_templates(TEMPLATE_SURFACE_SAMPLES);
        Ok(Arc::new(model))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> &[Vector3<f64>] {
        &self.vertices
    }

    pub fn triangles(&self) -> &[[u32; 3]] {
        &self.triangles
    }

    pub fn triangle_normals(&self) -> &[Vector3<f64>] {
        &self.normals
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn templates(&self) -> &[ViewTemplate] {
        &self.templates
    }

    /// Index of the template whose view direction is closest to `view_dir`
    /// (unit vector, body frame).
    pub fn closest_template(&self, view_dir: &Vector3<f64>) -> usize {
        let mut best = 0;
        let mut best_dot = f64::NEG_INFINITY;
        for (i, t) in self.templates.iter().enumerate() {
            let dot = t.direction.dot(view_dir);
            if dot > best_dot {
                best_dot = dot;
                best = i;
            }
        }
        best
    }

    /// Precompute one template per quasi-uniform view direction. Sampling is
    /// seeded per direction so regeneration is deterministic.
    fn generate_templates(&mut self, samples_per_view: usize) {
        let directions = mesh::icosphere_directions();
        self.templates = directions
            .iter()
            .enumerate()
            .map(|(i, dir)| self.sample_view(dir, samples_per_view, i as u64))
            .collect();
    }

    fn sample_view(&self, dir: &Vector3<f64>, samples: usize, seed: u64) -> ViewTemplate {
        // Front-facing triangles only, area-weighted.
        let mut cumulative = Vec::new();
        let mut total_area = 0.0;
        for (tri_idx, &[a, b, c]) in self.triangles.iter().enumerate() {
            if self.normals[tri_idx].dot(dir) <= 0.0 {
                continue;
            }
            let (a, b, c) = (
                self.vertices[a as usize],
                self.vertices[b as usize],
                self.vertices[c as usize],
            );
            let area = 0.5 * (b - a).cross(&(c - a)).norm();
            if area > 0.0 {
                total_area += area;
                cumulative.push((total_area, tri_idx));
            }
        }

        let mut points = Vec::with_capacity(samples);
        let mut normals = Vec::with_capacity(samples);
        if total_area > 0.0 {
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..samples {
                let target = rng.gen_range(0.0..total_area);
                let slot = cumulative
                    .partition_point(|&(acc, _)| acc < target)
                    .min(cumulative.len() - 1);
                let tri_idx = cumulative[slot].1;
                let [a, b, c] = self.triangles[tri_idx];
                let (a, b, c) = (
                    self.vertices[a as usize],
                    self.vertices[b as usize],
                    self.vertices[c as usize],
                );
                // Uniform barycentric sample.
                let r1: f64 = rng.gen();
                let r2: f64 = rng.gen();
                let s = r1.sqrt();
                let (u, v) = (1.0 - s, r2 * s);
                points.push(a * u + b * v + c * (1.0 - u - v));
                normals.push(self.normals[tri_idx]);
            }
        }

        ViewTemplate {
            direction: *dir,
            points,
            normals,
        }
    }
}

/// Surface samples stored per view template.
const TEMPLATE_SURFACE_SAMPLES: usize = 200;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mesh::cuboid;

    #[test]
    fn empty_mesh_is_rejected() {
        let err = GeometricModel::from_mesh("box", &[], &[], 1.0).unwrap_err();
        assert_eq!(
            err,
            TrackError::ModelNotLoaded {
                body: "box".to_string()
            }
        );
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let verts = vec![Vector3::zeros(), Vector3::x(), Vector3::y()];
        let tris = vec![[0u32, 1, 9]];

        assert!(GeometricModel::from_mesh("box", &verts, &tris, 1.0).is_err());
    }

    #[test]
    fn scale_converts_units_to_meters() {
        let (verts, tris) = cuboid(100.0, 60.0, 40.0);
        let model = GeometricModel::from_mesh("box", &verts, &tris, 0.001).unwrap();

        // 100 mm edge -> vertices at +-0.05 m.
        let max = model
            .vertices()
            .iter()
            .map(|v| v.x.abs())
            .fold(0.0, f64::max);
        assert!((max - 0.05).abs() < 1e-12);
    }

    #[test]
    fn templates_cover_all_view_directions() {
        let (verts, tris) = cuboid(0.1, 0.1, 0.1);
        let model = GeometricModel::from_mesh("box", &verts, &tris, 1.0).unwrap();

        assert_eq!(model.templates().len(), 42);
        assert!(model.templates().iter().all(|t| !t.points.is_empty()));
    }

    #[test]
    fn template_points_face_the_viewer() {
        let (verts, tris) = cuboid(0.1, 0.1, 0.1);
        let model = GeometricModel::from_mesh("box", &verts, &tris, 1.0).unwrap();

        for t in model.templates() {
            for n in &t.normals {
                assert!(n.dot(&t.direction) > 0.0);
            }
        }
    }

    #[test]
    fn closest_template_picks_aligned_direction() {
        let (verts, tris) = cuboid(0.1, 0.1, 0.1);
        let model = GeometricModel::from_mesh("box", &verts, &tris, 1.0).unwrap();

        let idx = model.closest_template(&Vector3::z());
        let dir = model.templates()[idx].direction;
        assert!(dir.dot(&Vector3::z()) > 0.85);
    }
}

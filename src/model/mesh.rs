//! Mesh helpers: quasi-uniform view directions and synthetic primitives
//! for tests and smoke drivers.

use std::collections::HashMap;

use nalgebra::Vector3;

/// Icosahedron vertex/face tables (t = golden ratio).
#[rustfmt::skip]
fn icosahedron() -> (Vec<Vector3<f64>>, Vec<[usize; 3]>) {
    let t = (1.0 + 5.0_f64.sqrt()) / 2.0;
    let verts = vec![
        Vector3::new(-1.0,  t,  0.0), Vector3::new( 1.0,  t,  0.0),
        Vector3::new(-1.0, -t,  0.0), Vector3::new( 1.0, -t,  0.0),
        Vector3::new( 0.0, -1.0,  t), Vector3::new( 0.0,  1.0,  t),
        Vector3::new( 0.0, -1.0, -t), Vector3::new( 0.0,  1.0, -t),
        Vector3::new( t,  0.0, -1.0), Vector3::new( t,  0.0,  1.0),
        Vector3::new(-t,  0.0, -1.0), Vector3::new(-t,  0.0,  1.0),
    ];
    let faces = vec![
        [0, 11, 5], [0, 5, 1], [0, 1, 7], [0, 7, 10], [0, 10, 11],
        [1, 5, 9], [5, 11, 4], [11, 10, 2], [10, 7, 6], [7, 1, 8],
        [3, 9, 4], [3, 4, 2], [3, 2, 6], [3, 6, 8], [3, 8, 9],
        [4, 9, 5], [2, 4, 11], [6, 2, 10], [8, 6, 7], [9, 8, 1],
    ];
    (verts, faces)
}

/// 42 quasi-uniform unit directions: icosahedron vertices plus the
/// normalized midpoint of each of its 30 edges.
pub fn icosphere_directions() -> Vec<Vector3<f64>> {
    let (verts, faces) = icosahedron();
    let mut directions: Vec<Vector3<f64>> = verts.iter().map(|v| v.normalize()).collect();

    let mut seen: HashMap<(usize, usize), ()> = HashMap::new();
    for face in &faces {
        for k in 0..3 {
            let (a, b) = (face[k], face[(k + 1) % 3]);
            let key = (a.min(b), a.max(b));
            if seen.insert(key, ()).is_none() {
                directions.push((verts[a] + verts[b]).normalize());
            }
        }
    }
    directions
}

/// Axis-aligned box centered at the origin with the given edge lengths,
/// triangulated with outward-facing winding.
#[rustfmt::skip]
pub fn cuboid(dx: f64, dy: f64, dz: f64) -> (Vec<Vector3<f64>>, Vec<[u32; 3]>) {
    let (hx, hy, hz) = (dx / 2.0, dy / 2.0, dz / 2.0);
    let vertices = vec![
        Vector3::new(-hx, -hy, -hz), Vector3::new( hx, -hy, -hz),
        Vector3::new( hx,  hy, -hz), Vector3::new(-hx,  hy, -hz),
        Vector3::new(-hx, -hy,  hz), Vector3::new( hx, -hy,  hz),
        Vector3::new( hx,  hy,  hz), Vector3::new(-hx,  hy,  hz),
    ];
    let triangles = vec![
        [0, 2, 1], [0, 3, 2], // -z
        [4, 5, 6], [4, 6, 7], // +z
        [0, 1, 5], [0, 5, 4], // -y
        [3, 7, 6], [3, 6, 2], // +y
        [0, 4, 7], [0, 7, 3], // -x
        [1, 2, 6], [1, 6, 5], // +x
    ];
    (vertices, triangles)
}

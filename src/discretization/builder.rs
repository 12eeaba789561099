//! Construction helpers for 1-D device meshes.
//!
//! Device cross-sections are extruded implicitly: a coordinate list
//! along x plus a contact area yields node control volumes and edge
//! couplings. Multi-dimensional meshes arrive through the same arena
//! layout from the external geometry kernel; the builders here cover
//! what the tests and demos need.

use glam::DVec3;

use crate::discretization::mesh::{
    AdvancedModel, Edge, FvmNode, NodeData, Region, RegionKind,
};
use crate::physics::material::Material;

/// Uniformly spaced coordinates over [x0, x1], inclusive.
pub fn uniform_line(x0: f64, x1: f64, n: usize) -> Vec<f64> {
    assert!(n >= 2, "a line mesh needs at least two nodes");
    let h = (x1 - x0) / (n - 1) as f64;
    (0..n).map(|i| x0 + h * i as f64).collect()
}

/// Coordinates refined geometrically toward an interior point.
///
/// Spacing starts at `h_min` on both sides of `x_mid` and grows by
/// `ratio` per interval until the domain ends are reached.
pub fn graded_line(x0: f64, x_mid: f64, x1: f64, h_min: f64, ratio: f64) -> Vec<f64> {
    assert!(x0 < x_mid && x_mid < x1);
    assert!(ratio >= 1.0);

    // the 0.25h guard keeps the closing interval from degenerating
    let mut left = vec![x_mid];
    let mut h = h_min;
    let mut x = x_mid;
    while x - h > x0 + 0.25 * h {
        x -= h;
        left.push(x);
        h *= ratio;
    }
    left.push(x0);
    left.reverse();

    let mut h = h_min;
    let mut x = x_mid;
    let mut coords = left;
    while x + h < x1 - 0.25 * h {
        x += h;
        coords.push(x);
        h *= ratio;
    }
    coords.push(x1);
    coords
}

/// Build the FVM node arena and neighbour table for a line of nodes.
///
/// Node volumes are the half-interval sums times `area`; the edge
/// coupling is area over spacing, so flux kernels see area/length
/// directly.
pub fn line_arena(coords: &[f64], area: f64) -> (Vec<FvmNode>, Vec<Edge>) {
    assert!(coords.len() >= 2);
    let n = coords.len();

    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        let left = if i == 0 { 0.0 } else { (coords[i] - coords[i - 1]) / 2.0 };
        let right = if i + 1 == n { 0.0 } else { (coords[i + 1] - coords[i]) / 2.0 };
        nodes.push(FvmNode {
            volume: (left + right) * area,
            position: DVec3::new(coords[i], 0.0, 0.0),
        });
    }

    let edges = (0..n - 1)
        .map(|i| Edge {
            nodes: (i, i + 1),
            coupling: area / (coords[i + 1] - coords[i]),
        })
        .collect();

    (nodes, edges)
}

/// A 1-D semiconductor region with a position-dependent doping
/// profile (donor positive, acceptor negative).
pub fn semiconductor_bar(
    name: impl Into<String>,
    coords: &[f64],
    area: f64,
    material: Material,
    advanced: AdvancedModel,
    doping: impl Fn(f64) -> f64,
    t_ambient: f64,
) -> Region {
    let (nodes, edges) = line_arena(coords, area);
    let data = nodes
        .iter()
        .map(|node| NodeData::new(doping(node.position.x), t_ambient))
        .collect();
    Region {
        name: name.into(),
        kind: RegionKind::Semiconductor,
        material,
        advanced,
        nodes,
        data,
        edges,
        hanging: Vec::new(),
    }
}

/// A 1-D insulator or metal region.
pub fn conductor_bar(
    name: impl Into<String>,
    kind: RegionKind,
    coords: &[f64],
    area: f64,
    material: Material,
    advanced: AdvancedModel,
    t_ambient: f64,
) -> Region {
    assert!(matches!(kind, RegionKind::Insulator | RegionKind::Metal));
    let (nodes, edges) = line_arena(coords, area);
    let data = nodes.iter().map(|_| NodeData::new(0.0, t_ambient)).collect();
    Region {
        name: name.into(),
        kind,
        material,
        advanced,
        nodes,
        data,
        edges,
        hanging: Vec::new(),
    }
}

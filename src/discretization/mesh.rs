use glam::DVec3;

use crate::physics::material::Material;

/// Variable kinds addressable at an FVM node.
///
/// `ElecTemp` and `HoleTemp` rows store the energy-balance products
/// w_n = n·Tn and w_p = p·Tp, not the temperatures themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variable {
    Potential,
    Electron,
    Hole,
    LatticeTemp,
    ElecTemp,
    HoleTemp,
}

impl Variable {
    pub fn name(&self) -> &'static str {
        match self {
            Variable::Potential => "psi",
            Variable::Electron => "n",
            Variable::Hole => "p",
            Variable::LatticeTemp => "T",
            Variable::ElecTemp => "n*Tn",
            Variable::HoleTemp => "p*Tp",
        }
    }
}

/// Region classification. The set is closed; dispatch over it is a
/// match, not a vtable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Semiconductor,
    Insulator,
    Metal,
    Vacuum,
}

/// Per-region switches for the extended transport models.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdvancedModel {
    pub enable_tl: bool,
    pub enable_tn: bool,
    pub enable_tp: bool,
}

/// A finite-volume node: control-volume anchor at a mesh vertex.
/// Nodes live in the region's arena; neighbour links are arena indices.
#[derive(Clone, Debug)]
pub struct FvmNode {
    pub volume: f64,
    pub position: DVec3,
}

/// Control-volume interface between two nodes of the same region.
/// `coupling` is the face area divided by the node distance.
#[derive(Clone, Debug)]
pub struct Edge {
    pub nodes: (usize, usize),
    pub coupling: f64,
}

/// Interpolation constraint at a non-conforming refinement face: the
/// hanging node's variables are tied to a weighted combination of its
/// parent nodes.
#[derive(Clone, Debug)]
pub struct HangingNode {
    pub node: usize,
    pub parents: Vec<(usize, f64)>,
}

/// Solution and time-history data attached to an FVM node.
///
/// `*_last` / `*_last_last` hold the two previous accepted time steps;
/// they feed the BDF storage terms and the BDF2 positivity test.
#[derive(Clone, Debug)]
pub struct NodeData {
    pub doping: f64,

    pub psi: f64,
    pub n: f64,
    pub p: f64,
    pub t: f64,
    pub tn: f64,
    pub tp: f64,

    pub n_last: f64,
    pub p_last: f64,
    pub t_last: f64,
    pub tn_last: f64,
    pub tp_last: f64,

    pub n_last_last: f64,
    pub p_last_last: f64,
    pub t_last_last: f64,
    pub tn_last_last: f64,
    pub tp_last_last: f64,
}

impl NodeData {
    pub fn new(doping: f64, t_ambient: f64) -> Self {
        Self {
            doping,
            psi: 0.0,
            n: 0.0,
            p: 0.0,
            t: t_ambient,
            tn: t_ambient,
            tp: t_ambient,
            n_last: 0.0,
            p_last: 0.0,
            t_last: t_ambient,
            tn_last: t_ambient,
            tp_last: t_ambient,
            n_last_last: 0.0,
            p_last_last: 0.0,
            t_last_last: t_ambient,
            tn_last_last: t_ambient,
            tp_last_last: t_ambient,
        }
    }

    /// Shift the history window by one accepted step.
    pub fn rotate_history(&mut self) {
        self.n_last_last = self.n_last;
        self.p_last_last = self.p_last;
        self.t_last_last = self.t_last;
        self.tn_last_last = self.tn_last;
        self.tp_last_last = self.tp_last;

        self.n_last = self.n;
        self.p_last = self.p;
        self.t_last = self.t;
        self.tn_last = self.tn;
        self.tp_last = self.tp;
    }
}

/// A mesh partition region: node arena, neighbour table, node data and
/// the material tables that parameterise the governing equations.
pub struct Region {
    pub name: String,
    pub kind: RegionKind,
    pub material: Material,
    pub advanced: AdvancedModel,
    pub nodes: Vec<FvmNode>,
    pub data: Vec<NodeData>,
    pub edges: Vec<Edge>,
    pub hanging: Vec<HangingNode>,
}

impl Region {
    /// Number of unknowns carried by every node of this region.
    pub fn n_variables(&self) -> usize {
        match self.kind {
            RegionKind::Semiconductor => {
                3 + self.advanced.enable_tl as usize
                    + self.advanced.enable_tn as usize
                    + self.advanced.enable_tp as usize
            }
            RegionKind::Insulator | RegionKind::Metal => 1 + self.advanced.enable_tl as usize,
            RegionKind::Vacuum => 0,
        }
    }

    /// Offset of a variable inside a node's block, in the declared
    /// order psi, n, p, Tl, w_n, w_p. `None` when the kind is disabled
    /// for this region.
    pub fn variable_offset(&self, var: Variable) -> Option<usize> {
        let adv = &self.advanced;
        match self.kind {
            RegionKind::Semiconductor => match var {
                Variable::Potential => Some(0),
                Variable::Electron => Some(1),
                Variable::Hole => Some(2),
                Variable::LatticeTemp => adv.enable_tl.then_some(3),
                Variable::ElecTemp => adv.enable_tn.then_some(3 + adv.enable_tl as usize),
                Variable::HoleTemp => adv
                    .enable_tp
                    .then_some(3 + adv.enable_tl as usize + adv.enable_tn as usize),
            },
            RegionKind::Insulator | RegionKind::Metal => match var {
                Variable::Potential => Some(0),
                Variable::LatticeTemp => adv.enable_tl.then_some(1),
                _ => None,
            },
            RegionKind::Vacuum => None,
        }
    }

    /// On-processor node range. With the serial communicator every
    /// arena node is owned by this rank.
    pub fn on_processor_nodes(&self) -> std::ops::Range<usize> {
        0..self.nodes.len()
    }
}

/// The device: every region plus the ambient temperature of the
/// surrounding environment.
pub struct Mesh {
    pub regions: Vec<Region>,
    pub t_external: f64,
}

impl Mesh {
    pub fn n_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn region(&self, r: usize) -> &Region {
        &self.regions[r]
    }

    pub fn region_mut(&mut self, r: usize) -> &mut Region {
        &mut self.regions[r]
    }
}

/*
Copyright 2017 Takashi Ogura

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/
//! ABI of the generated, per-robot analytical kernel.
//!
//! A kernel is a pair of plain functions: the inverse map from a packed pose
//! to joint-space branches, and the forward map used by tests and tooling.
//! Everything here is pure; the shell treats a kernel invocation as a black
//! box that either produces raw solutions or refuses.

use std::{any::Any, fmt, panic, sync::Arc};

use nalgebra as na;

use crate::{IkParameterization, IkReal};

/// Inverse-kinematics entry point of a generated kernel.
///
/// `eetrans`/`eerot` are the packed pose arrays (either may be absent
/// depending on the parameterization flavor), `free` holds one value per
/// kernel free joint. Returns `false` when the pose is out of reach of the
/// analytical branches.
pub type IkFn<T> =
    fn(eetrans: Option<&[T; 3]>, eerot: Option<&[T; 9]>, free: &[T], solutions: &mut Vec<KernelSolution<T>>) -> bool;

/// Forward-kinematics entry point of a generated kernel.
pub type FkFn<T> = fn(joints: &[T], eetrans: &mut [T; 3], eerot: &mut [T; 9]);

/// One joint slot of a raw kernel solution.
///
/// The value of the slot is `offset + mul * free[free_index]`; slots fully
/// determined by the kernel have no `free_index`. `max_solutions`/`branch`
/// describe which analytical branch produced this slot, which user filters
/// inspect through the solution-index vector.
#[derive(Debug, Clone)]
pub struct SolutionComponent<T> {
    pub offset: T,
    pub mul: T,
    /// Index into the free-value array handed to [`KernelSolution::solution`].
    pub free_index: Option<usize>,
    /// Branch multiplicity at this slot, if the kernel tracked it.
    pub max_solutions: Option<u8>,
    /// Up to two branch indices chosen by the kernel at this slot.
    pub branch: [Option<u8>; 2],
}

impl<T: IkReal> SolutionComponent<T> {
    /// A slot fully determined by the kernel, single-branch.
    pub fn determined(offset: T) -> Self {
        Self {
            offset,
            mul: T::zero(),
            free_index: None,
            max_solutions: None,
            branch: [None, None],
        }
    }

    /// A slot depending linearly on one free value.
    pub fn free(offset: T, mul: T, free_index: usize) -> Self {
        Self {
            offset,
            mul,
            free_index: Some(free_index),
            max_solutions: None,
            branch: [None, None],
        }
    }

    /// Annotates the slot with its branch choice.
    pub fn with_branch(mut self, max_solutions: u8, index: u8) -> Self {
        self.max_solutions = Some(max_solutions);
        self.branch = [Some(index), None];
        self
    }
}

/// A raw solution emitted by the kernel: one component per arm joint plus the
/// arm slots of the free joints the kernel left unspecified.
#[derive(Debug, Clone)]
pub struct KernelSolution<T> {
    components: Vec<SolutionComponent<T>>,
    free: Vec<usize>,
}

impl<T: IkReal> KernelSolution<T> {
    pub fn new(components: Vec<SolutionComponent<T>>, free: Vec<usize>) -> Self {
        Self { components, free }
    }

    /// Arm slots of the joints the kernel left free in this solution.
    pub fn free(&self) -> &[usize] {
        &self.free
    }

    pub fn dof(&self) -> usize {
        self.components.len()
    }

    /// Internal consistency: free references in bounds, branch indices below
    /// their multiplicity.
    pub fn validate(&self) -> bool {
        self.components.iter().all(|c| {
            let free_ok = match c.free_index {
                Some(i) => i < self.free.len(),
                None => true,
            };
            let branch_ok = match c.max_solutions {
                Some(m) => c
                    .branch
                    .iter()
                    .flatten()
                    .all(|&b| b < m),
                None => c.branch.iter().all(Option::is_none),
            };
            free_ok && branch_ok
        })
    }

    /// Materializes the joint values, substituting `free` (one value per entry
    /// of [`Self::free`], in order) into the underdetermined slots.
    pub fn solution(&self, free: &[T], out: &mut [T]) {
        debug_assert_eq!(out.len(), self.components.len());
        for (o, c) in out.iter_mut().zip(&self.components) {
            *o = match c.free_index {
                Some(i) => c.offset + c.mul * free[i],
                None => c.offset,
            };
        }
    }

    /// Identifiers of the analytical branch combination behind this solution.
    ///
    /// Starts from a single zero index and, walking the slots from the last to
    /// the first, scales by each slot's multiplicity and mixes in the chosen
    /// branch; a slot carrying a second branch index forks the vector.
    pub fn solution_indices(&self) -> Vec<u32> {
        let mut v = vec![0u32];
        for c in self.components.iter().rev() {
            let m = match c.max_solutions {
                Some(m) if m > 1 => u32::from(m),
                _ => continue,
            };
            for x in &mut v {
                *x *= m;
            }
            let orig = v.len();
            if let Some(b1) = c.branch[1] {
                for j in 0..orig {
                    v.push(v[j] + u32::from(b1));
                }
            }
            if let Some(b0) = c.branch[0] {
                for x in v.iter_mut().take(orig) {
                    *x += u32::from(b0);
                }
            }
        }
        v
    }
}

/// Function-pointer bundle for one generated kernel, plus an optional handle
/// to whatever owns the generated code (keeps a dynamically loaded library
/// alive for as long as the solver exists).
#[derive(Clone)]
pub struct IkKernel<T: IkReal> {
    ik: IkFn<T>,
    fk: FkFn<T>,
    resource: Option<Arc<dyn Any + Send + Sync>>,
}

impl<T: IkReal> fmt::Debug for IkKernel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IkKernel")
            .field("has_resource", &self.resource.is_some())
            .finish()
    }
}

impl<T: IkReal> IkKernel<T> {
    pub fn new(ik: IkFn<T>, fk: FkFn<T>) -> Self {
        Self {
            ik,
            fk,
            resource: None,
        }
    }

    /// Ties the lifetime of `resource` to this kernel.
    pub fn with_resource(mut self, resource: Arc<dyn Any + Send + Sync>) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Forward kinematics of the generated chain.
    pub fn forward_kinematics(&self, joints: &[T]) -> ([T; 3], [T; 9]) {
        let mut eetrans = [T::zero(); 3];
        let mut eerot = [T::zero(); 9];
        (self.fk)(joints, &mut eetrans, &mut eerot);
        (eetrans, eerot)
    }

    /// Packs `param` into the kernel's scalar arrays and invokes it.
    ///
    /// `None` covers both a kernel that refuses the pose and a kernel that
    /// panicked; neither aborts the enclosing solve, they turn into a
    /// kinematics rejection upstream.
    pub(crate) fn call(&self, param: &IkParameterization<T>, free: &[T]) -> Option<Vec<KernelSolution<T>>> {
        let (eetrans, eerot) = pack_parameterization(param);
        let ik = self.ik;
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let mut solutions = Vec::new();
            let ok = ik(eetrans.as_ref(), eerot.as_ref(), free, &mut solutions);
            (ok, solutions)
        }));
        match result {
            Ok((true, solutions)) => Some(solutions),
            Ok((false, _)) => None,
            Err(_) => {
                tracing::warn!("ik kernel call failed for {:?}", param.kind());
                None
            }
        }
    }
}

/// Builds the fixed-size scalar arrays for one pose flavor.
fn pack_parameterization<T: IkReal>(param: &IkParameterization<T>) -> (Option<[T; 3]>, Option<[T; 9]>) {
    match param {
        IkParameterization::Transform6D(iso) => {
            (Some(vec3(&iso.translation.vector)), Some(rot9(&iso.rotation)))
        }
        IkParameterization::Rotation3D(rot) => (None, Some(rot9(rot))),
        IkParameterization::Translation3D(t) => (Some(vec3(t)), None),
        IkParameterization::Direction3D(dir) => (None, Some(dir9(dir))),
        IkParameterization::Ray4D { origin, dir }
        | IkParameterization::TranslationDirection5D { origin, dir } => {
            (Some(vec3(origin)), Some(dir9(dir)))
        }
        IkParameterization::Lookat3D(t) => (Some(vec3(t)), None),
        IkParameterization::TranslationXY2D(xy) => {
            (Some([xy.x, xy.y, T::zero()]), None)
        }
        IkParameterization::TranslationXYOrientation3D { xy, angle } => {
            (Some([xy.x, xy.y, *angle]), None)
        }
        IkParameterization::TranslationLocalGlobal6D { local, global } => {
            let mut eerot = [T::zero(); 9];
            eerot[0] = local.x;
            eerot[4] = local.y;
            eerot[8] = local.z;
            (Some(vec3(global)), Some(eerot))
        }
        IkParameterization::TranslationXAxisAngle4D { origin, angle }
        | IkParameterization::TranslationYAxisAngle4D { origin, angle }
        | IkParameterization::TranslationZAxisAngle4D { origin, angle }
        | IkParameterization::TranslationXAxisAngleZNorm4D { origin, angle }
        | IkParameterization::TranslationYAxisAngleXNorm4D { origin, angle }
        | IkParameterization::TranslationZAxisAngleYNorm4D { origin, angle } => {
            let mut eerot = [T::zero(); 9];
            eerot[0] = *angle;
            (Some(vec3(origin)), Some(eerot))
        }
    }
}

fn vec3<T: IkReal>(v: &na::Vector3<T>) -> [T; 3] {
    [v.x, v.y, v.z]
}

/// Rotation matrix in the row-major layout generated kernels expect.
fn rot9<T: IkReal>(rot: &na::UnitQuaternion<T>) -> [T; 9] {
    let m = rot.to_rotation_matrix();
    let m = m.matrix();
    [
        m[(0, 0)],
        m[(0, 1)],
        m[(0, 2)],
        m[(1, 0)],
        m[(1, 1)],
        m[(1, 2)],
        m[(2, 0)],
        m[(2, 1)],
        m[(2, 2)],
    ]
}

/// A direction occupies the first three rotation slots, the rest stay zero.
fn dir9<T: IkReal>(dir: &na::Unit<na::Vector3<T>>) -> [T; 9] {
    let mut eerot = [T::zero(); 9];
    eerot[0] = dir.x;
    eerot[1] = dir.y;
    eerot[2] = dir.z;
    eerot
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use na::{Unit, Vector3};

    use super::*;

    #[test]
    fn solution_materializes_free_slots() {
        let sol = KernelSolution::new(
            vec![
                SolutionComponent::free(1.0f64, -1.0, 0),
                SolutionComponent::determined(0.25),
                SolutionComponent::free(0.0, 1.0, 0),
            ],
            vec![2],
        );
        assert!(sol.validate());
        let mut out = [0.0; 3];
        sol.solution(&[0.3], &mut out);
        assert_eq!(out, [0.7, 0.25, 0.3]);
    }

    #[test]
    fn validate_rejects_out_of_range_branch() {
        let sol = KernelSolution::new(
            vec![SolutionComponent::determined(0.0f64).with_branch(2, 2)],
            vec![],
        );
        assert!(!sol.validate());
    }

    #[test]
    fn solution_indices_mix_branches() {
        let sol = KernelSolution::new(
            vec![
                SolutionComponent::determined(0.0f64).with_branch(2, 1),
                SolutionComponent::determined(0.0).with_branch(3, 2),
            ],
            vec![],
        );
        // rear slot first: 0*3+2 = 2, then the front slot: 2*2+1 = 5
        assert_eq!(sol.solution_indices(), vec![5]);
    }

    thread_local! {
        static PACKED: RefCell<(Option<[f64; 3]>, Option<[f64; 9]>)> = RefCell::new((None, None));
    }

    fn capture_ik(
        eetrans: Option<&[f64; 3]>,
        eerot: Option<&[f64; 9]>,
        _free: &[f64],
        _solutions: &mut Vec<KernelSolution<f64>>,
    ) -> bool {
        PACKED.with(|p| *p.borrow_mut() = (eetrans.copied(), eerot.copied()));
        true
    }

    fn noop_fk(_joints: &[f64], _eetrans: &mut [f64; 3], _eerot: &mut [f64; 9]) {}

    #[test]
    fn direction_packs_into_leading_rotation_slots() {
        let kernel = IkKernel::new(capture_ik, noop_fk);
        let dir = Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0));
        kernel
            .call(&IkParameterization::Direction3D(dir), &[])
            .unwrap();
        PACKED.with(|p| {
            let (trans, rot) = *p.borrow();
            assert!(trans.is_none());
            let rot = rot.unwrap();
            assert_eq!(&rot[..3], &[0.0, 0.0, 1.0]);
            assert_eq!(&rot[3..], &[0.0; 6]);
        });
    }

    #[test]
    fn axis_angle_packs_angle_first() {
        let kernel = IkKernel::new(capture_ik, noop_fk);
        kernel
            .call(
                &IkParameterization::TranslationZAxisAngleYNorm4D {
                    origin: Vector3::new(1.0, 2.0, 3.0),
                    angle: 0.5,
                },
                &[],
            )
            .unwrap();
        PACKED.with(|p| {
            let (trans, rot) = *p.borrow();
            assert_eq!(trans.unwrap(), [1.0, 2.0, 3.0]);
            assert_eq!(rot.unwrap()[0], 0.5);
        });
    }

    #[test]
    fn panicking_kernel_is_contained() {
        fn panicking_ik(
            _: Option<&[f64; 3]>,
            _: Option<&[f64; 9]>,
            _: &[f64],
            _: &mut Vec<KernelSolution<f64>>,
        ) -> bool {
            panic!("generated code tripped");
        }
        let kernel = IkKernel::new(panicking_ik, noop_fk);
        let out = kernel.call(
            &IkParameterization::Translation3D(Vector3::new(0.0, 0.0, 0.0)),
            &[],
        );
        assert!(out.is_none());
    }
}

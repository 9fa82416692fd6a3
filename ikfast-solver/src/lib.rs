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
//! Outer solver shell for generated, per-robot analytical IK kernels.
//!
//! Given a target end-effector pose in one of the supported
//! [parameterization flavors](IkParameterizationType) and a
//! [manipulator](Manipulator) bound at [`IkFastSolver::init`], the shell
//! enumerates every joint configuration realizing the pose: it sweeps the
//! kernel's free joints outward from a seed, unwraps big-range revolute
//! joints into all 2π-equivalent configurations, and filters candidates
//! against joint limits, user filters, self- and environment collision, and a
//! workspace-precision re-check. [`IkFastSolver::solve_one`] returns the
//! survivor closest to the seed; [`IkFastSolver::solve_all`] returns the
//! complete set sorted farthest-from-limits first.
//!
//! The kernel itself, the kinematic body and the collision checker are
//! external: the kernel enters as a [function-pointer bundle](IkKernel), the
//! runtime behind the [`Manipulator`] trait.

use nalgebra::RealField;
pub use simba::scalar::{SubsetOf, SupersetOf};

mod compose;
mod error;
mod filter;
mod kernel;
mod limits;
mod manipulator;
mod parameterization;
mod solver;
mod state_check;

pub use crate::{
    error::{Error, Result},
    filter::{FilterHandle, IkFilterFn, IkFilterOptions, IkReturn, IkReturnAction},
    kernel::{FkFn, IkFn, IkKernel, KernelSolution, SolutionComponent},
    manipulator::{
        BodyId, CallbackHandle, ChangeCallback, CollisionAction, CollisionCallback,
        CollisionOptions, CollisionPairReport, JointKind, LinkId, Manipulator,
    },
    parameterization::{IkParameterization, IkParameterizationType},
    solver::{IkFastConfiguration, IkFastSolver, IkSingleResult},
};

/// Scalar type of a generated kernel (`f32` or `f64`).
pub trait IkReal:
    RealField + Copy + SubsetOf<f64> + SupersetOf<f64> + Send + Sync
{
}

impl<T> IkReal for T where T: RealField + Copy + SubsetOf<f64> + SupersetOf<f64> + Send + Sync {}

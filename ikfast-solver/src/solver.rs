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
//! The solver shell: entry points, candidate validation and ranking.
//!
//! Because checking collisions is the slowest part of IK, user filters run
//! before the collision stages; and for fully-determined poses the
//! end-effector cluster is checked against the environment once, up front,
//! aborting the whole call if it already collides.

use std::{
    cmp::Ordering as CmpOrdering,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use nalgebra as na;

use crate::{
    compose::compose_solution,
    error::{Error, Result},
    filter::{FilterEntry, FilterHandle, IkFilterFn, IkFilterOptions, IkReturn, IkReturnAction},
    kernel::{IkKernel, KernelSolution},
    limits::JointLimitData,
    manipulator::{CallbackHandle, ChangeCallback, CollisionOptions, JointKind, LinkId, Manipulator},
    parameterization::{IkParameterization, IkParameterizationType},
    state_check::{CollisionOptionsGuard, JointStateGuard, StateCheckEndEffector},
    IkReal,
};

/// Construction inputs of an [`IkFastSolver`].
#[derive(Debug)]
pub struct IkFastConfiguration<T: IkReal> {
    pub kernel: IkKernel<T>,
    /// Arm slots of the joints the kernel leaves free.
    pub free_indices: Vec<usize>,
    /// Scan step per free joint; leave empty for per-kind defaults.
    pub free_increments: Vec<T>,
    /// Arm DOF count the kernel was generated for.
    pub total_dof: usize,
    pub parameterization_type: IkParameterizationType,
    /// Kinematics-structure hash of the generating chain; empty skips the
    /// bind-time comparison.
    pub kinematics_hash: String,
}

/// Solution of a single-result solve.
#[derive(Debug, Clone)]
pub struct IkSingleResult<T> {
    pub solution: Vec<T>,
    /// Payload of the filter chain run that accepted the solution.
    pub filter_return: Option<IkReturn>,
}

/// Best-so-far record while scanning candidates against a seed.
struct SolutionInfo<T: IkReal> {
    values: Vec<T>,
    dist: T,
    filter_return: Option<IkReturn>,
}

impl<T: IkReal> SolutionInfo<T> {
    fn new() -> Self {
        Self {
            values: Vec::new(),
            dist: na::convert(1e30),
            filter_return: None,
        }
    }
}

/// Mirror of the per-call transients readable by the filter-scoped commands.
#[derive(Debug, Default)]
struct FilterScope {
    active: bool,
    solution_indices: Vec<u32>,
    same_state_repeat_count: u32,
}

/// Outer shell around one generated analytical IK kernel.
///
/// Holds a non-owning reference to the bound manipulator; the strong
/// reference is promoted per call. A single instance never runs two `solve*`
/// calls at once (the second call fails with [`Error::InvalidState`]);
/// distinct instances on distinct robots may run in parallel.
pub struct IkFastSolver<T: IkReal> {
    kernel: IkKernel<T>,
    free_indices: Vec<usize>,
    free_increments: Vec<T>,
    total_dof: usize,
    iktype: IkParameterizationType,
    kinematics_hash: String,
    manip: Option<Weak<dyn Manipulator<T>>>,
    joint_kinds: Vec<JointKind>,
    child_links: Vec<LinkId>,
    independent_links: Vec<LinkId>,
    limits: Arc<Mutex<JointLimitData<T>>>,
    ik_threshold: Mutex<T>,
    filters: Arc<Mutex<Vec<FilterEntry<T>>>>,
    filter_scope: Arc<Mutex<FilterScope>>,
    next_filter_id: AtomicU64,
    in_solve: AtomicBool,
    /// Keeps the joint-limits change subscription alive for the binding.
    _limits_callback: Option<CallbackHandle>,
}

impl<T: IkReal> fmt::Debug for IkFastSolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IkFastSolver")
            .field("free_indices", &self.free_indices)
            .field("total_dof", &self.total_dof)
            .field("iktype", &self.iktype)
            .field("kinematics_hash", &self.kinematics_hash)
            .finish()
    }
}

impl<T: IkReal> IkFastSolver<T> {
    pub fn new(config: IkFastConfiguration<T>) -> Self {
        Self {
            kernel: config.kernel,
            free_indices: config.free_indices,
            free_increments: config.free_increments,
            total_dof: config.total_dof,
            iktype: config.parameterization_type,
            kinematics_hash: config.kinematics_hash,
            manip: None,
            joint_kinds: Vec::new(),
            child_links: Vec::new(),
            independent_links: Vec::new(),
            limits: Arc::new(Mutex::new(JointLimitData::default())),
            ik_threshold: Mutex::new(na::convert(1e-4)),
            filters: Arc::new(Mutex::new(Vec::new())),
            filter_scope: Arc::new(Mutex::new(FilterScope::default())),
            next_filter_id: AtomicU64::new(0),
            in_solve: AtomicBool::new(false),
            _limits_callback: None,
        }
    }

    /// Binds the solver to a manipulator: caches arm topology and limits and
    /// subscribes to joint-limit changes.
    ///
    /// A kinematics-hash mismatch is logged but does not fail the bind; a DOF
    /// mismatch does.
    pub fn init(&mut self, manip: &Arc<dyn Manipulator<T>>) -> Result<()> {
        let hash = manip.kinematics_hash();
        if !self.kinematics_hash.is_empty() && hash != self.kinematics_hash {
            tracing::error!(
                "inverse kinematics hashes do not match for manip {}:{}. IK will not work! {} != {}",
                manip.robot_name(),
                manip.name(),
                hash,
                self.kinematics_hash,
            );
        }
        if self.total_dof != manip.arm_dof() {
            tracing::error!(
                "ik configured with a different number of joints than the manipulator ({} != {})",
                manip.arm_dof(),
                self.total_dof,
            );
            return Err(Error::InvalidArguments(format!(
                "kernel drives {} joints, manipulator has {}",
                self.total_dof,
                manip.arm_dof()
            )));
        }

        self.joint_kinds = manip.arm_joint_kinds();
        for &free in &self.free_indices {
            if free >= self.joint_kinds.len() {
                return Err(Error::InvalidArguments(format!(
                    "free parameter index {free} out of bounds"
                )));
            }
        }

        if self.free_increments.len() != self.free_indices.len() {
            if !self.free_increments.is_empty() {
                tracing::warn!(
                    "free increments not of correct size: {} != {}",
                    self.free_increments.len(),
                    self.free_indices.len(),
                );
            }
            self.free_increments = self
                .free_indices
                .iter()
                .map(|&slot| {
                    if self.joint_kinds[slot].is_revolute() {
                        na::convert(0.1)
                    } else {
                        na::convert(0.01)
                    }
                })
                .collect();
            tracing::debug!(
                "robot {}:{} setting free increments to {:?}",
                manip.robot_name(),
                manip.name(),
                self.free_increments,
            );
        }

        self.child_links = manip.child_links();
        self.independent_links = manip.independent_links();
        self.limits
            .lock()
            .unwrap()
            .refresh(&**manip, &self.free_indices)?;

        // refresh the cache whenever the robot reports new limits
        let limits = Arc::downgrade(&self.limits);
        let weak_manip = Arc::downgrade(manip);
        let free_indices = self.free_indices.clone();
        let callback: ChangeCallback = Arc::new(move || {
            let (Some(limits), Some(manip)) = (limits.upgrade(), weak_manip.upgrade()) else {
                return;
            };
            let result = limits.lock().unwrap().refresh(&*manip, &free_indices);
            if let Err(err) = result {
                tracing::error!("failed to refresh joint limits: {err}");
            }
        });
        self._limits_callback = Some(manip.register_joint_limits_callback(callback));
        self.manip = Some(Arc::downgrade(manip));
        Ok(())
    }

    pub fn supports(&self, kind: IkParameterizationType) -> bool {
        kind == self.iktype
    }

    pub fn num_free_parameters(&self) -> usize {
        self.free_indices.len()
    }

    /// Current free-joint values of the bound manipulator, normalized into
    /// `[0, 1]` by the cached joint ranges.
    pub fn free_parameters(&self) -> Result<Vec<T>> {
        let manip = self.upgrade_manip()?;
        let values = manip.arm_joint_values();
        let limits = self.limits.lock().unwrap();
        Ok(self
            .free_indices
            .iter()
            .zip(&limits.free_scales)
            .map(|(&slot, &scale)| (values[slot] - limits.lower[slot]) * scale)
            .collect())
    }

    /// The bound manipulator, if it is still alive.
    pub fn manipulator(&self) -> Option<Arc<dyn Manipulator<T>>> {
        self.manip.as_ref().and_then(Weak::upgrade)
    }

    pub fn ik_threshold(&self) -> T {
        *self.ik_threshold.lock().unwrap()
    }

    /// Workspace-precision bound an accepted solution's forward kinematics
    /// must reproduce the target within.
    pub fn set_ik_threshold(&self, threshold: T) {
        *self.ik_threshold.lock().unwrap() = threshold;
    }

    /// Adds a user filter; higher priorities run first, equal priorities in
    /// registration order. The filter lives until the handle is dropped.
    pub fn register_filter(&self, priority: i32, callback: Arc<IkFilterFn<T>>) -> FilterHandle<T> {
        let id = self.next_filter_id.fetch_add(1, Ordering::Relaxed);
        let mut chain = self.filters.lock().unwrap();
        let pos = chain.partition_point(|entry| entry.priority >= priority);
        chain.insert(
            pos,
            FilterEntry {
                id,
                priority,
                callback,
            },
        );
        FilterHandle {
            id,
            chain: Arc::downgrade(&self.filters),
        }
    }

    /// Line-oriented command channel.
    ///
    /// `SetIkThreshold <float>` adjusts the precision bound.
    /// `GetSolutionIndices` and `GetRobotLinkStateRepeatCount` are only valid
    /// while a user filter is executing: the former identifies the analytical
    /// branch and 2π-wrap of the candidate under scrutiny (the wrap sits in
    /// the bits above 16), the latter tells a filter it is being called again
    /// with the robot in the same link pose, so derived quantities can be
    /// reused.
    pub fn send_command(&self, input: &str) -> Result<String> {
        let mut tokens = input.split_whitespace();
        match tokens.next() {
            Some("SetIkThreshold") => {
                let value = tokens
                    .next()
                    .ok_or_else(|| Error::InvalidArguments("SetIkThreshold needs a value".into()))?;
                let value: f64 = value.parse().map_err(|_| {
                    Error::InvalidArguments(format!("cannot parse ik threshold: {value}"))
                })?;
                self.set_ik_threshold(na::convert(value));
                Ok(String::new())
            }
            Some("GetSolutionIndices") => {
                let scope = self.filter_scope.lock().unwrap();
                if !scope.active {
                    return Err(Error::InvalidState(
                        "GetSolutionIndices is only valid while a filter is executing".into(),
                    ));
                }
                let mut out = scope.solution_indices.len().to_string();
                for index in &scope.solution_indices {
                    out.push(' ');
                    out.push_str(&index.to_string());
                }
                Ok(out)
            }
            Some("GetRobotLinkStateRepeatCount") => {
                let scope = self.filter_scope.lock().unwrap();
                if !scope.active {
                    return Err(Error::InvalidState(
                        "GetRobotLinkStateRepeatCount is only valid while a filter is executing"
                            .into(),
                    ));
                }
                Ok(scope.same_state_repeat_count.to_string())
            }
            Some(other) => Err(Error::InvalidArguments(format!("unknown command {other}"))),
            None => Err(Error::InvalidArguments("empty command".into())),
        }
    }

    /// Finds the configuration realizing `param` that is closest to `q0`.
    ///
    /// Free joints are swept outward from the seed, so the first surviving
    /// kernel call already yields a nearby solution and the sweep stops
    /// there. Without a seed (`q0` arity not matching the arm) the first
    /// surviving candidate wins outright.
    pub fn solve_one(
        &self,
        param: &IkParameterization<T>,
        q0: &[T],
        options: IkFilterOptions,
    ) -> Result<Option<IkSingleResult<T>>> {
        let _entry = self.enter_solve()?;
        if param.kind() != self.iktype {
            tracing::warn!(
                "ik solver only supports {:?}, given {:?}",
                self.iktype,
                param.kind(),
            );
            return Ok(None);
        }
        let manip = self.upgrade_manip()?;
        let manip = &*manip;
        let limits = self.limits.lock().unwrap().clone();
        let _joint_state = JointStateGuard::new(manip);
        let _collision_state =
            CollisionOptionsGuard::new(manip, manip.collision_options() | CollisionOptions::ACTIVE_DOFS);
        let mut state_check =
            StateCheckEndEffector::new(manip, &self.child_links, &self.independent_links, options);

        let mut vfree = vec![T::zero(); self.free_indices.len()];
        let mut result = None;
        compose_solution(
            &self.free_indices,
            &self.free_increments,
            &limits.lower,
            &limits.upper,
            q0,
            0,
            &mut vfree,
            &mut |free: &[T]| {
                self.solve_single(
                    manip,
                    &limits,
                    param,
                    free,
                    q0,
                    options,
                    &mut state_check,
                    &mut result,
                )
            },
        )?;
        Ok(result)
    }

    /// Single-result solve with the free joints pinned to `free_norm`, each
    /// normalized in `[0, 1]` over its joint range.
    pub fn solve_one_with_free(
        &self,
        param: &IkParameterization<T>,
        q0: &[T],
        free_norm: &[T],
        options: IkFilterOptions,
    ) -> Result<Option<IkSingleResult<T>>> {
        let _entry = self.enter_solve()?;
        if param.kind() != self.iktype {
            tracing::warn!(
                "ik solver only supports {:?}, given {:?}",
                self.iktype,
                param.kind(),
            );
            return Ok(None);
        }
        if free_norm.len() != self.free_indices.len() {
            return Err(Error::InvalidArguments("free parameters not equal".into()));
        }
        let manip = self.upgrade_manip()?;
        let manip = &*manip;
        let limits = self.limits.lock().unwrap().clone();
        let vfree = self.denormalize_free(&limits, free_norm);
        let _joint_state = JointStateGuard::new(manip);
        let _collision_state =
            CollisionOptionsGuard::new(manip, manip.collision_options() | CollisionOptions::ACTIVE_DOFS);
        let mut state_check =
            StateCheckEndEffector::new(manip, &self.child_links, &self.independent_links, options);

        let mut result = None;
        self.solve_single(
            manip,
            &limits,
            param,
            &vfree,
            q0,
            options,
            &mut state_check,
            &mut result,
        )?;
        Ok(result)
    }

    /// Collects every configuration realizing `param`, sorted farthest from
    /// the joint limits first.
    pub fn solve_all(
        &self,
        param: &IkParameterization<T>,
        options: IkFilterOptions,
    ) -> Result<Vec<Vec<T>>> {
        let _entry = self.enter_solve()?;
        if param.kind() != self.iktype {
            tracing::warn!(
                "ik solver only supports {:?}, given {:?}",
                self.iktype,
                param.kind(),
            );
            return Ok(Vec::new());
        }
        let manip = self.upgrade_manip()?;
        let manip = &*manip;
        let limits = self.limits.lock().unwrap().clone();
        let _joint_state = JointStateGuard::new(manip);
        let _collision_state =
            CollisionOptionsGuard::new(manip, manip.collision_options() | CollisionOptions::ACTIVE_DOFS);
        let mut state_check =
            StateCheckEndEffector::new(manip, &self.child_links, &self.independent_links, options);

        let mut vfree = vec![T::zero(); self.free_indices.len()];
        let mut solutions = Vec::new();
        let action = compose_solution(
            &self.free_indices,
            &self.free_increments,
            &limits.lower,
            &limits.upper,
            &[],
            0,
            &mut vfree,
            &mut |free: &[T]| {
                self.solve_all_with(
                    manip,
                    &limits,
                    param,
                    free,
                    options,
                    &mut state_check,
                    &mut solutions,
                )
            },
        )?;
        if action.is_quit() {
            return Ok(Vec::new());
        }
        sort_solutions(manip, &limits, &mut solutions);
        Ok(solutions)
    }

    /// All-solutions solve with the free joints pinned to `free_norm`.
    pub fn solve_all_with_free(
        &self,
        param: &IkParameterization<T>,
        free_norm: &[T],
        options: IkFilterOptions,
    ) -> Result<Vec<Vec<T>>> {
        let _entry = self.enter_solve()?;
        if param.kind() != self.iktype {
            tracing::warn!(
                "ik solver only supports {:?}, given {:?}",
                self.iktype,
                param.kind(),
            );
            return Ok(Vec::new());
        }
        if free_norm.len() != self.free_indices.len() {
            return Err(Error::InvalidArguments("free parameters not equal".into()));
        }
        let manip = self.upgrade_manip()?;
        let manip = &*manip;
        let limits = self.limits.lock().unwrap().clone();
        let vfree = self.denormalize_free(&limits, free_norm);
        let _joint_state = JointStateGuard::new(manip);
        let _collision_state =
            CollisionOptionsGuard::new(manip, manip.collision_options() | CollisionOptions::ACTIVE_DOFS);
        let mut state_check =
            StateCheckEndEffector::new(manip, &self.child_links, &self.independent_links, options);

        let mut solutions = Vec::new();
        let action = self.solve_all_with(
            manip,
            &limits,
            param,
            &vfree,
            options,
            &mut state_check,
            &mut solutions,
        )?;
        if action.is_quit() {
            return Ok(Vec::new());
        }
        sort_solutions(manip, &limits, &mut solutions);
        Ok(solutions)
    }

    fn denormalize_free(&self, limits: &JointLimitData<T>, free_norm: &[T]) -> Vec<T> {
        free_norm
            .iter()
            .zip(&self.free_indices)
            .map(|(&f, &slot)| f * (limits.upper[slot] - limits.lower[slot]) + limits.lower[slot])
            .collect()
    }

    /// One kernel call in single-result mode: ranks the raw solutions by
    /// distance to the seed and validates them in that order, keeping the
    /// best survivor.
    #[allow(clippy::too_many_arguments)]
    fn solve_single(
        &self,
        manip: &dyn Manipulator<T>,
        limits: &JointLimitData<T>,
        param: &IkParameterization<T>,
        vfree: &[T],
        q0: &[T],
        options: IkFilterOptions,
        state_check: &mut StateCheckEndEffector<'_, T>,
        out: &mut Option<IkSingleResult<T>>,
    ) -> Result<IkReturnAction> {
        let Some(solutions) = self.kernel.call(param, vfree) else {
            return Ok(IkReturnAction::REJECT_KINEMATICS);
        };

        let dof = limits.lower.len();
        let mut best = SolutionInfo::new();

        let mut order: Vec<usize> = (0..solutions.len()).collect();
        if q0.len() == dof {
            // visit raw solutions from closest to farthest
            let mut sol_buf = vec![T::zero(); dof];
            let mut dists: Vec<(usize, T)> = Vec::with_capacity(solutions.len());
            for (index, sol) in solutions.iter().enumerate() {
                let sol_free: Vec<T> = sol.free().iter().map(|&slot| q0[slot]).collect();
                sol.solution(&sol_free, &mut sol_buf);
                dists.push((index, config_dist2(manip, &sol_buf, q0)));
            }
            dists.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(CmpOrdering::Equal));
            order = dists.into_iter().map(|d| d.0).collect();
        }

        let mut res = IkReturnAction::REJECT;
        for &index in &order {
            let sol = &solutions[index];
            debug_assert!(sol.validate());
            if !sol.free().is_empty() {
                // search over the free parameters of this solution
                let free_slots = sol.free().to_vec();
                let mut sol_free = vec![T::zero(); free_slots.len()];
                res = compose_solution(
                    &free_slots,
                    &self.free_increments,
                    &limits.lower,
                    &limits.upper,
                    q0,
                    0,
                    &mut sol_free,
                    &mut |f: &[T]| {
                        self.validate_solution_single(
                            manip,
                            limits,
                            sol,
                            f,
                            q0,
                            options,
                            param,
                            state_check,
                            &mut best,
                        )
                    },
                )?;
            } else {
                res = self.validate_solution_single(
                    manip,
                    limits,
                    sol,
                    &[],
                    q0,
                    options,
                    param,
                    state_check,
                    &mut best,
                )?;
            }

            if res.is_quit() {
                return Ok(res);
            }
            // without a seed there is nothing to improve on
            if res.is_success() && q0.len() != dof {
                break;
            }
        }

        if best.values.len() == dof {
            *out = Some(IkSingleResult {
                solution: best.values,
                filter_return: best.filter_return,
            });
            return Ok(IkReturnAction::SUCCESS);
        }
        debug_assert!(res.is_reject());
        Ok(res)
    }

    /// Validates one raw solution in single-result mode. See the module docs
    /// for the staging; each stage's short-circuit is observable.
    #[allow(clippy::too_many_arguments)]
    fn validate_solution_single(
        &self,
        manip: &dyn Manipulator<T>,
        limits: &JointLimitData<T>,
        sol: &KernelSolution<T>,
        sol_free: &[T],
        q0: &[T],
        options: IkFilterOptions,
        param: &IkParameterization<T>,
        state_check: &mut StateCheckEndEffector<'_, T>,
        best: &mut SolutionInfo<T>,
    ) -> Result<IkReturnAction> {
        let dof = limits.lower.len();
        let mut vravesol = vec![T::zero(); dof];
        sol.solution(sol_free, &mut vravesol);
        let solution_indices = sol.solution_indices();
        let seeded = q0.len() == dof;

        let mut vravesols: Vec<(Vec<T>, u32)>;
        if !options.contains(IkFilterOptions::IGNORE_JOINT_LIMITS) {
            vravesols = limits.similar_joint_angles(&mut vravesol)?;
            if seeded {
                // every unwrapping worse than the best so far can go early
                vravesols.retain(|(values, _)| config_dist2(manip, values, q0) < best.dist);
            }
            if vravesols.is_empty() {
                return Ok(IkReturnAction::REJECT_JOINT_LIMITS);
            }
        } else {
            if seeded && best.dist <= config_dist2(manip, &vravesol, q0) {
                return Ok(IkReturnAction::REJECT);
            }
            vravesols = vec![(vravesol.clone(), 0)];
        }

        let mut filter_returns: Vec<IkReturn> = Vec::new();
        let accepted: Vec<Vec<T>>;
        let paramnew: IkParameterization<T>;

        if !options.contains(IkFilterOptions::IGNORE_CUSTOM_FILTERS) {
            // each survivor carries the pose it was filtered against, so the
            // collision/precision stages below take theirs from the data
            let mut survivors: Vec<(Vec<T>, IkParameterization<T>)> =
                Vec::with_capacity(vravesols.len());
            let mut last_action = IkReturnAction::REJECT;
            let mut same_state_repeat_count = 0u32;
            for (values, wrap_id) in vravesols {
                let indices: Vec<u32> = solution_indices
                    .iter()
                    .map(|&index| index + (wrap_id << 16))
                    .collect();
                manip.set_arm_joint_values(&values);
                // floating-point drift: filters need a pose that matches the
                // robot state bit-for-bit, so recompute it from FK
                let candidate_param = manip.ee_parameterization(param.kind());
                let mut local_return = IkReturn::default();
                local_return.map_data.insert(
                    "solutionindices".to_owned(),
                    indices.iter().map(|&index| f64::from(index)).collect(),
                );
                let action = self.call_filters(
                    &values,
                    manip,
                    &candidate_param,
                    &mut local_return,
                    &indices,
                    same_state_repeat_count,
                );
                same_state_repeat_count += 1;
                if action.is_quit() {
                    return Ok(action);
                }
                if action.is_success() {
                    filter_returns.push(local_return);
                    survivors.push((values, candidate_param));
                }
                last_action = action;
            }
            let Some((_, last_param)) = survivors.last() else {
                debug_assert!(last_action.is_reject());
                return Ok(last_action);
            };
            paramnew = last_param.clone();
            accepted = survivors.into_iter().map(|(values, _)| values).collect();
        } else {
            let mut local_return = IkReturn::default();
            local_return.map_data.insert(
                "solutionindices".to_owned(),
                solution_indices.iter().map(|&index| f64::from(index)).collect(),
            );
            filter_returns.push(local_return);
            manip.set_arm_joint_values(&vravesol);
            paramnew = manip.ee_parameterization(param.kind());
            accepted = vravesols.into_iter().map(|(values, _)| values).collect();
        }

        if let Some(action) = self.check_collisions(manip, options, state_check, &paramnew) {
            return Ok(action);
        }

        // the accepted pose must actually reproduce the request
        let workspace_dist = param.distance_sqr(&paramnew);
        if workspace_dist > self.ik_threshold() {
            tracing::error!(
                "ignoring bad ik for {}:{}: dist sqr {:?}, sol {:?}",
                manip.robot_name(),
                manip.name(),
                workspace_dist,
                vravesol,
            );
            return Ok(IkReturnAction::REJECT_KINEMATICS_PRECISION);
        }

        for (index, values) in accepted.into_iter().enumerate() {
            if seeded {
                let dist = config_dist2(manip, &values, q0);
                if dist < best.dist {
                    best.values = values;
                    best.dist = dist;
                    best.filter_return = filter_returns.get(index).cloned();
                }
            } else {
                // no seed to rank against; first valid candidate wins
                best.values = values;
                best.filter_return = filter_returns.get(index).cloned();
                break;
            }
        }
        Ok(IkReturnAction::SUCCESS)
    }

    /// One kernel call in all-solutions mode. Always reports a reject so the
    /// free-parameter sweep visits the entire space; only quits cut it short.
    #[allow(clippy::too_many_arguments)]
    fn solve_all_with(
        &self,
        manip: &dyn Manipulator<T>,
        limits: &JointLimitData<T>,
        param: &IkParameterization<T>,
        vfree: &[T],
        options: IkFilterOptions,
        state_check: &mut StateCheckEndEffector<'_, T>,
        solutions: &mut Vec<Vec<T>>,
    ) -> Result<IkReturnAction> {
        if let Some(kernel_solutions) = self.kernel.call(param, vfree) {
            for sol in &kernel_solutions {
                debug_assert!(sol.validate());
                let action = if !sol.free().is_empty() {
                    let free_slots = sol.free().to_vec();
                    let mut sol_free = vec![T::zero(); free_slots.len()];
                    compose_solution(
                        &free_slots,
                        &self.free_increments,
                        &limits.lower,
                        &limits.upper,
                        &[],
                        0,
                        &mut sol_free,
                        &mut |f: &[T]| {
                            self.validate_solution_all(
                                manip,
                                limits,
                                sol,
                                f,
                                options,
                                param,
                                state_check,
                                solutions,
                            )
                        },
                    )?
                } else {
                    self.validate_solution_all(
                        manip,
                        limits,
                        sol,
                        &[],
                        options,
                        param,
                        state_check,
                        solutions,
                    )?
                };
                if action.is_quit() {
                    return Ok(action);
                }
            }
        }
        Ok(IkReturnAction::REJECT)
    }

    /// Validates one raw solution in all-solutions mode, accumulating every
    /// surviving unwrapping.
    #[allow(clippy::too_many_arguments)]
    fn validate_solution_all(
        &self,
        manip: &dyn Manipulator<T>,
        limits: &JointLimitData<T>,
        sol: &KernelSolution<T>,
        sol_free: &[T],
        options: IkFilterOptions,
        param: &IkParameterization<T>,
        state_check: &mut StateCheckEndEffector<'_, T>,
        solutions: &mut Vec<Vec<T>>,
    ) -> Result<IkReturnAction> {
        let dof = limits.lower.len();
        let mut vravesol = vec![T::zero(); dof];
        sol.solution(sol_free, &mut vravesol);
        let solution_indices = sol.solution_indices();

        let vravesols: Vec<(Vec<T>, u32)>;
        if !options.contains(IkFilterOptions::IGNORE_JOINT_LIMITS) {
            vravesols = limits.similar_joint_angles(&mut vravesol)?;
            if vravesols.is_empty() {
                return Ok(IkReturnAction::REJECT_JOINT_LIMITS);
            }
        } else {
            vravesols = vec![(vravesol.clone(), 0)];
        }

        let accepted: Vec<Vec<T>>;
        let paramnew: IkParameterization<T>;
        if !options.contains(IkFilterOptions::IGNORE_CUSTOM_FILTERS) {
            // only the first unwrapping the chain accepts is kept, paired
            // with the pose it was filtered against
            let mut survivor: Option<(Vec<T>, IkParameterization<T>)> = None;
            let mut last_action = IkReturnAction::REJECT;
            let mut same_state_repeat_count = 0u32;
            for (values, wrap_id) in vravesols {
                let indices: Vec<u32> = solution_indices
                    .iter()
                    .map(|&index| index + (wrap_id << 16))
                    .collect();
                manip.set_arm_joint_values(&values);
                let candidate_param = manip.ee_parameterization(param.kind());
                let mut local_return = IkReturn::default();
                let action = self.call_filters(
                    &values,
                    manip,
                    &candidate_param,
                    &mut local_return,
                    &indices,
                    same_state_repeat_count,
                );
                same_state_repeat_count += 1;
                if action.is_quit() {
                    return Ok(action);
                }
                last_action = action;
                if action.is_success() {
                    survivor = Some((values, candidate_param));
                    break;
                }
            }
            let Some((values, survivor_param)) = survivor else {
                debug_assert!(last_action.is_reject());
                return Ok(last_action);
            };
            paramnew = survivor_param;
            accepted = vec![values];
        } else {
            manip.set_arm_joint_values(&vravesol);
            paramnew = manip.ee_parameterization(param.kind());
            accepted = vravesols.into_iter().map(|(values, _)| values).collect();
        }

        if let Some(action) = self.check_collisions(manip, options, state_check, &paramnew) {
            return Ok(action);
        }

        let workspace_dist = param.distance_sqr(&paramnew);
        if workspace_dist > self.ik_threshold() {
            tracing::error!(
                "ignoring bad ik for {}:{}: dist sqr {:?}, sol {:?}",
                manip.robot_name(),
                manip.name(),
                workspace_dist,
                vravesol,
            );
            return Ok(IkReturnAction::REJECT_KINEMATICS_PRECISION);
        }

        for values in accepted {
            solutions.push(values);
        }
        // keep scanning; the caller accumulates
        Ok(IkReturnAction::REJECT)
    }

    /// Shared collision staging: self-collision first, then environment with
    /// the one-shot end-effector pre-check for fully-determined poses.
    fn check_collisions(
        &self,
        manip: &dyn Manipulator<T>,
        options: IkFilterOptions,
        state_check: &mut StateCheckEndEffector<'_, T>,
        paramnew: &IkParameterization<T>,
    ) -> Option<IkReturnAction> {
        if !options.contains(IkFilterOptions::IGNORE_SELF_COLLISIONS) {
            state_check.set_self_collision_state();
            if let Some(report) = manip.check_self_collision() {
                tracing::debug!("ik rejected by self collision: {report:?}");
                return Some(IkReturnAction::REJECT_SELF_COLLISION);
            }
        }
        if options.contains(IkFilterOptions::CHECK_ENV_COLLISIONS) {
            state_check.set_environment_collision_state();
            if state_check.need_check_end_effector_collision() {
                // only meaningful when the pose fully determines the cluster
                if paramnew.kind() == IkParameterizationType::Transform6D
                    || manip.arm_dof() <= paramnew.dof()
                {
                    if manip.check_end_effector_collision() {
                        // every other branch shares this cluster pose
                        return Some(IkReturnAction::QUIT_END_EFFECTOR_COLLISION);
                    }
                    state_check.reset_check_end_effector_collision();
                }
            }
            if let Some(report) = manip.check_env_collision() {
                tracing::debug!("ik rejected by environment collision: {report:?}");
                return Some(IkReturnAction::REJECT_ENV_COLLISION);
            }
        }
        None
    }

    /// Runs the filter chain on one candidate, mirroring the per-call
    /// transients into the command scope for the duration.
    fn call_filters(
        &self,
        values: &[T],
        manip: &dyn Manipulator<T>,
        param: &IkParameterization<T>,
        out: &mut IkReturn,
        solution_indices: &[u32],
        same_state_repeat_count: u32,
    ) -> IkReturnAction {
        let callbacks: Vec<Arc<IkFilterFn<T>>> = self
            .filters
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.callback.clone())
            .collect();
        {
            let mut scope = self.filter_scope.lock().unwrap();
            scope.active = true;
            scope.solution_indices = solution_indices.to_vec();
            scope.same_state_repeat_count = same_state_repeat_count;
        }
        let mut action = IkReturnAction::SUCCESS;
        for callback in callbacks {
            let ret = callback(values, manip, param);
            out.append(&ret);
            if !ret.action.is_success() {
                action = ret.action;
                break;
            }
        }
        self.filter_scope.lock().unwrap().active = false;
        action
    }

    fn upgrade_manip(&self) -> Result<Arc<dyn Manipulator<T>>> {
        self.manip
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::InvalidState("solver is not bound to a live manipulator".into()))
    }

    fn enter_solve(&self) -> Result<SolveEntryGuard<'_>> {
        if self
            .in_solve
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::InvalidState(
                "a solve call is already in flight on this solver instance".into(),
            ));
        }
        Ok(SolveEntryGuard(&self.in_solve))
    }
}

/// Clears the single-entry marker on every exit path of a solve call.
struct SolveEntryGuard<'a>(&'a AtomicBool);

impl Drop for SolveEntryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Weighted squared configuration distance, circular-aware through the
/// manipulator's subtraction.
fn config_dist2<T: IkReal>(manip: &dyn Manipulator<T>, q1: &[T], q2: &[T]) -> T {
    let diff = manip.subtract_arm_joint_values(q1, q2);
    let weights = manip.arm_joint_weights();
    diff.iter()
        .zip(&weights)
        .fold(T::zero(), |acc, (d, w)| acc + *d * *d * *w)
}

/// Stable sort by how close each solution comes to its nearest joint limit,
/// farthest first; ties keep kernel branch order.
fn sort_solutions<T: IkReal>(
    manip: &dyn Manipulator<T>,
    limits: &JointLimitData<T>,
    solutions: &mut Vec<Vec<T>>,
) {
    if solutions.len() <= 1 {
        return;
    }
    let inv_weights: Vec<T> = manip
        .arm_joint_weights()
        .iter()
        .map(|&w| T::one() / w)
        .collect();
    let big: T = na::convert(1e30);
    let mut scored: Vec<(usize, T)> = solutions
        .iter()
        .enumerate()
        .map(|(index, q)| {
            let mut dist_lower = big;
            for (d, iw) in manip
                .subtract_arm_joint_values(q, &limits.lower)
                .iter()
                .zip(&inv_weights)
            {
                dist_lower = dist_lower.min(d.abs() * *iw);
            }
            let mut dist_upper = big;
            for (d, iw) in manip
                .subtract_arm_joint_values(q, &limits.upper)
                .iter()
                .zip(&inv_weights)
            {
                dist_upper = dist_upper.min(d.abs() * *iw);
            }
            (index, -dist_lower.min(dist_upper))
        })
        .collect();
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(CmpOrdering::Equal));
    let sorted: Vec<Vec<T>> = scored
        .into_iter()
        .map(|(index, _)| std::mem::take(&mut solutions[index]))
        .collect();
    *solutions = sorted;
}

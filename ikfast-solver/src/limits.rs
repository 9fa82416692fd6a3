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
//! Cached joint limits and the 2π-unwrapping of raw kernel solutions.

use nalgebra as na;

use crate::{Error, IkReal, JointKind, Manipulator, Result};

/// Bound tolerance for values pushed slightly out of range by error
/// propagation through the kernel.
pub(crate) fn joint_limit_epsilon<T: IkReal>() -> T {
    na::convert(1e-6)
}

/// Joint-limit data cached off the bound manipulator.
///
/// Refreshed at bind time and from the joint-limits change callback. A
/// revolute, non-circular joint whose range exceeds one turn is a "big-range"
/// joint: a single kernel solution for it maps to several distinct in-range
/// configurations, enumerated by [`Self::similar_joint_angles`].
#[derive(Debug, Clone)]
pub(crate) struct JointLimitData<T> {
    pub(crate) lower: Vec<T>,
    pub(crate) upper: Vec<T>,
    /// Range midpoints; kept alongside the bounds for downstream consumers.
    pub(crate) mid: Vec<T>,
    pub(crate) kinds: Vec<JointKind>,
    /// Arm slots of big-range joints.
    pub(crate) bigrange_indices: Vec<usize>,
    /// Per big-range joint, the largest possible number of unwrappings.
    pub(crate) bigrange_max_sols: Vec<usize>,
    /// Running product of `bigrange_max_sols`, with a leading 1; encodes a
    /// wrap choice per joint into one compact integer.
    pub(crate) bigrange_cumprod: Vec<usize>,
    /// Per free joint, `1 / (upper - lower)`, or 0 on an empty range.
    pub(crate) free_scales: Vec<T>,
}

impl<T> Default for JointLimitData<T> {
    fn default() -> Self {
        Self {
            lower: Vec::new(),
            upper: Vec::new(),
            mid: Vec::new(),
            kinds: Vec::new(),
            bigrange_indices: Vec::new(),
            bigrange_max_sols: Vec::new(),
            bigrange_cumprod: Vec::new(),
            free_scales: Vec::new(),
        }
    }
}

impl<T: IkReal> JointLimitData<T> {
    /// Re-reads limits off the manipulator and rebuilds the derived tables.
    pub(crate) fn refresh(
        &mut self,
        manip: &dyn Manipulator<T>,
        free_indices: &[usize],
    ) -> Result<()> {
        let (lower, upper) = manip.arm_joint_limits();
        let kinds = manip.arm_joint_kinds();
        let two_pi: T = T::two_pi();
        let half: T = na::convert(0.5);

        self.mid.clear();
        self.bigrange_indices.clear();
        self.bigrange_max_sols.clear();
        self.bigrange_cumprod.clear();
        self.bigrange_cumprod.push(1);
        for i in 0..lower.len() {
            self.mid.push(half * (lower[i] + upper[i]));
            if upper[i] - lower[i] > two_pi && kinds[i].is_revolute() && !kinds[i].is_circular() {
                let wraps: f64 = na::convert((upper[i] - lower[i]) / two_pi);
                let max_sols = 1 + wraps as usize;
                self.bigrange_indices.push(i);
                self.bigrange_max_sols.push(max_sols);
                self.bigrange_cumprod
                    .push(self.bigrange_cumprod.last().unwrap() * max_sols);
            }
        }

        self.free_scales.clear();
        for &free in free_indices {
            if free >= lower.len() {
                return Err(Error::InvalidArguments(format!(
                    "free parameter index {free} out of bounds"
                )));
            }
            if upper[free] > lower[free] {
                self.free_scales.push(T::one() / (upper[free] - lower[free]));
            } else {
                self.free_scales.push(T::zero());
            }
        }

        self.lower = lower;
        self.upper = upper;
        self.kinds = kinds;
        Ok(())
    }

    /// Wraps revolute slots of `q` into their limits in place. Returns false
    /// when some slot cannot be brought within the (epsilon-padded) range.
    pub(crate) fn check_joint_angles(&self, q: &mut [T]) -> bool {
        let two_pi: T = T::two_pi();
        let eps = joint_limit_epsilon::<T>();
        for j in 0..self.lower.len() {
            if self.kinds[j].is_revolute() {
                while q[j] > self.upper[j] {
                    q[j] -= two_pi;
                }
                while q[j] < self.lower[j] {
                    q[j] += two_pi;
                }
            }
            // error propagation through the kernel warrants a small pad
            if q[j] < self.lower[j] - eps || q[j] > self.upper[j] + eps {
                return false;
            }
        }
        true
    }

    /// Canonicalizes `q` and enumerates every 2π-equivalent in-range
    /// configuration, paired with its wrap-id.
    ///
    /// `q` is wrapped in place to the representative (wrap 0). Returns an
    /// empty vector when no in-range representative exists. Exceeding the
    /// precomputed wrap bound means the kernel disagrees with the bound
    /// manipulator about the chain.
    pub(crate) fn similar_joint_angles(&self, q: &mut Vec<T>) -> Result<Vec<(Vec<T>, u32)>> {
        let mut out = Vec::new();
        if !self.check_joint_angles(q) {
            return Ok(out);
        }
        out.push((q.clone(), 0));
        if self.bigrange_indices.is_empty() {
            return Ok(out);
        }

        let two_pi: T = T::two_pi();
        let mut extra_values: Vec<Vec<T>> = Vec::with_capacity(self.bigrange_indices.len());
        let mut size_cumprod: Vec<usize> = Vec::with_capacity(self.bigrange_indices.len());
        let mut total = 1usize;
        for (k, &j) in self.bigrange_indices.iter().enumerate() {
            debug_assert!(self.kinds[j].is_revolute() && !self.kinds[j].is_circular());
            let original = q[j];
            let mut values = vec![original];
            let mut f = original - two_pi;
            while f >= self.lower[j] {
                values.push(f);
                f -= two_pi;
            }
            f = original + two_pi;
            while f <= self.upper[j] {
                values.push(f);
                f += two_pi;
            }
            if values.len() > self.bigrange_max_sols[k] {
                return Err(Error::InconsistentConstraints(format!(
                    "exceeded max possible redundant solutions for arm joint {j}: {} > {}",
                    values.len(),
                    self.bigrange_max_sols[k]
                )));
            }
            size_cumprod.push(total);
            total *= values.len();
            extra_values.push(values);
        }

        if total > 1 {
            out.resize(total, (q.clone(), 0));
            for i in 1..total {
                let mut wrap_id = 0usize;
                let entry = &mut out[i];
                entry.0.copy_from_slice(q);
                for k in 0..self.bigrange_indices.len() {
                    if extra_values[k].len() > 1 {
                        let value_index = (i / size_cumprod[k]) % extra_values[k].len();
                        entry.0[self.bigrange_indices[k]] = extra_values[k][value_index];
                        wrap_id += value_index * self.bigrange_cumprod[k];
                    }
                }
                entry.1 = wrap_id as u32;
            }
        }
        Ok(out)
    }
}

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
//! Solve options, staged return actions and the user-filter chain.

use std::{
    collections::HashMap,
    ops::{BitOr, BitOrAssign},
    sync::{Mutex, Weak},
};

use bitflags::bitflags;

use crate::{IkParameterization, IkReal, Manipulator};

bitflags! {
    /// Flags modifying the validation discipline of one solve call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IkFilterOptions: u32 {
        /// Check robot-vs-environment collision for each candidate.
        const CHECK_ENV_COLLISIONS = 0x1;
        const IGNORE_SELF_COLLISIONS = 0x2;
        /// Emit raw kernel outputs without unwrapping into joint limits.
        const IGNORE_JOINT_LIMITS = 0x4;
        const IGNORE_CUSTOM_FILTERS = 0x8;
        /// Treat the end-effector cluster and grabbed bodies as non-colliding
        /// with the environment.
        const IGNORE_END_EFFECTOR_COLLISIONS = 0x10;
    }
}

/// Outcome of a validation stage; a bit pattern, not a plain enum, because
/// specific rejects/quits refine the generic `REJECT`/`QUIT` bits and stages
/// test the bits rather than exact values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IkReturnAction(u32);

impl IkReturnAction {
    /// Emit this candidate.
    pub const SUCCESS: Self = Self(0);
    /// Generic rejection; the search continues.
    pub const REJECT: Self = Self(0x1);
    /// Generic stop-the-search; user filters return this to cancel.
    pub const QUIT: Self = Self(0x2);
    /// The kernel refused the pose.
    pub const REJECT_KINEMATICS: Self = Self(0x1 | 0x10);
    pub const REJECT_SELF_COLLISION: Self = Self(0x1 | 0x20);
    pub const REJECT_ENV_COLLISION: Self = Self(0x1 | 0x40);
    /// The end-effector cluster is in collision; no other branch can help, so
    /// the whole call is abandoned.
    pub const QUIT_END_EFFECTOR_COLLISION: Self = Self(0x2 | 0x80);
    /// No in-range unwrapping exists.
    pub const REJECT_JOINT_LIMITS: Self = Self(0x1 | 0x100);
    /// Forward kinematics of the candidate did not reproduce the target
    /// within the ik threshold.
    pub const REJECT_KINEMATICS_PRECISION: Self = Self(0x1 | 0x200);
    pub const REJECT_CUSTOM_FILTER: Self = Self(0x1 | 0x8000);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    pub const fn is_reject(self) -> bool {
        self.0 & Self::REJECT.0 != 0
    }

    pub const fn is_quit(self) -> bool {
        self.0 & Self::QUIT.0 != 0
    }
}

impl BitOr for IkReturnAction {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for IkReturnAction {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Payload traveling with an accepted candidate through the filter chain.
///
/// Data vectors are `f64` regardless of the kernel scalar so filter consumers
/// stay scalar-agnostic. The solver fills `"solutionindices"` before invoking
/// the chain.
#[derive(Debug, Clone)]
pub struct IkReturn {
    pub action: IkReturnAction,
    pub map_data: HashMap<String, Vec<f64>>,
}

impl IkReturn {
    pub fn new(action: IkReturnAction) -> Self {
        Self {
            action,
            map_data: HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.action = IkReturnAction::SUCCESS;
        self.map_data.clear();
    }

    /// Merges another payload into this one; the other's entries win on key
    /// conflicts.
    pub fn append(&mut self, other: &IkReturn) {
        for (k, v) in &other.map_data {
            self.map_data.insert(k.clone(), v.clone());
        }
    }
}

impl Default for IkReturn {
    fn default() -> Self {
        Self::new(IkReturnAction::SUCCESS)
    }
}

/// User filter: runs on a fully-configured robot pose and may accept, reject
/// or abort the search. The parameterization passed in is recomputed from
/// forward kinematics, so it matches the robot state bit-for-bit.
pub type IkFilterFn<T> =
    dyn Fn(&[T], &dyn Manipulator<T>, &IkParameterization<T>) -> IkReturn + Send + Sync;

pub(crate) struct FilterEntry<T: IkReal> {
    pub(crate) id: u64,
    pub(crate) priority: i32,
    pub(crate) callback: std::sync::Arc<IkFilterFn<T>>,
}

impl<T: IkReal> std::fmt::Debug for FilterEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterEntry")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Keeps a registered filter alive; dropping it removes the filter from the
/// chain.
#[derive(Debug)]
pub struct FilterHandle<T: IkReal> {
    pub(crate) id: u64,
    pub(crate) chain: Weak<Mutex<Vec<FilterEntry<T>>>>,
}

impl<T: IkReal> Drop for FilterHandle<T> {
    fn drop(&mut self) {
        if let Some(chain) = self.chain.upgrade() {
            let mut chain = chain.lock().unwrap();
            chain.retain(|entry| entry.id != self.id);
        }
    }
}

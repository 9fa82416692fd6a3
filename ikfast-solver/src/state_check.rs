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
//! Scoped guards around runtime state the solver mutates.
//!
//! Every mutation (joint values, collision options, link/body enable flags)
//! is tied to one of these guards so that all exit paths of a solve call,
//! including errors and quits, leave the runtime exactly as found.

use std::sync::Arc;

use crate::{
    manipulator::{
        BodyId, CallbackHandle, CollisionAction, CollisionOptions, CollisionPairReport, LinkId,
    },
    IkFilterOptions, IkReal, Manipulator,
};

/// Restores the arm joint values on drop.
pub(crate) struct JointStateGuard<'a, T: IkReal> {
    manip: &'a dyn Manipulator<T>,
    values: Vec<T>,
}

impl<'a, T: IkReal> JointStateGuard<'a, T> {
    pub(crate) fn new(manip: &'a dyn Manipulator<T>) -> Self {
        Self {
            manip,
            values: manip.arm_joint_values(),
        }
    }
}

impl<T: IkReal> Drop for JointStateGuard<'_, T> {
    fn drop(&mut self) {
        self.manip.set_arm_joint_values(&self.values);
    }
}

/// Swaps in collision-checker options, restoring the previous set on drop.
pub(crate) struct CollisionOptionsGuard<'a, T: IkReal> {
    manip: &'a dyn Manipulator<T>,
    saved: CollisionOptions,
}

impl<'a, T: IkReal> CollisionOptionsGuard<'a, T> {
    pub(crate) fn new(manip: &'a dyn Manipulator<T>, options: CollisionOptions) -> Self {
        let saved = manip.collision_options();
        manip.set_collision_options(options);
        Self { manip, saved }
    }
}

impl<T: IkReal> Drop for CollisionOptionsGuard<'_, T> {
    fn drop(&mut self) {
        self.manip.set_collision_options(self.saved);
    }
}

/// Manages enabling and disabling of the end-effector cluster and grabbed
/// bodies across the two collision phases of validation.
///
/// When end-effector collisions are ignored, the cluster is disabled for
/// environment checks and re-enabled for self-collision checks; a pair filter
/// is installed for the latter so child-vs-independent contacts (exactly the
/// ones the disabled cluster would have had with the world) stay ignored.
/// Enable flags are snapshotted lazily on the first transition and restored
/// on drop.
pub(crate) struct StateCheckEndEffector<'a, T: IkReal> {
    manip: &'a dyn Manipulator<T>,
    child_links: &'a [LinkId],
    independent_links: &'a [LinkId],
    check_end_effector_collision: bool,
    disabled: bool,
    savers_initialized: bool,
    saved_link_enabled: Vec<bool>,
    saved_grabbed: Vec<(BodyId, bool)>,
    callback_handle: Option<CallbackHandle>,
}

impl<'a, T: IkReal> StateCheckEndEffector<'a, T> {
    pub(crate) fn new(
        manip: &'a dyn Manipulator<T>,
        child_links: &'a [LinkId],
        independent_links: &'a [LinkId],
        options: IkFilterOptions,
    ) -> Self {
        Self {
            manip,
            child_links,
            independent_links,
            check_end_effector_collision: !options
                .contains(IkFilterOptions::IGNORE_END_EFFECTOR_COLLISIONS),
            disabled: false,
            savers_initialized: false,
            saved_link_enabled: Vec::new(),
            saved_grabbed: Vec::new(),
            callback_handle: None,
        }
    }

    pub(crate) fn set_environment_collision_state(&mut self) {
        if !self.disabled && !self.check_end_effector_collision {
            self.init_savers();
            for &link in self.child_links {
                self.manip.set_link_enabled(link, false);
            }
            for &(body, _) in &self.saved_grabbed {
                self.manip.set_body_enabled(body, false);
            }
            self.disabled = true;
        }
    }

    pub(crate) fn set_self_collision_state(&mut self) {
        if self.disabled {
            self.init_savers();
            for (&link, &enabled) in self.child_links.iter().zip(&self.saved_link_enabled) {
                self.manip.set_link_enabled(link, enabled);
            }
            for &(body, enabled) in &self.saved_grabbed {
                self.manip.set_body_enabled(body, enabled);
            }
            self.disabled = false;
        }
        if !self.check_end_effector_collision && self.callback_handle.is_none() {
            self.init_savers();
            // the cluster is back on for self-collision; a pair filter keeps
            // child-vs-independent contacts out of the report
            let child: Vec<LinkId> = self.child_links.to_vec();
            let independent: Vec<LinkId> = self.independent_links.to_vec();
            let grabbed: Vec<BodyId> = self.saved_grabbed.iter().map(|g| g.0).collect();
            let callback = Arc::new(move |report: &CollisionPairReport| {
                let child1 = report.link1.is_some_and(|l| child.contains(&l));
                let child2 = report.link2.is_some_and(|l| child.contains(&l));
                let independent1 = report.link1.is_some_and(|l| independent.contains(&l));
                let independent2 = report.link2.is_some_and(|l| independent.contains(&l));
                if (child1 && independent2) || (child2 && independent1) {
                    return CollisionAction::Ignore;
                }
                // bodies attached to the cluster count as part of it
                if !independent2 && !child2 {
                    if let Some(body) = report.body2 {
                        if grabbed.contains(&body) {
                            return CollisionAction::Ignore;
                        }
                    }
                }
                if !independent1 && !child1 {
                    if let Some(body) = report.body1 {
                        if grabbed.contains(&body) {
                            return CollisionAction::Ignore;
                        }
                    }
                }
                CollisionAction::DefaultAction
            });
            self.callback_handle = Some(self.manip.register_collision_callback(callback));
        }
    }

    pub(crate) fn need_check_end_effector_collision(&self) -> bool {
        self.check_end_effector_collision
    }

    /// Marks the one-shot end-effector check as done and drops the cluster
    /// out of the environment checks.
    pub(crate) fn reset_check_end_effector_collision(&mut self) {
        self.check_end_effector_collision = false;
        self.set_environment_collision_state();
    }

    fn init_savers(&mut self) {
        if self.savers_initialized {
            return;
        }
        self.savers_initialized = true;
        self.saved_link_enabled = self
            .child_links
            .iter()
            .map(|&link| self.manip.is_link_enabled(link))
            .collect();
        self.saved_grabbed = self
            .manip
            .grabbed_bodies()
            .into_iter()
            .map(|body| (body, self.manip.is_body_enabled(body)))
            .collect();
    }
}

impl<T: IkReal> Drop for StateCheckEndEffector<'_, T> {
    fn drop(&mut self) {
        if !self.savers_initialized {
            return;
        }
        for (&link, &enabled) in self.child_links.iter().zip(&self.saved_link_enabled) {
            self.manip.set_link_enabled(link, enabled);
        }
        for &(body, enabled) in &self.saved_grabbed {
            self.manip.set_body_enabled(body, enabled);
        }
    }
}

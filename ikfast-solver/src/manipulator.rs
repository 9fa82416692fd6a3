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
//! Seam to the robot/collision runtime the solver drives.
//!
//! The shell never owns a kinematic body; it talks to one through
//! [`Manipulator`]. Implementations are expected to use interior mutability
//! (the solver calls everything through `&self`) and stay consistent with the
//! callback contract documented on [`Manipulator::check_self_collision`].

use std::{any::Any, sync::Arc};

use bitflags::bitflags;

use crate::{IkParameterization, IkParameterizationType, IkReal};

/// Opaque identifier of a robot link inside the bound runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub usize);

/// Opaque identifier of a body (e.g. a grabbed object) inside the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyId(pub usize);

/// Axis class of one driven joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointKind {
    Revolute {
        /// Circular joints have no meaningful limits and never unwrap.
        circular: bool,
    },
    Prismatic,
}

impl JointKind {
    pub fn is_revolute(self) -> bool {
        matches!(self, Self::Revolute { .. })
    }

    pub fn is_circular(self) -> bool {
        matches!(self, Self::Revolute { circular: true })
    }
}

/// Verdict of a collision callback for one candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionAction {
    DefaultAction,
    Ignore,
}

/// The pair of links (and their parent bodies) a collision check reported.
#[derive(Debug, Clone, Default)]
pub struct CollisionPairReport {
    pub link1: Option<LinkId>,
    pub link2: Option<LinkId>,
    /// Parent body of `link1`, when the link belongs to a non-robot body.
    pub body1: Option<BodyId>,
    pub body2: Option<BodyId>,
}

bitflags! {
    /// Options of the runtime's collision checker the solver toggles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CollisionOptions: u32 {
        /// Restrict checks to links affected by the active joints.
        const ACTIVE_DOFS = 0x1;
    }
}

/// Pair filter installed for the duration of a state guard.
pub type CollisionCallback = Arc<dyn Fn(&CollisionPairReport) -> CollisionAction + Send + Sync>;

/// Notification hook, e.g. for joint-limit changes.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Registration handle; dropping it must unregister the callback.
pub type CallbackHandle = Box<dyn Any + Send + Sync>;

/// One manipulator of a robot, bound together with its environment.
///
/// All joint-indexed data below runs over the *arm* joints, in driving order.
pub trait Manipulator<T: IkReal>: Send + Sync {
    fn robot_name(&self) -> String;
    fn name(&self) -> String;

    /// Robot DOF indices of the driven joints, in chain order.
    fn arm_indices(&self) -> Vec<usize>;
    fn arm_dof(&self) -> usize {
        self.arm_indices().len()
    }
    fn arm_joint_kinds(&self) -> Vec<JointKind>;
    fn arm_joint_limits(&self) -> (Vec<T>, Vec<T>);
    /// Per-joint distance weights used for solution ranking.
    fn arm_joint_weights(&self) -> Vec<T>;
    fn arm_joint_values(&self) -> Vec<T>;
    fn set_arm_joint_values(&self, values: &[T]);
    /// Element-wise `q1 - q2`, taking the shortest way around for circular
    /// joints.
    fn subtract_arm_joint_values(&self, q1: &[T], q2: &[T]) -> Vec<T>;

    /// Serialized hash of the kinematics structure, used to detect a kernel
    /// generated for a different chain.
    fn kinematics_hash(&self) -> String;

    /// Links strictly downstream of the last driven joint.
    fn child_links(&self) -> Vec<LinkId>;
    /// Links unaffected by the driven joints.
    fn independent_links(&self) -> Vec<LinkId>;
    /// Bodies currently grabbed by one of the child links.
    fn grabbed_bodies(&self) -> Vec<BodyId>;

    fn is_link_enabled(&self, link: LinkId) -> bool;
    fn set_link_enabled(&self, link: LinkId, enabled: bool);
    fn is_body_enabled(&self, body: BodyId) -> bool;
    fn set_body_enabled(&self, body: BodyId, enabled: bool);

    /// End-effector parameterization of the given flavor for the *current*
    /// joint values, in the same frame as the solve target.
    fn ee_parameterization(&self, kind: IkParameterizationType) -> IkParameterization<T>;

    /// Robot-vs-itself collision state at the current joint values.
    ///
    /// Implementations must route every candidate pair through the callbacks
    /// registered via [`Self::register_collision_callback`] and skip pairs for
    /// which any callback answers [`CollisionAction::Ignore`].
    fn check_self_collision(&self) -> Option<CollisionPairReport>;
    /// Robot-vs-environment collision state; disabled links and bodies do not
    /// collide.
    fn check_env_collision(&self) -> Option<CollisionPairReport>;
    /// Collision state of the end-effector cluster alone at its current pose.
    fn check_end_effector_collision(&self) -> bool;

    fn collision_options(&self) -> CollisionOptions;
    fn set_collision_options(&self, options: CollisionOptions);

    fn register_collision_callback(&self, callback: CollisionCallback) -> CallbackHandle;
    fn register_joint_limits_callback(&self, callback: ChangeCallback) -> CallbackHandle;
}

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
//! Tagged, possibly partial specifications of an end-effector pose.
//!
//! A generated kernel is built for exactly one flavor; the solver checks the
//! tag at every entry point and the kernel adapter packs the payload into the
//! scalar arrays the kernel expects.

use nalgebra as na;

use na::{Unit, UnitQuaternion, Vector2, Vector3};

use crate::IkReal;

/// Flavor tag of an [`IkParameterization`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum IkParameterizationType {
    /// Full 6D pose, the normative case.
    Transform6D,
    Rotation3D,
    Translation3D,
    Direction3D,
    Ray4D,
    Lookat3D,
    TranslationDirection5D,
    TranslationXY2D,
    TranslationXYOrientation3D,
    TranslationLocalGlobal6D,
    TranslationXAxisAngle4D,
    TranslationYAxisAngle4D,
    TranslationZAxisAngle4D,
    TranslationXAxisAngleZNorm4D,
    TranslationYAxisAngleXNorm4D,
    TranslationZAxisAngleYNorm4D,
}

impl IkParameterizationType {
    /// Number of end-effector degrees of freedom this flavor pins down.
    pub fn dof(self) -> usize {
        match self {
            Self::Transform6D | Self::TranslationLocalGlobal6D => 6,
            Self::TranslationDirection5D => 5,
            Self::Ray4D
            | Self::TranslationXAxisAngle4D
            | Self::TranslationYAxisAngle4D
            | Self::TranslationZAxisAngle4D
            | Self::TranslationXAxisAngleZNorm4D
            | Self::TranslationYAxisAngleXNorm4D
            | Self::TranslationZAxisAngleYNorm4D => 4,
            Self::Rotation3D | Self::Translation3D | Self::TranslationXYOrientation3D => 3,
            Self::Direction3D | Self::Lookat3D | Self::TranslationXY2D => 2,
        }
    }
}

/// A target (or forward-kinematics-derived) end-effector pose in one of the
/// supported flavors.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum IkParameterization<T: IkReal> {
    Transform6D(na::Isometry3<T>),
    Rotation3D(UnitQuaternion<T>),
    Translation3D(Vector3<T>),
    Direction3D(Unit<Vector3<T>>),
    Ray4D {
        origin: Vector3<T>,
        dir: Unit<Vector3<T>>,
    },
    Lookat3D(Vector3<T>),
    TranslationDirection5D {
        origin: Vector3<T>,
        dir: Unit<Vector3<T>>,
    },
    TranslationXY2D(Vector2<T>),
    TranslationXYOrientation3D {
        xy: Vector2<T>,
        angle: T,
    },
    TranslationLocalGlobal6D {
        local: Vector3<T>,
        global: Vector3<T>,
    },
    TranslationXAxisAngle4D {
        origin: Vector3<T>,
        angle: T,
    },
    TranslationYAxisAngle4D {
        origin: Vector3<T>,
        angle: T,
    },
    TranslationZAxisAngle4D {
        origin: Vector3<T>,
        angle: T,
    },
    TranslationXAxisAngleZNorm4D {
        origin: Vector3<T>,
        angle: T,
    },
    TranslationYAxisAngleXNorm4D {
        origin: Vector3<T>,
        angle: T,
    },
    TranslationZAxisAngleYNorm4D {
        origin: Vector3<T>,
        angle: T,
    },
}

impl<T: IkReal> IkParameterization<T> {
    pub fn kind(&self) -> IkParameterizationType {
        match self {
            Self::Transform6D(_) => IkParameterizationType::Transform6D,
            Self::Rotation3D(_) => IkParameterizationType::Rotation3D,
            Self::Translation3D(_) => IkParameterizationType::Translation3D,
            Self::Direction3D(_) => IkParameterizationType::Direction3D,
            Self::Ray4D { .. } => IkParameterizationType::Ray4D,
            Self::Lookat3D(_) => IkParameterizationType::Lookat3D,
            Self::TranslationDirection5D { .. } => IkParameterizationType::TranslationDirection5D,
            Self::TranslationXY2D(_) => IkParameterizationType::TranslationXY2D,
            Self::TranslationXYOrientation3D { .. } => {
                IkParameterizationType::TranslationXYOrientation3D
            }
            Self::TranslationLocalGlobal6D { .. } => {
                IkParameterizationType::TranslationLocalGlobal6D
            }
            Self::TranslationXAxisAngle4D { .. } => IkParameterizationType::TranslationXAxisAngle4D,
            Self::TranslationYAxisAngle4D { .. } => IkParameterizationType::TranslationYAxisAngle4D,
            Self::TranslationZAxisAngle4D { .. } => IkParameterizationType::TranslationZAxisAngle4D,
            Self::TranslationXAxisAngleZNorm4D { .. } => {
                IkParameterizationType::TranslationXAxisAngleZNorm4D
            }
            Self::TranslationYAxisAngleXNorm4D { .. } => {
                IkParameterizationType::TranslationYAxisAngleXNorm4D
            }
            Self::TranslationZAxisAngleYNorm4D { .. } => {
                IkParameterizationType::TranslationZAxisAngleYNorm4D
            }
        }
    }

    pub fn dof(&self) -> usize {
        self.kind().dof()
    }

    /// Squared workspace distance to `other`, which must carry the same tag.
    ///
    /// Rotational terms are measured in radians so they combine with metric
    /// translation terms on roughly equal footing; the solver only compares
    /// the result against the ik threshold of an accepted solution, where both
    /// terms are near zero.
    pub fn distance_sqr(&self, other: &Self) -> T {
        match (self, other) {
            (Self::Transform6D(a), Self::Transform6D(b)) => {
                let t = (a.translation.vector - b.translation.vector).norm_squared();
                let r = a.rotation.angle_to(&b.rotation);
                t + r * r
            }
            (Self::Rotation3D(a), Self::Rotation3D(b)) => {
                let r = a.angle_to(b);
                r * r
            }
            (Self::Translation3D(a), Self::Translation3D(b)) => (a - b).norm_squared(),
            (Self::Direction3D(a), Self::Direction3D(b)) => {
                let r = direction_angle(a, b);
                r * r
            }
            (
                Self::Ray4D {
                    origin: ao,
                    dir: ad,
                },
                Self::Ray4D {
                    origin: bo,
                    dir: bd,
                },
            )
            | (
                Self::TranslationDirection5D {
                    origin: ao,
                    dir: ad,
                },
                Self::TranslationDirection5D {
                    origin: bo,
                    dir: bd,
                },
            ) => {
                let r = direction_angle(ad, bd);
                (ao - bo).norm_squared() + r * r
            }
            (Self::Lookat3D(a), Self::Lookat3D(b)) => (a - b).norm_squared(),
            (Self::TranslationXY2D(a), Self::TranslationXY2D(b)) => (a - b).norm_squared(),
            (
                Self::TranslationXYOrientation3D { xy: axy, angle: aa },
                Self::TranslationXYOrientation3D { xy: bxy, angle: ba },
            ) => {
                let r = angle_diff(*aa, *ba);
                (axy - bxy).norm_squared() + r * r
            }
            (
                Self::TranslationLocalGlobal6D {
                    local: al,
                    global: ag,
                },
                Self::TranslationLocalGlobal6D {
                    local: bl,
                    global: bg,
                },
            ) => (al - bl).norm_squared() + (ag - bg).norm_squared(),
            (
                Self::TranslationXAxisAngle4D {
                    origin: ao,
                    angle: aa,
                },
                Self::TranslationXAxisAngle4D {
                    origin: bo,
                    angle: ba,
                },
            )
            | (
                Self::TranslationYAxisAngle4D {
                    origin: ao,
                    angle: aa,
                },
                Self::TranslationYAxisAngle4D {
                    origin: bo,
                    angle: ba,
                },
            )
            | (
                Self::TranslationZAxisAngle4D {
                    origin: ao,
                    angle: aa,
                },
                Self::TranslationZAxisAngle4D {
                    origin: bo,
                    angle: ba,
                },
            )
            | (
                Self::TranslationXAxisAngleZNorm4D {
                    origin: ao,
                    angle: aa,
                },
                Self::TranslationXAxisAngleZNorm4D {
                    origin: bo,
                    angle: ba,
                },
            )
            | (
                Self::TranslationYAxisAngleXNorm4D {
                    origin: ao,
                    angle: aa,
                },
                Self::TranslationYAxisAngleXNorm4D {
                    origin: bo,
                    angle: ba,
                },
            )
            | (
                Self::TranslationZAxisAngleYNorm4D {
                    origin: ao,
                    angle: aa,
                },
                Self::TranslationZAxisAngleYNorm4D {
                    origin: bo,
                    angle: ba,
                },
            ) => {
                let r = angle_diff(*aa, *ba);
                (ao - bo).norm_squared() + r * r
            }
            // mismatched tags never get close
            _ => na::convert(1e30),
        }
    }
}

/// Difference `a - b` wrapped into `(-pi, pi]`.
pub(crate) fn angle_diff<T: IkReal>(a: T, b: T) -> T {
    let d = a - b;
    d.sin().atan2(d.cos())
}

fn direction_angle<T: IkReal>(a: &Unit<Vector3<T>>, b: &Unit<Vector3<T>>) -> T {
    let dot = na::clamp(a.dot(b), -T::one(), T::one());
    dot.acos()
}

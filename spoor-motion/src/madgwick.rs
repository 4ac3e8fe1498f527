use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use spoor_types::MyFloat;

const ACCEL_EPS: MyFloat = 1e-9;

/// Madgwick complementary orientation filter (IMU form, no magnetometer).
///
/// Gyro rates are integrated exactly; the accelerometer correction is a
/// normalized gradient-descent step toward the gravity-consistent
/// orientation, scaled by the filter gain. With gain zero the filter is pure
/// gyro integration.
#[derive(Debug, Clone)]
pub struct MadgwickFilter {
    q: UnitQuaternion<MyFloat>,
    beta: MyFloat,
}

impl MadgwickFilter {
    pub fn new(beta: MyFloat) -> Self {
        Self {
            q: UnitQuaternion::identity(),
            beta,
        }
    }

    pub fn quaternion(&self) -> UnitQuaternion<MyFloat> {
        self.q
    }

    pub fn reset(&mut self) {
        self.q = UnitQuaternion::identity();
    }

    /// Advance the filter by one sample: `gyro` in rad/s, `accel` in m/s^2
    /// (only its direction is used), `dt` in seconds.
    pub fn update(&mut self, gyro: &Vector3<MyFloat>, accel: &Vector3<MyFloat>, dt: MyFloat) {
        // exact gyro integration, body rates applied on the right
        let mut q = self.q * UnitQuaternion::from_scaled_axis(gyro * dt);

        let norm = accel.norm();
        if self.beta > 0.0 && norm > ACCEL_EPS {
            let a = accel / norm;
            let (q0, q1, q2, q3) = (q.w, q.i, q.j, q.k);

            // objective: rotated gravity minus measured direction
            let f1 = 2.0 * (q1 * q3 - q0 * q2) - a.x;
            let f2 = 2.0 * (q0 * q1 + q2 * q3) - a.y;
            let f3 = 2.0 * (0.5 - q1 * q1 - q2 * q2) - a.z;

            // gradient J^T f
            let s0 = -2.0 * q2 * f1 + 2.0 * q1 * f2;
            let s1 = 2.0 * q3 * f1 + 2.0 * q0 * f2 - 4.0 * q1 * f3;
            let s2 = -2.0 * q0 * f1 + 2.0 * q3 * f2 - 4.0 * q2 * f3;
            let s3 = 2.0 * q1 * f1 + 2.0 * q2 * f2;

            let s_norm = (s0 * s0 + s1 * s1 + s2 * s2 + s3 * s3).sqrt();
            if s_norm > ACCEL_EPS {
                let scale = self.beta * dt / s_norm;
                let corrected = Quaternion::new(
                    q0 - scale * s0,
                    q1 - scale * s1,
                    q2 - scale * s2,
                    q3 - scale * s3,
                );
                q = UnitQuaternion::from_quaternion(corrected);
            }
        }

        self.q = q;
    }
}

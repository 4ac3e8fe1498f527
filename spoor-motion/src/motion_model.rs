use nalgebra::{Isometry3, Matrix6, Translation3, UnitQuaternion, Vector3, Vector6};

use adskalman::{
    CovarianceUpdateMethod, ObservationModel, StateAndCovariance, TransitionModelLinearNoControl,
};
use nalgebra::U6;

use spoor_types::{ImuSample, MyFloat};

use crate::constant_velocity::ConstantVelocityModel;
use crate::madgwick::MadgwickFilter;
use crate::translation_ekf::{constant_velocity_for_dt, PositionObservationModel};

const DEFAULT_DT: MyFloat = 1.0 / 30.0;
const MOTION_NOISE_SCALE: MyFloat = 0.5;
const OBSERVATION_NOISE: MyFloat = 1e-3;
const INITIAL_POSITION_VAR: MyFloat = 1e-2;
const INITIAL_VELOCITY_VAR: MyFloat = 1.0;

/// IMU-driven motion model.
///
/// Translation runs through a constant-velocity EKF observed with the camera
/// center of each tracked pose; rotation is extrapolated from the last two
/// tracked poses. The inertial samples feed a Madgwick filter whose absolute
/// gravity-referenced orientation backs the tracker's curve test.
#[derive(Debug)]
pub struct ImuModel {
    est: Option<StateAndCovariance<MyFloat, U6>>,
    rotation_delta: Option<UnitQuaternion<MyFloat>>,
    last_rotation: Option<UnitQuaternion<MyFloat>>,
    last_dt: MyFloat,
    orientation: MadgwickFilter,
}

impl ImuModel {
    pub fn new(madgwick_gain: MyFloat) -> Self {
        Self {
            est: None,
            rotation_delta: None,
            last_rotation: None,
            last_dt: DEFAULT_DT,
            orientation: MadgwickFilter::new(madgwick_gain),
        }
    }

    pub fn started(&self) -> bool {
        self.est.is_some()
    }

    pub fn restart(&mut self) {
        self.est = None;
        self.rotation_delta = None;
        self.last_rotation = None;
        self.last_dt = DEFAULT_DT;
        self.orientation.reset();
    }

    /// Feed one inertial sample taken `dt` seconds after the previous one.
    pub fn ingest(&mut self, imu: &ImuSample, dt: MyFloat) {
        self.orientation.update(&imu.gyro, &imu.accel, dt);
        if dt > 0.0 {
            self.last_dt = dt;
        }
    }

    /// Absolute orientation estimate of the Madgwick filter.
    pub fn orientation(&self) -> UnitQuaternion<MyFloat> {
        self.orientation.quaternion()
    }

    pub fn update(&mut self, t_cw: &Isometry3<MyFloat>) {
        let center = t_cw.inverse().translation.vector;
        self.est = Some(match self.est.take() {
            None => {
                let state = Vector6::new(center.x, center.y, center.z, 0.0, 0.0, 0.0);
                let mut covar = INITIAL_POSITION_VAR * Matrix6::<MyFloat>::identity();
                for i in 3..6 {
                    covar[(i, i)] = INITIAL_VELOCITY_VAR;
                }
                StateAndCovariance::new(state, covar)
            }
            Some(prev) => {
                let motion = constant_velocity_for_dt(MOTION_NOISE_SCALE, self.last_dt);
                let prior = motion.predict(&prev);
                let obs_model = PositionObservationModel::new(OBSERVATION_NOISE);
                match obs_model.update(&prior, &center, CovarianceUpdateMethod::JosephForm) {
                    Ok(posterior) => posterior,
                    Err(_) => prior,
                }
            }
        });
        self.rotation_delta = self
            .last_rotation
            .map(|prev| t_cw.rotation * prev.inverse());
        self.last_rotation = Some(t_cw.rotation);
    }

    pub fn predict(&self, last_t_cw: &Isometry3<MyFloat>) -> Isometry3<MyFloat> {
        let rotation = match &self.rotation_delta {
            Some(delta) => delta * last_t_cw.rotation,
            None => last_t_cw.rotation,
        };
        let center = match &self.est {
            Some(est) => {
                let motion = constant_velocity_for_dt(MOTION_NOISE_SCALE, self.last_dt);
                let prior = motion.predict(est);
                Vector3::new(prior.state()[0], prior.state()[1], prior.state()[2])
            }
            None => last_t_cw.inverse().translation.vector,
        };
        Isometry3::from_parts(Translation3::from(-(rotation * center)), rotation)
    }
}

/// The motion model variants the tracker can be configured with.
///
/// Capability set: `predict`, `update`, `restart`, `started`, plus IMU-only
/// `ingest_imu` and `orientation`.
#[derive(Debug)]
pub enum MotionModel {
    ConstantVelocity(ConstantVelocityModel),
    Imu(ImuModel),
}

impl MotionModel {
    pub fn constant_velocity() -> Self {
        MotionModel::ConstantVelocity(ConstantVelocityModel::new())
    }

    pub fn imu(madgwick_gain: MyFloat) -> Self {
        MotionModel::Imu(ImuModel::new(madgwick_gain))
    }

    pub fn started(&self) -> bool {
        match self {
            MotionModel::ConstantVelocity(m) => m.started(),
            MotionModel::Imu(m) => m.started(),
        }
    }

    pub fn restart(&mut self) {
        match self {
            MotionModel::ConstantVelocity(m) => m.restart(),
            MotionModel::Imu(m) => m.restart(),
        }
    }

    pub fn update(&mut self, t_cw: &Isometry3<MyFloat>) {
        match self {
            MotionModel::ConstantVelocity(m) => m.update(t_cw),
            MotionModel::Imu(m) => m.update(t_cw),
        }
    }

    pub fn predict(&self, last_t_cw: &Isometry3<MyFloat>) -> Isometry3<MyFloat> {
        match self {
            MotionModel::ConstantVelocity(m) => m.predict(last_t_cw),
            MotionModel::Imu(m) => m.predict(last_t_cw),
        }
    }

    /// Feed an inertial sample. No-op for the constant-velocity variant.
    pub fn ingest_imu(&mut self, imu: &ImuSample, dt: MyFloat) {
        if let MotionModel::Imu(m) = self {
            m.ingest(imu, dt);
        }
    }

    /// Absolute orientation, available only in the IMU variant.
    pub fn orientation(&self) -> Option<UnitQuaternion<MyFloat>> {
        match self {
            MotionModel::ConstantVelocity(_) => None,
            MotionModel::Imu(m) => Some(m.orientation()),
        }
    }
}

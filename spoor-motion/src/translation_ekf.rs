use num_traits::{One, Zero};

use nalgebra::{OMatrix, OVector, RealField, U3, U6};

use adskalman::{ObservationModel, TransitionModelLinearNoControl};

/// Constant-velocity transition over [x y z xvel yvel zvel] for a fixed `dt`.
#[derive(Debug)]
pub struct TranslationTransitionModel<R: RealField> {
    transition_model: OMatrix<R, U6, U6>,
    transition_model_transpose: OMatrix<R, U6, U6>,
    transition_noise_covariance: OMatrix<R, U6, U6>,
}

/// Build the transition model for a specific `dt`.
pub fn constant_velocity_for_dt<R: RealField + Copy>(
    motion_noise_scale: R,
    dt: R,
) -> TranslationTransitionModel<R> {
    let zero: R = Zero::zero();
    let one: R = One::one();
    let two: R = one + one;
    let three: R = two + one;

    // This is "A" in most Kalman filter descriptions.
    #[rustfmt::skip]
    let transition_model = OMatrix::<R, U6, U6>::from_row_slice(
                      &[one, zero, zero,   dt, zero, zero,
                     zero,  one, zero, zero,   dt, zero,
                     zero, zero,  one, zero, zero,   dt,
                     zero, zero, zero,  one, zero, zero,
                     zero, zero, zero, zero,  one, zero,
                     zero, zero, zero, zero, zero,  one]);
    let transition_model_transpose = transition_model.transpose();

    let t33 = (dt * dt * dt) / three;
    let t22 = (dt * dt) / two;

    // This is "Q" in most Kalman filter descriptions.
    #[rustfmt::skip]
    let transition_noise_covariance = OMatrix::<R, U6, U6>::from_row_slice(
                    &[t33,  zero, zero, t22, zero,  zero,
                    zero,  t33, zero, zero,  t22, zero,
                    zero, zero,  t33, zero, zero,  t22,
                    t22,  zero, zero,   dt, zero, zero,
                    zero,  t22, zero, zero,   dt, zero,
                    zero, zero,  t22, zero, zero,   dt]) * motion_noise_scale;

    TranslationTransitionModel {
        transition_model,
        transition_model_transpose,
        transition_noise_covariance,
    }
}

impl<R: RealField> TransitionModelLinearNoControl<R, U6> for TranslationTransitionModel<R> {
    fn F(&self) -> &OMatrix<R, U6, U6> {
        &self.transition_model
    }
    fn FT(&self) -> &OMatrix<R, U6, U6> {
        &self.transition_model_transpose
    }
    fn Q(&self) -> &OMatrix<R, U6, U6> {
        &self.transition_noise_covariance
    }
}

/// Direct observation of the position block of the state.
#[derive(Debug)]
pub struct PositionObservationModel<R: RealField> {
    observation_matrix: OMatrix<R, U3, U6>,
    observation_matrix_transpose: OMatrix<R, U6, U3>,
    observation_noise_covariance: OMatrix<R, U3, U3>,
}

impl<R: RealField + Copy> PositionObservationModel<R> {
    pub fn new(observation_noise: R) -> Self {
        let observation_matrix = {
            let mut h = OMatrix::<R, U3, U6>::zeros();
            h.fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&OMatrix::<R, U3, U3>::identity());
            h
        };
        let observation_matrix_transpose = observation_matrix.transpose();
        let observation_noise_covariance =
            OMatrix::<R, U3, U3>::identity() * observation_noise;
        Self {
            observation_matrix,
            observation_matrix_transpose,
            observation_noise_covariance,
        }
    }
}

impl<R: RealField + Copy> ObservationModel<R, U6, U3> for PositionObservationModel<R> {
    fn H(&self) -> &OMatrix<R, U3, U6> {
        &self.observation_matrix
    }
    fn HT(&self) -> &OMatrix<R, U6, U3> {
        &self.observation_matrix_transpose
    }
    fn R(&self) -> &OMatrix<R, U3, U3> {
        &self.observation_noise_covariance
    }
    fn predict_observation(&self, state: &OVector<R, U6>) -> OVector<R, U3> {
        self.observation_matrix * state
    }
}

//! Camera geometry for the spoor visual tracking front-end.
//!
//! A single pinhole camera with Plumb-Bob distortion, wrapped around
//! `opencv_ros_camera::RosOpenCvIntrinsics`. Detected keypoints arrive in
//! distorted pixel coordinates and are undistorted once, at frame
//! construction; all projection afterwards is pure pinhole on undistorted
//! coordinates.

use nalgebra::{Isometry3, OMatrix, Point2, Point3, Vector5, U1, U2};
use thiserror::Error;

use opencv_ros_camera::{Distortion, RosOpenCvIntrinsics};

use spoor_types::{CameraParams, MyFloat};

#[derive(Error, Debug)]
pub enum MvgError {
    #[error("bad intrinsic parameters")]
    BadIntrinsics,
    #[error("bad image size")]
    BadImageSize,
}

pub type Result<M> = std::result::Result<M, MvgError>;

/// A pixel location in raw (distorted) image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistortedPixel {
    pub coords: Point2<MyFloat>,
}

/// A pixel location with lens distortion removed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UndistortedPixel {
    pub coords: Point2<MyFloat>,
}

/// World-frame position of a camera given its world-to-camera transform.
pub fn camera_center(t_cw: &Isometry3<MyFloat>) -> Point3<MyFloat> {
    Point3::from(t_cw.inverse().translation.vector)
}

/// Pinhole camera with Plumb-Bob distortion.
#[derive(Debug, Clone)]
pub struct PinholeCamera {
    width: u32,
    height: u32,
    fx: MyFloat,
    fy: MyFloat,
    cx: MyFloat,
    cy: MyFloat,
    inv_fx: MyFloat,
    inv_fy: MyFloat,
    fps: MyFloat,
    bf: MyFloat,
    intrinsics: RosOpenCvIntrinsics<MyFloat>,
}

impl PinholeCamera {
    pub fn new(params: &CameraParams) -> Result<Self> {
        if params.width == 0 || params.height == 0 {
            return Err(MvgError::BadImageSize);
        }
        if !(params.fx > 0.0) || !(params.fy > 0.0) {
            return Err(MvgError::BadIntrinsics);
        }
        let distortion = Distortion::from_opencv_vec(Vector5::new(
            params.k1, params.k2, params.p1, params.p2, params.k3,
        ));
        let intrinsics = RosOpenCvIntrinsics::from_params_with_distortion(
            params.fx, 0.0, params.fy, params.cx, params.cy, distortion,
        );
        Ok(Self {
            width: params.width,
            height: params.height,
            fx: params.fx,
            fy: params.fy,
            cx: params.cx,
            cy: params.cy,
            inv_fx: 1.0 / params.fx,
            inv_fy: 1.0 / params.fy,
            fps: params.fps,
            bf: params.bf,
            intrinsics,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fx(&self) -> MyFloat {
        self.fx
    }

    pub fn fy(&self) -> MyFloat {
        self.fy
    }

    pub fn cx(&self) -> MyFloat {
        self.cx
    }

    pub fn cy(&self) -> MyFloat {
        self.cy
    }

    pub fn fps(&self) -> MyFloat {
        self.fps
    }

    /// Stereo baseline times fx. Zero for a monocular camera.
    pub fn bf(&self) -> MyFloat {
        self.bf
    }

    pub fn intrinsics(&self) -> &RosOpenCvIntrinsics<MyFloat> {
        &self.intrinsics
    }

    pub fn contains(&self, px: &Point2<MyFloat>) -> bool {
        px.x >= 0.0 && px.x < self.width as MyFloat && px.y >= 0.0 && px.y < self.height as MyFloat
    }

    /// Remove lens distortion from a raw pixel observation.
    pub fn undistort(&self, px: &DistortedPixel) -> UndistortedPixel {
        let distorted = cam_geom::Pixels {
            data: OMatrix::<MyFloat, U1, U2>::new(px.coords.x, px.coords.y),
        };
        let undistorted = self.intrinsics.undistort(&distorted);
        UndistortedPixel {
            coords: Point2::new(undistorted.data[(0, 0)], undistorted.data[(0, 1)]),
        }
    }

    /// Project a camera-frame point. `None` if it is behind the camera or
    /// lands outside the image.
    pub fn project_camera_point(&self, xc: &Point3<MyFloat>) -> Option<UndistortedPixel> {
        if xc.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / xc.z;
        let coords = Point2::new(
            self.fx * xc.x * inv_z + self.cx,
            self.fy * xc.y * inv_z + self.cy,
        );
        if self.contains(&coords) {
            Some(UndistortedPixel { coords })
        } else {
            None
        }
    }

    /// Project a world-frame point through `t_cw` (world to camera).
    pub fn project(
        &self,
        t_cw: &Isometry3<MyFloat>,
        xw: &Point3<MyFloat>,
    ) -> Option<UndistortedPixel> {
        self.project_camera_point(&(t_cw * xw))
    }

    /// Back-project an undistorted pixel with known depth into the camera
    /// frame.
    pub fn unproject(&self, px: &UndistortedPixel, depth: MyFloat) -> Point3<MyFloat> {
        Point3::new(
            (px.coords.x - self.cx) * depth * self.inv_fx,
            (px.coords.y - self.cy) * depth * self.inv_fy,
            depth,
        )
    }

    /// Back-project an undistorted pixel with known depth into the world
    /// frame of `t_cw`.
    pub fn unproject_world(
        &self,
        t_cw: &Isometry3<MyFloat>,
        px: &UndistortedPixel,
        depth: MyFloat,
    ) -> Point3<MyFloat> {
        t_cw.inverse_transform_point(&self.unproject(px, depth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion, Vector3};
    use spoor_types::CameraParams;

    fn test_params() -> CameraParams {
        CameraParams {
            width: 640,
            height: 480,
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
            fps: 30.0,
            bf: 40.0,
        }
    }

    #[test]
    fn undistort_is_identity_without_distortion() {
        let cam = PinholeCamera::new(&test_params()).unwrap();
        let raw = DistortedPixel {
            coords: Point2::new(123.4, 301.7),
        };
        let und = cam.undistort(&raw);
        assert_relative_eq!(und.coords.x, raw.coords.x, epsilon = 1e-9);
        assert_relative_eq!(und.coords.y, raw.coords.y, epsilon = 1e-9);
    }

    #[test]
    fn project_unproject_roundtrip() {
        let cam = PinholeCamera::new(&test_params()).unwrap();
        let t_cw = Isometry3::from_parts(
            Translation3::new(0.1, -0.2, 0.3),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.02, 0.0)),
        );
        let xw = Point3::new(0.4, -0.1, 2.5);
        let px = cam.project(&t_cw, &xw).unwrap();
        let depth = (t_cw * xw).z;
        let back = cam.unproject_world(&t_cw, &px, depth);
        assert_relative_eq!(back.x, xw.x, epsilon = 1e-9);
        assert_relative_eq!(back.y, xw.y, epsilon = 1e-9);
        assert_relative_eq!(back.z, xw.z, epsilon = 1e-9);
    }

    #[test]
    fn points_behind_camera_do_not_project() {
        let cam = PinholeCamera::new(&test_params()).unwrap();
        let t_cw = Isometry3::identity();
        assert!(cam.project(&t_cw, &Point3::new(0.0, 0.0, -1.0)).is_none());
        // in front but far outside the image
        assert!(cam.project(&t_cw, &Point3::new(50.0, 0.0, 1.0)).is_none());
    }

    #[test]
    fn camera_center_inverts_the_pose() {
        let t_cw = Isometry3::from_parts(
            Translation3::new(1.0, 2.0, 3.0),
            UnitQuaternion::identity(),
        );
        let c = camera_center(&t_cw);
        assert_relative_eq!(c.x, -1.0, epsilon = 1e-12);
        assert_relative_eq!(c.y, -2.0, epsilon = 1e-12);
        assert_relative_eq!(c.z, -3.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_degenerate_intrinsics() {
        let mut p = test_params();
        p.fx = 0.0;
        assert!(PinholeCamera::new(&p).is_err());
    }
}

//! spoor: the tracking front-end of a visual SLAM pipeline.
//!
//! Per-frame 6-DoF pose estimation over a stream of grayscale frames
//! (optionally with registered depth or inertial samples), keyframe promotion
//! into a shared covisibility map, and recovery from tracking loss. Feature
//! extraction, nonlinear optimization, direct image alignment and the
//! local-mapping thread body are injected collaborators; see
//! [`external`].

pub mod config;
mod error;
pub mod external;
pub mod frame;
pub mod initializer;
pub mod keyframe_policy;
pub mod local_mapper;
pub mod map;
pub mod map_point;
pub mod matcher;
pub mod tracker;
pub mod trajectory;

pub use config::SlamConfig;
pub use error::{Error, Result};
pub use frame::{DepthImage, Descriptor, Frame, KeyPoint};
pub use local_mapper::{local_mapper_channel, LocalMapperHandle};
pub use map::{KeyFrame, KeyFrameHandle, Map, MapInner, MapPointHandle};
pub use map_point::MapPoint;
pub use tracker::{Externals, Tracker, TrackingState};
pub use trajectory::{save_trajectory, TrajectoryEntry};

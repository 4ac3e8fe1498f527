//! Typed configuration loaded from a flat OpenCV-style YAML file
//! (`Camera.fx: 517.3`, `ORBextractor.nLevels: 8`, ...).

use std::path::Path;

use serde::{Deserialize, Serialize};

use spoor_types::{CameraParams, MyFloat, OrbParams};

use crate::error::{Error, Result};

fn default_th_depth() -> MyFloat {
    35.0
}

fn default_depth_map_factor() -> MyFloat {
    1.0
}

fn default_madgwick_gain() -> MyFloat {
    0.1
}

fn default_n_features() -> usize {
    1000
}

fn default_scale_factor() -> MyFloat {
    1.2
}

fn default_n_levels() -> usize {
    8
}

fn default_ini_th_fast() -> u8 {
    20
}

fn default_min_th_fast() -> u8 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlamConfig {
    #[serde(rename = "Camera.w")]
    pub width: u32,
    #[serde(rename = "Camera.h")]
    pub height: u32,
    #[serde(rename = "Camera.fx")]
    pub fx: MyFloat,
    #[serde(rename = "Camera.fy")]
    pub fy: MyFloat,
    #[serde(rename = "Camera.cx")]
    pub cx: MyFloat,
    #[serde(rename = "Camera.cy")]
    pub cy: MyFloat,
    #[serde(rename = "Camera.k1", default)]
    pub k1: MyFloat,
    #[serde(rename = "Camera.k2", default)]
    pub k2: MyFloat,
    #[serde(rename = "Camera.k3", default)]
    pub k3: MyFloat,
    #[serde(rename = "Camera.p1", default)]
    pub p1: MyFloat,
    #[serde(rename = "Camera.p2", default)]
    pub p2: MyFloat,
    /// 0 means unknown and falls back to 30, applied once in `normalize`.
    #[serde(rename = "Camera.fps", default)]
    pub fps: MyFloat,
    #[serde(rename = "Camera.bf", default)]
    pub bf: MyFloat,
    #[serde(rename = "ThDepth", default = "default_th_depth")]
    pub th_depth: MyFloat,
    #[serde(rename = "DepthMapFactor", default = "default_depth_map_factor")]
    pub depth_map_factor: MyFloat,
    #[serde(rename = "ORBextractor.nFeatures", default = "default_n_features")]
    pub n_features: usize,
    #[serde(rename = "ORBextractor.scaleFactor", default = "default_scale_factor")]
    pub scale_factor: MyFloat,
    #[serde(rename = "ORBextractor.nLevels", default = "default_n_levels")]
    pub n_levels: usize,
    #[serde(rename = "ORBextractor.iniThFAST", default = "default_ini_th_fast")]
    pub ini_th_fast: u8,
    #[serde(rename = "ORBextractor.minThFAST", default = "default_min_th_fast")]
    pub min_th_fast: u8,
    #[serde(rename = "UsePattern", default)]
    pub use_pattern: bool,
    #[serde(rename = "MadgwickGain", default = "default_madgwick_gain")]
    pub madgwick_gain: MyFloat,
}

impl SlamConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<SlamConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::FatalConfig(format!("cannot read {}: {e}", path.display())))?;
        let mut config: SlamConfig = serde_yaml::from_str(&text)
            .map_err(|e| Error::FatalConfig(format!("cannot parse {}: {e}", path.display())))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Apply the global fps fallback so all downstream threshold math sees
    /// the same value.
    pub fn normalize(&mut self) {
        if !(self.fps > 0.0) {
            self.fps = 30.0;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::FatalConfig("image size must be nonzero".into()));
        }
        if !(self.fx > 0.0) || !(self.fy > 0.0) {
            return Err(Error::FatalConfig("focal lengths must be positive".into()));
        }
        if !(self.scale_factor > 1.0) {
            return Err(Error::FatalConfig(
                "ORBextractor.scaleFactor must be greater than 1".into(),
            ));
        }
        if self.n_levels == 0 {
            return Err(Error::FatalConfig(
                "ORBextractor.nLevels must be at least 1".into(),
            ));
        }
        if !(self.depth_map_factor > 0.0) {
            return Err(Error::FatalConfig("DepthMapFactor must be positive".into()));
        }
        Ok(())
    }

    pub fn camera_params(&self) -> CameraParams {
        CameraParams {
            width: self.width,
            height: self.height,
            fx: self.fx,
            fy: self.fy,
            cx: self.cx,
            cy: self.cy,
            k1: self.k1,
            k2: self.k2,
            k3: self.k3,
            p1: self.p1,
            p2: self.p2,
            fps: self.fps,
            bf: self.bf,
        }
    }

    pub fn orb_params(&self) -> OrbParams {
        OrbParams {
            n_features: self.n_features,
            scale_factor: self.scale_factor,
            n_levels: self.n_levels,
            ini_th_fast: self.ini_th_fast,
            min_th_fast: self.min_th_fast,
        }
    }

    /// Keyframe admission window, in frames.
    pub fn max_frames(&self) -> u64 {
        self.fps.round().max(1.0) as u64
    }

    /// Close-point depth threshold in meters; zero disables close points.
    pub fn close_depth(&self) -> MyFloat {
        if self.bf > 0.0 {
            self.th_depth * self.bf / self.fx
        } else {
            0.0
        }
    }
}

impl Default for SlamConfig {
    fn default() -> Self {
        SlamConfig {
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
            bf: 0.0,
            th_depth: default_th_depth(),
            depth_map_factor: default_depth_map_factor(),
            n_features: default_n_features(),
            scale_factor: default_scale_factor(),
            n_levels: default_n_levels(),
            ini_th_fast: default_ini_th_fast(),
            min_th_fast: default_min_th_fast(),
            use_pattern: false,
            madgwick_gain: default_madgwick_gain(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_opencv_style_keys() {
        let text = "\
\"Camera.w\": 640
\"Camera.h\": 480
\"Camera.fx\": 517.3
\"Camera.fy\": 516.5
\"Camera.cx\": 318.6
\"Camera.cy\": 255.3
\"Camera.fps\": 0
\"ThDepth\": 40.0
\"ORBextractor.nFeatures\": 1500
";
        let mut config: SlamConfig = serde_yaml::from_str(text).unwrap();
        config.normalize();
        config.validate().unwrap();
        assert_eq!(config.width, 640);
        assert_eq!(config.n_features, 1500);
        // fps fallback applies globally
        assert_eq!(config.fps, 30.0);
        assert_eq!(config.max_frames(), 30);
        // defaults fill the omitted keys
        assert_eq!(config.n_levels, 8);
        assert_eq!(config.k1, 0.0);
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "\"Camera.w\": 640\n").unwrap();
        let err = SlamConfig::from_yaml_file(&path).unwrap_err();
        assert!(matches!(err, Error::FatalConfig(_)));
    }

    #[test]
    fn missing_file_is_fatal() {
        let err = SlamConfig::from_yaml_file("/nonexistent/slam.yaml").unwrap_err();
        assert!(matches!(err, Error::FatalConfig(_)));
    }

    #[test]
    fn close_depth_scales_with_baseline() {
        let mut config = SlamConfig::default();
        assert_eq!(config.close_depth(), 0.0);
        config.bf = 40.0;
        config.th_depth = 50.0;
        assert!((config.close_depth() - 4.0).abs() < 1e-12);
    }
}

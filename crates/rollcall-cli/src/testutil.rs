//! Engine fixtures shared by the binary's tests.

use crate::config::Config;
use image::{Rgb, RgbImage};
use rollcall_core::codec;
use rollcall_core::detector::DetectorBackend;
use rollcall_core::FacePolicy;
use std::path::Path;

/// Single-stump cascade that accepts any textured 24×24 window.
pub const TEXTURE_CASCADE: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade><stageType>BOOST</stageType><featureType>HAAR</featureType>
  <height>24</height><width>24</width>
  <stages><_>
    <maxWeakCount>1</maxWeakCount><stageThreshold>0.</stageThreshold>
    <weakClassifiers><_>
      <internalNodes>0 -1 0 -1.0e+30</internalNodes>
      <leafValues>-1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features><_><rects><_>0 0 24 24 1.</_></rects></_></features></cascade>
</opencv_storage>
"#;

/// PNG of a flat background with a seed-dependent textured block.
pub fn portrait(seed: u32) -> Vec<u8> {
    let block = 2 + seed % 5;
    let (ox, oy) = (24 + (seed * 7) % 24, 20 + (seed * 11) % 24);
    let img = RgbImage::from_fn(128, 128, |x, y| {
        if x < ox || x >= ox + 64 || y < oy || y >= oy + 72 {
            return Rgb([90, 90, 90]);
        }
        let v = (((x - ox) / block * 31 + (y - oy) / block * 17 + seed * 13) % 7) as u8;
        Rgb([v * 30, v * 25 + seed as u8, v * 20])
    });
    codec::encode_png(&img).unwrap()
}

pub fn test_config(dir: &Path, policy: FacePolicy) -> Config {
    let cascade_path = dir.join("cascade.xml");
    std::fs::write(&cascade_path, TEXTURE_CASCADE).unwrap();
    Config {
        cascade_path,
        db_path: dir.join("registry.db"),
        detector: DetectorBackend::Haar,
        distance_threshold: 0.40,
        face_policy: policy,
        scale_factor: 1.1,
        min_neighbors: 5,
        min_face_size: 30,
        scan_timeout_ms: 0,
        workers: 2,
    }
}

//! Synthetic cascades and photos shared by the unit tests.

use image::{Rgb, RgbImage};

/// 24×24 cascade with a single always-positive stump: every window that is
/// not perfectly flat is accepted.
pub const TEXTURE_CASCADE_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>24</height>
  <width>24</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 -1.0e+30</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 24 24 1.</_></rects></_></features></cascade>
</opencv_storage>
"#;

/// 24×24 cascade accepting windows whose lower half is brighter than the upper half.
pub const GRADIENT_CASCADE_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>24</height>
  <width>24</width>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 0.</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 24 12 -1.</_>
        <_>
          0 12 24 12 1.</_></rects>
      <tilted>0</tilted></_></features></cascade>
</opencv_storage>
"#;

/// A 128×128 "portrait": flat background with a textured block standing in
/// for a face. Different seeds give clearly different textures and positions.
pub fn portrait(seed: u32) -> RgbImage {
    let block = 2 + seed % 5;
    let (ox, oy) = (24 + (seed * 7) % 24, 20 + (seed * 11) % 24);
    let tint = [(seed * 53 % 256) as u8, (seed * 97 % 256) as u8, (seed * 193 % 256) as u8];

    RgbImage::from_fn(128, 128, |x, y| {
        let inside = x >= ox && x < ox + 64 && y >= oy && y < oy + 72;
        if !inside {
            return Rgb([90, 90, 90]);
        }
        let (cx, cy) = ((x - ox) / block, (y - oy) / block);
        let v = ((cx * 31 + cy * 17 + seed * 13) % 7) as u8;
        Rgb([
            tint[0].wrapping_add(v * 30),
            tint[1].wrapping_add(v * 25),
            tint[2].wrapping_add(v * 20),
        ])
    })
}

/// Featureless photo: no window passes variance normalisation.
pub fn blank(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([120, 130, 140]))
}

pub fn png(image: &RgbImage) -> Vec<u8> {
    crate::codec::encode_png(image).expect("png encode")
}

//! 学習時のデータ拡張
//!
//! 回転・平行移動・ズーム・左右反転を1回のアフィン変換で適用します。
//! 範囲外の画素は最も近い端の画素で埋めます。

use image::RgbImage;
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationConfig {
    /// 回転角の最大値（度）
    pub rotation_degrees: f32,
    /// 横方向の平行移動の最大値（幅に対する割合）
    pub width_shift: f32,
    /// 縦方向の平行移動の最大値（高さに対する割合）
    pub height_shift: f32,
    /// 拡大縮小の範囲（1 ± zoom）
    pub zoom: f32,
    pub horizontal_flip: bool,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_degrees: 20.0,
            width_shift: 0.2,
            height_shift: 0.2,
            zoom: 0.2,
            horizontal_flip: true,
        }
    }
}

pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn augment<R: Rng>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let cfg = &self.config;
        let angle = symmetric(rng, cfg.rotation_degrees).to_radians();
        let shift_x = symmetric(rng, cfg.width_shift) * img.width() as f32;
        let shift_y = symmetric(rng, cfg.height_shift) * img.height() as f32;
        let zoom_x = 1.0 + symmetric(rng, cfg.zoom);
        let zoom_y = 1.0 + symmetric(rng, cfg.zoom);
        let flip = cfg.horizontal_flip && rng.gen_bool(0.5);

        warp(img, angle, (shift_x, shift_y), (zoom_x, zoom_y), flip)
    }
}

fn symmetric<R: Rng>(rng: &mut R, limit: f32) -> f32 {
    if limit <= 0.0 {
        0.0
    } else {
        rng.gen_range(-limit..=limit)
    }
}

/// 出力画素ごとに逆変換で元画像の座標を求め、最近傍でサンプリングする
fn warp(img: &RgbImage, angle: f32, shift: (f32, f32), zoom: (f32, f32), flip: bool) -> RgbImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let (sin, cos) = angle.sin_cos();
    let max_x = width as f32 - 1.0;
    let max_y = height as f32 - 1.0;

    RgbImage::from_fn(width, height, |x, y| {
        let mut dx = x as f32 - cx - shift.0;
        let dy = y as f32 - cy - shift.1;
        if flip {
            dx = -dx;
        }
        let rx = cos * dx + sin * dy;
        let ry = -sin * dx + cos * dy;
        let sx = (rx / zoom.0 + cx).round().clamp(0.0, max_x) as u32;
        let sy = (ry / zoom.1 + cy).round().clamp(0.0, max_y) as u32;
        *img.get_pixel(sx, sy)
    })
}

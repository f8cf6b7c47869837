use image::DynamicImage;
use image::imageops::FilterType;
use ndarray::Array4;

use crate::error::{Result, RetrievalError};

/// 模型输入的默认边长
pub const IMAGE_SIZE: u32 = 224;
/// ImageNet 各通道均值
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet 各通道标准差
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 唯一的图片预处理流程，入库和查询必须共用
///
/// 1. 缩放到 `size x size`（双线性）
/// 2. 转为 RGB8
/// 3. 缩放到 [0, 1] 后按 ImageNet 均值和标准差归一化
/// 4. 输出 NCHW 布局的张量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preprocessor {
    size: u32,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(IMAGE_SIZE)
    }
}

impl Preprocessor {
    pub fn new(size: u32) -> Self {
        assert!(size > 0, "size must be positive");
        Self { size }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// 将图片转换为形状为 `(1, 3, size, size)` 的张量
    pub fn tensor(&self, image: &DynamicImage) -> Result<Array4<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(RetrievalError::embedding("图片尺寸为 0"));
        }

        let rgb = image.resize_exact(self.size, self.size, FilterType::Triangle).to_rgb8();

        let s = self.size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                let v = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
        Ok(tensor)
    }
}

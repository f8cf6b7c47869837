use anyhow::ensure;
use image::DynamicImage;
use ndarray::s;

use super::{Embedder, EmbedderSpec, Preprocessor};
use crate::error::Result;

/// 网格池化特征
///
/// 对预处理后的张量，在每个通道上按 `grid x grid` 的网格求均值，
/// 得到 `3 * grid * grid` 维的特征向量。无需模型文件。
pub struct GridEmbedder {
    grid: usize,
    pre: Preprocessor,
}

impl GridEmbedder {
    pub fn new(grid: usize, size: u32) -> anyhow::Result<Self> {
        ensure!(grid > 0, "网格数量必须大于 0");
        ensure!(grid <= size as usize, "网格数量 {} 不能超过图片边长 {}", grid, size);
        Ok(Self { grid, pre: Preprocessor::new(size) })
    }

    /// 第 i 个网格在边长为 s 的图片上覆盖的范围
    fn cell(&self, i: usize, s: usize) -> (usize, usize) {
        (i * s / self.grid, (i + 1) * s / self.grid)
    }
}

impl Embedder for GridEmbedder {
    fn dim(&self) -> usize {
        3 * self.grid * self.grid
    }

    fn descriptor(&self) -> EmbedderSpec {
        EmbedderSpec::Grid { grid: self.grid, size: self.pre.size() }
    }

    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let tensor = self.pre.tensor(image)?;
        let s = self.pre.size() as usize;

        let mut v = Vec::with_capacity(self.dim());
        for c in 0..3 {
            for gy in 0..self.grid {
                let (y0, y1) = self.cell(gy, s);
                for gx in 0..self.grid {
                    let (x0, x1) = self.cell(gx, s);
                    let cell = tensor.slice(s![0, c, y0..y1, x0..x1]);
                    v.push(cell.mean().unwrap_or(0.0));
                }
            }
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::embed::checked_embed;

    fn gradient(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x * 255 / w) as u8, (y * 255 / h) as u8, 128])
        }))
    }

    #[test]
    fn test_grid_dim() {
        let embedder = GridEmbedder::new(4, 32).unwrap();
        let v = checked_embed(&embedder, &gradient(100, 60)).unwrap();
        assert_eq!(v.len(), 48);
        assert_eq!(embedder.dim(), 48);
        assert!(v.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_grid_deterministic() {
        let embedder = GridEmbedder::new(8, 64).unwrap();
        let img = gradient(80, 80);
        assert_eq!(embedder.embed(&img).unwrap(), embedder.embed(&img).unwrap());
    }

    #[test]
    fn test_grid_uneven_cells() {
        // 边长不能被网格数整除时，每个网格仍然非空
        let embedder = GridEmbedder::new(3, 10).unwrap();
        let v = embedder.embed(&gradient(10, 10)).unwrap();
        assert_eq!(v.len(), 27);
        assert!(v.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_grid_invalid() {
        assert!(GridEmbedder::new(0, 32).is_err());
        assert!(GridEmbedder::new(64, 32).is_err());
    }
}

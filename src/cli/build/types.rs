/// 读取到的原始图片
pub struct ImageData {
    pub path: String,
    pub data: Vec<u8>,
}

/// 提取完特征的图片
pub struct EmbeddedImage {
    pub path: String,
    pub vector: Vec<f32>,
}

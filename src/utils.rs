use indicatif::ProgressStyle;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .expect("invalid progress bar template")
        .progress_chars("##-")
}

pub fn pb_style_speed() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{elapsed_precise}] {spinner} {pos} ({per_sec}) {msg}")
        .expect("invalid progress bar template")
}

/// 向量的 L2 范数
#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// 两个向量的平方欧氏距离
#[inline]
pub fn squared_l2(va: &[f32], vb: &[f32]) -> f32 {
    va.iter().zip(vb).map(|(a, b)| (a - b) * (a - b)).sum()
}

/// 归一化到单位长度，零向量或范数非有限时返回 None
pub fn l2_normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = l2_norm(v);
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

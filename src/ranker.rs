use ndarray::{ArrayView1, ArrayView2, Axis};

use crate::error::{Result, RetrievalError};
use crate::utils::l2_normalize;

/// 按余弦相似度对候选向量排序，返回 `(候选行号, 相似度)`
///
/// 候选向量必须已经归一化到单位长度，查询向量在这里归一化。
/// 结果按相似度降序排列，相似度相同时按行号升序，最多返回 top_k 个。
pub fn rank(query: &[f32], candidates: ArrayView2<f32>, top_k: usize) -> Result<Vec<(usize, f32)>> {
    RetrievalError::check_dim(candidates.ncols(), query.len())?;
    let query = l2_normalize(query).ok_or(RetrievalError::DegenerateVector)?;

    let k = top_k.min(candidates.nrows());
    if k == 0 {
        return Ok(vec![]);
    }

    let sims = candidates.dot(&ArrayView1::from(&query));
    let mut scored = sims
        .into_iter()
        .map(|s| s.clamp(-1.0, 1.0))
        .enumerate()
        .collect::<Vec<_>>();

    let cmp = |a: &(usize, f32), b: &(usize, f32)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));
    if k < scored.len() {
        scored.select_nth_unstable_by(k - 1, cmp);
        scored.truncate(k);
    }
    scored.sort_unstable_by(cmp);
    Ok(scored)
}

/// 只对矩阵中指定的若干行排序，返回的行号为原矩阵中的行号
pub fn rank_rows(
    query: &[f32],
    normalized: ArrayView2<f32>,
    rows: &[usize],
    top_k: usize,
) -> Result<Vec<(usize, f32)>> {
    let candidates = normalized.select(Axis(0), rows);
    let ranked = rank(query, candidates.view(), top_k)?;
    Ok(ranked.into_iter().map(|(i, s)| (rows[i], s)).collect())
}

use std::sync::LazyLock;

use prometheus::*;

static METRIC_QUERY_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("artsearch_query_count", "count of the queries", &["mode"]).unwrap()
});

static METRIC_QUERY_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "artsearch_query_duration",
        "duration of the per-query search in seconds",
        &["mode"]
    )
    .unwrap()
});

static METRIC_QUERY_BEST_SCORE: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "artsearch_query_best_score",
        "score of the best match per query",
        &["mode", "score_kind"],
        vec![-0.5, 0., 0.25, 0.5, 0.6, 0.7, 0.8, 0.85, 0.9, 0.95, 0.98, 1., 2., 5., 10., 50., 100.]
    )
    .unwrap()
});

static METRIC_QUERY_ERROR_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("artsearch_query_error_count", "count of the failed queries", &["mode"])
        .unwrap()
});

/// 增加查询计数
pub fn inc_query_count(mode: &str) {
    METRIC_QUERY_COUNT.with_label_values(&[mode]).inc();
}

pub fn inc_query_duration(mode: &str, duration: f32) {
    METRIC_QUERY_DURATION.with_label_values(&[mode]).observe(duration as f64);
}

pub fn inc_query_best_score(mode: &str, score_kind: &str, score: f32) {
    METRIC_QUERY_BEST_SCORE.with_label_values(&[mode, score_kind]).observe(score as f64);
}

pub fn inc_query_error_count(mode: &str) {
    METRIC_QUERY_ERROR_COUNT.with_label_values(&[mode]).inc();
}

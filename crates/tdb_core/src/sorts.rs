//! Ranking functions shared by in-query sort expressions and in-memory
//! scoring. All of them are pure.

use once_cell::sync::Lazy;

use crate::Timestamp;

/// Reference instant for the hot decay; fixed, never "now".
pub const HOT_EPOCH_SECONDS: f64 = 1_134_028_003.0;
pub const HOT_DECAY_SECONDS: f64 = 45_000.0;

/// z for an 80% confidence interval.
pub const CONFIDENCE_Z: f64 = 1.281551565545;

pub const CONFIDENCE_UP_RANGE: i64 = 400;
pub const CONFIDENCE_DOWN_RANGE: i64 = 100;

pub fn epoch_seconds(date: Timestamp) -> f64 {
    date.epoch_seconds()
}

pub fn score(ups: i64, downs: i64) -> i64 {
    ups - downs
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Hot ranking with the date already expressed as epoch seconds.
pub fn hot_seconds(ups: i64, downs: i64, date_seconds: f64) -> f64 {
    let s = score(ups, downs);
    let order = (s.unsigned_abs().max(1) as f64).log10();
    let sign = s.signum() as f64;
    let seconds = date_seconds - HOT_EPOCH_SECONDS;
    round_to(sign * order + seconds / HOT_DECAY_SECONDS, 7)
}

pub fn hot(ups: i64, downs: i64, date: Timestamp) -> f64 {
    hot_seconds(ups, downs, epoch_seconds(date))
}

/// Vote magnitude raised to the up/down imbalance ratio (always >= 1).
pub fn controversy(ups: i64, downs: i64) -> f64 {
    if ups <= 0 || downs <= 0 {
        return 0.0;
    }
    let magnitude = (ups + downs) as f64;
    let ratio = ups.max(downs) as f64 / ups.min(downs) as f64;
    magnitude.powf(ratio)
}

/// Lower bound of the Wilson score interval, computed directly.
pub fn raw_confidence(ups: i64, downs: i64) -> f64 {
    let n = (ups + downs) as f64;
    if n <= 0.0 {
        return 0.0;
    }
    let z = CONFIDENCE_Z;
    let p = ups as f64 / n;
    let left = p + 1.0 / (2.0 * n) * z * z;
    let right = z * (p * (1.0 - p) / n + z * z / (4.0 * n * n)).sqrt();
    let under = 1.0 + 1.0 / n * z * z;
    (left - right) / under
}

static CONFIDENCE_GRID: Lazy<Vec<f64>> = Lazy::new(|| {
    let mut grid = Vec::with_capacity((CONFIDENCE_UP_RANGE * CONFIDENCE_DOWN_RANGE) as usize);
    for ups in 0..CONFIDENCE_UP_RANGE {
        for downs in 0..CONFIDENCE_DOWN_RANGE {
            grid.push(raw_confidence(ups, downs));
        }
    }
    grid
});

/// Build the confidence lookup grid now instead of on first use.
pub fn warm_confidence_cache() {
    Lazy::force(&CONFIDENCE_GRID);
}

pub fn confidence_cache_ready() -> bool {
    Lazy::get(&CONFIDENCE_GRID).is_some()
}

pub fn confidence(ups: i64, downs: i64) -> f64 {
    if ups + downs == 0 {
        return 0.0;
    }
    if (0..CONFIDENCE_UP_RANGE).contains(&ups) && (0..CONFIDENCE_DOWN_RANGE).contains(&downs) {
        return CONFIDENCE_GRID[(downs + ups * CONFIDENCE_DOWN_RANGE) as usize];
    }
    raw_confidence(ups, downs)
}

/// A candidate answer considered by [`qa`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Answer {
    pub ups: i64,
    pub downs: i64,
    pub body_length: usize,
}

pub fn qa_score(
    question_score: f64,
    question_length: usize,
    answer_score: f64,
    answer_length: usize,
) -> f64 {
    let score_modifier = question_score + answer_score;
    let length_modifier = ((question_length + answer_length) as f64).log10();
    score_modifier + length_modifier / 5.0
}

pub fn qa(
    question_ups: i64,
    question_downs: i64,
    question_length: usize,
    answers: &[Answer],
) -> f64 {
    let question_score = confidence(question_ups, question_downs);
    let mut best: Option<(f64, usize)> = None;
    for answer in answers {
        let candidate = confidence(answer.ups, answer.downs);
        if best.is_none_or(|(score, _)| candidate > score) {
            best = Some((candidate, answer.body_length));
        }
    }
    let (answer_score, answer_length) = best.unwrap_or((0.0, 1));
    qa_score(question_score, question_length, answer_score, answer_length)
}

//! Beam search over decoder logits
//!
//! The search is independent of the runtime: a step function receives the
//! token sequences of every live beam and returns next-token logits for each.

use crate::vision::InferenceError;

/// Token ids and limits driving generation
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub bos_id: i64,
    pub eos_id: i64,
    /// Tokens that may never be generated (the unknown token)
    pub suppressed: Vec<i64>,
    /// Beam width, 1 = greedy
    pub num_beams: usize,
    /// Maximum sequence length including the start token
    pub max_length: usize,
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<i64>,
    score: f32,
}

impl Hypothesis {
    fn normalized(&self) -> f32 {
        self.score / self.tokens.len().max(1) as f32
    }
}

/// Log-softmax over a logits row with suppressed tokens masked out
fn log_softmax(logits: &[f32], suppressed: &[i64]) -> Vec<f32> {
    let mut masked = logits.to_vec();
    for &id in suppressed {
        if let Some(v) = usize::try_from(id).ok().and_then(|i| masked.get_mut(i)) {
            *v = f32::NEG_INFINITY;
        }
    }

    let max = masked
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![f32::NEG_INFINITY; masked.len()];
    }

    let sum: f32 = masked.iter().map(|v| (v - max).exp()).sum();
    let log_sum = sum.ln() + max;
    masked.iter().map(|v| v - log_sum).collect()
}

/// Indices of the `k` largest finite values, highest first
fn top_k(values: &[f32], k: usize) -> Vec<(i64, f32)> {
    let mut indexed: Vec<(i64, f32)> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, &v)| (i as i64, v))
        .collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);
    indexed
}

/// Run beam search and return the best token sequence (start token included)
pub fn beam_search<F>(config: &GenerationConfig, mut step: F) -> Result<Vec<i64>, InferenceError>
where
    F: FnMut(&[Vec<i64>]) -> Result<Vec<Vec<f32>>, InferenceError>,
{
    let num_beams = config.num_beams.max(1);
    let mut beams = vec![Hypothesis {
        tokens: vec![config.bos_id],
        score: 0.0,
    }];
    let mut finished: Vec<Hypothesis> = Vec::new();

    while beams[0].tokens.len() < config.max_length {
        let sequences: Vec<Vec<i64>> = beams.iter().map(|b| b.tokens.clone()).collect();
        let logits = step(&sequences)?;
        if logits.len() != beams.len() {
            return Err(InferenceError::Generate(format!(
                "decoder returned {} rows for {} beams",
                logits.len(),
                beams.len()
            )));
        }

        let mut candidates: Vec<(f32, usize, i64)> = Vec::new();
        for (beam_idx, (beam, row)) in beams.iter().zip(&logits).enumerate() {
            let log_probs = log_softmax(row, &config.suppressed);
            for (token, lp) in top_k(&log_probs, 2 * num_beams) {
                candidates.push((beam.score + lp, beam_idx, token));
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut next = Vec::with_capacity(num_beams);
        for (rank, (score, beam_idx, token)) in candidates.into_iter().enumerate() {
            let mut tokens = beams[beam_idx].tokens.clone();
            tokens.push(token);
            if token == config.eos_id {
                // Only end tokens that would have been kept as a beam count
                if rank < num_beams {
                    finished.push(Hypothesis { tokens, score });
                }
                continue;
            }
            next.push(Hypothesis { tokens, score });
            if next.len() == num_beams {
                break;
            }
        }

        if finished.len() >= num_beams || next.is_empty() {
            break;
        }
        beams = next;
    }

    if finished.len() < num_beams {
        finished.extend(beams);
    }

    finished
        .into_iter()
        .max_by(|a, b| a.normalized().total_cmp(&b.normalized()))
        .map(|h| h.tokens)
        .ok_or_else(|| InferenceError::Generate("beam search produced no hypothesis".to_string()))
}

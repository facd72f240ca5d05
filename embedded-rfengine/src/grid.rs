//! Hyperparameter sweep over `(min_split, max_depth)`.
//!
//! The search itself is deliberately dumb: ascending Cartesian iteration,
//! strict improvement, first combination wins ties. Everything stateful
//! (forest construction, scoring, persistence) sits behind [`TrainSession`]
//! so the loop can be exercised against a mock.

use crate::Result;

/// One training attempt's worth of engine state.
pub trait TrainSession {
    /// Install the next hyperparameter combination.
    fn set_combo(&mut self, min_split: u16, max_depth: u8);
    /// Rebuild the forest under the current combination.
    fn make_forest(&mut self) -> Result<()>;
    /// Score the current forest (higher is better).
    fn evaluate(&mut self) -> Result<f32>;
    /// Persist the current forest as the best so far.
    fn persist(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridOutcome {
    pub best_score: f32,
    pub best_min_split: u16,
    pub best_max_depth: u8,
    pub combos_tried: u16,
}

/// Sweep the ranges. `initial` is the score of the already-built,
/// already-persisted starting forest under `(initial_min_split,
/// initial_max_depth)`; a combination must strictly beat the best seen so
/// far to be persisted.
pub fn search<S: TrainSession>(
    session: &mut S,
    min_splits: &[u16],
    max_depths: &[u8],
    initial: f32,
    initial_min_split: u16,
    initial_max_depth: u8,
) -> Result<GridOutcome> {
    let mut outcome = GridOutcome {
        best_score: initial,
        best_min_split: initial_min_split,
        best_max_depth: initial_max_depth,
        combos_tried: 0,
    };
    for &min_split in min_splits {
        for &max_depth in max_depths {
            session.set_combo(min_split, max_depth);
            session.make_forest()?;
            let score = session.evaluate()?;
            outcome.combos_tried += 1;
            log::debug!("grid ({min_split}, {max_depth}): score {score:.4}");
            if score > outcome.best_score {
                session.persist()?;
                outcome.best_score = score;
                outcome.best_min_split = min_split;
                outcome.best_max_depth = max_depth;
            }
        }
    }
    Ok(outcome)
}

use crate::error::ShapeError;

/// How a source shape is reshaped and tiled to match a target shape.
///
/// Produced by [`reconcile`]. The source is first right-aligned into the target's rank by
/// left-padding with unit axes (`padded`), then every axis is repeated `repeats[i]` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPlan {
    /// The source shape right-aligned into the target rank.
    pub padded: Vec<u32>,
    /// The target shape.
    pub target: Vec<u32>,
    /// The number of repetitions along each axis.
    pub repeats: Vec<u32>,
    /// Whether padding changed the rank of the source.
    pub reshaped: bool,
}

impl BroadcastPlan {
    /// Returns true if the plan neither reshapes nor tiles the source.
    pub fn is_identity(&self) -> bool {
        !self.reshaped && self.repeats.iter().all(|&r| r == 1)
    }

    /// Returns the shape of the source after tiling.
    pub fn broadcast_shape(&self) -> Vec<u32> {
        self.padded
            .iter()
            .zip(self.repeats.iter())
            .map(|(&p, &r)| p * r)
            .collect()
    }
}

/// Check whether `b` can be broadcast into `a`.
///
/// Identical shapes are always compatible. Otherwise every axis of `a` must be an integer
/// multiple of the same axis of `b`. `a` is always the target side, so the rule is not
/// symmetric.
///
/// # Arguments
///
/// * `a` - The target shape.
/// * `b` - The shape to broadcast.
///
/// # Returns
///
/// True if the shapes have the same rank and every axis of `b` divides the one of `a`.
pub fn can_broadcast(a: &[u32], b: &[u32]) -> bool {
    if a == b {
        return true;
    }
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).all(|(&x, &y)| y != 0 && x % y == 0)
}

/// Plan the reshape and tile transform that expands `source` into `target`.
///
/// An axis of size 1 is repeated to the full target size, an axis that divides the target
/// size is repeated `target / source` times, and an equal axis is left alone.
///
/// # Arguments
///
/// * `source` - The shape of the operand to expand.
/// * `target` - The shape to expand into.
///
/// # Errors
///
/// Returns [`ShapeError::RankMismatch`] if `source` has more axes than `target`, and
/// [`ShapeError::NotDivisible`] if a source axis does not divide its target axis.
pub fn reconcile(source: &[u32], target: &[u32]) -> Result<BroadcastPlan, ShapeError> {
    if source.len() > target.len() {
        return Err(ShapeError::RankMismatch {
            source_rank: source.len(),
            target_rank: target.len(),
        });
    }

    let reshaped = source.len() != target.len();
    let mut padded = vec![1u32; target.len()];
    let offset = target.len() - source.len();
    padded[offset..].copy_from_slice(source);

    let mut repeats = vec![1u32; target.len()];
    for (axis, (&s, &t)) in padded.iter().zip(target.iter()).enumerate() {
        if s == t {
            continue;
        }
        if s == 0 || t % s != 0 {
            return Err(ShapeError::NotDivisible {
                axis,
                size: s,
                target: t,
            });
        }
        repeats[axis] = t / s;
    }

    Ok(BroadcastPlan {
        padded,
        target: target.to_vec(),
        repeats,
        reshaped,
    })
}

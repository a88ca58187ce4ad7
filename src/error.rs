//! Status codes and error taxonomy for the arc-length DAE driver.
//!
//! The numeric values mirror the externally-visible exit codes of the
//! original GSDAE/CSDAE drivers (see the spec's status table) so that a
//! caller porting scripts that branch on the integer code can map it
//! directly onto [`GsdaeError::code`] / [`Status::code`].

use thiserror::Error;

/// Non-negative informative outcomes of a successful driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Endpoint reached at a regular point.
    Regular,
    /// Transversal singularity crossed.
    TransversalSingularity,
    /// Regular point, but the algebraic rank dropped.
    RegularRankDrop,
    /// Transversal singularity, and the algebraic rank dropped.
    TransversalRankDrop,
    /// Regular point, but the DAE order was reduced.
    RegularOrderDrop,
    /// Transversal singularity, and the DAE order was reduced.
    TransversalOrderDrop,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Regular => 0,
            Status::TransversalSingularity => 1,
            Status::RegularRankDrop => 2,
            Status::TransversalRankDrop => 3,
            Status::RegularOrderDrop => 4,
            Status::TransversalOrderDrop => 5,
        }
    }

    /// True for the two statuses that require caller acknowledgement before
    /// the next `CSDAE` call (otherwise `-16` is raised).
    pub fn is_singularity(self) -> bool {
        matches!(
            self,
            Status::TransversalSingularity
                | Status::TransversalRankDrop
                | Status::TransversalOrderDrop
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Status::Regular => "endpoint reached at a regular point",
            Status::TransversalSingularity => "transversal singularity",
            Status::RegularRankDrop => "regular point with a rank drop of the algebraic block",
            Status::TransversalRankDrop => "transversal singularity with a rank drop",
            Status::RegularOrderDrop => "regular point with a DAE order reduction",
            Status::TransversalOrderDrop => "transversal singularity with a DAE order reduction",
        };
        f.write_str(text)
    }
}

/// The three failure taxonomies of spec.md §7: structural (settles the current
/// call permanently), numerical (the stepper may retry internally first) and
/// protocol (driver state-machine misuse).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GsdaeError {
    #[error("solver state was not allocated")]
    StateNotAllocated,
    #[error("input validation failed: {0}")]
    InvalidInput(String),
    #[error("initial point does not satisfy F within tolerance")]
    InitialResidualTooLarge,
    #[error("declared rank is lower than the measured rank of dF/dy^(o)")]
    DeclaredRankTooLow,
    #[error("order is zero and dF/dy is rank-deficient: the problem is ill-posed")]
    IllPosedOrderZero,
    #[error("rank of dF/dy^(o) varies in a neighborhood of the current point")]
    RankVariesInNeighborhood,
    #[error("order was reduced and the rank still varies in a neighborhood")]
    OrderDropRankStillVaries,
    #[error("non-transversal singularity detected")]
    NonTransversalSingularity,
    #[error("non-transversal singularity with a rank drop")]
    NonTransversalSingularityRankDrop,
    #[error("non-transversal singularity with an order drop")]
    NonTransversalSingularityOrderDrop,
    #[error("advanced point fails F within tolerance")]
    AdvancedResidualTooLarge,
    #[error("step size |h| fell below hmin")]
    StepTooSmall,
    #[error("condition number estimate exceeded cdmax")]
    IllConditioned,
    #[error("corrector (modified Newton) did not converge")]
    CorrectorDiverged,
    #[error("a prior negative status was not acknowledged before this call")]
    UnacknowledgedError,
    #[error("a prior transversal singularity was not acknowledged before this call")]
    UnacknowledgedSingularity,
}

impl GsdaeError {
    pub fn code(&self) -> i32 {
        match self {
            GsdaeError::StateNotAllocated => -1,
            GsdaeError::InvalidInput(_) => -2,
            GsdaeError::InitialResidualTooLarge => -3,
            GsdaeError::DeclaredRankTooLow => -4,
            GsdaeError::IllPosedOrderZero => -5,
            GsdaeError::RankVariesInNeighborhood => -6,
            GsdaeError::OrderDropRankStillVaries => -7,
            GsdaeError::NonTransversalSingularity => -8,
            GsdaeError::NonTransversalSingularityRankDrop => -9,
            GsdaeError::NonTransversalSingularityOrderDrop => -10,
            GsdaeError::AdvancedResidualTooLarge => -11,
            GsdaeError::StepTooSmall => -12,
            GsdaeError::IllConditioned => -13,
            GsdaeError::CorrectorDiverged => -14,
            GsdaeError::UnacknowledgedError => -15,
            GsdaeError::UnacknowledgedSingularity => -16,
        }
    }

    /// Structural failures settle the current call permanently (§7).
    pub fn is_structural(&self) -> bool {
        matches!(self.code(), -10..=-3)
    }

    /// Numerical failures the controller may have already retried internally.
    pub fn is_numerical(&self) -> bool {
        matches!(self.code(), -14..=-11)
    }

    /// Protocol failures are driver state-machine misuse.
    pub fn is_protocol(&self) -> bool {
        matches!(self.code(), -16 | -15 | -2 | -1)
    }
}

pub type GsdaeResult<T> = Result<T, GsdaeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(Status::Regular.code(), 0);
        assert_eq!(Status::TransversalSingularity.code(), 1);
        assert_eq!(Status::RegularRankDrop.code(), 2);
        assert_eq!(Status::TransversalRankDrop.code(), 3);
        assert_eq!(Status::RegularOrderDrop.code(), 4);
        assert_eq!(Status::TransversalOrderDrop.code(), 5);
    }

    #[test]
    fn error_codes_match_spec_table() {
        assert_eq!(GsdaeError::StateNotAllocated.code(), -1);
        assert_eq!(GsdaeError::InvalidInput(String::new()).code(), -2);
        assert_eq!(GsdaeError::StepTooSmall.code(), -12);
        assert_eq!(GsdaeError::UnacknowledgedSingularity.code(), -16);
    }

    #[test]
    fn taxonomies_partition_the_negative_codes() {
        let structural = [
            GsdaeError::InitialResidualTooLarge,
            GsdaeError::DeclaredRankTooLow,
            GsdaeError::IllPosedOrderZero,
            GsdaeError::RankVariesInNeighborhood,
            GsdaeError::OrderDropRankStillVaries,
            GsdaeError::NonTransversalSingularity,
            GsdaeError::NonTransversalSingularityRankDrop,
            GsdaeError::NonTransversalSingularityOrderDrop,
        ];
        for e in structural {
            assert!(e.is_structural(), "{e:?} should be structural");
            assert!(!e.is_numerical());
            assert!(!e.is_protocol());
        }
        let numerical = [
            GsdaeError::AdvancedResidualTooLarge,
            GsdaeError::StepTooSmall,
            GsdaeError::IllConditioned,
            GsdaeError::CorrectorDiverged,
        ];
        for e in numerical {
            assert!(e.is_numerical());
            assert!(!e.is_structural());
        }
        let protocol = [
            GsdaeError::StateNotAllocated,
            GsdaeError::InvalidInput(String::new()),
            GsdaeError::UnacknowledgedError,
            GsdaeError::UnacknowledgedSingularity,
        ];
        for e in protocol {
            assert!(e.is_protocol());
        }
    }
}

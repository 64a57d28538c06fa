use evintake_contracts::decision::ApplicationStatus;

/// Which lifecycle timestamp a transition stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStamp {
    Submitted,
    Reviewed,
    Decided,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: ApplicationStatus,
    pub to: ApplicationStatus,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cannot transition application from {} to {}",
            self.from.as_str(),
            self.to.as_str()
        )
    }
}

impl std::error::Error for TransitionError {}

pub fn is_allowed(from: ApplicationStatus, to: ApplicationStatus) -> bool {
    use ApplicationStatus::*;

    matches!(
        (from, to),
        (Draft, Submitted)
            | (Submitted, Draft)
            | (Submitted, UnderReview)
            | (UnderReview, Approved)
            | (UnderReview, Rejected)
            | (UnderReview, Conditional)
            | (Conditional, UnderReview)
    )
}

pub fn check_transition(
    from: ApplicationStatus,
    to: ApplicationStatus,
) -> Result<StatusStamp, TransitionError> {
    if !is_allowed(from, to) {
        return Err(TransitionError { from, to });
    }

    Ok(match to {
        ApplicationStatus::Submitted => StatusStamp::Submitted,
        ApplicationStatus::UnderReview => StatusStamp::Reviewed,
        s if s.is_decision() => StatusStamp::Decided,
        _ => StatusStamp::Nothing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ApplicationStatus::*;

    #[test]
    fn forward_path_stamps_each_phase() {
        assert_eq!(check_transition(Draft, Submitted), Ok(StatusStamp::Submitted));
        assert_eq!(check_transition(Submitted, UnderReview), Ok(StatusStamp::Reviewed));
        assert_eq!(check_transition(UnderReview, Approved), Ok(StatusStamp::Decided));
        assert_eq!(check_transition(UnderReview, Conditional), Ok(StatusStamp::Decided));
        assert_eq!(check_transition(Submitted, Draft), Ok(StatusStamp::Nothing));
    }

    #[test]
    fn skips_backwards_moves_and_self_loops_are_rejected() {
        assert!(check_transition(Draft, Approved).is_err());
        assert!(check_transition(Approved, UnderReview).is_err());
        assert!(check_transition(Rejected, Draft).is_err());
        assert!(check_transition(Draft, Draft).is_err());
        let err = check_transition(Draft, UnderReview).expect_err("skip must fail");
        assert_eq!(err.to_string(), "cannot transition application from draft to under_review");
    }
}

//! Processing-rate profiles (spec.md §4.D).
//!
//! Re-architected per spec.md §9: a data-only struct with three named
//! profiles rather than an enum carrying JSON-merge methods. `RateProfile`
//! is chosen once at startup and held read-only for the life of the process.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingRate {
    Leisurely,
    Standard,
    Aggressive,
}

impl ProcessingRate {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "leisurely" => Some(ProcessingRate::Leisurely),
            "standard" => Some(ProcessingRate::Standard),
            "aggressive" => Some(ProcessingRate::Aggressive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingRate::Leisurely => "leisurely",
            ProcessingRate::Standard => "standard",
            ProcessingRate::Aggressive => "aggressive",
        }
    }

    pub fn profile(&self) -> RateProfile {
        match self {
            ProcessingRate::Standard => RateProfile {
                follow_up_delay_ms: 500,
                lease_timeout_ms: 1_500,
                report_update_period_ms: 5,
            },
            ProcessingRate::Leisurely => {
                let standard = ProcessingRate::Standard.profile();
                RateProfile {
                    follow_up_delay_ms: standard.follow_up_delay_ms * 5,
                    lease_timeout_ms: standard.lease_timeout_ms * 5,
                    report_update_period_ms: standard.report_update_period_ms * 5,
                }
            }
            ProcessingRate::Aggressive => RateProfile {
                follow_up_delay_ms: 100,
                lease_timeout_ms: 300,
                report_update_period_ms: 1,
            },
        }
    }
}

impl Default for ProcessingRate {
    fn default() -> Self {
        ProcessingRate::Standard
    }
}

/// Named set of timing constants derived from a [`ProcessingRate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateProfile {
    /// Delay applied to follow-up tasks scheduled by a handler.
    pub follow_up_delay_ms: u64,
    /// Lease duration granted to a worker that claims a task.
    pub lease_timeout_ms: u64,
    /// How often the report updater re-queues itself while pending rows remain.
    pub report_update_period_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leisurely_is_five_times_standard() {
        let standard = ProcessingRate::Standard.profile();
        let leisurely = ProcessingRate::Leisurely.profile();
        assert_eq!(leisurely.follow_up_delay_ms, standard.follow_up_delay_ms * 5);
        assert_eq!(leisurely.lease_timeout_ms, standard.lease_timeout_ms * 5);
        assert_eq!(
            leisurely.report_update_period_ms,
            standard.report_update_period_ms * 5
        );
    }

    #[test]
    fn aggressive_matches_spec_constants() {
        let p = ProcessingRate::Aggressive.profile();
        assert_eq!(p.follow_up_delay_ms, 100);
        assert_eq!(p.lease_timeout_ms, 300);
        assert_eq!(p.report_update_period_ms, 1);
    }

    #[test]
    fn parse_round_trips() {
        for p in [ProcessingRate::Leisurely, ProcessingRate::Standard, ProcessingRate::Aggressive] {
            assert_eq!(ProcessingRate::parse(p.as_str()), Some(p));
        }
    }
}

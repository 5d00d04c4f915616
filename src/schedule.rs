//! Scheduling-policy selection for worksharing loops.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    directive::{ClauseKind, ExecutableDirective, ScheduleKind},
    error::{ErrorKind, Result},
};

/// Whether a loop may use the coalesced static schedule, where every
/// participant takes one contiguous slice sized by the participant count,
/// instead of the generic chunked loop.
///
/// Only a plain `static` schedule with the default distribution qualifies:
/// an explicit chunk size of one or an `ordered` clause rule it out.
#[must_use]
pub const fn choose_static_coalesced(
    kind: ScheduleKind,
    chunk_size_is_one: bool,
    ordered: bool,
) -> bool {
    matches!(kind, ScheduleKind::Static) && !chunk_size_is_one && !ordered
}

/// A clause combination for which the device cannot elide the implicit
/// barrier at the end of a loop construct, even under `nowait`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierRule {
    /// Clauses that must all be present.
    pub clauses: Vec<ClauseKind>,
    /// Schedule kind that must be selected, any when `None`.
    #[serde(default)]
    pub schedule: Option<ScheduleKind>,
}

impl BarrierRule {
    /// Whether `directive` carries every clause of the rule.
    #[must_use]
    pub fn matches(&self, directive: &ExecutableDirective) -> bool {
        let has_clauses = self
            .clauses
            .iter()
            .all(|clause| directive.has_clause(*clause));
        let has_schedule = self.schedule.map_or(true, |schedule| {
            directive
                .schedule()
                .is_some_and(|(kind, _)| kind == schedule)
        });

        has_clauses && has_schedule
    }
}

/// What the target device can and cannot do at the end of a loop
/// construct.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Any matching rule keeps the implicit barrier.
    pub barrier_rules: Vec<BarrierRule>,
}

impl DeviceCapabilities {
    /// Divergent lanes of an `ordered` loop cannot skip the end barrier.
    #[must_use]
    pub fn nvptx() -> Self {
        Self {
            barrier_rules: vec![BarrierRule {
                clauses: vec![ClauseKind::Ordered],
                schedule: None,
            }],
        }
    }

    /// The host runtime honours every `nowait`.
    #[must_use]
    pub fn host() -> Self {
        Self::default()
    }

    /// Adds a rule unless an identical one is present.
    #[must_use]
    pub fn with_rule(mut self, rule: BarrierRule) -> Self {
        if !self.barrier_rules.contains(&rule) {
            self.barrier_rules.push(rule);
        }
        self
    }

    /// Whether the end-of-construct barrier of `directive` is mandatory.
    #[must_use]
    pub fn requires_barrier(&self, directive: &ExecutableDirective) -> bool {
        directive.kind.is_loop() && self.barrier_rules.iter().any(|rule| rule.matches(directive))
    }
}

#[expect(clippy::unwrap_used)]
fn schedule_clause_regex() -> &'static Regex {
    static SCHEDULE_CLAUSE_REGEX: OnceLock<Regex> = OnceLock::new();
    SCHEDULE_CLAUSE_REGEX.get_or_init(|| Regex::new(r"^schedule\(\s*([a-z]+)\s*\)$").unwrap())
}

/// Parses barrier rules written as `ordered;nowait+schedule(dynamic)`:
/// rules are separated by `;`, the clauses of one rule by `+`.
pub fn parse_barrier_rules(rules: &str) -> Result<Vec<BarrierRule>> {
    let invalid = |reason: String| ErrorKind::InvalidConfig {
        key: String::from("barrier rules"),
        value: rules.to_owned(),
        reason,
    };

    let mut parsed = Vec::new();

    for rule in rules.split(';').map(str::trim).filter(|rule| !rule.is_empty()) {
        let mut clauses = Vec::new();
        let mut schedule = None;

        for clause in rule.split('+').map(str::trim) {
            if let Some(captures) = schedule_clause_regex().captures(clause) {
                let kind = captures.get(1).map_or("", |kind| kind.as_str());
                schedule = Some(parse_schedule_kind(kind).ok_or_else(|| {
                    invalid(format!("names the unknown schedule kind '{kind}'"))
                })?);
                continue;
            }

            clauses.push(match clause {
                "if" => ClauseKind::If,
                "schedule" => ClauseKind::Schedule,
                "dist_schedule" => ClauseKind::DistSchedule,
                "ordered" => ClauseKind::Ordered,
                "nowait" => ClauseKind::Nowait,
                "reduction" => ClauseKind::Reduction,
                other => crate::bail!(invalid(format!("names the unknown clause '{other}'"))),
            });
        }

        parsed.push(BarrierRule { clauses, schedule });
    }

    Ok(parsed)
}

fn parse_schedule_kind(kind: &str) -> Option<ScheduleKind> {
    match kind {
        "static" => Some(ScheduleKind::Static),
        "dynamic" => Some(ScheduleKind::Dynamic),
        "guided" => Some(ScheduleKind::Guided),
        "auto" => Some(ScheduleKind::Auto),
        "runtime" => Some(ScheduleKind::Runtime),
        _ => None,
    }
}

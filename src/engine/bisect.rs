//! Divide-and-conquer search for the minimal divergence-causing elements.
//!
//! The same partitioner drives both phases: over compilation units, and over the
//! function symbols of one suspect unit. The search state is an explicit FIFO frontier
//! of candidate sets, each confirmed to diverge when made variant as a whole.
//!
//! Each set is halved (larger half first) and both halves are tried in one batch:
//!
//! | first half | second half | action                                        |
//! |------------|-------------|-----------------------------------------------|
//! | diverges   | zero        | continue with the first half                  |
//! | zero       | diverges    | continue with the second half                 |
//! | diverges   | diverges    | continue with both, as independent branches   |
//! | zero       | zero        | leave-one-out over the set, flag interaction  |
//!
//! A half whose trial failed is reported and dropped; the other half is still followed
//! if it diverges. Sets of size one are emitted as suspects with the score that
//! confirmed them.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::BisectResult;
use crate::core::{Candidate, CompilationUnit, Partition, Scope, Score, SymbolSite, TrialOutcome};
use crate::engine::trial::TrialRunner;
use crate::report::{Interaction, Issue, IssueKind};

/// A size-one candidate set that still diverges.
#[derive(Debug, Clone, PartialEq)]
pub struct Suspect<C> {
    pub candidate: C,
    pub score: Score,
}

/// Everything one search produced.
#[derive(Debug, Clone)]
pub struct SearchOutcome<C> {
    /// Minimal suspects, in the candidates' original order
    pub suspects: Vec<Suspect<C>>,
    pub interactions: Vec<Interaction>,
    pub issues: Vec<Issue>,
    /// The search stopped early on cancellation
    pub cancelled: bool,
}

impl<C> Default for SearchOutcome<C> {
    fn default() -> Self {
        SearchOutcome {
            suspects: Vec::new(),
            interactions: Vec::new(),
            issues: Vec::new(),
            cancelled: false,
        }
    }
}

struct FrontierEntry {
    members: Vec<usize>,
    score: Score,
}

/// Bisection over one candidate set.
pub struct Partitioner<'r, 'a, C> {
    runner: &'r TrialRunner<'a>,
    scope: Scope,
    candidates: Vec<C>,
    keys: Vec<String>,
}

impl<'r, 'a> Partitioner<'r, 'a, CompilationUnit> {
    /// Search over the target's compilation units.
    pub fn for_units(runner: &'r TrialRunner<'a>, units: &[CompilationUnit]) -> Self {
        Self::new(runner, Scope::Units, units.to_vec())
    }
}

impl<'r, 'a> Partitioner<'r, 'a, SymbolSite> {
    /// Search over the symbols of `unit`; every other unit stays trusted.
    pub fn for_symbols(
        runner: &'r TrialRunner<'a>,
        unit: &CompilationUnit,
        symbols: &[SymbolSite],
    ) -> Self {
        Self::new(runner, Scope::Symbols { unit: unit.path.clone() }, symbols.to_vec())
    }
}

impl<'r, 'a, C: Candidate> Partitioner<'r, 'a, C> {
    pub fn new(runner: &'r TrialRunner<'a>, scope: Scope, candidates: Vec<C>) -> Self {
        let keys = candidates.iter().map(Candidate::key).collect();
        Partitioner { runner, scope, candidates, keys }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn candidates(&self) -> &[C] {
        &self.candidates
    }

    fn partition(&self, variant: &[usize]) -> BisectResult<Partition> {
        let variant: Vec<String> = variant.iter().map(|&i| self.keys[i].clone()).collect();
        Partition::new(self.scope.clone(), &self.keys, &variant)
    }

    fn names(&self, members: &[usize]) -> Vec<String> {
        members.iter().map(|&i| self.keys[i].clone()).collect()
    }

    /// The precondition trial: every candidate variant.
    pub fn confirm(&self) -> BisectResult<TrialOutcome> {
        let all: Vec<usize> = (0..self.candidates.len()).collect();
        Ok(self.runner.run(&self.partition(&all)?))
    }

    /// Trial with exactly `subset` variant, for checking that the suspects reproduce.
    pub fn verify(&self, subset: &[C]) -> BisectResult<TrialOutcome> {
        let keys: Vec<String> = subset.iter().map(Candidate::key).collect();
        let partition = Partition::new(self.scope.clone(), &self.keys, &keys)?;
        Ok(self.runner.run(&partition))
    }

    /// Search for the minimal divergent elements, given the all-variant score.
    pub fn search(&self, whole: Score) -> BisectResult<SearchOutcome<C>> {
        let mut outcome = SearchOutcome::default();
        if self.candidates.is_empty() {
            return Ok(outcome);
        }

        let mut found: Vec<(usize, Score)> = Vec::new();
        let mut frontier = VecDeque::new();
        frontier.push_back(FrontierEntry {
            members: (0..self.candidates.len()).collect(),
            score: whole,
        });

        while let Some(entry) = frontier.pop_front() {
            if self.runner.cancel().is_cancelled() {
                outcome.cancelled = true;
                outcome.issues.push(Issue::new(
                    IssueKind::Cancelled,
                    self.scope.to_string(),
                    format!("{} candidate sets left unexplored", frontier.len() + 1),
                ));
                break;
            }

            if entry.members.len() == 1 {
                debug!(scope = %self.scope, suspect = %self.keys[entry.members[0]], "isolated");
                found.push((entry.members[0], entry.score));
                continue;
            }

            let mid = entry.members.len().div_ceil(2);
            let (first, second) = entry.members.split_at(mid);
            let halves = [self.partition(first)?, self.partition(second)?];
            let results = self.runner.run_batch(&halves);

            if self.runner.cancel().is_cancelled() {
                frontier.push_front(entry);
                continue;
            }

            let mut diverging = 0;
            let mut failed = 0;
            for ((members, partition), result) in
                [first, second].into_iter().zip(&halves).zip(&results)
            {
                match result {
                    Ok(score) if score.is_divergent() => {
                        diverging += 1;
                        frontier
                            .push_back(FrontierEntry { members: members.to_vec(), score: *score });
                    }
                    Ok(_) => {}
                    Err(failure) => {
                        failed += 1;
                        outcome.issues.push(Issue::from_failure(partition.describe(), failure));
                    }
                }
            }

            if diverging == 0 {
                if failed == 0 {
                    self.leave_one_out(&entry.members, &mut found, &mut outcome)?;
                } else {
                    warn!(
                        scope = %self.scope,
                        set = ?self.names(&entry.members),
                        "branch abandoned after failed trial"
                    );
                }
            }
        }

        found.sort_by_key(|(i, _)| *i);
        outcome.suspects = found
            .into_iter()
            .map(|(i, score)| Suspect { candidate: self.candidates[i].clone(), score })
            .collect();
        info!(
            scope = %self.scope,
            suspects = outcome.suspects.len(),
            interactions = outcome.interactions.len(),
            issues = outcome.issues.len(),
            "search finished"
        );
        Ok(outcome)
    }

    /// Fallback for a set that diverges while neither half does.
    fn leave_one_out(
        &self,
        members: &[usize],
        found: &mut Vec<(usize, Score)>,
        outcome: &mut SearchOutcome<C>,
    ) -> BisectResult<()> {
        let names = self.names(members);
        info!(
            scope = %self.scope,
            set = ?names,
            "interaction detected, trying elements one at a time"
        );

        let singles = members
            .iter()
            .map(|&i| self.partition(&[i]))
            .collect::<BisectResult<Vec<Partition>>>()?;
        let results = self.runner.run_batch(&singles);

        let mut attributed = Vec::new();
        for ((&i, partition), result) in members.iter().zip(&singles).zip(&results) {
            match result {
                Ok(score) if score.is_divergent() => {
                    attributed.push(self.keys[i].clone());
                    found.push((i, *score));
                }
                Ok(_) => {}
                Err(failure) => {
                    outcome.issues.push(Issue::from_failure(partition.describe(), failure));
                }
            }
        }

        outcome.issues.push(Issue::new(
            IssueKind::InteractionDetected,
            self.scope.to_string(),
            format!(
                "no half of [{}] diverges alone; {} of {} diverge in isolation",
                names.join(" "),
                attributed.len(),
                names.len()
            ),
        ));
        outcome.interactions.push(Interaction {
            scope: self.scope.to_string(),
            members: names,
            attributed,
        });
        Ok(())
    }
}

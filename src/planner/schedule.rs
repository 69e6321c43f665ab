//! Decision resolution and scheduling: pruning the expansion DAG into
//! the execution DAG handed to the executor.

use std::collections::BTreeSet;

use crate::action::{Action, Choice, Decision, DecisionKind};
use crate::error::{PlanError, Result};

use super::{ActionDag, PlanContext};

/// Callback consulted for decisions neither the plan nor the triggers
/// settle. Returns whether the candidate action should be scheduled, or
/// an error refusing to decide.
pub type Resolver = dyn Fn(&Action, &Decision) -> Result<bool>;

/// Resolver that always downloads sources from the store; any other
/// undecided choice is refused with a full diagnostic.
pub fn always_download_source_resolver(action: &Action, decision: &Decision) -> Result<bool> {
    match action {
        Action::CreateSource { .. } => Ok(false),
        Action::DownloadSource(_) => Ok(true),
        _ => Err(decision_error(action, decision)),
    }
}

/// Resolver that always assembles sources from repository checkouts; the
/// mirror image of [`always_download_source_resolver`].
pub fn always_create_source_resolver(action: &Action, decision: &Decision) -> Result<bool> {
    match action {
        Action::CreateSource { .. } => Ok(true),
        Action::DownloadSource(_) => Ok(false),
        _ => Err(decision_error(action, decision)),
    }
}

/// Build the diagnostic for a decision a resolver refuses to take.
///
/// The message classifies the conflict and quotes, verbatim, the plan
/// entries that would fix it.
pub fn decision_error(action: &Action, decision: &Decision) -> PlanError {
    let choice = decision.choice();
    let expected = decision.expected_choice();

    let message = match (choice, expected) {
        (None, Some(side @ (Choice::Left | Choice::Right))) => {
            if side == Decision::BUILD && decision.kind == DecisionKind::BuildOrDownload {
                let spec_name = action
                    .spec()
                    .map(|s| s.name().to_string())
                    .unwrap_or_else(|| decision.initiator.clone());
                format!(
                    "A spec in the plan has a build_tree dependency on {}. \
                     Either explicitly add the line {} or change the dependency \
                     to set require=\"installation\" if possible",
                    spec_name,
                    decision
                        .suggest_plan_fix(side)
                        .unwrap_or_else(|| "an explicit build entry".to_string())
                )
            } else {
                format!(
                    "This plan resolver requires an explicit {}",
                    decision
                        .suggest_plan_fix(side)
                        .unwrap_or_else(|| "plan entry".to_string())
                )
            }
        }
        (None, _) => {
            let mut message = format!(
                "This plan resolver cannot decide what to do for resolving {}.",
                decision.initiator
            );
            if let (Some(left), Some(right)) = (
                decision.suggest_plan_fix(Choice::Left),
                decision.suggest_plan_fix(Choice::Right),
            ) {
                message.push_str(&format!(
                    " Please either add {} or {} in the plan",
                    left, right
                ));
            }
            message
        }
        (Some(Choice::Both), _) => {
            format!(
                "cannot do both {} and {}",
                decision.left(),
                decision.right()
            )
        }
        (Some(conflicting), _) => {
            let triggers = decision
                .triggers()
                .iter()
                .map(|t| {
                    format!(
                        "{} made by {} initiated by {}",
                        match t.choice {
                            Choice::Left => decision.left(),
                            _ => decision.right(),
                        },
                        t.uid,
                        t.plan_line
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "explicit {} decision made by {} conflicts with the following \
                 decision{}:\n{}",
                decision.kind.describe(conflicting),
                decision
                    .decision_maker()
                    .unwrap_or_else(|| "unknown".to_string()),
                if decision.triggers().len() > 1 { "s" } else { "" },
                triggers
            )
        }
    };

    PlanError::new(message)
}

impl PlanContext {
    /// Compute the execution DAG from the expansion DAG.
    ///
    /// The expansion DAG is walked in reverse topological order. Root is
    /// always scheduled; Decision vertices fold their triggers into the
    /// expected choice and vanish; Upload vertices are deferred and
    /// scheduled only once every one of their prerequisites is; any other
    /// vertex is scheduled when something scheduled depends on it, or
    /// when the decision it realises picked it. Undecided decisions are
    /// delegated to `resolver`.
    ///
    /// A resolver refusal is enriched with the failing action's uid and
    /// the root-connected actions in whose closure it lies.
    pub fn schedule(&self, resolver: &Resolver) -> Result<ActionDag> {
        let rev = self.tree.reverse_graph(false)?;
        let mut uploads: Vec<(Action, BTreeSet<String>)> = Vec::new();
        let mut dag = ActionDag::new();

        // Provenance tags carry over wholesale.
        for (uid, tag) in self.tree.tags() {
            dag.add_tag(uid, tag.clone());
        }

        for uid in rev.topological_order()? {
            let action = match rev.get(&uid) {
                Some(action) => action.clone(),
                None => continue,
            };

            if uid == "root" {
                dag.update_vertex(&uid, Some(action), std::iter::empty(), false)?;
                continue;
            }

            if let Action::Decision(decision) = &action {
                // Decisions never reach the output; they only get the
                // chance to derive their expected choice from what has
                // been scheduled so far.
                decision.apply_triggers(&dag);
                continue;
            }

            if action.is_upload() {
                uploads.push((action, self.tree.get_predecessors(&uid).clone()));
                continue;
            }

            // Successors of this vertex in the expansion DAG, Uploads
            // excluded: they are processed in the post-pass.
            let successors: Vec<String> = rev
                .get_predecessors(&uid)
                .iter()
                .filter(|k| rev.get(k).map(|a| !a.is_upload()).unwrap_or(false))
                .cloned()
                .collect();

            let dominating_decision = if successors.len() == 1 {
                rev.get(&successors[0]).and_then(|a| a.as_decision()).cloned()
            } else {
                None
            };

            if let Some(decision) = dominating_decision {
                // The vertex realises one side of a decision. It only
                // makes sense if the initiator itself was scheduled.
                if !dag.contains(&decision.initiator) {
                    continue;
                }

                match decision.get_decision() {
                    Some(choice) if choice == uid => {
                        dag.update_vertex(&uid, Some(action), std::iter::empty(), false)?;
                        dag.update_vertex(
                            &decision.initiator,
                            None,
                            std::iter::once(uid.clone()),
                            false,
                        )?;
                    }
                    Some(_) => {}
                    None => match resolver(&action, &decision) {
                        Ok(true) => {
                            dag.update_vertex(&uid, Some(action), std::iter::empty(), false)?;
                            dag.update_vertex(
                                &decision.initiator,
                                None,
                                std::iter::once(uid.clone()),
                                false,
                            )?;
                        }
                        Ok(false) => {}
                        Err(error) => {
                            // Work out which explicit plan entries pulled
                            // this action in, for the diagnostic.
                            dag.update_vertex(&uid, Some(action), std::iter::empty(), false)?;
                            dag.update_vertex(
                                &decision.initiator,
                                None,
                                std::iter::once(uid.clone()),
                                false,
                            )?;
                            let rev_out = dag.reverse_graph(false)?;
                            let initiators: Vec<String> = rev_out
                                .get_closure(&uid)
                                .into_iter()
                                .filter(|i| rev_out.get_predecessors(i).contains("root"))
                                .collect();
                            return Err(error.uid(uid).initiators(initiators));
                        }
                    },
                }
            } else {
                // Ordinary vertex: scheduled iff something scheduled
                // depends on it.
                let scheduled: Vec<String> = successors
                    .into_iter()
                    .filter(|k| dag.contains(k))
                    .collect();
                if !scheduled.is_empty() {
                    dag.update_vertex(&uid, Some(action), std::iter::empty(), false)?;
                    for successor in scheduled {
                        dag.update_vertex(
                            &successor,
                            None,
                            std::iter::once(uid.clone()),
                            false,
                        )?;
                    }
                }
            }
        }

        // Uploads fire only when everything they publish is scheduled.
        for (action, predecessors) in uploads {
            if predecessors.iter().all(|p| dag.contains(p)) {
                let uid = action.uid();
                dag.update_vertex(&uid, Some(action), predecessors, false)?;
                dag.update_vertex("root", None, std::iter::once(uid), false)?;
            }
        }

        Ok(dag)
    }
}

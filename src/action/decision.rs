//! Decision nodes: unresolved binary choices recorded during expansion
//! and resolved away by the scheduler.

use std::cell::RefCell;

use crate::graph::Dag;

use super::Action;

/// Which side of a decision is selected. `Both` is the sticky conflict
/// state reached when two plan entries pick opposite sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Left,
    Right,
    Both,
}

/// The two concrete decisions the planner knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    /// LEFT = assemble the source from repositories, RIGHT = download it.
    CreateSourceOrDownload,
    /// LEFT = build the component, RIGHT = install its binary package.
    BuildOrDownload,
}

impl DecisionKind {
    /// Short name of the action a choice stands for, used in diagnostics.
    pub fn describe(&self, choice: Choice) -> &'static str {
        match (self, choice) {
            (DecisionKind::CreateSourceOrDownload, Choice::Left) => "CreateSource",
            (DecisionKind::CreateSourceOrDownload, _) => "DownloadSource",
            (DecisionKind::BuildOrDownload, Choice::Left) => "Build",
            (DecisionKind::BuildOrDownload, _) => "DownloadBinary",
        }
    }
}

/// A rule saying "if `uid` is scheduled, this decision should go `choice`".
#[derive(Debug, Clone)]
pub struct Trigger {
    pub uid: String,
    pub choice: Choice,
    pub plan_line: String,
}

#[derive(Debug, Default)]
struct DecisionState {
    choice: Option<Choice>,
    expected_choice: Option<Choice>,
    decision_maker: Option<String>,
    triggers: Vec<Trigger>,
}

/// An unresolved choice between two realisations of the `initiator`'s
/// outcome.
///
/// The node itself never decides anything: it records what the plan asked
/// for (`choice`), what the triggers accumulated during expansion imply
/// (`expected_choice`), and who committed the plan to a side
/// (`decision_maker`). The scheduler reads the combination back through
/// [`get_decision`](Decision::get_decision).
///
/// Choice and trigger state evolves while the node sits in the expansion
/// DAG, so it is interior mutable; its uid is its identity and external
/// references hold the uid, not the node.
#[derive(Debug)]
pub struct Decision {
    pub kind: DecisionKind,
    pub uid: String,
    /// Uid of the parent whose realisation is being decided.
    pub initiator: String,
    left_action: Action,
    right_action: Action,
    state: RefCell<DecisionState>,
}

impl Decision {
    pub const BUILD: Choice = Choice::Left;
    pub const INSTALL: Choice = Choice::Right;
    pub const CREATE: Choice = Choice::Left;
    pub const DOWNLOAD: Choice = Choice::Right;

    pub fn new(kind: DecisionKind, root: &Action, left: Action, right: Action) -> Self {
        let initiator = root.uid();
        Self {
            kind,
            uid: format!("{}.decision", initiator),
            initiator,
            left_action: left,
            right_action: right,
            state: RefCell::new(DecisionState::default()),
        }
    }

    /// Uid of the left candidate.
    pub fn left(&self) -> String {
        self.left_action.uid()
    }

    /// Uid of the right candidate.
    pub fn right(&self) -> String {
        self.right_action.uid()
    }

    pub fn left_action(&self) -> &Action {
        &self.left_action
    }

    pub fn right_action(&self) -> &Action {
        &self.right_action
    }

    pub fn choice(&self) -> Option<Choice> {
        self.state.borrow().choice
    }

    pub fn expected_choice(&self) -> Option<Choice> {
        self.state.borrow().expected_choice
    }

    pub fn decision_maker(&self) -> Option<String> {
        self.state.borrow().decision_maker.clone()
    }

    pub fn triggers(&self) -> Vec<Trigger> {
        self.state.borrow().triggers.clone()
    }

    /// Record a choice made by a plan entry. Two entries disagreeing
    /// leave the decision in the `Both` conflict state.
    pub fn set_decision(&self, which: Choice, decision_maker: Option<&str>) {
        let mut state = self.state.borrow_mut();
        match state.choice {
            None => state.choice = Some(which),
            Some(current) if current != which => state.choice = Some(Choice::Both),
            Some(_) => {}
        }
        state.decision_maker = decision_maker.map(str::to_string);
    }

    /// Record that scheduling `trigger` implies `choice` for this node.
    pub fn add_trigger(&self, trigger: &Action, choice: Choice, plan_line: &str) {
        self.state.borrow_mut().triggers.push(Trigger {
            uid: trigger.uid(),
            choice,
            plan_line: plan_line.to_string(),
        });
    }

    /// Fold every trigger whose action landed in `dag` into the expected
    /// choice. Contradicting triggers degrade the expectation to `Both`.
    pub fn apply_triggers<V, T>(&self, dag: &Dag<V, T>) {
        let mut state = self.state.borrow_mut();
        let triggers = state.triggers.clone();
        for trigger in &triggers {
            if dag.contains(&trigger.uid) {
                match state.expected_choice {
                    None => state.expected_choice = Some(trigger.choice),
                    Some(expected) if expected != trigger.choice => {
                        state.expected_choice = Some(Choice::Both)
                    }
                    Some(_) => {}
                }
            }
        }
    }

    /// Uid of the side the plan committed to, or `None` when no decision
    /// can be made: nothing chosen, both sides chosen, or the explicit
    /// choice contradicts the expected one.
    pub fn get_decision(&self) -> Option<String> {
        let state = self.state.borrow();
        match state.choice {
            None | Some(Choice::Both) => None,
            Some(choice) => match state.expected_choice {
                Some(expected) if expected != choice => None,
                _ => Some(match choice {
                    Choice::Left => self.left(),
                    _ => self.right(),
                }),
            },
        }
    }

    /// Uid implied by the accumulated triggers, if they agree on a side.
    pub fn expected_action(&self) -> Option<String> {
        match self.state.borrow().expected_choice {
            Some(Choice::Left) => Some(self.left()),
            Some(Choice::Right) => Some(self.right()),
            _ => None,
        }
    }

    /// Render the plan entry that would commit this decision to `choice`,
    /// when one can be suggested.
    pub fn suggest_plan_fix(&self, choice: Choice) -> Option<String> {
        if self.kind != DecisionKind::BuildOrDownload {
            return None;
        }
        let action = match choice {
            Choice::Left => &self.left_action,
            _ => &self.right_action,
        };
        let spec = action.spec()?;

        let mut args = vec![format!("\"{}\"", spec.name())];
        if let Some(q) = &spec.qualifier {
            args.push(format!("qualifier=\"{}\"", q));
        }
        args.push(format!("build=\"{}\"", spec.env.build.platform));
        if spec.env.host.platform != spec.env.build.platform {
            args.push(format!("host=\"{}\"", spec.env.host.platform));
        }
        if spec.env.target.platform != spec.env.host.platform {
            args.push(format!("target=\"{}\"", spec.env.target.platform));
        }
        Some(format!("{}({})", spec.kind, args.join(", ")))
    }
}

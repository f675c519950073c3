//! Testing utilities for the Wave workspace
//!
//! Scripted collaborators (agent, reviewer, notifier, tool host) and small
//! fixtures shared by the kernel tests.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use wave_core::{
    Agent, AgentError, BatchSummary, CriterionScore, EntityContext, FieldValues, Notifier,
    NotifyError, OutputSchema, PromptRef, ReviewError, ReviewResult, Reviewer, Rubric,
    StepOutcome, StepRequest, ThreadId, ToolHost,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn targets(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("company-{i}")).collect()
}

pub fn company_schema() -> OutputSchema {
    OutputSchema::new("company profile")
        .field("headquarters", "Headquarters city")
        .field("ceo", "Current chief executive")
}

pub fn values(pairs: &[(&str, &str)]) -> Vec<(String, Value)> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), Value::String((*v).to_string())))
        .collect()
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Barrier a scripted step parks on until the test opens it
#[derive(Debug, Clone)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
    entered: Arc<AtomicUsize>,
    entered_signal: Arc<Notify>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            open: Arc::new(open),
            entered: Arc::new(AtomicUsize::new(0)),
            entered_signal: Arc::new(Notify::new()),
        }
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.entered_signal.notify_waiters();
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Resolves once `n` steps are parked (or have passed) on the gate
    pub async fn wait_entered(&self, n: usize) {
        loop {
            let notified = self.entered_signal.notified();
            if self.entered() >= n {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted agent
// ---------------------------------------------------------------------------

/// One scripted agent step
#[derive(Debug, Clone)]
pub enum Step {
    Ok(StepOutcome),
    Err,
    /// Call the value-saving tool, then return the outcome
    Save(Vec<(String, Value)>, StepOutcome),
    /// Park on the gate, then return the outcome
    Wait(Gate, StepOutcome),
    /// Delegate a sub-task from the unit's thread, then return the outcome
    Delegate {
        title: String,
        brief: String,
        then: StepOutcome,
    },
}

#[derive(Debug, Default)]
struct Script {
    steps: Mutex<VecDeque<Step>>,
    repeat: Option<Step>,
}

impl Script {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            repeat: None,
        }
    }

    fn next(&self) -> Step {
        self.steps.lock().pop_front().unwrap_or_else(|| {
            self.repeat
                .clone()
                .unwrap_or_else(|| Step::Ok(StepOutcome::stop("done")))
        })
    }
}

#[derive(Debug, Clone)]
pub struct AgentCall {
    pub target: String,
    pub thread_id: ThreadId,
    pub prompt: PromptRef,
    pub tools: Vec<String>,
}

/// Agent replaying a fixed script, optionally per target
///
/// An exhausted script answers `stop("done")`.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    default: Script,
    per_target: HashMap<String, Script>,
    calls: Mutex<Vec<AgentCall>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            default: Script::new(steps),
            ..Self::default()
        }
    }

    pub fn repeating(step: Step) -> Self {
        Self {
            default: Script {
                steps: Mutex::default(),
                repeat: Some(step),
            },
            ..Self::default()
        }
    }

    /// Every target answers in a single step with `text`
    pub fn answering(text: &str) -> Self {
        Self::repeating(Step::Ok(StepOutcome::stop(text)))
    }

    #[must_use]
    pub fn with_target(mut self, target: &str, steps: Vec<Step>) -> Self {
        self.per_target
            .insert(target.to_string(), Script::new(steps));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, target: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.target == target).count()
    }

    pub fn prompts_for(&self, target: &str) -> Vec<PromptRef> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.target == target)
            .map(|c| c.prompt)
            .collect()
    }

    pub fn call_log(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn step(&self, request: StepRequest) -> Result<StepOutcome, AgentError> {
        let target = request.scope.target.clone();
        self.calls.lock().push(AgentCall {
            target: target.clone(),
            thread_id: request.thread_id,
            prompt: request.prompt,
            tools: request.tools.iter().map(|t| t.name.clone()).collect(),
        });
        let step = self.per_target.get(&target).unwrap_or(&self.default).next();

        match step {
            Step::Ok(outcome) => Ok(outcome),
            Step::Err => Err(AgentError::Provider("scripted failure".into())),
            Step::Save(pairs, outcome) => {
                let values: FieldValues = pairs.into_iter().map(|(k, v)| (k, Some(v))).collect();
                request.scope.tools.save_values(values).await?;
                Ok(outcome)
            }
            Step::Wait(gate, outcome) => {
                gate.wait().await;
                Ok(outcome)
            }
            Step::Delegate { title, brief, then } => {
                request.scope.tools.delegate(None, &title, &brief).await?;
                Ok(then)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted reviewer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReviewCall {
    pub target: String,
    pub values: FieldValues,
}

/// Reviewer returning a scripted score sequence
///
/// Once the sequence is used up the last score repeats.
#[derive(Debug)]
pub struct ScriptedReviewer {
    scores: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
    unavailable: bool,
    always_pass: bool,
    calls: Mutex<Vec<ReviewCall>>,
}

impl ScriptedReviewer {
    pub fn new(scores: Vec<f64>) -> Self {
        Self {
            scores: Mutex::new(scores.into()),
            last: Mutex::new(1.0),
            unavailable: false,
            always_pass: false,
            calls: Mutex::default(),
        }
    }

    pub fn passing() -> Self {
        Self::new(vec![1.0])
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new(Vec::new())
        }
    }

    /// Claims every review passed, whatever the score
    pub fn lenient(scores: Vec<f64>) -> Self {
        Self {
            always_pass: true,
            ..Self::new(scores)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn call_log(&self) -> Vec<ReviewCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    async fn review(
        &self,
        entity: &EntityContext,
        values: &FieldValues,
        rubric: &Rubric,
    ) -> Result<ReviewResult, ReviewError> {
        self.calls.lock().push(ReviewCall {
            target: entity.target.clone(),
            values: values.clone(),
        });
        if self.unavailable {
            return Err(ReviewError::Unavailable("scripted outage".into()));
        }

        let score = match self.scores.lock().pop_front() {
            Some(s) => {
                *self.last.lock() = s;
                s
            }
            None => *self.last.lock(),
        };
        let criteria = rubric
            .criteria
            .iter()
            .map(|c| CriterionScore {
                criterion: c.name.clone(),
                score,
                feedback: format!("{} scored {score:.2}", c.name),
            })
            .collect();
        let passed = self.always_pass || rubric.passes(score);
        Ok(ReviewResult {
            passed,
            overall_score: score,
            summary: format!("scripted review of {}", entity.target),
            recommendations: if passed {
                Vec::new()
            } else {
                vec!["Cite a primary source for every value".into()]
            },
            criteria,
        })
    }
}

// ---------------------------------------------------------------------------
// Recording notifier / no-op tools
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    posts: Mutex<Vec<(Option<ThreadId>, BatchSummary)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn posts(&self) -> Vec<(Option<ThreadId>, BatchSummary)> {
        self.posts.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn post(
        &self,
        thread: Option<ThreadId>,
        summary: &BatchSummary,
    ) -> Result<(), NotifyError> {
        self.posts.lock().push((thread, summary.clone()));
        Ok(())
    }
}

/// Tool host that accepts everything and records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTools;

#[async_trait]
impl ToolHost for NoopTools {
    async fn save_values(&self, values: FieldValues) -> Result<usize, AgentError> {
        Ok(values.len())
    }

    async fn update_scratchpad(
        &self,
        _text: &str,
        _progress: Option<&str>,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn delegate(
        &self,
        _parent: Option<ThreadId>,
        _title: &str,
        _brief: &str,
    ) -> Result<ThreadId, AgentError> {
        Ok(ThreadId::new())
    }
}

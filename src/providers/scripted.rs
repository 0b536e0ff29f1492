//! A provider that replays a script of outcomes, for tests.

use super::ProviderSampleError;
use crate::core::MetricTree;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted sampling outcome.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Sample(MetricTree),
    Fail(String),
    /// Blocks for the duration, then returns the tree.
    Slow(Duration, MetricTree),
    Panic,
}

/// Replays queued steps in order and repeats the last one once the queue is
/// empty. Clones share the same script, so a test can keep a handle and push
/// further steps while the scheduler owns the provider.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    steps: Arc<Mutex<VecDeque<ScriptStep>>>,
    last: Arc<Mutex<Option<ScriptStep>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into_iter().collect())),
            ..Default::default()
        }
    }

    /// A provider that returns the same tree on every call.
    pub fn constant(tree: MetricTree) -> Self {
        Self::new([ScriptStep::Sample(tree)])
    }

    pub fn push(&self, step: ScriptStep) {
        self.steps.lock().unwrap().push_back(step);
    }

    /// Discards queued steps and repeats `step` from now on.
    pub fn set(&self, step: ScriptStep) {
        self.steps.lock().unwrap().clear();
        *self.last.lock().unwrap() = Some(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sample(&mut self) -> Result<MetricTree, ProviderSampleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let next = self.steps.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            if let Some(step) = next {
                *last = Some(step);
            }
            last.clone()
        };

        match step {
            Some(ScriptStep::Sample(tree)) => Ok(tree),
            Some(ScriptStep::Fail(reason)) => Err(ProviderSampleError::Sample(reason)),
            Some(ScriptStep::Slow(delay, tree)) => {
                std::thread::sleep(delay);
                Ok(tree)
            }
            Some(ScriptStep::Panic) => panic!("scripted provider panic"),
            None => Err(ProviderSampleError::Unavailable("empty script".to_string())),
        }
    }
}

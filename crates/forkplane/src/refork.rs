//! Refork decision gathering.
//!
//! The fork samples signals after each executed item and ships the
//! accumulated totals back on its next request. The master compares them
//! against the thresholds it configured in `Initialize` and decides whether
//! the fork keeps going or gets recycled.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::WorkResult;

/// Point in the fork's loop at which signals are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReforkMoment {
    AfterExecution,
}

/// Named signal a fork can accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReforkSignal {
    /// Items executed since the fork process started.
    ExecutedItems,
    /// Items whose outcome was not a success.
    FailedItems,
    /// Total wall time spent executing items.
    ExecutionMillis,
    /// Signal introduced by a newer master; never sampled.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReforkItemConfig {
    pub signal: ReforkSignal,
    pub moment: ReforkMoment,
    /// Value at which the fork is recycled. Zero disables the signal.
    pub threshold: u64,
}

impl ReforkItemConfig {
    pub fn new(signal: ReforkSignal, moment: ReforkMoment, threshold: u64) -> Self {
        Self {
            signal,
            moment,
            threshold,
        }
    }

    fn is_active(&self) -> bool {
        self.threshold > 0 && self.signal != ReforkSignal::Unknown
    }
}

/// Which signals to gather and when to refork.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReforkItemConfigs {
    #[serde(default)]
    pub items: Vec<ReforkItemConfig>,
}

impl ReforkItemConfigs {
    pub fn new(items: Vec<ReforkItemConfig>) -> Self {
        Self { items }
    }

    /// Recycle a fork after it has executed `n` items. Zero means never.
    pub fn fork_every(n: u64) -> Self {
        Self::default().with_item(ReforkItemConfig::new(
            ReforkSignal::ExecutedItems,
            ReforkMoment::AfterExecution,
            n,
        ))
    }

    pub fn with_item(mut self, item: ReforkItemConfig) -> Self {
        self.items.push(item);
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.items.iter().any(ReforkItemConfig::is_active)
    }

    fn active_at(&self, moment: ReforkMoment) -> impl Iterator<Item = &ReforkItemConfig> {
        self.items
            .iter()
            .filter(move |c| c.moment == moment && c.is_active())
    }
}

/// Signals accumulated by a fork, plus the configuration they were gathered under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReforkDecisionContext {
    pub signals: BTreeMap<ReforkSignal, u64>,
    pub configs: ReforkItemConfigs,
}

impl ReforkDecisionContext {
    pub fn signal(&self, signal: ReforkSignal) -> u64 {
        self.signals.get(&signal).copied().unwrap_or(0)
    }

    /// Signals whose threshold has been reached.
    pub fn triggered(&self) -> Vec<ReforkSignal> {
        self.configs
            .items
            .iter()
            .filter(|c| c.is_active() && self.signal(c.signal) >= c.threshold)
            .map(|c| c.signal)
            .collect()
    }

    pub fn should_refork(&self) -> bool {
        !self.triggered().is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReforkError {
    #[error("refork gatherer already initialized")]
    AlreadyInitialized,
    #[error("refork gatherer used before initialize")]
    NotInitialized,
}

/// Accumulates refork signals inside a fork.
///
/// Owned by the fork's execution loop; not shared across threads.
#[derive(Debug, Default)]
pub struct ReforkDecisionGatherer {
    configs: Option<ReforkItemConfigs>,
    signals: BTreeMap<ReforkSignal, u64>,
}

impl ReforkDecisionGatherer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, configs: ReforkItemConfigs) -> Result<(), ReforkError> {
        if self.configs.is_some() {
            return Err(ReforkError::AlreadyInitialized);
        }
        tracing::debug!(signals = configs.items.len(), "Refork gatherer initialized");
        self.configs = Some(configs);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.configs.is_some()
    }

    pub fn gather_data(
        &mut self,
        moment: ReforkMoment,
        result: &WorkResult,
    ) -> Result<ReforkDecisionContext, ReforkError> {
        let configs = self.configs.as_ref().ok_or(ReforkError::NotInitialized)?;

        for config in configs.active_at(moment) {
            let sample = match config.signal {
                ReforkSignal::ExecutedItems => 1,
                ReforkSignal::FailedItems => u64::from(!result.is_success()),
                ReforkSignal::ExecutionMillis => result.duration_millis,
                ReforkSignal::Unknown => continue,
            };
            let total = self.signals.entry(config.signal).or_insert(0);
            *total = total.saturating_add(sample);
        }

        Ok(ReforkDecisionContext {
            signals: self.signals.clone(),
            configs: configs.clone(),
        })
    }

    /// Clears accumulated signals; configuration is kept.
    pub fn reset(&mut self) {
        self.signals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::WorkItem;
    use std::time::Duration;

    fn ok(name: &str, millis: u64) -> WorkResult {
        WorkResult::success(WorkItem::new(name), Duration::from_millis(millis))
    }

    fn failed(name: &str) -> WorkResult {
        WorkResult::failure(WorkItem::new(name), "boom", Duration::from_millis(5))
    }

    #[test]
    fn gather_before_initialize_is_an_error() {
        let mut gatherer = ReforkDecisionGatherer::new();
        let err = gatherer
            .gather_data(ReforkMoment::AfterExecution, &ok("a", 1))
            .unwrap_err();
        assert_eq!(err, ReforkError::NotInitialized);
    }

    #[test]
    fn initialize_twice_is_an_error() {
        let mut gatherer = ReforkDecisionGatherer::new();
        gatherer.initialize(ReforkItemConfigs::fork_every(2)).unwrap();
        assert_eq!(
            gatherer.initialize(ReforkItemConfigs::fork_every(3)),
            Err(ReforkError::AlreadyInitialized)
        );
    }

    #[test]
    fn fork_every_triggers_at_threshold() {
        let mut gatherer = ReforkDecisionGatherer::new();
        gatherer.initialize(ReforkItemConfigs::fork_every(3)).unwrap();

        let mut contexts = Vec::new();
        for name in ["a", "b", "c"] {
            contexts.push(
                gatherer
                    .gather_data(ReforkMoment::AfterExecution, &ok(name, 1))
                    .unwrap(),
            );
        }

        assert!(!contexts[0].should_refork());
        assert!(!contexts[1].should_refork());
        assert!(contexts[2].should_refork());
        assert_eq!(contexts[2].signal(ReforkSignal::ExecutedItems), 3);
        assert_eq!(contexts[2].triggered(), vec![ReforkSignal::ExecutedItems]);
    }

    #[test]
    fn zero_threshold_never_triggers() {
        let mut gatherer = ReforkDecisionGatherer::new();
        gatherer.initialize(ReforkItemConfigs::fork_every(0)).unwrap();
        for _ in 0..100 {
            let ctx = gatherer
                .gather_data(ReforkMoment::AfterExecution, &ok("a", 1))
                .unwrap();
            assert!(!ctx.should_refork());
        }
        assert!(ReforkItemConfigs::fork_every(0).is_empty());
    }

    #[test]
    fn failed_items_and_execution_time_accumulate() {
        let configs = ReforkItemConfigs::default()
            .with_item(ReforkItemConfig::new(
                ReforkSignal::FailedItems,
                ReforkMoment::AfterExecution,
                2,
            ))
            .with_item(ReforkItemConfig::new(
                ReforkSignal::ExecutionMillis,
                ReforkMoment::AfterExecution,
                1_000,
            ));
        let mut gatherer = ReforkDecisionGatherer::new();
        gatherer.initialize(configs).unwrap();

        gatherer
            .gather_data(ReforkMoment::AfterExecution, &ok("a", 100))
            .unwrap();
        let ctx = gatherer
            .gather_data(ReforkMoment::AfterExecution, &failed("b"))
            .unwrap();
        assert_eq!(ctx.signal(ReforkSignal::FailedItems), 1);
        assert_eq!(ctx.signal(ReforkSignal::ExecutionMillis), 105);
        assert_eq!(ctx.signal(ReforkSignal::ExecutedItems), 0);
        assert!(!ctx.should_refork());

        let ctx = gatherer
            .gather_data(ReforkMoment::AfterExecution, &failed("c"))
            .unwrap();
        assert_eq!(ctx.triggered(), vec![ReforkSignal::FailedItems]);
    }

    #[test]
    fn reset_clears_signals_but_keeps_configs() {
        let mut gatherer = ReforkDecisionGatherer::new();
        gatherer.initialize(ReforkItemConfigs::fork_every(2)).unwrap();
        gatherer
            .gather_data(ReforkMoment::AfterExecution, &ok("a", 1))
            .unwrap();
        gatherer.reset();

        let ctx = gatherer
            .gather_data(ReforkMoment::AfterExecution, &ok("b", 1))
            .unwrap();
        assert_eq!(ctx.signal(ReforkSignal::ExecutedItems), 1);
        assert!(gatherer.is_initialized());
    }

    #[test]
    fn unknown_signal_names_are_tolerated() {
        let json = r#"{"items":[
            {"signal":"heap_bytes","moment":"after_execution","threshold":10},
            {"signal":"executed_items","moment":"after_execution","threshold":1}
        ]}"#;
        let configs: ReforkItemConfigs = serde_json::from_str(json).unwrap();
        assert_eq!(configs.items[0].signal, ReforkSignal::Unknown);

        let mut gatherer = ReforkDecisionGatherer::new();
        gatherer.initialize(configs).unwrap();
        let ctx = gatherer
            .gather_data(ReforkMoment::AfterExecution, &ok("a", 1))
            .unwrap();
        assert_eq!(ctx.triggered(), vec![ReforkSignal::ExecutedItems]);
        assert!(!ctx.signals.contains_key(&ReforkSignal::Unknown));
    }
}

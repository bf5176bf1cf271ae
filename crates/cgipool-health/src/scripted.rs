//! A probe whose answers are set up front, for driving pools and the
//! supervisor without real network traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use cgipool_core::HealthCheckSpec;

use crate::checker::HealthProbe;

/// Answers probes from per-target queues, falling back to a default.
///
/// Targets are matched exactly against `HealthCheckSpec::target`. Every
/// probed target is recorded so tests can assert on call order.
#[derive(Debug)]
pub struct ScriptedProbe {
    default: AtomicBool,
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    sticky: Mutex<HashMap<String, bool>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    /// Every unscripted target returns `default`.
    pub fn new(default: bool) -> Self {
        Self {
            default: AtomicBool::new(default),
            scripts: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue one-shot answers for `target`, consumed in order.
    pub fn push(&self, target: impl Into<String>, results: impl IntoIterator<Item = bool>) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts.entry(target.into()).or_default().extend(results);
    }

    /// Answer `result` for `target` whenever its queue is empty.
    pub fn set(&self, target: impl Into<String>, result: bool) {
        let mut sticky = self.sticky.lock().unwrap_or_else(|e| e.into_inner());
        sticky.insert(target.into(), result);
    }

    pub fn set_default(&self, result: bool) {
        self.default.store(result, Ordering::SeqCst);
    }

    /// Targets probed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many times `target` was probed.
    pub fn call_count(&self, target: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|t| t.as_str() == target)
            .count()
    }

    fn answer(&self, target: &str) -> bool {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(target.to_string());

        let queued = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(target)
            .and_then(VecDeque::pop_front);
        if let Some(result) = queued {
            return result;
        }
        let sticky = self
            .sticky
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .copied();
        sticky.unwrap_or_else(|| self.default.load(Ordering::SeqCst))
    }
}

impl Default for ScriptedProbe {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, spec: &HealthCheckSpec) -> bool {
        self.answer(&spec.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(target: &str) -> HealthCheckSpec {
        HealthCheckSpec::command(target, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn queued_then_sticky_then_default() {
        let probe = ScriptedProbe::new(true);
        probe.push("a", [false, true]);
        probe.set("b", false);

        assert!(!probe.probe(&spec("a")).await);
        assert!(probe.probe(&spec("a")).await);
        assert!(probe.probe(&spec("a")).await);
        assert!(!probe.probe(&spec("b")).await);
        assert!(probe.probe(&spec("c")).await);

        probe.set_default(false);
        assert!(!probe.probe(&spec("c")).await);

        assert_eq!(probe.call_count("a"), 3);
        assert_eq!(probe.calls().len(), 6);
    }
}

use std::collections::{BTreeMap, VecDeque};

/// Keeps the last `window` reported values of every score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreSummary {
    window: usize,
    history: BTreeMap<String, VecDeque<f64>>,
}

impl ScoreSummary {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            history: BTreeMap::new(),
        }
    }

    /// Gets the number of values kept per score.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Records a value, dropping the oldest one of `key` once the window is full.
    pub fn record(&mut self, key: &str, value: f64) {
        let values = self.history.entry(key.to_string()).or_default();
        if values.len() == self.window {
            values.pop_front();
        }
        values.push_back(value);
    }

    /// Gets the latest value of `key`.
    pub fn latest(&self, key: &str) -> Option<f64> {
        self.history.get(key)?.back().copied()
    }

    /// Gets the mean over the window of every recorded score.
    pub fn summary(&self) -> BTreeMap<String, f64> {
        self.history
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(key, values)| {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                (key.clone(), mean)
            })
            .collect()
    }
}

use std::{collections::BTreeMap, fmt};

use crate::scores::ScoreFn;

/// The aggregation key of a local score: `clients.<split>.<name>`.
pub fn local_score_key(split: &str, name: &str) -> String {
    format!("clients.{}.{}", split, name)
}

/// The reporting key of a global score: `server.<model>.<split>.<name>`.
pub fn global_score_key(model: &str, split: &str, name: &str) -> String {
    format!("server.{}.{}.{}", model, split, name)
}

/// A score function registered against a split.
#[derive(Clone)]
pub struct ScoreHook {
    pub split: String,
    pub name: String,
    pub score: ScoreFn,
}

impl fmt::Debug for ScoreHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoreHook")
            .field("split", &self.split)
            .field("name", &self.name)
            .finish()
    }
}

/// The registered score functions.
///
/// Global scores evaluate the deployed models on the global splits of the data manager, local
/// scores evaluate the trained client models on the local splits of the clients. Registering a
/// score twice for the same split and name replaces the former function.
#[derive(Debug, Clone, Default)]
pub struct ScoreHooks {
    global: BTreeMap<(String, String), ScoreHook>,
    local: BTreeMap<(String, String), ScoreHook>,
}

impl ScoreHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook_global_score(&mut self, split: &str, name: &str, score: ScoreFn) {
        insert(&mut self.global, split, name, score);
    }

    pub fn hook_local_score(&mut self, split: &str, name: &str, score: ScoreFn) {
        insert(&mut self.local, split, name, score);
    }

    /// Iterates over the global scores, ordered by split and name.
    pub fn global_scores(&self) -> impl Iterator<Item = &ScoreHook> {
        self.global.values()
    }

    /// Iterates over the local scores, ordered by split and name.
    pub fn local_scores(&self) -> impl Iterator<Item = &ScoreHook> {
        self.local.values()
    }
}

fn insert(
    hooks: &mut BTreeMap<(String, String), ScoreHook>,
    split: &str,
    name: &str,
    score: ScoreFn,
) {
    let hook = ScoreHook {
        split: split.to_string(),
        name: name.to_string(),
        score,
    };
    hooks.insert((split.to_string(), name.to_string()), hook);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray::{array, ArrayView1, ArrayView2};

    use super::*;

    fn constant(value: f64) -> ScoreFn {
        Arc::new(move |_: ArrayView2<f64>, _: ArrayView1<f64>| value)
    }

    #[test]
    fn test_rehook_overwrites() {
        let mut hooks = ScoreHooks::new();
        hooks.hook_global_score("test", "accuracy", constant(0.1));
        hooks.hook_global_score("test", "accuracy", constant(0.9));
        hooks.hook_local_score("train", "loss", constant(2.0));

        let global: Vec<&ScoreHook> = hooks.global_scores().collect();
        assert_eq!(global.len(), 1);
        let outputs = array![[1.0]];
        let targets = array![0.0];
        assert_eq!((global[0].score)(outputs.view(), targets.view()), 0.9);
        assert_eq!(hooks.local_scores().count(), 1);
    }

    #[test]
    fn test_keys() {
        assert_eq!(local_score_key("train", "loss"), "clients.train.loss");
        assert_eq!(
            global_score_key("cloud", "test", "accuracy"),
            "server.cloud.test.accuracy"
        );
    }
}

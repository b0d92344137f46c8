use std::collections::HashMap;

use itertools::Itertools;
use serde_json::{json, Value};

/// Identity of a call graph node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl FrameKey {
    pub fn new(function: &str, file: &str, line: u32) -> Self {
        Self {
            function: function.to_owned(),
            file: file.to_owned(),
            line,
        }
    }
}

/// A node of the aggregated call graph.
///
/// `value` and `count` only hold what was attributed to this exact node; a
/// sample's measurements are added to the last frame of its path and never to
/// the ancestors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSite {
    key: FrameKey,
    children: HashMap<FrameKey, CallSite>,
    value: f64,
    count: u64,
}

impl CallSite {
    pub fn new(function: &str, file: &str, line: u32) -> Self {
        Self {
            key: FrameKey::new(function, file, line),
            ..Default::default()
        }
    }

    /// Synthetic anchor of a forest; its children are the profile roots.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn key(&self) -> &FrameKey {
        &self.key
    }

    pub fn function(&self) -> &str {
        &self.key.function
    }

    pub fn file(&self) -> &str {
        &self.key.file
    }

    pub fn line(&self) -> u32 {
        self.key.line
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn children(&self) -> impl Iterator<Item = &CallSite> {
        self.children.values()
    }

    pub fn child(&self, function: &str, file: &str, line: u32) -> Option<&CallSite> {
        self.children.get(&FrameKey::new(function, file, line))
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn find_or_add_child(&mut self, function: &str, file: &str, line: u32) -> &mut CallSite {
        let key = FrameKey::new(function, file, line);
        self.children
            .entry(key)
            .or_insert_with_key(|key| CallSite {
                key: key.clone(),
                ..Default::default()
            })
    }

    pub fn increment(&mut self, value: f64, count: u64) {
        self.value += value;
        self.count += count;
    }

    /// Detaches the children, turning an anchor into a list of roots.
    pub fn into_children(self) -> Vec<CallSite> {
        self.children.into_values().collect()
    }

    /// Sum of `value` and `count` over this node and all its descendants.
    pub fn totals(&self) -> (f64, u64) {
        self.children
            .values()
            .map(CallSite::totals)
            .fold((self.value, self.count), |(v, c), (cv, cc)| (v + cv, c + cc))
    }

    pub fn to_json(&self) -> Value {
        let children = sorted_json(self.children.values());

        json!({
            "method_name": self.key.function,
            "file_name": self.key.file,
            "file_line": self.key.line,
            "measurement": self.value,
            "num_samples": self.count,
            "children": children,
        })
    }
}

/// Serializes sibling nodes heaviest first, so output is stable.
pub fn sorted_json<'a>(sites: impl IntoIterator<Item = &'a CallSite>) -> Vec<Value> {
    sites
        .into_iter()
        .map(|site| (site.totals().0, site))
        .sorted_by(|(a_total, a), (b_total, b)| {
            b_total
                .total_cmp(a_total)
                .then_with(|| a.key.function.cmp(&b.key.function))
                .then_with(|| a.key.file.cmp(&b.key.file))
                .then_with(|| a.key.line.cmp(&b.key.line))
        })
        .map(|(_, site)| site.to_json())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_or_add_child_reuses_existing_key() {
        let mut root = CallSite::root();
        root.find_or_add_child("main", "main.rs", 3).increment(1.0, 1);
        root.find_or_add_child("main", "main.rs", 3).increment(2.0, 1);
        root.find_or_add_child("main", "main.rs", 4);

        assert_eq!(root.children().count(), 2);
        let main = root.child("main", "main.rs", 3).unwrap();
        assert_eq!(main.value(), 3.0);
        assert_eq!(main.count(), 2);
    }

    #[test]
    fn increment_stays_on_the_node() {
        let mut root = CallSite::root();
        root.find_or_add_child("a", "a.rs", 1)
            .find_or_add_child("b", "b.rs", 2)
            .increment(64.0, 2);

        let a = root.child("a", "a.rs", 1).unwrap();
        assert_eq!(a.value(), 0.0);
        assert_eq!(a.totals(), (64.0, 2));
        let b = a.child("b", "b.rs", 2).unwrap();
        assert!(b.is_leaf());
        assert_eq!(b.value(), 64.0);
    }

    #[test]
    fn json_orders_children_by_weight() {
        let mut root = CallSite::new("root", "lib.rs", 1);
        root.find_or_add_child("light", "lib.rs", 2).increment(1.0, 1);
        root.find_or_add_child("heavy", "lib.rs", 3).increment(10.0, 1);

        let json = root.to_json();
        assert_eq!(json["method_name"], "root");
        assert_eq!(json["children"][0]["method_name"], "heavy");
        assert_eq!(json["children"][0]["measurement"], 10.0);
        assert_eq!(json["children"][1]["num_samples"], 1);
        assert_eq!(json["children"][1]["children"], json!([]));
    }

    #[test]
    fn ties_are_broken_by_frame() {
        let mut root = CallSite::root();
        for (function, line) in [("b", 2), ("a", 9), ("a", 1), ("c", 5)] {
            root.find_or_add_child(function, "lib.rs", line).increment(5.0, 1);
        }

        let order: Vec<_> = sorted_json(root.children())
            .iter()
            .map(|site| (site["method_name"].clone(), site["file_line"].clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                (json!("a"), json!(1)),
                (json!("a"), json!(9)),
                (json!("b"), json!(2)),
                (json!("c"), json!(5)),
            ]
        );
    }
}

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::callsite::{sorted_json, CallSite};

pub const RUNTIME: &str = "rust";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Cpu,
    Memory,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileType {
    CpuUsage,
    MemoryAllocationRate,
    BlockingCallTimes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Unit {
    Millisecond,
    Microsecond,
    Nanosecond,
    Byte,
    Kilobyte,
    Percent,
    Sample,
}

/// Result of one reporting window. Only the process id is attached after
/// construction, when the profile is about to be recorded.
#[derive(Debug, Clone)]
pub struct Profile {
    id: Uuid,
    process_id: String,
    category: Category,
    kind: ProfileType,
    unit: Unit,
    roots: Vec<CallSite>,
    duration: Duration,
    timespan: Duration,
    created_at: SystemTime,
}

impl Profile {
    /// `duration` is the capture time accumulated in the window, `timespan`
    /// the wall-clock length of the window.
    pub fn new(
        category: Category,
        kind: ProfileType,
        unit: Unit,
        roots: Vec<CallSite>,
        duration: Duration,
        timespan: Duration,
    ) -> Self {
        Profile {
            id: Uuid::new_v4(),
            process_id: String::new(),
            category,
            kind,
            unit,
            roots,
            duration,
            timespan,
            created_at: SystemTime::now(),
        }
    }

    pub fn with_process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = process_id.into();
        self
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn kind(&self) -> ProfileType {
        self.kind
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn roots(&self) -> &[CallSite] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn timespan(&self) -> Duration {
        self.timespan
    }

    /// Transmission-ready mapping. Durations and the timestamp are in milliseconds.
    pub fn to_json(&self) -> Value {
        let timestamp_ms = self
            .created_at
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since_epoch| since_epoch.as_millis() as u64);
        let roots = sorted_json(&self.roots);

        json!({
            "pid": self.process_id,
            "id": self.id.to_string(),
            "runtime": RUNTIME,
            "category": self.category,
            "type": self.kind,
            "unit": self.unit,
            "roots": roots,
            "duration": self.duration.as_millis() as u64,
            "timespan": self.timespan.as_millis() as u64,
            "timestamp": timestamp_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_boundary_fields() {
        let mut root = CallSite::root();
        root.find_or_add_child("alloc_buffer", "src/buf.rs", 12)
            .increment(4096.0, 2);
        let profile = Profile::new(
            Category::Memory,
            ProfileType::MemoryAllocationRate,
            Unit::Byte,
            root.into_children(),
            Duration::from_secs(10),
            Duration::from_secs(60),
        )
        .with_process_id("4242");

        let json = profile.to_json();
        assert_eq!(json["pid"], "4242");
        assert_eq!(json["runtime"], "rust");
        assert_eq!(json["category"], "memory");
        assert_eq!(json["type"], "memory-allocation-rate");
        assert_eq!(json["unit"], "byte");
        assert_eq!(json["duration"], 10_000);
        assert_eq!(json["timespan"], 60_000);
        assert_eq!(json["roots"][0]["method_name"], "alloc_buffer");
        assert_eq!(json["roots"][0]["measurement"], 4096.0);
        assert_eq!(json["id"], profile.id().to_string());
    }

    #[test]
    fn roots_are_ordered_heaviest_first() {
        let mut root = CallSite::root();
        root.find_or_add_child("small", "a.rs", 1).increment(8.0, 1);
        root.find_or_add_child("large", "b.rs", 1)
            .find_or_add_child("inner", "b.rs", 2)
            .increment(512.0, 1);
        root.find_or_add_child("medium", "c.rs", 1).increment(64.0, 1);
        let profile = Profile::new(
            Category::Memory,
            ProfileType::MemoryAllocationRate,
            Unit::Byte,
            root.into_children(),
            Duration::ZERO,
            Duration::from_secs(1),
        );

        let json = profile.to_json();
        let names: Vec<_> = json["roots"]
            .as_array()
            .unwrap()
            .iter()
            .map(|root| root["method_name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["large", "medium", "small"]);
    }

    #[test]
    fn empty_profile_has_no_roots() {
        let profile = Profile::new(
            Category::Cpu,
            ProfileType::CpuUsage,
            Unit::Millisecond,
            Vec::new(),
            Duration::ZERO,
            Duration::from_secs(1),
        );
        assert!(profile.is_empty());
        assert_eq!(profile.process_id(), "");
    }
}

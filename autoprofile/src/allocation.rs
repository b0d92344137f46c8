use std::time::Duration;

use autoprofile_common::{Line, Location, Sample, Snapshot};
use log::debug;

use crate::callsite::CallSite;
use crate::error::{ProfilerError, Result};
use crate::profile::{Category, Profile, ProfileType, Unit};
use crate::sampler::Sampler;
use crate::symbolicate::{ProcessSymbolizer, Symbolize};

/// Bytes still allocated at snapshot time.
pub const INUSE_SPACE: &str = "inuse_space";
/// Objects still allocated at snapshot time.
pub const INUSE_OBJECTS: &str = "inuse_objects";

/// Produces point-in-time heap snapshots. `Ok(None)` means the facility had
/// nothing to hand out.
pub trait HeapSnapshotSource: Send {
    fn read_heap_snapshot(&mut self) -> Result<Option<Snapshot>>;
}

impl<F> HeapSnapshotSource for F
where
    F: FnMut() -> Result<Option<Snapshot>> + Send,
{
    fn read_heap_snapshot(&mut self) -> Result<Option<Snapshot>> {
        self()
    }
}

/// Decides which frames and stacks are left out of call graphs.
#[derive(Debug, Clone)]
pub struct FrameFilter {
    include_agent_frames: bool,
    agent_markers: Vec<String>,
    bootstrap_functions: Vec<String>,
}

impl Default for FrameFilter {
    fn default() -> Self {
        FrameFilter {
            include_agent_frames: false,
            agent_markers: vec![
                format!("{}::", env!("CARGO_CRATE_NAME")),
                format!("/{}/src/", env!("CARGO_PKG_NAME")),
            ],
            bootstrap_functions: [
                "_start",
                "__libc_start_main",
                "__libc_start_call_main",
                "std::rt::lang_start_internal",
                "start_thread",
                "clone",
                "clone3",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        }
    }
}

impl FrameFilter {
    pub fn with_agent_frames(mut self, include: bool) -> Self {
        self.include_agent_frames = include;
        self
    }

    /// Frames whose function or file contains `marker` count as agent frames.
    pub fn with_agent_marker(mut self, marker: &str) -> Self {
        self.agent_markers.push(marker.to_owned());
        self
    }

    pub fn with_bootstrap_function(mut self, function: &str) -> Self {
        self.bootstrap_functions.push(function.to_owned());
        self
    }

    pub fn is_agent_frame(&self, line: &Line) -> bool {
        self.agent_markers
            .iter()
            .any(|marker| line.function.contains(marker.as_str()) || line.file.contains(marker.as_str()))
    }

    /// A stack that passes through the agent anywhere is the agent's own work.
    pub fn is_agent_stack(&self, sample: &Sample) -> bool {
        !self.include_agent_frames
            && sample
                .locations
                .iter()
                .flat_map(|location| location.lines.iter())
                .any(|line| self.is_agent_frame(line))
    }

    pub fn skips_frame(&self, line: &Line) -> bool {
        (!self.include_agent_frames && self.is_agent_frame(line))
            || self.bootstrap_functions.iter().any(|f| *f == line.function)
    }
}

/// First line that names a function; unresolved locations are named by address.
fn read_frame(location: &Location) -> Line {
    location
        .lines
        .iter()
        .find(|line| !line.function.is_empty())
        .cloned()
        .unwrap_or_else(|| Line {
            function: format!("{:#x}", location.address),
            ..Default::default()
        })
}

/// Merges the snapshot's stacks into a forest under a synthetic root.
///
/// Samples that are agent-internal, zero-sized, or left with no frames after
/// filtering contribute nothing.
pub fn build_call_graph(snapshot: &Snapshot, filter: &FrameFilter) -> Result<CallSite> {
    let (Some(space_index), Some(objects_index)) = (
        snapshot.value_index(INUSE_SPACE),
        snapshot.value_index(INUSE_OBJECTS),
    ) else {
        return Err(ProfilerError::UnrecognizedProfile(format!(
            "sample types must include {INUSE_SPACE} and {INUSE_OBJECTS}"
        )));
    };

    let mut top = CallSite::root();

    for sample in &snapshot.samples {
        if filter.is_agent_stack(sample) {
            continue;
        }

        let value = sample.values.get(space_index).copied().unwrap_or(0);
        if value == 0 {
            continue;
        }
        let count = sample.values.get(objects_index).copied().unwrap_or(0);

        let frames: Vec<Line> = sample
            .locations
            .iter()
            .rev()
            .map(read_frame)
            .filter(|frame| !filter.skips_frame(frame))
            .collect();
        if frames.is_empty() {
            continue;
        }

        let mut current = &mut top;
        for frame in &frames {
            current = current.find_or_add_child(&frame.function, &frame.file, frame.line);
        }
        current.increment(value as f64, count.max(0) as u64);
    }

    Ok(top)
}

/// Reports memory still in use, attributed to the allocating call paths.
///
/// A heap snapshot is a point-in-time view, so there is no capture window to
/// open or close; this sampler is meant to run report-only.
pub struct AllocationSampler {
    source: Box<dyn HeapSnapshotSource>,
    symbolizer: Option<Box<dyn Symbolize>>,
    filter: FrameFilter,
}

impl AllocationSampler {
    pub fn new(source: impl HeapSnapshotSource + 'static) -> Self {
        AllocationSampler {
            source: Box::new(source),
            symbolizer: Some(Box::new(ProcessSymbolizer::default())),
            filter: FrameFilter::default(),
        }
    }

    /// `None` for sources that deliver already symbolized snapshots.
    pub fn with_symbolizer(mut self, symbolizer: Option<Box<dyn Symbolize>>) -> Self {
        self.symbolizer = symbolizer;
        self
    }

    pub fn with_filter(mut self, filter: FrameFilter) -> Self {
        self.filter = filter;
        self
    }

    fn read_heap_snapshot(&mut self) -> Result<Snapshot> {
        let mut snapshot = self
            .source
            .read_heap_snapshot()?
            .ok_or(ProfilerError::NoProfile)?;

        if let Some(symbolizer) = &self.symbolizer {
            symbolizer.symbolize(&mut snapshot)?;
        }
        snapshot.check_valid()?;

        Ok(snapshot)
    }
}

impl Sampler for AllocationSampler {
    fn reset(&mut self) {}

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn build_profile(&mut self, duration: Duration, timespan: Duration) -> Result<Profile> {
        let snapshot = self.read_heap_snapshot()?;
        let top = build_call_graph(&snapshot, &self.filter)?;
        let roots = top.into_children();
        debug!(
            "allocation call graph built from {} samples, {} roots",
            snapshot.samples.len(),
            roots.len()
        );

        Ok(Profile::new(
            Category::Memory,
            ProfileType::MemoryAllocationRate,
            Unit::Byte,
            roots,
            duration,
            timespan,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoprofile_common::ValueType;

    fn heap_snapshot() -> Snapshot {
        Snapshot::new(vec![
            ValueType::new(INUSE_OBJECTS, "count"),
            ValueType::new(INUSE_SPACE, "bytes"),
        ])
    }

    /// `frames` are given outermost first and stored leaf-first like a capture.
    fn sample(frames: &[(&str, &str, u32)], objects: i64, bytes: i64) -> Sample {
        let locations = frames
            .iter()
            .rev()
            .enumerate()
            .map(|(i, (function, file, line))| {
                Location::new(i as u64 + 1, 0x1000 + i as u64).with_line(function, file, *line)
            })
            .collect();
        Sample {
            locations,
            values: vec![objects, bytes],
        }
    }

    fn roots_total(top: &CallSite) -> (f64, u64) {
        top.children()
            .map(CallSite::totals)
            .fold((0.0, 0), |(v, c), (cv, cc)| (v + cv, c + cc))
    }

    #[test]
    fn shared_prefix_merges_and_value_lands_on_last_frame() {
        let mut snapshot = heap_snapshot();
        snapshot.samples.push(sample(
            &[("main", "main.rs", 10), ("load", "io.rs", 20), ("read", "io.rs", 30)],
            1,
            100,
        ));
        snapshot.samples.push(sample(
            &[("main", "main.rs", 10), ("load", "io.rs", 20), ("parse", "parse.rs", 5)],
            2,
            50,
        ));

        let top = build_call_graph(&snapshot, &FrameFilter::default()).unwrap();
        assert_eq!(top.children().count(), 1);
        let main = top.child("main", "main.rs", 10).unwrap();
        let load = main.child("load", "io.rs", 20).unwrap();
        assert_eq!(main.value(), 0.0);
        assert_eq!(load.value(), 0.0);
        assert_eq!(load.children().count(), 2);
        assert_eq!(load.child("read", "io.rs", 30).unwrap().value(), 100.0);
        let parse = load.child("parse", "parse.rs", 5).unwrap();
        assert_eq!(parse.value(), 50.0);
        assert_eq!(parse.count(), 2);
    }

    #[test]
    fn totals_match_surviving_samples() {
        let mut snapshot = heap_snapshot();
        let mut expected = (0.0, 0);
        for i in 0..40i64 {
            let bytes = if i % 7 == 0 { 0 } else { i * 16 };
            let agent = i % 5 == 0;
            let leaf = if agent { "autoprofile::report" } else { "leaf" };
            snapshot.samples.push(sample(
                &[("main", "main.rs", 1), ("work", "work.rs", (i % 3) as u32), (leaf, "x.rs", 2)],
                i,
                bytes,
            ));
            if bytes != 0 && !agent {
                expected.0 += bytes as f64;
                expected.1 += i as u64;
            }
        }

        let top = build_call_graph(&snapshot, &FrameFilter::default()).unwrap();
        assert_eq!(roots_total(&top), expected);
        assert_eq!(top.value(), 0.0);
    }

    #[test]
    fn agent_stacks_are_dropped_unless_included() {
        let mut snapshot = heap_snapshot();
        snapshot.samples.push(sample(
            &[("main", "main.rs", 1), ("autoprofile::scheduler::report", "src/scheduler.rs", 9)],
            1,
            64,
        ));

        let top = build_call_graph(&snapshot, &FrameFilter::default()).unwrap();
        assert!(top.is_leaf());

        let filter = FrameFilter::default().with_agent_frames(true);
        let top = build_call_graph(&snapshot, &filter).unwrap();
        let main = top.child("main", "main.rs", 1).unwrap();
        assert_eq!(main.totals(), (64.0, 1));
    }

    #[test]
    fn bootstrap_frames_are_skipped() {
        let mut snapshot = heap_snapshot();
        snapshot.samples.push(sample(
            &[("_start", "", 0), ("__libc_start_main", "", 0), ("main", "main.rs", 1)],
            1,
            8,
        ));
        snapshot
            .samples
            .push(sample(&[("start_thread", "", 0), ("clone3", "", 0)], 1, 8));

        let top = build_call_graph(&snapshot, &FrameFilter::default()).unwrap();
        assert_eq!(top.children().count(), 1);
        assert_eq!(top.child("main", "main.rs", 1).unwrap().value(), 8.0);
    }

    #[test]
    fn unresolved_locations_are_named_by_address() {
        let mut snapshot = heap_snapshot();
        snapshot.samples.push(Sample {
            locations: vec![Location::new(1, 0xdead)],
            values: vec![1, 32],
        });

        let top = build_call_graph(&snapshot, &FrameFilter::default()).unwrap();
        assert_eq!(top.child("0xdead", "", 0).unwrap().value(), 32.0);
    }

    #[test]
    fn missing_dimension_fails_before_reading_samples() {
        let mut snapshot = Snapshot::new(vec![ValueType::new(INUSE_SPACE, "bytes")]);
        // Malformed on purpose: no values at all.
        snapshot.samples.push(Sample {
            locations: vec![Location::new(1, 0x10)],
            values: Vec::new(),
        });

        let err = build_call_graph(&snapshot, &FrameFilter::default()).unwrap_err();
        assert!(matches!(err, ProfilerError::UnrecognizedProfile(_)));
    }

    #[test]
    fn snapshot_without_sample_types_is_unrecognized() {
        let mut sampler =
            AllocationSampler::new(|| -> Result<Option<Snapshot>> { Ok(Some(Snapshot::default())) })
                .with_symbolizer(None);

        let err = sampler
            .build_profile(Duration::ZERO, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, ProfilerError::UnrecognizedProfile(_)));
    }

    #[test]
    fn build_profile_reports_memory_roots() {
        let mut sampler = AllocationSampler::new(|| -> Result<Option<Snapshot>> {
            let mut snapshot = heap_snapshot();
            snapshot
                .samples
                .push(sample(&[("main", "main.rs", 1), ("grow", "vec.rs", 4)], 3, 300));
            Ok(Some(snapshot))
        })
        .with_symbolizer(None);

        sampler.reset();
        let profile = sampler
            .build_profile(Duration::ZERO, Duration::from_secs(120))
            .unwrap();
        assert_eq!(profile.category(), Category::Memory);
        assert_eq!(profile.unit(), Unit::Byte);
        assert_eq!(profile.roots().len(), 1);
        assert_eq!(profile.roots()[0].totals(), (300.0, 3));
        assert_eq!(profile.timespan(), Duration::from_secs(120));
    }

    #[test]
    fn filtered_only_snapshot_builds_empty_profile() {
        let mut sampler = AllocationSampler::new(|| -> Result<Option<Snapshot>> {
            let mut snapshot = heap_snapshot();
            snapshot.samples.push(sample(&[("main", "main.rs", 1)], 0, 0));
            snapshot
                .samples
                .push(sample(&[("autoprofile::timer", "timer.rs", 1)], 1, 10));
            Ok(Some(snapshot))
        })
        .with_symbolizer(None);

        let profile = sampler.build_profile(Duration::ZERO, Duration::ZERO).unwrap();
        assert!(profile.is_empty());
    }

    #[test]
    fn missing_or_invalid_snapshots_fail() {
        let mut sampler = AllocationSampler::new(|| -> Result<Option<Snapshot>> { Ok(None) }).with_symbolizer(None);
        assert!(matches!(
            sampler.build_profile(Duration::ZERO, Duration::ZERO),
            Err(ProfilerError::NoProfile)
        ));

        let mut sampler = AllocationSampler::new(|| -> Result<Option<Snapshot>> {
            let mut snapshot = heap_snapshot();
            snapshot.samples.push(Sample {
                locations: Vec::new(),
                values: vec![1],
            });
            Ok(Some(snapshot))
        })
        .with_symbolizer(None);
        assert!(matches!(
            sampler.build_profile(Duration::ZERO, Duration::ZERO),
            Err(ProfilerError::InvalidSnapshot(_))
        ));
    }
}

use std::borrow::Borrow;
use std::collections::HashMap;

use autoprofile_common::{Line, Snapshot};
use blazesym::symbolize::source::{Process, Source};
use blazesym::symbolize::{CodeInfo, Input, Sym, Symbolized, Symbolizer};
use blazesym::{Addr, Pid};
use itertools::Itertools;
use log::debug;
use rustc_demangle::demangle;

use crate::error::Result;

const ADDR_WIDTH: usize = 16;

/// Fills in function/file/line information for snapshot locations that only
/// carry an address.
pub trait Symbolize: Send {
    fn symbolize(&self, snapshot: &mut Snapshot) -> Result<()>;
}

/// Resolves addresses against the memory map of the current process.
#[derive(Debug, Clone)]
pub struct ProcessSymbolizer {
    code_info: bool,
    inlined_fns: bool,
}

impl Default for ProcessSymbolizer {
    fn default() -> Self {
        ProcessSymbolizer {
            code_info: true,
            inlined_fns: true,
        }
    }
}

impl ProcessSymbolizer {
    pub fn new(code_info: bool, inlined_fns: bool) -> Self {
        ProcessSymbolizer {
            code_info,
            inlined_fns,
        }
    }
}

impl Symbolize for ProcessSymbolizer {
    fn symbolize(&self, snapshot: &mut Snapshot) -> Result<()> {
        let addrs: Vec<Addr> = snapshot
            .locations_mut()
            .filter(|location| !location.is_symbolized() && is_a_valid_addr(location.address))
            .map(|location| location.address)
            .unique()
            .collect();
        if addrs.is_empty() {
            return Ok(());
        }

        let src = Source::Process(Process::new(Pid::Slf));
        let symbolizer = Symbolizer::builder()
            .enable_code_info(self.code_info)
            .enable_demangling(true)
            .enable_inlined_fns(self.inlined_fns)
            .build();
        let syms = symbolizer.symbolize(&src, Input::AbsAddr(&addrs))?;

        let resolved: HashMap<Addr, Vec<Line>> = addrs
            .iter()
            .copied()
            .zip(syms)
            .map(|(addr, sym)| (addr, lines_for(addr, sym)))
            .collect();
        debug!("symbolized {} addresses", resolved.len());

        for location in snapshot.locations_mut() {
            if location.is_symbolized() {
                continue;
            }
            if let Some(lines) = resolved.get(&location.address) {
                location.lines = lines.clone();
            }
        }

        Ok(())
    }
}

/// Innermost inlined function first, the containing symbol last.
fn lines_for(addr: Addr, symbolized: Symbolized<'_>) -> Vec<Line> {
    match symbolized {
        Symbolized::Sym(Sym {
            name,
            code_info,
            inlined,
            ..
        }) => {
            let mut lines: Vec<Line> = inlined
                .iter()
                .rev()
                .map(|frame| frame_line(&frame.name, frame.code_info.as_ref()))
                .collect();
            lines.push(frame_line(&name, code_info.as_ref()));
            lines
        }
        Symbolized::Unknown(..) => vec![Line {
            function: format!("{addr:#0ADDR_WIDTH$x}: <no-symbol>"),
            ..Default::default()
        }],
    }
}

fn frame_line<'src, C: Borrow<CodeInfo<'src>>>(name: &str, code_info: Option<&C>) -> Line {
    let (file, line) = code_info
        .map(|info| {
            let info = info.borrow();
            (info.to_path().display().to_string(), info.line.unwrap_or(0))
        })
        .unwrap_or_default();

    Line {
        function: clean_symbol_name(name),
        file,
        line,
    }
}

/// Demangles and drops generic parameters so monomorphized copies of one
/// function merge into a single call graph node.
pub fn clean_symbol_name(name: &str) -> String {
    remove_generics(format!("{:#}", demangle(name)))
}

fn is_a_valid_addr(ip: u64) -> bool {
    match ip {
        0 => false,
        // user space
        0x1..=0x0000_7FFF_FFFF_FFFF => true,
        // kernel space
        0xFFFF_8000_0000_0000..=0xFFFF_FFFF_FFFF_FFFE => true,
        // bogus (EFAULT) or non-canonical
        _ => false,
    }
}

fn remove_generics(mut func: String) -> String {
    func = func.replace(';', ":");
    let mut bracket_depth = 0;

    let mut new_str = String::with_capacity(func.len());
    let mut continous_seperator = 0;
    let mut running = false;

    for c in func.chars() {
        match c {
            '<' => {
                bracket_depth += 1;
            }
            '>' => {
                bracket_depth -= 1;
            }
            ':' => {
                if bracket_depth > 0 {
                    continue;
                }

                continous_seperator += 1;

                if continous_seperator <= 2 && running {
                    new_str.push(c);
                }
            }
            _ => {
                if bracket_depth > 0 {
                    continue;
                }
                continous_seperator = 0;
                new_str.push(c);
                running = true;
            }
        };
    }

    new_str
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoprofile_common::{Location, Sample, ValueType};

    #[test]
    fn test_clean() {
        let tests = [
            "<<lock_api::rwlock::RwLock<R,T> as core::fmt::Debug>::fmt::LockedPlaceholder as core::fmt::Debug>::fmt",
            "core::array::<impl core::ops::index::IndexMut<I> for [T: N]>::index_mut",
            "alloc::collections::btree::node::NodeRef<alloc::collections::btree::node::marker::Immut,K,V,Type>::keys",
            "core::ptr::drop_in_place<gimli::read::line::LineInstruction<gimli::read::endian_reader::EndianReader<gimli::endianity::RunTimeEndian,alloc::rc::Rc<[u8]>>,usize>>",
            "<core::iter::adapters::enumerate::Enumerate<I> as core::iter::traits::iterator::Iterator>::next",
        ];

        let expected = [
            "fmt",
            "core::array::index_mut",
            "alloc::collections::btree::node::NodeRef::keys",
            "core::ptr::drop_in_place",
            "next",
        ];

        for (test, expected) in tests.iter().zip(expected) {
            assert_eq!(remove_generics(test.to_string()), expected);
        }
    }

    #[test]
    fn mangled_names_are_demangled_and_cleaned() {
        assert_eq!(
            clean_symbol_name("_ZN4core3ptr13drop_in_place17h0123456789abcdefE"),
            "core::ptr::drop_in_place"
        );
        assert_eq!(clean_symbol_name("malloc"), "malloc");
    }

    #[test]
    fn rejects_bogus_addresses() {
        assert!(!is_a_valid_addr(0));
        assert!(!is_a_valid_addr(u64::MAX));
        assert!(!is_a_valid_addr(0x0000_8000_0000_0000));
        assert!(is_a_valid_addr(0x5555_5555_1000));
        assert!(is_a_valid_addr(0xFFFF_FFFF_8100_0000));
    }

    #[test]
    fn symbolized_snapshot_is_left_untouched() {
        let mut snapshot = Snapshot::new(vec![ValueType::new("inuse_space", "bytes")]);
        snapshot.samples.push(Sample {
            locations: vec![
                Location::new(1, 0x1000).with_line("leaf", "leaf.rs", 7),
                Location::new(2, 0).with_line("main", "main.rs", 1),
            ],
            values: vec![16],
        });
        let before = snapshot.clone();

        ProcessSymbolizer::default().symbolize(&mut snapshot).unwrap();
        assert_eq!(snapshot, before);
    }
}

// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use range_map::{Range, RangeMap};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Identity fields from a MODULE record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Operating system the module was built for.
    pub os: String,
    /// CPU architecture, e.g. `x86` or `x86_64`.
    pub cpu: String,
    /// The debug identifier, as a raw string.
    pub debug_id: String,
    /// The debug file name.
    pub debug_file: String,
}

/// A publicly visible linker symbol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublicSymbol {
    /// The symbol's address relative to the module's load address.
    pub address: u64,
    /// The size of parameters passed to the function.
    pub parameter_size: u32,
    /// The name of the symbol.
    pub name: String,
    /// Whether multiple symbols resolve to this address.
    pub multiple: bool,
}

impl Ord for PublicSymbol {
    fn cmp(&self, other: &PublicSymbol) -> Ordering {
        let o = self.address.cmp(&other.address);
        if o != Ordering::Equal {
            o
        } else {
            // Fall back to sorting by name if addresses are equal.
            let nameo = self.name.cmp(&other.name);
            if nameo != Ordering::Equal {
                nameo
            } else {
                // Compare parameter size just for sanity.
                self.parameter_size.cmp(&other.parameter_size)
            }
        }
    }
}

impl PartialOrd for PublicSymbol {
    fn partial_cmp(&self, other: &PublicSymbol) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A mapping from machine code bytes to source line and file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLine {
    /// The start address relative to the module's load address.
    pub address: u64,
    /// The size of this range of instructions in bytes.
    pub size: u64,
    /// The source file name that generated this machine code.
    ///
    /// This is an index into `SymbolFile::files`.
    pub file: i32,
    /// The line number in `file` that generated this machine code.
    pub line: u32,
}

/// The callee side of an inlined call, shared by all of its call sites.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineOrigin {
    /// The name of the inlined function.
    pub name: String,
    /// The file the function is declared in. Only present in the older
    /// symbol schema; `-1` marks compiler-generated functions.
    pub file: Option<i32>,
}

/// One inlined call within a function, possibly nested in another inline.
///
/// Nodes live in their `Function`'s arena and refer to children by index,
/// so a child never holds a reference back to its parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inline {
    /// The line of the call site in the caller.
    pub call_site_line: u32,
    /// The file of the call site. Records from the older schema don't carry
    /// this; the origin's declaring file is the best remaining guess.
    pub call_site_file: Option<i32>,
    /// Which `InlineOrigin` was inlined here.
    pub origin_id: u32,
    /// Covered `(address, size)` ranges, relative to the module.
    pub ranges: Vec<(u64, u64)>,
    /// Arena indices of inlines nested directly inside this one.
    pub children: Vec<usize>,
}

impl Inline {
    /// The start of the range containing `addr`, if any range does.
    pub fn covering_range(&self, addr: u64) -> Option<u64> {
        self.ranges
            .iter()
            .find(|&&(start, size)| addr >= start && addr - start < size)
            .map(|&(start, _)| start)
    }
}

/// A source-language function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    /// The function's start address relative to the module's load address.
    pub address: u64,
    /// The size of the function in bytes.
    pub size: u64,
    /// The size of parameters passed to the function.
    pub parameter_size: u32,
    /// The name of the function as declared in the source.
    pub name: String,
    /// Whether multiple symbols resolve to this address.
    pub multiple: bool,
    /// Source line information for this function.
    pub lines: RangeMap<u64, SourceLine>,
    /// Arena of inlined calls within this function.
    pub inlines: Vec<Inline>,
    /// Arena indices of the outermost (nest level 0) inlines.
    pub inline_roots: Vec<usize>,
}

impl Function {
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.address,
            self.address.checked_add(self.size - 1)?,
        ))
    }

    /// The chain of inlines containing `addr`, ordered outermost first.
    pub fn inlines_at(&self, addr: u64) -> Vec<&Inline> {
        let mut chain = Vec::new();
        let mut candidates = &self.inline_roots;
        loop {
            let next = candidates
                .iter()
                .map(|&idx| &self.inlines[idx])
                .find(|inline| inline.covering_range(addr).is_some());
            match next {
                Some(inline) => {
                    chain.push(inline);
                    candidates = &inline.children;
                }
                None => break,
            }
        }
        chain
    }
}

/// CFI rules for recovering registers, applying at a specific address.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct CfiRules {
    /// The address in question.
    pub address: u64,
    /// Postfix expressions to evaluate to recover register values.
    pub rules: String,
}

/// Information used for unwinding stack frames using CFI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackInfoCfi {
    /// The initial rules for this address range.
    pub init: CfiRules,
    /// The size of this entire address range.
    pub size: u64,
    /// Additional rules to use at specified addresses, in address order.
    pub add_rules: Vec<CfiRules>,
}

impl StackInfoCfi {
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.init.address,
            self.init.address.checked_add(self.size - 1)?,
        ))
    }
}

/// Which unwinding strategy a STACK WIN record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WinFrameType {
    /// The record carries a postfix program to evaluate.
    FrameData,
    /// Old-style FPO data with a fixed frame layout.
    Fpo,
    /// Some other frame type; stored, but never evaluated.
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WinStackThing {
    ProgramString(String),
    AllocatesBasePointer(bool),
}

/// Information used for unwinding stack frames using Windows frame data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowsFrameInfo {
    /// Which family of unwind data this record belongs to.
    pub frame_type: WinFrameType,
    /// The address in question.
    pub address: u64,
    /// The size of the address range covered.
    pub size: u64,
    /// The size of the function's prologue.
    pub prologue_size: u32,
    /// The size of the function's epilogue.
    pub epilogue_size: u32,
    /// The size of arguments passed to this function.
    pub parameter_size: u32,
    /// The number of bytes in the stack frame for callee-saves registers.
    pub saved_register_size: u32,
    /// The number of bytes in the stack frame for local variables.
    pub local_size: u32,
    /// The maximum number of bytes pushed onto the stack by this frame.
    pub max_stack_size: u32,
    /// A program string or a flag regarding a base pointer.
    pub program_string_or_base_pointer: WinStackThing,
}

impl WindowsFrameInfo {
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.address,
            self.address.checked_add(self.size - 1)?,
        ))
    }

    /// The postfix program for this frame, for frame-data records.
    pub fn program_string(&self) -> Option<&str> {
        match &self.program_string_or_base_pointer {
            WinStackThing::ProgramString(s) => Some(s),
            WinStackThing::AllocatesBasePointer(_) => None,
        }
    }

    /// Whether this frame allocates `%ebp`, for FPO records.
    pub fn allocates_base_pointer(&self) -> bool {
        match &self.program_string_or_base_pointer {
            WinStackThing::ProgramString(_) => false,
            WinStackThing::AllocatesBasePointer(b) => *b,
        }
    }
}

/// A parsed symbol file, indexed for address lookup.
#[derive(Debug)]
pub struct SymbolFile {
    /// Identity of the module this file describes, when recorded.
    pub module_info: Option<ModuleInfo>,
    /// The set of source files involved in compilation.
    pub files: HashMap<i32, String>,
    /// Named targets of inlined calls.
    pub inline_origins: HashMap<u32, InlineOrigin>,
    /// Publicly visible symbols, sorted by address.
    pub publics: Vec<PublicSymbol>,
    /// Functions.
    pub functions: RangeMap<u64, Function>,
    /// CFI unwind information.
    pub cfi_stack_info: RangeMap<u64, StackInfoCfi>,
    /// Windows unwind information (frame data).
    pub win_stack_framedata_info: RangeMap<u64, WindowsFrameInfo>,
    /// Windows unwind information (FPO data).
    pub win_stack_fpo_info: RangeMap<u64, WindowsFrameInfo>,
    /// Windows unwind information of types we store but don't evaluate.
    pub win_stack_unknown_info: RangeMap<u64, WindowsFrameInfo>,
    /// How many lines were dropped while parsing.
    pub parse_errors: u64,
}

impl SymbolFile {
    /// Whether any lines were dropped while parsing this file.
    ///
    /// A corrupt file is still usable for every record that did parse.
    pub fn is_corrupt(&self) -> bool {
        self.parse_errors > 0
    }
}

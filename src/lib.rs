// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Post-mortem symbolization and stack-frame recovery from text-format
//! symbol files.
//!
//! A [`SourceLineResolver`] owns one parsed [`SymbolFile`] per loaded code
//! module and answers, for a module and an instruction address:
//!
//! * which function (and chain of inlined calls) contains the instruction,
//! * which source file and line it maps to, and
//! * how to recover the caller's registers to keep unwinding, via either a
//!   Windows-style frame-data program or a CFI rule set (see the [`walker`]
//!   module for the expression language).
//!
//! Loading is the only operation that does I/O; after a module is loaded its
//! index is immutable and any number of threads may query it.
//!
//! # Examples
//!
//! ```
//! use crash_symbols::{SimpleModule, SourceLineResolver, StackFrame};
//!
//! let resolver = SourceLineResolver::new();
//! let module = SimpleModule::with_code_file("a.out");
//! let loaded = resolver.load_module_from_bytes(
//!     &module,
//!     b"MODULE Linux x86_64 ffff0000 a.out
//! FILE 1 a.c
//! FUNC 1000 30 0 main
//! 1000 30 7 1
//! ",
//! );
//! assert!(loaded);
//!
//! let mut frame = StackFrame::with_instruction(0x1010);
//! resolver.fill_source_line_info(&module, &mut frame, None);
//! assert_eq!(frame.function_name.as_deref(), Some("main"));
//! assert_eq!(frame.source_file_name.as_deref(), Some("a.c"));
//! assert_eq!(frame.source_line, Some(7));
//! ```

use debugid::{CodeId, DebugId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::trace;

pub use crate::sym_file::walker;
pub use crate::sym_file::{
    CfiFrameInfo, CfiRules, Function, Inline, InlineOrigin, LineErrorKind, ModuleInfo,
    PostfixEvaluator, PublicSymbol, RegisterMap, SourceLine, StackInfoCfi, SymbolFile,
    WinFrameType, WinStackThing, WindowsFrameInfo, Word,
};

mod sym_file;

/// An executable or shared library loaded in a process.
pub trait Module {
    /// The base address of this code module as it was loaded by the process.
    fn base_address(&self) -> u64;
    /// The size of the code module.
    fn size(&self) -> u64;
    /// The path or file name that the code module was loaded from.
    fn code_file(&self) -> Cow<str>;
    /// An identifying string used to discriminate between multiple versions
    /// and builds of the same code module.
    fn code_identifier(&self) -> Option<CodeId>;
    /// The filename containing debugging information associated with the
    /// code module, if debugging information is stored in a separate file.
    fn debug_file(&self) -> Option<Cow<str>>;
    /// An identifying string similar to `code_identifier`, but identifies a
    /// specific version and build of the associated debug file.
    fn debug_identifier(&self) -> Option<DebugId>;
    /// A human-readable representation of the code module's version.
    fn version(&self) -> Option<Cow<str>>;
    /// Whether the module was unloaded from the process before the dump.
    fn is_unloaded(&self) -> bool {
        false
    }
}

/// A `Module` implementation that holds arbitrary data.
///
/// Useful when symbolizing addresses for a module known only by name and
/// debug id, without a real module list at hand.
#[derive(Clone, Debug, Default)]
pub struct SimpleModule {
    pub base_address: Option<u64>,
    pub size: Option<u64>,
    pub code_file: Option<String>,
    pub code_identifier: Option<CodeId>,
    pub debug_file: Option<String>,
    pub debug_id: Option<DebugId>,
    pub version: Option<String>,
}

impl SimpleModule {
    /// Create a `SimpleModule` with the given `debug_file` and `debug_id`.
    ///
    /// Uses `default` for the remaining fields.
    pub fn new(debug_file: &str, debug_id: DebugId) -> SimpleModule {
        SimpleModule {
            debug_file: Some(String::from(debug_file)),
            debug_id: Some(debug_id),
            ..SimpleModule::default()
        }
    }

    /// Create a `SimpleModule` identified only by its `code_file`.
    pub fn with_code_file(code_file: &str) -> SimpleModule {
        SimpleModule {
            code_file: Some(String::from(code_file)),
            ..SimpleModule::default()
        }
    }
}

impl Module for SimpleModule {
    fn base_address(&self) -> u64 {
        self.base_address.unwrap_or(0)
    }
    fn size(&self) -> u64 {
        self.size.unwrap_or(0)
    }
    fn code_file(&self) -> Cow<str> {
        self.code_file
            .as_ref()
            .map_or(Cow::from(""), |s| Cow::Borrowed(&s[..]))
    }
    fn code_identifier(&self) -> Option<CodeId> {
        self.code_identifier.clone()
    }
    fn debug_file(&self) -> Option<Cow<str>> {
        self.debug_file.as_ref().map(|s| Cow::Borrowed(&s[..]))
    }
    fn debug_identifier(&self) -> Option<DebugId> {
        self.debug_id
    }
    fn version(&self) -> Option<Cow<str>> {
        self.version.as_ref().map(|s| Cow::Borrowed(&s[..]))
    }
}

/// A region of memory from the crashed process, read by the evaluators.
///
/// Implementations must support concurrent reads; the evaluators never
/// write.
pub trait MemoryRegion {
    /// The starting address of the region.
    fn base_address(&self) -> u64;
    /// The size of the region in bytes.
    fn size(&self) -> u64;
    /// Read the unsigned value of `bits` ∈ {8, 16, 32, 64} at `address`,
    /// or `None` if the address can't be read.
    fn read(&self, address: u64, bits: u32) -> Option<u64>;
}

/// Amount of confidence to place in how a stack frame was reconstructed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameTrust {
    /// Unknown.
    #[default]
    None,
    /// Scanned the stack, found this.
    Scan,
    /// Found while scanning the stack using call frame info.
    CfiScan,
    /// Derived from the frame pointer.
    FramePointer,
    /// Derived from call frame info.
    CallFrameInfo,
    /// Explicitly provided by some external stack walker.
    PreWalked,
    /// Given as an instruction pointer in a context.
    Context,
    /// Produced by expanding an inlined call, not by walking the stack.
    Inline,
}

/// A stack frame, filled in by the resolver.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackFrame {
    /// The program counter location as an absolute virtual address.
    pub instruction: u64,
    /// The name of the function containing the instruction, if known.
    pub function_name: Option<String>,
    /// The start address of that function.
    pub function_base: Option<u64>,
    /// The size, in bytes, of the arguments pushed on the stack for this
    /// function.
    pub parameter_size: Option<u32>,
    /// The source file name containing the instruction, if known.
    pub source_file_name: Option<String>,
    /// The (1-based) source line number.
    pub source_line: Option<u32>,
    /// The start address of that source line.
    pub source_line_base: Option<u64>,
    /// Whether several symbols resolve to this frame's function address.
    pub is_multiple: bool,
    /// How this frame was produced.
    pub trust: FrameTrust,
}

impl StackFrame {
    /// A frame with instruction pointer `instruction` and nothing resolved
    /// yet.
    pub fn with_instruction(instruction: u64) -> StackFrame {
        StackFrame {
            instruction,
            ..StackFrame::default()
        }
    }
}

/// Reasons loading a module's symbols can fail.
///
/// Note that unparseable content is not one of them: a file that reads
/// successfully always loads, and drops whatever lines don't parse.
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    /// The symbol file couldn't be read.
    #[error("couldn't read symbol file")]
    LoadError(#[from] std::io::Error),
    /// Symbols for this module are already loaded.
    #[error("module is already loaded")]
    AlreadyLoaded,
}

/// A key that identifies a module: code file plus debug identifier.
///
/// Lookups deliberately don't depend on the caller keeping one canonical
/// `Module` value alive per module.
type ModuleKey = (String, Option<String>);

fn module_key(module: &dyn Module) -> ModuleKey {
    (
        module.code_file().to_string(),
        module.debug_identifier().map(|id| id.to_string()),
    )
}

/// Resolves stack frames to functions, source lines and unwind data, using
/// one symbol file per loaded module.
///
/// Loads and unloads are expected to be serialized by the caller; lookups
/// may run concurrently from any number of threads. Readers snapshot the
/// module's index under a short lock, so a load never blocks a lookup for
/// longer than a map access.
#[derive(Default)]
pub struct SourceLineResolver {
    modules: RwLock<HashMap<ModuleKey, Arc<SymbolFile>>>,
}

impl SourceLineResolver {
    /// Create a resolver with no modules loaded.
    pub fn new() -> SourceLineResolver {
        SourceLineResolver::default()
    }

    /// Load symbols for `module` from the file at `path`.
    ///
    /// Returns `false` only if the file couldn't be read or a module with
    /// this identity is already loaded; a file with unparseable content
    /// still loads, and [`is_module_corrupt`](Self::is_module_corrupt)
    /// reports the damage.
    pub fn load_module(&self, module: &dyn Module, path: &Path) -> bool {
        self.try_load_module(module, path).is_ok()
    }

    /// Like [`load_module`](Self::load_module), but says why it failed.
    pub fn try_load_module(&self, module: &dyn Module, path: &Path) -> Result<(), SymbolError> {
        let key = module_key(module);
        if self.modules.read().unwrap().contains_key(&key) {
            return Err(SymbolError::AlreadyLoaded);
        }
        let symbols = SymbolFile::from_file(path)?;
        trace!(
            module = %module.code_file(),
            corrupt = symbols.is_corrupt(),
            "loaded symbol file"
        );
        self.modules.write().unwrap().insert(key, Arc::new(symbols));
        Ok(())
    }

    /// Load symbols for `module` from an in-memory symbol file.
    pub fn load_module_from_bytes(&self, module: &dyn Module, bytes: &[u8]) -> bool {
        let key = module_key(module);
        if self.modules.read().unwrap().contains_key(&key) {
            return false;
        }
        let symbols = SymbolFile::from_bytes(bytes);
        self.modules.write().unwrap().insert(key, Arc::new(symbols));
        true
    }

    /// Whether symbols for `module` are loaded.
    pub fn has_module(&self, module: &dyn Module) -> bool {
        self.modules
            .read()
            .unwrap()
            .contains_key(&module_key(module))
    }

    /// Whether the loaded symbols for `module` had lines dropped while
    /// parsing. `false` if the module isn't loaded.
    pub fn is_module_corrupt(&self, module: &dyn Module) -> bool {
        self.symbols_for(module)
            .map_or(false, |symbols| symbols.is_corrupt())
    }

    /// Drop the symbols loaded for `module`. Loading it again afterwards is
    /// allowed.
    pub fn unload_module(&self, module: &dyn Module) {
        self.modules.write().unwrap().remove(&module_key(module));
    }

    /// Fill in source information for `frame` from `module`'s symbols.
    ///
    /// With `inline_frames`, also expands the chain of inlined calls at the
    /// instruction; see [`SymbolFile::fill_symbol`].
    pub fn fill_source_line_info(
        &self,
        module: &dyn Module,
        frame: &mut StackFrame,
        inline_frames: Option<&mut Vec<StackFrame>>,
    ) {
        if let Some(symbols) = self.symbols_for(module) {
            symbols.fill_symbol(module, frame, inline_frames);
        }
    }

    /// The Windows unwind data covering the frame's instruction, if any.
    pub fn find_windows_frame_info(
        &self,
        module: &dyn Module,
        frame: &StackFrame,
    ) -> Option<WindowsFrameInfo> {
        self.symbols_for(module)?
            .find_windows_frame_info(module, frame)
    }

    /// The effective CFI rules covering the frame's instruction, if any.
    ///
    /// The returned rule set always binds `.cfa` and `.ra`; evaluate it
    /// with [`CfiFrameInfo::find_caller_registers`].
    pub fn find_cfi_frame_info(
        &self,
        module: &dyn Module,
        frame: &StackFrame,
    ) -> Option<CfiFrameInfo> {
        self.symbols_for(module)?.find_cfi_frame_info(module, frame)
    }

    fn symbols_for(&self, module: &dyn Module) -> Option<Arc<SymbolFile>> {
        self.modules
            .read()
            .unwrap()
            .get(&module_key(module))
            .cloned()
    }
}

// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::path::Path;

use crate::{FrameTrust, Module, StackFrame};

pub use crate::sym_file::parser::LineErrorKind;
pub use crate::sym_file::types::*;
pub use crate::sym_file::walker::{CfiFrameInfo, PostfixEvaluator, RegisterMap, Word};

mod parser;
mod types;
pub mod walker;

impl SymbolFile {
    /// Parse an in-memory `SymbolFile` from `bytes`.
    ///
    /// Parsing cannot fail: unparseable lines are dropped and counted in
    /// `parse_errors`.
    pub fn from_bytes(bytes: &[u8]) -> SymbolFile {
        parser::parse_symbol_bytes(bytes)
    }

    /// Parse a `SymbolFile` from the file at `path`.
    #[tracing::instrument(level = "trace", skip_all, fields(path = %path.display()))]
    pub fn from_file(path: &Path) -> Result<SymbolFile, std::io::Error> {
        let bytes = std::fs::read(path)?;
        Ok(SymbolFile::from_bytes(&bytes))
    }

    /// Fill in as much source information for `frame` as possible.
    ///
    /// When `inline_frames` is given and the instruction sits inside
    /// inlined code, one frame per inlined call is appended innermost
    /// first, and `frame` itself describes where control entered the
    /// inlining.
    pub fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut StackFrame,
        inline_frames: Option<&mut Vec<StackFrame>>,
    ) {
        let base = module.base_address();
        let Some(addr) = frame.instruction.checked_sub(base) else {
            return;
        };
        if let Some(func) = self.functions.get(addr) {
            // FUNC records have a parameter size, but the STACK WIN records
            // are more reliable when available, and those sizes feed the
            // unwinding of subsequent frames.
            let parameter_size = if let Some(info) = self.win_stack_framedata_info.get(addr) {
                info.parameter_size
            } else if let Some(info) = self.win_stack_fpo_info.get(addr) {
                info.parameter_size
            } else {
                func.parameter_size
            };

            frame.function_name = Some(func.name.clone());
            frame.function_base = Some(base.wrapping_add(func.address));
            frame.parameter_size = Some(parameter_size);
            frame.is_multiple = func.multiple;

            let line = func.lines.get(addr);
            if let Some(line) = line {
                frame.source_file_name = self.files.get(&line.file).cloned();
                frame.source_line = Some(line.line);
                frame.source_line_base = Some(base.wrapping_add(line.address));
            }

            if let Some(out) = inline_frames {
                self.fill_inline_frames(frame, func, addr, base, line, out);
            }
        } else if let Some(public) = self.find_nearest_public(addr) {
            // PUBLIC records don't have end-points, so the nearest one below
            // could be a symbol from far earlier in the module. A public
            // cannot reasonably extend past the next FUNC though, so reject
            // it if the nearest FUNC at or below the address starts at or
            // above the public.
            //
            // Rust's binary search reports a miss as the insertion index
            // that would keep the slice sorted, so the entry before that
            // index is the nearest previous range.
            let funcs_slice = self.functions.ranges_values().as_slice();
            let prev_func = funcs_slice
                .binary_search_by_key(&addr, |(range, _)| range.start)
                .err()
                .and_then(|idx| idx.checked_sub(1))
                .and_then(|idx| funcs_slice.get(idx));
            if let Some(prev_func) = prev_func {
                if public.address <= prev_func.1.address {
                    return;
                }
            }

            frame.function_name = Some(public.name.clone());
            frame.function_base = Some(base.wrapping_add(public.address));
            frame.parameter_size = Some(public.parameter_size);
            frame.is_multiple = public.multiple;
        }
    }

    fn fill_inline_frames(
        &self,
        frame: &mut StackFrame,
        func: &Function,
        addr: u64,
        base: u64,
        line: Option<&SourceLine>,
        out: &mut Vec<StackFrame>,
    ) {
        let chain = func.inlines_at(addr);
        if chain.is_empty() {
            return;
        }
        // Every frame anchors on the physical line record.
        let source_line_base = line.map(|l| base.wrapping_add(l.address));

        // Emit innermost first. Each frame shows the call site of the record
        // one level further in; the innermost shows the physical line.
        for (depth, inline) in chain.iter().enumerate().rev() {
            let mut inline_frame = StackFrame::with_instruction(frame.instruction);
            inline_frame.trust = FrameTrust::Inline;
            inline_frame.function_name = Some(
                self.inline_origins
                    .get(&inline.origin_id)
                    .map_or("<name omitted>", |origin| origin.name.as_str())
                    .to_string(),
            );
            inline_frame.function_base = inline
                .covering_range(addr)
                .map(|start| base.wrapping_add(start));
            inline_frame.source_line_base = source_line_base;
            if let Some(callee) = chain.get(depth + 1) {
                inline_frame.source_line = Some(callee.call_site_line);
                inline_frame.source_file_name = self.call_site_file(callee).cloned();
            } else if let Some(line) = line {
                inline_frame.source_line = Some(line.line);
                inline_frame.source_file_name = self.files.get(&line.file).cloned();
            }
            out.push(inline_frame);
        }

        // The outer frame describes where control entered the inlining.
        let outermost = chain[0];
        frame.source_line = Some(outermost.call_site_line);
        frame.source_file_name = self.call_site_file(outermost).cloned();
    }

    /// The file containing an inlined call's call site. Records from the
    /// older schema fall back to the origin's declaring file.
    fn call_site_file(&self, inline: &Inline) -> Option<&String> {
        let id = inline.call_site_file.or_else(|| {
            self.inline_origins
                .get(&inline.origin_id)
                .and_then(|origin| origin.file)
        })?;
        self.files.get(&id)
    }

    /// The Windows unwind data covering the frame's instruction, if any.
    ///
    /// Frame data tends to be more precise than FPO when both cover an
    /// address; records of types we can't evaluate come last.
    pub fn find_windows_frame_info(
        &self,
        module: &dyn Module,
        frame: &StackFrame,
    ) -> Option<WindowsFrameInfo> {
        let addr = frame.instruction.checked_sub(module.base_address())?;
        self.win_stack_framedata_info
            .get(addr)
            .or_else(|| self.win_stack_fpo_info.get(addr))
            .or_else(|| self.win_stack_unknown_info.get(addr))
            .cloned()
    }

    /// The effective CFI rules covering the frame's instruction, if any.
    pub fn find_cfi_frame_info(
        &self,
        module: &dyn Module,
        frame: &StackFrame,
    ) -> Option<CfiFrameInfo> {
        let addr = frame.instruction.checked_sub(module.base_address())?;
        let info = self.cfi_stack_info.get(addr)?;
        CfiFrameInfo::from_stack_info(info, addr)
    }

    /// Find the nearest `PublicSymbol` whose address is at or below `addr`.
    pub fn find_nearest_public(&self, addr: u64) -> Option<&PublicSymbol> {
        match self.publics.binary_search_by_key(&addr, |p| p.address) {
            Ok(idx) => Some(&self.publics[idx]),
            Err(idx) => idx.checked_sub(1).map(|idx| &self.publics[idx]),
        }
    }
}

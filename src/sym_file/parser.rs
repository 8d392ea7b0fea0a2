// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_till1};
use nom::character::complete::{char, digit1, hex_digit1, space0, space1};
use nom::combinator::{eof, map, map_res, opt, peek, recognize, rest, value, verify};
use nom::error::{ErrorKind, FromExternalError, ParseError};
use nom::multi::many1;
use nom::sequence::{pair, preceded, terminated, tuple};
use nom::{Finish, IResult};
use range_map::{Range, RangeMap};
use std::collections::HashMap;
use std::num::{IntErrorKind, ParseIntError};
use tracing::warn;

use crate::sym_file::types::*;

/// Why a symbol-file line was rejected.
///
/// A rejected line is dropped and the module is flagged corrupt, but every
/// record that did parse remains usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LineErrorKind {
    /// The line doesn't start with a known record keyword.
    #[error("unknown record type")]
    UnknownRecord,
    /// A required field is absent.
    #[error("missing field")]
    MissingField,
    /// A numeric field didn't parse.
    #[error("malformed integer field")]
    BadInteger,
    /// A numeric field exceeds its type's range.
    #[error("integer field out of range")]
    Overflow,
    /// An INLINE outside any FUNC, or one that skips a nesting level.
    #[error("INLINE record without a matching parent")]
    DanglingInline,
    /// A source line record outside any FUNC.
    #[error("line record without a FUNC")]
    DanglingLine,
    /// A STACK CFI delta with no covering STACK CFI INIT.
    #[error("STACK CFI record outside the preceding INIT range")]
    DanglingCfi,
}

fn severity(kind: LineErrorKind) -> u8 {
    match kind {
        LineErrorKind::Overflow => 3,
        LineErrorKind::BadInteger => 2,
        LineErrorKind::MissingField => 1,
        _ => 0,
    }
}

/// Nom error type that remembers the most useful `LineErrorKind`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ParseFail {
    kind: LineErrorKind,
}

impl<'a> ParseError<&'a str> for ParseFail {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        // Running out of input means a field is missing; anything else is a
        // field that failed to parse.
        let kind = if input.trim().is_empty() {
            LineErrorKind::MissingField
        } else {
            LineErrorKind::BadInteger
        };
        ParseFail { kind }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    fn or(self, other: Self) -> Self {
        if severity(self.kind) >= severity(other.kind) {
            self
        } else {
            other
        }
    }
}

impl<'a> FromExternalError<&'a str, ParseIntError> for ParseFail {
    fn from_external_error(_input: &'a str, _kind: ErrorKind, e: ParseIntError) -> Self {
        let kind = match e.kind() {
            IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => LineErrorKind::Overflow,
            _ => LineErrorKind::BadInteger,
        };
        ParseFail { kind }
    }
}

type PResult<'a, T> = IResult<&'a str, T, ParseFail>;

/// A single typed record from a symbol file.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Record {
    Module(ModuleInfo),
    Info,
    File { id: i32, name: String },
    InlineOrigin { id: u32, origin: InlineOrigin },
    Function(FunctionRecord),
    Line(SourceLine),
    Inline(InlineRecord),
    Public(PublicSymbol),
    StackWin(WindowsFrameInfo),
    StackCfiInit { rules: CfiRules, size: u64 },
    StackCfi(CfiRules),
}

/// A FUNC record, before any lines or inlines attach to it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct FunctionRecord {
    pub address: u64,
    pub size: u64,
    pub parameter_size: u32,
    pub name: String,
    pub multiple: bool,
}

/// An INLINE record, before re-parenting into its function's tree.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct InlineRecord {
    pub nest_level: u32,
    pub call_site_line: u32,
    pub call_site_file: Option<i32>,
    pub origin_id: u32,
    pub ranges: Vec<(u64, u64)>,
}

/// Match a hex field, parse it to a u64.
fn hex_u64(input: &str) -> PResult<u64> {
    map_res(hex_digit1, |s: &str| u64::from_str_radix(s, 16))(input)
}

/// Match a hex field, parse it to a u32.
fn hex_u32(input: &str) -> PResult<u32> {
    map_res(hex_digit1, |s: &str| u32::from_str_radix(s, 16))(input)
}

/// Match a hex stack-parameter-size field. Must fit a non-negative i32.
fn hex_param(input: &str) -> PResult<u32> {
    map(
        map_res(hex_digit1, |s: &str| i32::from_str_radix(s, 16)),
        |v| v as u32,
    )(input)
}

/// Match a decimal id field (file ids, origin ids, line numbers, levels).
/// Must fit a non-negative i32.
fn dec_id(input: &str) -> PResult<i32> {
    map_res(digit1, |s: &str| s.parse::<i32>())(input)
}

/// Match a decimal integer that may be negative.
fn dec_i32(input: &str) -> PResult<i32> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| {
        s.parse::<i32>()
    })(input)
}

/// Match a single whitespace-delimited token.
fn token(input: &str) -> PResult<&str> {
    take_till1(|c: char| c.is_ascii_whitespace())(input)
}

/// Match a non-empty name running to the end of the line.
fn name_rest(input: &str) -> PResult<&str> {
    verify(map(rest, |s: &str| s.trim()), |s: &str| !s.is_empty())(input)
}

/// Match the end of a fixed-grammar record: end of line, or a trailing
/// `//` comment.
fn comment_tail(input: &str) -> PResult<()> {
    alt((
        value((), pair(space0, eof)),
        value((), tuple((space1, tag("//"), rest))),
    ))(input)
}

/// Match the optional standalone `m` ("multiple") marker.
fn multiple_marker(input: &str) -> PResult<bool> {
    map(
        opt(preceded(space1, terminated(char('m'), peek(space1)))),
        |m| m.is_some(),
    )(input)
}

/// Matches a MODULE record.
fn module_line(input: &str) -> PResult<ModuleInfo> {
    map(
        tuple((
            tag("MODULE"),
            preceded(space1, token),
            preceded(space1, token),
            preceded(space1, token),
            preceded(space1, name_rest),
        )),
        |(_, os, cpu, debug_id, debug_file)| ModuleInfo {
            os: os.to_string(),
            cpu: cpu.to_string(),
            debug_id: debug_id.to_string(),
            debug_file: debug_file.to_string(),
        },
    )(input)
}

/// Matches a FILE record.
fn file_line(input: &str) -> PResult<(i32, String)> {
    map(
        tuple((tag("FILE"), preceded(space1, dec_id), preceded(space1, name_rest))),
        |(_, id, name)| (id, name.to_string()),
    )(input)
}

/// Matches an INLINE_ORIGIN record of either schema.
///
/// The older schema carries a file id between the origin id and the name;
/// whether it's present can only be decided by looking at the tokens.
fn inline_origin_line(input: &str) -> PResult<(u32, InlineOrigin)> {
    preceded(
        pair(tag("INLINE_ORIGIN"), space1),
        alt((
            map(
                tuple((dec_id, preceded(space1, dec_i32), preceded(space1, name_rest))),
                |(id, file, name)| {
                    (
                        id as u32,
                        InlineOrigin {
                            name: name.to_string(),
                            file: Some(file),
                        },
                    )
                },
            ),
            map(
                pair(
                    dec_id,
                    preceded(
                        space1,
                        verify(name_rest, |s: &str| s.parse::<i64>().is_err()),
                    ),
                ),
                |(id, name)| {
                    (
                        id as u32,
                        InlineOrigin {
                            name: name.to_string(),
                            file: None,
                        },
                    )
                },
            ),
        )),
    )(input)
}

/// Matches a FUNC record.
fn func_line(input: &str) -> PResult<FunctionRecord> {
    map(
        tuple((
            tag("FUNC"),
            multiple_marker,
            preceded(space1, hex_u64),
            preceded(space1, hex_u64),
            preceded(space1, hex_param),
            preceded(space1, name_rest),
        )),
        |(_, multiple, address, size, parameter_size, name)| FunctionRecord {
            address,
            size,
            parameter_size,
            name: name.to_string(),
            multiple,
        },
    )(input)
}

/// Matches line data following a FUNC record.
fn line_data(input: &str) -> PResult<SourceLine> {
    map(
        tuple((
            hex_u64,
            preceded(space1, hex_u64),
            preceded(space1, dec_id),
            preceded(space1, dec_id),
            comment_tail,
        )),
        |(address, size, line, file, _)| SourceLine {
            address,
            size,
            file,
            line: line as u32,
        },
    )(input)
}

/// Matches the `(address size)+` tail of an INLINE record.
fn inline_ranges(input: &str) -> PResult<Vec<(u64, u64)>> {
    many1(pair(preceded(space1, hex_u64), preceded(space1, hex_u64)))(input)
}

/// Matches an INLINE record of either schema.
///
/// The extended schema has four leading decimal fields before the range
/// pairs, the legacy schema three; since ranges always come in pairs the
/// token count settles which one this is.
fn inline_line(input: &str) -> PResult<InlineRecord> {
    preceded(
        pair(tag("INLINE"), space1),
        alt((
            map(
                tuple((
                    dec_id,
                    preceded(space1, dec_id),
                    preceded(space1, dec_id),
                    preceded(space1, dec_id),
                    inline_ranges,
                    comment_tail,
                )),
                |(nest_level, call_site_line, call_site_file, origin_id, ranges, _)| {
                    InlineRecord {
                        nest_level: nest_level as u32,
                        call_site_line: call_site_line as u32,
                        call_site_file: Some(call_site_file),
                        origin_id: origin_id as u32,
                        ranges,
                    }
                },
            ),
            map(
                tuple((
                    dec_id,
                    preceded(space1, dec_id),
                    preceded(space1, dec_id),
                    inline_ranges,
                    comment_tail,
                )),
                |(nest_level, call_site_line, origin_id, ranges, _)| InlineRecord {
                    nest_level: nest_level as u32,
                    call_site_line: call_site_line as u32,
                    call_site_file: None,
                    origin_id: origin_id as u32,
                    ranges,
                },
            ),
        )),
    )(input)
}

/// Matches a PUBLIC record.
fn public_line(input: &str) -> PResult<PublicSymbol> {
    map(
        tuple((
            tag("PUBLIC"),
            multiple_marker,
            preceded(space1, hex_u64),
            preceded(space1, hex_param),
            preceded(space1, name_rest),
        )),
        |(_, multiple, address, parameter_size, name)| PublicSymbol {
            address,
            parameter_size,
            name: name.to_string(),
            multiple,
        },
    )(input)
}

/// Matches a STACK WIN record.
fn stack_win_line(input: &str) -> PResult<WindowsFrameInfo> {
    map(
        tuple((
            tag("STACK WIN"),
            preceded(space1, hex_u32),
            preceded(space1, hex_u64),
            preceded(space1, hex_u64),
            preceded(space1, hex_u32),
            preceded(space1, hex_u32),
            preceded(space1, hex_u32),
            preceded(space1, hex_u32),
            preceded(space1, hex_u32),
            preceded(space1, hex_u32),
            preceded(
                space1,
                alt((value(true, char('1')), value(false, char('0')))),
            ),
            preceded(space1, name_rest),
        )),
        |(
            _,
            ty,
            address,
            size,
            prologue_size,
            epilogue_size,
            parameter_size,
            saved_register_size,
            local_size,
            max_stack_size,
            has_program_string,
            last,
        )| {
            let frame_type = match ty {
                4 => WinFrameType::FrameData,
                0 => WinFrameType::Fpo,
                _ => WinFrameType::Unknown,
            };
            let program_string_or_base_pointer = if has_program_string {
                WinStackThing::ProgramString(last.to_string())
            } else {
                WinStackThing::AllocatesBasePointer(last == "1")
            };
            WindowsFrameInfo {
                frame_type,
                address,
                size,
                prologue_size,
                epilogue_size,
                parameter_size,
                saved_register_size,
                local_size,
                max_stack_size,
                program_string_or_base_pointer,
            }
        },
    )(input)
}

/// Matches a STACK CFI INIT record.
fn stack_cfi_init_line(input: &str) -> PResult<(CfiRules, u64)> {
    map(
        tuple((
            tag("STACK CFI INIT"),
            preceded(space1, hex_u64),
            preceded(space1, hex_u64),
            preceded(space1, name_rest),
        )),
        |(_, address, size, rules)| {
            (
                CfiRules {
                    address,
                    rules: rules.to_string(),
                },
                size,
            )
        },
    )(input)
}

/// Matches a STACK CFI record.
fn stack_cfi_line(input: &str) -> PResult<CfiRules> {
    map(
        tuple((
            tag("STACK CFI"),
            preceded(space1, hex_u64),
            preceded(space1, name_rest),
        )),
        |(_, address, rules)| CfiRules {
            address,
            rules: rules.to_string(),
        },
    )(input)
}

fn run<'a, T>(
    mut parser: impl FnMut(&'a str) -> PResult<'a, T>,
    line: &'a str,
) -> Result<T, LineErrorKind> {
    match parser(line).finish() {
        Ok((_, value)) => Ok(value),
        Err(e) => Err(e.kind),
    }
}

/// Parse one non-blank symbol-file line into a typed record.
pub(crate) fn parse_record(line: &str) -> Result<Record, LineErrorKind> {
    let mut tokens = line.split_ascii_whitespace();
    let first = tokens.next().unwrap_or("");
    match first {
        "MODULE" => run(module_line, line).map(Record::Module),
        "INFO" => Ok(Record::Info),
        "FILE" => run(file_line, line).map(|(id, name)| Record::File { id, name }),
        "INLINE_ORIGIN" => {
            let (id, origin) = run(inline_origin_line, line)?;
            // -1 marks an artificial origin; anything more negative is junk.
            if origin.file.map_or(false, |f| f < -1) {
                return Err(LineErrorKind::BadInteger);
            }
            Ok(Record::InlineOrigin { id, origin })
        }
        "FUNC" => run(func_line, line).map(Record::Function),
        "INLINE" => run(inline_line, line).map(Record::Inline),
        "PUBLIC" => run(public_line, line).map(Record::Public),
        "STACK" => match tokens.next() {
            Some("WIN") => run(stack_win_line, line).map(Record::StackWin),
            Some("CFI") => {
                if tokens.next() == Some("INIT") {
                    run(stack_cfi_init_line, line)
                        .map(|(rules, size)| Record::StackCfiInit { rules, size })
                } else {
                    run(stack_cfi_line, line).map(Record::StackCfi)
                }
            }
            _ => Err(LineErrorKind::UnknownRecord),
        },
        t if t.starts_with(|c: char| c.is_ascii_hexdigit()) => {
            run(line_data, line).map(Record::Line)
        }
        _ => Err(LineErrorKind::UnknownRecord),
    }
}

/// A FUNC record together with the lines and inlines collected so far.
struct PendingFunction {
    record: FunctionRecord,
    lines: Vec<SourceLine>,
    inlines: Vec<Inline>,
    inline_roots: Vec<usize>,
}

/// Accumulates records into a `SymbolFile`, one line at a time.
#[derive(Default)]
pub(crate) struct SymbolBuilder {
    module_info: Option<ModuleInfo>,
    files: HashMap<i32, String>,
    inline_origins: HashMap<u32, InlineOrigin>,
    publics: Vec<PublicSymbol>,
    functions: Vec<PendingFunction>,
    cur_function: Option<PendingFunction>,
    /// Arena index of the open inline at each nest level, innermost last.
    inline_stack: Vec<usize>,
    cfi_stack_info: Vec<StackInfoCfi>,
    cur_cfi: Option<StackInfoCfi>,
    win_framedata: Vec<WindowsFrameInfo>,
    win_fpo: Vec<WindowsFrameInfo>,
    win_unknown: Vec<WindowsFrameInfo>,
    errors: u64,
}

impl SymbolBuilder {
    pub fn new() -> SymbolBuilder {
        SymbolBuilder::default()
    }

    pub fn note_error(&mut self) {
        self.errors += 1;
    }

    pub fn add_record(&mut self, record: Record) -> Result<(), LineErrorKind> {
        match record {
            Record::Module(info) => {
                if self.module_info.is_none() {
                    self.module_info = Some(info);
                }
            }
            Record::Info => {}
            Record::File { id, name } => {
                if self.files.insert(id, name).is_some() {
                    warn!(file_id = id, "duplicate FILE record replaces earlier entry");
                }
            }
            Record::InlineOrigin { id, origin } => {
                if self.inline_origins.insert(id, origin).is_some() {
                    warn!(
                        origin_id = id,
                        "duplicate INLINE_ORIGIN record replaces earlier entry"
                    );
                }
            }
            Record::Function(record) => {
                self.finish_function();
                self.cur_function = Some(PendingFunction {
                    record,
                    lines: Vec::new(),
                    inlines: Vec::new(),
                    inline_roots: Vec::new(),
                });
            }
            Record::Line(line) => {
                let func = self
                    .cur_function
                    .as_mut()
                    .ok_or(LineErrorKind::DanglingLine)?;
                func.lines.push(line);
            }
            Record::Inline(record) => {
                let func = self
                    .cur_function
                    .as_mut()
                    .ok_or(LineErrorKind::DanglingInline)?;
                let level = record.nest_level as usize;
                if level > self.inline_stack.len() {
                    return Err(LineErrorKind::DanglingInline);
                }
                self.inline_stack.truncate(level);
                let idx = func.inlines.len();
                func.inlines.push(Inline {
                    call_site_line: record.call_site_line,
                    call_site_file: record.call_site_file,
                    origin_id: record.origin_id,
                    ranges: record.ranges,
                    children: Vec::new(),
                });
                if level == 0 {
                    func.inline_roots.push(idx);
                } else {
                    let parent = self.inline_stack[level - 1];
                    func.inlines[parent].children.push(idx);
                }
                self.inline_stack.push(idx);
            }
            Record::Public(public) => {
                self.finish_function();
                self.publics.push(public);
            }
            Record::StackWin(info) => {
                let stack = match info.frame_type {
                    WinFrameType::FrameData => &mut self.win_framedata,
                    WinFrameType::Fpo => &mut self.win_fpo,
                    WinFrameType::Unknown => &mut self.win_unknown,
                };
                push_win_info(stack, info);
            }
            Record::StackCfiInit { rules, size } => {
                self.finish_cfi();
                self.cur_cfi = Some(StackInfoCfi {
                    init: rules,
                    size,
                    add_rules: Vec::new(),
                });
            }
            Record::StackCfi(rules) => {
                let cfi = self.cur_cfi.as_mut().ok_or(LineErrorKind::DanglingCfi)?;
                if rules.address < cfi.init.address
                    || rules.address >= cfi.init.address.saturating_add(cfi.size)
                {
                    return Err(LineErrorKind::DanglingCfi);
                }
                cfi.add_rules.push(rules);
            }
        }
        Ok(())
    }

    fn finish_function(&mut self) {
        self.inline_stack.clear();
        if let Some(pending) = self.cur_function.take() {
            self.functions.push(pending);
        }
    }

    fn finish_cfi(&mut self) {
        if let Some(mut cfi) = self.cur_cfi.take() {
            cfi.add_rules.sort();
            self.cfi_stack_info.push(cfi);
        }
    }

    pub fn finish(mut self) -> SymbolFile {
        self.finish_function();
        self.finish_cfi();
        self.publics.sort();
        let functions = self
            .functions
            .into_iter()
            .map(|pending| {
                let lines = into_rangemap_safe(
                    pending
                        .lines
                        .into_iter()
                        .filter(|l| l.size > 0)
                        .filter_map(|l| {
                            let end = l.address.checked_add(l.size - 1)?;
                            Some((Range::new(l.address, end), l))
                        })
                        .collect(),
                );
                Function {
                    address: pending.record.address,
                    size: pending.record.size,
                    parameter_size: pending.record.parameter_size,
                    name: pending.record.name,
                    multiple: pending.record.multiple,
                    lines,
                    inlines: pending.inlines,
                    inline_roots: pending.inline_roots,
                }
            })
            .collect::<Vec<_>>();
        SymbolFile {
            module_info: self.module_info,
            files: self.files,
            inline_origins: self.inline_origins,
            publics: self.publics,
            functions: into_rangemap_safe(
                functions
                    .into_iter()
                    .filter_map(|f| Some((f.memory_range()?, f)))
                    .collect(),
            ),
            cfi_stack_info: into_rangemap_safe(
                self.cfi_stack_info
                    .into_iter()
                    .filter_map(|c| Some((c.memory_range()?, c)))
                    .collect(),
            ),
            win_stack_framedata_info: win_rangemap(self.win_framedata),
            win_stack_fpo_info: win_rangemap(self.win_fpo),
            win_stack_unknown_info: win_rangemap(self.win_unknown),
            parse_errors: self.errors,
        }
    }
}

/// Append a STACK WIN entry; within a strict overlap the last record wins.
fn push_win_info(stack: &mut Vec<WindowsFrameInfo>, info: WindowsFrameInfo) {
    while let Some(last) = stack.last() {
        let overlaps = last.address < info.address.saturating_add(info.size)
            && info.address < last.address.saturating_add(last.size);
        if overlaps {
            stack.pop();
        } else {
            break;
        }
    }
    stack.push(info);
}

fn win_rangemap(entries: Vec<WindowsFrameInfo>) -> RangeMap<u64, WindowsFrameInfo> {
    into_rangemap_safe(
        entries
            .into_iter()
            .filter_map(|w| Some((w.memory_range()?, w)))
            .collect(),
    )
}

/// Build a `RangeMap`, dropping any entry that overlaps an earlier one.
/// Ties on the start address keep the first entry seen.
fn into_rangemap_safe<V: Clone + Eq + std::fmt::Debug>(mut entries: Vec<(Range<u64>, V)>) -> RangeMap<u64, V> {
    entries.sort_by(|a, b| a.0.start.cmp(&b.0.start));
    let mut out: Vec<(Range<u64>, V)> = Vec::with_capacity(entries.len());
    for (range, value) in entries {
        if let Some(&(last, _)) = out.last() {
            if range.start <= last.end {
                warn!(
                    start = range.start,
                    end = range.end,
                    "dropping entry overlapping an earlier range"
                );
                continue;
            }
        }
        out.push((range, value));
    }
    out.into_iter().collect()
}

/// Parse an entire symbol file. Unparseable lines are dropped and counted;
/// the content itself can never fail the parse.
pub(crate) fn parse_symbol_bytes(bytes: &[u8]) -> SymbolFile {
    let text = String::from_utf8_lossy(bytes);
    let mut builder = SymbolBuilder::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(kind) = parse_record(line).and_then(|record| builder.add_record(record)) {
            warn!(line = number + 1, error = %kind, "dropping unparseable symbol line");
            builder.note_error();
        }
    }
    builder.finish()
}
